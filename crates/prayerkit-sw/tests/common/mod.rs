//! Scripted network shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use prayerkit_net::{Fetcher, NetError, Request, Response};
use prayerkit_sw::{AssetManifest, CacheName, WorkerScript};
use url::Url;

pub const ORIGIN: &str = "https://tracker.example/";

/// A network that answers from a route table and can be unplugged.
#[derive(Default)]
pub struct MockNetwork {
    routes: Mutex<HashMap<String, (u16, String)>>,
    hits: Mutex<HashMap<String, usize>>,
    offline: AtomicBool,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, url: &str, status: u16, body: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body.to_string()));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn hits(&self, url: &str) -> usize {
        self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Fetcher for MockNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let url = request.url.to_string();
        *self.hits.lock().unwrap().entry(url.clone()).or_default() += 1;

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(url));
        }

        let route = self.routes.lock().unwrap().get(&url).cloned();
        let (status, body) = route.unwrap_or((404, String::new()));
        let response = Response::from_parts(
            request.url.clone(),
            StatusCode::from_u16(status).unwrap(),
            HeaderMap::new(),
            Bytes::from(body),
        );
        Ok(response.with_type(request.response_type()))
    }
}

pub fn asset(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn script(version: &str, manifest: &[&str]) -> WorkerScript {
    WorkerScript::new(
        asset("sw.js"),
        CacheName::new("prayer-tracker-cache", version),
        AssetManifest::new(manifest.iter().copied()),
    )
}

/// A network serving the app shell with bodies tagged by `version`.
pub fn shell_network(version: &str) -> Arc<MockNetwork> {
    let net = MockNetwork::new();
    serve_shell(&net, version);
    net
}

pub fn serve_shell(net: &MockNetwork, version: &str) {
    net.route(ORIGIN, 200, &format!("shell {version}"));
    net.route(&asset("index.html").to_string(), 200, &format!("index {version}"));
}
