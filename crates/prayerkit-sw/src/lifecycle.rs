//! Worker lifecycle states and the transition table.
//!
//! The host is the only writer of a worker's state. Every change goes through
//! [`ServiceWorkerState::transition`], so an out-of-order event is an error
//! instead of a silently corrupted registration.

use serde::{Deserialize, Serialize};

use crate::ServiceWorkerError;

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Script parsed, install not started.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and able to control pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

/// Inputs that drive a worker through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleTransition {
    StartInstall,
    InstallSucceeded,
    InstallFailed,
    StartActivation,
    ActivationFinished,
    /// Replaced by a newer worker or unregistered.
    Discard,
}

impl ServiceWorkerState {
    /// Apply a transition, rejecting anything the table does not allow.
    pub fn transition(self, input: LifecycleTransition) -> Result<Self, ServiceWorkerError> {
        use LifecycleTransition as T;
        use ServiceWorkerState as S;

        match (self, input) {
            (S::Parsed, T::StartInstall) => Ok(S::Installing),
            (S::Installing, T::InstallSucceeded) => Ok(S::Installed),
            (S::Installing, T::InstallFailed) => Ok(S::Redundant),
            (S::Installed, T::StartActivation) => Ok(S::Activating),
            (S::Activating, T::ActivationFinished) => Ok(S::Activated),
            (S::Redundant, T::Discard) => Err(ServiceWorkerError::StateError(
                "worker is already redundant".to_string(),
            )),
            (_, T::Discard) => Ok(S::Redundant),
            (state, input) => Err(ServiceWorkerError::StateError(format!(
                "cannot apply {input:?} to a worker in state {}",
                state.as_str()
            ))),
        }
    }

    /// Lowercase name, as exposed to pages.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        }
    }

    pub fn is_active(&self) -> bool {
        *self == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        *self == ServiceWorkerState::Redundant
    }
}
