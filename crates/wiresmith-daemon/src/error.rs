// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;
use wiresmith_types::{EntityKind, ServerState, UrlError};

use crate::db::StoreError;
use crate::driver::DriverError;
use crate::keys::KeyError;

/// Failure of an engine operation, as surfaced to the transport layer.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{kind:?} {id} not found")]
    NotFound { kind: EntityKind, id: Uuid },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("server {server} cannot {operation} while {state}")]
    InvalidState {
        server: String,
        state: ServerState,
        operation: &'static str,
    },

    #[error("backend {backend} unavailable while handling {target}: {source}")]
    BackendUnavailable {
        backend: String,
        target: String,
        #[source]
        source: DriverError,
    },

    #[error("backend {backend} failed while handling {target}: {source}")]
    Driver {
        backend: String,
        target: String,
        #[source]
        source: DriverError,
    },

    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

impl CoreError {
    /// Wrap a driver failure, splitting transport trouble from everything else.
    pub fn from_driver(backend: &str, target: &str, err: DriverError) -> Self {
        let backend = backend.to_string();
        let target = target.to_string();
        if err.is_unavailable() {
            Self::BackendUnavailable {
                backend,
                target,
                source: err,
            }
        } else {
            Self::Driver {
                backend,
                target,
                source: err,
            }
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => Self::NotFound { kind, id },
            StoreError::Duplicate(what) => Self::Conflict(what),
            other => {
                tracing::error!(error = %other, "store error");
                Self::Store(other)
            }
        }
    }
}

impl From<UrlError> for CoreError {
    fn from(err: UrlError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Non-fatal problem attached to an otherwise successful operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Warning {
    #[error("hook `{command}` for {target} failed: {reason}")]
    HookFailed {
        target: String,
        command: String,
        reason: String,
    },

    #[error("live state of {target} not updated: {reason}")]
    LiveSyncFailed { target: String, reason: String },

    #[error("backend {backend} did not answer the probe: {reason}")]
    ProbeFailed { backend: String, reason: String },
}

impl Warning {
    pub fn live_sync(target: &str, err: &CoreError) -> Self {
        Self::LiveSyncFailed {
            target: target.to_string(),
            reason: err.to_string(),
        }
    }
}

/// A result value plus the warnings collected while producing it.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome<T> {
    pub value: T,
    pub warnings: Vec<Warning>,
}

impl<T> Outcome<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(value: T, warnings: Vec<Warning>) -> Self {
        Self { value, warnings }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            warnings: self.warnings,
        }
    }

    pub fn into_parts(self) -> (T, Vec<Warning>) {
        (self.value, self.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_classify_as_unavailable() {
        let err = CoreError::from_driver(
            "edge",
            "server wg0",
            DriverError::Timeout(std::time::Duration::from_secs(30)),
        );
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("edge"));
        assert!(err.to_string().contains("wg0"));
    }

    #[test]
    fn command_failures_are_not_unavailable() {
        let err = CoreError::from_driver(
            "edge",
            "server wg0",
            DriverError::Command {
                program: "wg".into(),
                code: Some(1),
                stderr: "Invalid argument".into(),
            },
        );
        assert!(matches!(err, CoreError::Driver { .. }));
    }

    #[test]
    fn duplicate_maps_to_conflict() {
        let err: CoreError = StoreError::Duplicate("backend name already taken".into()).into();
        assert!(matches!(err, CoreError::Conflict(_)));
    }
}
