//! Error taxonomy shared by every harness component.

use std::{path::PathBuf, time::Duration};

use alloy::primitives::Address;
use thiserror::Error;

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("unknown network `{name}`")]
    UnknownNetwork { name: String },

    #[error("invalid account source for network `{network}`: {reason}")]
    InvalidAccountSource { network: String, reason: String },

    #[error("network `{network}` has no endpoint configured")]
    MissingEndpoint { network: String },

    #[error("invalid configuration value {key}={value:?}: {reason}")]
    InvalidConfig {
        key: String,
        value: String,
        reason: String,
    },

    #[error("deployment of `{artifact}` on `{network}` not confirmed within {timeout:?}")]
    DeploymentTimeout {
        network: String,
        artifact: String,
        timeout: Duration,
    },

    #[error("deployment of `{artifact}` on `{network}` reverted: {reason}")]
    DeploymentReverted {
        network: String,
        artifact: String,
        reason: String,
    },

    #[error("`{contract}` has no method `{method}`")]
    UnknownMethod { contract: String, method: String },

    #[error("`{contract}.{method}` expects {expected} argument(s), got {got}: {reason}")]
    ArgumentMismatch {
        contract: String,
        method: String,
        expected: usize,
        got: usize,
        reason: String,
    },

    #[error("`{contract}.{method}` with {args} argument(s) reverted on `{network}`: {reason}")]
    ExecutionReverted {
        network: String,
        contract: String,
        method: String,
        args: usize,
        reason: String,
    },

    #[error("`{contract}.{method}` on `{network}` not confirmed within {timeout:?}")]
    InvocationTimeout {
        network: String,
        contract: String,
        method: String,
        timeout: Duration,
    },

    #[error("`{contract}.{method}` returned data that does not match its ABI: {reason}")]
    InvalidReturnData {
        contract: String,
        method: String,
        reason: String,
    },

    #[error("test case `{case}` did not finish within {timeout:?}")]
    TestTimeout { case: String, timeout: Duration },

    #[error("transport error on `{network}` during {operation}: {reason}")]
    NetworkTransport {
        network: String,
        operation: &'static str,
        reason: String,
    },

    #[error("node on `{network}` rejected {operation}: {message}")]
    NodeRejected {
        network: String,
        operation: &'static str,
        message: String,
    },

    #[error("no artifact named `{name}`")]
    UnknownArtifact { name: String },

    #[error("artifact file {}: {reason}", path.display())]
    Artifact { path: PathBuf, reason: String },

    #[error("no pinned compiler satisfies `{requirement}` in {source_name}")]
    NoMatchingCompiler {
        source_name: String,
        requirement: String,
    },

    #[error("compilation failed: {0}")]
    Compilation(String),

    #[error("verification of {address} failed: {reason}")]
    Verification { address: Address, reason: String },

    #[error("failed to start local node: {0}")]
    Node(String),
}

impl HarnessError {
    /// Configuration errors are raised before any network traffic happens.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownNetwork { .. }
                | Self::InvalidAccountSource { .. }
                | Self::MissingEndpoint { .. }
                | Self::InvalidConfig { .. }
        )
    }

    pub fn is_revert(&self) -> bool {
        matches!(
            self,
            Self::ExecutionReverted { .. } | Self::DeploymentReverted { .. }
        )
    }
}
