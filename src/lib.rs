//! Contract test harness: network profiles, account provisioning, compilation,
//! deployment and invocation of contract artifacts.
//!
//! A [`Harness`] is bound to one network profile and exposes the same two
//! operations for every contract: [`Harness::deploy_fixture`] and
//! [`Harness::invoke`]. The built-in suites in [`driver`] are written on top
//! of them.

pub mod accounts;
pub mod artifact;
pub mod chain;
pub mod compiler;
pub mod config;
pub mod deployer;
pub mod driver;
pub mod error;
pub mod harness;
pub mod invoke;
pub mod provider;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{HarnessConfig, NetworkProfile};
pub use deployer::DeployedContract;
pub use error::{HarnessError, Result};
pub use harness::Harness;
pub use invoke::{InvocationOutput, InvocationResult};
