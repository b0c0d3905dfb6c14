//! The test-facing entry point tying a network profile, its accounts, the
//! artifacts and a chain client together.

use std::time::Duration;

use alloy::{
    dyn_abi::DynSolValue,
    primitives::{Address, Bytes, TxHash},
    rpc::types::TransactionRequest,
};

use crate::{
    accounts::{self, Account},
    artifact::ArtifactStore,
    chain::{self, ChainClient, ChainError, NonceManager, Receipt},
    config::{HarnessConfig, LOCAL_TEST_TIMEOUT, NetworkProfile},
    deployer::{self, DeployedContract},
    error::{HarnessError, Result},
    invoke::{self, InvocationResult},
    provider::LiveChain,
};

pub struct Harness<C> {
    profile: NetworkProfile,
    accounts: Vec<Account>,
    artifacts: ArtifactStore,
    client: C,
    nonces: NonceManager,
    test_timeout: Duration,
}

impl Harness<LiveChain> {
    /// Resolve `network`, provision its accounts, connect (spawning a node for
    /// ephemeral profiles) and load the configured artifact directory.
    pub fn connect(config: &HarnessConfig, network: &str) -> Result<Self> {
        let profile = config.networks.resolve(network)?.clone();
        let accounts = accounts::provision(&profile)?;
        let artifacts = ArtifactStore::load(&config.artifacts_dir)?;
        let client = LiveChain::connect(&profile, &accounts)?;
        tracing::info!(
            network = %profile.name,
            accounts = accounts.len(),
            artifacts = artifacts.names().count(),
            "harness ready"
        );
        Ok(Self::new(profile, accounts, artifacts, client).with_test_timeout(config.test_timeout))
    }
}

impl<C: ChainClient> Harness<C> {
    pub fn new(
        profile: NetworkProfile,
        accounts: Vec<Account>,
        artifacts: ArtifactStore,
        client: C,
    ) -> Self {
        Self {
            profile,
            accounts,
            artifacts,
            client,
            nonces: NonceManager::default(),
            test_timeout: LOCAL_TEST_TIMEOUT,
        }
    }

    /// Bound for a whole test case, see [`crate::driver::Suite`].
    pub fn with_test_timeout(mut self, test_timeout: Duration) -> Self {
        self.test_timeout = test_timeout;
        self
    }

    pub fn test_timeout(&self) -> Duration {
        self.test_timeout
    }

    pub fn profile(&self) -> &NetworkProfile {
        &self.profile
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Address of the account at `position`; fails when no signer exists.
    pub fn sender(&self, position: usize) -> Result<Address> {
        accounts::sender(&self.accounts, position, &self.profile.name).map(Account::address)
    }

    /// Deploy the named artifact from the default account, without
    /// constructor arguments.
    pub async fn deploy_fixture(&self, name: &str) -> Result<DeployedContract> {
        self.deploy_fixture_from(name, 0).await
    }

    pub async fn deploy_fixture_from(&self, name: &str, sender: usize) -> Result<DeployedContract> {
        let artifact = self.artifacts.get(name)?;
        deployer::deploy(self, artifact, self.sender(sender)?, &[]).await
    }

    pub async fn invoke(
        &self,
        contract: &DeployedContract,
        method: &str,
        args: &[DynSolValue],
    ) -> InvocationResult {
        invoke::call(self, contract, method, args).await
    }

    /// Gas limit for `tx`: the profile's fixed gas, or the estimate scaled by
    /// the multiplier and rounded up.
    pub(crate) async fn gas_limit(&self, tx: &TransactionRequest) -> Result<u64, ChainError> {
        if let Some(gas) = self.profile.gas {
            return Ok(gas);
        }
        let estimate =
            chain::with_retry(self.profile.retry, "estimate gas", || {
                self.client.estimate_gas(tx.clone())
            })
            .await?;
        Ok(scale_gas(estimate, self.profile.gas_multiplier))
    }

    /// Node gas price floored at the profile's configured price.
    pub(crate) async fn gas_price(&self) -> Result<u128, ChainError> {
        let node_price =
            chain::with_retry(self.profile.retry, "gas price", || self.client.gas_price()).await?;
        Ok(node_price.max(self.profile.gas_price))
    }

    /// Prices, submits and waits for `tx`, all bounded by the profile
    /// timeout. `Ok(None)` means the timeout elapsed first.
    pub(crate) async fn transact(
        &self,
        tx: TransactionRequest,
    ) -> Result<Option<Receipt>, ChainError> {
        let fut = async move {
            let gas_limit = self.gas_limit(&tx).await?;
            let gas_price = self.gas_price().await?;
            let tx = tx.gas_limit(gas_limit).gas_price(gas_price);
            let tx_hash: TxHash = self.nonces.submit(&self.client, self.profile.retry, tx).await?;
            tracing::info!(%tx_hash, network = %self.profile.name, "waiting for tx to be mined");
            chain::wait_for_receipt(
                &self.client,
                tx_hash,
                self.profile.poll_interval,
                self.profile.retry,
            )
            .await
        };
        match tokio::time::timeout(self.profile.timeout, fut).await {
            Ok(receipt) => {
                let receipt = receipt?;
                tracing::info!(
                    gas_used = receipt.gas_used,
                    tx_hash = %receipt.transaction_hash,
                    success = receipt.success,
                    "tx mined"
                );
                Ok(Some(receipt))
            }
            Err(_) => Ok(None),
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.profile.timeout
    }

    /// Maps a node failure onto the error taxonomy. Callers that can attribute
    /// a revert to a contract handle `ChainError::Reverted` themselves.
    pub(crate) fn node_error(&self, operation: &'static str, err: ChainError) -> HarnessError {
        match err {
            ChainError::Transport(reason) => HarnessError::NetworkTransport {
                network: self.profile.name.clone(),
                operation,
                reason,
            },
            ChainError::Rejected(message) => HarnessError::NodeRejected {
                network: self.profile.name.clone(),
                operation,
                message,
            },
            ChainError::Reverted { data } => HarnessError::NodeRejected {
                network: self.profile.name.clone(),
                operation,
                message: revert_reason(data.as_ref()),
            },
        }
    }
}

fn scale_gas(estimate: u64, multiplier: f64) -> u64 {
    (estimate as f64 * multiplier).ceil() as u64
}

/// Human readable revert reason, or a generic one when the node gave none.
pub(crate) fn revert_reason(data: Option<&Bytes>) -> String {
    match data {
        Some(data) if !data.is_empty() => alloy::sol_types::decode_revert_reason(data)
            .unwrap_or_else(|| format!("reverted with data {}", alloy::primitives::hex::encode_prefixed(data))),
        _ => "execution reverted without a reason".into(),
    }
}
