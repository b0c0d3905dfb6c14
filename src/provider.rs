//! Helper functions to build Ethereum [providers](https://docs.rs/alloy/latest/alloy/providers/trait.Provider.html)
//! for a network profile, and the [`ChainClient`] implementation on top of them.

use alloy::{
    network::{Ethereum, EthereumWallet},
    node_bindings::{Anvil, AnvilInstance},
    primitives::{Address, Bytes, TxHash},
    providers::{
        Provider, ProviderBuilder, RootProvider,
        fillers::{FillProvider, JoinFill, WalletFiller},
        utils::JoinedRecommendedFillers,
    },
    rpc::types::TransactionRequest,
    transports::http::reqwest::Url,
};

use crate::{
    accounts::Account,
    chain::{ChainClient, ChainError, Receipt},
    config::{AccountSource, Endpoint, NetworkProfile},
    error::{HarnessError, Result},
};

pub type HttpProviderWithWallet = FillProvider<
    JoinFill<JoinedRecommendedFillers, WalletFiller<EthereumWallet>>,
    RootProvider,
    Ethereum,
>;

/// Wallet able to sign for every provisioned account, defaulting to the first.
pub fn build_wallet(accounts: &[Account]) -> EthereumWallet {
    let mut wallet = EthereumWallet::default();
    for (position, account) in accounts.iter().enumerate() {
        if position == 0 {
            wallet.register_default_signer(account.signer.clone());
        } else {
            wallet.register_signer(account.signer.clone());
        }
    }
    wallet
}

/// HTTP provider with the recommended fillers and a wallet for `accounts`.
pub fn build_provider(accounts: &[Account], url: Url) -> HttpProviderWithWallet {
    ProviderBuilder::new()
        .wallet(build_wallet(accounts))
        .connect_http(url)
}

/// Spawn a throwaway anvil node funding the accounts of `profile`'s mnemonic.
pub fn spawn_ephemeral(profile: &NetworkProfile) -> Result<AnvilInstance> {
    let mut anvil = Anvil::new();
    if let AccountSource::Mnemonic(source) = &profile.accounts {
        anvil = anvil
            .mnemonic(source.phrase.as_str())
            .arg("--derivation-path")
            .arg(format!("{}/", source.path.trim_end_matches('/')))
            .arg("--accounts")
            .arg((source.initial_index + source.count).to_string());
    }
    let node = anvil
        .try_spawn()
        .map_err(|err| HarnessError::Node(err.to_string()))?;
    tracing::info!(network = %profile.name, endpoint = %node.endpoint(), "spawned ephemeral node");
    Ok(node)
}

/// A node reachable over HTTP, optionally owned by the harness.
pub struct LiveChain {
    provider: HttpProviderWithWallet,
    // kept alive for the lifetime of the provider, the node exits on drop
    node: Option<AnvilInstance>,
}

impl LiveChain {
    pub fn connect(profile: &NetworkProfile, accounts: &[Account]) -> Result<Self> {
        match &profile.endpoint {
            Endpoint::Ephemeral => {
                let node = spawn_ephemeral(profile)?;
                Ok(Self {
                    provider: build_provider(accounts, node.endpoint_url()),
                    node: Some(node),
                })
            }
            Endpoint::Http(url) => Ok(Self {
                provider: build_provider(accounts, url.clone()),
                node: None,
            }),
            Endpoint::Missing => Err(HarnessError::MissingEndpoint {
                network: profile.name.clone(),
            }),
        }
    }

    pub fn provider(&self) -> &HttpProviderWithWallet {
        &self.provider
    }

    pub fn endpoint(&self) -> Option<Url> {
        self.node.as_ref().map(AnvilInstance::endpoint_url)
    }
}

impl ChainClient for LiveChain {
    async fn gas_price(&self) -> Result<u128, ChainError> {
        Ok(self.provider.get_gas_price().await?)
    }

    async fn estimate_gas(&self, tx: TransactionRequest) -> Result<u64, ChainError> {
        Ok(self.provider.estimate_gas(tx).await?)
    }

    async fn nonce(&self, address: Address) -> Result<u64, ChainError> {
        Ok(self.provider.get_transaction_count(address).pending().await?)
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, ChainError> {
        let pending_tx = self.provider.send_transaction(tx).await?;
        Ok(*pending_tx.tx_hash())
    }

    async fn call(&self, tx: TransactionRequest) -> Result<Bytes, ChainError> {
        Ok(self.provider.call(tx).await?)
    }

    async fn receipt(&self, hash: TxHash) -> Result<Option<Receipt>, ChainError> {
        let receipt = self.provider.get_transaction_receipt(hash).await?;
        Ok(receipt.map(|receipt| Receipt {
            transaction_hash: receipt.transaction_hash,
            success: receipt.status(),
            contract_address: receipt.contract_address,
            gas_used: receipt.gas_used,
            block_number: receipt.block_number,
        }))
    }
}
