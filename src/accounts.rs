//! Deterministic provisioning of signing identities for a network profile.

use alloy::{
    primitives::Address,
    signers::local::{MnemonicBuilder, PrivateKeySigner, coins_bip39::English},
};

use crate::{
    config::{AccountSource, MnemonicSource, NetworkProfile},
    error::{HarnessError, Result},
};

/// A signing identity. The first account of a profile is its default sender.
#[derive(Debug, Clone)]
pub struct Account {
    /// Derivation index, `None` for explicitly configured keys.
    pub index: Option<u32>,
    pub signer: PrivateKeySigner,
}

impl Account {
    pub fn address(&self) -> Address {
        self.signer.address()
    }
}

/// Build a local signer from a mnemonic, a derivation path prefix and an index.
pub fn build_signer(source: &MnemonicSource, index: u32) -> Result<PrivateKeySigner> {
    let mut builder = MnemonicBuilder::<English>::default()
        .phrase(source.phrase.as_str())
        .derivation_path(format!("{}/{index}", source.path.trim_end_matches('/')))
        .map_err(|err| HarnessError::InvalidAccountSource {
            network: String::new(),
            reason: format!("invalid derivation path {:?}: {err}", source.path),
        })?;
    if !source.passphrase.is_empty() {
        builder = builder.password(source.passphrase.as_str());
    }
    builder
        .build()
        .map_err(|err| HarnessError::InvalidAccountSource {
            network: String::new(),
            reason: format!("cannot derive account {index}: {err}"),
        })
}

/// Accounts of `profile`, ordered by derivation index or configuration order.
///
/// An empty key list yields no accounts; the error is deferred until a signer
/// is actually needed (see [`default_sender`]).
pub fn provision(profile: &NetworkProfile) -> Result<Vec<Account>> {
    let with_network = |err: HarnessError| match err {
        HarnessError::InvalidAccountSource { reason, .. } => HarnessError::InvalidAccountSource {
            network: profile.name.clone(),
            reason,
        },
        other => other,
    };

    match &profile.accounts {
        AccountSource::Mnemonic(source) => {
            let last = source.initial_index.checked_add(source.count).ok_or_else(|| {
                HarnessError::InvalidAccountSource {
                    network: profile.name.clone(),
                    reason: "derivation index range overflows".into(),
                }
            })?;
            (source.initial_index..last)
                .map(|index| {
                    build_signer(source, index)
                        .map(|signer| Account {
                            index: Some(index),
                            signer,
                        })
                        .map_err(with_network)
                })
                .collect()
        }
        AccountSource::Keys(keys) => keys
            .iter()
            .enumerate()
            .map(|(position, key)| {
                key.trim()
                    .parse::<PrivateKeySigner>()
                    .map(|signer| Account {
                        index: None,
                        signer,
                    })
                    .map_err(|err| HarnessError::InvalidAccountSource {
                        network: profile.name.clone(),
                        reason: format!("private key #{position} is malformed: {err}"),
                    })
            })
            .collect(),
    }
}

/// The account that deploys and sends unless a test picks another one.
pub fn default_sender<'a>(accounts: &'a [Account], network: &str) -> Result<&'a Account> {
    sender(accounts, 0, network)
}

pub fn sender<'a>(accounts: &'a [Account], position: usize, network: &str) -> Result<&'a Account> {
    accounts
        .get(position)
        .ok_or_else(|| HarnessError::InvalidAccountSource {
            network: network.to_string(),
            reason: if accounts.is_empty() {
                "neither a mnemonic nor any private key is configured".into()
            } else {
                format!("no account #{position}, only {} provisioned", accounts.len())
            },
        })
}
