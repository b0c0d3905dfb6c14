//! Network profiles and the immutable harness configuration.
//!
//! The configuration is assembled once from a static table of networks merged
//! with environment overrides and then handed to every component by
//! reference. Missing remote settings (endpoint URL, private key) do not fail
//! here: they produce an inert profile whose first use raises the error.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use alloy::transports::http::reqwest::Url;

use crate::{
    accounts,
    compiler::CompilerTable,
    error::{HarnessError, Result},
};

pub const DEFAULT_MNEMONIC: &str = "test test test test test test test test test test test junk";
pub const DEFAULT_DERIVATION_PATH: &str = "m/44'/60'/0'/0";
pub const DEFAULT_NETWORK: &str = "hardhat";

const GWEI: u128 = 1_000_000_000;
pub const LOCAL_TEST_TIMEOUT: Duration = Duration::from_millis(60_000);
const CI_TEST_TIMEOUT: Duration = Duration::from_millis(300_000);

/// Where a profile's transactions go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A throwaway node spawned for the lifetime of the harness.
    Ephemeral,
    Http(Url),
    /// The URL was not configured; connecting fails with `MissingEndpoint`.
    Missing,
}

#[derive(Clone, PartialEq, Eq)]
pub struct MnemonicSource {
    pub phrase: String,
    /// Derivation path prefix, the account index is appended as the last level.
    pub path: String,
    pub initial_index: u32,
    pub count: u32,
    pub passphrase: String,
}

impl MnemonicSource {
    pub fn new(phrase: impl Into<String>) -> Self {
        Self {
            phrase: phrase.into(),
            path: DEFAULT_DERIVATION_PATH.to_string(),
            initial_index: 0,
            count: 20,
            passphrase: String::new(),
        }
    }
}

/// Exactly one source of signing identities per profile.
#[derive(Clone, PartialEq, Eq)]
pub enum AccountSource {
    Mnemonic(MnemonicSource),
    Keys(Vec<String>),
}

// Keeps secrets out of logs.
impl fmt::Debug for AccountSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mnemonic(m) => f
                .debug_struct("Mnemonic")
                .field("path", &m.path)
                .field("initial_index", &m.initial_index)
                .field("count", &m.count)
                .finish_non_exhaustive(),
            Self::Keys(keys) => f.debug_tuple("Keys").field(&keys.len()).finish(),
        }
    }
}

/// Bounded retry for transport-level failures only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before the first retry, doubled after each attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkProfile {
    pub name: String,
    pub endpoint: Endpoint,
    /// Upper bound for a single confirmation.
    pub timeout: Duration,
    /// Floor for the gas price, in wei.
    pub gas_price: u128,
    /// Applied to estimated gas.
    pub gas_multiplier: f64,
    /// Fixed gas limit, skips estimation when set.
    pub gas: Option<u64>,
    pub accounts: AccountSource,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Contract verification API for this network, if any.
    pub verify_url: Option<Url>,
}

impl NetworkProfile {
    pub fn new(name: impl Into<String>, endpoint: Endpoint, accounts: AccountSource) -> Self {
        Self {
            name: name.into(),
            endpoint,
            timeout: Duration::from_millis(20_000),
            gas_price: 0,
            gas_multiplier: 1.0,
            gas: None,
            accounts,
            poll_interval: Duration::from_millis(250),
            retry: RetryPolicy::default(),
            verify_url: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_gas_price(mut self, gas_price: u128) -> Self {
        self.gas_price = gas_price;
        self
    }

    pub fn with_gas_multiplier(mut self, gas_multiplier: f64) -> Self {
        self.gas_multiplier = gas_multiplier;
        self
    }

    pub fn with_gas(mut self, gas: impl Into<Option<u64>>) -> Self {
        self.gas = gas.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_verify_url(mut self, url: Url) -> Self {
        self.verify_url = Some(url);
        self
    }

    /// Applies `<NAME>_GAS_PRICE`, `<NAME>_GAS_MULTIPLIER`, `<NAME>_TIMEOUT`
    /// and `<NAME>_TRANSPORT_RETRIES`.
    fn apply_overrides(mut self, vars: &Vars) -> Result<Self> {
        let prefix = self.name.to_uppercase();
        if let Some(price) = vars.parse::<u128>(&format!("{prefix}_GAS_PRICE"))? {
            self.gas_price = price;
        }
        let key = format!("{prefix}_GAS_MULTIPLIER");
        if let Some(multiplier) = vars.parse::<f64>(&key)? {
            if !(multiplier.is_finite() && multiplier > 0.0) {
                return Err(invalid(&key, &multiplier.to_string(), "must be positive"));
            }
            self.gas_multiplier = multiplier;
        }
        let key = format!("{prefix}_TIMEOUT");
        if let Some(ms) = vars.parse::<u64>(&key)? {
            if ms == 0 {
                return Err(invalid(&key, "0", "must be positive"));
            }
            self.timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = vars.parse::<u32>(&format!("{prefix}_TRANSPORT_RETRIES"))? {
            self.retry.max_retries = retries;
        }
        Ok(self)
    }
}

/// Named network targets, populated once.
#[derive(Debug, Clone, Default)]
pub struct NetworkRegistry {
    profiles: BTreeMap<String, NetworkProfile>,
}

impl NetworkRegistry {
    pub fn new(profiles: impl IntoIterator<Item = NetworkProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|profile| (profile.name.clone(), profile))
                .collect(),
        }
    }

    pub fn resolve(&self, name: &str) -> Result<&NetworkProfile> {
        self.profiles
            .get(name)
            .ok_or_else(|| HarnessError::UnknownNetwork {
                name: name.to_string(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkProfile> {
        self.profiles.values()
    }
}

/// Process-wide settings, built once and passed by reference.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub networks: NetworkRegistry,
    pub compilers: CompilerTable,
    /// Upper bound for a whole test case.
    pub test_timeout: Duration,
    pub etherscan_api_key: Option<String>,
    pub default_network: String,
    pub sources_dir: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl HarnessConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let vars = Vars::new(vars);

        // a defined but empty MNEMONIC or PRIVATE_KEY is taken as is
        let mnemonic = MnemonicSource::new(vars.defined("MNEMONIC").unwrap_or(DEFAULT_MNEMONIC));
        let keys = AccountSource::Keys(
            vars.defined("PRIVATE_KEY")
                .map(str::to_string)
                .into_iter()
                .collect(),
        );
        let remote = |name: &str, url_key: &str| -> Result<Endpoint> {
            Ok(match vars.get(url_key) {
                Some(url) => Endpoint::Http(
                    url.parse()
                        .map_err(|err| invalid(url_key, url, &format!("{err}")))?,
                ),
                None => {
                    tracing::debug!(network = name, key = url_key, "endpoint not configured");
                    Endpoint::Missing
                }
            })
        };

        let table = [
            NetworkProfile::new(
                DEFAULT_NETWORK,
                Endpoint::Ephemeral,
                AccountSource::Mnemonic(MnemonicSource::new(DEFAULT_MNEMONIC)),
            )
            .with_gas_price(10 * GWEI),
            NetworkProfile::new(
                "localhost",
                Endpoint::Http(local_url()?),
                AccountSource::Mnemonic(mnemonic),
            )
            .with_timeout(Duration::from_millis(120_000))
            .with_gas_price(10 * GWEI)
            .with_gas_multiplier(1.5),
            NetworkProfile::new("goerli", remote("goerli", "GOERLI_URL")?, keys.clone())
                .with_gas_price(10 * GWEI)
                .with_verify_url(etherscan_url("https://api-goerli.etherscan.io/api")?),
            NetworkProfile::new("ropsten", remote("ropsten", "ROPSTEN_URL")?, keys.clone())
                .with_gas_price(2 * GWEI)
                .with_verify_url(etherscan_url("https://api-ropsten.etherscan.io/api")?),
            NetworkProfile::new("sepolia", remote("sepolia", "SEPOLIA_URL")?, keys)
                .with_gas_price(2 * GWEI)
                .with_verify_url(etherscan_url("https://api-sepolia.etherscan.io/api")?),
        ];
        let profiles = table
            .into_iter()
            .map(|profile| profile.apply_overrides(&vars))
            .collect::<Result<Vec<_>>>()?;

        let test_timeout = if vars.flag("CI") {
            CI_TEST_TIMEOUT
        } else {
            LOCAL_TEST_TIMEOUT
        };

        Ok(Self {
            networks: NetworkRegistry::new(profiles),
            compilers: CompilerTable::pinned(|key| vars.get(key).map(PathBuf::from)),
            test_timeout,
            etherscan_api_key: vars.get("ETHERSCAN_API_KEY").map(str::to_string),
            default_network: vars
                .get("HARNESS_NETWORK")
                .unwrap_or(DEFAULT_NETWORK)
                .to_string(),
            sources_dir: vars.get("HARNESS_SOURCES").unwrap_or("contracts").into(),
            artifacts_dir: vars.get("HARNESS_ARTIFACTS").unwrap_or("artifacts").into(),
        })
    }

    /// Eager check of every profile. Returns all problems found instead of
    /// stopping at the first one.
    pub fn validate(&self) -> Vec<HarnessError> {
        let mut problems = Vec::new();
        if let Err(err) = self.networks.resolve(&self.default_network) {
            problems.push(err);
        }
        for profile in self.networks.iter() {
            if profile.endpoint == Endpoint::Missing {
                problems.push(HarnessError::MissingEndpoint {
                    network: profile.name.clone(),
                });
            }
            match accounts::provision(profile) {
                Ok(accounts) if accounts.is_empty() => {
                    problems.push(HarnessError::InvalidAccountSource {
                        network: profile.name.clone(),
                        reason: "neither a mnemonic nor any private key is configured".into(),
                    })
                }
                Ok(_) => {}
                Err(err) => problems.push(err),
            }
        }
        problems
    }
}

/// Environment snapshot.
struct Vars(HashMap<String, String>);

impl Vars {
    fn new(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(vars.into_iter().collect())
    }

    /// The value of `key`, empty values count as unset.
    fn get(&self, key: &str) -> Option<&str> {
        self.defined(key).filter(|value| !value.is_empty())
    }

    /// The value of `key` whenever it is set, even to the empty string.
    fn defined(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(key)
            .map(|value| {
                value
                    .trim()
                    .replace('_', "")
                    .parse()
                    .map_err(|err: T::Err| invalid(key, value, &err.to_string()))
            })
            .transpose()
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key)
            .is_some_and(|value| !matches!(value.to_ascii_lowercase().as_str(), "0" | "false" | "no"))
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> HarnessError {
    HarnessError::InvalidConfig {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn local_url() -> Result<Url> {
    "http://localhost:8545"
        .parse()
        .map_err(|err| invalid("localhost", "http://localhost:8545", &format!("{err}")))
}

fn etherscan_url(url: &str) -> Result<Url> {
    url.parse()
        .map_err(|err| invalid("verify_url", url, &format!("{err}")))
}
