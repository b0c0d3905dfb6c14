//! Source verification on block explorers.
use alloy::{
    primitives::{Address, hex},
    transports::http::reqwest::Url,
};
use serde::Deserialize;

use crate::{
    artifact::CompiledArtifact,
    config::{HarnessConfig, NetworkProfile},
    error::{HarnessError, Result},
};

/// Publishes the source of a deployed artifact.
pub trait Verifier {
    /// Submits `artifact` deployed at `address` and returns the service's
    /// reference for the pending verification.
    fn verify(
        &self,
        artifact: &CompiledArtifact,
        address: Address,
        constructor_args: &[u8],
    ) -> impl Future<Output = Result<String>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationStatus {
    Pending,
    Verified,
    Failed(String),
}

/// Etherscan style `verifysourcecode` API.
#[derive(Debug, Clone)]
pub struct EtherscanVerifier {
    url: Url,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct EtherscanResponse {
    status: String,
    #[serde(default)]
    message: String,
    result: String,
}

impl EtherscanVerifier {
    pub fn new(url: Url, api_key: impl Into<String>) -> Self {
        Self {
            url,
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Verifier for `profile`, using the configured API key.
    pub fn for_network(config: &HarnessConfig, profile: &NetworkProfile) -> Result<Self> {
        let refused = |reason: &str| HarnessError::Verification {
            address: Address::ZERO,
            reason: format!("network `{}`: {reason}", profile.name),
        };
        let url = profile
            .verify_url
            .clone()
            .ok_or_else(|| refused("no verification service"))?;
        let api_key = config
            .etherscan_api_key
            .clone()
            .ok_or_else(|| refused("ETHERSCAN_API_KEY is not set"))?;
        Ok(Self::new(url, api_key))
    }

    async fn request(&self, address: Address, params: &[(&str, &str)]) -> Result<EtherscanResponse> {
        let failed = |reason: String| HarnessError::Verification { address, reason };
        let mut form = vec![("apikey", self.api_key.as_str())];
        form.extend_from_slice(params);
        let response: EtherscanResponse = self
            .client
            .post(self.url.clone())
            .form(&form)
            .send()
            .await
            .map_err(|err| failed(err.to_string()))?
            .error_for_status()
            .map_err(|err| failed(err.to_string()))?
            .json()
            .await
            .map_err(|err| failed(format!("malformed response: {err}")))?;
        Ok(response)
    }

    pub async fn status(&self, address: Address, guid: &str) -> Result<VerificationStatus> {
        let response = self
            .request(
                address,
                &[
                    ("module", "contract"),
                    ("action", "checkverifystatus"),
                    ("guid", guid),
                ],
            )
            .await?;
        Ok(match response.status.as_str() {
            "1" => VerificationStatus::Verified,
            _ if response.result.contains("Pending") => VerificationStatus::Pending,
            // already verified sources are reported as a failure
            _ if response.result.contains("Already Verified") => VerificationStatus::Verified,
            _ => VerificationStatus::Failed(response.result),
        })
    }
}

impl Verifier for EtherscanVerifier {
    async fn verify(
        &self,
        artifact: &CompiledArtifact,
        address: Address,
        constructor_args: &[u8],
    ) -> Result<String> {
        let input = artifact
            .verification
            .as_ref()
            .ok_or_else(|| HarnessError::Verification {
                address,
                reason: format!("artifact `{}` carries no verification input", artifact.contract_name),
            })?;
        let source_code = input.standard_json.to_string();
        let contract_name = format!("{}:{}", artifact.source_name, artifact.contract_name);
        let compiler_version = input.compiler_long_version.as_str();
        let address_hex = address.to_string();
        let constructor_args = hex::encode(constructor_args);

        tracing::info!(%address, contract = %contract_name, url = %self.url, "submitting verification");
        let response = self
            .request(
                address,
                &[
                    ("module", "contract"),
                    ("action", "verifysourcecode"),
                    ("contractaddress", address_hex.as_str()),
                    ("sourceCode", source_code.as_str()),
                    ("codeformat", "solidity-standard-json-input"),
                    ("contractname", contract_name.as_str()),
                    ("compilerversion", compiler_version),
                    // the service's own spelling
                    ("constructorArguements", constructor_args.as_str()),
                ],
            )
            .await?;
        if response.status != "1" {
            return Err(HarnessError::Verification {
                address,
                reason: format!("{}: {}", response.message, response.result),
            });
        }
        tracing::info!(%address, guid = %response.result, "verification submitted");
        Ok(response.result)
    }
}
