//! Contract deployment helpers for testing
use alloy::{
    dyn_abi::{DynSolValue, JsonAbiExt},
    json_abi::JsonAbi,
    network::TransactionBuilder,
    primitives::{Address, Bytes, TxHash},
    rpc::types::TransactionRequest,
};

use crate::{
    artifact::CompiledArtifact,
    chain::{ChainClient, ChainError},
    error::{HarnessError, Result},
    harness::{Harness, revert_reason},
};

/// An artifact instantiated at an address, owned by the test that deployed it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployedContract {
    pub name: String,
    pub address: Address,
    pub abi: JsonAbi,
    /// The deployer, also the sender of later invocations.
    pub sender: Address,
    pub network: String,
    pub tx_hash: TxHash,
}

/// Creation code followed by the ABI-encoded constructor arguments.
pub fn creation_code(artifact: &CompiledArtifact, args: &[DynSolValue]) -> Result<Bytes> {
    let mismatch = |expected: usize, reason: String| HarnessError::ArgumentMismatch {
        contract: artifact.contract_name.clone(),
        method: "constructor".into(),
        expected,
        got: args.len(),
        reason,
    };
    let encoded_args = match &artifact.abi.constructor {
        Some(constructor) => {
            if constructor.inputs.len() != args.len() {
                return Err(mismatch(constructor.inputs.len(), "wrong arity".into()));
            }
            constructor
                .abi_encode_input(args)
                .map_err(|err| mismatch(constructor.inputs.len(), err.to_string()))?
        }
        None if args.is_empty() => Vec::new(),
        None => return Err(mismatch(0, "contract has no constructor".into())),
    };
    let mut code = artifact.bytecode.to_vec();
    code.extend(encoded_args);
    Ok(code.into())
}

/// Deploy `artifact` from `sender` and wait for the receipt (with logging).
pub async fn deploy<C: ChainClient>(
    harness: &Harness<C>,
    artifact: &CompiledArtifact,
    sender: Address,
    args: &[DynSolValue],
) -> Result<DeployedContract> {
    let name = &artifact.contract_name;
    let network = &harness.profile().name;
    let reverted = |reason: String| HarnessError::DeploymentReverted {
        network: network.clone(),
        artifact: name.clone(),
        reason,
    };

    let code = creation_code(artifact, args)?;
    tracing::info!(%network, compiler = %artifact.compiler, "deploying {name}");
    let tx = TransactionRequest::default()
        .from(sender)
        .with_deploy_code(code);

    let receipt = match harness.transact(tx).await {
        Ok(Some(receipt)) => receipt,
        Ok(None) => {
            tracing::warn!(%network, timeout = ?harness.timeout(), "deployment of {name} timed out");
            return Err(HarnessError::DeploymentTimeout {
                network: network.clone(),
                artifact: name.clone(),
                timeout: harness.timeout(),
            });
        }
        Err(ChainError::Reverted { data }) => return Err(reverted(revert_reason(data.as_ref()))),
        Err(err) => return Err(harness.node_error("deployment", err)),
    };
    if !receipt.success {
        return Err(reverted(revert_reason(None)));
    }
    let address = receipt
        .contract_address
        .ok_or_else(|| reverted("receipt carries no contract address".into()))?;

    tracing::info!("deployed {name} at {address:#x}");
    Ok(DeployedContract {
        name: name.clone(),
        address,
        abi: artifact.abi.clone(),
        sender,
        network: network.clone(),
        tx_hash: receipt.transaction_hash,
    })
}
