//! Calling methods of deployed contracts.
use alloy::{
    dyn_abi::{DynSolValue, FunctionExt, JsonAbiExt},
    json_abi::{Function, StateMutability},
    network::TransactionBuilder,
    rpc::types::TransactionRequest,
};

use crate::{
    chain::{self, ChainClient, ChainError, Receipt},
    deployer::DeployedContract,
    error::{HarnessError, Result},
    harness::{Harness, revert_reason},
};

/// What a successful invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutput {
    /// Decoded outputs of a `view`/`pure` method.
    Returned(Vec<DynSolValue>),
    /// Receipt of a confirmed state-changing transaction.
    Confirmed(Receipt),
}

impl InvocationOutput {
    pub fn returned(&self) -> Option<&[DynSolValue]> {
        match self {
            Self::Returned(values) => Some(values),
            Self::Confirmed(_) => None,
        }
    }

    pub fn receipt(&self) -> Option<&Receipt> {
        match self {
            Self::Returned(_) => None,
            Self::Confirmed(receipt) => Some(receipt),
        }
    }
}

pub type InvocationResult = Result<InvocationOutput>;

fn is_read_only(function: &Function) -> bool {
    matches!(
        function.state_mutability,
        StateMutability::View | StateMutability::Pure
    )
}

/// Finds `method` by name or full signature (`set(uint256,bool)`) and picks
/// the overload whose inputs accept `args`, then encodes the calldata.
pub fn resolve<'a>(
    contract: &'a DeployedContract,
    method: &str,
    args: &[DynSolValue],
) -> Result<(&'a Function, Vec<u8>)> {
    let candidates: Vec<&Function> = if method.contains('(') {
        contract
            .abi
            .functions()
            .filter(|function| function.signature() == method)
            .collect()
    } else {
        contract.abi.function(method).into_iter().flatten().collect()
    };
    let Some(first) = candidates.first() else {
        return Err(HarnessError::UnknownMethod {
            contract: contract.name.clone(),
            method: method.into(),
        });
    };
    let mismatch = |expected: usize, reason: String| HarnessError::ArgumentMismatch {
        contract: contract.name.clone(),
        method: method.into(),
        expected,
        got: args.len(),
        reason,
    };

    let same_arity = candidates
        .iter()
        .filter(|function| function.inputs.len() == args.len())
        .collect::<Vec<_>>();
    if same_arity.is_empty() {
        return Err(mismatch(first.inputs.len(), "no overload with this arity".into()));
    }
    let mut last_error = None;
    for function in same_arity {
        match function.abi_encode_input(args) {
            Ok(calldata) => return Ok((*function, calldata)),
            Err(err) => last_error = Some(err.to_string()),
        }
    }
    Err(mismatch(
        args.len(),
        last_error.unwrap_or_else(|| "argument types do not match".into()),
    ))
}

/// Invoke `method` on `contract` from the account that deployed it.
pub async fn call<C: ChainClient>(
    harness: &Harness<C>,
    contract: &DeployedContract,
    method: &str,
    args: &[DynSolValue],
) -> InvocationResult {
    let (function, calldata) = resolve(contract, method, args)?;
    let network = &harness.profile().name;
    let reverted = |reason: String| HarnessError::ExecutionReverted {
        network: network.clone(),
        contract: contract.name.clone(),
        method: method.into(),
        args: args.len(),
        reason,
    };
    let timed_out = || HarnessError::InvocationTimeout {
        network: network.clone(),
        contract: contract.name.clone(),
        method: method.into(),
        timeout: harness.timeout(),
    };

    let tx = TransactionRequest::default()
        .from(contract.sender)
        .to(contract.address)
        .with_input(calldata);

    if is_read_only(function) {
        tracing::debug!(%network, contract = %contract.name, method, "eth_call");
        let retry = harness.profile().retry;
        let output = tokio::time::timeout(
            harness.timeout(),
            chain::with_retry(retry, "call", || harness.client().call(tx.clone())),
        )
        .await
        .map_err(|_| timed_out())?;
        let data = match output {
            Ok(data) => data,
            Err(ChainError::Reverted { data }) => return Err(reverted(revert_reason(data.as_ref()))),
            Err(err) => return Err(harness.node_error("call", err)),
        };
        let values = function
            .abi_decode_output(&data)
            .map_err(|err| HarnessError::InvalidReturnData {
                contract: contract.name.clone(),
                method: method.into(),
                reason: err.to_string(),
            })?;
        return Ok(InvocationOutput::Returned(values));
    }

    tracing::info!(%network, contract = %contract.name, method, args = args.len(), "invoking");
    match harness.transact(tx).await {
        Ok(Some(receipt)) if receipt.success => Ok(InvocationOutput::Confirmed(receipt)),
        Ok(Some(receipt)) => {
            tracing::warn!(tx_hash = %receipt.transaction_hash, "{}.{method} reverted", contract.name);
            Err(reverted(revert_reason(None)))
        }
        Ok(None) => Err(timed_out()),
        Err(ChainError::Reverted { data }) => Err(reverted(revert_reason(data.as_ref()))),
        Err(err) => Err(harness.node_error("transaction", err)),
    }
}
