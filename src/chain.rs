//! The RPC collaborator seam: everything the harness needs from a node.

use std::{collections::HashMap, time::Duration};

use alloy::{
    primitives::{Address, Bytes, TxHash},
    rpc::types::TransactionRequest,
    transports::TransportError,
};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::RetryPolicy;

/// Condensed transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: TxHash,
    pub success: bool,
    pub contract_address: Option<Address>,
    pub gas_used: u64,
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    /// Execution reverted, with the raw revert data when the node returned it.
    #[error("execution reverted")]
    Reverted { data: Option<Bytes> },
    /// The node answered with an error that is not a revert.
    #[error("{0}")]
    Rejected(String),
    /// The request never got an answer (connection refused, DNS, ...).
    #[error("{0}")]
    Transport(String),
}

impl From<TransportError> for ChainError {
    fn from(err: TransportError) -> Self {
        if let Some(payload) = err.as_error_resp() {
            if let Some(data) = payload.as_revert_data() {
                return Self::Reverted { data: Some(data) };
            }
            if payload.message.contains("revert") {
                return Self::Reverted { data: None };
            }
            return Self::Rejected(payload.message.to_string());
        }
        Self::Transport(err.to_string())
    }
}

/// Operations consumed from a node. Implemented over alloy providers by
/// [`crate::provider::LiveChain`].
pub trait ChainClient: Send + Sync {
    fn gas_price(&self) -> impl Future<Output = Result<u128, ChainError>> + Send;

    fn estimate_gas(
        &self,
        tx: TransactionRequest,
    ) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Next nonce of `address`, pending transactions included.
    fn nonce(&self, address: Address) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Submit a fully specified transaction signed by its `from` account.
    fn send_transaction(
        &self,
        tx: TransactionRequest,
    ) -> impl Future<Output = Result<TxHash, ChainError>> + Send;

    /// Simulate `tx` against the latest state without changing it.
    fn call(&self, tx: TransactionRequest) -> impl Future<Output = Result<Bytes, ChainError>> + Send;

    fn receipt(
        &self,
        hash: TxHash,
    ) -> impl Future<Output = Result<Option<Receipt>, ChainError>> + Send;
}

/// Runs `op`, retrying transport failures only, with exponential backoff.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let mut attempt = 0;
    let mut delay = policy.backoff;
    loop {
        match op().await {
            Err(ChainError::Transport(reason)) if attempt < policy.max_retries => {
                attempt += 1;
                tracing::warn!(operation, attempt, %reason, ?delay, "transport error, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            result => return result,
        }
    }
}

/// Polls for a receipt until one shows up. Callers bound it with a timeout.
pub(crate) async fn wait_for_receipt<C: ChainClient>(
    client: &C,
    hash: TxHash,
    poll_interval: Duration,
    retry: RetryPolicy,
) -> Result<Receipt, ChainError> {
    loop {
        if let Some(receipt) = with_retry(retry, "get receipt", || client.receipt(hash)).await? {
            return Ok(receipt);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Per-sender nonce sequence.
///
/// Nonce assignment and submission happen under one lock so that transactions
/// of a sender reach the node in nonce order. The cached value is taken out
/// while a submission is in flight and only put back on success, so a failed
/// or cancelled submission makes the next one resync from the node.
#[derive(Debug, Default)]
pub struct NonceManager {
    next: Mutex<HashMap<Address, u64>>,
}

impl NonceManager {
    pub async fn submit<C: ChainClient>(
        &self,
        client: &C,
        retry: RetryPolicy,
        tx: TransactionRequest,
    ) -> Result<TxHash, ChainError> {
        let sender = tx
            .from
            .ok_or_else(|| ChainError::Rejected("transaction has no sender".into()))?;
        let mut next = self.next.lock().await;
        let nonce = match next.remove(&sender) {
            Some(nonce) => nonce,
            None => with_retry(retry, "get nonce", || client.nonce(sender)).await?,
        };
        let hash = client.send_transaction(tx.nonce(nonce)).await?;
        next.insert(sender, nonce + 1);
        tracing::debug!(%sender, nonce, %hash, "submitted");
        Ok(hash)
    }
}
