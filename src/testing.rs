//! In-memory chain double and contract fixtures for unit tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use alloy::{
    dyn_abi::{DynSolType, DynSolValue},
    json_abi::JsonAbi,
    network::TransactionBuilder,
    primitives::{Address, Bytes, Selector, TxHash, TxKind, U256, keccak256},
    rpc::types::TransactionRequest,
    sol_types::{Revert, SolError},
};
use semver::Version;

use crate::{
    accounts,
    artifact::{ArtifactStore, CompiledArtifact},
    chain::{ChainClient, ChainError, Receipt},
    config::{AccountSource, DEFAULT_MNEMONIC, Endpoint, MnemonicSource, NetworkProfile},
    harness::Harness,
};

pub(crate) type Storage = HashMap<u64, U256>;
type Outcome = Result<Bytes, Option<Bytes>>;
type Handler = Arc<dyn Fn(&mut Storage, &[u8]) -> Outcome + Send + Sync>;

/// Behavior of a deployed fixture, dispatched on the 4-byte selector.
#[derive(Clone, Default)]
pub(crate) struct Program {
    handlers: HashMap<Selector, Handler>,
    constructor_revert: Option<Option<Bytes>>,
}

impl Program {
    fn on(
        mut self,
        abi: &JsonAbi,
        method: &str,
        handler: impl Fn(&mut Storage, &[u8]) -> Outcome + Send + Sync + 'static,
    ) -> Self {
        let handler: Handler = Arc::new(handler);
        for function in abi.function(method).into_iter().flatten() {
            self.handlers.insert(function.selector(), handler.clone());
        }
        self
    }

    fn execute(&self, storage: &mut Storage, input: &[u8]) -> Outcome {
        let Some(selector) = input.get(..4) else {
            return Err(None);
        };
        match self.handlers.get(&Selector::from_slice(selector)) {
            Some(handler) => handler(storage, &input[4..]),
            None => Err(None),
        }
    }
}

pub(crate) struct Fixture {
    pub artifact: CompiledArtifact,
    pub program: Program,
}

fn artifact(name: &str, tag: u8, abi: &str) -> CompiledArtifact {
    CompiledArtifact {
        contract_name: name.into(),
        source_name: format!("{name}.sol"),
        compiler: Version::new(0, 8, 17),
        abi: serde_json::from_str(abi).unwrap(),
        bytecode: Bytes::from(vec![0x60, 0x80, 0x60, 0x40, tag]),
        verification: None,
    }
}

fn ok(_: &mut Storage, _: &[u8]) -> Outcome {
    Ok(Bytes::new())
}

pub(crate) fn foo_bar() -> Fixture {
    let artifact = artifact(
        "FooBar",
        1,
        r#"[
            {"type":"function","name":"foo","inputs":[],"outputs":[],"stateMutability":"nonpayable"},
            {"type":"function","name":"bar","inputs":[],"outputs":[],"stateMutability":"nonpayable"}
        ]"#,
    );
    let program = Program::default()
        .on(&artifact.abi, "foo", ok)
        .on(&artifact.abi, "bar", ok);
    Fixture { artifact, program }
}

pub(crate) fn stack_depth() -> Fixture {
    let inputs = (1..=12)
        .map(|i| format!(r#"{{"name":"a{i}","type":"uint256"}}"#))
        .collect::<Vec<_>>()
        .join(",");
    let artifact = artifact(
        "StackDepthTestSuite",
        2,
        &format!(
            r#"[{{"type":"function","name":"stackNotTooDeep","inputs":[{inputs}],"outputs":[],"stateMutability":"nonpayable"}}]"#
        ),
    );
    let program = Program::default().on(&artifact.abi, "stackNotTooDeep", |_: &mut Storage, args: &[u8]| -> Outcome {
        if args.len() == 12 * 32 { Ok(Bytes::new()) } else { Err(None) }
    });
    Fixture { artifact, program }
}

/// `increment()` bumps slot 0, `count()` reads it, `fail()` reverts with a
/// reason, `peek()` returns undecodable data and `set` is overloaded.
pub(crate) fn counter() -> Fixture {
    let artifact = artifact(
        "Counter",
        3,
        r#"[
            {"type":"constructor","inputs":[{"name":"start","type":"uint256"}],"stateMutability":"nonpayable"},
            {"type":"function","name":"increment","inputs":[],"outputs":[],"stateMutability":"nonpayable"},
            {"type":"function","name":"count","inputs":[],"outputs":[{"name":"","type":"uint256"}],"stateMutability":"view"},
            {"type":"function","name":"peek","inputs":[],"outputs":[{"name":"","type":"uint256"}],"stateMutability":"view"},
            {"type":"function","name":"fail","inputs":[],"outputs":[],"stateMutability":"nonpayable"},
            {"type":"function","name":"set","inputs":[{"name":"value","type":"uint256"}],"outputs":[],"stateMutability":"nonpayable"},
            {"type":"function","name":"set","inputs":[{"name":"value","type":"uint256"},{"name":"flag","type":"bool"}],"outputs":[],"stateMutability":"nonpayable"}
        ]"#,
    );
    let read = |storage: &mut Storage, _: &[u8]| -> Outcome {
        let value = storage.get(&0).copied().unwrap_or_default();
        Ok(DynSolValue::Uint(value, 256).abi_encode().into())
    };
    let program = Program::default()
        .on(&artifact.abi, "increment", |storage: &mut Storage, _: &[u8]| -> Outcome {
            *storage.entry(0).or_default() += U256::from(1);
            Ok(Bytes::new())
        })
        .on(&artifact.abi, "count", read)
        // returns garbage that does not decode as uint256
        .on(&artifact.abi, "peek", |_: &mut Storage, _: &[u8]| -> Outcome {
            Ok(Bytes::from_static(&[1, 2, 3]))
        })
        .on(&artifact.abi, "fail", |_: &mut Storage, _: &[u8]| -> Outcome {
            Err(Some(Revert { reason: "boom".into() }.abi_encode().into()))
        })
        .on(&artifact.abi, "set", |storage: &mut Storage, args: &[u8]| -> Outcome {
            let value = DynSolType::Uint(256)
                .abi_decode(&args[..32])
                .ok()
                .and_then(|v| v.as_uint().map(|(v, _)| v))
                .ok_or(None::<Bytes>)?;
            storage.insert(0, value);
            Ok(Bytes::new())
        });
    Fixture { artifact, program }
}

/// A contract whose constructor always reverts.
pub(crate) fn broken() -> Fixture {
    let mut program = Program::default();
    program.constructor_revert = Some(Some(Revert { reason: "nope".into() }.abi_encode().into()));
    Fixture {
        artifact: artifact("Broken", 4, "[]"),
        program,
    }
}

#[derive(Default)]
struct State {
    programs: Vec<(Bytes, Program)>,
    contracts: HashMap<Address, (Program, Storage)>,
    nonces: HashMap<Address, u64>,
    sent: Vec<TransactionRequest>,
    receipts: HashMap<TxHash, Receipt>,
    withhold_receipts: bool,
    reject_next: Option<String>,
    receipt_transport_failures: u32,
    stall_estimates: bool,
    stall_next_submission: bool,
}

/// Single-node EVM stand-in: instant mining, deterministic addresses.
pub(crate) struct MockChain {
    state: Mutex<State>,
    gas_price: u128,
    estimate: u64,
}

impl Default for MockChain {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            gas_price: 1_000_000_000,
            estimate: 100_000,
        }
    }
}

impl MockChain {
    pub fn with_gas_price(mut self, gas_price: u128) -> Self {
        self.gas_price = gas_price;
        self
    }

    pub fn with_estimate(mut self, estimate: u64) -> Self {
        self.estimate = estimate;
        self
    }

    pub fn install(&self, fixture: &Fixture) {
        self.state
            .lock()
            .unwrap()
            .programs
            .push((fixture.artifact.bytecode.clone(), fixture.program.clone()));
    }

    pub fn withhold_receipts(&self) {
        self.state.lock().unwrap().withhold_receipts = true;
    }

    /// `eth_estimateGas` never answers.
    pub fn stall_estimates(&self) {
        self.state.lock().unwrap().stall_estimates = true;
    }

    /// The next transaction is accepted but its submission never returns.
    pub fn stall_next_submission(&self) {
        self.state.lock().unwrap().stall_next_submission = true;
    }

    pub fn reject_next_submission(&self, message: &str) {
        self.state.lock().unwrap().reject_next = Some(message.into());
    }

    pub fn fail_receipt_lookups(&self, times: u32) {
        self.state.lock().unwrap().receipt_transport_failures = times;
    }

    pub fn sent(&self) -> Vec<TransactionRequest> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn submitted_nonces(&self, sender: Address) -> Vec<u64> {
        self.sent()
            .iter()
            .filter(|tx| tx.from == Some(sender))
            .filter_map(|tx| tx.nonce)
            .collect()
    }

    pub fn storage(&self, address: Address) -> Storage {
        self.state
            .lock()
            .unwrap()
            .contracts
            .get(&address)
            .map(|(_, storage)| storage.clone())
            .unwrap_or_default()
    }
}

fn input(tx: &TransactionRequest) -> Bytes {
    tx.input.input().cloned().unwrap_or_default()
}

fn is_create(tx: &TransactionRequest) -> bool {
    matches!(tx.to, None | Some(TxKind::Create))
}

impl State {
    fn program_for(&self, code: &[u8]) -> Option<Program> {
        self.programs
            .iter()
            .find(|(bytecode, _)| code.starts_with(bytecode))
            .map(|(_, program)| program.clone())
    }

    /// Runs `tx` on a scratch copy of the state.
    fn simulate(&self, tx: &TransactionRequest) -> Result<Bytes, ChainError> {
        let data = input(tx);
        if is_create(tx) {
            return match self.program_for(&data) {
                Some(Program {
                    constructor_revert: Some(revert),
                    ..
                }) => Err(ChainError::Reverted { data: revert }),
                Some(_) => Ok(Bytes::new()),
                None => Err(ChainError::Reverted { data: None }),
            };
        }
        let Some(TxKind::Call(to)) = tx.to else {
            return Ok(Bytes::new());
        };
        match self.contracts.get(&to) {
            Some((program, storage)) => program
                .execute(&mut storage.clone(), &data)
                .map_err(|data| ChainError::Reverted { data }),
            None => Ok(Bytes::new()),
        }
    }
}

impl ChainClient for MockChain {
    async fn gas_price(&self) -> Result<u128, ChainError> {
        Ok(self.gas_price)
    }

    async fn estimate_gas(&self, tx: TransactionRequest) -> Result<u64, ChainError> {
        let outcome = {
            let state = self.state.lock().unwrap();
            (!state.stall_estimates).then(|| state.simulate(&tx))
        };
        match outcome {
            Some(outcome) => outcome.map(|_| self.estimate),
            None => std::future::pending().await,
        }
    }

    async fn nonce(&self, address: Address) -> Result<u64, ChainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .nonces
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, ChainError> {
        let (hash, stall) = self.accept(tx)?;
        if stall {
            std::future::pending::<()>().await;
        }
        Ok(hash)
    }

    async fn call(&self, tx: TransactionRequest) -> Result<Bytes, ChainError> {
        self.state.lock().unwrap().simulate(&tx)
    }

    async fn receipt(&self, hash: TxHash) -> Result<Option<Receipt>, ChainError> {
        let mut state = self.state.lock().unwrap();
        if state.receipt_transport_failures > 0 {
            state.receipt_transport_failures -= 1;
            return Err(ChainError::Transport("connection reset".into()));
        }
        Ok(state.receipts.get(&hash).cloned())
    }
}

impl MockChain {
    /// Validates, executes and records `tx`. The flag tells whether the
    /// submission should then hang.
    fn accept(&self, tx: TransactionRequest) -> Result<(TxHash, bool), ChainError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.reject_next.take() {
            return Err(ChainError::Rejected(message));
        }
        let from = tx.from.ok_or_else(|| ChainError::Rejected("no sender".into()))?;
        let expected = state.nonces.get(&from).copied().unwrap_or_default();
        if tx.nonce != Some(expected) {
            return Err(ChainError::Rejected(format!(
                "nonce mismatch: expected {expected}, got {:?}",
                tx.nonce
            )));
        }
        state.nonces.insert(from, expected + 1);
        state.sent.push(tx.clone());

        let hash = keccak256([from.as_slice(), &expected.to_be_bytes()].concat());
        let data = input(&tx);
        let (success, contract_address) = if is_create(&tx) {
            match state.program_for(&data) {
                Some(program) if program.constructor_revert.is_none() => {
                    let address = from.create(expected);
                    state.contracts.insert(address, (program, Storage::new()));
                    (true, Some(address))
                }
                _ => (false, None),
            }
        } else {
            match tx.to {
                Some(TxKind::Call(to)) => match state.contracts.get_mut(&to) {
                    Some((program, storage)) => {
                        let mut scratch = storage.clone();
                        let outcome = program.execute(&mut scratch, &data);
                        if outcome.is_ok() {
                            *storage = scratch;
                        }
                        (outcome.is_ok(), None)
                    }
                    None => (true, None),
                },
                _ => (true, None),
            }
        };

        if !state.withhold_receipts {
            let block_number = state.receipts.len() as u64 + 1;
            state.receipts.insert(
                hash,
                Receipt {
                    transaction_hash: hash,
                    success,
                    contract_address,
                    gas_used: 21_000 + data.len() as u64 * 16,
                    block_number: Some(block_number),
                },
            );
        }
        let stall = std::mem::take(&mut state.stall_next_submission);
        Ok((hash, stall))
    }
}

/// The default local profile with fast polling.
pub(crate) fn local_profile() -> NetworkProfile {
    NetworkProfile::new(
        "hardhat",
        Endpoint::Ephemeral,
        AccountSource::Mnemonic(MnemonicSource {
            count: 3,
            ..MnemonicSource::new(DEFAULT_MNEMONIC)
        }),
    )
    .with_gas_price(10_000_000_000)
    .with_poll_interval(std::time::Duration::from_millis(10))
}

/// A harness over a [`MockChain`] with every fixture installed.
pub(crate) fn harness(profile: NetworkProfile, fixtures: &[Fixture]) -> Harness<MockChain> {
    harness_on(MockChain::default(), profile, fixtures)
}

pub(crate) fn harness_on(
    chain: MockChain,
    profile: NetworkProfile,
    fixtures: &[Fixture],
) -> Harness<MockChain> {
    for fixture in fixtures {
        chain.install(fixture);
    }
    let accounts = accounts::provision(&profile).unwrap();
    let artifacts = ArtifactStore::new(fixtures.iter().map(|f| f.artifact.clone()));
    Harness::new(profile, accounts, artifacts, chain)
}

/// `TransactionRequest::with_deploy_code` marks creations the same way the
/// harness does.
#[test]
fn deploy_code_is_a_create() {
    let tx = TransactionRequest::default().with_deploy_code(Bytes::from_static(&[1]));
    assert!(is_create(&tx));
}
