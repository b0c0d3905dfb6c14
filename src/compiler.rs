//! Pinned Solidity compilers and per-source compiler selection.
//!
//! Every source is compiled by exactly one pinned compiler: the highest one
//! satisfying its `pragma solidity` requirement. Compilation itself is
//! delegated to a `solc` executable speaking the standard JSON interface.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Stdio,
};

use alloy::{json_abi::JsonAbi, primitives::Bytes};
use semver::{Version, VersionReq};
use serde::Deserialize;
use serde_json::json;
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{
    artifact::{CompiledArtifact, VerificationInput},
    error::{HarnessError, Result},
};

/// Optimizer runs tuned for runtime gas cost over deployment size.
pub const OPTIMIZER_RUNS: u32 = 99_999;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerSettings {
    pub version: Version,
    pub optimizer_enabled: bool,
    pub optimizer_runs: u32,
    pub executable: PathBuf,
}

impl CompilerSettings {
    pub fn new(version: Version, executable: impl Into<PathBuf>) -> Self {
        Self {
            version,
            optimizer_enabled: true,
            optimizer_runs: OPTIMIZER_RUNS,
            executable: executable.into(),
        }
    }
}

/// The compilers a project is allowed to use, highest version first.
#[derive(Debug, Clone)]
pub struct CompilerTable {
    compilers: Vec<CompilerSettings>,
}

impl CompilerTable {
    pub fn new(compilers: impl IntoIterator<Item = CompilerSettings>) -> Self {
        let mut compilers = compilers.into_iter().collect::<Vec<_>>();
        compilers.sort_by(|a, b| b.version.cmp(&a.version));
        Self { compilers }
    }

    /// 0.8.17 and 0.5.6. The executable defaults to `solc-<version>` on
    /// `$PATH` and can be overridden through `SOLC_<MAJOR>_<MINOR>_<PATCH>`.
    pub fn pinned(lookup: impl Fn(&str) -> Option<PathBuf>) -> Self {
        Self::new([Version::new(0, 8, 17), Version::new(0, 5, 6)].map(|version| {
            let key = format!(
                "SOLC_{}_{}_{}",
                version.major, version.minor, version.patch
            );
            let executable = lookup(&key).unwrap_or_else(|| format!("solc-{version}").into());
            CompilerSettings::new(version, executable)
        }))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompilerSettings> {
        self.compilers.iter()
    }

    /// Picks the compiler for one source file.
    pub fn select(&self, source_name: &str, source: &str) -> Result<&CompilerSettings> {
        let Some(raw) = pragma_requirement(source) else {
            return self
                .compilers
                .first()
                .ok_or_else(|| HarnessError::NoMatchingCompiler {
                    source_name: source_name.to_string(),
                    requirement: "*".into(),
                });
        };
        let no_match = || HarnessError::NoMatchingCompiler {
            source_name: source_name.to_string(),
            requirement: raw.clone(),
        };
        let requirements = parse_requirement(&raw).map_err(|_| no_match())?;
        self.compilers
            .iter()
            .find(|c| requirements.iter().any(|req| req.matches(&c.version)))
            .ok_or_else(no_match)
    }
}

/// The text between `pragma solidity` and `;`, if any.
pub fn pragma_requirement(source: &str) -> Option<String> {
    source.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("pragma solidity")?;
        let end = rest.find(';')?;
        Some(rest[..end].trim().to_string())
    })
}

/// Solidity requirements are whitespace separated comparators, alternatives
/// split by `||`, and a bare version means an exact match.
fn parse_requirement(raw: &str) -> std::result::Result<Vec<VersionReq>, semver::Error> {
    raw.split("||")
        .map(|alternative| {
            let mut comparators = Vec::new();
            let mut pending_op = String::new();
            for token in alternative.split_whitespace() {
                if token.chars().all(|c| "<>=^~".contains(c)) {
                    pending_op.push_str(token);
                    continue;
                }
                let token = format!("{}{token}", std::mem::take(&mut pending_op));
                if token.starts_with(|c: char| c.is_ascii_digit()) {
                    comparators.push(format!("={token}"));
                } else {
                    comparators.push(token);
                }
            }
            if comparators.is_empty() {
                return Ok(VersionReq::STAR);
            }
            VersionReq::parse(&comparators.join(", "))
        })
        .collect()
}

/// External compiler collaborator.
pub trait SolidityCompiler {
    fn compile(
        &self,
        settings: &CompilerSettings,
        sources: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<Vec<CompiledArtifact>>>;
}

/// Drives a `solc` executable through `--standard-json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Solc;

impl SolidityCompiler for Solc {
    #[tracing::instrument(level = "debug", skip_all, fields(version = %settings.version))]
    async fn compile(
        &self,
        settings: &CompilerSettings,
        sources: &BTreeMap<String, String>,
    ) -> Result<Vec<CompiledArtifact>> {
        let long_version = self.long_version(settings).await?;

        let input = json!({
            "language": "Solidity",
            "sources": sources
                .iter()
                .map(|(name, content)| (name.clone(), json!({ "content": content })))
                .collect::<serde_json::Map<_, _>>(),
            "settings": {
                "optimizer": {
                    "enabled": settings.optimizer_enabled,
                    "runs": settings.optimizer_runs,
                },
                "outputSelection": { "*": { "*": ["abi", "evm.bytecode.object"] } },
            },
        });

        let mut child = Command::new(&settings.executable)
            .arg("--standard-json")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| spawn_error(&settings.executable, err))?;
        let serialized = serde_json::to_vec(&input)
            .map_err(|err| HarnessError::Compilation(format!("cannot serialize input: {err}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&serialized)
                .await
                .map_err(|err| HarnessError::Compilation(format!("cannot write to solc: {err}")))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|err| HarnessError::Compilation(format!("solc did not finish: {err}")))?;
        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stderr);
            tracing::error!(status = %output.status, %message, "solc failed");
            return Err(HarnessError::Compilation(message.into_owned()));
        }

        let parsed: SolcOutput = serde_json::from_slice(&output.stdout)
            .map_err(|err| HarnessError::Compilation(format!("unreadable solc output: {err}")))?;
        let errors = parsed
            .errors
            .iter()
            .filter(|d| d.severity == "error")
            .map(SolcDiagnostic::text)
            .collect::<Vec<_>>();
        if !errors.is_empty() {
            return Err(HarnessError::Compilation(errors.join("\n")));
        }
        for warning in parsed.errors.iter().filter(|d| d.severity != "error") {
            tracing::warn!(message = %warning.text(), "solc");
        }

        let mut artifacts = Vec::new();
        for (source_name, contracts) in parsed.contracts {
            for (contract_name, contract) in contracts {
                // interfaces and abstract contracts have nothing to deploy
                if contract.evm.bytecode.object.is_empty() {
                    continue;
                }
                let bytecode = alloy::primitives::hex::decode(&contract.evm.bytecode.object)
                    .map(Bytes::from)
                    .map_err(|err| {
                        HarnessError::Compilation(format!(
                            "{contract_name} has unlinked or malformed bytecode: {err}"
                        ))
                    })?;
                tracing::debug!(%source_name, %contract_name, size = bytecode.len(), "compiled");
                artifacts.push(CompiledArtifact {
                    contract_name,
                    source_name: source_name.clone(),
                    compiler: settings.version.clone(),
                    abi: contract.abi,
                    bytecode,
                    verification: Some(VerificationInput {
                        standard_json: input.clone(),
                        compiler_long_version: long_version.clone(),
                    }),
                });
            }
        }
        Ok(artifacts)
    }
}

impl Solc {
    /// Full version string (`v0.8.17+commit.8df45f5f`), checked against the
    /// pinned version.
    async fn long_version(&self, settings: &CompilerSettings) -> Result<String> {
        let output = Command::new(&settings.executable)
            .arg("--version")
            .output()
            .await
            .map_err(|err| spawn_error(&settings.executable, err))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let long_version = parse_long_version(&stdout).ok_or_else(|| {
            HarnessError::Compilation(format!("unexpected `solc --version` output: {stdout}"))
        })?;
        if !long_version.starts_with(&format!("v{}+", settings.version)) {
            return Err(HarnessError::Compilation(format!(
                "{} reports {long_version}, expected {}",
                settings.executable.display(),
                settings.version
            )));
        }
        Ok(long_version)
    }
}

fn parse_long_version(output: &str) -> Option<String> {
    let version = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Version: "))?;
    let commit = version.find("+commit.")?;
    let end = commit + "+commit.".len() + 8;
    Some(format!("v{}", version.get(..end)?))
}

fn spawn_error(executable: &Path, err: std::io::Error) -> HarnessError {
    HarnessError::Compilation(format!("cannot run {}: {err}", executable.display()))
}

/// Compiles every `.sol` file under `dir`, each with its selected compiler.
pub async fn compile_dir(
    table: &CompilerTable,
    compiler: &impl SolidityCompiler,
    dir: &Path,
) -> Result<Vec<CompiledArtifact>> {
    let entries = std::fs::read_dir(dir).map_err(|err| HarnessError::Artifact {
        path: dir.to_path_buf(),
        reason: err.to_string(),
    })?;

    let mut groups: BTreeMap<Version, (&CompilerSettings, BTreeMap<String, String>)> =
        BTreeMap::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "sol") {
            continue;
        }
        let content = std::fs::read_to_string(&path).map_err(|err| HarnessError::Artifact {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let settings = table.select(&name, &content)?;
        tracing::info!(source = %name, version = %settings.version, "selected compiler");
        groups
            .entry(settings.version.clone())
            .or_insert_with(|| (settings, BTreeMap::new()))
            .1
            .insert(name, content);
    }

    let mut artifacts = Vec::new();
    for (settings, sources) in groups.into_values() {
        artifacts.extend(compiler.compile(settings, &sources).await?);
    }
    Ok(artifacts)
}

#[derive(Debug, Deserialize)]
struct SolcOutput {
    #[serde(default)]
    errors: Vec<SolcDiagnostic>,
    #[serde(default)]
    contracts: BTreeMap<String, BTreeMap<String, SolcContract>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SolcDiagnostic {
    severity: String,
    message: String,
    #[serde(default)]
    formatted_message: Option<String>,
}

impl SolcDiagnostic {
    fn text(&self) -> String {
        self.formatted_message
            .clone()
            .unwrap_or_else(|| self.message.clone())
    }
}

#[derive(Debug, Deserialize)]
struct SolcContract {
    abi: JsonAbi,
    evm: SolcEvm,
}

#[derive(Debug, Deserialize)]
struct SolcEvm {
    bytecode: SolcBytecode,
}

#[derive(Debug, Deserialize)]
struct SolcBytecode {
    object: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CompilerTable {
        CompilerTable::pinned(|_| None)
    }

    #[test]
    fn pinned_compilers_use_optimizer() {
        let versions = table()
            .iter()
            .map(|c| {
                assert!(c.optimizer_enabled);
                assert_eq!(c.optimizer_runs, 99_999);
                c.version.to_string()
            })
            .collect::<Vec<_>>();
        assert_eq!(versions, ["0.8.17", "0.5.6"]);
    }

    #[test]
    fn executable_can_be_overridden() {
        let table = CompilerTable::pinned(|key| (key == "SOLC_0_5_6").then(|| "/opt/solc-old".into()));
        let executables = table
            .iter()
            .map(|c| c.executable.clone())
            .collect::<Vec<_>>();
        assert_eq!(
            executables,
            [PathBuf::from("solc-0.8.17"), PathBuf::from("/opt/solc-old")]
        );
    }

    #[test]
    fn selects_compiler_per_pragma() {
        let table = table();
        let pick = |src: &str| table.select("C.sol", src).map(|c| c.version.to_string());

        assert_eq!(pick("pragma solidity ^0.8.0;\ncontract C {}").unwrap(), "0.8.17");
        assert_eq!(pick("pragma solidity 0.5.6;").unwrap(), "0.5.6");
        assert_eq!(pick("pragma solidity ^0.5.0;").unwrap(), "0.5.6");
        assert_eq!(pick("pragma solidity >=0.5.0 <0.8.0;").unwrap(), "0.5.6");
        assert_eq!(pick("pragma solidity >= 0.5.0;").unwrap(), "0.8.17");
        assert_eq!(pick("pragma solidity ^0.4.0 || ^0.5.0;").unwrap(), "0.5.6");
        assert_eq!(pick("contract C {}").unwrap(), "0.8.17");
    }

    #[test]
    fn unsatisfiable_pragma_fails() {
        let err = table()
            .select("Old.sol", "pragma solidity ^0.7.0;")
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::NoMatchingCompiler { ref source_name, ref requirement }
                if source_name == "Old.sol" && requirement == "^0.7.0"
        ));
    }

    #[test]
    fn long_version_is_extracted() {
        let out = "solc, the solidity compiler commandline interface\nVersion: 0.8.17+commit.8df45f5f.Linux.g++\n";
        assert_eq!(
            parse_long_version(out).as_deref(),
            Some("v0.8.17+commit.8df45f5f")
        );
        assert_eq!(parse_long_version("garbage"), None);
    }

    #[test]
    fn solc_output_is_parsed() {
        let raw = r#"{
            "errors": [{"severity": "warning", "message": "unused variable"}],
            "contracts": {
                "FooBar.sol": {
                    "FooBar": {
                        "abi": [{"type": "function", "name": "foo", "inputs": [], "outputs": [], "stateMutability": "nonpayable"}],
                        "evm": {"bytecode": {"object": "6080604052"}}
                    }
                }
            }
        }"#;
        let parsed: SolcOutput = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.errors.len(), 1);
        let contract = &parsed.contracts["FooBar.sol"]["FooBar"];
        assert!(contract.abi.function("foo").is_some());
        assert_eq!(contract.evm.bytecode.object, "6080604052");
    }
}
