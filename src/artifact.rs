//! Compiled contract artifacts and the on-disk artifact store.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use alloy::{json_abi::JsonAbi, primitives::Bytes};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

/// Bytecode plus ABI, bound to the one compiler version that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledArtifact {
    pub contract_name: String,
    pub source_name: String,
    pub compiler: Version,
    pub abi: JsonAbi,
    /// Creation bytecode.
    pub bytecode: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationInput>,
}

/// What a verification service needs to rebuild the bytecode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationInput {
    pub standard_json: serde_json::Value,
    pub compiler_long_version: String,
}

/// Artifacts keyed by contract name.
#[derive(Debug, Clone, Default)]
pub struct ArtifactStore {
    artifacts: BTreeMap<String, CompiledArtifact>,
}

impl ArtifactStore {
    pub fn new(artifacts: impl IntoIterator<Item = CompiledArtifact>) -> Self {
        Self {
            artifacts: artifacts
                .into_iter()
                .map(|artifact| (artifact.contract_name.clone(), artifact))
                .collect(),
        }
    }

    /// Loads every `*.json` file of `dir`. A missing directory is an empty store.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            tracing::debug!(dir = %dir.display(), "no artifact directory");
            return Ok(Self::default());
        }
        let entries = fs::read_dir(dir).map_err(|err| artifact_error(dir, err))?;
        let mut store = Self::default();
        for entry in entries {
            let path = entry.map_err(|err| artifact_error(dir, err))?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let raw = fs::read(&path).map_err(|err| artifact_error(&path, err))?;
            let artifact: CompiledArtifact =
                serde_json::from_slice(&raw).map_err(|err| artifact_error(&path, err))?;
            store.insert(artifact);
        }
        tracing::debug!(dir = %dir.display(), count = store.artifacts.len(), "loaded artifacts");
        Ok(store)
    }

    /// Writes one `<ContractName>.json` per artifact and returns the paths.
    pub fn save(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir).map_err(|err| artifact_error(dir, err))?;
        self.artifacts
            .values()
            .map(|artifact| {
                let path = dir.join(format!("{}.json", artifact.contract_name));
                let raw = serde_json::to_vec_pretty(artifact)
                    .map_err(|err| artifact_error(&path, err))?;
                fs::write(&path, raw).map_err(|err| artifact_error(&path, err))?;
                Ok(path)
            })
            .collect()
    }

    pub fn insert(&mut self, artifact: CompiledArtifact) {
        if let Some(previous) = self
            .artifacts
            .insert(artifact.contract_name.clone(), artifact)
        {
            tracing::warn!(name = %previous.contract_name, "artifact replaced");
        }
    }

    pub fn get(&self, name: &str) -> Result<&CompiledArtifact> {
        self.artifacts
            .get(name)
            .ok_or_else(|| HarnessError::UnknownArtifact {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }
}

fn artifact_error(path: &Path, err: impl std::fmt::Display) -> HarnessError {
    HarnessError::Artifact {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn foo_bar() -> CompiledArtifact {
        CompiledArtifact {
            contract_name: "FooBar".into(),
            source_name: "FooBar.sol".into(),
            compiler: Version::new(0, 8, 17),
            abi: serde_json::from_str(
                r#"[{"type":"function","name":"foo","inputs":[],"outputs":[],"stateMutability":"nonpayable"}]"#,
            )
            .unwrap(),
            bytecode: Bytes::from_static(&[0x60, 0x80]),
            verification: None,
        }
    }

    #[test]
    fn save_then_load_keeps_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new([foo_bar()]);
        let paths = store.save(dir.path()).unwrap();
        assert_eq!(paths, [dir.path().join("FooBar.json")]);

        let loaded = ArtifactStore::load(dir.path()).unwrap();
        assert_eq!(loaded.get("FooBar").unwrap(), &foo_bar());
        assert_eq!(loaded.names().collect::<Vec<_>>(), ["FooBar"]);
    }

    #[test]
    fn unknown_artifact_and_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ArtifactStore::load(&dir.path().join("missing")).unwrap().names().next().is_none());

        fs::write(dir.path().join("Broken.json"), b"{").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        let err = ArtifactStore::load(dir.path()).unwrap_err();
        assert!(matches!(err, HarnessError::Artifact { ref path, .. } if path.ends_with("Broken.json")));

        let err = ArtifactStore::default().get("Nope").unwrap_err();
        assert!(matches!(err, HarnessError::UnknownArtifact { ref name } if name == "Nope"));
    }
}
