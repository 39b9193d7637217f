//! Global-model checkpoints keyed by round.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{FlError, Result};
use crate::params::ParameterSet;

pub trait CheckpointStore: Send + Sync {
    fn save(&self, round: u64, params: &ParameterSet) -> Result<()>;
    /// Highest-round checkpoint, if any exists.
    fn load_latest(&self) -> Result<Option<(u64, ParameterSet)>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    round: u64,
    created_at: DateTime<Utc>,
    sha256: String,
    params: ParameterSet,
}

/// One JSON file per checkpoint: `fl_model_round_{round}.json`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn path_for(&self, round: u64) -> PathBuf { self.dir.join(format!("fl_model_round_{round}.json")) }

    pub fn load(&self, round: u64) -> Result<ParameterSet> {
        let text = fs::read_to_string(self.path_for(round))?;
        let file: CheckpointFile = serde_json::from_str(&text)?;
        if file.round != round {
            return Err(FlError::Checkpoint(format!("file for round {round} claims round {}", file.round)));
        }
        let actual = digest(&file.params)?;
        if actual != file.sha256 {
            return Err(FlError::Checkpoint(format!("digest mismatch for round {round}: stored {}, computed {actual}", file.sha256)));
        }
        Ok(file.params)
    }

    fn rounds(&self) -> Result<Vec<u64>> {
        let mut rounds = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let parsed = name
                .to_str()
                .and_then(|n| n.strip_prefix("fl_model_round_"))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(r) = parsed {
                rounds.push(r);
            }
        }
        rounds.sort_unstable();
        Ok(rounds)
    }
}

fn digest(params: &ParameterSet) -> Result<String> {
    let bytes = serde_json::to_vec(params)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, round: u64, params: &ParameterSet) -> Result<()> {
        let file = CheckpointFile { round, created_at: Utc::now(), sha256: digest(params)?, params: params.clone() };
        let path = self.path_for(round);
        // atomic replace
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&file)?)?;
        fs::rename(&tmp, &path)?;
        info!(round, path = %path.display(), "checkpoint saved");
        Ok(())
    }

    fn load_latest(&self) -> Result<Option<(u64, ParameterSet)>> {
        let Some(&round) = self.rounds()?.last() else {
            return Ok(None);
        };
        debug!(round, "loading latest checkpoint");
        Ok(Some((round, self.load(round)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn scratch() -> PathBuf { std::env::temp_dir().join(format!("talos-ckpt-{}", uuid::Uuid::new_v4())) }

    fn params(v: f32) -> ParameterSet {
        let mut p = ParameterSet::new();
        p.insert("w", arr1(&[v, -v, 0.1]).into_dyn());
        p
    }

    #[test]
    fn latest_round_wins_and_values_are_exact() {
        let dir = scratch();
        let store = FileCheckpointStore::new(&dir).unwrap();
        assert!(store.load_latest().unwrap().is_none());
        store.save(5, &params(1.5)).unwrap();
        store.save(10, &params(2.5)).unwrap();
        store.save(2, &params(0.5)).unwrap();
        let (round, loaded) = store.load_latest().unwrap().unwrap();
        assert_eq!(round, 10);
        assert_eq!(loaded, params(2.5));
        assert!(store.path_for(5).exists());
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn tampered_checkpoint_is_rejected() {
        let dir = scratch();
        let store = FileCheckpointStore::new(&dir).unwrap();
        store.save(1, &params(1.0)).unwrap();
        let path = store.path_for(1);
        let mut doc: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        doc["params"]["w"]["data"][0] = serde_json::json!(9.0);
        fs::write(&path, doc.to_string()).unwrap();
        assert!(matches!(store.load(1), Err(FlError::Checkpoint(_))));
        fs::remove_dir_all(dir).ok();
    }
}
