use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::domain::{Stage, WorkItem};
use crate::error::PipelineError;
use crate::store::Store;

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub dataset: String,
    pub created_at: String,
    pub stages: Vec<Stage>,
    pub pending: Vec<WorkItem>,
    pub completed: usize,
    #[serde(default)]
    pub failure: Option<FailureRecord>,
    #[serde(default)]
    pub options: CheckpointOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub item: WorkItem,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointOptions {
    pub workers: usize,
    pub skip_completed: bool,
}

impl Checkpoint {
    pub fn save(&self, dir: &Utf8Path) -> Result<Utf8PathBuf, PipelineError> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string();
        let mut path = dir.join(format!("checkpoint-{stamp}.json"));
        let mut attempt = 1;
        while path.as_std_path().exists() {
            path = dir.join(format!("checkpoint-{stamp}-{attempt}.json"));
            attempt += 1;
        }
        Store::write_json_atomic(&path, self)?;
        Ok(path)
    }

    pub fn load(path: &Utf8Path) -> Result<Self, PipelineError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| PipelineError::Checkpoint(format!("read {path}: {err}")))?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)
            .map_err(|err| PipelineError::Checkpoint(format!("parse {path}: {err}")))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(PipelineError::Checkpoint(format!(
                "unsupported checkpoint version {}",
                checkpoint.version
            )));
        }
        Ok(checkpoint)
    }
}

pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
