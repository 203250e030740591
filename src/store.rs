use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::config::Dataset;
use crate::domain::{ParameterTuple, Stage, SubjectId, WorkItem};
use crate::error::PipelineError;

pub const ADJUSTMENT_MARKER: &str = ".model-adjustment.json";

#[derive(Debug, Clone, Copy)]
pub struct DatasetLayout<'a> {
    dataset: &'a Dataset,
}

impl<'a> DatasetLayout<'a> {
    pub fn new(dataset: &'a Dataset) -> Self {
        Self { dataset }
    }

    pub fn subject_dir(&self, subject: SubjectId) -> Utf8PathBuf {
        self.dataset
            .root
            .join(format!("{}{:02}", self.dataset.subject_prefix, subject.0))
    }

    pub fn context_dir(&self, tuple: &ParameterTuple) -> Utf8PathBuf {
        let mut dir = Utf8PathBuf::new();
        for (parameter, value) in self.dataset.space.parameters().iter().zip(tuple.values()) {
            dir.push(format!("{}{value}", parameter.name));
        }
        dir
    }

    pub fn raw_data_dir(&self, item: &WorkItem) -> Utf8PathBuf {
        self.subject_dir(item.subject)
            .join(&self.dataset.naming.data_folder)
            .join(self.context_dir(&item.tuple))
    }

    pub fn motion_dir(&self, item: &WorkItem) -> Utf8PathBuf {
        self.raw_data_dir(item).join(&self.dataset.naming.motion_folder)
    }

    pub fn forces_dir(&self, item: &WorkItem) -> Utf8PathBuf {
        self.raw_data_dir(item).join(&self.dataset.naming.forces_folder)
    }

    pub fn results_dir(&self, item: &WorkItem) -> Utf8PathBuf {
        self.subject_dir(item.subject)
            .join(&self.dataset.naming.results_folder)
            .join(self.context_dir(&item.tuple))
    }

    pub fn stage_dir(&self, item: &WorkItem, stage: Stage) -> Utf8PathBuf {
        self.results_dir(item).join(self.dataset.naming.stage_folder(stage))
    }

    pub fn model_path(
        &self,
        subject: SubjectId,
        model_value: i64,
    ) -> Result<Utf8PathBuf, PipelineError> {
        let file = self.dataset.model_file(model_value)?;
        Ok(self
            .subject_dir(subject)
            .join(&self.dataset.naming.model_folder)
            .join(file))
    }

    pub fn adjusted_model_path(
        &self,
        subject: SubjectId,
        model_value: i64,
    ) -> Result<Utf8PathBuf, PipelineError> {
        let model = self.model_path(subject, model_value)?;
        Ok(insert_suffix(&model, &self.dataset.adjustment_suffix))
    }

    pub fn load_descriptor_path(
        &self,
        item: &WorkItem,
        model_value: i64,
    ) -> Result<Utf8PathBuf, PipelineError> {
        let file = self.dataset.load_file(model_value)?;
        Ok(self.forces_dir(item).join(file))
    }

    pub fn adjustment_marker(&self) -> Utf8PathBuf {
        self.dataset.root.join(ADJUSTMENT_MARKER)
    }
}

fn insert_suffix(path: &Utf8Path, suffix: &str) -> Utf8PathBuf {
    let stem = path.file_stem().unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}{suffix}.{ext}"),
        None => format!("{stem}{suffix}"),
    };
    path.with_file_name(name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustmentRecord {
    pub dataset: String,
    pub completed_at: String,
    pub tool: String,
    pub adjusted: Vec<WorkItem>,
}

pub struct Store;

impl Store {
    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), PipelineError> {
        let parent = path
            .parent()
            .ok_or_else(|| PipelineError::Filesystem(format!("invalid destination {path}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix(".gaitflow-write")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        fs::write(temp.path(), content)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), PipelineError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), PipelineError> {
        let parent = dest
            .parent()
            .ok_or_else(|| PipelineError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix(".gaitflow-copy")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        fs::copy(source.as_std_path(), temp.path())
            .map_err(|err| PipelineError::Filesystem(format!("copy {source}: {err}")))?;
        temp.persist(dest.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn ensure_dir(path: &Utf8Path) -> Result<(), PipelineError> {
        fs::create_dir_all(path.as_std_path())
            .map_err(|err| PipelineError::Filesystem(format!("create {path}: {err}")))
    }

    pub fn remove_dir(path: &Utf8Path) -> Result<(), PipelineError> {
        match fs::remove_dir_all(path.as_std_path()) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(
                PipelineError::Filesystem(format!("remove {path}: {err}")),
            ),
            _ => Ok(()),
        }
    }

    pub fn read_adjustment(path: &Utf8Path) -> Result<Option<AdjustmentRecord>, PipelineError> {
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let record = serde_json::from_str(&content)
            .map_err(|err| PipelineError::Filesystem(format!("{path}: {err}")))?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_goes_before_extension() {
        let path = Utf8Path::new("/data/S01/models/gait2392.osim");
        assert_eq!(
            insert_suffix(path, "_adjusted"),
            Utf8PathBuf::from("/data/S01/models/gait2392_adjusted.osim")
        );
        assert_eq!(
            insert_suffix(Utf8Path::new("model"), "_rra"),
            Utf8PathBuf::from("model_rra")
        );
    }

    #[test]
    fn atomic_write_replaces_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("nested/out.txt")).unwrap();
        Store::write_bytes_atomic(&path, b"first").unwrap();
        Store::write_bytes_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(path.as_std_path()).unwrap(), b"second");
    }
}
