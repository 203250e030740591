use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

use crate::domain::{Stage, WorkItem};

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("missing descriptor file gaitflow.json in current directory")]
    MissingDescriptor,

    #[error("failed to read descriptor at {0}")]
    DescriptorRead(Utf8PathBuf),

    #[error("failed to parse JSON descriptor: {0}")]
    DescriptorParse(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("unknown context parameter: {0}")]
    UnknownParameter(String),

    #[error("value {value} is not permitted for context parameter {parameter}")]
    ValueOutOfRange { parameter: String, value: i64 },

    #[error("subject {0} is not part of the dataset")]
    UnknownSubject(u32),

    #[error("invalid stage: {0}")]
    InvalidStage(String),

    #[error("cannot run {stage}: prerequisite stage {missing} has not completed")]
    PrerequisiteNotMet { stage: Stage, missing: Stage },

    #[error("model adjustment has already been completed for this dataset")]
    AlreadyAdjusted,

    #[error("malformed result layout in {folder}: expected exactly one output file, found {found}")]
    MalformedResultLayout { folder: Utf8PathBuf, found: usize },

    #[error("available memory below threshold: {available} of {total} bytes free")]
    ResourceExhausted { available: u64, total: u64 },

    #[error("{stage} failed: {message}")]
    StageFailed { stage: Stage, message: String },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("missing input file: {0}")]
    MissingInput(Utf8PathBuf),

    #[error("{stage} produced no output in {folder}")]
    MissingOutput { stage: Stage, folder: Utf8PathBuf },

    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("result not found: {0}")]
    MissingResult(String),

    #[error("failed to parse {path}: {message}")]
    ResultParse { path: Utf8PathBuf, message: String },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("batch stopped while processing {item}; remaining work saved to {checkpoint}: {source}")]
    RunAborted {
        item: WorkItem,
        checkpoint: Utf8PathBuf,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("result loading failed for {failed} unit(s)")]
    LoadFailed { failed: usize },
}

impl PipelineError {
    /// Whether a per-item failure stops dispatch of the remaining batch.
    pub fn aborts_batch(&self) -> bool {
        !matches!(
            self,
            PipelineError::PrerequisiteNotMet { .. } | PipelineError::MissingInput(_)
        )
    }

    pub fn originating(&self) -> &PipelineError {
        match self {
            PipelineError::RunAborted { source, .. } => source.originating(),
            other => other,
        }
    }
}
