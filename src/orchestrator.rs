use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread;

use camino::{Utf8Path, Utf8PathBuf};
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use sysinfo::System;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{self, CHECKPOINT_VERSION, Checkpoint, CheckpointOptions, FailureRecord};
use crate::config::{self, BatchSettings, Dataset};
use crate::domain::{ContextParameterSpace, Stage, SubjectId, WorkItem};
use crate::engine::SimulationEngine;
use crate::error::PipelineError;
use crate::runner::StageRunner;
use crate::store::{AdjustmentRecord, DatasetLayout, Store};
use crate::unit::{ArtifactProbe, DataUnit, DiskProbe, UnitStatus};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub processed: usize,
    pub total: usize,
}

impl ProgressEvent {
    fn new(message: impl Into<String>, processed: usize, total: usize) -> Self {
        Self {
            message: message.into(),
            processed,
            total,
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub workers: usize,
    pub skip_completed: bool,
    pub min_available_memory: f64,
}

impl RunOptions {
    pub fn from_settings(settings: &BatchSettings) -> Self {
        Self {
            workers: settings.workers.unwrap_or_else(default_workers),
            skip_completed: settings.skip_completed,
            min_available_memory: settings.min_available_memory,
        }
    }
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub available: u64,
    pub total: u64,
}

pub trait MemoryMonitor: Send + Sync {
    fn sample(&self) -> MemorySample;
}

pub struct SystemMemory {
    system: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMonitor for SystemMemory {
    fn sample(&self) -> MemorySample {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_memory();
        MemorySample {
            available: system.available_memory(),
            total: system.total_memory(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug)]
pub struct ItemFailure {
    pub item: WorkItem,
    pub error: PipelineError,
}

#[derive(Debug)]
pub struct BatchReport {
    pub total: usize,
    pub completed: Vec<WorkItem>,
    pub failed: Vec<ItemFailure>,
    pub checkpoint: Option<Utf8PathBuf>,
}

pub fn expand_work_list(subjects: &[SubjectId], space: &ContextParameterSpace) -> Vec<WorkItem> {
    let combinations = space.combinations();
    let mut items = Vec::with_capacity(subjects.len() * combinations.len());
    for subject in subjects {
        for tuple in &combinations {
            items.push(WorkItem {
                subject: *subject,
                tuple: tuple.clone(),
            });
        }
    }
    items
}

struct ItemFinished {
    index: usize,
    outcome: Result<(), PipelineError>,
}

struct BatchTracker {
    statuses: Vec<ItemStatus>,
    processed: usize,
    failures: Vec<(usize, PipelineError)>,
    abort: Option<(usize, PipelineError)>,
}

impl BatchTracker {
    fn new(total: usize) -> Self {
        Self {
            statuses: vec![ItemStatus::Pending; total],
            processed: 0,
            failures: Vec::new(),
            abort: None,
        }
    }
}

pub struct BatchOrchestrator<E: SimulationEngine, M: MemoryMonitor> {
    dataset: Dataset,
    engine: E,
    memory: M,
    probe: Box<dyn ArtifactProbe>,
}

impl<E: SimulationEngine, M: MemoryMonitor> BatchOrchestrator<E, M> {
    pub fn new(dataset: Dataset, engine: E, memory: M) -> Self {
        Self {
            dataset,
            engine,
            memory,
            probe: Box::new(DiskProbe),
        }
    }

    pub fn with_probe(mut self, probe: impl ArtifactProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn work_list(&self, subjects: Option<&[SubjectId]>) -> Result<Vec<WorkItem>, PipelineError> {
        let subjects = match subjects {
            Some(subjects) => {
                for subject in subjects {
                    if !self.dataset.has_subject(*subject) {
                        return Err(PipelineError::UnknownSubject(subject.0));
                    }
                }
                subjects
            }
            None => &self.dataset.subjects,
        };
        Ok(expand_work_list(subjects, &self.dataset.space))
    }

    pub fn status(&self, items: &[WorkItem]) -> Result<Vec<UnitStatus>, PipelineError> {
        items
            .iter()
            .map(|item| {
                let mut unit = DataUnit::new(item.clone(), &self.dataset)?;
                unit.refresh_state(self.probe.as_ref());
                Ok(unit.status())
            })
            .collect()
    }

    pub fn adjust_models(&self, sink: &dyn ProgressSink) -> Result<AdjustmentRecord, PipelineError> {
        let marker = self.dataset_marker();
        if Store::read_adjustment(&marker)?.is_some() {
            return Err(PipelineError::AlreadyAdjusted);
        }

        let representatives = self.adjustment_representatives();
        let total = representatives.len();
        let runner = StageRunner::new(&self.dataset, &self.engine, self.probe.as_ref());
        info!(dataset = %self.dataset.name, variants = total, "starting model adjustment");
        sink.event(ProgressEvent::new("Beginning processing.", 0, total));

        let mut adjusted = Vec::with_capacity(total);
        for (processed, item) in representatives.into_iter().enumerate() {
            let mut unit = DataUnit::new(item.clone(), &self.dataset)?;
            unit.refresh_state(self.probe.as_ref());
            if unit.stage_completed(Stage::ModelAdjustment) {
                debug!(%item, "adjusted model already present");
            } else if let Err(err) = runner.adjust_model(&mut unit) {
                error!(%item, error = %err, "model adjustment failed");
                sink.event(ProgressEvent::new(
                    format!("Failed on the following element: {item}"),
                    processed,
                    total,
                ));
                return Err(err);
            }
            sink.event(ProgressEvent::new(
                format!("Adjusted model for {item}"),
                processed + 1,
                total,
            ));
            adjusted.push(item);
        }

        let record = AdjustmentRecord {
            dataset: self.dataset.name.clone(),
            completed_at: checkpoint::timestamp(),
            tool: self
                .dataset
                .tools
                .get(&Stage::ModelAdjustment)
                .cloned()
                .unwrap_or_default(),
            adjusted,
        };
        Store::write_json_atomic(&marker, &record)?;
        info!(marker = %marker, "model adjustment complete");
        sink.event(ProgressEvent::new("Data processing complete.", total, total));
        Ok(record)
    }

    /// Missing prerequisites and inputs fail only their item; any other error
    /// stops dispatch, drains in-flight items and checkpoints everything unfinished.
    pub fn run(
        &self,
        stages: &[Stage],
        work: &[WorkItem],
        options: &RunOptions,
        sink: &dyn ProgressSink,
    ) -> Result<BatchReport, PipelineError> {
        self.validate_batch(stages, work)?;
        config::check_memory_threshold(options.min_available_memory)?;
        let total = work.len();
        let workers = options.workers.clamp(1, total.max(1));
        info!(
            dataset = %self.dataset.name,
            items = total,
            workers,
            stages = ?stages,
            "starting batch"
        );
        sink.event(ProgressEvent::new("Beginning processing.", 0, total));

        let runner = StageRunner::new(&self.dataset, &self.engine, self.probe.as_ref());
        let skip_completed = options.skip_completed;
        let mut tracker = BatchTracker::new(total);

        thread::scope(|scope| {
            let (job_tx, job_rx) = crossbeam_channel::unbounded::<(usize, WorkItem)>();
            let (event_tx, event_rx) = crossbeam_channel::unbounded::<ItemFinished>();
            for _ in 0..workers {
                let jobs = job_rx.clone();
                let events = event_tx.clone();
                scope.spawn(move || {
                    for (index, item) in jobs.iter() {
                        let outcome = process_item(runner, &item, stages, skip_completed);
                        if events.send(ItemFinished { index, outcome }).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(event_tx);

            self.supervise(work, workers, options, &job_tx, &event_rx, &mut tracker, sink);
            drop(job_tx);
        });

        self.finish(stages, work, options, tracker, sink)
    }

    pub fn resume(
        &self,
        path: &Utf8Path,
        overrides: Option<&RunOptions>,
        sink: &dyn ProgressSink,
    ) -> Result<BatchReport, PipelineError> {
        let checkpoint = Checkpoint::load(path)?;
        info!(checkpoint = %path, pending = checkpoint.pending.len(), "resuming batch");
        self.resume_from(checkpoint, overrides, sink)
    }

    pub fn resume_from(
        &self,
        checkpoint: Checkpoint,
        overrides: Option<&RunOptions>,
        sink: &dyn ProgressSink,
    ) -> Result<BatchReport, PipelineError> {
        if checkpoint.dataset != self.dataset.name {
            return Err(PipelineError::Checkpoint(format!(
                "checkpoint belongs to dataset {}, not {}",
                checkpoint.dataset, self.dataset.name
            )));
        }
        let options = match overrides {
            Some(options) => options.clone(),
            None => RunOptions {
                workers: checkpoint.options.workers.max(1),
                skip_completed: checkpoint.options.skip_completed,
                min_available_memory: self.dataset.batch.min_available_memory,
            },
        };
        self.run(&checkpoint.stages, &checkpoint.pending, &options, sink)
    }

    #[allow(clippy::too_many_arguments)]
    fn supervise(
        &self,
        work: &[WorkItem],
        workers: usize,
        options: &RunOptions,
        jobs: &Sender<(usize, WorkItem)>,
        events: &Receiver<ItemFinished>,
        tracker: &mut BatchTracker,
        sink: &dyn ProgressSink,
    ) {
        let total = work.len();
        let mut next = 0;
        let mut in_flight = 0;

        loop {
            while tracker.abort.is_none() && in_flight < workers && next < total {
                if jobs.send((next, work[next].clone())).is_err() {
                    break;
                }
                tracker.statuses[next] = ItemStatus::InProgress;
                next += 1;
                in_flight += 1;
            }
            if in_flight == 0 {
                break;
            }
            let Ok(finished) = events.recv() else {
                break;
            };
            in_flight -= 1;
            tracker.processed += 1;

            let index = finished.index;
            let item = &work[index];
            match finished.outcome {
                Ok(()) => {
                    tracker.statuses[index] = ItemStatus::Completed;
                    debug!(%item, "item completed");
                }
                Err(err) => {
                    tracker.statuses[index] = ItemStatus::Failed;
                    if err.aborts_batch() && tracker.abort.is_none() {
                        error!(%item, error = %err, "stopping dispatch");
                        tracker.abort = Some((index, err));
                    } else {
                        warn!(%item, error = %err, "item failed");
                        tracker.failures.push((index, err));
                    }
                }
            }
            sink.event(ProgressEvent::new(
                format!("Processed {item}"),
                tracker.processed,
                total,
            ));

            if tracker.abort.is_none()
                && let Err(err) = self.check_memory(options.min_available_memory)
            {
                error!(%item, error = %err, "memory guard tripped");
                tracker.abort = Some((index, err));
            }
        }
    }

    fn finish(
        &self,
        stages: &[Stage],
        work: &[WorkItem],
        options: &RunOptions,
        tracker: BatchTracker,
        sink: &dyn ProgressSink,
    ) -> Result<BatchReport, PipelineError> {
        let BatchTracker {
            statuses,
            processed,
            failures,
            abort,
        } = tracker;
        let total = work.len();
        let (completed, pending): (Vec<_>, Vec<_>) = work
            .iter()
            .zip(&statuses)
            .partition(|(_, status)| **status == ItemStatus::Completed);
        let completed = completed
            .into_iter()
            .map(|(item, _)| item.clone())
            .collect::<Vec<_>>();
        let pending = pending
            .into_iter()
            .map(|(item, _)| item.clone())
            .collect::<Vec<_>>();

        if let Some((index, cause)) = abort {
            let item = work[index].clone();
            let failure = FailureRecord {
                item: item.clone(),
                message: cause.to_string(),
            };
            let checkpoint =
                self.save_checkpoint(stages, pending, completed.len(), Some(failure), options)?;
            sink.event(ProgressEvent::new(
                format!("Failed on the following element: {item}"),
                processed,
                total,
            ));
            error!(%item, checkpoint = %checkpoint, error = %cause, "batch aborted");
            return Err(PipelineError::RunAborted {
                item,
                checkpoint,
                source: Box::new(cause),
            });
        }

        let failed = failures
            .into_iter()
            .map(|(index, error)| ItemFailure {
                item: work[index].clone(),
                error,
            })
            .collect::<Vec<_>>();
        let checkpoint = if pending.is_empty() {
            None
        } else {
            let failure = failed.first().map(|failure| FailureRecord {
                item: failure.item.clone(),
                message: failure.error.to_string(),
            });
            let path =
                self.save_checkpoint(stages, pending, completed.len(), failure, options)?;
            warn!(failed = failed.len(), checkpoint = %path, "batch finished with failures");
            Some(path)
        };

        info!(completed = completed.len(), failed = failed.len(), "batch finished");
        sink.event(ProgressEvent::new("Data processing complete.", processed, total));
        Ok(BatchReport {
            total,
            completed,
            failed,
            checkpoint,
        })
    }

    fn save_checkpoint(
        &self,
        stages: &[Stage],
        pending: Vec<WorkItem>,
        completed: usize,
        failure: Option<FailureRecord>,
        options: &RunOptions,
    ) -> Result<Utf8PathBuf, PipelineError> {
        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            dataset: self.dataset.name.clone(),
            created_at: checkpoint::timestamp(),
            stages: stages.to_vec(),
            pending,
            completed,
            failure,
            options: CheckpointOptions {
                workers: options.workers,
                skip_completed: options.skip_completed,
            },
        };
        checkpoint.save(&self.dataset.root)
    }

    fn validate_batch(&self, stages: &[Stage], work: &[WorkItem]) -> Result<(), PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::InvalidStage("no stages requested".to_string()));
        }
        if stages.contains(&Stage::ModelAdjustment) {
            return Err(PipelineError::InvalidStage(
                "model-adjustment runs in the sequential adjustment pass, not in a batch"
                    .to_string(),
            ));
        }
        let mut seen_stages = HashSet::new();
        for stage in stages {
            if !seen_stages.insert(*stage) {
                return Err(PipelineError::InvalidStage(format!("{stage} requested twice")));
            }
        }

        let mut seen_items = HashSet::with_capacity(work.len());
        for item in work {
            self.dataset.validate_item(item)?;
            if !seen_items.insert(item) {
                return Err(PipelineError::Configuration(format!(
                    "{item} appears more than once in the work list"
                )));
            }
        }
        Ok(())
    }

    fn check_memory(&self, threshold: f64) -> Result<(), PipelineError> {
        if threshold <= 0.0 {
            return Ok(());
        }
        let sample = self.memory.sample();
        if sample.total == 0 {
            return Ok(());
        }
        if (sample.available as f64) < threshold * sample.total as f64 {
            return Err(PipelineError::ResourceExhausted {
                available: sample.available,
                total: sample.total,
            });
        }
        Ok(())
    }

    fn dataset_marker(&self) -> Utf8PathBuf {
        DatasetLayout::new(&self.dataset).adjustment_marker()
    }

    fn adjustment_representatives(&self) -> Vec<WorkItem> {
        let space = &self.dataset.space;
        let combinations = space.combinations();
        let mut items = Vec::new();
        for subject in &self.dataset.subjects {
            for &value in &space.model_parameter().values {
                let tuple = combinations
                    .iter()
                    .find(|tuple| space.model_value(tuple) == value);
                if let Some(tuple) = tuple {
                    items.push(WorkItem {
                        subject: *subject,
                        tuple: tuple.clone(),
                    });
                }
            }
        }
        items
    }
}

fn process_item<E: SimulationEngine + ?Sized>(
    runner: StageRunner<'_, E>,
    item: &WorkItem,
    stages: &[Stage],
    skip_completed: bool,
) -> Result<(), PipelineError> {
    panic::catch_unwind(AssertUnwindSafe(|| {
        let mut unit = DataUnit::new(item.clone(), runner.dataset())?;
        unit.refresh_state(runner.probe());
        for &stage in stages {
            if skip_completed && unit.stage_completed(stage) {
                debug!(%item, %stage, "output present, skipping");
                continue;
            }
            runner.run_stage(&mut unit, stage)?;
        }
        Ok(())
    }))
    .unwrap_or_else(|payload| Err(PipelineError::WorkerPanicked(panic_message(payload))))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
