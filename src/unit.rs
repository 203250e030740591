use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::config::Dataset;
use crate::domain::{Stage, WorkItem};
use crate::error::PipelineError;
use crate::fs_util;
use crate::store::DatasetLayout;

pub trait ArtifactProbe: Send + Sync {
    fn is_populated(&self, path: &Utf8Path) -> bool;
    fn sub_folders(&self, dir: &Utf8Path) -> Vec<Utf8PathBuf>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiskProbe;

impl ArtifactProbe for DiskProbe {
    fn is_populated(&self, path: &Utf8Path) -> bool {
        fs_util::is_populated(path)
    }

    fn sub_folders(&self, dir: &Utf8Path) -> Vec<Utf8PathBuf> {
        fs_util::list_dirs(dir).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPaths {
    pub raw_data_dir: Utf8PathBuf,
    pub motion_dir: Utf8PathBuf,
    pub forces_dir: Utf8PathBuf,
    pub markers_file: Utf8PathBuf,
    pub forces_file: Utf8PathBuf,
    pub load_descriptor: Utf8PathBuf,
    pub model: Utf8PathBuf,
    pub adjusted_model: Utf8PathBuf,
    pub results_dir: Utf8PathBuf,
    pub adjustment_marker: Utf8PathBuf,
    stage_dirs: Vec<Utf8PathBuf>,
}

impl UnitPaths {
    pub fn stage_dir(&self, stage: Stage) -> &Utf8Path {
        &self.stage_dirs[stage.index()]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageState {
    completed: [bool; Stage::ALL.len()],
    dataset_adjusted: bool,
}

impl StageState {
    pub fn is_complete(&self, stage: Stage) -> bool {
        self.completed[stage.index()]
    }

    pub fn dataset_adjusted(&self) -> bool {
        self.dataset_adjusted
    }

    pub fn completed_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| self.is_complete(*stage))
            .collect()
    }

    fn set(&mut self, stage: Stage, done: bool) {
        self.completed[stage.index()] = done;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub item: WorkItem,
    pub completed: Vec<Stage>,
    pub model_adjusted: bool,
}

#[derive(Debug, Clone)]
pub struct DataUnit {
    item: WorkItem,
    paths: UnitPaths,
    state: StageState,
}

impl DataUnit {
    pub fn new(item: WorkItem, dataset: &Dataset) -> Result<Self, PipelineError> {
        let paths = Self::construct_paths(&item, dataset)?;
        Ok(Self {
            item,
            paths,
            state: StageState::default(),
        })
    }

    pub fn construct_paths(item: &WorkItem, dataset: &Dataset) -> Result<UnitPaths, PipelineError> {
        dataset.validate_item(item)?;
        let layout = DatasetLayout::new(dataset);
        let model_value = dataset.space.model_value(&item.tuple);
        let motion_dir = layout.motion_dir(item);
        let forces_dir = layout.forces_dir(item);

        Ok(UnitPaths {
            raw_data_dir: layout.raw_data_dir(item),
            markers_file: motion_dir.join(&dataset.naming.markers_file),
            forces_file: forces_dir.join(&dataset.naming.forces_file),
            load_descriptor: layout.load_descriptor_path(item, model_value)?,
            model: layout.model_path(item.subject, model_value)?,
            adjusted_model: layout.adjusted_model_path(item.subject, model_value)?,
            results_dir: layout.results_dir(item),
            adjustment_marker: layout.adjustment_marker(),
            stage_dirs: Stage::ALL
                .into_iter()
                .map(|stage| layout.stage_dir(item, stage))
                .collect(),
            motion_dir,
            forces_dir,
        })
    }

    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    pub fn paths(&self) -> &UnitPaths {
        &self.paths
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn stage_completed(&self, stage: Stage) -> bool {
        self.state.is_complete(stage)
    }

    /// Model for stages after kinematics fitting. Once the dataset is adjusted
    /// this is always the adjusted model, present or not.
    pub fn active_model(&self) -> &Utf8Path {
        if self.state.dataset_adjusted {
            &self.paths.adjusted_model
        } else {
            &self.paths.model
        }
    }

    pub fn refresh_state(&mut self, probe: &dyn ArtifactProbe) {
        let mut state = StageState::default();
        for stage in Stage::ALL {
            state.set(stage, self.probe_stage(stage, probe));
        }
        state.dataset_adjusted = probe.is_populated(&self.paths.adjustment_marker);
        self.state = state;
    }

    pub fn refresh_stage(&mut self, stage: Stage, probe: &dyn ArtifactProbe) -> bool {
        let done = self.probe_stage(stage, probe);
        self.state.set(stage, done);
        done
    }

    pub fn status(&self) -> UnitStatus {
        UnitStatus {
            item: self.item.clone(),
            completed: self.state.completed_stages(),
            model_adjusted: self.state.dataset_adjusted,
        }
    }

    fn probe_stage(&self, stage: Stage, probe: &dyn ArtifactProbe) -> bool {
        match stage {
            Stage::ModelAdjustment => probe.is_populated(&self.paths.adjusted_model),
            Stage::InverseDynamics | Stage::JointSpaceForces => {
                // every sub-run folder must hold output
                let runs = probe.sub_folders(self.paths.stage_dir(stage));
                !runs.is_empty() && runs.iter().all(|run| probe.is_populated(run))
            }
            other => probe.is_populated(self.paths.stage_dir(other)),
        }
    }
}
