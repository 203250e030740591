use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::domain::{ContextParameter, ContextParameterSpace, Stage, SubjectId, WorkItem};
use crate::error::PipelineError;

pub const DEFAULT_DESCRIPTOR: &str = "gaitflow.json";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetDescriptor {
    pub name: String,
    #[serde(default)]
    pub root: Option<Utf8PathBuf>,
    pub subjects: Vec<u32>,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    pub context_parameters: Vec<ContextParameter>,
    pub model_parameter: String,
    #[serde(default = "default_adjustment_suffix")]
    pub adjustment_suffix: String,
    pub models: BTreeMap<i64, String>,
    pub loads: BTreeMap<i64, String>,
    #[serde(default)]
    pub naming: Naming,
    #[serde(default)]
    pub tools: BTreeMap<Stage, String>,
    #[serde(default)]
    pub batch: BatchSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Naming {
    pub data_folder: String,
    pub model_folder: String,
    pub results_folder: String,
    pub motion_folder: String,
    pub forces_folder: String,
    pub markers_file: String,
    pub forces_file: String,
    pub stage_folders: BTreeMap<Stage, String>,
    pub ik_output_extension: String,
    pub ik_marker_suffix: String,
    pub rra_kinematics_suffix: String,
    pub rra_states_suffix: String,
    pub rra_accelerations_suffix: String,
    pub cmc_states_suffix: String,
    pub model_extension: String,
}

impl Default for Naming {
    fn default() -> Self {
        Self {
            data_folder: "data".to_string(),
            model_folder: "models".to_string(),
            results_folder: "results".to_string(),
            motion_folder: "motion".to_string(),
            forces_folder: "forces".to_string(),
            markers_file: "markers.trc".to_string(),
            forces_file: "grf.mot".to_string(),
            stage_folders: BTreeMap::new(),
            ik_output_extension: "mot".to_string(),
            ik_marker_suffix: "_ik_marker_locations.sto".to_string(),
            rra_kinematics_suffix: "_Kinematics_q.sto".to_string(),
            rra_states_suffix: "_states.sto".to_string(),
            rra_accelerations_suffix: "_Kinematics_dudt.sto".to_string(),
            cmc_states_suffix: "_states.sto".to_string(),
            model_extension: "osim".to_string(),
        }
    }
}

impl Naming {
    pub fn stage_folder(&self, stage: Stage) -> &str {
        match self.stage_folders.get(&stage) {
            Some(folder) => folder,
            None => default_stage_folder(stage),
        }
    }
}

fn default_stage_folder(stage: Stage) -> &'static str {
    match stage {
        Stage::KinematicsFit => "IK",
        Stage::ModelAdjustment => "RRA_adjust",
        Stage::ResidualReduction => "RRA",
        Stage::InverseDynamics => "ID",
        Stage::BodyKinematics => "BK",
        Stage::MuscleDrivenSimulation => "CMC",
        Stage::JointSpaceForces => "JSF",
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchSettings {
    pub workers: Option<usize>,
    pub min_available_memory: f64,
    pub skip_completed: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            workers: None,
            min_available_memory: 0.10,
            skip_completed: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub root: Utf8PathBuf,
    pub subjects: Vec<SubjectId>,
    pub subject_prefix: String,
    pub space: ContextParameterSpace,
    pub adjustment_suffix: String,
    pub models: BTreeMap<i64, String>,
    pub loads: BTreeMap<i64, String>,
    pub naming: Naming,
    pub tools: BTreeMap<Stage, String>,
    pub batch: BatchSettings,
}

impl Dataset {
    pub fn has_subject(&self, subject: SubjectId) -> bool {
        self.subjects.contains(&subject)
    }

    pub fn validate_item(&self, item: &WorkItem) -> Result<(), PipelineError> {
        if !self.has_subject(item.subject) {
            return Err(PipelineError::UnknownSubject(item.subject.0));
        }
        self.space.validate(&item.tuple)
    }

    pub fn model_file(&self, model_value: i64) -> Result<&str, PipelineError> {
        self.models
            .get(&model_value)
            .map(String::as_str)
            .ok_or_else(|| PipelineError::ValueOutOfRange {
                parameter: self.space.model_parameter().name.clone(),
                value: model_value,
            })
    }

    pub fn load_file(&self, model_value: i64) -> Result<&str, PipelineError> {
        self.loads
            .get(&model_value)
            .map(String::as_str)
            .ok_or_else(|| PipelineError::ValueOutOfRange {
                parameter: self.space.model_parameter().name.clone(),
                value: model_value,
            })
    }
}

pub struct DescriptorLoader;

impl DescriptorLoader {
    pub fn resolve(path: Option<&str>) -> Result<Dataset, PipelineError> {
        let descriptor_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(DEFAULT_DESCRIPTOR),
        };

        if path.is_none() && !descriptor_path.as_std_path().exists() {
            return Err(PipelineError::MissingDescriptor);
        }

        let content = fs::read_to_string(descriptor_path.as_std_path())
            .map_err(|_| PipelineError::DescriptorRead(descriptor_path.clone()))?;
        let descriptor: DatasetDescriptor = serde_json::from_str(&content)
            .map_err(|err| PipelineError::DescriptorParse(err.to_string()))?;

        let base = descriptor_path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        Self::resolve_descriptor(descriptor, base)
    }

    pub fn resolve_descriptor(
        descriptor: DatasetDescriptor,
        base: &Utf8Path,
    ) -> Result<Dataset, PipelineError> {
        if descriptor.name.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "dataset name must not be empty".to_string(),
            ));
        }
        if descriptor.subjects.is_empty() {
            return Err(PipelineError::Configuration(
                "dataset lists no subjects".to_string(),
            ));
        }
        let unique = descriptor.subjects.iter().collect::<BTreeSet<_>>();
        if unique.len() != descriptor.subjects.len() {
            return Err(PipelineError::Configuration(
                "subject ids must be unique".to_string(),
            ));
        }
        if descriptor.adjustment_suffix.is_empty() {
            return Err(PipelineError::Configuration(
                "adjustment suffix must not be empty".to_string(),
            ));
        }

        let space =
            ContextParameterSpace::new(descriptor.context_parameters, &descriptor.model_parameter)?;
        let model_parameter = space.model_parameter();
        for &value in &model_parameter.values {
            if !descriptor.models.contains_key(&value) {
                return Err(PipelineError::Configuration(format!(
                    "no model file mapped for {}={value}",
                    model_parameter.name
                )));
            }
            if !descriptor.loads.contains_key(&value) {
                return Err(PipelineError::Configuration(format!(
                    "no load descriptor mapped for {}={value}",
                    model_parameter.name
                )));
            }
        }

        check_memory_threshold(descriptor.batch.min_available_memory)?;
        if descriptor.batch.workers == Some(0) {
            return Err(PipelineError::Configuration(
                "workers must be at least 1".to_string(),
            ));
        }

        let root = match descriptor.root {
            Some(root) if root.is_absolute() => root,
            Some(root) => base.join(root),
            None => base.to_path_buf(),
        };

        Ok(Dataset {
            name: descriptor.name,
            root,
            subjects: descriptor.subjects.into_iter().map(SubjectId).collect(),
            subject_prefix: descriptor.subject_prefix,
            space,
            adjustment_suffix: descriptor.adjustment_suffix,
            models: descriptor.models,
            loads: descriptor.loads,
            naming: descriptor.naming,
            tools: descriptor.tools,
            batch: descriptor.batch,
        })
    }
}

pub fn check_memory_threshold(threshold: f64) -> Result<(), PipelineError> {
    if (0.0..1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(PipelineError::Configuration(format!(
            "min_available_memory must be in [0, 1), got {threshold}"
        )))
    }
}

fn default_subject_prefix() -> String {
    "S".to_string()
}

fn default_adjustment_suffix() -> String {
    "_adjusted".to_string()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const DESCRIPTOR: &str = r#"{
        "name": "exo-walking",
        "root": "dataset",
        "subjects": [1, 2],
        "context_parameters": [
            {"name": "assistance", "values": [1, 2]},
            {"name": "speed", "values": [1, 2, 3]}
        ],
        "model_parameter": "assistance",
        "models": {"1": "plain.osim", "2": "exo.osim"},
        "loads": {"1": "grf_plain.xml", "2": "grf_exo.xml"},
        "naming": {"stage_folders": {"inverse-dynamics": "InverseDynamics"}},
        "tools": {"kinematics-fit": "opensim-ik"}
    }"#;

    #[test]
    fn parse_descriptor_with_defaults() {
        let descriptor: DatasetDescriptor = serde_json::from_str(DESCRIPTOR).unwrap();
        let dataset =
            DescriptorLoader::resolve_descriptor(descriptor, Utf8Path::new("/data")).unwrap();

        assert_eq!(dataset.root, Utf8PathBuf::from("/data/dataset"));
        assert_eq!(dataset.subject_prefix, "S");
        assert_eq!(dataset.adjustment_suffix, "_adjusted");
        assert_eq!(dataset.space.combination_count(), 6);
        assert_eq!(dataset.naming.stage_folder(Stage::InverseDynamics), "InverseDynamics");
        assert_eq!(dataset.naming.stage_folder(Stage::ResidualReduction), "RRA");
        assert_eq!(dataset.tools.get(&Stage::KinematicsFit).unwrap(), "opensim-ik");
        assert_eq!(dataset.batch.min_available_memory, 0.10);
    }

    #[test]
    fn unmapped_model_value_is_rejected() {
        let mut descriptor: DatasetDescriptor = serde_json::from_str(DESCRIPTOR).unwrap();
        descriptor.models.remove(&2);
        let err = DescriptorLoader::resolve_descriptor(descriptor, Utf8Path::new(".")).unwrap_err();
        assert_matches!(err, PipelineError::Configuration(_));
    }

    #[test]
    fn unknown_model_parameter_is_rejected() {
        let mut descriptor: DatasetDescriptor = serde_json::from_str(DESCRIPTOR).unwrap();
        descriptor.model_parameter = "cadence".to_string();
        let err = DescriptorLoader::resolve_descriptor(descriptor, Utf8Path::new(".")).unwrap_err();
        assert_matches!(err, PipelineError::UnknownParameter(_));
    }
}
