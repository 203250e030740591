use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Dataset;
use crate::domain::Stage;
use crate::engine::{SimulationEngine, StageRequest};
use crate::error::PipelineError;
use crate::fs_util;
use crate::store::Store;
use crate::unit::{ArtifactProbe, DataUnit, StageState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prerequisite {
    Stage(Stage),
    DatasetAdjusted,
    /// At least one of the listed stages; the first is preferred.
    AnyOf(&'static [Stage]),
}

pub fn prerequisites(stage: Stage) -> &'static [Prerequisite] {
    match stage {
        Stage::KinematicsFit => &[],
        Stage::ModelAdjustment => &[Prerequisite::Stage(Stage::KinematicsFit)],
        Stage::ResidualReduction => &[
            Prerequisite::Stage(Stage::KinematicsFit),
            Prerequisite::DatasetAdjusted,
        ],
        Stage::InverseDynamics => &[Prerequisite::Stage(Stage::ResidualReduction)],
        Stage::BodyKinematics => &[Prerequisite::AnyOf(&[
            Stage::ResidualReduction,
            Stage::KinematicsFit,
        ])],
        Stage::MuscleDrivenSimulation => &[Prerequisite::Stage(Stage::ResidualReduction)],
        Stage::JointSpaceForces => &[
            Prerequisite::Stage(Stage::ResidualReduction),
            Prerequisite::Stage(Stage::InverseDynamics),
        ],
    }
}

pub fn check_prerequisites(stage: Stage, state: &StageState) -> Result<(), PipelineError> {
    for prerequisite in prerequisites(stage) {
        let missing = match *prerequisite {
            Prerequisite::Stage(required) => (!state.is_complete(required)).then_some(required),
            Prerequisite::DatasetAdjusted => {
                (!state.dataset_adjusted()).then_some(Stage::ModelAdjustment)
            }
            Prerequisite::AnyOf(options) => {
                let satisfied = options.iter().any(|option| state.is_complete(*option));
                if satisfied { None } else { options.last().copied() }
            }
        };
        if let Some(missing) = missing {
            return Err(PipelineError::PrerequisiteNotMet { stage, missing });
        }
    }
    Ok(())
}

pub struct StageRunner<'a, E: SimulationEngine + ?Sized> {
    dataset: &'a Dataset,
    engine: &'a E,
    probe: &'a dyn ArtifactProbe,
}

impl<E: SimulationEngine + ?Sized> Clone for StageRunner<'_, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: SimulationEngine + ?Sized> Copy for StageRunner<'_, E> {}

impl<'a, E: SimulationEngine + ?Sized> StageRunner<'a, E> {
    pub fn new(dataset: &'a Dataset, engine: &'a E, probe: &'a dyn ArtifactProbe) -> Self {
        Self {
            dataset,
            engine,
            probe,
        }
    }

    pub fn dataset(&self) -> &'a Dataset {
        self.dataset
    }

    pub fn probe(&self) -> &'a dyn ArtifactProbe {
        self.probe
    }

    pub fn run_stage(&self, unit: &mut DataUnit, stage: Stage) -> Result<(), PipelineError> {
        if stage == Stage::ModelAdjustment {
            return self.adjust_model(unit);
        }

        check_prerequisites(stage, &unit.state())?;
        let requests = self.build_requests(unit, stage)?;

        tracing::debug!(item = %unit.item(), %stage, runs = requests.len(), "running stage");
        let stage_dir = unit.paths().stage_dir(stage).to_path_buf();
        let fresh = !stage_dir.as_std_path().exists();
        let mut created = Vec::new();
        for request in &requests {
            if let Err(err) = self.run_request(request, &mut created) {
                discard(if fresh { std::slice::from_ref(&stage_dir) } else { &created[..] });
                return Err(err);
            }
        }

        self.confirm_output(unit, stage)
    }

    fn run_request(
        &self,
        request: &StageRequest,
        created: &mut Vec<Utf8PathBuf>,
    ) -> Result<(), PipelineError> {
        if !request.output_dir.as_std_path().exists() {
            created.push(request.output_dir.clone());
        }
        Store::ensure_dir(&request.output_dir)?;
        self.engine.run(request)?;
        if !self.probe.is_populated(&request.output_dir) {
            return Err(PipelineError::MissingOutput {
                stage: request.stage,
                folder: request.output_dir.clone(),
            });
        }
        Ok(())
    }

    pub fn adjust_model(&self, unit: &mut DataUnit) -> Result<(), PipelineError> {
        if unit.state().dataset_adjusted() {
            return Err(PipelineError::AlreadyAdjusted);
        }
        if !unit.stage_completed(Stage::KinematicsFit) {
            self.run_stage(unit, Stage::KinematicsFit)?;
        }
        check_prerequisites(Stage::ModelAdjustment, &unit.state())?;

        let paths = unit.paths();
        let ik_output = self.ik_output(unit)?;
        let forces = self.require_input(&paths.forces_file)?;
        let output_dir = paths.stage_dir(Stage::ModelAdjustment).to_path_buf();
        let request = StageRequest {
            stage: Stage::ModelAdjustment,
            model: self.require_input(&paths.model)?,
            inputs: vec![ik_output, forces],
            output_dir: output_dir.clone(),
            load_descriptor: Some(self.require_input(&paths.load_descriptor)?),
        };

        tracing::info!(item = %unit.item(), model = %paths.model, "adjusting model");
        Store::ensure_dir(&output_dir)?;
        self.engine.run(&request)?;

        let produced = fs_util::files_with_ext(&output_dir, &self.dataset.naming.model_extension)?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::MissingOutput {
                stage: Stage::ModelAdjustment,
                folder: output_dir.clone(),
            })?;
        Store::copy_file_atomic(&produced, &paths.adjusted_model)?;

        self.confirm_output(unit, Stage::ModelAdjustment)
    }

    fn confirm_output(&self, unit: &mut DataUnit, stage: Stage) -> Result<(), PipelineError> {
        if unit.refresh_stage(stage, self.probe) {
            return Ok(());
        }
        let folder = match stage {
            Stage::ModelAdjustment => unit.paths().adjusted_model.clone(),
            other => unit.paths().stage_dir(other).to_path_buf(),
        };
        Err(PipelineError::MissingOutput { stage, folder })
    }

    fn build_requests(
        &self,
        unit: &DataUnit,
        stage: Stage,
    ) -> Result<Vec<StageRequest>, PipelineError> {
        let paths = unit.paths();
        let output_dir = paths.stage_dir(stage).to_path_buf();
        let active_model = || self.require_input(unit.active_model());

        let requests = match stage {
            Stage::KinematicsFit => vec![StageRequest {
                stage,
                model: self.require_input(&paths.model)?,
                inputs: vec![self.require_input(&paths.markers_file)?],
                output_dir,
                load_descriptor: None,
            }],
            Stage::ResidualReduction => vec![StageRequest {
                stage,
                model: active_model()?,
                inputs: vec![self.ik_output(unit)?, self.require_input(&paths.forces_file)?],
                output_dir,
                load_descriptor: Some(self.require_input(&paths.load_descriptor)?),
            }],
            Stage::InverseDynamics => {
                let model = active_model()?;
                let forces = self.require_input(&paths.forces_file)?;
                let load = self.require_input(&paths.load_descriptor)?;
                self.rra_subruns(unit)?
                    .into_iter()
                    .map(|(name, kinematics)| StageRequest {
                        stage,
                        model: model.clone(),
                        inputs: vec![kinematics, forces.clone()],
                        output_dir: output_dir.join(name),
                        load_descriptor: Some(load.clone()),
                    })
                    .collect()
            }
            Stage::BodyKinematics => {
                let kinematics = if unit.stage_completed(Stage::ResidualReduction) {
                    let (_, kinematics) = self.first_rra_subrun(unit)?;
                    kinematics
                } else {
                    self.ik_output(unit)?
                };
                vec![StageRequest {
                    stage,
                    model: active_model()?,
                    inputs: vec![kinematics],
                    output_dir,
                    load_descriptor: None,
                }]
            }
            Stage::MuscleDrivenSimulation => {
                let (_, kinematics) = self.first_rra_subrun(unit)?;
                vec![StageRequest {
                    stage,
                    model: active_model()?,
                    inputs: vec![kinematics, self.require_input(&paths.forces_file)?],
                    output_dir,
                    load_descriptor: Some(self.require_input(&paths.load_descriptor)?),
                }]
            }
            Stage::JointSpaceForces => {
                let model = active_model()?;
                let forces = self.require_input(&paths.forces_file)?;
                let naming = &self.dataset.naming;
                let rra_dir = paths.stage_dir(Stage::ResidualReduction);
                let id_dir = paths.stage_dir(Stage::InverseDynamics);
                let mut requests = Vec::new();
                for (name, _) in self.rra_subruns(unit)? {
                    let states = rra_dir.join(format!("{name}{}", naming.rra_states_suffix));
                    let accelerations =
                        rra_dir.join(format!("{name}{}", naming.rra_accelerations_suffix));
                    let id_output = single_output(&id_dir.join(&name))?;
                    requests.push(StageRequest {
                        stage,
                        model: model.clone(),
                        inputs: vec![
                            forces.clone(),
                            self.require_input(&states)?,
                            self.require_input(&accelerations)?,
                            id_output,
                        ],
                        output_dir: output_dir.join(&name),
                        load_descriptor: None,
                    });
                }
                requests
            }
            Stage::ModelAdjustment => unreachable!("model adjustment has its own entry point"),
        };
        Ok(requests)
    }

    fn require_input(&self, path: &Utf8Path) -> Result<Utf8PathBuf, PipelineError> {
        if self.probe.is_populated(path) {
            Ok(path.to_path_buf())
        } else {
            Err(PipelineError::MissingInput(path.to_path_buf()))
        }
    }

    fn ik_output(&self, unit: &DataUnit) -> Result<Utf8PathBuf, PipelineError> {
        let dir = unit.paths().stage_dir(Stage::KinematicsFit);
        fs_util::files_with_ext(dir, &self.dataset.naming.ik_output_extension)?
            .into_iter()
            .find(|path| !path.as_str().ends_with(&self.dataset.naming.ik_marker_suffix))
            .ok_or_else(|| PipelineError::MissingInput(dir.to_path_buf()))
    }

    fn rra_subruns(&self, unit: &DataUnit) -> Result<Vec<(String, Utf8PathBuf)>, PipelineError> {
        let dir = unit.paths().stage_dir(Stage::ResidualReduction);
        let suffix = &self.dataset.naming.rra_kinematics_suffix;
        let subruns = fs_util::files_with_suffix(dir, suffix)?
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.strip_suffix(suffix.as_str())?.to_string();
                Some((name, path))
            })
            .collect::<Vec<_>>();
        if subruns.is_empty() {
            return Err(PipelineError::MissingInput(dir.to_path_buf()));
        }
        Ok(subruns)
    }

    fn first_rra_subrun(&self, unit: &DataUnit) -> Result<(String, Utf8PathBuf), PipelineError> {
        let mut subruns = self.rra_subruns(unit)?;
        Ok(subruns.remove(0))
    }
}

fn discard(folders: &[Utf8PathBuf]) {
    for folder in folders {
        if let Err(err) = Store::remove_dir(folder) {
            tracing::warn!(%folder, error = %err, "could not remove partial output");
        }
    }
}

pub fn single_output(folder: &Utf8Path) -> Result<Utf8PathBuf, PipelineError> {
    let mut files = fs_util::list_files(folder)?;
    if files.len() != 1 {
        return Err(PipelineError::MalformedResultLayout {
            folder: folder.to_path_buf(),
            found: files.len(),
        });
    }
    Ok(files.remove(0))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn kinematics_fit_has_no_prerequisites() {
        assert!(check_prerequisites(Stage::KinematicsFit, &StageState::default()).is_ok());
    }

    #[test]
    fn dependent_stages_name_the_missing_stage() {
        let state = StageState::default();
        assert_matches!(
            check_prerequisites(Stage::InverseDynamics, &state),
            Err(PipelineError::PrerequisiteNotMet {
                stage: Stage::InverseDynamics,
                missing: Stage::ResidualReduction
            })
        );
        assert_matches!(
            check_prerequisites(Stage::BodyKinematics, &state),
            Err(PipelineError::PrerequisiteNotMet {
                missing: Stage::KinematicsFit,
                ..
            })
        );
        assert_matches!(
            check_prerequisites(Stage::JointSpaceForces, &state),
            Err(PipelineError::PrerequisiteNotMet {
                missing: Stage::ResidualReduction,
                ..
            })
        );
    }

    #[test]
    fn every_stage_except_fitting_depends_on_something() {
        for stage in Stage::ALL {
            assert_eq!(
                prerequisites(stage).is_empty(),
                stage == Stage::KinematicsFit,
                "{stage}"
            );
        }
    }
}
