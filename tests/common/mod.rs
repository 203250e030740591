#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use gaitflow::config::{Dataset, DatasetDescriptor, DescriptorLoader};
use gaitflow::domain::{ContextParameter, Stage, WorkItem};
use gaitflow::engine::{SimulationEngine, StageRequest};
use gaitflow::error::PipelineError;
use gaitflow::orchestrator::{
    BatchOrchestrator, MemoryMonitor, MemorySample, ProgressEvent, ProgressSink, RunOptions,
};
use gaitflow::unit::DataUnit;

pub const STORAGE: &str = "header\nendheader\ntime\tvalue\n0.00\t1.0\n0.01\t2.0\n";

pub const MARKERS: &str = "PathFileType\t4\t(X/Y/Z)\tmarkers.trc\nDataRate\tCameraRate\tNumFrames\tNumMarkers\tUnits\n100\t100\t1\t1\tmm\nFrame#\tTime\tRASI\t\t\n\t\tX1\tY1\tZ1\n1\t0.00\t1.0\t2.0\t3.0\n";

/// Temporary dataset with two subjects, `assistance` in {1} and `speed` in {1, 2, 3}.
pub struct Fixture {
    _temp: TempDir,
    pub root: Utf8PathBuf,
    pub dataset: Dataset,
    assistance: Vec<i64>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(vec![1])
    }

    /// Like `new`, with a second model variant: `assistance` 2 selects `gait_exo.osim`.
    pub fn with_variants() -> Self {
        Self::build(vec![1, 2])
    }

    fn build(assistance: Vec<i64>) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let descriptor = DatasetDescriptor {
            name: "walking".to_string(),
            root: None,
            subjects: vec![1, 2],
            subject_prefix: "S".to_string(),
            context_parameters: vec![
                ContextParameter {
                    name: "assistance".to_string(),
                    values: assistance.clone(),
                },
                ContextParameter {
                    name: "speed".to_string(),
                    values: vec![1, 2, 3],
                },
            ],
            model_parameter: "assistance".to_string(),
            adjustment_suffix: "_adjusted".to_string(),
            models: BTreeMap::from([
                (1, "gait.osim".to_string()),
                (2, "gait_exo.osim".to_string()),
            ]),
            loads: BTreeMap::from([
                (1, "loads.xml".to_string()),
                (2, "loads_exo.xml".to_string()),
            ]),
            naming: Default::default(),
            tools: BTreeMap::new(),
            batch: Default::default(),
        };
        let dataset = DescriptorLoader::resolve_descriptor(descriptor, &root).unwrap();
        let fixture = Self {
            _temp: temp,
            root,
            dataset,
            assistance,
        };
        fixture.seed_inputs();
        fixture
    }

    pub fn items(&self) -> Vec<WorkItem> {
        let mut items = Vec::new();
        for subject in [1, 2] {
            for &assistance in &self.assistance {
                for speed in [1, 2, 3] {
                    items.push(WorkItem::new(subject, vec![assistance, speed]));
                }
            }
        }
        items
    }

    pub fn unit(&self, item: &WorkItem) -> DataUnit {
        DataUnit::new(item.clone(), &self.dataset).unwrap()
    }

    pub fn stage_dir(&self, item: &WorkItem, stage: Stage) -> Utf8PathBuf {
        self.unit(item).paths().stage_dir(stage).to_path_buf()
    }

    pub fn orchestrator(&self, engine: MockEngine) -> BatchOrchestrator<MockEngine, ScriptedMemory> {
        self.orchestrator_with_memory(engine, ScriptedMemory::default())
    }

    pub fn orchestrator_with_memory(
        &self,
        engine: MockEngine,
        memory: ScriptedMemory,
    ) -> BatchOrchestrator<MockEngine, ScriptedMemory> {
        BatchOrchestrator::new(self.dataset.clone(), engine, memory)
    }

    fn seed_inputs(&self) {
        for item in self.items() {
            let unit = self.unit(&item);
            let paths = unit.paths();
            write(&paths.markers_file, MARKERS);
            write(&paths.forces_file, STORAGE);
            write(&paths.load_descriptor, "<ExternalLoads/>");
            write(&paths.model, "<OpenSimDocument/>");
        }
    }
}

pub fn options(workers: usize) -> RunOptions {
    RunOptions {
        workers,
        skip_completed: false,
        min_available_memory: 0.10,
    }
}

pub fn write(path: &Utf8Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Writes plausible stage outputs and records every request.
#[derive(Default)]
pub struct MockEngine {
    pub calls: Mutex<Vec<StageRequest>>,
    failures: Vec<(Stage, Utf8PathBuf)>,
    panics: Vec<(Stage, Utf8PathBuf)>,
    silent: Vec<Stage>,
}

impl MockEngine {
    /// Fails `stage` for any request whose output lands beneath `under`.
    pub fn failing(mut self, stage: Stage, under: Utf8PathBuf) -> Self {
        self.failures.push((stage, under));
        self
    }

    pub fn panicking(mut self, stage: Stage, under: Utf8PathBuf) -> Self {
        self.panics.push((stage, under));
        self
    }

    /// Reports success for `stage` without writing anything.
    pub fn silent(mut self, stage: Stage) -> Self {
        self.silent.push(stage);
        self
    }

    pub fn requests(&self) -> Vec<StageRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.stage == stage)
            .count()
    }

    fn matches(rules: &[(Stage, Utf8PathBuf)], request: &StageRequest) -> bool {
        rules
            .iter()
            .any(|(stage, under)| *stage == request.stage && request.output_dir.starts_with(under))
    }
}

impl SimulationEngine for MockEngine {
    fn run(&self, request: &StageRequest) -> Result<(), PipelineError> {
        self.calls.lock().unwrap().push(request.clone());
        if Self::matches(&self.panics, request) {
            panic!("solver diverged");
        }
        if Self::matches(&self.failures, request) {
            return Err(PipelineError::StageFailed {
                stage: request.stage,
                message: "mock failure".to_string(),
            });
        }
        if self.silent.contains(&request.stage) {
            return Ok(());
        }

        let out = &request.output_dir;
        match request.stage {
            Stage::KinematicsFit => {
                write(&out.join("trial.mot"), STORAGE);
                write(&out.join("trial_ik_marker_locations.sto"), STORAGE);
            }
            Stage::ModelAdjustment => write(&out.join("trial_adjusted.osim"), "<OpenSimDocument/>"),
            Stage::ResidualReduction => {
                write(&out.join("trial_Kinematics_q.sto"), STORAGE);
                write(&out.join("trial_states.sto"), STORAGE);
                write(&out.join("trial_Kinematics_dudt.sto"), STORAGE);
            }
            Stage::InverseDynamics => write(&out.join("inverse_dynamics.sto"), STORAGE),
            Stage::BodyKinematics => write(&out.join("trial_BodyKinematics_pos_global.sto"), STORAGE),
            Stage::MuscleDrivenSimulation => write(&out.join("walk_states.sto"), STORAGE),
            Stage::JointSpaceForces => write(&out.join("joint_space_forces.sto"), STORAGE),
        }
        Ok(())
    }
}

/// Replays queued samples, then reports plenty of free memory.
#[derive(Default)]
pub struct ScriptedMemory {
    samples: Mutex<VecDeque<MemorySample>>,
}

impl ScriptedMemory {
    pub fn with_samples(samples: Vec<MemorySample>) -> Self {
        Self {
            samples: Mutex::new(samples.into()),
        }
    }
}

impl MemoryMonitor for ScriptedMemory {
    fn sample(&self) -> MemorySample {
        self.samples
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MemorySample {
                available: 8,
                total: 10,
            })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.message.clone())
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}
