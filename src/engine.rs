use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::domain::Stage;
use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageRequest {
    pub stage: Stage,
    pub model: Utf8PathBuf,
    pub inputs: Vec<Utf8PathBuf>,
    pub output_dir: Utf8PathBuf,
    pub load_descriptor: Option<Utf8PathBuf>,
}

pub trait SimulationEngine: Send + Sync {
    fn run(&self, request: &StageRequest) -> Result<(), PipelineError>;
}

#[derive(Clone)]
pub struct CommandEngine {
    tools: BTreeMap<Stage, Option<PathBuf>>,
}

impl CommandEngine {
    pub fn new(tools: &BTreeMap<Stage, String>) -> Self {
        let tools = tools
            .iter()
            .map(|(stage, name)| (*stage, resolve_tool(name)))
            .collect();
        Self { tools }
    }

    fn require(&self, stage: Stage) -> Result<&Path, PipelineError> {
        match self.tools.get(&stage) {
            Some(Some(path)) => Ok(path.as_path()),
            _ => Err(PipelineError::MissingTool(format!("no executable for {stage}"))),
        }
    }

    fn build_args(request: &StageRequest) -> Vec<String> {
        let mut args = Vec::with_capacity(request.inputs.len() + 3);
        args.push(request.model.to_string());
        args.extend(request.inputs.iter().map(|input| input.to_string()));
        args.push(request.output_dir.to_string());
        if let Some(load) = &request.load_descriptor {
            args.push(load.to_string());
        }
        args
    }
}

impl SimulationEngine for CommandEngine {
    fn run(&self, request: &StageRequest) -> Result<(), PipelineError> {
        let program = self.require(request.stage)?;
        let args = Self::build_args(request);
        tracing::debug!(stage = %request.stage, program = %program.display(), ?args, "invoking tool");

        let output = Command::new(program)
            .args(&args)
            .output()
            .map_err(|err| PipelineError::StageFailed {
                stage: request.stage,
                message: err.to_string(),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("{} exited with {}", program.display(), output.status)
        } else {
            stderr
        };
        Err(PipelineError::StageFailed {
            stage: request.stage,
            message,
        })
    }
}

fn resolve_tool(name: &str) -> Option<PathBuf> {
    let direct = PathBuf::from(name);
    if direct.is_absolute() {
        return direct.exists().then_some(direct);
    }
    find_in_path(name)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn request(stage: Stage, load: bool) -> StageRequest {
        StageRequest {
            stage,
            model: Utf8PathBuf::from("/m/model.osim"),
            inputs: vec![Utf8PathBuf::from("/d/a.sto"), Utf8PathBuf::from("/d/b.sto")],
            output_dir: Utf8PathBuf::from("/r/out"),
            load_descriptor: load.then(|| Utf8PathBuf::from("/d/loads.xml")),
        }
    }

    #[test]
    fn arguments_follow_positional_contract() {
        let args = CommandEngine::build_args(&request(Stage::ResidualReduction, true));
        assert_eq!(
            args,
            vec!["/m/model.osim", "/d/a.sto", "/d/b.sto", "/r/out", "/d/loads.xml"]
        );
        let args = CommandEngine::build_args(&request(Stage::JointSpaceForces, false));
        assert_eq!(args.last().map(String::as_str), Some("/r/out"));
    }

    #[test]
    fn unconfigured_stage_is_missing_tool() {
        let engine = CommandEngine::new(&BTreeMap::new());
        let err = engine.run(&request(Stage::KinematicsFit, false)).unwrap_err();
        assert_matches!(err, PipelineError::MissingTool(_));
    }
}
