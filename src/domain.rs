use std::collections::HashMap;
use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    #[value(alias = "ik")]
    KinematicsFit,
    #[value(alias = "adjust")]
    ModelAdjustment,
    #[value(alias = "rra")]
    ResidualReduction,
    #[value(alias = "id")]
    InverseDynamics,
    #[value(alias = "bk")]
    BodyKinematics,
    #[value(alias = "cmc")]
    MuscleDrivenSimulation,
    #[value(alias = "jsf")]
    JointSpaceForces,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::KinematicsFit,
        Stage::ModelAdjustment,
        Stage::ResidualReduction,
        Stage::InverseDynamics,
        Stage::BodyKinematics,
        Stage::MuscleDrivenSimulation,
        Stage::JointSpaceForces,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::KinematicsFit => "kinematics-fit",
            Stage::ModelAdjustment => "model-adjustment",
            Stage::ResidualReduction => "residual-reduction",
            Stage::InverseDynamics => "inverse-dynamics",
            Stage::BodyKinematics => "body-kinematics",
            Stage::MuscleDrivenSimulation => "muscle-driven-simulation",
            Stage::JointSpaceForces => "joint-space-forces",
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            Stage::KinematicsFit => "ik",
            Stage::ModelAdjustment => "adjust",
            Stage::ResidualReduction => "rra",
            Stage::InverseDynamics => "id",
            Stage::BodyKinematics => "bk",
            Stage::MuscleDrivenSimulation => "cmc",
            Stage::JointSpaceForces => "jsf",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub u32);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterTuple(pub Vec<i64>);

impl ParameterTuple {
    pub fn values(&self) -> &[i64] {
        &self.0
    }
}

impl fmt::Display for ParameterTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self
            .0
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "[{values}]")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub subject: SubjectId,
    pub tuple: ParameterTuple,
}

impl WorkItem {
    pub fn new(subject: u32, tuple: Vec<i64>) -> Self {
        Self {
            subject: SubjectId(subject),
            tuple: ParameterTuple(tuple),
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject {} {}", self.subject, self.tuple)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextParameter {
    pub name: String,
    pub values: Vec<i64>,
}

impl ContextParameter {
    pub fn permits(&self, value: i64) -> bool {
        self.values.contains(&value)
    }
}

#[derive(Debug, Clone)]
pub struct ContextParameterSpace {
    parameters: Vec<ContextParameter>,
    index: HashMap<String, usize>,
    model_parameter: usize,
}

impl ContextParameterSpace {
    pub fn new(
        parameters: Vec<ContextParameter>,
        model_parameter: &str,
    ) -> Result<Self, PipelineError> {
        if parameters.is_empty() {
            return Err(PipelineError::Configuration(
                "at least one context parameter is required".to_string(),
            ));
        }

        let mut index = HashMap::with_capacity(parameters.len());
        for (position, parameter) in parameters.iter().enumerate() {
            if parameter.name.trim().is_empty() {
                return Err(PipelineError::Configuration(
                    "context parameter names must not be empty".to_string(),
                ));
            }
            if parameter.values.is_empty() {
                return Err(PipelineError::Configuration(format!(
                    "context parameter {} has no permitted values",
                    parameter.name
                )));
            }
            let mut sorted = parameter.values.clone();
            sorted.sort_unstable();
            sorted.dedup();
            if sorted.len() != parameter.values.len() {
                return Err(PipelineError::Configuration(format!(
                    "context parameter {} lists a value more than once",
                    parameter.name
                )));
            }
            if index.insert(parameter.name.clone(), position).is_some() {
                return Err(PipelineError::Configuration(format!(
                    "context parameter {} is declared twice",
                    parameter.name
                )));
            }
        }

        let mut space = Self {
            parameters,
            index,
            model_parameter: 0,
        };
        space.model_parameter = space.index_of(model_parameter)?;
        Ok(space)
    }

    pub fn parameters(&self) -> &[ContextParameter] {
        &self.parameters
    }

    pub fn index_of(&self, name: &str) -> Result<usize, PipelineError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| PipelineError::UnknownParameter(name.to_string()))
    }

    pub fn model_parameter(&self) -> &ContextParameter {
        &self.parameters[self.model_parameter]
    }

    pub fn model_value(&self, tuple: &ParameterTuple) -> i64 {
        tuple.0[self.model_parameter]
    }

    pub fn validate(&self, tuple: &ParameterTuple) -> Result<(), PipelineError> {
        if tuple.0.len() != self.parameters.len() {
            return Err(PipelineError::Configuration(format!(
                "parameter tuple {tuple} has {} values, expected {}",
                tuple.0.len(),
                self.parameters.len()
            )));
        }
        for (parameter, &value) in self.parameters.iter().zip(&tuple.0) {
            if !parameter.permits(value) {
                return Err(PipelineError::ValueOutOfRange {
                    parameter: parameter.name.clone(),
                    value,
                });
            }
        }
        Ok(())
    }

    pub fn combination_count(&self) -> usize {
        self.parameters
            .iter()
            .map(|parameter| parameter.values.len())
            .product()
    }

    pub fn combinations(&self) -> Vec<ParameterTuple> {
        let mut out = Vec::with_capacity(self.combination_count());
        let mut cursor = vec![0usize; self.parameters.len()];
        loop {
            out.push(ParameterTuple(
                cursor
                    .iter()
                    .zip(&self.parameters)
                    .map(|(&slot, parameter)| parameter.values[slot])
                    .collect(),
            ));

            let mut position = self.parameters.len();
            loop {
                if position == 0 {
                    return out;
                }
                position -= 1;
                cursor[position] += 1;
                if cursor[position] < self.parameters[position].values.len() {
                    break;
                }
                cursor[position] = 0;
            }
        }
    }
}
