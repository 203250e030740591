use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Dataset;
use crate::domain::{Stage, WorkItem};
use crate::error::PipelineError;
use crate::fs_util;
use crate::runner::single_output;
use crate::unit::DataUnit;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum ResultCategory {
    RawForces,
    InputMarkers,
    KinematicsFit,
    OutputMarkers,
    MuscleDrivenStates,
    InverseDynamics,
}

impl ResultCategory {
    pub const ALL: [ResultCategory; 6] = [
        ResultCategory::RawForces,
        ResultCategory::InputMarkers,
        ResultCategory::KinematicsFit,
        ResultCategory::OutputMarkers,
        ResultCategory::MuscleDrivenStates,
        ResultCategory::InverseDynamics,
    ];
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub labels: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl TimeSeries {
    pub fn read(path: &Utf8Path) -> Result<Self, PipelineError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| PipelineError::Filesystem(format!("read {path}: {err}")))?;
        match path.extension() {
            Some(ext) if ext.eq_ignore_ascii_case("trc") => Self::parse_markers(path, &content),
            _ => Self::parse_storage(path, &content),
        }
    }

    pub fn column(&self, label: &str) -> Option<Vec<f64>> {
        let index = self.labels.iter().position(|name| name == label)?;
        Some(self.rows.iter().map(|row| row[index]).collect())
    }

    pub fn parse_storage(path: &Utf8Path, content: &str) -> Result<Self, PipelineError> {
        let lines = content.lines().collect::<Vec<_>>();
        let body_start = lines
            .iter()
            .position(|line| line.trim().eq_ignore_ascii_case("endheader"))
            .map(|index| index + 1)
            .unwrap_or(0);
        let body = lines[body_start..].join("\n");

        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(body.as_bytes());
        let labels = reader
            .headers()
            .map_err(|err| parse_error(path, err))?
            .iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        if labels.iter().all(|label| label.is_empty()) {
            return Err(PipelineError::ResultParse {
                path: path.to_path_buf(),
                message: "no column labels".to_string(),
            });
        }

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|err| parse_error(path, err))?;
            if let Some(row) = parse_row(path, &record, labels.len())? {
                rows.push(row);
            }
        }
        Ok(Self { labels, rows })
    }

    pub fn parse_markers(path: &Utf8Path, content: &str) -> Result<Self, PipelineError> {
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(content.as_bytes());
        let records = reader
            .records()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| parse_error(path, err))?;
        if records.len() < 5 {
            return Err(PipelineError::ResultParse {
                path: path.to_path_buf(),
                message: "truncated marker header".to_string(),
            });
        }

        let mut labels = Vec::new();
        for (index, name) in records[3].iter().enumerate() {
            if index < 2 {
                labels.push(name.to_string());
            } else if !name.is_empty() {
                labels.extend(["X", "Y", "Z"].map(|axis| format!("{name}_{axis}")));
            }
        }

        let mut rows = Vec::new();
        for record in &records[5..] {
            if let Some(row) = parse_row(path, record, labels.len())? {
                rows.push(row);
            }
        }
        Ok(Self { labels, rows })
    }
}

fn parse_row(
    path: &Utf8Path,
    record: &StringRecord,
    width: usize,
) -> Result<Option<Vec<f64>>, PipelineError> {
    if record.iter().all(str::is_empty) {
        return Ok(None);
    }
    let mut row = Vec::with_capacity(width);
    for index in 0..width {
        let value = match record.get(index) {
            None | Some("") => f64::NAN,
            Some(field) => field.parse::<f64>().map_err(|_| PipelineError::ResultParse {
                path: path.to_path_buf(),
                message: format!("non-numeric value {field:?}"),
            })?,
        };
        row.push(value);
    }
    Ok(Some(row))
}

fn parse_error(path: &Utf8Path, err: csv::Error) -> PipelineError {
    PipelineError::ResultParse {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedSeries {
    pub name: String,
    pub source: Utf8PathBuf,
    pub series: TimeSeries,
}

pub type UnitResults = BTreeMap<ResultCategory, Vec<NamedSeries>>;

#[derive(Debug, Default)]
pub struct ResultTable {
    entries: BTreeMap<WorkItem, UnitResults>,
}

impl ResultTable {
    pub fn get(&self, item: &WorkItem, category: ResultCategory) -> Option<&[NamedSeries]> {
        self.entries
            .get(item)
            .and_then(|results| results.get(&category))
            .map(Vec::as_slice)
    }

    pub fn contains(&self, item: &WorkItem) -> bool {
        self.entries.contains_key(item)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&WorkItem, &UnitResults)> {
        self.entries.iter()
    }

    fn insert(&mut self, item: WorkItem, results: UnitResults) {
        self.entries.insert(item, results);
    }
}

#[derive(Debug)]
pub struct LoadFailure {
    pub item: WorkItem,
    pub category: ResultCategory,
    pub error: PipelineError,
}

#[derive(Debug, Default)]
pub struct LoadReport {
    pub table: ResultTable,
    pub failures: Vec<LoadFailure>,
}

impl LoadReport {
    pub fn finish(self) -> Result<ResultTable, PipelineError> {
        if self.failures.is_empty() {
            Ok(self.table)
        } else {
            Err(PipelineError::LoadFailed {
                failed: self.failures.len(),
            })
        }
    }
}

pub struct ResultAggregator<'a> {
    dataset: &'a Dataset,
}

impl<'a> ResultAggregator<'a> {
    pub fn new(dataset: &'a Dataset) -> Self {
        Self { dataset }
    }

    pub fn load(
        &self,
        items: &[WorkItem],
        categories: &[ResultCategory],
    ) -> Result<LoadReport, PipelineError> {
        let units = items
            .iter()
            .map(|item| DataUnit::new(item.clone(), self.dataset))
            .collect::<Result<Vec<_>, _>>()?;

        let mut report = LoadReport::default();
        for unit in units {
            match self.load_unit(&unit, categories) {
                Ok(results) => report.table.insert(unit.item().clone(), results),
                Err((category, error)) => {
                    warn!(item = %unit.item(), ?category, error = %error, "result load failed");
                    report.failures.push(LoadFailure {
                        item: unit.item().clone(),
                        category,
                        error,
                    });
                }
            }
        }
        debug!(loaded = report.table.len(), failed = report.failures.len(), "load pass finished");
        Ok(report)
    }

    fn load_unit(
        &self,
        unit: &DataUnit,
        categories: &[ResultCategory],
    ) -> Result<UnitResults, (ResultCategory, PipelineError)> {
        let mut results = UnitResults::new();
        for &category in categories {
            let series = self
                .sources(unit, category)
                .and_then(|sources| {
                    sources
                        .into_iter()
                        .map(|(name, source)| -> Result<NamedSeries, PipelineError> {
                            let series = TimeSeries::read(&source)?;
                            Ok(NamedSeries {
                                name,
                                source,
                                series,
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()
                })
                .map_err(|err| (category, err))?;
            results.insert(category, series);
        }
        Ok(results)
    }

    fn sources(
        &self,
        unit: &DataUnit,
        category: ResultCategory,
    ) -> Result<Vec<(String, Utf8PathBuf)>, PipelineError> {
        let paths = unit.paths();
        let naming = &self.dataset.naming;
        match category {
            ResultCategory::RawForces => single_file(&paths.forces_file),
            ResultCategory::InputMarkers => single_file(&paths.markers_file),
            ResultCategory::KinematicsFit => {
                let dir = existing_dir(paths.stage_dir(Stage::KinematicsFit))?;
                let found = fs_util::files_with_ext(dir, &naming.ik_output_extension)?
                    .into_iter()
                    .find(|path| !path.as_str().ends_with(&naming.ik_marker_suffix))
                    .ok_or_else(|| PipelineError::MissingResult(format!("kinematics in {dir}")))?;
                Ok(vec![named(found)])
            }
            ResultCategory::OutputMarkers => {
                let dir = existing_dir(paths.stage_dir(Stage::KinematicsFit))?;
                matching(dir, &naming.ik_marker_suffix)
            }
            ResultCategory::MuscleDrivenStates => {
                let dir = existing_dir(paths.stage_dir(Stage::MuscleDrivenSimulation))?;
                matching(dir, &naming.cmc_states_suffix)
            }
            ResultCategory::InverseDynamics => {
                let dir = existing_dir(paths.stage_dir(Stage::InverseDynamics))?;
                let subruns = fs_util::list_dirs(dir)?;
                if subruns.is_empty() {
                    return Err(PipelineError::MissingResult(format!("no sub-runs in {dir}")));
                }
                subruns
                    .into_iter()
                    .map(|folder| -> Result<(String, Utf8PathBuf), PipelineError> {
                        let name = folder.file_name().unwrap_or_default().to_string();
                        Ok((name, single_output(&folder)?))
                    })
                    .collect()
            }
        }
    }
}

fn named(path: Utf8PathBuf) -> (String, Utf8PathBuf) {
    let name = path.file_stem().unwrap_or_default().to_string();
    (name, path)
}

fn single_file(path: &Utf8Path) -> Result<Vec<(String, Utf8PathBuf)>, PipelineError> {
    if !path.as_std_path().is_file() {
        return Err(PipelineError::MissingResult(path.to_string()));
    }
    Ok(vec![named(path.to_path_buf())])
}

fn existing_dir(dir: &Utf8Path) -> Result<&Utf8Path, PipelineError> {
    if dir.as_std_path().is_dir() {
        Ok(dir)
    } else {
        Err(PipelineError::MissingResult(dir.to_string()))
    }
}

fn matching(dir: &Utf8Path, suffix: &str) -> Result<Vec<(String, Utf8PathBuf)>, PipelineError> {
    let files = fs_util::files_with_suffix(dir, suffix)?;
    if files.is_empty() {
        return Err(PipelineError::MissingResult(format!("*{suffix} in {dir}")));
    }
    Ok(files.into_iter().map(named).collect())
}
