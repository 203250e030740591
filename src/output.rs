use std::io::{self, Write};

use serde::Serialize;
use serde_json::json;

use crate::domain::WorkItem;
use crate::orchestrator::{BatchReport, ProgressEvent, ProgressSink};
use crate::results::LoadReport;
use crate::store::AdjustmentRecord;
use crate::unit::UnitStatus;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_work_list(items: &[WorkItem]) -> io::Result<()> {
        Self::print_json(&items)
    }

    pub fn print_status(statuses: &[UnitStatus]) -> io::Result<()> {
        Self::print_json(&statuses)
    }

    pub fn print_adjustment(record: &AdjustmentRecord) -> io::Result<()> {
        Self::print_json(record)
    }

    pub fn print_batch(report: &BatchReport) -> io::Result<()> {
        let failed = report
            .failed
            .iter()
            .map(|failure| {
                json!({
                    "item": failure.item,
                    "error": failure.error.to_string(),
                })
            })
            .collect::<Vec<_>>();
        Self::print_json(&json!({
            "total": report.total,
            "completed": report.completed.len(),
            "failed": failed,
            "checkpoint": report.checkpoint,
        }))
    }

    pub fn print_load(report: &LoadReport) -> io::Result<()> {
        let units = report
            .table
            .iter()
            .map(|(item, results)| {
                let categories = results
                    .iter()
                    .map(|(category, series)| {
                        json!({
                            "category": category,
                            "datasets": series
                                .iter()
                                .map(|named| json!({
                                    "name": named.name,
                                    "columns": named.series.labels.len(),
                                    "rows": named.series.rows.len(),
                                }))
                                .collect::<Vec<_>>(),
                        })
                    })
                    .collect::<Vec<_>>();
                json!({ "item": item, "categories": categories })
            })
            .collect::<Vec<_>>();
        let failures = report
            .failures
            .iter()
            .map(|failure| json!({ "item": failure.item, "error": failure.error.to_string() }))
            .collect::<Vec<_>>();
        Self::print_json(&json!({ "units": units, "failures": failures }))
    }

    fn print_json<T: Serialize + ?Sized>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: ProgressEvent) {
        tracing::debug!(processed = event.processed, total = event.total, "{}", event.message);
        eprintln!("[{}/{}] {}", event.processed, event.total, event.message);
    }
}
