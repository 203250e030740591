use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use gaitflow::config::{Dataset, DescriptorLoader};
use gaitflow::domain::{Stage, SubjectId};
use gaitflow::engine::CommandEngine;
use gaitflow::error::PipelineError;
use gaitflow::orchestrator::{BatchOrchestrator, BatchReport, ProgressSink, RunOptions, SystemMemory};
use gaitflow::output::{ConsoleProgress, JsonOutput, OutputMode};
use gaitflow::results::{LoadReport, ResultAggregator, ResultCategory};

#[derive(Parser)]
#[command(name = "gaitflow")]
#[command(about = "Staged musculoskeletal-simulation batches over motion-capture datasets")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true, help = "Dataset descriptor (defaults to ./gaitflow.json)")]
    descriptor: Option<String>,

    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List the work items of the dataset")]
    Expand(SubjectArgs),
    #[command(about = "Show per-unit stage completion")]
    Status(SubjectArgs),
    #[command(about = "Run the one-time model adjustment pass")]
    Adjust,
    #[command(about = "Run stages over the dataset in parallel")]
    Run(RunArgs),
    #[command(about = "Continue a batch from a checkpoint file")]
    Resume(ResumeArgs),
    #[command(about = "Load computed results")]
    Load(LoadArgs),
}

#[derive(Args, Clone)]
struct SubjectArgs {
    #[arg(long = "subject", help = "Restrict to these subjects (repeatable)")]
    subjects: Vec<u32>,
}

#[derive(Args, Clone, Default)]
struct BatchArgs {
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    skip_completed: bool,

    #[arg(long, help = "Fraction of total memory that must stay available (0 disables the guard)")]
    min_available_memory: Option<f64>,
}

#[derive(Args, Clone)]
struct RunArgs {
    #[arg(long = "stage", value_enum, value_delimiter = ',', required = true)]
    stages: Vec<Stage>,

    #[command(flatten)]
    subjects: SubjectArgs,

    #[command(flatten)]
    batch: BatchArgs,
}

#[derive(Args, Clone)]
struct ResumeArgs {
    checkpoint: Utf8PathBuf,

    #[command(flatten)]
    batch: BatchArgs,
}

#[derive(Args, Clone)]
struct LoadArgs {
    #[arg(long = "category", value_enum, value_delimiter = ',')]
    categories: Vec<ResultCategory>,

    #[command(flatten)]
    subjects: SubjectArgs,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<PipelineError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PipelineError) -> u8 {
    match error.originating() {
        PipelineError::MissingDescriptor
        | PipelineError::DescriptorRead(_)
        | PipelineError::DescriptorParse(_)
        | PipelineError::Configuration(_)
        | PipelineError::UnknownParameter(_)
        | PipelineError::ValueOutOfRange { .. }
        | PipelineError::UnknownSubject(_)
        | PipelineError::InvalidStage(_)
        | PipelineError::Checkpoint(_) => 2,
        PipelineError::StageFailed { .. }
        | PipelineError::MissingTool(_)
        | PipelineError::MissingOutput { .. }
        | PipelineError::WorkerPanicked(_) => 3,
        PipelineError::ResourceExhausted { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let dataset = DescriptorLoader::resolve(cli.descriptor.as_deref())?;
    let engine = CommandEngine::new(&dataset.tools);
    let orchestrator = BatchOrchestrator::new(dataset, engine, SystemMemory::new());

    match cli.command {
        Commands::Expand(args) => {
            let subjects = subject_filter(&args);
            let items = orchestrator.work_list(subjects.as_deref())?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_work_list(&items).into_diagnostic(),
                OutputMode::Interactive => {
                    for item in &items {
                        println!("{item}");
                    }
                    println!("{} work items", items.len());
                    Ok(())
                }
            }
        }
        Commands::Status(args) => {
            let subjects = subject_filter(&args);
            let items = orchestrator.work_list(subjects.as_deref())?;
            let statuses = orchestrator.status(&items)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_status(&statuses).into_diagnostic(),
                OutputMode::Interactive => {
                    for status in &statuses {
                        let stages = status
                            .completed
                            .iter()
                            .map(|stage| stage.short_name())
                            .collect::<Vec<_>>()
                            .join(" ");
                        let stages = if stages.is_empty() { "-" } else { stages.as_str() };
                        println!("{}: {stages}", status.item);
                    }
                    Ok(())
                }
            }
        }
        Commands::Adjust => {
            let record = orchestrator.adjust_models(sink(output_mode))?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_adjustment(&record).into_diagnostic(),
                OutputMode::Interactive => {
                    println!("Adjusted {} model variant(s)", record.adjusted.len());
                    Ok(())
                }
            }
        }
        Commands::Run(args) => {
            let subjects = subject_filter(&args.subjects);
            let items = orchestrator.work_list(subjects.as_deref())?;
            let options = run_options(orchestrator.dataset(), &args.batch);
            let report = orchestrator.run(&args.stages, &items, &options, sink(output_mode))?;
            print_batch(&report, output_mode)
        }
        Commands::Resume(args) => {
            let overrides = has_overrides(&args.batch)
                .then(|| run_options(orchestrator.dataset(), &args.batch));
            let report =
                orchestrator.resume(&args.checkpoint, overrides.as_ref(), sink(output_mode))?;
            print_batch(&report, output_mode)
        }
        Commands::Load(args) => {
            let subjects = subject_filter(&args.subjects);
            let items = orchestrator.work_list(subjects.as_deref())?;
            let categories = if args.categories.is_empty() {
                ResultCategory::ALL.to_vec()
            } else {
                args.categories.clone()
            };
            let report = ResultAggregator::new(orchestrator.dataset()).load(&items, &categories)?;
            print_load(&report, output_mode)?;
            report.finish()?;
            Ok(())
        }
    }
}

fn sink(mode: OutputMode) -> &'static dyn ProgressSink {
    match mode {
        OutputMode::Interactive => &ConsoleProgress,
        OutputMode::NonInteractive => &JsonOutput,
    }
}

fn subject_filter(args: &SubjectArgs) -> Option<Vec<SubjectId>> {
    if args.subjects.is_empty() {
        None
    } else {
        Some(args.subjects.iter().copied().map(SubjectId).collect())
    }
}

fn has_overrides(args: &BatchArgs) -> bool {
    args.workers.is_some() || args.skip_completed || args.min_available_memory.is_some()
}

fn run_options(dataset: &Dataset, args: &BatchArgs) -> RunOptions {
    let mut options = RunOptions::from_settings(&dataset.batch);
    if let Some(workers) = args.workers {
        options.workers = workers.max(1);
    }
    if args.skip_completed {
        options.skip_completed = true;
    }
    if let Some(threshold) = args.min_available_memory {
        options.min_available_memory = threshold;
    }
    options
}

fn print_batch(report: &BatchReport, mode: OutputMode) -> miette::Result<()> {
    if let OutputMode::NonInteractive = mode {
        return JsonOutput::print_batch(report).into_diagnostic();
    }

    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}gaitflow batch summary{reset}");
    println!(
        "{green}Completed: {} of {}{reset}",
        report.completed.len(),
        report.total
    );
    println!("{yellow}Failed: {}{reset}", report.failed.len());
    for failure in &report.failed {
        println!("{yellow}  {}: {}{reset}", failure.item, failure.error);
    }
    if let Some(path) = &report.checkpoint {
        println!("{cyan}Checkpoint: {path}{reset}");
    }
    Ok(())
}

fn print_load(report: &LoadReport, mode: OutputMode) -> miette::Result<()> {
    if let OutputMode::NonInteractive = mode {
        return JsonOutput::print_load(report).into_diagnostic();
    }
    println!("Loaded results for {} unit(s)", report.table.len());
    for failure in &report.failures {
        println!("  {} ({:?}): {}", failure.item, failure.category, failure.error);
    }
    Ok(())
}
