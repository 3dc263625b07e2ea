mod collaborators;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::SystemTime;

use clap::{Args, Parser, Subcommand};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use mediaflow_core::config::EngineConfig;
use mediaflow_core::execution::{ProcessSupervisor, TokioProcessExecutor};
use mediaflow_core::logging::init_tracing;
use mediaflow_core::models::{
    CoreError, CoreErrorKind, InputSource, StatusEvent, TaskId, TaskOutcome, TaskRecord,
    TaskStatus, TaskUpdate, ToolKind, ToolSettings, UploadSettings, UserId,
};
use mediaflow_core::orchestration::{Collaborators, StatusSink, TaskService};
use mediaflow_core::persistence::{InMemoryTaskStore, TaskStore};
use mediaflow_core::progress::format_duration;
use mediaflow_core::sqlite::SqliteTaskStore;

use crate::collaborators::{DirectoryUploader, LocalFileDownloader, TemplateCommandBuilder};

const DEFAULT_TEMPLATE: [&str; 6] = ["-hide_banner", "-y", "-i", "{input}", "-c", "copy"];

#[derive(Parser)]
#[command(name = "mediaflow")]
#[command(about = "Run and inspect media processing tasks", long_about = None)]
struct Cli {
    /// SQLite database holding task records (overrides MEDIAFLOW_DATABASE)
    #[arg(long = "db", global = true)]
    database: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one task to completion in the foreground
    Run(RunArgs),
    /// List the most recent tasks
    Tasks {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Print one task record as JSON
    Show { task_id: u64 },
    /// Mark a task cancelled; a running `mediaflow run` picks this up and stops its engine
    Cancel { task_id: u64 },
}

#[derive(Args)]
struct RunArgs {
    /// Tool to record for the task (merge, encode, trim, ...)
    #[arg(long, value_parser = parse_tool)]
    tool: ToolKind,

    /// Input file; repeat for multi-input tools
    #[arg(long = "input", required = true)]
    inputs: Vec<PathBuf>,

    #[arg(long, default_value = "1")]
    user: i64,

    /// Directory that receives the finished file
    #[arg(long, default_value = "out")]
    upload_dir: PathBuf,

    /// File name the engine writes inside the task workspace
    #[arg(long, default_value = "output.mp4")]
    output_name: String,

    /// Engine executable
    #[arg(long, default_value = "ffmpeg")]
    engine: String,

    /// Engine arguments after `--`; `{input}`, `{inputs}` and `{output}` are substituted
    #[arg(last = true)]
    template: Vec<String>,
}

fn parse_tool(raw: &str) -> Result<ToolKind, String> {
    raw.parse().map_err(|()| {
        let known: Vec<&str> = ToolKind::ALL.iter().map(|kind| kind.as_str()).collect();
        format!("unknown tool '{raw}', expected one of: {}", known.join(", "))
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let result = load_config(cli.database).and_then(|config| match cli.command {
        Command::Run(args) => run_task(config, args),
        Command::Tasks { limit } => list_tasks(&config, limit).map(|()| ExitCode::SUCCESS),
        Command::Show { task_id } => show_task(&config, TaskId(task_id)).map(|()| ExitCode::SUCCESS),
        Command::Cancel { task_id } => {
            cancel_task(&config, TaskId(task_id)).map(|()| ExitCode::SUCCESS)
        }
    });

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("Error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(database: Option<PathBuf>) -> Result<EngineConfig, CoreError> {
    let mut config = EngineConfig::from_env()?;
    if database.is_some() {
        config.database_path = database;
    }
    config.validate()?;
    Ok(config)
}

fn open_store(config: &EngineConfig) -> Result<Arc<dyn TaskStore>, CoreError> {
    match &config.database_path {
        Some(path) => Ok(Arc::new(SqliteTaskStore::open(path)?)),
        None => Ok(Arc::new(InMemoryTaskStore::new())),
    }
}

fn require_database(config: &EngineConfig) -> Result<Arc<dyn TaskStore>, CoreError> {
    if config.database_path.is_none() {
        return Err(CoreError::new(
            CoreErrorKind::InvalidInput,
            "no task database configured; pass --db or set MEDIAFLOW_DATABASE",
        ));
    }
    open_store(config)
}

fn run_task(config: EngineConfig, args: RunArgs) -> Result<ExitCode, CoreError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("failed to start async runtime: {error}"),
            )
        })?;
    runtime.block_on(run_task_async(config, args))
}

async fn run_task_async(config: EngineConfig, args: RunArgs) -> Result<ExitCode, CoreError> {
    let store = open_store(&config)?;
    let supervisor = Arc::new(ProcessSupervisor::from_config(
        Arc::new(TokioProcessExecutor),
        &config,
    ));

    let template = if args.template.is_empty() {
        DEFAULT_TEMPLATE
            .iter()
            .map(|arg| (*arg).to_string())
            .chain(std::iter::once("{output}".to_string()))
            .collect()
    } else {
        args.template
    };
    let collaborators = Collaborators {
        downloader: Arc::new(LocalFileDownloader),
        command_builder: Arc::new(TemplateCommandBuilder::new(
            args.engine,
            template,
            args.output_name.clone(),
        )),
        uploader: Arc::new(DirectoryUploader),
    };
    let service = TaskService::new(store, supervisor, collaborators, config);

    let mut inputs: Vec<InputSource> = args.inputs.into_iter().map(InputSource::LocalPath).collect();
    let input_source = if inputs.len() == 1 {
        inputs.remove(0)
    } else {
        InputSource::Batch(inputs)
    };
    let upload = UploadSettings::new(args.upload_dir.display().to_string()).file_name(args.output_name);
    let sink: Arc<dyn StatusSink> = Arc::new(log_event);

    let (task_id, mut handle) = service
        .submit(
            UserId(args.user),
            ToolSettings::defaults(args.tool),
            input_source,
            upload,
            sink,
        )
        .await?;
    println!("task {task_id} started");

    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = tokio::signal::ctrl_c() => {
            let ack = service.cancel_task(task_id).await?;
            if !ack.already_finished {
                eprintln!("cancelling task {task_id}...");
            }
            handle.await
        }
    };
    let outcome = joined.map_err(|error| {
        CoreError::new(
            CoreErrorKind::Internal,
            format!("task runner stopped unexpectedly: {error}"),
        )
        .task(task_id)
    })?;

    Ok(report_outcome(task_id, &outcome, service.config().error_message_limit))
}

fn log_event(event: StatusEvent) {
    match (event.percent, &event.message) {
        (Some(percent), _) if event.is_progress() => tracing::info!(
            task_id = %event.task_id,
            stage = %event.stage,
            percent = %format!("{percent:.1}"),
            speed = ?event.speed,
            eta = ?event.eta.map(format_duration),
            "progress"
        ),
        (_, Some(message)) => {
            tracing::info!(task_id = %event.task_id, stage = %event.stage, "{message}")
        }
        _ => tracing::info!(task_id = %event.task_id, stage = %event.stage, "stage changed"),
    }
}

fn report_outcome(task_id: TaskId, outcome: &TaskOutcome, limit: usize) -> ExitCode {
    match outcome {
        TaskOutcome::Completed(receipt) => {
            println!(
                "task {task_id} completed: {} bytes -> {}",
                receipt.final_size,
                receipt.destination.as_deref().unwrap_or("-")
            );
            ExitCode::SUCCESS
        }
        TaskOutcome::Failed(error) => {
            eprintln!("task {task_id} failed\n{}", error.user_message(limit));
            ExitCode::FAILURE
        }
        TaskOutcome::Cancelled => {
            println!("task {task_id} cancelled");
            ExitCode::from(130)
        }
    }
}

fn list_tasks(config: &EngineConfig, limit: usize) -> Result<(), CoreError> {
    let store = require_database(config)?;
    let records = store.list_recent_tasks(limit)?;
    if records.is_empty() {
        println!("no tasks recorded");
        return Ok(());
    }

    println!(
        "{:<8} {:<8} {:<14} {:<12} {:>7}  {}",
        "TASK", "USER", "TOOL", "STATUS", "PERCENT", "UPDATED"
    );
    for record in records {
        println!(
            "{:<8} {:<8} {:<14} {:<12} {:>6.1}%  {}",
            record.id.to_string(),
            record.user_id.to_string(),
            record.tool.as_str(),
            record.status.as_str(),
            record.progress_percent,
            format_timestamp(record.updated_at)
        );
    }
    Ok(())
}

fn show_task(config: &EngineConfig, task_id: TaskId) -> Result<(), CoreError> {
    let store = require_database(config)?;
    let record = store.get_task(task_id)?;
    println!("{}", render_record(&record)?);
    Ok(())
}

fn cancel_task(config: &EngineConfig, task_id: TaskId) -> Result<(), CoreError> {
    let store = require_database(config)?;
    let record = store.get_task(task_id)?;
    if record.status.is_terminal() {
        println!("task {task_id} already {}", record.status);
        return Ok(());
    }
    store.update_task(task_id, &TaskUpdate::status(TaskStatus::Cancelled))?;
    println!("task {task_id} marked cancelled (was {})", record.status);
    Ok(())
}

fn render_record(record: &TaskRecord) -> Result<String, CoreError> {
    let mut value = serde_json::to_value(record).map_err(|error| {
        CoreError::new(
            CoreErrorKind::Internal,
            format!("failed to encode task record: {error}"),
        )
    })?;
    if let Some(object) = value.as_object_mut() {
        object.insert(
            "created_at".to_string(),
            serde_json::Value::String(format_timestamp(record.created_at)),
        );
        object.insert(
            "updated_at".to_string(),
            serde_json::Value::String(format_timestamp(record.updated_at)),
        );
    }
    serde_json::to_string_pretty(&value).map_err(|error| {
        CoreError::new(
            CoreErrorKind::Internal,
            format!("failed to encode task record: {error}"),
        )
    })
}

fn format_timestamp(at: SystemTime) -> String {
    OffsetDateTime::from(at)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "-".to_string())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use mediaflow_core::models::ToolKind;

    use super::{Cli, Command, parse_tool};

    #[test]
    fn parses_run_with_engine_template() {
        let cli = Cli::try_parse_from([
            "mediaflow", "run", "--tool", "merge", "--input", "a.mp4", "--input", "b.mp4", "--",
            "-i", "{inputs}", "{output}",
        ])
        .unwrap();

        let Command::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(args.tool, ToolKind::Merge);
        assert_eq!(args.inputs.len(), 2);
        assert_eq!(args.template, vec!["-i", "{inputs}", "{output}"]);
    }

    #[test]
    fn unknown_tool_lists_the_known_ones() {
        let error = parse_tool("blur").unwrap_err();
        assert!(error.contains("unknown tool 'blur'"));
        assert!(error.contains("extract_thumb"));
    }
}
