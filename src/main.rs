use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use taskline::cli::commands::{
    CancelCommand, HistoryCommand, RunCommand, StatusCommand, TasksCommand, ValidateCommand,
};
use taskline::cli::output::*;
use taskline::cli::{Cli, Command};
use taskline::core::config::PipelineConfig;
use taskline::core::params::ParamValue;
use taskline::persistence::{
    create_snapshot, InMemoryPersistence, PersistenceBackend, RunRecorder, RunSnapshot,
    HEARTBEAT_INTERVAL,
};
use taskline::{
    EngineConfig, ExecutionEngine, FailurePolicy, PipelineDefinition, ProcessRunner, RunEvent,
    RunStatus, TaskRegistry, WorkspaceManager,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("taskline={}", default_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd, &cli).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::Status(cmd) => show_status(cmd, &cli).await?,
        Command::Cancel(cmd) => cancel_run(cmd, &cli).await?,
        Command::History(cmd) => show_history(cmd, &cli).await?,
        Command::Tasks(cmd) => list_tasks(cmd)?,
    }

    Ok(())
}

/// Open the run history store
#[cfg(feature = "sqlite")]
async fn open_store(cli: &Cli) -> Result<Arc<dyn PersistenceBackend>> {
    use taskline::persistence::SqliteRunStore;

    let store = match &cli.db {
        Some(path) => SqliteRunStore::new(path).await?,
        None => SqliteRunStore::with_default_path().await?,
    };
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_store(_cli: &Cli) -> Result<Arc<dyn PersistenceBackend>> {
    warn!("Built without the sqlite feature; run history is not persisted");
    Ok(Arc::new(InMemoryPersistence::new()))
}

fn load_registry(catalogs: &[PathBuf]) -> Result<TaskRegistry> {
    let mut registry = TaskRegistry::with_builtins();
    for catalog in catalogs {
        registry
            .load_catalog(catalog)
            .with_context(|| format!("Failed to load task catalog {}", catalog.display()))?;
    }
    Ok(registry)
}

fn load_definition(file: &Path) -> Result<Arc<PipelineDefinition>> {
    let config = PipelineConfig::from_file(file)
        .with_context(|| format!("Failed to load pipeline {}", file.display()))?;
    let definition = PipelineDefinition::from_config(&config)
        .with_context(|| format!("Invalid pipeline {}", file.display()))?;
    Ok(Arc::new(definition))
}

fn overrides(params: &[(String, String)]) -> BTreeMap<String, ParamValue> {
    params
        .iter()
        .map(|(k, v)| (k.clone(), ParamValue::from(v.as_str())))
        .collect()
}

async fn run_pipeline(cmd: &RunCommand, cli: &Cli) -> Result<()> {
    let definition = load_definition(&cmd.file)?;
    let registry = load_registry(&cmd.catalog)?;

    let workspaces = WorkspaceManager::new(
        cmd.workspace_root
            .clone()
            .unwrap_or_else(WorkspaceManager::default_root),
    )
    .with_retention(cmd.retain_workspace);

    let config = EngineConfig {
        strategy: cmd.strategy,
        failure_policy: if cmd.fail_fast {
            FailurePolicy::FailFast
        } else {
            FailurePolicy::Drain
        },
        default_timeout: cmd.timeout.map(Duration::from_secs),
    };

    let backend: Arc<dyn PersistenceBackend> = if cmd.no_history {
        Arc::new(InMemoryPersistence::new())
    } else {
        open_store(cli).await?
    };
    let recorder = Arc::new(RunRecorder::new(backend));

    let mut engine = ExecutionEngine::new(ProcessRunner::new(), registry, workspaces, config)
        .with_recorder(recorder.clone());

    let host_bindings: BTreeMap<String, PathBuf> = cmd.workspace.iter().cloned().collect();
    let mut run = engine.instantiate(definition.clone(), &overrides(&cmd.param), &host_bindings)?;

    let progress = if cmd.json {
        indicatif::ProgressBar::hidden()
    } else {
        println!(
            "{}Run {} of {} ({} tasks)",
            INFO,
            style(run.id).dim(),
            style(&definition.name).bold(),
            run.tasks.len()
        );
        create_progress_bar(run.tasks.len())
    };

    {
        let progress = progress.clone();
        let verbose = cli.verbose;
        engine.add_event_handler(move |event: RunEvent| {
            if let RunEvent::TaskStateChanged { state, .. } = &event {
                if state.is_terminal() {
                    progress.inc(1);
                }
            }
            if let RunEvent::TaskOutput { task, output } = &event {
                if verbose && !output.is_empty() {
                    progress.println(format!("{}Output from {}:", INFO, style(task).dim()));
                    progress.println(format_output(output, 20));
                }
                return;
            }
            if let Some(line) = format_run_event(&event) {
                progress.println(line);
            }
        });
    }

    let cancel = CancellationToken::new();

    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; cancelling run");
                cancel.cancel();
            }
        })
    };

    // Another process may ask for cancellation through the history store, and
    // reads the heartbeat to tell whether this process is still alive
    let watcher = {
        let cancel = cancel.clone();
        let recorder = recorder.clone();
        let run_id = run.id;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(500));
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = heartbeat.tick() => recorder.heartbeat(run_id).await,
                    _ = interval.tick() => {
                        if recorder.cancel_requested(run_id).await {
                            debug!("Cancel requested for run {}", run_id);
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        })
    };

    let started = std::time::Instant::now();
    let result = engine.execute(&mut run, cancel.clone()).await;
    ctrl_c.abort();
    watcher.abort();
    progress.finish_and_clear();

    let status = result?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&create_snapshot(&run))?);
    } else {
        println!("{}", separator());
        println!(
            "{}Run {} {} in {}",
            match status {
                RunStatus::Succeeded => CHECK,
                RunStatus::Cancelled => STOP,
                _ => CROSS,
            },
            style(run.id).dim(),
            format_status(status),
            format_duration(started.elapsed())
        );

        for (label, count) in run.state_counts() {
            println!("   {:<10} {}", style(label).dim(), count);
        }

        if let Some(failure) = run.first_failure() {
            println!(
                "\n{}First failure: {} - {}",
                WARN,
                style(failure.task).red().bold(),
                failure.error
            );
            if !failure.logs.is_empty() {
                println!("{}", format_output(failure.logs, 40));
            }
        }
    }

    match status {
        RunStatus::Succeeded => Ok(()),
        status => bail!("Run {} {}", run.id, status.as_str().to_lowercase()),
    }
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    let definition = load_definition(&cmd.file)?;
    let registry = load_registry(&cmd.catalog)?;

    // Instantiating checks kinds, bindings, references and parameter types
    let workspaces = WorkspaceManager::new(std::env::temp_dir().join("taskline-validate"));
    let run = taskline::Run::instantiate(
        definition.clone(),
        &registry,
        &workspaces,
        &overrides(&cmd.param),
        &BTreeMap::new(),
    )?;

    if cmd.json {
        let report = serde_json::json!({
            "valid": true,
            "name": definition.name,
            "tasks": definition.execution_order(),
            "params": run.params,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{}Pipeline {} is valid",
        CHECK,
        style(&definition.name).bold()
    );
    if let Some(description) = &definition.description {
        println!("   {}", style(description).dim());
    }
    println!("\nExecution order:");
    for (i, name) in definition.execution_order().iter().enumerate() {
        let deps = definition.graph().predecessors(name);
        if deps.is_empty() {
            println!("  {}. {}", i + 1, style(name).cyan());
        } else {
            println!(
                "  {}. {} {}",
                i + 1,
                style(name).cyan(),
                style(format!("(after {})", deps.join(", "))).dim()
            );
        }
    }

    Ok(())
}

/// Accept a full run ID or a unique prefix of one
async fn find_run(backend: &dyn PersistenceBackend, id: &str) -> Result<RunSnapshot> {
    if let Ok(run_id) = Uuid::parse_str(id) {
        return backend
            .load_snapshot(run_id)
            .await?
            .with_context(|| format!("No run with ID {}", run_id));
    }

    let mut matches: Vec<RunSnapshot> = backend
        .list_runs(None, usize::MAX >> 1)
        .await?
        .into_iter()
        .filter(|s| s.run_id.to_string().starts_with(id))
        .collect();

    match matches.len() {
        0 => bail!("No run with ID starting with '{}'", id),
        1 => Ok(matches.remove(0)),
        n => bail!("'{}' matches {} runs; use a longer prefix", id, n),
    }
}

async fn show_status(cmd: &StatusCommand, cli: &Cli) -> Result<()> {
    let backend = open_store(cli).await?;
    let snapshot = find_run(backend.as_ref(), &cmd.run_id).await?;
    let last_heartbeat = backend.last_heartbeat(snapshot.run_id).await?;
    let abandoned = snapshot.is_abandoned(last_heartbeat, Utc::now());
    let events = if cmd.events {
        backend.load_events(snapshot.run_id).await?
    } else {
        Vec::new()
    };

    if cmd.json {
        let report = serde_json::json!({
            "run": snapshot,
            "abandoned": abandoned,
            "lastHeartbeat": last_heartbeat,
            "events": events,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", format_snapshot_summary(&snapshot));
    if abandoned {
        println!(
            "{}No process has reported on this run since {}; it was probably interrupted. `taskline cancel {}` closes it.",
            WARN,
            last_heartbeat
                .unwrap_or(snapshot.updated_at)
                .format("%Y-%m-%d %H:%M:%S UTC"),
            short_id(&snapshot.run_id)
        );
    }
    for (name, value) in &snapshot.params {
        println!("   {} = {}", style(name).dim(), value);
    }
    println!("{}", separator());
    println!("{}", format_snapshot_tasks(&snapshot));

    if let Some(failure) = &snapshot.first_failure {
        println!(
            "\n{}First failure: {} - {}",
            WARN,
            style(&failure.task).red().bold(),
            failure.error
        );
        if !failure.logs.is_empty() {
            println!("{}", format_output(&failure.logs, 40));
        }
    }

    if cmd.events {
        println!("{}", separator());
        for event in &events {
            println!("{}", format_recorded_event(event));
        }
    }

    Ok(())
}

async fn cancel_run(cmd: &CancelCommand, cli: &Cli) -> Result<()> {
    let backend = open_store(cli).await?;
    let mut snapshot = find_run(backend.as_ref(), &cmd.run_id).await?;

    if snapshot.status.is_terminal() {
        println!(
            "{}Run {} already finished ({})",
            INFO,
            style(short_id(&snapshot.run_id)).dim(),
            format_status(snapshot.status)
        );
        return Ok(());
    }

    let last_heartbeat = backend.last_heartbeat(snapshot.run_id).await?;
    if snapshot.is_abandoned(last_heartbeat, Utc::now()) {
        snapshot.mark_abandoned(Utc::now());
        backend.save_snapshot(&snapshot).await?;
        println!(
            "{}Run {} is no longer being executed; marked it cancelled",
            STOP,
            style(short_id(&snapshot.run_id)).dim()
        );
        return Ok(());
    }

    if backend.request_cancel(snapshot.run_id).await? {
        println!(
            "{}Cancellation requested for run {}",
            STOP,
            style(short_id(&snapshot.run_id)).dim()
        );
    } else {
        bail!("Run {} is not recorded", snapshot.run_id);
    }

    Ok(())
}

async fn show_history(cmd: &HistoryCommand, cli: &Cli) -> Result<()> {
    let backend = open_store(cli).await?;
    let runs = backend.list_runs(cmd.pipeline.as_deref(), cmd.limit).await?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("{}No runs recorded", INFO);
        return Ok(());
    }

    for snapshot in &runs {
        println!("{}", format_snapshot_summary(snapshot));
    }

    Ok(())
}

fn list_tasks(cmd: &TasksCommand) -> Result<()> {
    let registry = load_registry(&cmd.catalog)?;
    let descriptors = registry
        .kinds()
        .into_iter()
        .map(|kind| registry.resolve(kind))
        .collect::<Result<Vec<_>, _>>()?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(());
    }

    for descriptor in descriptors {
        println!("{}", format_descriptor(descriptor));
    }

    Ok(())
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}.{:01}s", secs, d.subsec_millis() / 100)
    } else {
        format!("{}ms", d.as_millis())
    }
}
