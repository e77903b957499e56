use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use clonekeeper::clones::LocalClones;
use clonekeeper::config::{self, Config};
use clonekeeper::coordination::{Coordinator, FetchOutcome, KeyDbCoordinator, MemoryCoordinator};
use clonekeeper::metrics::MetricsRegistry;
use clonekeeper::model::{Author, BranchName, CommitMessage, File, RemoteUrl, RepoId};
use clonekeeper::service::RepoService;
use clonekeeper::worker::{Worker, WorkerSettings};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "clonekeeper", about = "Keeps local git clones in sync with their remotes")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/clonekeeper/config.yaml")]
    config: PathBuf,

    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process fetch jobs until SIGINT or SIGTERM.
    Worker,
    /// Set a repo's origin and queue its first fetch.
    Connect { repo_id: String, url: String },
    /// Queue a fetch.
    Fetch {
        repo_id: String,
        /// Wait up to this many seconds for a worker to report.
        #[arg(long)]
        wait: Option<u64>,
    },
    /// Commit files onto a branch and push them to origin.
    Commit {
        repo_id: String,
        #[arg(long, default_value = "main")]
        branch: String,
        /// `PATH=LOCAL_FILE`: store the contents of LOCAL_FILE at PATH.
        #[arg(long = "file", value_name = "PATH=LOCAL_FILE")]
        files: Vec<String>,
        #[arg(short, long, default_value = "Commit")]
        message: String,
        #[arg(long, requires = "author_email")]
        author_name: Option<String>,
        #[arg(long, requires = "author_name")]
        author_email: Option<String>,
    },
    /// Print a repo's remote, connection status and branches as JSON.
    Info { repo_id: String },
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

struct App {
    service: RepoService,
    worker: Worker,
    /// No shared backend: queued jobs are only visible to this process, so
    /// commands run them before returning.
    inline_worker: bool,
}

async fn build_app(config: &Config) -> Result<App> {
    tokio::fs::create_dir_all(&config.storage.root)
        .await
        .with_context(|| {
            format!(
                "failed to create storage root: {}",
                config.storage.root.display()
            )
        })?;

    let metrics = MetricsRegistry::new();
    let clones = LocalClones::from_config(config, metrics.clone());

    let (coordinator, inline_worker): (Arc<dyn Coordinator>, bool) = match &config.keydb {
        Some(keydb) => (
            Arc::new(KeyDbCoordinator::connect(keydb, config.queue.name.clone()).await?),
            false,
        ),
        None => {
            tracing::warn!("no keydb configured; queue, locks and status are process-local");
            (Arc::new(MemoryCoordinator::new()), true)
        }
    };

    let settings = WorkerSettings::from_config(&config.queue);
    tracing::info!(worker_id = %settings.worker_id, "worker identity established");

    Ok(App {
        service: RepoService::new(
            clones.clone(),
            Arc::clone(&coordinator),
            settings.clone(),
            metrics.clone(),
            config.git.default_author.clone(),
        ),
        worker: Worker::new(clones, coordinator, settings, metrics),
        inline_worker,
    })
}

fn parse_repo_id(value: &str) -> Result<RepoId> {
    RepoId::parse(value).with_context(|| format!("invalid repo id: {value}"))
}

async fn read_files(specs: &[String]) -> Result<Vec<File>> {
    let mut files = Vec::with_capacity(specs.len());
    for spec in specs {
        let (path, source) = spec
            .split_once('=')
            .with_context(|| format!("expected PATH=LOCAL_FILE, got {spec:?}"))?;
        let content = tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("failed to read {source}"))?;
        files.push(File::new(path, content));
    }
    Ok(files)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run_worker(app: &App) -> Result<()> {
    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop.send(true);
    });
    app.worker.run(shutdown).await
}

async fn run_command(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Worker => run_worker(app).await?,

        Command::Connect { repo_id, url } => {
            let repo_id = parse_repo_id(&repo_id)?;
            app.service
                .connect_to_remote(&repo_id, RemoteUrl::new(url))
                .await?;
            if app.inline_worker {
                app.worker.drain().await?;
            }
            print_json(&app.service.get_info(&repo_id).await?)?;
        }

        Command::Fetch { repo_id, wait } => {
            let repo_id = parse_repo_id(&repo_id)?;
            if app.inline_worker {
                app.service.fetch_from_remote(&repo_id).await?;
                app.worker.drain().await?;
                print_json(&app.service.get_info(&repo_id).await?)?;
            } else if let Some(secs) = wait {
                let event = app
                    .service
                    .fetch_and_wait(&repo_id, Duration::from_secs(secs))
                    .await?
                    .with_context(|| format!("no fetch report for {repo_id} within {secs}s"))?;
                print_json(&event)?;
                anyhow::ensure!(
                    event.outcome == FetchOutcome::Fetched,
                    "fetch of {repo_id} failed"
                );
            } else {
                let added = app.service.fetch_from_remote(&repo_id).await?;
                print_json(&serde_json::json!({ "repoId": repo_id, "queued": added }))?;
            }
        }

        Command::Commit {
            repo_id,
            branch,
            files,
            message,
            author_name,
            author_email,
        } => {
            let repo_id = parse_repo_id(&repo_id)?;
            let branch = BranchName::parse(branch)?;
            let files = read_files(&files).await?;
            let author = author_name.zip(author_email).map(|(n, e)| Author::new(n, e));
            let pushed = app
                .service
                .commit(&repo_id, branch, files, author, CommitMessage::new(message))
                .await?;
            if app.inline_worker {
                app.worker.drain().await?;
            }
            print_json(&pushed)?;
        }

        Command::Info { repo_id } => {
            let repo_id = parse_repo_id(&repo_id)?;
            print_json(&app.service.get_info(&repo_id).await?)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    match cli.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt.json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt.pretty())
            .init(),
    }

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    tracing::info!(config_path = %cli.config.display(), "starting clonekeeper");

    // ---- App ----
    let app = build_app(&config).await?;

    run_command(&app, cli.command).await
}
