use atelier::api::ApiServer;
use atelier::bus::TaskMessageBus;
use atelier::concurrency::ConcurrencyGroup;
use atelier::config::Config;
use atelier::constants::EXIT_CODE_IRRECOVERABLE_ERROR;
use atelier::ids::{OrganizationReference, ProjectId};
use atelier::models::Project;
use atelier::runner::AgentRunnerFactory;
use atelier::scheduler::TaskScheduler;
use atelier::store::Store;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "atelier", about = "Local multi-task coding-agent orchestrator")]
struct Cli {
    /// Repository to serve; defaults to the current directory.
    #[arg(long)]
    repo: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!("fatal: {}", e);
            if e.is_irrecoverable() {
                EXIT_CODE_IRRECOVERABLE_ERROR
            } else {
                1
            }
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> atelier::Result<()> {
    let config = Config::load()?;
    let _log_guard = atelier::logs::setup_logging(&config.paths)?;
    info!("starting atelier");

    let store = Store::open(&config.database.path)?;
    let bus = TaskMessageBus::new(store.clone()).with_task_log_paths(config.paths.clone());

    ensure_project_for_repo(&store, cli.repo).await?;

    let factory = Arc::new(AgentRunnerFactory::new(
        bus.clone(),
        config.paths.clone(),
        None,
        HashMap::new(),
    ));
    let scheduler = Arc::new(TaskScheduler::new(
        store.clone(),
        bus.clone(),
        factory,
        true,
    ));

    let api_server = ApiServer::new(config, store, bus);

    // All long-running strands hang off the root group so shutdown has one
    // place to account for them. The root gets the long shutdown budget so
    // draining runners is never cut short.
    let root_group = ConcurrencyGroup::with_timeouts(
        "application",
        std::time::Duration::from_secs_f64(atelier::constants::SHUTDOWN_TIMEOUT_SECONDS),
        std::time::Duration::from_secs_f64(atelier::constants::SHUTDOWN_TIMEOUT_SECONDS),
    );
    root_group.activate()?;
    let scheduler_for_strand = scheduler.clone();
    root_group.spawn("task_scheduler", async move {
        scheduler_for_strand.run().await;
        Ok(())
    })?;

    tokio::select! {
        result = api_server.serve() => {
            if let Err(e) = result {
                error!("API server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    // Let the scheduler send stop messages and join its runners before the
    // process goes away.
    root_group.signal_shutdown();
    scheduler.shutdown();
    if let Err(e) = root_group.exit().await {
        error!("shutdown finished with strand failures: {}", e);
    }
    Ok(())
}

/// Register a project for the served repository on first use.
async fn ensure_project_for_repo(store: &Store, repo: Option<PathBuf>) -> atelier::Result<()> {
    let repo_path = match repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let repo_path = repo_path.canonicalize().unwrap_or(repo_path);
    let repo_url = url::Url::from_file_path(&repo_path)
        .map_err(|_| atelier::AtelierError::Configuration(format!("bad repo path: {repo_path:?}")))?
        .to_string();

    let mut transaction = store.transaction(None).await?;
    let exists = transaction
        .get_projects()?
        .iter()
        .any(|project| project.user_git_repo_url.as_deref() == Some(repo_url.as_str()));
    if !exists {
        let name = repo_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        info!("registering project {} for {}", name, repo_url);
        transaction.upsert_project(&Project {
            object_id: ProjectId::new(),
            organization_reference: OrganizationReference("local".to_string()),
            name,
            user_git_repo_url: Some(repo_url),
            our_git_repo_url: None,
            is_path_accessible: true,
            default_system_prompt: None,
            created_at: chrono::Utc::now(),
        })?;
    }
    transaction.commit()?;
    Ok(())
}
