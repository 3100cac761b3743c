//! Bridge Manager CLI Entry Point
//!
//! Thin command surface over the library: build the agent image, run and
//! stop agents, list what is running, query cloud-side agent status, and
//! host the background health monitor. This is also the composition root:
//! the runtime backend is selected here, once, from settings, and the
//! monitor instance is constructed and owned here.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use bridge_manager::agent::AgentLauncher;
use bridge_manager::build::{HttpArtifactStore, ImageBuilder};
use bridge_manager::cloud::client::format_reports;
use bridge_manager::cloud::{CloudSession, CloudStatusSource, StaticCredentialProvider};
use bridge_manager::identity::container_identity;
use bridge_manager::monitor::{ChatSink, HealthMonitor, MonitorConfig, MonitorDeps, NotificationSink, PagerSink};
use bridge_manager::runtime::{adapter, DockerAdapter, KubernetesAdapter, RuntimeAdapter, StopOutcome};
use bridge_manager::settings::{RuntimeBackend, Settings};

#[derive(Parser)]
#[command(name = "bridge-manager")]
#[command(author, version, about = "Lifecycle and health monitoring for bridge agent containers")]
struct Cli {
    /// Path to the settings file
    #[arg(short, long, default_value = "config/settings.toml")]
    settings: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the agent container image
    Build {
        /// Re-fetch the package artifact even if already downloaded
        #[arg(long)]
        refresh_package: bool,
    },
    /// Run an agent container for a stored credential
    Run {
        /// Credential name; becomes the agent name
        #[arg(short, long)]
        credential: String,

        /// Image tag override; defaults to the selected image
        #[arg(short, long)]
        image: Option<String>,
    },
    /// Stop and remove an agent container
    Stop {
        /// Credential name of the agent
        credential: String,
    },
    /// List managed agent containers
    List,
    /// Show cloud-side agent connection status
    Status,
    /// Run the background health monitor until interrupted
    Monitor {
        /// Run a single poll cycle and exit
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut settings = Settings::load(&cli.settings)?;

    match cli.command {
        Commands::Build { refresh_package } => build_image(&mut settings, refresh_package).await?,
        Commands::Run { credential, image } => run_agent(&settings, &credential, image).await?,
        Commands::Stop { credential } => stop_agent(&settings, &credential).await?,
        Commands::List => list_agents(&settings).await?,
        Commands::Status => show_status(&settings).await?,
        Commands::Monitor { once } => run_monitor(&settings, once).await?,
    }

    Ok(())
}

/// Select the runtime backend once from settings.
async fn make_runtime(settings: &Settings) -> Result<Arc<dyn RuntimeAdapter>> {
    match settings.runtime.backend {
        RuntimeBackend::Docker => {
            let adapter = match settings.runtime.docker_socket.as_deref() {
                Some(socket) => DockerAdapter::with_socket(socket),
                None => DockerAdapter::new(),
            }
            .context("Failed to initialize container engine adapter")?;
            Ok(Arc::new(adapter))
        }
        RuntimeBackend::Kubernetes => {
            let adapter = KubernetesAdapter::new(&settings.runtime.namespace)
                .await
                .context("Failed to initialize cluster adapter")?;
            Ok(Arc::new(adapter))
        }
    }
}

async fn build_image(settings: &mut Settings, refresh_package: bool) -> Result<()> {
    let engine = Arc::new(DockerAdapter::new().context("Failed to initialize container engine")?);
    let build_dir = PathBuf::from("scratch/buildimg");
    let store = Arc::new(HttpArtifactStore::new(&settings.build.package_url, &build_dir));
    let builder = ImageBuilder::new(engine, store, &build_dir);

    let outcome = builder.build(&settings.build, refresh_package).await?;
    for line in &outcome.log {
        println!("{}", line);
    }
    println!("built image: {}", outcome.image);

    // Persist the fetched artifact and the new image selection for
    // subsequent builds and run requests.
    if !settings.build.drivers_only {
        let tag = format!("{}:latest", outcome.image);
        let mut changed = false;
        if outcome.package_file != settings.build.package_file {
            settings.build.package_file = outcome.package_file.clone();
            changed = true;
        }
        if settings.selected_image.as_deref() != Some(tag.as_str()) {
            settings.selected_image = Some(tag);
            changed = true;
        }
        if changed {
            settings.save()?;
        }
    }
    Ok(())
}

async fn run_agent(settings: &Settings, credential_name: &str, image: Option<String>) -> Result<()> {
    let credential = settings
        .credential(credential_name)
        .with_context(|| format!("credential '{}' not found in settings", credential_name))?;
    let image = image
        .or_else(|| settings.selected_image.clone())
        .context("no image selected; build one or pass --image")?;

    let runtime = make_runtime(settings).await?;
    runtime.ping().await?;

    let launcher = AgentLauncher::new(runtime);
    launcher.launch(settings, &credential, &image).await?;
    println!("agent container started for '{}'", credential_name);
    Ok(())
}

async fn stop_agent(settings: &Settings, credential_name: &str) -> Result<()> {
    let identity = container_identity(&settings.cloud.site_name, credential_name)?;
    let runtime = make_runtime(settings).await?;
    match runtime.stop(&identity).await? {
        StopOutcome::Stopped => println!("stopped {}", identity),
        StopOutcome::NotFound => println!("{} is not running", identity),
    }
    Ok(())
}

async fn list_agents(settings: &Settings) -> Result<()> {
    let runtime = make_runtime(settings).await?;
    let containers = runtime.list().await?;
    if containers.is_empty() {
        println!("no managed agent containers");
        return Ok(());
    }
    for container in containers {
        println!("{} [{}]", container.identity, container.status);
        print!("{}", adapter::describe(&container));
    }
    Ok(())
}

async fn show_status(settings: &Settings) -> Result<()> {
    let credential = settings
        .admin_credential()
        .context("no admin credential in settings")?;
    let session = CloudSession::sign_in(
        &settings.cloud.server_url,
        &settings.cloud.site_name,
        &credential,
    )
    .await?;
    let reports = session.agent_reports().await;
    session.sign_out().await;

    for line in format_reports(&reports?) {
        println!("{}", line);
    }
    Ok(())
}

async fn run_monitor(settings: &Settings, once: bool) -> Result<()> {
    let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::new();
    if let Some(key) = settings.monitor.pager_routing_key.as_deref() {
        sinks.push(Arc::new(PagerSink::new(key)));
    }
    if let Some(url) = settings.monitor.chat_webhook_url.as_deref() {
        sinks.push(Arc::new(ChatSink::new(url)));
    }
    if sinks.is_empty() {
        info!("no notification sinks configured; alerts will only be logged");
    }

    let monitor = HealthMonitor::new(MonitorDeps {
        credentials: Arc::new(StaticCredentialProvider::new(settings.admin_credential())),
        source: Arc::new(CloudStatusSource::new(
            &settings.cloud.server_url,
            &settings.cloud.site_name,
        )),
        sinks,
    });

    if once {
        monitor.run_once().await;
        let state = monitor.snapshot();
        println!("verdict: {}", state.last_verdict);
        println!("{}", state.last_message.trim());
        return Ok(());
    }

    monitor.start(MonitorConfig {
        interval: Duration::from_secs(settings.monitor.check_interval_secs),
        only_pools: settings.monitor.only_pools.clone(),
    })?;
    info!(
        interval_secs = settings.monitor.check_interval_secs,
        "health monitor running, press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    monitor.stop().await;
    Ok(())
}
