//! BioTrack device agent - main entry point

use biotrack_device::config::DeviceConfig;
use biotrack_device::device::sensors::{analyze_offline, SensorHub};
use biotrack_device::device::{DeviceAgent, SimulatedSensors};
use biotrack_device::observability::logging::{init_logging, LogFormat};
use biotrack_device::observability::{init_default_logging, metrics, HealthServer};
use biotrack_device::ota::OtaManager;
use biotrack_device::transport::mqtt::MqttClient;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, Level};

/// BioTrack health monitor device agent
#[derive(Parser)]
#[command(name = "biotrack-device")]
#[command(about = "Device agent for the BioTrack health monitor")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the broker and run the device loop
    Run,
    /// Validate the configuration
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
    /// Run the simulated sensors and analysers offline
    Analyze {
        /// Simulated seconds of sampling
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },
    /// Ask the update server once for new firmware
    OtaCheck,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, log_format_from_env(), false),
        _ => init_logging(Level::TRACE, log_format_from_env(), true),
    }

    info!("Starting BioTrack device agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Analyze { seconds } => handle_analyze_command(&config, seconds).await,
        Commands::OtaCheck => handle_ota_check(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn log_format_from_env() -> LogFormat {
    LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default())
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<DeviceConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(DeviceConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["biotrack.toml", "config/biotrack.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(DeviceConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create biotrack.toml"
                .into())
        }
    }
}

async fn run_agent(config: DeviceConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(device_id = %config.device.id, "Application starting");

    let collector = metrics();
    collector.set_agent_state("initializing");

    let health_server = Arc::new(
        HealthServer::new(config.device.id.clone(), HealthServer::port_from_env())
            .with_sensor_staleness(
                (config.sensors.sample_interval_ms() / 1000).max(1) * 10,
            ),
    );
    tokio::spawn(health_server.clone().start());

    let transport = MqttClient::new(&config.device, config.mqtt.clone()).await?;
    let source = SimulatedSensors::new(config.user.weight_kg);
    let mut agent = DeviceAgent::new(config, transport, source)?;
    agent.set_health_server(health_server.clone());

    agent.start().await?;

    info!("Device agent is running");
    let outcome = agent.run(shutdown_signal()).await;

    info!("Application shutdown initiated");
    if let Err(e) = agent.shutdown().await {
        error!("Error during shutdown: {}", e);
        collector.set_agent_state("error");
        return Err(e.into());
    }
    outcome?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down gracefully..."),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully..."),
    }
}

fn handle_config_command(
    config: &DeviceConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!(device_id = %config.device.id, "Configuration validation complete");
    Ok(())
}

async fn handle_analyze_command(
    config: &DeviceConfig,
    seconds: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut hub = SensorHub::new(
        config.device.id.clone(),
        SimulatedSensors::new(config.user.weight_kg),
        &config.sensors,
        config.user.clone(),
    );
    let summary = analyze_offline(&mut hub, seconds).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn handle_ota_check(config: &DeviceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let Some(section) = &config.ota else {
        return Err("No [ota] section in configuration".into());
    };

    let mut ota = OtaManager::new(
        config.device.id.clone(),
        config.device.firmware_version.clone(),
        section,
        config.storage.data_dir.join("ota"),
    )?;

    let available = ota.check_for_updates().await?;
    let report = serde_json::json!({
        "currentVersion": ota.current_version(),
        "updateAvailable": available,
        "required": ota.is_update_required(),
        "update": ota.latest_update(),
        "status": ota.status_string(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
