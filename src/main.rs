use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};

use motorbridge::{
    config::load_config,
    fields::FieldStore,
    motor_controller::{
        simulated::{SimulatedBoard, SimulatedController},
        tmcl::TmclController,
        MotorController,
    },
    socket_server::SocketServer,
    supervisor::BoardSupervisor,
};

#[derive(Debug, Parser)]
#[command(version, about = "Motor-record field bridge for TMCL stepper boards")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "motorbridge.toml")]
    config: PathBuf,

    /// Run against the in-process simulated board
    #[arg(long)]
    simulate: bool,

    #[arg(long, default_value = "info")]
    log_level: Level,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    info!("Loading configuration from: {}", cli.config.display());
    let config = load_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    let driver: Arc<dyn MotorController> = if cli.simulate {
        info!("Using simulated board");
        Arc::new(SimulatedController::new(SimulatedBoard::default()))
    } else {
        info!(
            "Board {} at {}:{}",
            config.board.name, config.board.connection.host, config.board.connection.port
        );
        Arc::new(TmclController::new(
            config.board.name.clone(),
            config.board.connection.clone(),
        ))
    };

    let store = Arc::new(FieldStore::new());
    let mut supervisor = BoardSupervisor::new(config.board.supervisor_config(), driver, store.clone());
    supervisor
        .connect(&config.axes)
        .await
        .context("board initialisation failed")?;
    for axis in config.axes {
        supervisor.register_axis(axis).await?;
    }
    let supervisor = Arc::new(supervisor);

    let mut server = SocketServer::new(config.server, supervisor.clone(), store);
    server.start().await?;
    info!("Serving {} axes", supervisor.axis_ids().len());

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");

    server.shutdown().await?;
    supervisor.shutdown().await?;
    Ok(())
}
