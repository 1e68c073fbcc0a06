use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use courier_daemon::{Server, Shutdown};

use crate::{cli::arguments, config::DaemonConfigFile};

/// Exit code asking the supervisor to restart us.
const EXIT_RESTART: u8 = 1;
/// Exit code for configuration and option errors.
const EXIT_BAD_OPTIONS: u8 = 2;

pub async fn run(args: arguments::Run) -> ExitCode {
    let config = match DaemonConfigFile::from_path(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("courierd: cannot load {}: {err}", args.config.display());
            return ExitCode::from(EXIT_BAD_OPTIONS);
        }
    };

    let level = config.logger.level_filter();
    let filter = Targets::new()
        .with_target("courier", level)
        .with_target("net", level)
        .with_target("dispatch", level)
        .with_target("reactor", level)
        .with_default(LevelFilter::INFO);

    if let Err(err) = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .try_init()
    {
        eprintln!("courierd: cannot initialize logging: {err}");
        return ExitCode::from(EXIT_BAD_OPTIONS);
    }

    let daemon_config = match config.into_daemon_config() {
        Ok(config) => config,
        Err(err) => {
            error!("Invalid configuration: {err}");
            return ExitCode::from(EXIT_BAD_OPTIONS);
        }
    };

    let server = match Server::new(daemon_config) {
        Ok(server) => server,
        Err(err) => {
            error!("Cannot start daemon: {err}");
            return ExitCode::FAILURE;
        }
    };

    let cancellation = CancellationToken::new();

    match server.run(cancellation).await {
        Ok(Shutdown::Clean) => {
            info!("Stopped");
            ExitCode::SUCCESS
        }
        Ok(Shutdown::Restart) => {
            info!("Restart requested");
            ExitCode::from(EXIT_RESTART)
        }
        Err(err) => {
            error!("Daemon failed: {err}");
            ExitCode::from(EXIT_RESTART)
        }
    }
}
