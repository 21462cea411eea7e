use clap::Parser;
use log::{error, info};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

use flowgate::application_state::{init_config, shutdown_on_ctrl_c, ApplicationState};
use flowgate::cli::Args;

#[tokio::main]
async fn main() -> ExitCode {
    // Setup logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    let args = Args::parse();

    let (config_cache, config) = match init_config(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration init failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let app_state = ApplicationState::new(config_cache);
    info!("Loaded configuration from {}", app_state.config.path());

    if args.check {
        info!("Configuration is valid");
        return ExitCode::SUCCESS;
    }

    let stop = CancellationToken::new();
    shutdown_on_ctrl_c(stop.clone());

    match ApplicationState::init_components(config, stop).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Unable to start pipeline: {}", e);
            ExitCode::FAILURE
        }
    }
}
