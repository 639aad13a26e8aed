use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use checkly_operator::checkly::{ChecklyApi, ChecklyClient, ChecklyCredentials};
use checkly_operator::config::{ConfigOverrides, OperatorConfig};
use checkly_operator::{controller, leader, telemetry, Error};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Checkly Operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            Ok(())
        }
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    let config = OperatorConfig::load(&args.overrides)?;
    telemetry::init_logging(config.log_format);

    info!("Starting Checkly Operator v{}", env!("CARGO_PKG_VERSION"));

    let credentials = ChecklyCredentials::from_env()?;
    let checkly: Arc<dyn ChecklyApi> = Arc::new(ChecklyClient::new(&config.api_url, credentials)?);

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let is_leader = Arc::new(AtomicBool::new(!config.leader_elect));
    if config.leader_elect {
        let identity = leader::holder_identity();
        info!("Leader election using holder ID: {}", identity);

        let lease_client = client.clone();
        let lease_ns = config.namespace.clone();
        let is_leader_bg = Arc::clone(&is_leader);
        tokio::spawn(async move {
            leader::run_leader_election(lease_client, &lease_ns, &identity, is_leader_bg).await;
        });
    }

    let state = Arc::new(controller::ControllerState::new(
        client,
        config,
        Arc::clone(&is_leader),
    ));

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = checkly_operator::rest_api::run_server(api_state).await {
                tracing::error!("HTTP server error: {:?}", e);
            }
        });
    }

    if state.config.leader_elect {
        info!("Waiting for leadership before starting controllers");
        leader::wait_for_leadership(&is_leader).await;
    }

    let result = controller::run_controllers(state, checkly).await;

    // Flush any remaining traces
    telemetry::shutdown_telemetry();

    result
}
