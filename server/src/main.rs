mod config;
mod services;
mod tls;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use joblib::{SystemClock, WorkerSettings};
use protobuf::job_worker_server::JobWorkerServer;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use config::ServerConfig;
use services::jobservice::JobWorkerService;
use tls::TlsMaterial;

/// Remote job worker supervisor.
#[derive(Debug, Parser)]
#[command(name = "jobworker-server")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "config/server.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::load(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let tls = TlsMaterial::load(&config.certs).await?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let settings = WorkerSettings {
        worker_name: config.worker_name.clone(),
        cgroup_root: config.cgroup_root.clone(),
        spool_dir: config.spool_dir.clone(),
    };
    let service = JobWorkerService::new(settings, Arc::new(SystemClock));

    tracing::info!(%addr, worker = %config.worker_name, "listening for connections");

    Server::builder()
        .tls_config(tls.server_tls_config())?
        .add_service(JobWorkerServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}
