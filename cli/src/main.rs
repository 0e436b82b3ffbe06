mod client_cli;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use client_cli::{ClientCli, CliError};

/// Client for the remote job worker.
#[derive(Debug, Parser)]
#[command(name = "jobworker")]
struct Cli {
    /// The host:port of the server
    #[arg(short = 's', long = "server", default_value = "localhost:8443")]
    server: String,

    #[command(subcommand)]
    sub_command: SubCommand,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Launch a command on the worker
    Start {
        /// The executable to run
        #[arg(long)]
        command: String,

        /// Arguments passed to the command (use --args=-x for hyphen values)
        #[arg(long, num_args = 0..)]
        args: Vec<String>,

        /// Memory ceiling in bytes (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        memory_bytes: u64,

        /// CPU ceiling as a percentage of one core (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        cpu_percentage: i32,

        /// Disk read/write ceiling in bytes per second (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        disk_io_bps: i32,
    },
    /// Kill a running job
    Stop { job_id: Uuid },
    /// Show a job's status and history
    Query { job_id: Uuid },
    /// Replay a job's output and tail it until the job finishes
    Output { job_id: Uuid },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let mut client = ClientCli::connect(&cli.server).await?;
    match cli.sub_command {
        SubCommand::Start {
            command,
            args,
            memory_bytes,
            cpu_percentage,
            disk_io_bps,
        } => {
            client
                .start(command, args, memory_bytes, cpu_percentage, disk_io_bps)
                .await
        }
        SubCommand::Stop { job_id } => client.stop(job_id).await,
        SubCommand::Query { job_id } => client.query(job_id).await,
        SubCommand::Output { job_id } => client.output(job_id).await,
    }
}
