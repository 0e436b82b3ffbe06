use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};

use protobuf::job_worker_client::JobWorkerClient;
use protobuf::{
    Command, JobResponse, OutputRequest, QueryRequest, ResourceLimits, StartRequest,
    Status as JobStatus, StopRequest,
};
use thiserror::Error;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid server address: {0}")]
    Address(String),

    #[error("TLS material error: {0}")]
    Tls(String),

    #[error("connection error: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("{0}")]
    Rpc(#[from] tonic::Status),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// 2 when TLS material is unusable, 1 for everything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Tls(_) => 2,
            _ => 1,
        }
    }
}

pub struct ClientCli {
    inner: JobWorkerClient<Channel>,
}

impl ClientCli {
    pub async fn connect(server_addr: &str) -> Result<Self, CliError> {
        let tls = build_tls_config().await?;
        let channel = Channel::from_shared(format!("https://{server_addr}"))
            .map_err(|err| CliError::Address(err.to_string()))?
            .tls_config(tls)?
            .connect()
            .await?;

        Ok(Self {
            inner: JobWorkerClient::new(channel),
        })
    }

    pub async fn start(
        &mut self,
        command: String,
        args: Vec<String>,
        memory_bytes: u64,
        cpu_percentage: i32,
        disk_io_bps: i32,
    ) -> Result<(), CliError> {
        let request = StartRequest {
            command: Some(Command { name: command, args }),
            limits: Some(ResourceLimits {
                memory_bytes,
                cpu_percentage,
                disk_io_bps,
            }),
        };
        let response = self.inner.start(tonic::Request::new(request)).await?;
        print_response(response.into_inner());
        Ok(())
    }

    pub async fn stop(&mut self, job_id: Uuid) -> Result<(), CliError> {
        let request = StopRequest { id: job_id.to_string() };
        let response = self.inner.stop(tonic::Request::new(request)).await?;
        print_response(response.into_inner());
        Ok(())
    }

    pub async fn query(&mut self, job_id: Uuid) -> Result<(), CliError> {
        let request = QueryRequest { id: job_id.to_string() };
        let response = self.inner.query(tonic::Request::new(request)).await?;
        print_response(response.into_inner());
        Ok(())
    }

    /// Stream the job's output to the local stdout/stderr until the server
    /// signals end-of-stream.
    pub async fn output(&mut self, job_id: Uuid) -> Result<(), CliError> {
        let request = OutputRequest { id: job_id.to_string() };
        let response = self.inner.output(tonic::Request::new(request)).await?;
        let mut stream = response.into_inner();

        let mut stdout = std::io::stdout();
        let mut stderr = std::io::stderr();
        while let Some(frame) = stream.message().await? {
            if !frame.stdout.is_empty() {
                if let Err(err) = stdout.write_all(&frame.stdout) {
                    if err.kind() == std::io::ErrorKind::BrokenPipe {
                        break;
                    }
                    return Err(err.into());
                }
            }
            if !frame.stderr.is_empty() {
                let _ = stderr.write_all(&frame.stderr);
            }
        }
        stdout.flush()?;
        Ok(())
    }
}

fn print_response(response: JobResponse) {
    let Some(info) = response.info else {
        println!("(empty response)");
        return;
    };

    println!("job:     {}", info.id);
    println!("status:  {}", status_name(info.status));
    if let Some(command) = info.command {
        println!("command: {} {}", command.name, command.args.join(" "));
    }
    if let Some(limits) = response.limits {
        println!(
            "limits:  memory={}B cpu={}% io={}B/s",
            limits.memory_bytes, limits.cpu_percentage, limits.disk_io_bps
        );
    }
    for change in info.status_changes {
        let at = change
            .changed_at
            .map(|ts| format!("{}.{:09}s", ts.seconds, ts.nanos))
            .unwrap_or_default();
        println!("  {:<9} at {}", status_name(change.status), at);
    }
}

fn status_name(raw: i32) -> &'static str {
    match JobStatus::try_from(raw).unwrap_or(JobStatus::Unspecified) {
        JobStatus::Unspecified => "unspecified",
        JobStatus::Ready => "ready",
        JobStatus::Running => "running",
        JobStatus::Succeeded => "succeeded",
        JobStatus::Failed => "failed",
        JobStatus::Stopped => "stopped",
    }
}

/// Resolve one piece of TLS material: an explicit env var wins, otherwise
/// the default file name under `CLI_CERT_DIR` (default `config/certs`).
fn material_path(var: &str, default_name: &str) -> PathBuf {
    match env::var(var) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => {
            let dir = env::var("CLI_CERT_DIR").unwrap_or_else(|_| "config/certs".to_string());
            Path::new(&dir).join(default_name)
        }
    }
}

async fn build_tls_config() -> Result<ClientTlsConfig, CliError> {
    let ca = read_material(&material_path("CLI_CA_FILE", "ca.pem")).await?;
    let cert = read_material(&material_path("CLI_CERT_FILE", "client-cert.pem")).await?;
    let key = read_material(&material_path("CLI_KEY_FILE", "client-key.pem")).await?;

    Ok(ClientTlsConfig::new()
        .domain_name("localhost")
        .ca_certificate(Certificate::from_pem(ca))
        .identity(Identity::from_pem(cert, key)))
}

async fn read_material(path: &Path) -> Result<Vec<u8>, CliError> {
    tokio::fs::read(path)
        .await
        .map_err(|err| CliError::Tls(format!("{}: {}", path.display(), err)))
}
