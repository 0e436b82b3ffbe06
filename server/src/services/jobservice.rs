//! The service facade: translates RPC requests into registry and job
//! operations and couples output readers to response streams.

use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use futures::Stream;
use joblib::{
    Clock, CommandSpec, Error as JobError, Job, JobRegistry, Observation, OutputKind,
    OutputReader, ResourceLimits, WorkerSettings,
};
use protobuf::job_worker_server::JobWorker;
use protobuf::{
    JobInfo, JobResponse, OutputRequest, OutputResponse, QueryRequest, StartRequest, StopRequest,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use uuid::Uuid;

pub struct JobWorkerService {
    settings: WorkerSettings,
    clock: Arc<dyn Clock>,
    registry: JobRegistry,
}

impl JobWorkerService {
    pub fn new(settings: WorkerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            registry: JobRegistry::new(),
        }
    }

    fn lookup(&self, raw_id: &str) -> Result<Arc<Job>, Status> {
        let id = parse_job_id(raw_id)?;
        self.registry
            .get(&id)
            .ok_or_else(|| to_status(&JobError::NotFound(id)))
    }
}

#[tonic::async_trait]
impl JobWorker for JobWorkerService {
    type OutputStream = Pin<Box<dyn Stream<Item = Result<OutputResponse, Status>> + Send>>;

    async fn start(
        &self,
        req: Request<StartRequest>,
    ) -> Result<Response<JobResponse>, Status> {
        let (command, limits) = parse_start_request(req.into_inner())?;
        tracing::debug!(program = %command.program, ?limits, "handling start request");

        let job = Job::new(&self.settings, Arc::clone(&self.clock), limits, command)
            .map_err(|err| to_status(&err))?;
        job.start().map_err(|err| to_status(&err))?;
        self.registry.insert(Arc::clone(&job));

        Ok(Response::new(to_response(job.observe())))
    }

    async fn stop(&self, req: Request<StopRequest>) -> Result<Response<JobResponse>, Status> {
        let id = req.into_inner().id;
        tracing::debug!(%id, "handling stop request");

        let job = self.lookup(&id)?;
        job.stop().map_err(|err| to_status(&err))?;

        Ok(Response::new(to_response(job.observe())))
    }

    async fn query(&self, req: Request<QueryRequest>) -> Result<Response<JobResponse>, Status> {
        let id = req.into_inner().id;
        tracing::debug!(%id, "handling query request");

        let job = self.lookup(&id)?;
        Ok(Response::new(to_response(job.observe())))
    }

    async fn output(
        &self,
        req: Request<OutputRequest>,
    ) -> Result<Response<Self::OutputStream>, Status> {
        let id = req.into_inner().id;
        tracing::debug!(%id, "handling output request");

        let job = self.lookup(&id)?;
        let stdout = job.open_output(OutputKind::Stdout).map_err(|err| to_status(&err))?;
        let stderr = job.open_output(OutputKind::Stderr).map_err(|err| to_status(&err))?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(pump_output(stdout, stderr, tx));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::OutputStream))
    }
}

/// Couples a pair of output readers to one client stream. Frame size is
/// bounded by the readers' chunk size. Ends at end-of-stream on both
/// readers, or as soon as the client goes away.
async fn pump_output(
    mut stdout: OutputReader,
    mut stderr: OutputReader,
    tx: mpsc::Sender<Result<OutputResponse, Status>>,
) {
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        let (chunk, open) = tokio::select! {
            chunk = stdout.next_chunk(), if stdout_open => {
                let frame = chunk.map(|chunk| {
                    chunk.map(|bytes| OutputResponse { stdout: bytes.to_vec(), stderr: Vec::new() })
                });
                (frame, &mut stdout_open)
            }
            chunk = stderr.next_chunk(), if stderr_open => {
                let frame = chunk.map(|chunk| {
                    chunk.map(|bytes| OutputResponse { stdout: Vec::new(), stderr: bytes.to_vec() })
                });
                (frame, &mut stderr_open)
            }
        };

        match chunk {
            Ok(Some(frame)) => {
                if tx.send(Ok(frame)).await.is_err() {
                    // client cancelled or hit its deadline; drop the readers
                    return;
                }
            }
            Ok(None) => *open = false,
            Err(err) => {
                tracing::error!(%err, "output stream aborted");
                let _ = tx.send(Err(Status::internal("output capture failed"))).await;
                return;
            }
        }
    }
}

fn parse_job_id(raw: &str) -> Result<Uuid, Status> {
    Uuid::try_parse(raw).map_err(|_| Status::invalid_argument(format!("malformed job id: {raw}")))
}

fn parse_start_request(req: StartRequest) -> Result<(CommandSpec, ResourceLimits), Status> {
    let command = req
        .command
        .ok_or_else(|| Status::invalid_argument("command is required"))?;
    if command.name.is_empty() {
        return Err(Status::invalid_argument("command name must not be empty"));
    }

    let limits = req.limits.unwrap_or_default();
    if limits.cpu_percentage < 0 || limits.disk_io_bps < 0 {
        return Err(Status::invalid_argument("resource limits must not be negative"));
    }

    Ok((
        CommandSpec {
            program: command.name,
            args: command.args,
        },
        ResourceLimits {
            memory_bytes: limits.memory_bytes,
            cpu_percentage: limits.cpu_percentage,
            disk_io_bps: limits.disk_io_bps,
        },
    ))
}

fn to_status(err: &JobError) -> Status {
    match err {
        JobError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        JobError::NotFound(_) => Status::not_found(err.to_string()),
        JobError::InvalidState(_) => Status::failed_precondition(err.to_string()),
        JobError::CgroupSetup(_)
        | JobError::SpawnFailed(_)
        | JobError::Io(_)
        | JobError::Internal(_) => Status::internal(err.to_string()),
    }
}

fn to_proto_status(status: joblib::Status) -> protobuf::Status {
    match status {
        joblib::Status::Ready => protobuf::Status::Ready,
        joblib::Status::Running => protobuf::Status::Running,
        joblib::Status::Succeeded => protobuf::Status::Succeeded,
        joblib::Status::Failed => protobuf::Status::Failed,
        joblib::Status::Stopped => protobuf::Status::Stopped,
    }
}

fn to_timestamp(at: SystemTime) -> prost_types::Timestamp {
    prost_types::Timestamp::from(at)
}

fn to_response(observation: Observation) -> JobResponse {
    JobResponse {
        info: Some(JobInfo {
            id: observation.id.to_string(),
            status: to_proto_status(observation.status) as i32,
            created: Some(to_timestamp(observation.created)),
            status_changes: observation
                .history
                .iter()
                .map(|change| protobuf::StatusChange {
                    status: to_proto_status(change.status) as i32,
                    changed_at: Some(to_timestamp(change.changed_at)),
                })
                .collect(),
            command: Some(protobuf::Command {
                name: observation.command.program.clone(),
                args: observation.command.args.clone(),
            }),
        }),
        limits: Some(protobuf::ResourceLimits {
            memory_bytes: observation.limits.memory_bytes,
            cpu_percentage: observation.limits.cpu_percentage,
            disk_io_bps: observation.limits.disk_io_bps,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn start_request(name: &str, cpu: i32, io: i32) -> StartRequest {
        StartRequest {
            command: Some(protobuf::Command {
                name: name.to_string(),
                args: vec!["-n".to_string()],
            }),
            limits: Some(protobuf::ResourceLimits {
                memory_bytes: 1024,
                cpu_percentage: cpu,
                disk_io_bps: io,
            }),
        }
    }

    #[test]
    fn empty_command_name_is_invalid() {
        let err = parse_start_request(start_request("", 0, 0)).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn missing_command_is_invalid() {
        let err = parse_start_request(StartRequest { command: None, limits: None }).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn negative_limits_are_invalid() {
        let err = parse_start_request(start_request("echo", -1, 0)).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        let err = parse_start_request(start_request("echo", 0, -1)).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn valid_request_carries_command_and_limits() {
        let (command, limits) = parse_start_request(start_request("echo", 50, 0)).unwrap();
        assert_eq!(command.program, "echo");
        assert_eq!(command.args, vec!["-n".to_string()]);
        assert_eq!(limits.memory_bytes, 1024);
        assert_eq!(limits.cpu_percentage, 50);
    }

    #[test]
    fn missing_limits_default_to_unlimited() {
        let request = StartRequest {
            command: Some(protobuf::Command { name: "echo".to_string(), args: vec![] }),
            limits: None,
        };
        let (_, limits) = parse_start_request(request).unwrap();
        assert_eq!(limits, ResourceLimits::default());
    }

    #[test]
    fn malformed_id_is_invalid_argument() {
        let err = parse_job_id("not-a-uuid").unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn error_mapping_matches_taxonomy() {
        let id = Uuid::new_v4();
        assert_eq!(to_status(&JobError::NotFound(id)).code(), tonic::Code::NotFound);
        assert_eq!(
            to_status(&JobError::InvalidState(joblib::Status::Stopped)).code(),
            tonic::Code::FailedPrecondition
        );
        assert_eq!(
            to_status(&JobError::InvalidArgument("empty".to_string())).code(),
            tonic::Code::InvalidArgument
        );
        assert_eq!(
            to_status(&JobError::Internal("invariant".to_string())).code(),
            tonic::Code::Internal
        );
        assert_eq!(
            to_status(&JobError::SpawnFailed(std::io::Error::other("no such file"))).code(),
            tonic::Code::Internal
        );
    }

    #[tokio::test]
    async fn query_for_unknown_id_is_not_found() {
        let service = JobWorkerService::new(
            WorkerSettings::default(),
            Arc::new(joblib::SystemClock),
        );
        let request = Request::new(QueryRequest { id: Uuid::new_v4().to_string() });
        let err = service.query(request).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn stop_with_malformed_id_is_invalid_argument() {
        let service = JobWorkerService::new(
            WorkerSettings::default(),
            Arc::new(joblib::SystemClock),
        );
        let request = Request::new(StopRequest { id: "definitely-not-a-uuid".to_string() });
        let err = service.stop(request).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn output_for_unknown_id_is_not_found() {
        let service = JobWorkerService::new(
            WorkerSettings::default(),
            Arc::new(joblib::SystemClock),
        );
        let request = Request::new(OutputRequest { id: Uuid::new_v4().to_string() });
        let err = service.output(request).await.err().unwrap();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[test]
    fn observation_converts_to_full_response() {
        let id = Uuid::new_v4();
        let created = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let later = created + Duration::from_millis(250);
        let observation = Observation {
            id,
            status: joblib::Status::Running,
            history: vec![
                joblib::StatusChange { status: joblib::Status::Ready, changed_at: created },
                joblib::StatusChange { status: joblib::Status::Running, changed_at: later },
            ],
            command: CommandSpec {
                program: "sleep".to_string(),
                args: vec!["30".to_string()],
            },
            created,
            limits: ResourceLimits { memory_bytes: 64, cpu_percentage: 100, disk_io_bps: 0 },
        };

        let response = to_response(observation);
        let info = response.info.expect("info present");
        assert_eq!(info.id, id.to_string());
        assert_eq!(info.status, protobuf::Status::Running as i32);
        assert_eq!(info.status_changes.len(), 2);
        assert_eq!(info.status_changes[0].status, protobuf::Status::Ready as i32);
        assert_eq!(
            info.command.expect("command present").name,
            "sleep".to_string()
        );
        let limits = response.limits.expect("limits present");
        assert_eq!(limits.memory_bytes, 64);
        assert_eq!(limits.cpu_percentage, 100);
    }
}
