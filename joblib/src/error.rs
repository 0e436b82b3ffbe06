use std::io;
use std::result;

use thiserror::Error;
use uuid::Uuid;

use crate::job::Status;

/// Errors surfaced by the job layer. The RPC facade maps these onto
/// transport status codes.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no job with id {0}")]
    NotFound(Uuid),

    #[error("operation not allowed while job is {0}")]
    InvalidState(Status),

    #[error("cgroup setup failed: {0}")]
    CgroupSetup(#[source] io::Error),

    #[error("failed to spawn command: {0}")]
    SpawnFailed(#[source] io::Error),

    #[error("output capture failed: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = result::Result<T, Error>;
