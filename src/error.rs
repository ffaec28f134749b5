use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use thiserror::Error;

use crate::api::error::{CreateError, GetError, StorageError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("both stages {stages:?} and versions {versions:?} cannot be set")]
    ConflictingSelector { stages: Vec<String>, versions: Vec<String> },
    #[error("cannot locate run {run_id} in version source '{reference}'")]
    MalformedSourceReference { reference: String, run_id: String },
    #[error("backing run {run_id} of model version {version} does not exist at the destination")]
    MissingBackingRun { version: String, run_id: String },
    #[error("copying artifact '{path}' failed after {attempts} attempts: {cause:#}")]
    ArtifactCopy { path: String, attempts: u32, cause: StorageError },
    #[error("destination already has {0}")]
    DestinationConflict(String),
    #[error("model version {name}/{version} was not ready after {waited:?}")]
    RemoteTimeout { name: String, version: String, waited: Duration },
    #[error("the resource {0} does not exist")]
    NotFound(String),
    #[error("tracking server error: {0:#}")]
    Storage(StorageError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid export file: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StorageError> for Error {
    fn from(error: StorageError) -> Self {
        Error::Storage(error)
    }
}

impl From<GetError> for Error {
    fn from(error: GetError) -> Self {
        match error {
            GetError::DoesNotExist(name) => Error::NotFound(name),
            GetError::Storage(error) => Error::Storage(error),
        }
    }
}

impl From<CreateError> for Error {
    fn from(error: CreateError) -> Self {
        match error {
            CreateError::AlreadyExists(name) => Error::DestinationConflict(name),
            CreateError::Storage(error) => Error::Storage(error),
        }
    }
}

/// Flat classification of an [`Error`], as recorded in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Configuration,
    ConflictingSelector,
    MalformedSourceReference,
    MissingBackingRun,
    ArtifactCopy,
    DestinationConflict,
    RemoteTimeout,
    NotFound,
    Storage,
    Io,
    Format,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::ConflictingSelector { .. } => ErrorKind::ConflictingSelector,
            Error::MalformedSourceReference { .. } => ErrorKind::MalformedSourceReference,
            Error::MissingBackingRun { .. } => ErrorKind::MissingBackingRun,
            Error::ArtifactCopy { .. } => ErrorKind::ArtifactCopy,
            Error::DestinationConflict(_) => ErrorKind::DestinationConflict,
            Error::RemoteTimeout { .. } => ErrorKind::RemoteTimeout,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_) => ErrorKind::Format,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
