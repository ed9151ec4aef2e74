use std::io;

use crate::journal::JournalError;

pub type Result<T, E = MasterError> = std::result::Result<T, E>;

/// Error classes the gateway maps onto wire-level faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PathNotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    InvalidPath,
    PermissionDenied,
    InvalidArgument,
    FileNotCompleted,
    FileAlreadyCompleted,
    FailedPrecondition,
    MountConflict,
    UfsIoFailure,
    JournalWriteFailure,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("path does not exist: {0}")]
    PathNotFound(String),
    #[error("path already exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("file is not completed: {0}")]
    FileNotCompleted(String),
    #[error("file is already completed: {0}")]
    FileAlreadyCompleted(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("mount conflict: {0}")]
    MountConflict(String),
    #[error("ufs operation on {path} failed: {source}")]
    UfsIo {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("journal failure: {0}")]
    Journal(#[from] JournalError),
    #[error("master halted after a journal failure, mutations are refused")]
    Halted,
    #[error("internal error: {0}")]
    Internal(String),
}

impl MasterError {
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        MasterError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn ufs(path: impl Into<String>, source: io::Error) -> Self {
        MasterError::UfsIo {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MasterError::PathNotFound(_) => ErrorKind::PathNotFound,
            MasterError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            MasterError::NotADirectory(_) => ErrorKind::NotADirectory,
            MasterError::IsADirectory(_) => ErrorKind::IsADirectory,
            MasterError::DirectoryNotEmpty(_) => ErrorKind::DirectoryNotEmpty,
            MasterError::InvalidPath { .. } => ErrorKind::InvalidPath,
            MasterError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            MasterError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            MasterError::FileNotCompleted(_) => ErrorKind::FileNotCompleted,
            MasterError::FileAlreadyCompleted(_) => ErrorKind::FileAlreadyCompleted,
            MasterError::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            MasterError::MountConflict(_) => ErrorKind::MountConflict,
            MasterError::UfsIo { .. } => ErrorKind::UfsIoFailure,
            MasterError::Journal(_) | MasterError::Halted => ErrorKind::JournalWriteFailure,
            MasterError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the failure came from I/O against UFS or the journal.
    pub fn is_io(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UfsIoFailure | ErrorKind::JournalWriteFailure
        )
    }
}
