use std::path::PathBuf;

/// Transport-level failures surfaced by protocol adapters.
///
/// These never abort a session: the session manager records the error
/// on the printer and reconnects with backoff.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("printer unreachable: {0}")]
    Unreachable(String),

    #[error("authentication rejected")]
    AuthRejected,

    #[error("operation timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("command rejected by device: {0}")]
    Rejected(String),
}

/// Failures while parsing or storing an uploaded artifact.
///
/// Surfaced synchronously to the submitting caller; never retried.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("unsupported artifact extension: {0}")]
    UnsupportedExtension(String),

    #[error("artifact exceeds {limit} byte upload limit ({actual} bytes)")]
    Oversized { limit: u64, actual: u64 },

    #[error("zip expands to {total} bytes, over the {limit} byte guard")]
    ZipBomb { total: u64, limit: u64 },

    #[error("invalid artifact: {0}")]
    Parse(String),

    #[error("unsafe file name: {0}")]
    UnsafeName(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures moving a scheduled job onto hardware.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("job {job_id} is {status}, expected scheduled")]
    NotScheduled { job_id: i64, status: String },

    #[error("job {0} has no assigned printer")]
    NoPrinter(i64),

    #[error("job {0} has no linked print artifact")]
    NoArtifact(i64),

    #[error("artifact incompatible with printer: {0}")]
    Incompatible(String),

    #[error("upload failed after {attempts} attempts: {source}")]
    UploadFailed {
        attempts: u32,
        #[source]
        source: AdapterError,
    },

    #[error("print start not confirmed within {0:?}")]
    StartTimeout(std::time::Duration),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

/// Scheduler pass failures. Per-job skips are not errors; they are
/// recorded on the run. This covers whole-pass problems only.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler run already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption key is not valid base64")]
    BadKeyEncoding,

    #[error("encryption key must be 32 bytes, got {0}")]
    BadKeyLength(usize),

    #[error("ciphertext is malformed or key mismatch")]
    Decrypt,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}
