//! Error taxonomy for the edge service.
//!
//! Every fallible path in the pipeline eventually reduces to one of the ten
//! error kinds named in the service's policy: a handful reject at the
//! association level, most cause a quarantine with the kind recorded as the
//! reason, and `io-error` on the spool escalates to a fatal abort.

use std::path::PathBuf;

use snafu::Snafu;

/// The ten error kinds the orchestration policy dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedIdentifier,
    IncompleteStudy,
    RoiEmpty,
    CoordinateMismatch,
    CodecError,
    IoError,
    SendTransient,
    SendFatal,
    ConfigError,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MalformedIdentifier => "malformed-identifier",
            ErrorKind::IncompleteStudy => "incomplete-study",
            ErrorKind::RoiEmpty => "roi-empty",
            ErrorKind::CoordinateMismatch => "coordinate-mismatch",
            ErrorKind::CodecError => "codec-error",
            ErrorKind::IoError => "io-error",
            ErrorKind::SendTransient => "send-transient",
            ErrorKind::SendFatal => "send-fatal",
            ErrorKind::ConfigError => "config-error",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("study identifier rejected: {reason}"))]
    MalformedIdentifier { reason: String },

    #[snafu(display("study {study} is incomplete: {reason}"))]
    IncompleteStudy { study: String, reason: String },

    #[snafu(display("no ROI survived filtering"))]
    RoiEmpty,

    #[snafu(display("coordinate mismatch: {reason}"))]
    CoordinateMismatch { reason: String },

    #[snafu(display("DICOM codec error: {source}"))]
    Codec {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("I/O error at {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("transient send failure: {reason}"))]
    SendTransient { reason: String },

    #[snafu(display("fatal send failure: {reason}"))]
    SendFatal { reason: String },

    #[snafu(display("configuration error: {reason}"))]
    Config { reason: String },

    #[snafu(display("internal error: {reason}"))]
    Internal { reason: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedIdentifier { .. } => ErrorKind::MalformedIdentifier,
            Error::IncompleteStudy { .. } => ErrorKind::IncompleteStudy,
            Error::RoiEmpty => ErrorKind::RoiEmpty,
            Error::CoordinateMismatch { .. } => ErrorKind::CoordinateMismatch,
            Error::Codec { .. } => ErrorKind::CodecError,
            Error::Io { .. } => ErrorKind::IoError,
            Error::SendTransient { .. } => ErrorKind::SendTransient,
            Error::SendFatal { .. } => ErrorKind::SendFatal,
            Error::Config { .. } => ErrorKind::ConfigError,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Error::Internal {
            reason: reason.into(),
        }
    }

    pub fn codec(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Codec {
            source: Box::new(source),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
