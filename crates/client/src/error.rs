//! Error types for the study-runner client

use studyrun_protocol::ChannelKind;
use thiserror::Error;

use crate::delivery::DeliveryError;
use crate::http::HttpError;

pub type StudyResult<T> = Result<T, StudyError>;

/// Errors surfaced by session, channel and delivery operations.
///
/// Usage errors are detected locally and never reach the network. Once a
/// run is invalid every operation fails with [`StudyError::InvalidRun`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StudyError {
    #[error("invalid study run")]
    InvalidRun,

    #[error("study run is not initialized")]
    NotInitialized,

    #[error("can start only one component at the same time")]
    ComponentStartInProgress,

    #[error("study is already ending")]
    StudyEnding,

    #[error("unknown component: {0}")]
    UnknownComponent(String),

    #[error("no open {0} channel")]
    NoOpenChannel(ChannelKind),

    #[error("{0} channel is already opening")]
    AlreadyOpening(ChannelKind),

    #[error("{0} channel is already open")]
    AlreadyOpen(ChannelKind),

    #[error("can send only one {0} session patch at a time")]
    SendOneAtATime(ChannelKind),

    #[error("a set-fixed request is already in flight")]
    FixedPending,

    #[error("leaving or reassigning the group is in progress")]
    GroupBusy,

    #[error("not a member of a group")]
    NotJoined,

    #[error("{kind} session patch {id} was rejected by the server")]
    SessionFail { kind: ChannelKind, id: u64 },

    #[error("server error: {0}")]
    Server(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("{0} channel closed")]
    ChannelClosed(ChannelKind),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("invalid URL: {0}")]
    Url(String),
}

impl From<serde_json::Error> for StudyError {
    fn from(err: serde_json::Error) -> Self {
        StudyError::Json(err.to_string())
    }
}

impl From<url::ParseError> for StudyError {
    fn from(err: url::ParseError) -> Self {
        StudyError::Url(err.to_string())
    }
}

impl StudyError {
    /// Usage errors are the caller's fault and are never retried.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            StudyError::NotInitialized
                | StudyError::ComponentStartInProgress
                | StudyError::StudyEnding
                | StudyError::UnknownComponent(_)
                | StudyError::NoOpenChannel(_)
                | StudyError::AlreadyOpening(_)
                | StudyError::AlreadyOpen(_)
                | StudyError::SendOneAtATime(_)
                | StudyError::FixedPending
                | StudyError::GroupBusy
                | StudyError::NotJoined
                | StudyError::InvalidPatch(_)
        )
    }
}
