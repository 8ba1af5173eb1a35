//! Error taxonomy shared by every component of the conversation core.
//!
//! Startup and command paths surface these to the caller. Teardown paths log
//! them and carry on, so nothing here is ever retried automatically.

/// Failures specific to the recorder. None of them affect the session.
#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("no supported recording format among: {}", .0.join(", "))]
    UnsupportedFormat(Vec<String>),
    #[error("no active recording")]
    NoActiveRecording,
    #[error("a recording is already in progress")]
    AlreadyRecording,
    #[error("encoder failure: {0}")]
    Encoder(String),
    #[error("unusable label font: {0}")]
    Font(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Credential, token or session-open failure while starting a collaborator.
    #[error("initialization failed: {0}")]
    InitializationFailure(String),
    /// A single conversational turn failed at the remote provider.
    #[error("provider error{}: {message}", status_suffix(.status))]
    Provider {
        status: Option<u16>,
        message: String,
    },
    /// Camera or microphone permission/hardware failure.
    #[error("device error: {0}")]
    Device(String),
    #[error(transparent)]
    Recording(#[from] RecordingError),
    /// A collaborator was used before or after its valid lifetime.
    #[error("{0} is not initialized")]
    NotInitialized(&'static str),
    #[error("refusing to send an empty message")]
    EmptyMessage,
    #[error("no recording available to export")]
    NoArtifact,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            status: None,
            message: message.into(),
        }
    }

    pub fn provider_status(status: u16, message: impl Into<String>) -> Self {
        Self::Provider {
            status: Some(status),
            message: message.into(),
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (status {code})"),
        None => String::new(),
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_includes_status_when_known() {
        let err = Error::provider_status(429, "rate limited");
        assert_eq!(err.to_string(), "provider error (status 429): rate limited");

        let err = Error::provider("connection reset");
        assert_eq!(err.to_string(), "provider error: connection reset");
    }

    #[test]
    fn unsupported_format_lists_candidates() {
        let err = RecordingError::UnsupportedFormat(vec!["video/webm".into(), "video/mp4".into()]);
        assert_eq!(
            err.to_string(),
            "no supported recording format among: video/webm, video/mp4"
        );
    }
}
