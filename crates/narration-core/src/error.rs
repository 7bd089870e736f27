use std::path::PathBuf;

/// Failure conditions surfaced by the content engine.
///
/// Malformed caption blocks are not represented here: they are skipped and
/// logged by the parser rather than returned to callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("caption text could not be decoded: {0}")]
    DecodeFailure(String),
    #[error("audio resource contains no frames")]
    EmptyResource,
    #[error("audio resource could not be decoded: {0}")]
    UnreadableResource(String),
    #[error("remote resource unavailable: {url}{}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    RemoteUnavailable { url: String, status: Option<u16> },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("unexpected payload from {url}: {message}")]
    InvalidPayload { url: String, message: String },
    #[error("failed to persist {}: {source}", .path.display())]
    PersistFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {}: {source}", .path.display())]
    LocalRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("chapter has no playable audio")]
    NoAudio,
    #[error("audio output failed: {0}")]
    AudioOutput(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn persist(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::PersistFailure {
            path: path.into(),
            source,
        }
    }

    /// True when the failure came from the network path rather than local state.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Error::RemoteUnavailable { .. } | Error::Transport { .. } | Error::InvalidPayload { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn remote_unavailable_message_includes_status_when_known() {
        let err = Error::RemoteUnavailable {
            url: "http://host/a.mp3".to_string(),
            status: Some(503),
        };
        assert_eq!(
            err.to_string(),
            "remote resource unavailable: http://host/a.mp3 (HTTP 503)"
        );

        let err = Error::RemoteUnavailable {
            url: "http://host/a.mp3".to_string(),
            status: None,
        };
        assert_eq!(err.to_string(), "remote resource unavailable: http://host/a.mp3");
    }

    #[test]
    fn only_network_failures_count_as_remote() {
        assert!(
            Error::Transport {
                url: "u".into(),
                message: "timed out".into()
            }
            .is_remote()
        );
        assert!(!Error::EmptyResource.is_remote());
        assert!(!Error::NoAudio.is_remote());
    }
}
