use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NowPlayingError {
    // Seul échec reconnu côté natif : le démarrage du listener
    #[error("Native start failed for {service}: {reason}")]
    StartFailed { service: String, reason: String },
    #[error("Native start for {service} not acknowledged after {timeout_ms}ms")]
    StartTimeout { service: String, timeout_ms: u64 },
    #[error("Native stop failed for {service}: {reason}")]
    StopFailed { service: String, reason: String },
    #[error("Native Error: {0}")]
    Native(String),
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),
    #[error("Gate command queue is closed")]
    QueueClosed,
    #[error("Config Error: {0}")]
    Config(String),
}

impl NowPlayingError {
    pub fn native(message: &str) -> Self {
        NowPlayingError::Native(message.to_string())
    }

    pub fn start_failed(service: &str, reason: &str) -> Self {
        NowPlayingError::StartFailed {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn stop_failed(service: &str, reason: &str) -> Self {
        NowPlayingError::StopFailed {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` for the failures reported through the start error path.
    pub fn is_start_failure(&self) -> bool {
        matches!(
            self,
            NowPlayingError::StartFailed { .. } | NowPlayingError::StartTimeout { .. }
        )
    }
}
