use thiserror::Error;
use vscreen_core::VScreenError;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture stopped")]
    Stopped,

    #[error("Timed out waiting for a frame")]
    Timeout,

    #[error("Setup failed: {0}")]
    Setup(#[from] VScreenError),

    #[error("Failed to spawn producer thread: {0}")]
    ProducerSpawn(#[source] std::io::Error),
}

/// Failure of the display subsystem's readiness wait.
#[derive(Error, Debug)]
pub enum WaitError {
    /// The wait was interrupted by a signal; the caller retries.
    #[error("Readiness wait interrupted")]
    Interrupted,

    #[error("Readiness wait failed: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for WaitError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::Interrupted {
            Self::Interrupted
        } else {
            Self::Io(err)
        }
    }
}
