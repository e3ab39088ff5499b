use thiserror::Error;

use crate::task::StreamKind;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid task state: {0}")]
    InvalidState(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{0}")]
    Integrity(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("{0}")]
    Mux(String),
    #[error("failed to fetch metadata: {0}")]
    Metadata(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("{stream} download failed: {source}")]
    Phase {
        stream: StreamKind,
        #[source]
        source: Box<CoreError>,
    },
}

impl CoreError {
    pub fn in_phase(self, stream: StreamKind) -> Self {
        CoreError::Phase {
            stream,
            source: Box::new(self),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
