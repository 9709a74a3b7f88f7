use std::io;
use thiserror::Error;
use crate::envelope::RecvMeta;

pub type MuxResult<T> = Result<T, MuxError>;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("use of closed connection")]
    Closed,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The destination buffer was smaller than the received datagram. The datagram was still
    ///  delivered: `meta.len` bytes of it were copied into the destination buffer.
    #[error("short buffer: {} of {packet_len} bytes copied", meta.len)]
    ShortBuffer {
        packet_len: usize,
        meta: RecvMeta,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("transport error: {0}")]
    Transport(io::Error),
}

impl MuxError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, MuxError::DeadlineExceeded)
    }

    pub(crate) fn unsupported(what: &str) -> MuxError {
        MuxError::Unsupported(what.to_string())
    }
}

impl From<io::Error> for MuxError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::Unsupported => MuxError::Unsupported(e.to_string()),
            io::ErrorKind::TimedOut => MuxError::DeadlineExceeded,
            _ => MuxError::Transport(e),
        }
    }
}
