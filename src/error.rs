use thiserror::Error;

use crate::types::VirtAddr;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("scan type {scan} is not defined for {value_type}")]
    UnsupportedScanType {
        scan: &'static str,
        value_type: String,
    },

    #[error("backend rejected request: {0}")]
    BackendRejected(String),

    #[error("memory at {addr} ({len} bytes) is not readable")]
    NotReadable { addr: VirtAddr, len: usize },

    #[error("memory at {addr} is not writable")]
    NotWritable { addr: VirtAddr },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cannot decode instruction at {addr}: {reason}")]
    Decode { addr: VirtAddr, reason: String },

    #[error("target process terminated")]
    TargetTerminated,

    #[error("invalid pattern: {0}")]
    Regex(#[from] regex::Error),
}

impl Error {
    /// Whether the backend refused a single unit of work (a read, a write,
    /// a trap). Scans and dissection skip such units after the first read.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Error::BackendRejected(_)
                | Error::NotReadable { .. }
                | Error::NotWritable { .. }
                | Error::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
