use thiserror::Error;

/// One variant per failure kind the toolkit distinguishes. C1-C3 retry
/// locally where a mirror allows it; everything else propagates with `?`.
#[derive(Error, Debug)]
pub enum BtrfsError {
    #[error("read failed on devid {devid} at {offset}: {source}")]
    IoRead {
        devid: u64,
        offset: u64,
        source: std::io::Error,
    },
    #[error("write failed on devid {devid} at {offset}: {source}")]
    IoWrite {
        devid: u64,
        offset: u64,
        source: std::io::Error,
    },
    #[error("checksum mismatch at bytenr {bytenr} mirror {mirror}")]
    BadChecksum { bytenr: u64, mirror: u16 },
    #[error("transid mismatch at bytenr {bytenr}: found {found}, wanted {wanted}")]
    BadTransid {
        bytenr: u64,
        found: u64,
        wanted: u64,
    },
    #[error("structural check failed at bytenr {bytenr}: {reason}")]
    Structural { bytenr: u64, reason: String },
    #[error("key not found")]
    NotFound,
    #[error("item already exists")]
    Exists,
    #[error("no space left for {needed} bytes of {kind}")]
    NoSpace { kind: &'static str, needed: u64 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("filesystem is corrupt: {0}")]
    Corrupt(String),
    #[error("incompatible feature flags {flags:#x}")]
    IncompatFeature { flags: u64 },
    #[error("a transaction is already running")]
    TransactionInProgress,
}

pub type Result<T> = std::result::Result<T, BtrfsError>;

impl BtrfsError {
    pub fn corrupt(msg: impl Into<String>) -> BtrfsError {
        BtrfsError::Corrupt(msg.into())
    }

    pub fn structural(bytenr: u64, reason: impl Into<String>) -> BtrfsError {
        BtrfsError::Structural {
            bytenr,
            reason: reason.into(),
        }
    }

    /// not_found is an expected outcome on insert paths; everything else is not
    pub fn is_not_found(&self) -> bool {
        matches!(self, BtrfsError::NotFound)
    }
}
