use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Corrupt(&'static str),
    UnsupportedVersion(u8),
    Integrity { block: u64, offset: u64 },
    CodecEncode { block: u64, reason: String },
    CodecDecode { block: u64, reason: String },
    RangeOutOfBounds { lo: u64, hi: u64, total: u64 },
    Usage(&'static str),
    Cancelled,
    InputMalformed,
}

impl Error {
    /// Process exit code for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Io(_) => 3,
            Error::Corrupt(_) | Error::UnsupportedVersion(_) => 4,
            Error::Integrity { .. } | Error::InputMalformed => 4,
            Error::CodecEncode { .. } | Error::CodecDecode { .. } => 5,
            Error::RangeOutOfBounds { .. } | Error::Usage(_) => 2,
            Error::Cancelled => 6,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Corrupt(msg) => write!(f, "container malformed: {msg}"),
            Error::UnsupportedVersion(version) => {
                write!(f, "container malformed: unsupported version {version}")
            }
            Error::Integrity { block, offset } => {
                write!(f, "integrity failure: block {block}, byte offset {offset}")
            }
            Error::CodecEncode { block, reason } => {
                write!(f, "codec encode failure: block {block}: {reason}")
            }
            Error::CodecDecode { block, reason } => {
                write!(f, "codec decode failure: block {block}: {reason}")
            }
            Error::RangeOutOfBounds { lo, hi, total } => {
                write!(f, "row range {lo}..{hi} out of bounds: container has {total} rows")
            }
            Error::Usage(msg) => write!(f, "usage error: {msg}"),
            Error::Cancelled => write!(f, "cancelled"),
            Error::InputMalformed => write!(f, "input malformed: unstructurable rows past guard"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
