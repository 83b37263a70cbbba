use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PageIo,
    PageBusy,
    InvalidAddress,
    CorruptIndexFraming,
    AllocationExhausted,
    SchemaValidation,
    InvalidRequest,
    Parse,
    InvalidState,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }

    pub fn page_io(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::PageIo, context.into())
    }

    pub fn busy(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::PageBusy, context.into())
    }

    pub fn invalid_address(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidAddress, context.into())
    }

    pub fn corrupt(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::CorruptIndexFraming, context.into())
    }

    pub fn exhausted(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::AllocationExhausted, context.into())
    }

    pub fn schema(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::SchemaValidation, context.into())
    }

    pub fn request(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidRequest, context.into())
    }

    pub fn state(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidState, context.into())
    }

    /// Only a lock wait that ran out of retries is worth repeating as-is.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::PageBusy
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::PageIo,
            context: err.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error {
            kind: ErrorKind::Parse,
            context: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::Parse,
            context: format!("JSON error: {}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
