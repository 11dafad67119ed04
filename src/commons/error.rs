//! Defines all certward server side errors.

use std::{fmt, io};

use crate::daemon::ca::CaError;

//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // System Issues
    //-----------------------------------------------------------------
    /// I/O problem, typically during startup.
    IoError(io::Error),

    /// A message body could not be serialized or deserialized.
    JsonError(serde_json::Error),

    /// The broker refused an operation, e.g. publishing to an unknown
    /// exchange or consuming a queue that is already consumed.
    Bus(String),

    //-----------------------------------------------------------------
    // RPC-over-queue Issues
    //-----------------------------------------------------------------
    /// No reply arrived within the configured deadline.
    RpcTimeout(String),

    /// The reply stream ended before the close sentinel was seen.
    RpcClosed(String),

    //-----------------------------------------------------------------
    // External Collaborators
    //-----------------------------------------------------------------
    /// The certificate authority reported a failure.
    CaClient(CaError),

    /// The subject store reported a failure.
    Store(String),

    /// Key, CSR or certificate handling failed.
    Crypto(String),

    //-----------------------------------------------------------------
    // API Client Issues
    //-----------------------------------------------------------------
    /// The request asked for a subject that does not exist.
    SubjectUnknown(String),

    /// A subject with this name is already managed.
    SubjectExists(String),

    /// The caller presented no token, or an invalid one.
    Unauthorized,

    /// The caller's identity is not among the subject's targets.
    Forbidden(String),

    /// The request was syntactically invalid.
    ApiInvalid(String),

    /// Catch-all for errors that need no dedicated variant.
    Custom(String),
}

impl Error {
    pub fn custom(msg: impl fmt::Display) -> Self {
        Error::Custom(msg.to_string())
    }

    pub fn bus(msg: impl fmt::Display) -> Self {
        Error::Bus(msg.to_string())
    }

    pub fn store(msg: impl fmt::Display) -> Self {
        Error::Store(msg.to_string())
    }

    pub fn crypto(msg: impl fmt::Display) -> Self {
        Error::Crypto(msg.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IoError(e) => e.fmt(f),
            Error::JsonError(e) => write!(f, "Invalid JSON: {e}"),
            Error::Bus(msg) => write!(f, "Bus error: {msg}"),
            Error::RpcTimeout(queue) => {
                write!(f, "No reply on '{queue}' before deadline")
            }
            Error::RpcClosed(queue) => {
                write!(f, "Reply stream on '{queue}' ended unexpectedly")
            }
            Error::CaClient(e) => write!(f, "CA error: {e}"),
            Error::Store(msg) => write!(f, "Store error: {msg}"),
            Error::Crypto(msg) => write!(f, "Crypto error: {msg}"),
            Error::SubjectUnknown(name) => {
                write!(f, "Subject '{name}' is unknown")
            }
            Error::SubjectExists(name) => {
                write!(f, "Subject '{name}' already exists")
            }
            Error::Unauthorized => write!(f, "Invalid credentials"),
            Error::Forbidden(identity) => {
                write!(f, "Caller '{identity}' may not access this subject")
            }
            Error::ApiInvalid(msg) => write!(f, "Invalid request: {msg}"),
            Error::Custom(msg) => msg.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JsonError(e)
    }
}

impl From<CaError> for Error {
    fn from(e: CaError) -> Self {
        Error::CaClient(e)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::Crypto(e.to_string())
    }
}

//------------ ErrorResponse -------------------------------------------------

/// The JSON body returned to API clients on failure.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct ErrorResponse {
    label: String,
    msg: String,
}

impl ErrorResponse {
    pub fn new(label: &str, msg: impl fmt::Display) -> Self {
        ErrorResponse {
            label: label.to_string(),
            msg: msg.to_string(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Error {
    /// The HTTP status code the front door maps this error to.
    pub fn status(&self) -> u16 {
        match self {
            Error::SubjectUnknown(_) => 404,
            Error::SubjectExists(_) => 409,
            Error::ApiInvalid(_) | Error::JsonError(_) => 400,
            Error::Unauthorized => 401,
            Error::Forbidden(_) => 403,
            _ => 500,
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        let label = match self {
            Error::SubjectUnknown(_) => "subject-unknown",
            Error::SubjectExists(_) => "subject-exists",
            Error::ApiInvalid(_) | Error::JsonError(_) => "invalid-request",
            Error::Unauthorized => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::RpcTimeout(_) => "timeout",
            _ => "internal-error",
        };
        ErrorResponse::new(label, self)
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.msg)
    }
}
