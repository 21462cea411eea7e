use std::io;
use std::time::Duration;
use thiserror::Error;

/// A forwarding filter that cannot be compiled. Raised at startup, never
/// while matching.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("{field}: '{value}' is neither an IP address nor a CIDR block")]
    InvalidAddress { field: &'static str, value: String },
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
    #[error("{field}: '{value}' is not a range, expected 'min-max', 'min-', '-max' or a single value")]
    InvalidRange { field: &'static str, value: String },
    #[error("{field}: range '{value}' has its lower bound above its upper bound")]
    InvertedRange { field: &'static str, value: String },
    #[error("{field}: '{value}' is not a number")]
    InvalidNumber { field: &'static str, value: String },
    #[error("custom rule refers to unknown field '{0}'")]
    UnknownField(String),
    #[error("custom rule on '{field}' cannot use value '{value}'")]
    InvalidRuleValue { field: String, value: String },
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unable to resolve {0}")]
    Resolve(String),
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("reconnecting to {endpoint} suspended for another {retry_in:?}")]
    Backoff { endpoint: String, retry_in: Duration },
    #[error("tls: {0}")]
    Tls(String),
    #[error("invalid filter for target {target}: {source}")]
    Filter {
        target: String,
        #[source]
        source: FilterError,
    },
}

impl From<rustls::Error> for ForwardError {
    fn from(error: rustls::Error) -> Self {
        Self::Tls(error.to_string())
    }
}
