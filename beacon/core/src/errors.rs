use std::fmt;

/// Errors produced while fetching, transforming and persisting chain data.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("request to {url} failed: {message}")]
    Transport {
        url: String,
        status: Option<u16>,
        message: String,
    },
    #[error("all {0} configured RPC endpoints failed")]
    AllEndpointsFailed(usize),
    #[error("malformed payload for block #{height}: {reason}")]
    MalformedPayload { height: u64, reason: String },
    #[error(transparent)]
    Persistence(#[from] sqlx::Error),
    #[error("schema error: {0}")]
    Schema(String),
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

/// Stable label for an [`Error`], used in log lines and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Endpoints,
    Malformed,
    Persistence,
    Schema,
    Config,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport { .. } => ErrorKind::Transport,
            Error::AllEndpointsFailed(_) => ErrorKind::Endpoints,
            Error::MalformedPayload { .. } | Error::SerdeJsonError(_) => ErrorKind::Malformed,
            Error::Persistence(_) => ErrorKind::Persistence,
            Error::Schema(_) => ErrorKind::Schema,
            Error::UrlParseError(_) => ErrorKind::Config,
        }
    }

    /// Whether the failed request may succeed when sent again.
    ///
    /// Connection failures and timeouts carry no status and are always retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { status: None, .. } => true,
            Error::Transport {
                status: Some(status),
                ..
            } => matches!(status, 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }

    pub(crate) fn transport<U, M>(url: U, status: Option<u16>, message: M) -> Self
    where
        U: fmt::Display,
        M: Into<String>,
    {
        Error::Transport {
            url: url.to_string(),
            status,
            message: message.into(),
        }
    }
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Endpoints => "endpoints",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Schema => "schema",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
