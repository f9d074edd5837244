//! Error types for streamops

use thiserror::Error;

/// Result type for streamops operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for streamops
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to launch Chrome
    #[error("Failed to launch Chrome: {0}")]
    Launch(String),

    /// Transport error
    #[error("Transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// CDP protocol error
    #[error("CDP error in {method}: {message} (code {code})")]
    Cdp {
        method: String,
        code: i64,
        message: String,
    },

    /// Malformed or rejected proxy configuration
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// No live instance registered under the given id
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Control message addressed to an unregistered (instance, operation) route
    #[error("No route for instance {instance_id}: {operation}")]
    RouteNotFound {
        instance_id: String,
        operation: &'static str,
    },

    /// Tab index outside the instance's view set
    #[error("Tab index {index} out of range for instance {instance_id}")]
    TabOutOfRange { instance_id: String, index: usize },

    /// Streaming transcription error
    #[error("ASR error: {0}")]
    Asr(String),

    /// RPA dispatch error (local, before any network round-trip)
    #[error("RPA error: {0}")]
    Rpa(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Chrome not found
    #[error("Chrome not found")]
    ChromeNotFound,
}

impl Error {
    /// Create a transport error with context
    pub fn transport(context: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
            source: None,
        }
    }

    /// Create a transport error with IO source
    pub fn transport_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source: Some(source),
        }
    }

    /// Create a CDP error with full context
    pub fn cdp(method: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self::Cdp {
            method: method.into(),
            code,
            message: message.into(),
        }
    }

    /// Create a proxy configuration error
    pub fn proxy(message: impl Into<String>) -> Self {
        Self::Proxy(message.into())
    }
}
