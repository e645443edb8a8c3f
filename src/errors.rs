use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::Fault;

/// Diagnostic context carried by request-scoped failures: which queue the
/// exchange targeted and what was being sent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestContext {
    pub queue: String,
    pub content: Option<Vec<u8>>,
    pub correlation_id: Option<String>,
}

impl RequestContext {
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue '{}'", self.queue)?;
        if let Some(correlation_id) = &self.correlation_id {
            write!(f, ", correlation id {correlation_id}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    /// Malformed input, raised before any I/O happens.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The broker reported that the target queue does not exist.
    #[error("queue not found ({context})")]
    QueueNotFound {
        context: RequestContext,
        #[source]
        fault: Fault,
    },

    /// The operation's channel terminated before the exchange completed.
    #[error("channel closed before the exchange completed ({context})")]
    ChannelClosed { context: RequestContext },

    /// No correlated reply arrived within the configured window.
    #[error("rpc request timed out ({context})")]
    Timeout { context: RequestContext },

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other transport-level failure, propagated as-is.
    #[error(transparent)]
    Transport(#[from] Fault),
}

pub type Result<T> = std::result::Result<T, RpcError>;
