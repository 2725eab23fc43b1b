//! Error types for the correlation engine.

use std::time::Duration;

use thiserror::Error;

use crate::queue::ShutDown;
use crate::stanza::{Nonza, QName, Stanza, StanzaError};

/// Errors surfaced by blocking correlation calls and filter construction.
///
/// The three "something went wrong while waiting" outcomes — no response,
/// protocol error reply, not connected — are distinct variants so calling
/// code can branch on cause. Infrastructure-level aborts (queue shutdown,
/// collector cancellation) are distinguishable from protocol timeouts.
#[derive(Debug, Error)]
pub enum Error {
    /// A filter was constructed with a missing or empty required criterion.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// The connection was not connected when the wait began.
    #[error("not connected to the server")]
    NotConnected,

    /// The deadline elapsed with no matching element delivered.
    #[error("no response received within {timeout:?} while waiting on {filter}")]
    NoResponse {
        /// Description of the filter that was waited on.
        filter: String,
        /// The timeout that was used.
        timeout: Duration,
    },

    /// A matching stanza arrived but its payload encodes a protocol error.
    #[error("received error reply: {error}")]
    ErrorReply {
        /// The embedded error payload.
        error: StanzaError,
        /// The request that triggered the reply, when recorded.
        request: Option<Box<Stanza>>,
    },

    /// The failure outcome of a paired-outcome nonza wait fired.
    #[error("nonza exchange failed{}", condition.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
    NonzaFailure {
        /// The received failure element.
        nonza: Box<Nonza>,
        /// Its sub-condition (first child local name), when present.
        condition: Option<String>,
    },

    /// A nonza listener is already installed for this qualified name.
    #[error("a nonza handler is already registered for {0}")]
    NonzaHandlerConflict(QName),

    /// The outbound queue was shut down.
    #[error(transparent)]
    QueueShutDown(#[from] ShutDown),

    /// The collector or waiter was torn down while the caller was waiting.
    #[error("wait aborted: collector or waiter was cancelled")]
    Cancelled,
}

impl Error {
    /// Build a `NoResponse` error from a filter description and timeout.
    pub fn no_response(filter: impl Into<String>, timeout: Duration) -> Self {
        Self::NoResponse {
            filter: filter.into(),
            timeout,
        }
    }

    /// Build an `ErrorReply` from the reply's error payload and the
    /// originating request, when known.
    pub fn error_reply(error: StanzaError, request: Option<Stanza>) -> Self {
        Self::ErrorReply {
            error,
            request: request.map(Box::new),
        }
    }

    /// Build a `NonzaFailure` carrying the received failure element.
    pub fn nonza_failure(nonza: Nonza) -> Self {
        let condition = nonza.condition().map(str::to_string);
        Self::NonzaFailure {
            nonza: Box::new(nonza),
            condition,
        }
    }
}
