//! # quill-xmpp
//!
//! Stanza correlation and filtering engine for the Quill XMPP client.
//!
//! This crate is the demultiplexing core that sits between a connection's
//! reader/writer tasks and application code: it matches asynchronous
//! inbound traffic to the requests that caused it, and hands everything
//! else to registered listeners.
//!
//! ## Architecture
//!
//! - **Connection**: correlation hub owning the live registries and the
//!   outbound queue; the reader task feeds it via [`Connection::route`]
//! - **Filters**: composable pure predicates over stanzas, validated at
//!   construction
//! - **Collectors**: filter + bounded result ring for request/response
//!   correlation and streaming multi-result waits
//! - **Nonza waiters**: paired success/failure outcome waits for
//!   stream-level negotiation elements
//! - **Queue**: bounded, shutdownable FIFO decoupling producers from the
//!   writer task

pub mod collector;
pub mod connection;
pub mod filter;
pub mod queue;
pub mod stanza;

mod error;
mod nonza;

pub use collector::{StanzaCollector, DEFAULT_COLLECTOR_CAPACITY};
pub use connection::{
    Connection, ConnectionConfig, ListenerHandle, DEFAULT_REPLY_TIMEOUT,
};
pub use error::Error;
pub use filter::{
    AndFilter, ExtensionFilter, FromFilter, IdFilter, IqTypeFilter, KindFilter, NotFilter,
    OrFilter, StanzaFilter,
};
pub use queue::{ShutDown, ShutdownableQueue, TryPut, TryTake, DEFAULT_QUEUE_CAPACITY};
pub use stanza::{
    IqType, Nonza, QName, Stanza, StanzaError, StanzaErrorCondition, StanzaErrorType, StanzaKind,
    StreamElement,
};
