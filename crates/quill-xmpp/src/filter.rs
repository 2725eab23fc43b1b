//! Composable stanza filters.
//!
//! A [`StanzaFilter`] is a pure predicate over inbound stanzas, immutable
//! after construction and safe to evaluate concurrently from the dispatch
//! task and any number of waiters. Filters requiring a non-empty
//! criterion reject it at construction, so a misconfigured filter can
//! never silently match nothing.
//!
//! The `Debug` representation of a filter is its diagnostic description:
//! it names every constituent and is what
//! [`Error::NoResponse`](crate::Error::NoResponse) reports after a silent
//! timeout.

use std::fmt;
use std::sync::Arc;

use jid::BareJid;

use crate::error::Error;
use crate::stanza::{IqType, Stanza, StanzaKind};

/// A pure predicate over inbound stanzas.
pub trait StanzaFilter: fmt::Debug + Send + Sync {
    /// Whether this filter is interested in `stanza`.
    fn accept(&self, stanza: &Stanza) -> bool;
}

impl<F: StanzaFilter + ?Sized> StanzaFilter for Arc<F> {
    fn accept(&self, stanza: &Stanza) -> bool {
        (**self).accept(stanza)
    }
}

/// Matches stanzas whose id equals a configured, non-empty id.
#[derive(Debug, Clone)]
pub struct IdFilter {
    id: String,
}

impl IdFilter {
    /// Create a filter for the given stanza id.
    ///
    /// Fails if `id` is empty: an empty id would never correlate a reply.
    pub fn new(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidFilter("stanza id must not be empty".into()));
        }
        Ok(Self { id })
    }

    /// Create a filter matching replies to `request`.
    ///
    /// Fails if the request carries no id.
    pub fn for_request(request: &Stanza) -> Result<Self, Error> {
        match request.id() {
            Some(id) => Self::new(id),
            None => Err(Error::InvalidFilter(
                "request stanza carries no id to correlate on".into(),
            )),
        }
    }
}

impl StanzaFilter for IdFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.id() == Some(self.id.as_str())
    }
}

/// Matches stanzas of one kind (message / presence / iq).
#[derive(Debug, Clone, Copy)]
pub struct KindFilter {
    kind: StanzaKind,
}

impl KindFilter {
    pub fn new(kind: StanzaKind) -> Self {
        Self { kind }
    }
}

impl StanzaFilter for KindFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.kind() == self.kind
    }
}

/// Matches iq stanzas of one request/response type.
#[derive(Debug, Clone, Copy)]
pub struct IqTypeFilter {
    iq_type: IqType,
}

impl IqTypeFilter {
    pub fn new(iq_type: IqType) -> Self {
        Self { iq_type }
    }
}

impl StanzaFilter for IqTypeFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.iq_type() == Some(self.iq_type)
    }
}

/// Matches stanzas whose sender bare JID equals a configured address.
#[derive(Debug, Clone)]
pub struct FromFilter {
    address: BareJid,
}

impl FromFilter {
    pub fn new(address: BareJid) -> Self {
        Self { address }
    }
}

impl StanzaFilter for FromFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        match stanza.from() {
            Some(from) => from.to_bare() == self.address,
            None => false,
        }
    }
}

/// Matches stanzas carrying an extension payload with the configured
/// qualified name.
#[derive(Debug, Clone)]
pub struct ExtensionFilter {
    name: String,
    ns: String,
}

impl ExtensionFilter {
    /// Create a filter for a (local name, namespace) payload.
    ///
    /// Fails if either part is empty.
    pub fn new(name: impl Into<String>, ns: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        let ns = ns.into();
        if name.is_empty() || ns.is_empty() {
            return Err(Error::InvalidFilter(
                "extension name and namespace must not be empty".into(),
            ));
        }
        Ok(Self { name, ns })
    }
}

impl StanzaFilter for ExtensionFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        stanza.has_extension(&self.name, &self.ns)
    }
}

/// Accepts iff every constituent accepts; short-circuits on the first
/// rejection.
#[derive(Debug, Clone)]
pub struct AndFilter {
    filters: Vec<Arc<dyn StanzaFilter>>,
}

impl AndFilter {
    pub fn new(filters: Vec<Arc<dyn StanzaFilter>>) -> Self {
        Self { filters }
    }
}

impl StanzaFilter for AndFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        self.filters.iter().all(|filter| filter.accept(stanza))
    }
}

/// Accepts iff any constituent accepts; short-circuits on the first
/// acceptance.
#[derive(Debug, Clone)]
pub struct OrFilter {
    filters: Vec<Arc<dyn StanzaFilter>>,
}

impl OrFilter {
    pub fn new(filters: Vec<Arc<dyn StanzaFilter>>) -> Self {
        Self { filters }
    }
}

impl StanzaFilter for OrFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        self.filters.iter().any(|filter| filter.accept(stanza))
    }
}

/// Negates the wrapped filter.
#[derive(Debug, Clone)]
pub struct NotFilter {
    filter: Arc<dyn StanzaFilter>,
}

impl NotFilter {
    pub fn new(filter: Arc<dyn StanzaFilter>) -> Self {
        Self { filter }
    }
}

impl StanzaFilter for NotFilter {
    fn accept(&self, stanza: &Stanza) -> bool {
        !self.filter.accept(stanza)
    }
}
