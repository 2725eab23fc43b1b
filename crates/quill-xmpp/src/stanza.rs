//! Element model for the correlation engine.
//!
//! Everything that crosses the stream boundary is a [`StreamElement`]:
//! either an address-bearing [`Stanza`] (message / presence / iq) or a
//! stream-level [`Nonza`] identified solely by its qualified name. Wire
//! parsing and serialization live outside this crate; extension payloads
//! and nonza bodies are carried as opaque [`minidom::Element`] values.

use std::fmt;

use jid::Jid;
use minidom::Element;

/// A qualified name: the (local name, namespace) pair that identifies an
/// element's protocol meaning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QName {
    name: String,
    ns: String,
}

impl QName {
    /// Create a qualified name from a local name and namespace.
    pub fn new(name: impl Into<String>, ns: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ns: ns.into(),
        }
    }

    /// Qualified name of an XML element.
    pub fn of(element: &Element) -> Self {
        Self {
            name: element.name().to_string(),
            ns: element.ns(),
        }
    }

    /// Local name part.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace part.
    pub fn ns(&self) -> &str {
        &self.ns
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.ns, self.name)
    }
}

/// The three address-bearing stanza kinds of RFC 6120.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

impl StanzaKind {
    /// Element name for this kind, used in tracing fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Presence => "presence",
            Self::Iq => "iq",
        }
    }
}

impl fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The request/response type discriminator carried by iq stanzas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    /// The `type` attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for IqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An address-bearing top-level protocol unit.
///
/// Immutable once built; constructed with the `with_*` builders. The
/// correlation engine only inspects the fields modeled here — extension
/// payloads stay opaque `minidom` elements.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    kind: StanzaKind,
    id: Option<String>,
    from: Option<Jid>,
    to: Option<Jid>,
    iq_type: Option<IqType>,
    error: Option<StanzaError>,
    payloads: Vec<Element>,
}

impl Stanza {
    /// Create a message stanza.
    pub fn message() -> Self {
        Self::new(StanzaKind::Message)
    }

    /// Create a presence stanza.
    pub fn presence() -> Self {
        Self::new(StanzaKind::Presence)
    }

    /// Create an iq stanza with the given request/response type.
    pub fn iq(iq_type: IqType) -> Self {
        let mut stanza = Self::new(StanzaKind::Iq);
        stanza.iq_type = Some(iq_type);
        stanza
    }

    fn new(kind: StanzaKind) -> Self {
        Self {
            kind,
            id: None,
            from: None,
            to: None,
            iq_type: None,
            error: None,
            payloads: Vec::new(),
        }
    }

    /// Set the stanza id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the sender address.
    pub fn with_from(mut self, from: Jid) -> Self {
        self.from = Some(from);
        self
    }

    /// Set the recipient address.
    pub fn with_to(mut self, to: Jid) -> Self {
        self.to = Some(to);
        self
    }

    /// Attach an error payload.
    pub fn with_error(mut self, error: StanzaError) -> Self {
        self.error = Some(error);
        self
    }

    /// Append an extension payload.
    pub fn with_payload(mut self, payload: Element) -> Self {
        self.payloads.push(payload);
        self
    }

    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn from(&self) -> Option<&Jid> {
        self.from.as_ref()
    }

    pub fn to(&self) -> Option<&Jid> {
        self.to.as_ref()
    }

    pub fn iq_type(&self) -> Option<IqType> {
        self.iq_type
    }

    pub fn error(&self) -> Option<&StanzaError> {
        self.error.as_ref()
    }

    /// Whether this stanza carries an embedded protocol-level error.
    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.iq_type == Some(IqType::Error)
    }

    /// Ordered extension payloads.
    pub fn payloads(&self) -> &[Element] {
        &self.payloads
    }

    /// Look up an extension payload by (local name, namespace).
    pub fn extension(&self, name: &str, ns: &str) -> Option<&Element> {
        self.payloads
            .iter()
            .find(|payload| payload.name() == name && payload.ns() == ns)
    }

    /// Whether an extension payload with the given qualified name exists.
    pub fn has_extension(&self, name: &str, ns: &str) -> bool {
        self.extension(name, ns).is_some()
    }
}

/// A non-address-bearing top-level protocol unit used for stream-level
/// negotiation, identified solely by its qualified name.
#[derive(Debug, Clone, PartialEq)]
pub struct Nonza {
    element: Element,
}

impl Nonza {
    /// Wrap a stream-level element.
    pub fn new(element: Element) -> Self {
        Self { element }
    }

    /// Qualified name of the wrapped element.
    pub fn qname(&self) -> QName {
        QName::of(&self.element)
    }

    pub fn name(&self) -> &str {
        self.element.name()
    }

    pub fn ns(&self) -> String {
        self.element.ns()
    }

    /// The wrapped element.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Local name of the first child element, if any.
    ///
    /// Failure nonzas conventionally carry their sub-condition as the
    /// first child (e.g. `<failure><not-authorized/></failure>`).
    pub fn condition(&self) -> Option<&str> {
        self.element.children().next().map(Element::name)
    }
}

impl From<Element> for Nonza {
    fn from(element: Element) -> Self {
        Self::new(element)
    }
}

/// A parsed top-level stream element: stanza or nonza.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamElement {
    Stanza(Stanza),
    Nonza(Nonza),
}

impl StreamElement {
    /// Element name for tracing.
    pub fn name(&self) -> &str {
        match self {
            Self::Stanza(stanza) => stanza.kind().as_str(),
            Self::Nonza(nonza) => nonza.name(),
        }
    }
}

impl From<Stanza> for StreamElement {
    fn from(stanza: Stanza) -> Self {
        Self::Stanza(stanza)
    }
}

impl From<Nonza> for StreamElement {
    fn from(nonza: Nonza) -> Self {
        Self::Nonza(nonza)
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    Gone,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    PolicyViolation,
    RecipientUnavailable,
    Redirect,
    RegistrationRequired,
    RemoteServerNotFound,
    RemoteServerTimeout,
    ResourceConstraint,
    ServiceUnavailable,
    SubscriptionRequired,
    UndefinedCondition,
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::Gone => "gone",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::Redirect => "redirect",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }
}

impl fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An embedded protocol-level error payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StanzaError {
    condition: StanzaErrorCondition,
    error_type: StanzaErrorType,
    text: Option<String>,
}

impl StanzaError {
    /// Create an error payload.
    pub fn new(condition: StanzaErrorCondition, error_type: StanzaErrorType) -> Self {
        Self {
            condition,
            error_type,
            text: None,
        }
    }

    /// Attach a human-readable description.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn condition(&self) -> StanzaErrorCondition {
        self.condition
    }

    pub fn error_type(&self) -> StanzaErrorType {
        self.error_type
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.condition, self.error_type)?;
        if let Some(text) = &self.text {
            write!(f, ": {text}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qname_of_element() {
        let element = Element::builder("proceed", "urn:ietf:params:xml:ns:xmpp-tls").build();
        let qname = QName::of(&element);
        assert_eq!(qname.name(), "proceed");
        assert_eq!(qname.ns(), "urn:ietf:params:xml:ns:xmpp-tls");
        assert_eq!(
            qname.to_string(),
            "{urn:ietf:params:xml:ns:xmpp-tls}proceed"
        );
    }

    #[test]
    fn stanza_extension_lookup() {
        let ping = Element::builder("ping", "urn:xmpp:ping").build();
        let stanza = Stanza::iq(IqType::Get).with_id("ping-1").with_payload(ping);

        assert!(stanza.has_extension("ping", "urn:xmpp:ping"));
        assert!(!stanza.has_extension("ping", "urn:xmpp:other"));
        assert_eq!(
            stanza.extension("ping", "urn:xmpp:ping").map(Element::name),
            Some("ping")
        );
    }

    #[test]
    fn error_iq_is_error() {
        let plain = Stanza::iq(IqType::Result).with_id("r1");
        assert!(!plain.is_error());

        let typed = Stanza::iq(IqType::Error).with_id("r1");
        assert!(typed.is_error());

        let with_payload = Stanza::iq(IqType::Error).with_id("r1").with_error(
            StanzaError::new(StanzaErrorCondition::ItemNotFound, StanzaErrorType::Cancel),
        );
        assert!(with_payload.is_error());
    }

    #[test]
    fn nonza_condition_is_first_child() {
        let failure = Element::builder("failure", "urn:ietf:params:xml:ns:xmpp-sasl")
            .append(Element::builder("not-authorized", "urn:ietf:params:xml:ns:xmpp-sasl").build())
            .build();
        let nonza = Nonza::new(failure);

        assert_eq!(nonza.name(), "failure");
        assert_eq!(nonza.condition(), Some("not-authorized"));

        let bare = Nonza::new(Element::builder("proceed", "urn:ietf:params:xml:ns:xmpp-tls").build());
        assert_eq!(bare.condition(), None);
    }

    #[test]
    fn stanza_error_display_names_condition_and_type() {
        let error = StanzaError::new(StanzaErrorCondition::ServiceUnavailable, StanzaErrorType::Cancel)
            .with_text("gone fishing");
        assert_eq!(error.to_string(), "service-unavailable (cancel): gone fishing");
    }

    #[test]
    fn stream_element_name_for_tracing() {
        let stanza: StreamElement = Stanza::message().into();
        assert_eq!(stanza.name(), "message");

        let nonza: StreamElement =
            Nonza::new(Element::builder("failure", "urn:ietf:params:xml:ns:xmpp-tls").build()).into();
        assert_eq!(nonza.name(), "failure");
    }
}
