//! Typed field names for AMI frames.

/// Error returned when parsing an unrecognized field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseHeaderError(pub String);

impl std::fmt::Display for ParseHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown AMI header: {}", self.0)
    }
}

impl std::error::Error for ParseHeaderError {}

define_header_enum! {
    error_type: ParseHeaderError,
    /// Field names used by the client. Lookups on [`Frame`](crate::Frame) are
    /// case-insensitive, so these match whatever casing the exchange emits.
    pub enum Header {
        Action => "Action",
        ActionId => "ActionID",
        Response => "Response",
        Event => "Event",
        Message => "Message",
        EventList => "EventList",
        ListItems => "ListItems",
        Username => "Username",
        Secret => "Secret",
        Events => "Events",
        Command => "Command",
        Output => "Output",
        Conference => "Conference",
        Channel => "Channel",
        CallerIdNum => "CallerIDNum",
        CallerIdName => "CallerIDName",
        Admin => "Admin",
        MarkedUser => "MarkedUser",
        Muted => "Muted",
        Talking => "Talking",
        TalkingStatus => "TalkingStatus",
        Parties => "Parties",
        Marked => "Marked",
        Locked => "Locked",
    }
}
