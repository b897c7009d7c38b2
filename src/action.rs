//! Outbound actions and the replies they resolve to

use crate::{
    error::{AmiError, AmiResult},
    frame::Frame,
    headers::Header,
    protocol::validate_no_newlines,
};
use std::fmt;

/// Builder for an outbound action frame.
///
/// The `ActionID` is not set here; the correlator injects a unique one when
/// the action is sent.
///
/// ```
/// use asterisk_ami_tokio::Action;
///
/// let action = Action::new("ConfbridgeKick")
///     .field("Conference", "1000")
///     .field("Channel", "PJSIP/alice-00000001");
/// assert_eq!(action.name(), "ConfbridgeKick");
/// assert_eq!(action.get("conference"), Some("1000"));
/// ```
#[derive(Clone)]
pub struct Action {
    name: String,
    fields: Frame,
}

impl Action {
    /// Start an action with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Frame::new(),
        }
    }

    /// Append a field. Repeating a key (e.g. `Variable`) sends it repeatedly.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields
            .push(key, value);
        self
    }

    /// Action name (the `Action:` value).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First value of a field on this action.
    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        self.fields
            .get(key)
    }

    /// `Login` with plaintext secret.
    pub fn login(username: &str, secret: &str, events: bool) -> Self {
        Self::new("Login")
            .field(Header::Username.as_str(), username)
            .field(Header::Secret.as_str(), secret)
            .field(Header::Events.as_str(), if events { "on" } else { "off" })
    }

    /// `Logoff`; the exchange answers `Response: Goodbye` and closes.
    pub fn logoff() -> Self {
        Self::new("Logoff")
    }

    /// `Ping`; used as the keepalive probe.
    pub fn ping() -> Self {
        Self::new("Ping")
    }

    /// `Command` running a CLI command; output comes back as `Output` fields.
    pub fn command(cli: &str) -> Self {
        Self::new("Command").field(Header::Command.as_str(), cli)
    }

    /// Render with the given correlation token, `ActionID` placed second.
    pub(crate) fn to_frame(&self, action_id: &str) -> AmiResult<Frame> {
        validate_no_newlines(&self.name, "action name")?;
        if self
            .name
            .is_empty()
        {
            return Err(AmiError::protocol_error("action name must not be empty"));
        }

        let mut frame = Frame::new()
            .with(Header::Action.as_str(), self.name.as_str())
            .with(Header::ActionId.as_str(), action_id);
        for (key, value) in self
            .fields
            .iter()
        {
            validate_no_newlines(key, "field name")?;
            validate_no_newlines(value, "field value")?;
            if key.eq_ignore_ascii_case(Header::ActionId.as_str())
                || key.eq_ignore_ascii_case(Header::Action.as_str())
            {
                return Err(AmiError::protocol_error(format!(
                    "field {} is reserved",
                    key
                )));
            }
            frame.push(key, value);
        }
        Ok(frame)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_map();
        list.entry(&"Action", &self.name);
        for (key, value) in self
            .fields
            .iter()
        {
            if key.eq_ignore_ascii_case(Header::Secret.as_str()) {
                list.entry(&key, &"[REDACTED]");
            } else {
                list.entry(&key, &value);
            }
        }
        list.finish()
    }
}

/// `Response:` value classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ResponseStatus {
    /// `Success`
    Success,
    /// `Error`; the `Message` field says why.
    Error,
    /// `Goodbye`, sent in reply to `Logoff`.
    Goodbye,
    /// `Follows`, legacy `Command` output.
    Follows,
    /// Anything else.
    Other,
}

impl ResponseStatus {
    fn from_wire(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("Success") => ResponseStatus::Success,
            Some(v) if v.eq_ignore_ascii_case("Error") => ResponseStatus::Error,
            Some(v) if v.eq_ignore_ascii_case("Goodbye") => ResponseStatus::Goodbye,
            Some(v) if v.eq_ignore_ascii_case("Follows") => ResponseStatus::Follows,
            _ => ResponseStatus::Other,
        }
    }
}

/// Single-frame reply to an action.
#[derive(Debug, Clone, PartialEq)]
pub struct AmiResponse {
    frame: Frame,
    status: ResponseStatus,
}

impl AmiResponse {
    /// Wrap a `Response:` frame.
    pub fn new(frame: Frame) -> Self {
        let status = ResponseStatus::from_wire(frame.get(Header::Response));
        Self { frame, status }
    }

    /// `true` for `Response: Success` (and `Goodbye`/`Follows`, which are
    /// successful terminal replies for their actions).
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            ResponseStatus::Success | ResponseStatus::Goodbye | ResponseStatus::Follows
        )
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    /// `Message` field, if present.
    pub fn message(&self) -> Option<&str> {
        self.frame
            .get(Header::Message)
    }

    /// Look up a field by name.
    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        self.frame
            .get(key)
    }

    pub fn action_id(&self) -> Option<&str> {
        self.frame
            .action_id()
    }

    /// The raw frame.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn into_frame(self) -> Frame {
        self.frame
    }

    /// Convert to result based on status; `Error` carries the exchange's
    /// `Message` verbatim.
    ///
    /// ```
    /// use asterisk_ami_tokio::{AmiError, AmiResponse, Frame};
    ///
    /// let frame = Frame::new()
    ///     .with("Response", "Error")
    ///     .with("Message", "No Conference by that name found.");
    /// match AmiResponse::new(frame).into_result() {
    ///     Err(AmiError::ActionRejected { message }) => {
    ///         assert_eq!(message, "No Conference by that name found.")
    ///     }
    ///     other => panic!("unexpected {:?}", other),
    /// }
    /// ```
    pub fn into_result(self) -> AmiResult<Self> {
        match self.status {
            ResponseStatus::Error => Err(AmiError::rejected(
                self.message()
                    .unwrap_or("")
                    .to_string(),
            )),
            ResponseStatus::Other => Err(AmiError::protocol_error(format!(
                "unexpected Response value: {}",
                self.frame
                    .get(Header::Response)
                    .unwrap_or("")
            ))),
            _ => Ok(self),
        }
    }
}

/// Result of a streaming list action: the initial response plus every event
/// between it and the completion event, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct EventList {
    pub(crate) response: Option<AmiResponse>,
    pub(crate) items: Vec<Frame>,
    pub(crate) reported_count: Option<usize>,
}

impl EventList {
    /// Initial `Response` frame, absent only if the exchange skipped it.
    pub fn response(&self) -> Option<&AmiResponse> {
        self.response
            .as_ref()
    }

    /// Result items (the completion event is not included).
    pub fn items(&self) -> &[Frame] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Frame> {
        self.items
    }

    /// `ListItems` value reported by the completion event.
    pub fn reported_count(&self) -> Option<usize> {
        self.reported_count
    }

    pub fn len(&self) -> usize {
        self.items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.items
            .is_empty()
    }
}
