//! The key/value block that every AMI message is made of

use crate::constants::EVENT_LIST_COMPLETE;
use crate::headers::Header;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a frame is, decided by its first field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Client-issued command (`Action: ...`).
    Action,
    /// Immediate reply to an action (`Response: ...`).
    Response,
    /// Unsolicited or list-result event (`Event: ...`).
    Event,
    /// Anything else; never produced by a well-behaved exchange.
    Unknown,
}

/// One blank-line terminated block of `Key: Value` fields.
///
/// Field order is preserved and duplicate keys are kept as separate entries
/// (`Output`, `Variable` and `ChanVariable` repeat). Lookups are
/// case-insensitive and return the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    fields: Vec<(String, String)>,
}

impl Frame {
    /// Create an empty frame.
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Append a field, keeping any existing field with the same key.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields
            .push((key.into(), value.into()));
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    /// Insert a field at `index` (clamped to the end).
    pub fn insert(&mut self, index: usize, key: impl Into<String>, value: impl Into<String>) {
        let index = index.min(self.fields.len());
        self.fields
            .insert(index, (key.into(), value.into()));
    }

    /// First value for `key`, compared case-insensitively.
    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        let key = key.as_ref();
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key`, in wire order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// `true` if any field has this key.
    pub fn contains(&self, key: impl AsRef<str>) -> bool {
        self.get(key)
            .is_some()
    }

    /// Remove every field with this key, returning the first removed value.
    pub fn remove(&mut self, key: impl AsRef<str>) -> Option<String> {
        let key = key.as_ref();
        let mut first = None;
        self.fields
            .retain_mut(|(k, v)| {
                if k.eq_ignore_ascii_case(key) {
                    if first.is_none() {
                        first = Some(std::mem::take(v));
                    }
                    false
                } else {
                    true
                }
            });
        first
    }

    /// Fields in wire order.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Iterate `(key, value)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Classify by the first field's key.
    pub fn kind(&self) -> FrameKind {
        let Some((key, _)) = self.fields.first() else {
            return FrameKind::Unknown;
        };
        if key.eq_ignore_ascii_case(Header::Response.as_str()) {
            FrameKind::Response
        } else if key.eq_ignore_ascii_case(Header::Event.as_str()) {
            FrameKind::Event
        } else if key.eq_ignore_ascii_case(Header::Action.as_str()) {
            FrameKind::Action
        } else {
            FrameKind::Unknown
        }
    }

    /// Correlation token, if present.
    pub fn action_id(&self) -> Option<&str> {
        self.get(Header::ActionId)
    }

    /// Event name for event frames.
    pub fn event_name(&self) -> Option<&str> {
        match self.kind() {
            FrameKind::Event => self.get(Header::Event),
            _ => None,
        }
    }

    /// `EventList: Complete` marker carried by list completion events.
    pub fn is_list_complete(&self) -> bool {
        self.get(Header::EventList)
            .is_some_and(|v| v.eq_ignore_ascii_case(EVENT_LIST_COMPLETE))
    }

    /// Consume into the underlying field list.
    pub fn into_fields(self) -> Vec<(String, String)> {
        self.fields
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.fields {
            writeln!(f, "{}: {}", key, value)?;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Frame {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl IntoIterator for Frame {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields
            .into_iter()
    }
}
