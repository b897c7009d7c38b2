//! ConfBridge conference control over the manager protocol

use serde::Serialize;

use crate::{
    action::Action,
    client::AmiClient,
    constants::MAX_IDENTIFIER_LEN,
    error::{AmiError, AmiResult, ValidationError, ValidationErrorKind},
    event::{EventPattern, SubscriptionId},
    frame::Frame,
    headers::Header,
};
use tracing::{debug, trace};

/// Message ConfBridge uses to answer a room listing when nothing is running.
const NO_ACTIVE_CONFERENCES: &str = "No active conferences.";

/// A running conference as reported by `ConfbridgeListRooms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conference {
    pub id: String,
    pub participant_count: usize,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marked_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
}

impl Conference {
    /// Decode one `ConfbridgeListRooms` item. `None` without a `Conference` field.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        Some(Self {
            id: frame
                .get(Header::Conference)?
                .to_string(),
            participant_count: count(frame, Header::Parties).unwrap_or(0),
            locked: flag(frame, Header::Locked).unwrap_or(false),
            marked_count: count(frame, Header::Marked),
            muted: flag(frame, Header::Muted),
        })
    }
}

/// One member of a conference, from `ConfbridgeList`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub channel: String,
    pub caller_id_number: Option<String>,
    pub caller_id_name: Option<String>,
    pub is_muted: bool,
    pub is_admin: bool,
    pub is_marked: bool,
    /// Only reported when talk detection is enabled on the bridge profile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub talking: Option<bool>,
}

impl Participant {
    /// Decode a `ConfbridgeList` item or a `ConfbridgeJoin` event.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        Some(Self {
            channel: frame
                .get(Header::Channel)?
                .to_string(),
            caller_id_number: caller_id(frame, Header::CallerIdNum),
            caller_id_name: caller_id(frame, Header::CallerIdName),
            is_muted: flag(frame, Header::Muted).unwrap_or(false),
            is_admin: flag(frame, Header::Admin).unwrap_or(false),
            is_marked: flag(frame, Header::MarkedUser).unwrap_or(false),
            talking: flag(frame, Header::Talking),
        })
    }
}

/// Aggregates over a participant list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConferenceStats {
    pub conference: String,
    pub participant_count: usize,
    pub muted_count: usize,
    pub admin_count: usize,
}

impl ConferenceStats {
    pub fn from_participants(conference: &str, participants: &[Participant]) -> Self {
        Self {
            conference: conference.to_string(),
            participant_count: participants.len(),
            muted_count: participants
                .iter()
                .filter(|p| p.is_muted)
                .count(),
            admin_count: participants
                .iter()
                .filter(|p| p.is_admin)
                .count(),
        }
    }
}

/// Typed view of ConfBridge events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
#[non_exhaustive]
pub enum ConferenceEvent {
    Joined {
        conference: String,
        participant: Participant,
    },
    Left {
        conference: String,
        channel: String,
    },
    Muted {
        conference: String,
        channel: String,
    },
    Unmuted {
        conference: String,
        channel: String,
    },
    Talking {
        conference: String,
        channel: String,
        talking: bool,
    },
    Ended {
        conference: String,
    },
}

impl ConferenceEvent {
    /// Decode a `Confbridge*` event. Other events and frames missing required
    /// fields yield `None`.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        let name = frame.event_name()?;
        let conference = frame
            .get(Header::Conference)?
            .to_string();
        let channel = || {
            frame
                .get(Header::Channel)
                .map(str::to_string)
        };

        let event = match name.to_ascii_lowercase().as_str() {
            "confbridgejoin" => ConferenceEvent::Joined {
                conference,
                participant: Participant::from_frame(frame)?,
            },
            "confbridgeleave" => ConferenceEvent::Left {
                conference,
                channel: channel()?,
            },
            "confbridgemute" => ConferenceEvent::Muted {
                conference,
                channel: channel()?,
            },
            "confbridgeunmute" => ConferenceEvent::Unmuted {
                conference,
                channel: channel()?,
            },
            "confbridgetalking" => ConferenceEvent::Talking {
                conference,
                channel: channel()?,
                talking: frame
                    .get(Header::TalkingStatus)
                    .and_then(parse_flag)
                    .unwrap_or(false),
            },
            "confbridgeend" => ConferenceEvent::Ended { conference },
            _ => return None,
        };
        Some(event)
    }

    /// Conference the event belongs to.
    pub fn conference(&self) -> &str {
        match self {
            ConferenceEvent::Joined { conference, .. }
            | ConferenceEvent::Left { conference, .. }
            | ConferenceEvent::Muted { conference, .. }
            | ConferenceEvent::Unmuted { conference, .. }
            | ConferenceEvent::Talking { conference, .. }
            | ConferenceEvent::Ended { conference } => conference,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "yes" | "true" | "on" | "1" => Some(true),
        "no" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn flag(frame: &Frame, header: Header) -> Option<bool> {
    frame
        .get(header)
        .and_then(parse_flag)
}

fn count(frame: &Frame, header: Header) -> Option<usize> {
    frame
        .get(header)
        .and_then(|v| {
            v.trim()
                .parse()
                .ok()
        })
}

/// The exchange reports a missing caller id as `<unknown>`.
fn caller_id(frame: &Frame, header: Header) -> Option<String> {
    frame
        .get(header)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("<unknown>"))
        .map(str::to_string)
}

/// Check a conference id or channel name before it goes on the wire.
pub fn validate_identifier(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value
        .trim()
        .is_empty()
    {
        return Err(ValidationError::new(field, value, ValidationErrorKind::Empty));
    }
    if value
        .chars()
        .count()
        > MAX_IDENTIFIER_LEN
    {
        return Err(ValidationError::new(
            field,
            value,
            ValidationErrorKind::TooLong {
                max: MAX_IDENTIFIER_LEN,
            },
        ));
    }
    if let Some(character) = value
        .chars()
        .find(|c| c.is_control())
    {
        return Err(ValidationError::new(
            field,
            value,
            ValidationErrorKind::InvalidCharacter { character },
        ));
    }
    Ok(())
}

/// Conference operations on top of an [`AmiClient`].
///
/// Nothing is cached: every query reflects the exchange's live state.
///
/// ```no_run
/// use asterisk_ami_tokio::{AmiClient, ConferenceManager, ConnectOptions};
///
/// # async fn example() -> Result<(), asterisk_ami_tokio::AmiError> {
/// let client = AmiClient::connect(ConnectOptions::new("127.0.0.1", "admin", "secret")).await?;
/// let conferences = ConferenceManager::new(client);
/// for room in conferences.list_conferences().await? {
///     let stats = conferences.get_conference_stats(&room.id).await?;
///     println!("{}: {} muted of {}", room.id, stats.muted_count, stats.participant_count);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConferenceManager {
    client: AmiClient,
}

impl ConferenceManager {
    pub fn new(client: AmiClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &AmiClient {
        &self.client
    }

    /// Every running conference. An idle exchange yields an empty list.
    pub async fn list_conferences(&self) -> AmiResult<Vec<Conference>> {
        let list = match self
            .client
            .send_list_action(Action::new("ConfbridgeListRooms"))
            .await
        {
            Ok(list) => list,
            Err(AmiError::ActionRejected { message }) if message == NO_ACTIVE_CONFERENCES => {
                debug!("No active conferences");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        Ok(list
            .items()
            .iter()
            .filter_map(|frame| {
                let room = Conference::from_frame(frame);
                if room.is_none() {
                    trace!("Skipping room item without Conference: {}", frame);
                }
                room
            })
            .collect())
    }

    /// Participants of one conference, in the order the exchange reported them.
    pub async fn get_participants(&self, conference_id: &str) -> AmiResult<Vec<Participant>> {
        validate_identifier("conference", conference_id)?;
        let list = self
            .client
            .send_list_action(
                Action::new("ConfbridgeList").field(Header::Conference.as_str(), conference_id),
            )
            .await?;

        Ok(list
            .items()
            .iter()
            .filter_map(Participant::from_frame)
            .collect())
    }

    pub async fn mute_participant(&self, conference_id: &str, channel: &str) -> AmiResult<()> {
        self.participant_action("ConfbridgeMute", conference_id, channel)
            .await
    }

    pub async fn unmute_participant(&self, conference_id: &str, channel: &str) -> AmiResult<()> {
        self.participant_action("ConfbridgeUnmute", conference_id, channel)
            .await
    }

    /// Remove a participant from the conference.
    pub async fn kick_participant(&self, conference_id: &str, channel: &str) -> AmiResult<()> {
        self.participant_action("ConfbridgeKick", conference_id, channel)
            .await
    }

    /// Stop new participants from joining.
    pub async fn lock_conference(&self, conference_id: &str) -> AmiResult<()> {
        self.conference_action("ConfbridgeLock", conference_id)
            .await
    }

    pub async fn unlock_conference(&self, conference_id: &str) -> AmiResult<()> {
        self.conference_action("ConfbridgeUnlock", conference_id)
            .await
    }

    /// Counts computed from one participant listing.
    pub async fn get_conference_stats(&self, conference_id: &str) -> AmiResult<ConferenceStats> {
        let participants = self
            .get_participants(conference_id)
            .await?;
        Ok(ConferenceStats::from_participants(
            conference_id,
            &participants,
        ))
    }

    /// Deliver typed ConfBridge events to `handler`.
    ///
    /// The handler runs on the connection's read task and must not block.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(ConferenceEvent) + Send + Sync + 'static,
    {
        self.client
            .subscribe(EventPattern::Prefix("Confbridge".into()), move |frame| {
                if let Some(event) = ConferenceEvent::from_frame(frame) {
                    handler(event);
                }
            })
    }

    async fn participant_action(
        &self,
        name: &str,
        conference_id: &str,
        channel: &str,
    ) -> AmiResult<()> {
        validate_identifier("conference", conference_id)?;
        validate_identifier("channel", channel)?;
        self.client
            .send_action_ok(
                Action::new(name)
                    .field(Header::Conference.as_str(), conference_id)
                    .field(Header::Channel.as_str(), channel),
            )
            .await
            .map(|_| ())
    }

    async fn conference_action(&self, name: &str, conference_id: &str) -> AmiResult<()> {
        validate_identifier("conference", conference_id)?;
        self.client
            .send_action_ok(Action::new(name).field(Header::Conference.as_str(), conference_id))
            .await
            .map(|_| ())
    }
}
