//! Asterisk Manager Interface (AMI) client for Rust
//!
//! This crate drives an Asterisk exchange over its manager protocol: one
//! persistent TCP session carrying correlated actions, streaming list results
//! and unsolicited events. Conference control (ConfBridge) and dialed-number
//! classification are layered on top.
//!
//! # Architecture
//!
//! - [`FrameParser`] / [`encode`]: the blank-line-terminated key/value codec
//! - [`Transport`]: owns the socket, runs the read task, serializes writes
//! - Correlator (internal): matches `ActionID`s to pending requests, applies deadlines
//! - [`EventDispatcher`]: routes events to handlers and [`AmiEventStream`]s
//! - [`AmiClient`] (Clone + Send): login, keepalive, reconnection with backoff
//! - [`ConferenceManager`]: ConfBridge list, mute, kick, lock
//! - [`DialPlanManager`]: pure classification and dial rule documents
//!
//! # Examples
//!
//! ## Actions
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{Action, AmiClient, AmiError, ConnectOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AmiError> {
//!     let client = AmiClient::connect(ConnectOptions::new("localhost", "admin", "secret")).await?;
//!
//!     for line in client.command("core show uptime").await? {
//!         println!("{}", line);
//!     }
//!
//!     let channels = client
//!         .send_list_action(Action::new("CoreShowChannels"))
//!         .await?;
//!     println!("{} active channels", channels.len());
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Events
//!
//! Subscribe before [`AmiClient::start`] to see every event from the first
//! session on. Subscriptions survive reconnects.
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{AmiClient, ConnectOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = AmiClient::new(ConnectOptions::new("localhost", "admin", "secret"))?;
//!     let mut hangups = client.events("Hangup");
//!     client.start().await?;
//!
//!     while let Some(Ok(event)) = hangups.recv().await {
//!         println!("{:?} hung up ({:?})", event.get("Channel"), event.get("Cause-txt"));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Dial Plan
//!
//! ```rust
//! use asterisk_ami_tokio::{Classification, DialPlanManager};
//!
//! let plan = DialPlanManager::standard();
//! assert_eq!(plan.classify("2001"), Classification::Extension);
//! assert_eq!(plan.classify("*97"), Classification::FeatureCode);
//!
//! let rejected = plan.validate_number("999").unwrap_err();
//! println!("{}", rejected);
//!
//! let digitmap = plan.get_dial_rules("digitmap");
//! assert!(digitmap.body.starts_with('('));
//! ```

#[macro_use]
mod macros;

pub mod action;
pub mod client;
pub mod conference;
pub mod config;
pub mod constants;
pub mod dialplan;
pub mod error;
pub mod event;
pub mod frame;
pub mod headers;
pub mod protocol;
pub mod transport;

pub(crate) mod buffer;
pub(crate) mod correlator;

pub use action::{Action, AmiResponse, EventList, ResponseStatus};
pub use client::{AmiClient, ConnectionState};
pub use conference::{
    validate_identifier, Conference, ConferenceEvent, ConferenceManager, ConferenceStats,
    Participant,
};
pub use config::{ConnectOptions, ReconnectPolicy};
pub use constants::DEFAULT_AMI_PORT;
pub use dialplan::{
    ClassifiedNumber, Classification, ClientProfile, DialPattern, DialPlanManager, DialRule,
    DialRuleDocument, ParseDialPlanNameError,
};
pub use error::{AmiError, AmiResult, ErrorKind, ErrorReport, ValidationError, ValidationErrorKind};
pub use event::{AmiEventStream, EventDispatcher, EventPattern, SubscriptionId};
pub use frame::{Frame, FrameKind};
pub use headers::{Header, ParseHeaderError};
pub use protocol::{encode, FrameParser, Frames};
pub use transport::{DisconnectReason, Transport, TransportStatus};
