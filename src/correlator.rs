//! Request/response correlation by `ActionID`

use crate::{
    action::{AmiResponse, EventList},
    constants::LIST_COMPLETE_SUFFIX,
    error::{AmiError, AmiResult},
    frame::{Frame, FrameKind},
    headers::Header,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// How a pending request decides it is finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Completion {
    /// The first `Response` frame resolves it.
    Response,
    /// A `Response`, zero or more item events, then the named completion event.
    List { complete_event: String },
}

impl Completion {
    /// List completion following the `<Action>Complete` naming convention.
    pub(crate) fn list_for(action_name: &str) -> Self {
        Completion::List {
            complete_event: format!("{}{}", action_name, LIST_COMPLETE_SUFFIX),
        }
    }
}

/// What a resolved request yields.
#[derive(Debug)]
pub(crate) enum Resolution {
    Response(AmiResponse),
    List(EventList),
}

pub(crate) type Reply = AmiResult<Resolution>;

/// `now + limit`, or a deadline decades away when that would overflow.
pub(crate) fn deadline_after(now: Instant, limit: Duration) -> Instant {
    now.checked_add(limit)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

struct PendingRequest {
    issued_at: Instant,
    deadline: Instant,
    completion: Completion,
    response: Option<AmiResponse>,
    accumulator: Vec<Frame>,
    resolver: oneshot::Sender<Reply>,
}

impl PendingRequest {
    /// Absorb a frame; returns the outcome once the request is complete.
    fn absorb(&mut self, frame: &Frame) -> Option<Reply> {
        match (&self.completion, frame.kind()) {
            (Completion::Response, FrameKind::Response) => {
                Some(Ok(Resolution::Response(AmiResponse::new(frame.clone()))))
            }
            (Completion::Response, _) => None,
            (Completion::List { .. }, FrameKind::Response) => {
                let response = AmiResponse::new(frame.clone());
                if !response.is_success() {
                    return Some(
                        response
                            .into_result()
                            .map(Resolution::Response),
                    );
                }
                if self
                    .response
                    .replace(response)
                    .is_some()
                {
                    warn!("Second Response for one list action, keeping the latest");
                }
                None
            }
            (Completion::List { complete_event }, FrameKind::Event) => {
                let is_complete = frame
                    .event_name()
                    .is_some_and(|name| name.eq_ignore_ascii_case(complete_event))
                    || frame.is_list_complete();
                if !is_complete {
                    self.accumulator
                        .push(frame.clone());
                    return None;
                }
                Some(Ok(Resolution::List(self.finish_list(frame))))
            }
            (Completion::List { .. }, _) => None,
        }
    }

    fn finish_list(&mut self, completion: &Frame) -> EventList {
        let reported_count = completion
            .get(Header::ListItems)
            .and_then(|v| {
                v.trim()
                    .parse::<usize>()
                    .ok()
            });
        let items = std::mem::take(&mut self.accumulator);
        if let Some(reported) = reported_count {
            if reported != items.len() {
                warn!(
                    "List completion reported {} items but {} were received",
                    reported,
                    items.len()
                );
            }
        }
        if self
            .response
            .is_none()
        {
            debug!("List completed without an initial Response");
        }
        EventList {
            response: self
                .response
                .take(),
            items,
            reported_count,
        }
    }
}

/// Table of in-flight requests for one connection.
///
/// Resolution and expiry both remove the entry before completing it, so
/// whichever happens first wins and the other finds nothing to do.
pub(crate) struct Correlator {
    prefix: String,
    next_id: u64,
    pending: HashMap<String, PendingRequest>,
    closed: bool,
}

impl Correlator {
    pub(crate) fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next_id: 1,
            pending: HashMap::new(),
            closed: false,
        }
    }

    /// Unique token for this connection's lifetime.
    pub(crate) fn next_action_id(&mut self) -> String {
        let id = format!("{}{}", self.prefix, self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn register(
        &mut self,
        action_id: &str,
        timeout: Duration,
        completion: Completion,
    ) -> AmiResult<oneshot::Receiver<Reply>> {
        if self.closed {
            return Err(AmiError::ConnectionLost);
        }
        if self
            .pending
            .contains_key(action_id)
        {
            return Err(AmiError::protocol_error(format!(
                "ActionID {} is already pending",
                action_id
            )));
        }

        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        self.pending
            .insert(
                action_id.to_string(),
                PendingRequest {
                    issued_at: now,
                    deadline: deadline_after(now, timeout),
                    completion,
                    response: None,
                    accumulator: Vec::new(),
                    resolver: tx,
                },
            );
        trace!("Registered ActionID {}", action_id);
        Ok(rx)
    }

    /// Offer a frame. Returns `true` when it belonged to a pending request.
    ///
    /// Frames whose `ActionID` is unknown (already resolved, expired, or never
    /// issued) are ignored.
    pub(crate) fn feed(&mut self, frame: &Frame) -> bool {
        let Some(action_id) = frame.action_id() else {
            return false;
        };
        let Some(request) = self
            .pending
            .get_mut(action_id)
        else {
            debug!("Ignoring {:?} for unknown ActionID {}", frame.kind(), action_id);
            return false;
        };

        if let Some(outcome) = request.absorb(frame) {
            if let Some(request) = self
                .pending
                .remove(action_id)
            {
                trace!(
                    "Resolved ActionID {} after {:?}",
                    action_id,
                    request
                        .issued_at
                        .elapsed()
                );
                let _ = request
                    .resolver
                    .send(outcome);
            }
        }
        true
    }

    /// Drop a request without completing it. `false` if it was already gone.
    pub(crate) fn cancel(&mut self, action_id: &str) -> bool {
        self.pending
            .remove(action_id)
            .is_some()
    }

    /// Fail every request whose deadline has passed. Returns how many expired.
    pub(crate) fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for action_id in &expired {
            if let Some(request) = self
                .pending
                .remove(action_id)
            {
                let timeout_ms = (request.deadline - request.issued_at).as_millis() as u64;
                debug!("ActionID {} expired after {}ms", action_id, timeout_ms);
                let _ = request
                    .resolver
                    .send(Err(AmiError::Timeout { timeout_ms }));
            }
        }
        expired.len()
    }

    /// Fail every outstanding request and refuse new ones.
    pub(crate) fn close(&mut self) -> usize {
        self.closed = true;
        let count = self
            .pending
            .len();
        for (_, request) in self
            .pending
            .drain()
        {
            let _ = request
                .resolver
                .send(Err(AmiError::ConnectionLost));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.pending
            .len()
    }
}
