//! Integration tests against a scripted in-process exchange.

mod common;

use asterisk_ami_tokio::{
    Action, AmiClient, AmiError, ConferenceEvent, ConferenceManager, ConnectionState,
    DisconnectReason, ErrorKind, Frame,
};
use common::{event, list_reply, response, MockExchange, BANNER};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn action_name(request: &Frame) -> &str {
    request
        .get("Action")
        .unwrap_or("")
}

fn participant(channel: &str, muted: bool, admin: bool) -> Frame {
    let flag = |b: bool| if b { "Yes" } else { "No" };
    event("ConfbridgeList")
        .with("Conference", "1000")
        .with("Channel", channel)
        .with("CallerIDNum", "2001")
        .with("CallerIDName", "Alice")
        .with("Admin", flag(admin))
        .with("MarkedUser", "No")
        .with("Muted", flag(muted))
}

/// Exchange hosting conference 1000 with five participants.
fn conference_script(request: &Frame) -> Vec<Frame> {
    match action_name(request) {
        "Ping" => vec![response("Success").with("Ping", "Pong")],
        "ConfbridgeListRooms" => list_reply(
            "ConfbridgeListRooms",
            vec![event("ConfbridgeListRooms")
                .with("Conference", "1000")
                .with("Parties", "5")
                .with("Marked", "0")
                .with("Locked", "No")
                .with("Muted", "No")],
        ),
        "ConfbridgeList" if request.get("Conference") == Some("1000") => list_reply(
            "ConfbridgeList",
            vec![
                participant("PJSIP/e-00000005", false, true),
                participant("PJSIP/a-00000001", true, false),
                participant("PJSIP/d-00000004", false, false),
                participant("PJSIP/b-00000002", true, false),
                participant("PJSIP/c-00000003", false, false),
            ],
        ),
        "ConfbridgeList" => {
            vec![response("Error").with("Message", "No Conference by that name found.")]
        }
        "ConfbridgeMute" | "ConfbridgeKick" | "ConfbridgeLock"
            if request.get("Conference") == Some("1000") =>
        {
            vec![response("Success").with("Message", "OK")]
        }
        "ConfbridgeMute" | "ConfbridgeKick" | "ConfbridgeLock" => {
            vec![response("Error").with("Message", "No Conference by that name found.")]
        }
        _ => vec![response("Error").with("Message", "Invalid/unknown command")],
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn login_reaches_ready_and_close_logs_off() {
    common::init_tracing();
    let exchange = MockExchange::start(conference_script).await;
    let client = AmiClient::connect(exchange.options())
        .await
        .unwrap();

    assert!(client.is_ready());
    assert_eq!(client.server_banner().as_deref(), Some(BANNER));
    assert_eq!(exchange.logins(), 1);

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(
        client.last_disconnect_reason(),
        Some(DisconnectReason::ClientRequested)
    );
    assert!(matches!(
        client
            .send_action(Action::ping())
            .await,
        Err(AmiError::NotConnected)
    ));

    // no reconnect after an explicit close
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(exchange.connections(), 1);
}

#[tokio::test]
async fn rejected_login_is_fatal_and_not_retried() {
    let exchange = MockExchange::start(conference_script).await;
    let mut options = exchange.options();
    options.secret = "wrong".into();

    let err = AmiClient::connect(options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    match err {
        AmiError::AuthenticationFailed { message } => assert_eq!(message, "Authentication failed"),
        other => panic!("unexpected {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(exchange.connections(), 1);
    assert_eq!(exchange.logins(), 0);
}

#[tokio::test]
async fn ping_and_command_output() {
    let exchange = MockExchange::start(|request| match action_name(request) {
        "Ping" => vec![response("Success").with("Ping", "Pong")],
        "Command" => vec![response("Success")
            .with("Message", "Command output follows")
            .with("Output", "System uptime: 2 hours, 3 minutes")
            .with("Output", "Last reload: 1 hour, 12 minutes")],
        _ => Vec::new(),
    })
    .await;
    let client = AmiClient::connect(exchange.options())
        .await
        .unwrap();

    client
        .ping()
        .await
        .unwrap();
    let output = client
        .command("core show uptime")
        .await
        .unwrap();
    assert_eq!(
        output,
        [
            "System uptime: 2 hours, 3 minutes",
            "Last reload: 1 hour, 12 minutes"
        ]
    );
}

#[tokio::test]
async fn streaming_list_resolves_with_all_items() {
    let exchange = MockExchange::start(conference_script).await;
    let client = AmiClient::connect(exchange.options())
        .await
        .unwrap();

    let list = client
        .send_list_action(Action::new("ConfbridgeList").field("Conference", "1000"))
        .await
        .unwrap();
    assert_eq!(list.len(), 5);
    assert_eq!(list.reported_count(), Some(5));
    assert!(list
        .response()
        .is_some_and(|r| r.is_success()));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn list_items_are_also_dispatched_as_events() {
    let exchange = MockExchange::start(conference_script).await;
    let client = AmiClient::connect(exchange.options())
        .await
        .unwrap();
    let mut items = client.events("ConfbridgeList");

    client
        .send_list_action(Action::new("ConfbridgeList").field("Conference", "1000"))
        .await
        .unwrap();

    let first = timeout(WAIT, items.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.get("Channel"), Some("PJSIP/e-00000005"));
    assert!(first
        .action_id()
        .is_some());
}

#[tokio::test]
async fn empty_exchange_lists_no_conferences() {
    let exchange = MockExchange::start(|request| match action_name(request) {
        "ConfbridgeListRooms" => {
            vec![response("Error").with("Message", "No active conferences.")]
        }
        _ => Vec::new(),
    })
    .await;
    let conferences = ConferenceManager::new(
        AmiClient::connect(exchange.options())
            .await
            .unwrap(),
    );

    let rooms = conferences
        .list_conferences()
        .await
        .unwrap();
    assert!(rooms.is_empty());
}

#[tokio::test]
async fn conference_listing_and_stats() {
    let exchange = MockExchange::start(conference_script).await;
    let conferences = ConferenceManager::new(
        AmiClient::connect(exchange.options())
            .await
            .unwrap(),
    );

    let rooms = conferences
        .list_conferences()
        .await
        .unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].id, "1000");
    assert_eq!(rooms[0].participant_count, 5);
    assert!(!rooms[0].locked);

    let participants = conferences
        .get_participants("1000")
        .await
        .unwrap();
    let channels: Vec<&str> = participants
        .iter()
        .map(|p| p.channel.as_str())
        .collect();
    assert_eq!(
        channels,
        [
            "PJSIP/e-00000005",
            "PJSIP/a-00000001",
            "PJSIP/d-00000004",
            "PJSIP/b-00000002",
            "PJSIP/c-00000003"
        ]
    );

    let first = conferences
        .get_conference_stats("1000")
        .await
        .unwrap();
    let second = conferences
        .get_conference_stats("1000")
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(first.participant_count, 5);
    assert_eq!(first.muted_count, 2);
    assert_eq!(first.admin_count, 1);
}

#[tokio::test]
async fn rejected_action_message_is_verbatim() {
    let exchange = MockExchange::start(conference_script).await;
    let conferences = ConferenceManager::new(
        AmiClient::connect(exchange.options())
            .await
            .unwrap(),
    );

    conferences
        .mute_participant("1000", "PJSIP/a-00000001")
        .await
        .unwrap();
    conferences
        .lock_conference("1000")
        .await
        .unwrap();
    conferences
        .kick_participant("1000", "PJSIP/c-00000003")
        .await
        .unwrap();

    let err = conferences
        .mute_participant("2000", "PJSIP/a-00000001")
        .await
        .unwrap_err();
    let report = err.report();
    assert_eq!(report.kind, ErrorKind::ActionRejected);
    assert_eq!(report.message, "No Conference by that name found.");
}

#[tokio::test]
async fn invalid_identifiers_never_reach_the_wire() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let exchange = MockExchange::start(move |request| {
        counter.fetch_add(1, Ordering::SeqCst);
        conference_script(request)
    })
    .await;
    let conferences = ConferenceManager::new(
        AmiClient::connect(exchange.options())
            .await
            .unwrap(),
    );

    let err = conferences
        .mute_participant("1000", "")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = conferences
        .lock_conference("1000\r\nAction: Logoff")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(seen.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unanswered_action_times_out_and_frees_slot() {
    let exchange = MockExchange::start(|_| Vec::new()).await;
    let client = AmiClient::connect(exchange.options())
        .await
        .unwrap();

    let err = client
        .send_action_with_timeout(Action::new("Hold"), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, AmiError::Timeout { timeout_ms: 100 }));
    assert_eq!(err.kind(), ErrorKind::RequestTimeout);
    assert_eq!(client.pending_requests(), 0);
    assert!(client.is_ready());
}

#[tokio::test]
async fn abandoned_request_is_swept() {
    let exchange = MockExchange::start(|_| Vec::new()).await;
    let client = AmiClient::connect(exchange.options())
        .await
        .unwrap();

    let abandoned = client.clone();
    let call = tokio::spawn(async move {
        abandoned
            .send_action_with_timeout(Action::new("Hold"), Duration::from_millis(100))
            .await
    });
    wait_until(|| client.pending_requests() == 1).await;
    call.abort();

    wait_until(|| client.pending_requests() == 0).await;
}

#[tokio::test]
async fn socket_drop_fails_outstanding_then_reconnects() {
    common::init_tracing();
    let exchange = MockExchange::start(|request| match action_name(request) {
        "Ping" => vec![response("Success").with("Ping", "Pong")],
        _ => Vec::new(),
    })
    .await;
    let client = AmiClient::connect(exchange.options())
        .await
        .unwrap();

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_action(Action::new("Hold"))
                    .await
            })
        })
        .collect();
    wait_until(|| client.pending_requests() == 3).await;

    exchange.drop_connections();
    for call in calls {
        let result = timeout(Duration::from_secs(1), call)
            .await
            .expect("request not failed promptly")
            .unwrap();
        match result {
            Err(err) => {
                assert!(matches!(err, AmiError::ConnectionLost));
                assert!(err.is_connection_error());
            }
            Ok(response) => panic!("unexpected response {:?}", response),
        }
    }

    wait_until(|| exchange.logins() == 2 && client.is_ready()).await;
    assert_eq!(
        client.last_disconnect_reason(),
        Some(DisconnectReason::ConnectionClosed)
    );
    client
        .ping()
        .await
        .unwrap();
}

#[tokio::test]
async fn restart_during_backoff_leaves_one_session() {
    let exchange = MockExchange::start(conference_script).await;
    let mut options = exchange.options();
    options.reconnect.initial_delay_ms = 300;
    let client = AmiClient::connect(options)
        .await
        .unwrap();
    let mut states = client.state_watch();

    exchange.drop_connections();
    timeout(
        WAIT,
        states.wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. })),
    )
    .await
    .unwrap()
    .unwrap();

    client.close().await;
    client
        .start()
        .await
        .unwrap();

    // outlast the abandoned backoff delay
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(exchange.logins(), 2);
    assert_eq!(exchange.connections(), 2);
    assert!(client.is_ready());
    client
        .ping()
        .await
        .unwrap();

    client.close().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(exchange.connections(), 2);
}

#[tokio::test]
async fn reconnect_walks_through_states() {
    let exchange = MockExchange::start(conference_script).await;
    let mut options = exchange.options();
    options.reconnect.initial_delay_ms = 200;
    let client = AmiClient::connect(options)
        .await
        .unwrap();
    let mut states = client.state_watch();

    exchange.drop_connections();
    timeout(
        WAIT,
        states.wait_for(|s| matches!(s, ConnectionState::Reconnecting { attempt: 1 })),
    )
    .await
    .unwrap()
    .unwrap();
    timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Ready))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exchange.connections(), 2);
}

#[tokio::test]
async fn unanswered_keepalive_forces_reconnect() {
    let exchange = MockExchange::start(|_| Vec::new()).await;
    let mut options = exchange.options();
    options.keepalive_interval_ms = 100;
    options.keepalive_timeout_ms = 100;
    let client = AmiClient::connect(options)
        .await
        .unwrap();

    wait_until(|| exchange.logins() >= 2).await;
    assert_eq!(
        client.last_disconnect_reason(),
        Some(DisconnectReason::LivenessExpired)
    );
}

#[tokio::test]
async fn conference_events_are_typed() {
    let exchange = MockExchange::start(conference_script).await;
    let conferences = ConferenceManager::new(
        AmiClient::connect(exchange.options())
            .await
            .unwrap(),
    );

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    conferences.subscribe(move |event| {
        let _ = tx.send(event);
    });

    exchange.push(
        event("ConfbridgeJoin")
            .with("Conference", "1000")
            .with("Channel", "PJSIP/f-00000006")
            .with("CallerIDNum", "2006")
            .with("Admin", "No"),
    );
    exchange.push(event("Hangup").with("Channel", "PJSIP/x-00000009"));
    exchange.push(
        event("ConfbridgeMute")
            .with("Conference", "1000")
            .with("Channel", "PJSIP/f-00000006"),
    );

    match timeout(WAIT, rx.recv())
        .await
        .unwrap()
    {
        Some(ConferenceEvent::Joined {
            conference,
            participant,
        }) => {
            assert_eq!(conference, "1000");
            assert_eq!(participant.caller_id_number.as_deref(), Some("2006"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        timeout(WAIT, rx.recv())
            .await
            .unwrap(),
        Some(ConferenceEvent::Muted {
            conference: "1000".into(),
            channel: "PJSIP/f-00000006".into(),
        })
    );
}

#[tokio::test]
async fn independent_clients_coexist() {
    let first = MockExchange::start(conference_script).await;
    let second = MockExchange::start(conference_script).await;
    let a = AmiClient::connect(first.options())
        .await
        .unwrap();
    let b = AmiClient::connect(second.options())
        .await
        .unwrap();

    first.drop_connections();
    wait_until(|| a.state() != ConnectionState::Ready).await;
    assert!(b.is_ready());
    b.ping()
        .await
        .unwrap();
}
