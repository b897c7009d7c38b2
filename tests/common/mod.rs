//! Scripted in-process exchange for integration tests.
//!
//! Listens on 127.0.0.1 with an ephemeral port, sends the AMI banner,
//! answers `Login`/`Logoff` itself and hands every other action to a script.
//! Frames returned by the script get the request's `ActionID` inserted as
//! their second field.

#![allow(dead_code)]

use asterisk_ami_tokio::{encode, ConnectOptions, Frame, FrameParser, ReconnectPolicy};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};

pub const USERNAME: &str = "admin";
pub const SECRET: &str = "amp111";
pub const BANNER: &str = "Asterisk Call Manager/9.0.0";

type Script = Arc<dyn Fn(&Frame) -> Vec<Frame> + Send + Sync>;

pub struct MockExchange {
    pub port: u16,
    connections: Arc<AtomicUsize>,
    logins: Arc<AtomicUsize>,
    drop_tx: watch::Sender<u64>,
    push_tx: broadcast::Sender<Frame>,
}

impl MockExchange {
    pub async fn start<F>(script: F) -> Self
    where
        F: Fn(&Frame) -> Vec<Frame> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let port = listener
            .local_addr()
            .unwrap()
            .port();
        let script: Script = Arc::new(script);
        let connections = Arc::new(AtomicUsize::new(0));
        let logins = Arc::new(AtomicUsize::new(0));
        let (drop_tx, _) = watch::channel(0u64);
        let (push_tx, _) = broadcast::channel(64);

        let exchange = MockExchange {
            port,
            connections: connections.clone(),
            logins: logins.clone(),
            drop_tx: drop_tx.clone(),
            push_tx: push_tx.clone(),
        };

        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener
                    .accept()
                    .await
                else {
                    return;
                };
                connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(
                    socket,
                    script.clone(),
                    logins.clone(),
                    drop_tx.subscribe(),
                    push_tx.subscribe(),
                ));
            }
        });
        exchange
    }

    /// Client options pointing at this exchange with fast reconnects and no
    /// keepalive.
    pub fn options(&self) -> ConnectOptions {
        let mut options = ConnectOptions::new("127.0.0.1", USERNAME, SECRET).with_port(self.port);
        options.keepalive_interval_ms = 0;
        options.action_timeout_ms = 2000;
        options.reconnect = ReconnectPolicy {
            initial_delay_ms: 20,
            max_delay_ms: 100,
            multiplier: 2.0,
            max_attempts: None,
        };
        options
    }

    /// Close every live connection.
    pub fn drop_connections(&self) {
        self.drop_tx
            .send_modify(|generation| *generation += 1);
    }

    /// Send an unsolicited frame on every live connection.
    pub fn push(&self, frame: Frame) {
        let _ = self
            .push_tx
            .send(frame);
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections
            .load(Ordering::SeqCst)
    }

    /// Successful logins so far.
    pub fn logins(&self) -> usize {
        self.logins
            .load(Ordering::SeqCst)
    }
}

async fn serve(
    mut socket: TcpStream,
    script: Script,
    logins: Arc<AtomicUsize>,
    mut drop_rx: watch::Receiver<u64>,
    mut push_rx: broadcast::Receiver<Frame>,
) {
    if socket
        .write_all(format!("{}\r\n", BANNER).as_bytes())
        .await
        .is_err()
    {
        return;
    }

    let mut parser = FrameParser::new();
    let mut buf = [0u8; 4096];
    loop {
        while let Some(request) = parser.next_frame() {
            let (replies, hang_up) = answer(&request, &script, &logins);
            for reply in replies {
                if socket
                    .write_all(encode(&reply).as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
            }
            if hang_up {
                return;
            }
        }

        tokio::select! {
            read = socket.read(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if parser.add_data(&buf[..n]).is_err() {
                        return;
                    }
                }
            },
            _ = drop_rx.changed() => return,
            pushed = push_rx.recv() => {
                if let Ok(frame) = pushed {
                    if socket.write_all(encode(&frame).as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Replies for one request, plus whether to close afterwards.
fn answer(request: &Frame, script: &Script, logins: &AtomicUsize) -> (Vec<Frame>, bool) {
    let action_id = request
        .action_id()
        .unwrap_or("")
        .to_string();
    let (mut replies, hang_up) = match request.get("Action") {
        Some(a) if a.eq_ignore_ascii_case("Login") => {
            if request.get("Username") == Some(USERNAME) && request.get("Secret") == Some(SECRET) {
                logins.fetch_add(1, Ordering::SeqCst);
                (
                    vec![response("Success").with("Message", "Authentication accepted")],
                    false,
                )
            } else {
                (
                    vec![response("Error").with("Message", "Authentication failed")],
                    true,
                )
            }
        }
        Some(a) if a.eq_ignore_ascii_case("Logoff") => (
            vec![response("Goodbye").with("Message", "Thanks for all the fish.")],
            true,
        ),
        _ => (script(request), false),
    };
    for reply in &mut replies {
        reply.insert(1, "ActionID", action_id.as_str());
    }
    (replies, hang_up)
}

pub fn response(status: &str) -> Frame {
    Frame::new().with("Response", status)
}

pub fn event(name: &str) -> Frame {
    Frame::new().with("Event", name)
}

/// Initial response, items, and a `<Action>Complete` event reporting the count.
pub fn list_reply(action: &str, items: Vec<Frame>) -> Vec<Frame> {
    let count = items.len();
    let mut frames = vec![response("Success")
        .with("EventList", "start")
        .with("Message", "List will follow")];
    frames.extend(items);
    frames.push(
        event(&format!("{}Complete", action))
            .with("EventList", "Complete")
            .with("ListItems", count.to_string()),
    );
    frames
}

/// Install a test log writer once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
