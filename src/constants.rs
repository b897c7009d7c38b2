//! Protocol constants and configuration values

/// Default Asterisk Manager Interface port
pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Socket buffer size for reading from TCP stream (16KB)
pub const SOCKET_BUF_SIZE: usize = 16 * 1024;

/// Buffer allocation size, used for both initial allocation and growth increments
pub const BUF_CHUNK: usize = 16 * 1024;

/// Maximum size of a single frame (1MB). Larger frames are dropped.
/// `Command` output of `core show channels` on a busy box stays well below this.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum unconsumed buffer size (4MB). Exceeding it means the stream is
/// not producing line terminators and the connection is desynchronized.
pub const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Line terminator emitted on the wire. Both `\r\n` and `\n` are accepted on input.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Suffix of the completion event name for list actions (`<Action>Complete`).
pub const LIST_COMPLETE_SUFFIX: &str = "Complete";

/// `EventList` value carried by completion events.
pub const EVENT_LIST_COMPLETE: &str = "Complete";

/// TCP connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Default per-action response timeout in milliseconds
pub const DEFAULT_ACTION_TIMEOUT_MS: u64 = 10_000;

/// Idle interval after which a keepalive `Ping` is sent
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 20_000;

/// Timeout for the keepalive `Ping` response
pub const DEFAULT_KEEPALIVE_TIMEOUT_MS: u64 = 5000;

/// First reconnect delay
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1000;

/// Reconnect delay cap
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

/// How long `close` waits for the write half to come free before giving up
pub const WRITER_RELEASE_TIMEOUT_MS: u64 = 1000;

/// How often the read loop expires abandoned requests
pub const SWEEP_INTERVAL_MS: u64 = 250;

/// Maximum number of queued events per event stream before dropping
pub const MAX_EVENT_QUEUE_SIZE: usize = 1000;

/// Upper bound on conference identifier and channel name length
pub const MAX_IDENTIFIER_LEN: usize = 80;

/// Upper bound on a dialed number after normalization
pub const MAX_DIAL_LEN: usize = 32;
