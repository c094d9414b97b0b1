//! Protocol constants and tuning parameters.

use std::time::Duration;

/// NDT protocol version this client is compatible with.
pub const NDT_VERSION_COMPAT: &str = "v3.7.0";

/// Default control port for in-clear NDT.
pub const CONTROL_PORT: u16 = 3001;

/// Default control port for NDT over TLS.
pub const CONTROL_PORT_TLS: u16 = 3010;

/// Greeting sent by legacy servers right after TCP accept. Skipped when the
/// WebSocket handshake subsumes it.
pub const KICKOFF: &[u8; 13] = b"123456 654321";

/// Queue code: the server is ready to run tests.
pub const QUEUE_READY: i64 = 0;

/// Queue code: the server is busy and we should try another one.
pub const QUEUE_BUSY: i64 = 9977;

/// Queue code: legacy keep-alive. The client answers with an empty
/// `msg_waiting`.
pub const QUEUE_HEARTBEAT: i64 = 9990;

/// Size of the random message sent repeatedly during the upload test (8 KiB).
pub const UPLOAD_MESSAGE_SIZE: usize = 1 << 13;

/// Scratch buffer for receiving download data; also the maximum accepted
/// WebSocket message size (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

/// Upper bound on parallel flows for the `_ext` subtests. Servers asking for
/// more are clamped here.
pub const MAX_FLOWS: u8 = 16;

/// Default timeout for individual I/O operations.
pub const IO_TIMEOUT: Duration = Duration::from_secs(7);

/// Default wall-clock cap on a single subtest.
pub const MAX_RUNTIME: Duration = Duration::from_secs(14);

/// Interval between client-side performance samples.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(250);

/// Sec-WebSocket-Protocol value for the control channel.
pub const WS_PROTO_CONTROL: &str = "ndt";

/// Sec-WebSocket-Protocol value for upload data channels.
pub const WS_PROTO_C2S: &str = "c2s";

/// Sec-WebSocket-Protocol value for download data channels.
pub const WS_PROTO_S2C: &str = "s2c";
