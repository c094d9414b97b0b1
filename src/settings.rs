//! Client settings and the flag sets that select subtests and protocols.

use std::collections::BTreeMap;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;
use std::time::Duration;

use crate::locate::MlabnsPolicy;
use crate::params;

/// Set of subtests to request from the server.
///
/// The bit values are the NDT wire encoding: the login message carries this
/// set as a single byte, and the server advertises granted tests back as
/// the decimal value of each bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NettestFlags(u8);

impl NettestFlags {
    /// The empty set.
    pub const NONE: NettestFlags = NettestFlags(0);
    /// Middlebox detection (not implemented by this client).
    pub const MIDDLEBOX: NettestFlags = NettestFlags(1 << 0);
    /// Upload (C2S) subtest.
    pub const UPLOAD: NettestFlags = NettestFlags(1 << 1);
    /// Download (S2C) subtest.
    pub const DOWNLOAD: NettestFlags = NettestFlags(1 << 2);
    /// Simple firewall probing (not implemented by this client).
    pub const SIMPLE_FIREWALL: NettestFlags = NettestFlags(1 << 3);
    /// Status capability marker; always OR'd into the login message.
    pub const STATUS: NettestFlags = NettestFlags(1 << 4);
    /// Metadata subtest.
    pub const META: NettestFlags = NettestFlags(1 << 5);
    /// Multi-stream upload subtest.
    pub const UPLOAD_EXT: NettestFlags = NettestFlags(1 << 6);
    /// Multi-stream download subtest.
    pub const DOWNLOAD_EXT: NettestFlags = NettestFlags(1 << 7);

    /// The wire byte for this set.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every member of `other` is in this set.
    pub const fn contains(self, other: NettestFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the set is empty.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for NettestFlags {
    type Output = NettestFlags;

    fn bitor(self, rhs: NettestFlags) -> NettestFlags {
        NettestFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for NettestFlags {
    fn bitor_assign(&mut self, rhs: NettestFlags) {
        self.0 |= rhs.0;
    }
}

/// One NDT subtest, as identified on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nettest {
    /// Middlebox detection.
    Middlebox,
    /// Upload (C2S).
    Upload,
    /// Download (S2C).
    Download,
    /// Simple firewall probing.
    SimpleFirewall,
    /// Status capability marker.
    Status,
    /// Metadata exchange.
    Meta,
    /// Multi-stream upload.
    UploadExt,
    /// Multi-stream download.
    DownloadExt,
}

impl Nettest {
    /// Map a server-advertised decimal test id back to a subtest.
    pub fn from_id(id: u8) -> Option<Nettest> {
        match id {
            1 => Some(Nettest::Middlebox),
            2 => Some(Nettest::Upload),
            4 => Some(Nettest::Download),
            8 => Some(Nettest::SimpleFirewall),
            16 => Some(Nettest::Status),
            32 => Some(Nettest::Meta),
            64 => Some(Nettest::UploadExt),
            128 => Some(Nettest::DownloadExt),
            _ => None,
        }
    }

    /// The flag bit for this subtest.
    pub fn flag(self) -> NettestFlags {
        match self {
            Nettest::Middlebox => NettestFlags::MIDDLEBOX,
            Nettest::Upload => NettestFlags::UPLOAD,
            Nettest::Download => NettestFlags::DOWNLOAD,
            Nettest::SimpleFirewall => NettestFlags::SIMPLE_FIREWALL,
            Nettest::Status => NettestFlags::STATUS,
            Nettest::Meta => NettestFlags::META,
            Nettest::UploadExt => NettestFlags::UPLOAD_EXT,
            Nettest::DownloadExt => NettestFlags::DOWNLOAD_EXT,
        }
    }

    /// Stable lowercase name, used in log lines and emitted events.
    pub fn label(self) -> &'static str {
        match self {
            Nettest::Middlebox => "middlebox",
            Nettest::Upload => "upload",
            Nettest::Download => "download",
            Nettest::SimpleFirewall => "simple_firewall",
            Nettest::Status => "status",
            Nettest::Meta => "meta",
            Nettest::UploadExt => "upload_ext",
            Nettest::DownloadExt => "download_ext",
        }
    }
}

/// Set of protocol layers to enable on top of TCP. The three flags compose
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtocolFlags(u8);

impl ProtocolFlags {
    /// Plain NDT: binary messages over a raw socket.
    pub const NONE: ProtocolFlags = ProtocolFlags(0);
    /// Wrap message bodies in JSON objects (extended-login era servers).
    pub const JSON: ProtocolFlags = ProtocolFlags(1 << 0);
    /// Run control and measurement channels over TLS.
    pub const TLS: ProtocolFlags = ProtocolFlags(1 << 1);
    /// Encapsulate NDT messages in WebSocket framing.
    pub const WEBSOCKET: ProtocolFlags = ProtocolFlags(1 << 2);

    /// Whether every member of `other` is in this set.
    pub const fn contains(self, other: ProtocolFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether JSON message bodies are enabled.
    pub const fn json(self) -> bool {
        self.contains(ProtocolFlags::JSON)
    }

    /// Whether TLS is enabled.
    pub const fn tls(self) -> bool {
        self.contains(ProtocolFlags::TLS)
    }

    /// Whether WebSocket framing is enabled.
    pub const fn websocket(self) -> bool {
        self.contains(ProtocolFlags::WEBSOCKET)
    }
}

impl BitOr for ProtocolFlags {
    type Output = ProtocolFlags;

    fn bitor(self, rhs: ProtocolFlags) -> ProtocolFlags {
        ProtocolFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ProtocolFlags {
    fn bitor_assign(&mut self, rhs: ProtocolFlags) {
        self.0 |= rhs.0;
    }
}

/// How much the client should log through the emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// Emit nothing.
    #[default]
    Quiet,
    /// Emit warnings only.
    Warning,
    /// Emit warnings and informational messages.
    Info,
    /// Emit everything.
    Debug,
}

/// NDT client settings. [`Settings::default`] gives the values a plain
/// download against the nearest M-Lab server would use.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL of the mlab-ns server directory. Unused when
    /// [`hostname`](Settings::hostname) is set. Must not end with a slash.
    pub mlabns_base_url: String,
    /// Server-selection policy passed to mlab-ns.
    pub mlabns_policy: MlabnsPolicy,
    /// Timeout applied to each I/O operation.
    pub timeout: Duration,
    /// Explicit NDT server hostname; skips discovery when set.
    pub hostname: Option<String>,
    /// Explicit control port. When unset, 3001 is used, or 3010 under TLS.
    pub port: Option<u16>,
    /// The subtests to request.
    pub nettest_flags: NettestFlags,
    /// Verbosity of warning/info/debug emission.
    pub verbosity: Verbosity,
    /// Key/value pairs sent to the server during the meta subtest.
    pub metadata: BTreeMap<String, String>,
    /// Protocol layers to enable.
    pub protocol_flags: ProtocolFlags,
    /// Wall-clock cap on each subtest, and on queue waiting.
    pub max_runtime: Duration,
    /// Local SOCKS5h proxy port. When set, every connection (and every
    /// hostname resolution) goes through the proxy.
    pub socks5h_port: Option<u16>,
    /// PEM bundle used to verify TLS peers. When unset, the built-in
    /// webpki roots are used.
    pub ca_bundle_path: Option<PathBuf>,
    /// Whether to verify the TLS peer's certificate chain and hostname.
    /// Disabling this is only useful for testing.
    pub tls_verify_peer: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "client.version".to_string(),
            params::NDT_VERSION_COMPAT.to_string(),
        );
        metadata.insert(
            "client.application".to_string(),
            format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        );
        Settings {
            mlabns_base_url: "https://mlab-ns.appspot.com".to_string(),
            mlabns_policy: MlabnsPolicy::GeoOptions,
            timeout: params::IO_TIMEOUT,
            hostname: None,
            port: None,
            nettest_flags: NettestFlags::DOWNLOAD,
            verbosity: Verbosity::Quiet,
            metadata,
            protocol_flags: ProtocolFlags::NONE,
            max_runtime: params::MAX_RUNTIME,
            socks5h_port: None,
            ca_bundle_path: None,
            tls_verify_peer: true,
        }
    }
}

impl Settings {
    /// The control port to dial: the explicit port when set, otherwise the
    /// default for the selected protocol stack.
    pub fn control_port(&self) -> u16 {
        self.port.unwrap_or(if self.protocol_flags.tls() {
            params::CONTROL_PORT_TLS
        } else {
            params::CONTROL_PORT
        })
    }
}
