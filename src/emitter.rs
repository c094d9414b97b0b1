//! Event sink for log lines, performance samples, and server results.
//!
//! The client never prints anything itself; everything observable goes
//! through an [`Emitter`]. The default method bodies write to stderr, so a
//! unit struct is a usable sink; override individual methods to route
//! events elsewhere.

use std::fmt;
use std::io::Write;

use serde::Serialize;

use crate::settings::Nettest;

/// Namespace of a server-reported result variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultScope {
    /// Web100 kernel variables sent after the download subtest.
    Web100,
    /// TCP info variables.
    TcpInfo,
    /// Summary variables from the final results exchange.
    Summary,
}

impl ResultScope {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            ResultScope::Web100 => "web100",
            ResultScope::TcpInfo => "tcp_info",
            ResultScope::Summary => "summary",
        }
    }
}

impl fmt::Display for ResultScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extension points invoked while a test runs.
///
/// `on_warning`, `on_info`, and `on_debug` are gated by
/// [`Settings::verbosity`](crate::settings::Settings::verbosity); the other
/// callbacks always fire. All callbacks are invoked from the task driving
/// [`Client::run`](crate::client::Client::run), never concurrently.
pub trait Emitter: Send {
    /// A warning message was emitted.
    fn on_warning(&mut self, msg: &str) {
        eprintln!("ndt: warning: {msg}");
    }

    /// An informational message was emitted.
    fn on_info(&mut self, msg: &str) {
        eprintln!("ndt: {msg}");
    }

    /// A debug message was emitted.
    fn on_debug(&mut self, msg: &str) {
        eprintln!("ndt: debug: {msg}");
    }

    /// A performance sample was measured.
    ///
    /// `measured_bytes` were moved over `nflows` flows in the last
    /// `interval` seconds; `elapsed` seconds have passed since the subtest
    /// started, out of at most `max_runtime`. Dividing `elapsed` by
    /// `max_runtime` gives a completion estimate.
    fn on_performance(
        &mut self,
        subtest: Nettest,
        nflows: u8,
        measured_bytes: f64,
        interval: f64,
        elapsed: f64,
        max_runtime: f64,
    ) {
        if interval <= 0.0 {
            return;
        }
        let speed = 8.0 * measured_bytes / interval / 1_000_000.0;
        eprintln!(
            "ndt: {} {:>5.1}% {speed:>8.2} Mbit/s ({nflows} flow{})",
            subtest.label(),
            100.0 * elapsed / max_runtime,
            if nflows == 1 { "" } else { "s" },
        );
    }

    /// The server reported variable `name` = `value` under `scope`.
    fn on_result(&mut self, scope: ResultScope, name: &str, value: &str) {
        eprintln!("ndt: [{scope}] {name}: {value}");
    }

    /// The server is busy; `reason` is the raw queue message. May fire once
    /// per discovered candidate server.
    fn on_server_busy(&mut self, reason: &str) {
        eprintln!("ndt: server busy: {reason}");
    }
}

/// Emitter relying entirely on the default stderr behavior.
#[derive(Debug, Default)]
pub struct StderrEmitter;

impl Emitter for StderrEmitter {}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Event<'a> {
    Log {
        level: &'a str,
        message: &'a str,
    },
    Performance {
        subtest: &'a str,
        nflows: u8,
        measured_bytes: f64,
        interval_s: f64,
        elapsed_s: f64,
        max_runtime_s: f64,
    },
    Result {
        scope: &'a str,
        name: &'a str,
        value: &'a str,
    },
    ServerBusy {
        reason: &'a str,
    },
}

/// Emitter that writes one JSON object per event, for batch processing.
pub struct JsonEmitter<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonEmitter<W> {
    /// Wrap a writer.
    pub fn new(out: W) -> Self {
        JsonEmitter { out }
    }

    fn emit(&mut self, event: &Event) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(self.out, "{json}");
        }
    }
}

impl<W: Write + Send> Emitter for JsonEmitter<W> {
    fn on_warning(&mut self, msg: &str) {
        self.emit(&Event::Log {
            level: "warning",
            message: msg,
        });
    }

    fn on_info(&mut self, msg: &str) {
        self.emit(&Event::Log {
            level: "info",
            message: msg,
        });
    }

    fn on_debug(&mut self, msg: &str) {
        self.emit(&Event::Log {
            level: "debug",
            message: msg,
        });
    }

    fn on_performance(
        &mut self,
        subtest: Nettest,
        nflows: u8,
        measured_bytes: f64,
        interval: f64,
        elapsed: f64,
        max_runtime: f64,
    ) {
        self.emit(&Event::Performance {
            subtest: subtest.label(),
            nflows,
            measured_bytes,
            interval_s: interval,
            elapsed_s: elapsed,
            max_runtime_s: max_runtime,
        });
    }

    fn on_result(&mut self, scope: ResultScope, name: &str, value: &str) {
        self.emit(&Event::Result {
            scope: scope.as_str(),
            name,
            value,
        });
    }

    fn on_server_busy(&mut self, reason: &str) {
        self.emit(&Event::ServerBusy { reason });
    }
}
