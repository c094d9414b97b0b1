//! The NDT client: dial stack composition and the control-protocol state
//! machine, from login through logout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::codec::{Connection, MsgType, parse_bounded};
use crate::emitter::{Emitter, ResultScope, StderrEmitter};
use crate::error::{ErrKind, Error, Result};
use crate::locate::{MlabNs, ServerDirectory};
use crate::netx::{self, Resolver, Stream, SystemResolver};
use crate::params;
use crate::settings::{Nettest, NettestFlags, Settings, Verbosity};
use crate::socks5;
use crate::tls::TlsClient;
use crate::ws::{WsFlags, WsStream};
use crate::{download, meta, upload};

/// A control or data connection through the full dial stack.
pub(crate) type NdtConn = Connection<Stream>;

enum Attempt {
    Complete,
    Busy,
    DialFailed(Error),
}

enum Queue {
    Ready,
    Busy,
}

/// NDT client. Construct with [`Settings`], optionally swap in custom
/// capability implementations, then call [`run`](Client::run).
///
/// ```no_run
/// use ndt_client::client::Client;
/// use ndt_client::settings::Settings;
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut client = Client::new(Settings::default());
/// let success = client.run().await;
/// # let _ = success;
/// # }
/// ```
pub struct Client {
    pub(crate) settings: Settings,
    pub(crate) emitter: Box<dyn Emitter>,
    directory: Box<dyn ServerDirectory>,
    resolver: Arc<dyn Resolver>,
    tls: Option<TlsClient>,
}

impl Client {
    /// Create a client with the production emitter, directory, and
    /// resolver.
    pub fn new(settings: Settings) -> Client {
        let directory = Box::new(MlabNs::new(
            settings.mlabns_base_url.clone(),
            settings.timeout,
        ));
        Client {
            settings,
            emitter: Box::new(StderrEmitter),
            directory,
            resolver: Arc::new(SystemResolver),
            tls: None,
        }
    }

    /// Replace the event sink.
    pub fn with_emitter(mut self, emitter: Box<dyn Emitter>) -> Client {
        self.emitter = emitter;
        self
    }

    /// Replace the server directory.
    pub fn with_directory(mut self, directory: Box<dyn ServerDirectory>) -> Client {
        self.directory = directory;
        self
    }

    /// Replace the hostname resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Client {
        self.resolver = resolver;
        self
    }

    /// Run a full NDT session using the configured settings.
    ///
    /// Candidate servers that are busy or unreachable are skipped; any
    /// other failure ends the run. Returns whether a session completed.
    /// The last error is surfaced through the debug callback.
    pub async fn run(&mut self) -> bool {
        match self.run_inner().await {
            Ok(done) => done,
            Err(err) => {
                self.debug(&format!("run failed: {err}"));
                false
            }
        }
    }

    async fn run_inner(&mut self) -> Result<bool> {
        if self.settings.protocol_flags.tls() {
            self.tls = Some(TlsClient::from_settings(&self.settings)?);
        }
        let candidates = self.query_server_list().await?;
        if candidates.is_empty() {
            self.warning("no NDT servers available");
            return Ok(false);
        }
        for hostname in candidates {
            self.info(&format!("trying NDT server {hostname}"));
            match self.attempt(&hostname).await? {
                Attempt::Complete => return Ok(true),
                Attempt::Busy => continue,
                Attempt::DialFailed(err) => {
                    self.warning(&format!("cannot connect to {hostname}: {err}"));
                    continue;
                }
            }
        }
        Ok(false)
    }

    async fn query_server_list(&mut self) -> Result<Vec<String>> {
        if let Some(hostname) = &self.settings.hostname {
            return Ok(vec![hostname.clone()]);
        }
        let policy = self.settings.mlabns_policy;
        self.directory.nearby(policy).await
    }

    /// One full session against one candidate server. Dial failures and a
    /// busy queue are recoverable; everything after is fatal for the run.
    async fn attempt(&mut self, hostname: &str) -> Result<Attempt> {
        let port = self.settings.control_port();
        let mut ctl = match self.dial_stack(hostname, port, params::WS_PROTO_CONTROL).await {
            Ok(conn) => conn,
            Err(err) => return Ok(Attempt::DialFailed(err)),
        };
        self.send_login(&mut ctl).await?;
        if !ctl.is_websocket() {
            self.recv_kickoff(&mut ctl).await?;
        }
        match self.wait_in_queue(&mut ctl).await? {
            Queue::Busy => return Ok(Attempt::Busy),
            Queue::Ready => {}
        }
        self.recv_version(&mut ctl).await?;
        let tests = self.recv_tests_ids(&mut ctl).await?;
        self.run_tests(&mut ctl, hostname, &tests).await?;
        self.recv_results_and_logout(&mut ctl).await?;
        self.wait_close(&mut ctl).await;
        Ok(Attempt::Complete)
    }

    /// Compose the dial stack: optional SOCKS5h, then optional TLS, then
    /// optional WebSocket, over TCP. Used for the control connection and
    /// for every data flow.
    pub(crate) async fn dial_stack(
        &mut self,
        hostname: &str,
        port: u16,
        ws_protocol: &str,
    ) -> Result<NdtConn> {
        let timeout = self.settings.timeout;

        let tcp = match self.settings.socks5h_port {
            Some(proxy_port) => {
                let proxy = SocketAddr::from(([127, 0, 0, 1], proxy_port));
                let mut tcp =
                    match tokio::time::timeout(timeout, TcpStream::connect(proxy)).await {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(err)) => return Err(err.into()),
                        Err(_) => return Err(Error::new(ErrKind::TimedOut)),
                    };
                socks5::connect(&mut tcp, hostname, port, timeout).await?;
                tcp
            }
            None => netx::dial_tcp(self.resolver.as_ref(), hostname, port, timeout).await?,
        };

        let stream = if self.settings.protocol_flags.tls() {
            let Some(tls) = &self.tls else {
                return Err(Error::with_cause(ErrKind::SslGeneric, "TLS not configured"));
            };
            Stream::Tls(Box::new(tls.handshake(hostname, tcp, timeout).await?))
        } else {
            Stream::Tcp(tcp)
        };

        let json = self.settings.protocol_flags.json();
        if self.settings.protocol_flags.websocket() {
            let ws = WsStream::handshake(stream, hostname, port, WsFlags::ALL, ws_protocol, timeout)
                .await?;
            Ok(Connection::websocket(ws, json, timeout))
        } else {
            Ok(Connection::raw(stream, json, timeout))
        }
    }

    /// The test set sent at login: the requested tests plus the status and
    /// meta markers expected by v3.7 servers.
    fn login_flags(&self) -> NettestFlags {
        self.settings.nettest_flags | NettestFlags::STATUS | NettestFlags::META
    }

    async fn send_login(&mut self, ctl: &mut NdtConn) -> Result<()> {
        ctl.msg_write_login(params::NDT_VERSION_COMPAT, self.login_flags())
            .await
    }

    /// Legacy servers greet with a fixed 13-byte banner before queueing.
    async fn recv_kickoff(&mut self, ctl: &mut NdtConn) -> Result<()> {
        let mut banner = [0u8; 13];
        ctl.read_exact_data(&mut banner).await?;
        if &banner != params::KICKOFF {
            return Err(Error::with_cause(
                ErrKind::InvalidArgument,
                "unexpected kickoff banner",
            ));
        }
        self.debug("received kickoff banner");
        Ok(())
    }

    async fn wait_in_queue(&mut self, ctl: &mut NdtConn) -> Result<Queue> {
        let deadline = Instant::now() + self.settings.max_runtime;
        loop {
            if Instant::now() >= deadline {
                return Err(Error::with_cause(ErrKind::TimedOut, "queue wait expired"));
            }
            let body = ctl.msg_expect(MsgType::SrvQueue).await?;
            let value = parse_bounded(&body, 0, 99_999)?;
            match value {
                params::QUEUE_READY => return Ok(Queue::Ready),
                params::QUEUE_BUSY => {
                    self.emitter.on_server_busy(body.trim());
                    return Ok(Queue::Busy);
                }
                params::QUEUE_HEARTBEAT => {
                    self.debug("queue keep-alive; echoing msg_waiting");
                    ctl.msg_write(MsgType::Waiting, "").await?;
                }
                wait => self.info(&format!("server queue: estimated wait {wait} s")),
            }
        }
    }

    async fn recv_version(&mut self, ctl: &mut NdtConn) -> Result<()> {
        let version = ctl.msg_expect(MsgType::Login).await?;
        self.info(&format!("server version: {version}"));
        Ok(())
    }

    /// Parse the advertised test ids, keeping server order and dropping
    /// anything we did not request.
    async fn recv_tests_ids(&mut self, ctl: &mut NdtConn) -> Result<Vec<Nettest>> {
        let body = ctl.msg_expect(MsgType::Login).await?;
        let requested = self.login_flags();
        let mut tests = Vec::new();
        for token in body.split_whitespace() {
            let id = parse_bounded(token, 1, 255)? as u8;
            match Nettest::from_id(id) {
                Some(test) if requested.contains(test.flag()) => tests.push(test),
                Some(test) => {
                    self.debug(&format!("ignoring unrequested test {}", test.label()))
                }
                None => self.warning(&format!("ignoring unknown test id {id}")),
            }
        }
        Ok(tests)
    }

    /// A failed subtest is reported and skipped; the session carries on as
    /// long as the control channel still behaves.
    async fn run_tests(
        &mut self,
        ctl: &mut NdtConn,
        hostname: &str,
        tests: &[Nettest],
    ) -> Result<()> {
        for &test in tests {
            self.info(&format!("starting {} subtest", test.label()));
            let outcome = match test {
                Nettest::Download | Nettest::DownloadExt => {
                    download::run(self, ctl, hostname, test).await
                }
                Nettest::Upload | Nettest::UploadExt => {
                    upload::run(self, ctl, hostname, test).await
                }
                Nettest::Meta => meta::run(self, ctl).await,
                other => {
                    self.info(&format!("skipping unsupported subtest {}", other.label()));
                    Ok(())
                }
            };
            match outcome {
                Ok(()) => self.info(&format!("{} subtest complete", test.label())),
                Err(err) => {
                    self.warning(&format!("{} subtest failed: {err}", test.label()))
                }
            }
        }
        Ok(())
    }

    async fn recv_results_and_logout(&mut self, ctl: &mut NdtConn) -> Result<()> {
        let deadline = Instant::now() + self.settings.max_runtime;
        loop {
            if Instant::now() >= deadline {
                return Err(Error::with_cause(ErrKind::TimedOut, "results wait expired"));
            }
            let (msg_type, body) = ctl.msg_read().await?;
            match msg_type {
                MsgType::Logout => return Ok(()),
                MsgType::Results => self.emit_results_lines(ResultScope::Summary, &body),
                other => {
                    return Err(Error::with_cause(
                        ErrKind::InvalidArgument,
                        format!("expected Results or Logout, received {other:?}"),
                    ));
                }
            }
        }
    }

    /// Drain whatever the server still has to say, then close.
    async fn wait_close(&mut self, ctl: &mut NdtConn) {
        let mut scratch = [0u8; 512];
        loop {
            match tokio::time::timeout(Duration::from_secs(1), ctl.read_data(&mut scratch)).await
            {
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        self.debug("connection closed");
    }

    pub(crate) fn warning(&mut self, msg: &str) {
        if self.settings.verbosity >= Verbosity::Warning {
            self.emitter.on_warning(msg);
        }
    }

    pub(crate) fn info(&mut self, msg: &str) {
        if self.settings.verbosity >= Verbosity::Info {
            self.emitter.on_info(msg);
        }
    }

    pub(crate) fn debug(&mut self, msg: &str) {
        if self.settings.verbosity >= Verbosity::Debug {
            self.emitter.on_debug(msg);
        }
    }

    pub(crate) fn emit_performance(
        &mut self,
        subtest: Nettest,
        nflows: u8,
        measured_bytes: f64,
        interval: f64,
        elapsed: f64,
    ) {
        let max_runtime = self.settings.max_runtime.as_secs_f64();
        self.emitter
            .on_performance(subtest, nflows, measured_bytes, interval, elapsed, max_runtime);
    }

    /// Split a results payload into `name: value` lines and hand each to
    /// the result callback.
    pub(crate) fn emit_results_lines(&mut self, scope: ResultScope, body: &str) {
        for line in body.lines() {
            if let Some((name, value)) = line.split_once(':') {
                self.emitter.on_result(scope, name.trim(), value.trim());
            }
        }
    }
}
