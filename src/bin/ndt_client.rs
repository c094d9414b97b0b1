use std::path::PathBuf;

use clap::Parser;
use ndt_client::client::Client;
use ndt_client::emitter::{Emitter, JsonEmitter, StderrEmitter};
use ndt_client::locate::MlabnsPolicy;
use ndt_client::settings::{NettestFlags, ProtocolFlags, Settings, Verbosity};

#[derive(Clone, Debug, clap::ValueEnum)]
enum Format {
    Human,
    Json,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum Policy {
    Closest,
    Random,
    GeoOptions,
}

#[derive(Parser, Debug)]
#[command(name = "ndt_client", about = "NDT (v3.7) speed test client", version)]
struct Cli {
    /// NDT server hostname; bypasses mlab-ns discovery
    #[arg(long)]
    server: Option<String>,
    /// Control port (default: 3001, or 3010 with --tls)
    #[arg(long)]
    port: Option<u16>,
    /// mlab-ns server-selection policy
    #[arg(long, value_enum, default_value = "geo-options")]
    policy: Policy,
    /// Base URL of the mlab-ns service
    #[arg(long)]
    mlabns_url: Option<String>,
    /// Use JSON message bodies
    #[arg(long)]
    json: bool,
    /// Run control and measurement channels over TLS
    #[arg(long)]
    tls: bool,
    /// Encapsulate NDT messages in WebSocket framing
    #[arg(long)]
    websocket: bool,
    /// Skip the download subtest
    #[arg(long)]
    no_download: bool,
    /// Run the upload subtest
    #[arg(long)]
    upload: bool,
    /// Run the multi-stream download subtest
    #[arg(long)]
    download_ext: bool,
    /// Run the multi-stream upload subtest
    #[arg(long)]
    upload_ext: bool,
    /// Per-operation I/O timeout in seconds
    #[arg(long, default_value_t = 7)]
    timeout: u64,
    /// Cap each subtest at this many seconds
    #[arg(long, default_value_t = 14)]
    max_runtime: u64,
    /// Tunnel everything through a SOCKS5h proxy on this local port
    #[arg(long)]
    socks5h: Option<u16>,
    /// CA bundle used to verify TLS peers
    #[arg(long)]
    ca_bundle: Option<PathBuf>,
    /// Skip TLS peer verification (testing only)
    #[arg(long)]
    insecure: bool,
    /// Increase verbosity (-v: debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Emit warnings and results only
    #[arg(long)]
    quiet: bool,
    /// Output format
    #[arg(long, value_enum, default_value = "human")]
    format: Format,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut settings = Settings::default();
    settings.hostname = cli.server;
    settings.port = cli.port;
    settings.mlabns_policy = match cli.policy {
        Policy::Closest => MlabnsPolicy::Closest,
        Policy::Random => MlabnsPolicy::Random,
        Policy::GeoOptions => MlabnsPolicy::GeoOptions,
    };
    if let Some(url) = cli.mlabns_url {
        settings.mlabns_base_url = url;
    }

    let mut tests = NettestFlags::NONE;
    if !cli.no_download {
        tests |= NettestFlags::DOWNLOAD;
    }
    if cli.upload {
        tests |= NettestFlags::UPLOAD;
    }
    if cli.download_ext {
        tests |= NettestFlags::DOWNLOAD_EXT;
    }
    if cli.upload_ext {
        tests |= NettestFlags::UPLOAD_EXT;
    }
    if tests.is_empty() {
        eprintln!("error: nothing to do");
        std::process::exit(1);
    }
    settings.nettest_flags = tests;

    if cli.json {
        settings.protocol_flags |= ProtocolFlags::JSON;
    }
    if cli.tls {
        settings.protocol_flags |= ProtocolFlags::TLS;
    }
    if cli.websocket {
        settings.protocol_flags |= ProtocolFlags::WEBSOCKET;
    }

    settings.timeout = std::time::Duration::from_secs(cli.timeout);
    settings.max_runtime = std::time::Duration::from_secs(cli.max_runtime);
    settings.socks5h_port = cli.socks5h;
    settings.ca_bundle_path = cli.ca_bundle;
    settings.tls_verify_peer = !cli.insecure;

    settings.verbosity = if cli.quiet {
        Verbosity::Warning
    } else if cli.verbose > 0 {
        Verbosity::Debug
    } else {
        Verbosity::Info
    };

    let emitter: Box<dyn Emitter> = match cli.format {
        Format::Human => Box::new(StderrEmitter),
        Format::Json => Box::new(JsonEmitter::new(std::io::stdout())),
    };

    let mut client = Client::new(settings).with_emitter(emitter);
    if !client.run().await {
        std::process::exit(1);
    }
}
