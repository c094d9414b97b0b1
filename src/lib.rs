//! An [NDT](https://github.com/ndt-project/ndt/wiki/NDTProtocol) speed test
//! client library, wire-compatible with NDT server v3.7.0.
//!
//! NDT is the network performance measurement protocol historically
//! deployed on [M-Lab](https://www.measurementlab.net/). The client
//! discovers a server through mlab-ns (or uses an explicit hostname),
//! negotiates subtests over the control channel, and runs download, upload,
//! and metadata measurements, optionally over TLS and/or WebSocket framing
//! and optionally through a local SOCKS5h proxy.
//!
//! # Quick start
//!
//! ```no_run
//! use ndt_client::client::Client;
//! use ndt_client::settings::{NettestFlags, Settings};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut settings = Settings::default();
//! settings.nettest_flags = NettestFlags::DOWNLOAD | NettestFlags::UPLOAD;
//!
//! let mut client = Client::new(settings);
//! if !client.run().await {
//!     eprintln!("measurement failed");
//! }
//! # }
//! ```
//!
//! Progress and results are delivered through the
//! [`Emitter`](emitter::Emitter) callbacks; implement the trait to consume
//! them programmatically.

#![warn(missing_docs)]

pub mod client;
pub mod emitter;
pub mod error;
pub mod locate;
pub mod netx;
pub mod params;
pub mod settings;
pub mod ws;

mod codec;
mod download;
mod meta;
mod socks5;
mod tls;
mod upload;
