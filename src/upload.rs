//! Upload (C2S) subtest, single-stream and multi-stream.
//!
//! Sends a fixed random 8 KiB message back-to-back on every flow until the
//! server signals stop with an empty TEST_MSG or the runtime cap expires,
//! then shuts the flows down write-first and collects the server-measured
//! throughput.

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::client::{Client, NdtConn};
use crate::codec::MsgType;
use crate::error::{ErrKind, Error, Result};
use crate::params;
use crate::settings::Nettest;

enum LoopEnd {
    /// The control watcher returned: stop signal or early measurement.
    Ctl(Result<Option<String>>),
    /// The runtime cap expired or every flow ended.
    Drained,
}

/// Wait for the next TEST_MSG on the control channel. An empty body is the
/// stop signal; a non-empty one is the server measurement arriving early.
/// Per-read timeouts are retried until `deadline`.
async fn watch_control(ctl: &mut NdtConn, deadline: Instant) -> Result<Option<String>> {
    loop {
        if Instant::now() >= deadline {
            return Err(Error::new(ErrKind::TimedOut));
        }
        match ctl.msg_expect(MsgType::TestMsg).await {
            Ok(body) => {
                return Ok(if body.is_empty() { None } else { Some(body) });
            }
            Err(err) if err.kind() == ErrKind::TimedOut => continue,
            Err(err) => return Err(err),
        }
    }
}

pub(crate) async fn run(
    client: &mut Client,
    ctl: &mut NdtConn,
    hostname: &str,
    test: Nettest,
) -> Result<()> {
    let (port, nflows) = ctl.msg_expect_test_prepare().await?;
    client.debug(&format!(
        "upload: opening {nflows} flow(s) to {hostname}:{port}"
    ));

    let mut flows = Vec::with_capacity(nflows as usize);
    for _ in 0..nflows {
        flows.push(client.dial_stack(hostname, port, params::WS_PROTO_C2S).await?);
    }

    ctl.msg_expect_empty(MsgType::TestStart).await?;

    let mut rng = SmallRng::from_os_rng();
    let mut message = vec![0u8; params::UPLOAD_MESSAGE_SIZE];
    rng.fill_bytes(&mut message);
    let payload = Bytes::from(message);

    let max_runtime = client.settings.max_runtime;
    let start = Instant::now();
    let deadline = start + max_runtime;

    let (tx, mut rx) = mpsc::channel::<usize>(64);
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    for mut flow in flows {
        let tx = tx.clone();
        let mut stop = stop_rx.clone();
        let payload = payload.clone();
        tasks.spawn(async move {
            loop {
                if *stop.borrow() {
                    break;
                }
                tokio::select! {
                    res = flow.write_data(&payload) => match res {
                        Ok(()) => {
                            if tx.send(payload.len()).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    },
                    _ = stop.changed() => break,
                }
            }
            // Write-direction shutdown first, so the server sees a clean
            // end of data and can finalize its measurement.
            flow.shutdown_write().await;
        });
    }
    drop(tx);

    let mut total: u64 = 0;
    let mut since_last: u64 = 0;
    let mut prev = start;
    let mut ticker = tokio::time::interval_at(start + params::UPDATE_INTERVAL, params::UPDATE_INTERVAL);

    let server_msg = {
        let watch_deadline = deadline + client.settings.timeout;
        let stop_watch = watch_control(ctl, watch_deadline);
        tokio::pin!(stop_watch);
        let end = loop {
            tokio::select! {
                res = &mut stop_watch => break LoopEnd::Ctl(res),
                sent = rx.recv() => match sent {
                    Some(n) => {
                        total += n as u64;
                        since_last += n as u64;
                    }
                    None => break LoopEnd::Drained,
                },
                _ = ticker.tick() => {
                    let now = Instant::now();
                    client.emit_performance(
                        test,
                        nflows,
                        since_last as f64,
                        (now - prev).as_secs_f64(),
                        (now - start).as_secs_f64(),
                    );
                    prev = now;
                    since_last = 0;
                },
                _ = tokio::time::sleep_until(deadline) => break LoopEnd::Drained,
            }
        };
        drop(rx);
        let _ = stop_tx.send(true);
        while tasks.join_next().await.is_some() {}
        match end {
            LoopEnd::Ctl(res) => res?,
            // The watcher keeps its partial read state; resume it until the
            // server reacts to our shutdowns.
            LoopEnd::Drained => stop_watch.await?,
        }
    };

    let elapsed = start.elapsed().as_secs_f64();
    client.debug(&format!("upload: sent {total} bytes in {elapsed:.2} s"));

    let server_speed = match server_msg {
        Some(body) => body,
        None => ctl.msg_expect(MsgType::TestMsg).await?,
    };
    client.debug(&format!(
        "upload speed measured by server: {}",
        server_speed.trim()
    ));

    ctl.msg_expect_empty(MsgType::TestFinalize).await?;
    Ok(())
}
