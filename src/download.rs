//! Download (S2C) subtest, single-stream and multi-stream.
//!
//! Reads from every data flow as fast as possible until the server closes
//! them or the runtime cap expires, sampling aggregate throughput every
//! 250 ms. Afterwards the control channel carries the server's own
//! measurement and a batch of web100 kernel variables.

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::client::{Client, NdtConn};
use crate::codec::MsgType;
use crate::emitter::ResultScope;
use crate::error::{ErrKind, Error, Result};
use crate::params;
use crate::settings::Nettest;

pub(crate) async fn run(
    client: &mut Client,
    ctl: &mut NdtConn,
    hostname: &str,
    test: Nettest,
) -> Result<()> {
    let (port, nflows) = ctl.msg_expect_test_prepare().await?;
    client.debug(&format!(
        "download: opening {nflows} flow(s) to {hostname}:{port}"
    ));

    let mut flows = Vec::with_capacity(nflows as usize);
    for _ in 0..nflows {
        flows.push(client.dial_stack(hostname, port, params::WS_PROTO_S2C).await?);
    }

    ctl.msg_expect_empty(MsgType::TestStart).await?;

    let max_runtime = client.settings.max_runtime;
    let start = Instant::now();
    let deadline = start + max_runtime;

    let (tx, mut rx) = mpsc::channel::<usize>(64);
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    for mut flow in flows {
        let tx = tx.clone();
        let mut stop = stop_rx.clone();
        tasks.spawn(async move {
            let mut buf = vec![0u8; params::MAX_MESSAGE_SIZE];
            loop {
                tokio::select! {
                    res = flow.read_data(&mut buf) => match res {
                        Ok(n) => {
                            if tx.send(n).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    },
                    _ = stop.changed() => break,
                }
            }
        });
    }
    drop(tx);

    let mut total: u64 = 0;
    let mut since_last: u64 = 0;
    let mut prev = start;
    let mut ticker = tokio::time::interval_at(start + params::UPDATE_INTERVAL, params::UPDATE_INTERVAL);
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(n) => {
                    total += n as u64;
                    since_last += n as u64;
                }
                None => break,
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
            _ = tokio::time::sleep_until(deadline) => break,
        }
    }
    drop(rx);
    let _ = stop_tx.send(true);
    while tasks.join_next().await.is_some() {}

    let elapsed = start.elapsed().as_secs_f64();
    client.debug(&format!("download: received {total} bytes in {elapsed:.2} s"));

    // The server reports its measured throughput, we answer with ours
    // (kbit/s, like every NDT client).
    let server_speed = ctl.msg_expect(MsgType::TestMsg).await?;
    client.debug(&format!(
        "download speed measured by server: {}",
        server_speed.trim()
    ));
    let client_speed = 8.0 * total as f64 / 1000.0 / elapsed.max(f64::EPSILON);
    ctl.msg_write(MsgType::TestMsg, &format!("{client_speed:.2}"))
        .await?;

    // Kernel variables, one or more TEST_MSG blocks, until TEST_FINALIZE.
    loop {
        let (msg_type, body) = ctl.msg_read().await?;
        match msg_type {
            MsgType::TestFinalize => return Ok(()),
            MsgType::TestMsg => client.emit_results_lines(ResultScope::Web100, &body),
            other => {
                return Err(Error::with_cause(
                    ErrKind::InvalidArgument,
                    format!("expected TestMsg or TestFinalize, received {other:?}"),
                ));
            }
        }
    }
}
