//! End-to-end sessions against a scripted NDT server on localhost.

mod support;

use std::sync::Arc;
use std::time::Duration;

use ndt_client::client::Client;
use ndt_client::settings::{NettestFlags, ProtocolFlags, Settings, Verbosity};
use support::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn local_settings(port: u16) -> Settings {
    let mut settings = Settings::default();
    settings.hostname = Some("127.0.0.1".to_string());
    settings.port = Some(port);
    settings.timeout = Duration::from_secs(3);
    settings.max_runtime = Duration::from_secs(3);
    settings.verbosity = Verbosity::Debug;
    settings
}

#[tokio::test]
async fn download_happy_path_plaintext_binary() {
    let ctl_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ctl_port = ctl_listener.local_addr().unwrap().port();
    let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let data_port = data_listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut ctl, _) = ctl_listener.accept().await.unwrap();

        let (code, payload) = recv_msg(&mut ctl).await;
        assert_eq!(code, MSG_LOGIN);
        assert_eq!(payload.len(), 1);
        assert_ne!(payload[0] & NettestFlags::DOWNLOAD.bits(), 0);

        send_kickoff(&mut ctl).await;
        send_msg(&mut ctl, MSG_SRV_QUEUE, b"0").await;
        send_msg(&mut ctl, MSG_LOGIN, b"v3.7.0-mock").await;
        send_msg(&mut ctl, MSG_LOGIN, b"4 32").await;

        // Download subtest.
        send_msg(&mut ctl, MSG_TEST_PREPARE, data_port.to_string().as_bytes()).await;
        let (mut data, _) = data_listener.accept().await.unwrap();
        send_msg(&mut ctl, MSG_TEST_START, b"").await;
        let chunk = vec![0xA5u8; 16 * 1024];
        let begin = std::time::Instant::now();
        while begin.elapsed() < Duration::from_millis(1100) {
            if data.write_all(&chunk).await.is_err() {
                break;
            }
        }
        drop(data);
        send_msg(&mut ctl, MSG_TEST_MSG, b"8765.43").await;
        let (code, speed) = recv_msg(&mut ctl).await;
        assert_eq!(code, MSG_TEST_MSG);
        assert!(String::from_utf8(speed).unwrap().parse::<f64>().unwrap() > 0.0);
        send_msg(&mut ctl, MSG_TEST_MSG, b"CurMSS: 1460\nMaxRTT: 22\n").await;
        send_msg(&mut ctl, MSG_TEST_FINALIZE, b"").await;

        // Meta subtest.
        send_msg(&mut ctl, MSG_TEST_PREPARE, b"").await;
        send_msg(&mut ctl, MSG_TEST_START, b"").await;
        let mut entries = Vec::new();
        loop {
            let (code, payload) = recv_msg(&mut ctl).await;
            assert_eq!(code, MSG_TEST_MSG);
            if payload.is_empty() {
                break;
            }
            entries.push(String::from_utf8(payload).unwrap());
        }
        assert!(entries.iter().any(|e| e == "client.version:v3.7.0"));
        send_msg(&mut ctl, MSG_TEST_FINALIZE, b"").await;

        send_msg(&mut ctl, MSG_RESULTS, b"ThroughputValue: 8765.43\nMinRTT: 10\n").await;
        send_msg(&mut ctl, MSG_LOGOUT, b"").await;
    });

    let recorder = Recorder::default();
    let mut settings = local_settings(ctl_port);
    settings.nettest_flags = NettestFlags::DOWNLOAD;
    let mut client =
        Client::new(settings).with_emitter(Box::new(RecordingEmitter(recorder.clone())));

    assert!(client.run().await);
    server.await.unwrap();

    let perfs = recorder.performances();
    assert!(perfs.len() >= 3, "expected >=3 samples, got {}", perfs.len());
    assert!(perfs.iter().all(|p| p.0 == "download" && p.1 == 1));
    assert!(perfs.iter().map(|p| p.2).sum::<f64>() > 0.0);

    let results = recorder.results();
    assert!(
        results
            .iter()
            .any(|r| r.0 == "summary" && r.1 == "ThroughputValue" && r.2 == "8765.43")
    );
    assert!(results.iter().any(|r| r.0 == "web100" && r.1 == "CurMSS"));
}

#[tokio::test]
async fn busy_server_fails_over_to_next_candidate() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        // First candidate: busy.
        let (mut ctl, _) = listener.accept().await.unwrap();
        let (code, _) = recv_msg(&mut ctl).await;
        assert_eq!(code, MSG_LOGIN);
        send_kickoff(&mut ctl).await;
        send_msg(&mut ctl, MSG_SRV_QUEUE, b"9977").await;
        drop(ctl);

        // Second candidate: complete session granting no tests.
        let (mut ctl, _) = listener.accept().await.unwrap();
        let (code, _) = recv_msg(&mut ctl).await;
        assert_eq!(code, MSG_LOGIN);
        send_kickoff(&mut ctl).await;
        send_msg(&mut ctl, MSG_SRV_QUEUE, b"0").await;
        send_msg(&mut ctl, MSG_LOGIN, b"v3.7.0-mock").await;
        send_msg(&mut ctl, MSG_LOGIN, b"").await;
        send_msg(&mut ctl, MSG_RESULTS, b"Summary: ok\n").await;
        send_msg(&mut ctl, MSG_LOGOUT, b"").await;
    });

    let recorder = Recorder::default();
    let mut settings = local_settings(port);
    settings.hostname = None;
    let mut client = Client::new(settings)
        .with_emitter(Box::new(RecordingEmitter(recorder.clone())))
        .with_directory(Box::new(FixedDirectory(vec![
            "busy.mlab.example".to_string(),
            "good.mlab.example".to_string(),
        ])))
        .with_resolver(Arc::new(FixedResolver("127.0.0.1".parse().unwrap())));

    assert!(client.run().await);
    server.await.unwrap();
    assert_eq!(recorder.busy_count(), 1);
}

#[tokio::test]
async fn websocket_json_upload_ext_with_three_flows() {
    let ctl_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ctl_port = ctl_listener.local_addr().unwrap().port();
    let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let data_port = data_listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut ctl, _) = ctl_listener.accept().await.unwrap();
        assert_eq!(ws_accept(&mut ctl).await, "ndt");

        let (code, payload) = ws_recv_ndt(&mut ctl).await;
        assert_eq!(code, MSG_EXTENDED_LOGIN);
        let login: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(login["msg"], "v3.7.0");
        let tests: u8 = login["tests"].as_str().unwrap().parse().unwrap();
        assert_ne!(tests & NettestFlags::UPLOAD_EXT.bits(), 0);

        // No kickoff on WebSocket.
        ws_send_ndt(&mut ctl, MSG_SRV_QUEUE, br#"{"msg":"0"}"#).await;
        ws_send_ndt(&mut ctl, MSG_LOGIN, br#"{"msg":"v3.7.0-mock"}"#).await;
        ws_send_ndt(&mut ctl, MSG_LOGIN, br#"{"msg":"64"}"#).await;

        let prepare = format!("{{\"msg\":\"{data_port} 3\"}}");
        ws_send_ndt(&mut ctl, MSG_TEST_PREPARE, prepare.as_bytes()).await;

        let mut readers = Vec::new();
        for _ in 0..3 {
            let (mut flow, _) = data_listener.accept().await.unwrap();
            assert_eq!(ws_accept(&mut flow).await, "c2s");
            readers.push(tokio::spawn(async move {
                let mut received = 0u64;
                while let Some((opcode, payload)) = ws_recv_msg(&mut flow).await {
                    if opcode == 8 {
                        break;
                    }
                    received += payload.len() as u64;
                }
                received
            }));
        }
        ws_send_ndt(&mut ctl, MSG_TEST_START, b"").await;

        tokio::time::sleep(Duration::from_millis(700)).await;
        // Zero-length TEST_MSG: stop uploading.
        ws_send_ndt(&mut ctl, MSG_TEST_MSG, b"").await;

        let mut total = 0u64;
        for reader in readers {
            total += reader.await.unwrap();
        }
        assert!(total > 0, "server received no upload data");

        ws_send_ndt(&mut ctl, MSG_TEST_MSG, br#"{"msg":"5678.90"}"#).await;
        ws_send_ndt(&mut ctl, MSG_TEST_FINALIZE, b"").await;
        ws_send_ndt(&mut ctl, MSG_RESULTS, br#"{"msg":"ThroughputValue: 5678.90\n"}"#).await;
        ws_send_ndt(&mut ctl, MSG_LOGOUT, b"").await;
    });

    let recorder = Recorder::default();
    let mut settings = local_settings(ctl_port);
    settings.nettest_flags = NettestFlags::UPLOAD_EXT;
    settings.protocol_flags = ProtocolFlags::WEBSOCKET | ProtocolFlags::JSON;
    let mut client =
        Client::new(settings).with_emitter(Box::new(RecordingEmitter(recorder.clone())));

    assert!(client.run().await);
    server.await.unwrap();

    let perfs = recorder.performances();
    assert!(!perfs.is_empty());
    assert!(perfs.iter().all(|p| p.0 == "upload_ext" && p.1 == 3));
    let elapsed: Vec<f64> = perfs.iter().map(|p| p.4).collect();
    assert!(
        elapsed.windows(2).all(|w| w[0] <= w[1]),
        "elapsed must be monotone: {elapsed:?}"
    );
}

#[tokio::test]
async fn download_ext_aggregates_two_flows() {
    let ctl_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ctl_port = ctl_listener.local_addr().unwrap().port();
    let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let data_port = data_listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut ctl, _) = ctl_listener.accept().await.unwrap();
        let (code, _) = recv_msg(&mut ctl).await;
        assert_eq!(code, MSG_LOGIN);
        send_kickoff(&mut ctl).await;
        send_msg(&mut ctl, MSG_SRV_QUEUE, b"0").await;
        send_msg(&mut ctl, MSG_LOGIN, b"v3.7.0-mock").await;
        send_msg(&mut ctl, MSG_LOGIN, b"128").await;

        let prepare = format!("{data_port} 2");
        send_msg(&mut ctl, MSG_TEST_PREPARE, prepare.as_bytes()).await;
        let mut flows = Vec::new();
        for _ in 0..2 {
            let (flow, _) = data_listener.accept().await.unwrap();
            flows.push(flow);
        }
        send_msg(&mut ctl, MSG_TEST_START, b"").await;

        let chunk = vec![0x5Au8; 8 * 1024];
        let begin = std::time::Instant::now();
        while begin.elapsed() < Duration::from_millis(800) {
            for flow in &mut flows {
                if flow.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        }
        drop(flows);

        send_msg(&mut ctl, MSG_TEST_MSG, b"4321.00").await;
        let (code, _) = recv_msg(&mut ctl).await;
        assert_eq!(code, MSG_TEST_MSG);
        send_msg(&mut ctl, MSG_TEST_MSG, b"CurMSS: 1460\n").await;
        send_msg(&mut ctl, MSG_TEST_FINALIZE, b"").await;
        send_msg(&mut ctl, MSG_RESULTS, b"ThroughputValue: 4321.00\n").await;
        send_msg(&mut ctl, MSG_LOGOUT, b"").await;
    });

    let recorder = Recorder::default();
    let mut settings = local_settings(ctl_port);
    settings.nettest_flags = NettestFlags::DOWNLOAD_EXT;
    let mut client =
        Client::new(settings).with_emitter(Box::new(RecordingEmitter(recorder.clone())));

    assert!(client.run().await);
    server.await.unwrap();

    let perfs = recorder.performances();
    assert!(!perfs.is_empty());
    assert!(perfs.iter().all(|p| p.0 == "download_ext" && p.1 == 2));
}

#[tokio::test]
async fn silent_server_times_out_and_run_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut ctl, _) = listener.accept().await.unwrap();
        // Consume the login, then say nothing at all.
        let mut sink = [0u8; 64];
        let _ = ctl.read(&mut sink).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
    });

    let recorder = Recorder::default();
    let mut settings = local_settings(port);
    settings.timeout = Duration::from_millis(400);
    let mut client =
        Client::new(settings).with_emitter(Box::new(RecordingEmitter(recorder.clone())));

    assert!(!client.run().await);
    server.await.unwrap();
    assert!(
        recorder
            .debug_messages()
            .iter()
            .any(|m| m.contains("timed_out")),
        "timeout must surface through the debug callback"
    );
}

#[tokio::test]
async fn malformed_websocket_handshake_sends_no_ndt_bytes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut ctl, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            ctl.read_exact(&mut byte).await.unwrap();
            request.push(byte[0]);
        }
        // Respond without Sec-WebSocket-Accept.
        ctl.write_all(
            b"HTTP/1.1 101 Switching Protocols\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Protocol: ndt\r\n\r\n",
        )
        .await
        .unwrap();
        // The client must hang up without sending any NDT bytes.
        let mut trailing = Vec::new();
        let n = ctl.read_to_end(&mut trailing).await.unwrap_or(0);
        assert_eq!(n, 0, "client sent bytes after a failed handshake");
    });

    let recorder = Recorder::default();
    let mut settings = local_settings(port);
    settings.protocol_flags = ProtocolFlags::WEBSOCKET;
    let mut client =
        Client::new(settings).with_emitter(Box::new(RecordingEmitter(recorder.clone())));

    assert!(!client.run().await);
    server.await.unwrap();
    assert!(
        recorder
            .debug_messages()
            .iter()
            .any(|m| m.contains("ws_proto")),
        "handshake failure must surface as ws_proto"
    );
}

#[tokio::test]
async fn socks5h_tunnels_without_local_dns() {
    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = proxy_listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut ctl, _) = proxy_listener.accept().await.unwrap();

        // SOCKS5 greeting and CONNECT, hostname carried literally.
        let mut greeting = [0u8; 3];
        ctl.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x00]);
        ctl.write_all(&[0x05, 0x00]).await.unwrap();

        let mut head = [0u8; 5];
        ctl.read_exact(&mut head).await.unwrap();
        assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
        let mut rest = vec![0u8; head[4] as usize + 2];
        ctl.read_exact(&mut rest).await.unwrap();
        let hostname = String::from_utf8(rest[..head[4] as usize].to_vec()).unwrap();
        assert_eq!(hostname, "ndt.tunneled.example");
        let port = u16::from_be_bytes([rest[rest.len() - 2], rest[rest.len() - 1]]);
        assert_eq!(port, 3001);
        ctl.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x0b, 0xb9])
            .await
            .unwrap();

        // From here the proxy socket is the NDT control channel.
        let (code, _) = recv_msg(&mut ctl).await;
        assert_eq!(code, MSG_LOGIN);
        send_kickoff(&mut ctl).await;
        send_msg(&mut ctl, MSG_SRV_QUEUE, b"0").await;
        send_msg(&mut ctl, MSG_LOGIN, b"v3.7.0-mock").await;
        send_msg(&mut ctl, MSG_LOGIN, b"").await;
        send_msg(&mut ctl, MSG_RESULTS, b"Summary: ok\n").await;
        send_msg(&mut ctl, MSG_LOGOUT, b"").await;
    });

    let recorder = Recorder::default();
    let mut settings = Settings::default();
    settings.hostname = Some("ndt.tunneled.example".to_string());
    settings.socks5h_port = Some(proxy_port);
    settings.timeout = Duration::from_secs(3);
    settings.max_runtime = Duration::from_secs(3);
    settings.verbosity = Verbosity::Debug;
    let mut client = Client::new(settings)
        .with_emitter(Box::new(RecordingEmitter(recorder.clone())))
        .with_resolver(Arc::new(FailingResolver));

    assert!(client.run().await, "SOCKS5h dial must not need local DNS");
    server.await.unwrap();

    let results = recorder.results();
    assert!(results.iter().any(|r| r.0 == "summary" && r.1 == "Summary"));
}

#[tokio::test]
async fn queue_wait_then_ready() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut ctl, _) = listener.accept().await.unwrap();
        let (code, _) = recv_msg(&mut ctl).await;
        assert_eq!(code, MSG_LOGIN);
        send_kickoff(&mut ctl).await;
        // Estimated wait, then a legacy keep-alive, then ready.
        send_msg(&mut ctl, MSG_SRV_QUEUE, b"1").await;
        send_msg(&mut ctl, MSG_SRV_QUEUE, b"9990").await;
        let (code, payload) = recv_msg(&mut ctl).await;
        assert_eq!(code, 10, "keep-alive must be echoed with msg_waiting");
        assert!(payload.is_empty());
        send_msg(&mut ctl, MSG_SRV_QUEUE, b"0").await;
        send_msg(&mut ctl, MSG_LOGIN, b"v3.7.0-mock").await;
        send_msg(&mut ctl, MSG_LOGIN, b"").await;
        send_msg(&mut ctl, MSG_RESULTS, b"Summary: ok\n").await;
        send_msg(&mut ctl, MSG_LOGOUT, b"").await;
    });

    let recorder = Recorder::default();
    let settings = local_settings(port);
    let mut client =
        Client::new(settings).with_emitter(Box::new(RecordingEmitter(recorder.clone())));

    assert!(client.run().await);
    server.await.unwrap();
    assert_eq!(recorder.busy_count(), 0);
}
