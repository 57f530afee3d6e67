//! Full-stack tests: server accept loop, client supervisor and the
//! work-connection protocol relaying real TCP traffic.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use burrow_client::{ClientConfig, ClientService, ProxyConf, ProxyPhase};
use burrow_control::ServerConfig;
use burrow_proto::ProxyType;
use burrow_server::ServerService;

const TOKEN: &str = "e2e-token";

/// Local service the client exposes: echoes whatever it receives.
async fn start_echo_service() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = conn.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    port
}

async fn start_server(tcp_mux: bool) -> (Arc<ServerService>, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = ServerService::new(ServerConfig {
        token: TOKEN.to_string(),
        proxy_bind_addr: "127.0.0.1".to_string(),
        tcp_mux,
        ..Default::default()
    });
    let svc = server.clone();
    tokio::spawn(async move {
        let _ = svc.serve(listener).await;
    });
    (server, port)
}

async fn start_client(server_port: u16, echo_port: u16, tcp_mux: bool) -> Arc<ClientService> {
    let client = ClientService::new(ClientConfig {
        server_addr: "127.0.0.1".to_string(),
        server_port,
        token: TOKEN.to_string(),
        tcp_mux,
        pool_count: 1,
        proxies: vec![ProxyConf {
            name: "echo".to_string(),
            proxy_type: ProxyType::Tcp,
            local_ip: "127.0.0.1".to_string(),
            local_port: echo_port,
            remote_port: 0,
        }],
        ..Default::default()
    });
    let svc = client.clone();
    tokio::spawn(async move {
        let _ = svc.run().await;
    });
    client
}

/// Wait until the client's proxy is running and return its public port.
async fn wait_for_proxy_port(client: &Arc<ClientService>) -> u16 {
    for _ in 0..200 {
        if let Some(ctl) = client.controller() {
            if let Some(ProxyPhase::Running { remote_addr }) = ctl.proxy_phase("echo") {
                return remote_addr.trim_start_matches(':').parse().unwrap();
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("proxy never came up");
}

async fn assert_echo_works(port: u16, payload: &[u8]) {
    let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    user.write_all(payload).await.unwrap();
    let mut got = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(10), user.read_exact(&mut got))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(got, payload);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_end_to_end_relay_over_mux() {
    let echo_port = start_echo_service().await;
    let (_server, server_port) = start_server(true).await;
    let client = start_client(server_port, echo_port, true).await;

    let public_port = wait_for_proxy_port(&client).await;
    assert_echo_works(public_port, b"hello through the burrow").await;

    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_end_to_end_relay_plain_tcp() {
    let echo_port = start_echo_service().await;
    let (_server, server_port) = start_server(false).await;
    let client = start_client(server_port, echo_port, false).await;

    let public_port = wait_for_proxy_port(&client).await;
    assert_echo_works(public_port, b"plain tcp path").await;

    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pool_sustains_sequential_users() {
    let echo_port = start_echo_service().await;
    let (_server, server_port) = start_server(true).await;
    let client = start_client(server_port, echo_port, true).await;

    let public_port = wait_for_proxy_port(&client).await;

    // Each user consumes a pooled work connection; the replenishment demand
    // must keep the pool serving subsequent users.
    for i in 0..3u8 {
        assert_echo_works(public_port, format!("round {}", i).as_bytes()).await;
    }

    client.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_login_is_rejected_with_wrong_token() {
    let (_server, server_port) = start_server(true).await;

    let client = ClientService::new(ClientConfig {
        server_addr: "127.0.0.1".to_string(),
        server_port,
        token: "wrong-token".to_string(),
        tcp_mux: true,
        login_fail_exit: true,
        ..Default::default()
    });

    let err = tokio::time::timeout(Duration::from_secs(10), client.run())
        .await
        .expect("login should fail fast")
        .unwrap_err();
    assert!(err.to_string().contains("login rejected"), "{}", err);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_tracks_client_count() {
    let echo_port = start_echo_service().await;
    let (server, server_port) = start_server(true).await;
    let client = start_client(server_port, echo_port, true).await;

    wait_for_proxy_port(&client).await;
    assert_eq!(server.resources().metrics.client_count(), 1);
    assert_eq!(server.control_manager().count(), 1);
    assert_eq!(server.resources().metrics.proxy_count("tcp"), 1);

    client.close();
    for _ in 0..100 {
        if server.resources().metrics.client_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(server.resources().metrics.client_count(), 0);
    assert_eq!(server.resources().metrics.proxy_count("tcp"), 0);
}
