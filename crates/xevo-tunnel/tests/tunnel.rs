//! End-to-end tunnel scenarios over real sockets
//!
//! Each test stands up a server on an ephemeral port, connects a client
//! through the full WebSocket + SSH stack, and pushes bytes through the
//! routes under test.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use xevo_tunnel::{parse_route, Client, ClientOptions, Server, ServerOptions, TunnelError};

/// Start a server with the given options on an ephemeral port
async fn start_server(opts: ServerOptions) -> (Arc<Server>, SocketAddr) {
    let server = Arc::new(Server::new(opts).expect("server startup"));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let background = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = background.serve(listener).await;
    });
    (server, addr)
}

/// Start a TCP echo service, returning its address
async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Connect with retries while the stub listener comes up
async fn connect_retry(addr: &str) -> TcpStream {
    let deadline = Duration::from_secs(5);
    timeout(deadline, async {
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => return stream,
                Err(_) => sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await
    .expect("stub did not come up")
}

fn client_opts(server_addr: SocketAddr, routes: &[&str]) -> ClientOptions {
    let mut opts = ClientOptions::new(format!("http://{server_addr}"));
    for spec in routes {
        opts.routes.push(parse_route(spec).expect("route"));
    }
    opts
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forward_tcp_echo() {
    let echo = start_echo().await;
    let (_server, server_addr) = start_server(ServerOptions::default()).await;

    let route = format!("127.0.0.1:34001:127.0.0.1:{}", echo.port());
    let client = Arc::new(Client::new(client_opts(server_addr, &[&route])).expect("client"));
    let runner = Arc::clone(&client);
    let session = tokio::spawn(async move { runner.run().await });

    let mut conn = connect_retry("127.0.0.1:34001").await;
    conn.write_all(b"hello").await.expect("write");
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
        .await
        .expect("echo timeout")
        .expect("echo read");
    assert_eq!(&buf, b"hello");
    drop(conn);

    // The channel close is recorded in the stats.
    timeout(Duration::from_secs(5), async {
        loop {
            let (opened, closed) = client.stats().totals();
            if opened == 1 && closed == 1 {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("channel never closed");

    client.shutdown();
    session.await.expect("join").expect("clean shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reverse_tcp_route() {
    let echo = start_echo().await;
    let mut opts = ServerOptions::default();
    opts.reverse = true;
    let (_server, server_addr) = start_server(opts).await;

    let route = format!("R:127.0.0.1:34002:127.0.0.1:{}", echo.port());
    let client = Arc::new(Client::new(client_opts(server_addr, &[&route])).expect("client"));
    let runner = Arc::clone(&client);
    let session = tokio::spawn(async move { runner.run().await });

    // The reverse stub is bound on the server side.
    let mut conn = connect_retry("127.0.0.1:34002").await;
    conn.write_all(b"through the back").await.expect("write");
    let mut buf = [0u8; 16];
    timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
        .await
        .expect("echo timeout")
        .expect("echo read");
    assert_eq!(&buf, b"through the back");
    drop(conn);

    // Closing the client tears the server-side listener down.
    client.shutdown();
    session.await.expect("join").expect("clean shutdown");
    timeout(Duration::from_secs(3), async {
        loop {
            if TcpStream::connect("127.0.0.1:34002").await.is_err() {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("reverse stub survived client teardown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reverse_denied_when_disabled() {
    let (_server, server_addr) = start_server(ServerOptions::default()).await;

    let client =
        Client::new(client_opts(server_addr, &["R:127.0.0.1:34003:127.0.0.1:9001"])).expect("client");
    let err = client.run().await.expect_err("reverse must be refused");
    assert!(
        err.to_string()
            .contains("Reverse port forwarding not enabled on server"),
        "unexpected error: {err}"
    );

    // No listener was bound on the refused route.
    assert!(TcpStream::connect("127.0.0.1:34003").await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn per_user_route_authorization() {
    let (server, server_addr) = start_server(ServerOptions::default()).await;
    server
        .add_user("alice", "secret", &["^tcp:.*:9001$"])
        .expect("add user");

    // A route outside the allow-list fails the whole config.
    let mut opts = client_opts(server_addr, &["127.0.0.1:34004:127.0.0.1:9002"]);
    opts.auth = Some("alice:secret".to_string());
    let err = Client::new(opts)
        .expect("client")
        .run()
        .await
        .expect_err("route must be denied");
    assert!(err.to_string().contains("denied"), "unexpected error: {err}");

    // Wrong credentials never get that far.
    let mut opts = client_opts(server_addr, &["127.0.0.1:34004:127.0.0.1:9001"]);
    opts.auth = Some("alice:wrong".to_string());
    let err = Client::new(opts)
        .expect("client")
        .run()
        .await
        .expect_err("bad password must be rejected");
    assert!(matches!(err, TunnelError::Auth { .. }), "unexpected error: {err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn socks_disabled_rejects_channel_but_session_survives() {
    let echo = start_echo().await;
    let (_server, server_addr) = start_server(ServerOptions::default()).await;

    let tcp_route = format!("127.0.0.1:34006:127.0.0.1:{}", echo.port());
    let client = Arc::new(
        Client::new(client_opts(
            server_addr,
            &["127.0.0.1:34005:socks", &tcp_route],
        ))
        .expect("client"),
    );
    let runner = Arc::clone(&client);
    let session = tokio::spawn(async move { runner.run().await });

    // The socks channel open is rejected; the external connection just closes.
    let mut conn = connect_retry("127.0.0.1:34005").await;
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(5), conn.read(&mut buf))
        .await
        .expect("rejection timeout")
        .expect("read");
    assert_eq!(n, 0, "expected EOF on the rejected socks route");

    // The same session still carries other routes.
    let mut conn = connect_retry("127.0.0.1:34006").await;
    conn.write_all(b"still alive").await.expect("write");
    let mut buf = [0u8; 11];
    timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
        .await
        .expect("echo timeout")
        .expect("echo read");
    assert_eq!(&buf, b"still alive");

    client.shutdown();
    session.await.expect("join").expect("clean shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn version_mismatch_falls_through_to_http() {
    let (_server, server_addr) = start_server(ServerOptions::default()).await;

    // A stale protocol version is not upgraded; the request falls through
    // to the 404 handler and no session is created.
    let mut request = format!("ws://{server_addr}")
        .as_str()
        .into_client_request()
        .expect("request");
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        "xevo-chisel-vOLD".parse().expect("header"),
    );
    let err = tokio_tungstenite::connect_async(request)
        .await
        .expect_err("upgrade must be refused");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("expected HTTP error, got: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_and_version_endpoints() {
    let (_server, server_addr) = start_server(ServerOptions::default()).await;

    let body = http_get(server_addr, "/health").await;
    assert!(body.ends_with("OK\n"), "health said: {body}");

    let body = http_get(server_addr, "/version").await;
    assert!(
        body.trim_end().ends_with(env!("CARGO_PKG_VERSION")),
        "version said: {body}"
    );

    let body = http_get(server_addr, "/other").await;
    assert!(body.contains("404"), "expected 404, got: {body}");
}

/// Minimal HTTP/1.0 GET returning the raw response text
async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.expect("write");
    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("response timeout")
        .expect("read");
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fingerprint_pinning() {
    let mut opts = ServerOptions::default();
    opts.key_seed = "pin-test-seed".to_string();
    let (server, server_addr) = start_server(opts).await;
    let echo = start_echo().await;

    // The right fingerprint connects.
    let route = format!("127.0.0.1:34007:127.0.0.1:{}", echo.port());
    let mut opts = client_opts(server_addr, &[&route]);
    opts.fingerprint = Some(server.fingerprint().to_string());
    let client = Arc::new(Client::new(opts).expect("client"));
    let runner = Arc::clone(&client);
    let session = tokio::spawn(async move { runner.run().await });

    let mut conn = connect_retry("127.0.0.1:34007").await;
    conn.write_all(b"pinned").await.expect("write");
    let mut buf = [0u8; 6];
    timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
        .await
        .expect("echo timeout")
        .expect("echo read");
    assert_eq!(&buf, b"pinned");
    client.shutdown();
    session.await.expect("join").expect("clean shutdown");

    // A wrong fingerprint aborts the handshake.
    let mut opts = client_opts(server_addr, &["127.0.0.1:34008:127.0.0.1:9001"]);
    opts.fingerprint = Some("not-the-right-fingerprint".to_string());
    let err = Client::new(opts)
        .expect("client")
        .run()
        .await
        .expect_err("handshake must fail on fingerprint mismatch");
    assert!(matches!(err, TunnelError::Auth { .. }), "unexpected error: {err}");
}
