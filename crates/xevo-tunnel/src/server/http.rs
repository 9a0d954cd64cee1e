//! HTTP rim of the tunnel server
//!
//! One handler per connection: tunnel upgrades are detected by the exact
//! subprotocol match and handed to the session core; everything else is
//! proxied or answered by the built-in endpoints.

use crate::error::{Result, TunnelError};
use crate::server::Server;
use crate::{BUILD_VERSION, PROTOCOL_PREFIX, PROTOCOL_VERSION};
use bytes::Bytes;
use http::header::{CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, UPGRADE};
use http::{HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Scheme and authority every proxied request is rewritten to
#[derive(Debug, Clone)]
pub(crate) struct ProxyTarget {
    scheme: String,
    authority: String,
}

impl ProxyTarget {
    pub(crate) fn parse(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| TunnelError::config(format!("invalid proxy URL '{url}': {e}")))?;
        let authority = uri
            .authority()
            .ok_or_else(|| TunnelError::config(format!("proxy URL '{url}' is missing a host")))?
            .to_string();
        let scheme = uri.scheme_str().unwrap_or("http").to_string();
        Ok(Self { scheme, authority })
    }
}

/// Drive one accepted TCP connection through the HTTP state machine
pub(crate) async fn serve_connection(server: Arc<Server>, stream: TcpStream, peer: SocketAddr) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| handle_request(Arc::clone(&server), peer, req));
    if let Err(e) = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        tracing::debug!(%peer, error = %e, "http connection ended");
    }
}

async fn handle_request(
    server: Arc<Server>,
    peer: SocketAddr,
    mut req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, Infallible> {
    // Tunnel upgrade: websocket upgrade carrying our exact subprotocol.
    if is_websocket_upgrade(&req) {
        let protocol = req
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if protocol == PROTOCOL_VERSION {
            return Ok(upgrade_to_session(&server, peer, &mut req));
        }
        if protocol.starts_with(PROTOCOL_PREFIX) {
            // A peer speaking another protocol revision; not ours to serve.
            tracing::info!(
                %peer,
                got = %protocol,
                expected = PROTOCOL_VERSION,
                "ignored client connection with mismatched protocol version"
            );
        }
    }

    // Non-tunnel traffic: reverse proxy when configured.
    if let Some((target, client)) = server.proxy() {
        return Ok(proxy_request(target, client, req).await);
    }

    // Otherwise the built-in endpoints.
    let response = match req.uri().path() {
        "/health" => plain_response(StatusCode::OK, "OK\n"),
        "/version" => plain_response(StatusCode::OK, BUILD_VERSION),
        _ => plain_response(StatusCode::NOT_FOUND, "Not found"),
    };
    Ok(response)
}

/// Answer the upgrade handshake and hand the raw stream to the session core
fn upgrade_to_session(
    server: &Arc<Server>,
    peer: SocketAddr,
    req: &mut Request<Incoming>,
) -> Response<BoxBody> {
    let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY).cloned() else {
        return plain_response(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
    };
    let accept = derive_accept_key(key.as_bytes());

    let on_upgrade = hyper::upgrade::on(req);
    let server = Arc::clone(server);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => server.spawn_session(TokioIo::new(upgraded), peer),
            Err(e) => tracing::debug!(%peer, error = %e, "upgrade failed"),
        }
    });

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(PROTOCOL_VERSION),
    );
    match HeaderValue::from_str(&accept) {
        Ok(value) => {
            headers.insert(SEC_WEBSOCKET_ACCEPT, value);
        }
        Err(_) => return plain_response(StatusCode::BAD_REQUEST, "bad Sec-WebSocket-Key"),
    }
    response
}

/// Forward one request to the configured reverse proxy target
async fn proxy_request(
    target: &ProxyTarget,
    client: &super::ProxyClient,
    mut req: Request<Incoming>,
) -> Response<BoxBody> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or("/", http::uri::PathAndQuery::as_str);
    let uri = format!("{}://{}{}", target.scheme, target.authority, path_and_query);
    match uri.parse::<Uri>() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => {
            tracing::debug!(error = %e, "proxy URI rebuild failed");
            return plain_response(StatusCode::BAD_GATEWAY, "Bad gateway");
        }
    }
    // The proxy host always wins.
    if let Ok(host) = HeaderValue::from_str(&target.authority) {
        req.headers_mut().insert(HOST, host);
    }

    match client.request(req).await {
        Ok(response) => response.map(BodyExt::boxed),
        Err(e) => {
            tracing::debug!(error = %e, "proxy request failed");
            plain_response(StatusCode::BAD_GATEWAY, "Bad gateway")
        }
    }
}

fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.eq_ignore_ascii_case("websocket"))
}

fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<BoxBody> {
    let mut response = Response::new(
        Full::new(Bytes::from_static(body.as_bytes()))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response
}
