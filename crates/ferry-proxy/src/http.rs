//! Local forwarder for an authenticated upstream HTTP proxy.
//!
//! The local side speaks plain, unauthenticated HTTP. Each accepted
//! connection carries either one plain request or one CONNECT tunnel:
//!
//! ```text
//! Client request
//!      |
//!      v
//! read head (\r\n\r\n scan)
//!      |
//!      +-- CONNECT host:port --> CONNECT to upstream proxy with
//!      |                         Proxy-Authorization, await 200,
//!      |                         answer 200 Connection Established,
//!      |                         then splice bytes both ways
//!      |
//!      +-- anything else -----> rewrite head (origin-form target,
//!                               Host pinned to host:port, inject
//!                               Proxy-Authorization, force
//!                               Connection: close), forward, parse the
//!                               response head, pipe the rest back
//! ```
//!
//! Failures on the upstream leg surface to the client as a plain-text
//! `502 Bad Gateway`; a malformed client head gets a `400 Bad Request`.

use crate::rules::{ProxyRule, ProxyScheme};
use crate::wire::{self, RequestHead, ResponseHead};
use crate::{ProxyError, ProxyHandle, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Local HTTP forwarder for one credentialed upstream HTTP proxy.
#[derive(Debug)]
pub struct HttpForwardProxy {
    rule: ProxyRule,
    connect_timeout: Duration,
}

struct HttpContext {
    rule: ProxyRule,
    connect_timeout: Duration,
}

impl HttpForwardProxy {
    /// Create a forwarder for the given rule.
    ///
    /// # Errors
    /// * `ProxyError::UnsupportedType` - the rule's scheme is not `http` or
    ///   `https`.
    pub fn new(rule: ProxyRule) -> Result<Self> {
        match rule.scheme {
            ProxyScheme::Http | ProxyScheme::Https => Ok(Self {
                rule,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            }),
            other => Err(ProxyError::UnsupportedType {
                kind: other.as_str().to_string(),
            }),
        }
    }

    /// Override the upstream connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bind to `127.0.0.1:0` and start accepting connections.
    ///
    /// The listener is bound before the server task spawns so the returned
    /// handle knows the OS-assigned port immediately.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - the loopback listener could not be bound.
    pub async fn start(self) -> Result<ProxyHandle> {
        let bind_addr: SocketAddr = "127.0.0.1:0".parse().expect("hardcoded loopback address");
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: bind_addr,
                source: e,
            })?;
        let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
            addr: bind_addr,
            source: e,
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (conn_tx, conn_rx) = watch::channel(false);
        let connection_count = Arc::new(AtomicUsize::new(0));

        let ctx = Arc::new(HttpContext {
            rule: self.rule,
            connect_timeout: self.connect_timeout,
        });
        let count = Arc::clone(&connection_count);
        let join_handle =
            tokio::spawn(async move { serve(listener, ctx, count, conn_rx, shutdown_rx).await });

        Ok(ProxyHandle::new(
            local_addr,
            shutdown_tx,
            conn_tx,
            join_handle,
            connection_count,
        ))
    }
}

async fn serve(
    listener: TcpListener,
    ctx: Arc<HttpContext>,
    connection_count: Arc<AtomicUsize>,
    conn_shutdown: watch::Receiver<bool>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => return Ok(()),
            accepted = listener.accept() => {
                let (client, client_addr) = match accepted {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(error = %e, "accept error");
                        continue;
                    }
                };

                connection_count.fetch_add(1, Ordering::Relaxed);
                let ctx = Arc::clone(&ctx);
                let count = Arc::clone(&connection_count);
                let mut cancel = conn_shutdown.clone();

                tokio::spawn(async move {
                    tokio::select! {
                        // Forwarder closed; dropping the future drops both sockets.
                        _ = cancel.changed() => {}
                        result = handle_connection(client, ctx) => {
                            if let Err(e) = result {
                                debug!(client = %client_addr, error = %e, "connection error");
                            }
                        }
                    }
                    count.fetch_sub(1, Ordering::Relaxed);
                });
            }
        }
    }
}

async fn handle_connection(mut client: TcpStream, ctx: Arc<HttpContext>) -> Result<()> {
    let (head_raw, leftover) = wire::read_head(&mut client).await?;
    let head = match RequestHead::parse(&head_raw) {
        Ok(head) => head,
        Err(e) => {
            wire::write_client_error(&mut client, 400, "Bad Request", &e.to_string()).await;
            return Err(e);
        }
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(client, head, leftover, ctx).await
    } else {
        handle_forward(client, head, leftover, ctx).await
    }
}

/// Forward a plain request through the upstream proxy.
async fn handle_forward(
    mut client: TcpStream,
    head: RequestHead,
    leftover: Vec<u8>,
    ctx: Arc<HttpContext>,
) -> Result<()> {
    let (host, port, _absolute) = match wire::request_destination(&head) {
        Ok(dest) => dest,
        Err(e) => {
            wire::write_client_error(&mut client, 400, "Bad Request", &e.to_string()).await;
            return Err(e);
        }
    };

    let mut upstream = match connect_upstream(&ctx).await {
        Ok(stream) => stream,
        Err(e) => {
            wire::write_client_error(&mut client, 502, "Bad Gateway", &e.to_string()).await;
            return Err(e);
        }
    };

    // Rewrite the head for the upstream proxy: origin-form target with the
    // destination pinned in Host, credentials injected, hop-by-hop headers
    // dropped, and Connection: close forced so the upstream ends the
    // exchange unambiguously.
    let mut outbound = head.clone();
    outbound.target = wire::origin_form(&head.target).to_string();
    outbound.remove_header("proxy-connection");
    outbound.remove_header("proxy-authorization");
    outbound.set_header("Connection", "close");
    outbound.set_header("Host", &format!("{host}:{port}"));
    if let Some(auth) = ctx.rule.proxy_authorization() {
        outbound.set_header("Proxy-Authorization", &auth);
    }

    upstream
        .write_all(outbound.serialize().as_bytes())
        .await
        .map_err(|e| ProxyError::Relay(format!("failed to send request upstream: {e}")))?;
    if !leftover.is_empty() {
        upstream
            .write_all(&leftover)
            .await
            .map_err(|e| ProxyError::Relay(format!("failed to send request upstream: {e}")))?;
    }

    let (mut upstream_read, upstream_write) = upstream.into_split();
    let (client_read, mut client_write) = client.into_split();

    // Pump the rest of the request body while waiting for the status line;
    // the upstream may not answer until the whole body has arrived.
    let pump = tokio::spawn(async move {
        let mut client_read = client_read;
        let mut upstream_write = upstream_write;
        let _ = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
    });

    // The response head is read and validated before any byte reaches the
    // client, so an upstream that dies mid-exchange still yields a 502
    // instead of a bare EOF.
    let (resp_raw, resp_leftover) = match wire::read_head(&mut upstream_read).await {
        Ok(result) => result,
        Err(e) => {
            pump.abort();
            wire::write_client_error(&mut client_write, 502, "Bad Gateway", &e.to_string())
                .await;
            return Err(e);
        }
    };
    if let Err(e) = ResponseHead::parse(&resp_raw) {
        pump.abort();
        wire::write_client_error(&mut client_write, 502, "Bad Gateway", &e.to_string()).await;
        return Err(e);
    }

    client_write
        .write_all(&resp_raw)
        .await
        .map_err(|e| ProxyError::Relay(format!("failed to send response to client: {e}")))?;
    if !resp_leftover.is_empty() {
        client_write
            .write_all(&resp_leftover)
            .await
            .map_err(|e| ProxyError::Relay(format!("failed to send response to client: {e}")))?;
    }

    // Forced Connection: close makes EOF the end-of-response marker.
    let relay = tokio::io::copy(&mut upstream_read, &mut client_write).await;
    let _ = client_write.shutdown().await;
    let _ = pump.await;
    match relay {
        Ok(_) => Ok(()),
        Err(e)
            if e.kind() == std::io::ErrorKind::ConnectionReset
                || e.kind() == std::io::ErrorKind::BrokenPipe =>
        {
            // Normal connection close
            Ok(())
        }
        Err(e) => Err(ProxyError::Relay(e.to_string())),
    }
}

/// Establish a tunnel via the upstream proxy's CONNECT support.
async fn handle_connect(
    mut client: TcpStream,
    head: RequestHead,
    leftover: Vec<u8>,
    ctx: Arc<HttpContext>,
) -> Result<()> {
    let authority = head.target.clone();

    let mut upstream = match connect_upstream(&ctx).await {
        Ok(stream) => stream,
        Err(e) => {
            wire::write_client_error(&mut client, 502, "Bad Gateway", &e.to_string()).await;
            return Err(e);
        }
    };

    let mut connect_req = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(auth) = ctx.rule.proxy_authorization() {
        connect_req.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
    }
    connect_req.push_str("\r\n");

    upstream
        .write_all(connect_req.as_bytes())
        .await
        .map_err(|e| ProxyError::Relay(format!("failed to send CONNECT upstream: {e}")))?;

    let (resp_raw, resp_leftover) = match wire::read_head(&mut upstream).await {
        Ok(result) => result,
        Err(e) => {
            wire::write_client_error(&mut client, 502, "Bad Gateway", &e.to_string()).await;
            return Err(e);
        }
    };
    let response = match ResponseHead::parse(&resp_raw) {
        Ok(response) => response,
        Err(e) => {
            wire::write_client_error(&mut client, 502, "Bad Gateway", &e.to_string()).await;
            return Err(e);
        }
    };

    if response.status != 200 {
        let err = ProxyError::Refused {
            status: format!("{} {}", response.status, response.reason),
        };
        wire::write_client_error(&mut client, 502, "Bad Gateway", &err.to_string()).await;
        return Err(err);
    }

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .map_err(|e| ProxyError::Relay(format!("failed to answer CONNECT: {e}")))?;

    // Bytes that arrived glued to either head belong to the tunnel.
    if !leftover.is_empty() {
        upstream
            .write_all(&leftover)
            .await
            .map_err(|e| ProxyError::Relay(format!("failed to flush tunnel bytes: {e}")))?;
    }
    if !resp_leftover.is_empty() {
        client
            .write_all(&resp_leftover)
            .await
            .map_err(|e| ProxyError::Relay(format!("failed to flush tunnel bytes: {e}")))?;
    }

    wire::splice(client, upstream).await
}

async fn connect_upstream(ctx: &HttpContext) -> Result<TcpStream> {
    let target = ctx.rule.authority();
    match tokio::time::timeout(
        ctx.connect_timeout,
        TcpStream::connect((ctx.rule.host.as_str(), ctx.rule.port)),
    )
    .await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::UpstreamConnect { target, source: e }),
        Err(_) => Err(ProxyError::UpstreamConnect {
            target,
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn can_bind_localhost() -> bool {
        match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => {
                drop(listener);
                true
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
            Err(err) => panic!("Failed to bind TCP localhost for test: {err}"),
        }
    }

    macro_rules! skip_if_no_bind {
        () => {
            if !can_bind_localhost() {
                return;
            }
        };
    }

    fn rule_for(addr: SocketAddr) -> ProxyRule {
        ProxyRule::parse(&format!("http://u:p@127.0.0.1:{}", addr.port())).unwrap()
    }

    /// One-shot mock upstream proxy: captures the received head, replies with
    /// `response`, then half-closes.
    async fn upstream_once(
        response: &'static [u8],
    ) -> (SocketAddr, tokio::sync::oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        (addr, rx)
    }

    async fn read_to_end(stream: &mut TcpStream) -> String {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    // ========================================================================
    // Construction Tests
    // ========================================================================

    #[test]
    fn test_new_rejects_socks_rule() {
        let rule = ProxyRule::parse("socks5://u:p@proxy.example:1080").unwrap();
        assert!(matches!(
            HttpForwardProxy::new(rule),
            Err(ProxyError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn test_new_accepts_https_rule() {
        let rule = ProxyRule::parse("https://u:p@proxy.example:8080").unwrap();
        assert!(HttpForwardProxy::new(rule).is_ok());
    }

    // ========================================================================
    // Lifecycle Tests
    // ========================================================================

    #[tokio::test]
    async fn test_start_assigns_loopback_port() {
        skip_if_no_bind!();
        let rule = ProxyRule::parse("http://u:p@127.0.0.1:9").unwrap();
        let mut handle = HttpForwardProxy::new(rule).unwrap().start().await.unwrap();

        assert!(handle.is_running());
        assert_ne!(handle.local_addr().port(), 0);
        assert!(handle.url().starts_with("http://127.0.0.1:"));
        assert_eq!(handle.connection_count(), 0);

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        skip_if_no_bind!();
        let rule = ProxyRule::parse("http://u:p@127.0.0.1:9").unwrap();
        let mut handle = HttpForwardProxy::new(rule).unwrap().start().await.unwrap();

        handle.close().await.unwrap();
        assert!(handle.is_closed());
        handle.close().await.unwrap();
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_port() {
        skip_if_no_bind!();
        let rule = ProxyRule::parse("http://u:p@127.0.0.1:9").unwrap();
        let mut handle = HttpForwardProxy::new(rule).unwrap().start().await.unwrap();
        let addr = handle.local_addr();
        handle.close().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpListener::bind(addr).await.is_ok());
    }

    // ========================================================================
    // Plain Forwarding Tests
    // ========================================================================

    #[tokio::test]
    async fn test_forward_injects_proxy_authorization() {
        skip_if_no_bind!();
        let (upstream_addr, seen) =
            upstream_once(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;
        let mut handle = HttpForwardProxy::new(rule_for(upstream_addr))
            .unwrap()
            .start()
            .await
            .unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client
            .write_all(
                b"GET http://example.test/x HTTP/1.1\r\nHost: example.test\r\nProxy-Connection: keep-alive\r\n\r\n",
            )
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let response = read_to_end(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("hi"));

        let head = seen.await.unwrap();
        assert!(head.starts_with("GET /x HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.test:80\r\n"));
        // base64("u:p") == "dTpw"
        assert!(head.contains("Proxy-Authorization: Basic dTpw\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert!(!head.contains("Proxy-Connection"));

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_origin_form_uses_host_header() {
        skip_if_no_bind!();
        let (upstream_addr, seen) =
            upstream_once(b"HTTP/1.1 204 No Content\r\n\r\n").await;
        let mut handle = HttpForwardProxy::new(rule_for(upstream_addr))
            .unwrap()
            .start()
            .await
            .unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client
            .write_all(b"GET /path HTTP/1.1\r\nHost: example.test\r\n\r\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let response = read_to_end(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 204"));

        let head = seen.await.unwrap();
        assert!(head.starts_with("GET /path HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.test:80\r\n"));

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_absolute_form_becomes_origin_form() {
        skip_if_no_bind!();
        let (upstream_addr, seen) = upstream_once(b"HTTP/1.1 204 No Content\r\n\r\n").await;
        let mut handle = HttpForwardProxy::new(rule_for(upstream_addr))
            .unwrap()
            .start()
            .await
            .unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client
            .write_all(b"GET http://example.test:8080/a/b?q=1 HTTP/1.1\r\nHost: example.test:8080\r\n\r\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();
        let _ = read_to_end(&mut client).await;

        let head = seen.await.unwrap();
        assert!(head.starts_with("GET /a/b?q=1 HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.test:8080\r\n"));

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_strips_client_proxy_authorization() {
        skip_if_no_bind!();
        let (upstream_addr, seen) = upstream_once(b"HTTP/1.1 200 OK\r\n\r\n").await;
        let mut handle = HttpForwardProxy::new(rule_for(upstream_addr))
            .unwrap()
            .start()
            .await
            .unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client
            .write_all(
                b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\nProxy-Authorization: Basic Ym9ndXM=\r\n\r\n",
            )
            .await
            .unwrap();
        client.shutdown().await.unwrap();
        let _ = read_to_end(&mut client).await;

        let head = seen.await.unwrap();
        // The client's own value is replaced, not forwarded.
        assert!(head.contains("Proxy-Authorization: Basic dTpw\r\n"));
        assert!(!head.contains("Ym9ndXM"));

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_unreachable_upstream_yields_502() {
        skip_if_no_bind!();
        // Bind a port and drop the listener so connects are refused.
        let doomed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = doomed.local_addr().unwrap();
        drop(doomed);

        let mut handle = HttpForwardProxy::new(rule_for(addr))
            .unwrap()
            .start()
            .await
            .unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client
            .write_all(b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\n\r\n")
            .await
            .unwrap();

        let response = read_to_end(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"));

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_upstream_eof_before_status_yields_502() {
        skip_if_no_bind!();
        // Upstream accepts the request and then drops the connection without
        // sending a status line.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut chunk = [0u8; 4096];
            let _ = socket.read(&mut chunk).await;
        });

        let mut handle = HttpForwardProxy::new(rule_for(upstream_addr))
            .unwrap()
            .start()
            .await
            .unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client
            .write_all(b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\n\r\n")
            .await
            .unwrap();

        let response = read_to_end(&mut client).await;
        assert!(
            response.starts_with("HTTP/1.1 502 Bad Gateway"),
            "expected a 502, got: {response:?}"
        );

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_head_yields_400() {
        skip_if_no_bind!();
        let rule = ProxyRule::parse("http://u:p@127.0.0.1:9").unwrap();
        let mut handle = HttpForwardProxy::new(rule).unwrap().start().await.unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client.write_all(b"NOTAREQUEST\r\n\r\n").await.unwrap();

        let response = read_to_end(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request"));

        handle.close().await.unwrap();
    }

    // ========================================================================
    // CONNECT Tunnel Tests
    // ========================================================================

    #[tokio::test]
    async fn test_connect_tunnels_after_200() {
        skip_if_no_bind!();
        // Mock upstream: accept CONNECT, reply 200, then echo tunnel bytes.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        let (tx, seen) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") || n == 0 {
                    break;
                }
            }
            let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
            socket
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                socket.write_all(&chunk[..n]).await.unwrap();
            }
        });

        let mut handle = HttpForwardProxy::new(rule_for(upstream_addr))
            .unwrap()
            .start()
            .await
            .unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client
            .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
            .await
            .unwrap();

        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        let established = String::from_utf8_lossy(&buf[..n]);
        assert!(established.starts_with("HTTP/1.1 200 Connection Established"));

        let head = seen.await.unwrap();
        assert!(head.starts_with("CONNECT example.test:443 HTTP/1.1\r\n"));
        assert!(head.contains("Proxy-Authorization: Basic dTpw\r\n"));

        // Tunnel should now be transparent both ways.
        client.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_by_upstream_yields_502() {
        skip_if_no_bind!();
        let (upstream_addr, _seen) = upstream_once(
            b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        let mut handle = HttpForwardProxy::new(rule_for(upstream_addr))
            .unwrap()
            .start()
            .await
            .unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client
            .write_all(b"CONNECT example.test:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let response = read_to_end(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"));
        assert!(response.contains("407"));

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_drops_inflight_tunnel() {
        skip_if_no_bind!();
        // Upstream accepts the tunnel and then sits idle.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
            // Hold the socket open until the peer disappears.
            let mut hold = [0u8; 16];
            let _ = socket.read(&mut hold).await;
        });

        let mut handle = HttpForwardProxy::new(rule_for(upstream_addr))
            .unwrap()
            .start()
            .await
            .unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client
            .write_all(b"CONNECT example.test:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let _ = client.read(&mut buf).await.unwrap();

        handle.close().await.unwrap();

        // The forwarder dropped its end; the client sees EOF or a reset.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(result, Ok(0) | Err(_)));
    }
}
