//! Local forwarder for an upstream SOCKS5 proxy.
//!
//! The local contract is identical to [`crate::HttpForwardProxy`] - plain
//! HTTP plus CONNECT on a loopback port - but the upstream leg is a SOCKS5
//! handshake to the destination host, with the rule's credentials presented
//! during handshake negotiation.
//!
//! ```text
//! Client request
//!      |
//!      +-- CONNECT host:port --> fresh SOCKS5 handshake to host:port,
//!      |                         answer 200 Connection Established,
//!      |                         splice bytes both ways (never pooled)
//!      |
//!      +-- anything else -----> per-destination pooled connection:
//!                               send origin-form request, frame the
//!                               response (Content-Length / chunked),
//!                               park the connection on clean completion
//! ```
//!
//! Pooled connections expire after an idle timeout; a periodic sweep runs
//! on the accept loop so parked sockets do not outlive their usefulness.

use crate::pool::{ConnectionPool, DEFAULT_IDLE_TIMEOUT};
use crate::rules::{ProxyRule, ProxyScheme};
use crate::wire::{self, BodyFraming, RequestHead, ResponseHead};
use crate::{ProxyError, ProxyHandle, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, warn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Local HTTP forwarder relaying through one upstream SOCKS5 proxy.
#[derive(Debug)]
pub struct SocksForwardProxy {
    rule: ProxyRule,
    connect_timeout: Duration,
    pool_idle_timeout: Duration,
}

struct SocksContext {
    rule: ProxyRule,
    connect_timeout: Duration,
    pool: ConnectionPool,
}

impl SocksForwardProxy {
    /// Create a forwarder for the given rule.
    ///
    /// # Errors
    /// * `ProxyError::UnsupportedType` - the rule's scheme is not `socks5`.
    ///   SOCKS4 parses as a rule but has no relay support.
    pub fn new(rule: ProxyRule) -> Result<Self> {
        match rule.scheme {
            ProxyScheme::Socks5 => Ok(Self {
                rule,
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                pool_idle_timeout: DEFAULT_IDLE_TIMEOUT,
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

    /// Override how long pooled upstream connections stay usable.
    pub fn with_pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = timeout;
        self
    }

    /// Bind to `127.0.0.1:0` and start accepting connections.
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

        let ctx = Arc::new(SocksContext {
            rule: self.rule,
            connect_timeout: self.connect_timeout,
            pool: ConnectionPool::new(self.pool_idle_timeout),
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
    ctx: Arc<SocksContext>,
    connection_count: Arc<AtomicUsize>,
    conn_shutdown: watch::Receiver<bool>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Result<()> {
    let mut sweep = tokio::time::interval(POOL_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => return Ok(()),
            _ = sweep.tick() => ctx.pool.evict_idle(),
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

async fn handle_connection(mut client: TcpStream, ctx: Arc<SocksContext>) -> Result<()> {
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

/// Tunnel a CONNECT request. Always a fresh SOCKS5 handshake; tunnel
/// connections carry opaque bytes and are never pooled.
async fn handle_connect(
    mut client: TcpStream,
    head: RequestHead,
    leftover: Vec<u8>,
    ctx: Arc<SocksContext>,
) -> Result<()> {
    let (host, port) = match wire::split_authority(&head.target, 443) {
        Ok(dest) => dest,
        Err(e) => {
            wire::write_client_error(&mut client, 400, "Bad Request", &e.to_string()).await;
            return Err(e);
        }
    };

    let mut upstream = match connect_through_socks(&ctx, &host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            wire::write_client_error(&mut client, 502, "Bad Gateway", &e.to_string()).await;
            return Err(e);
        }
    };

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .map_err(|e| ProxyError::Relay(format!("failed to answer CONNECT: {e}")))?;

    if !leftover.is_empty() {
        upstream
            .write_all(&leftover)
            .await
            .map_err(|e| ProxyError::Relay(format!("failed to flush tunnel bytes: {e}")))?;
    }

    wire::splice(client, upstream).await
}

/// Forward a plain request over a (possibly pooled) SOCKS connection.
///
/// The exchange is sequential: send the full request, then read the full
/// response. Framing the response is what makes the connection reusable,
/// and the client is on the loopback so the lost concurrency is negligible.
async fn handle_forward(
    mut client: TcpStream,
    head: RequestHead,
    leftover: Vec<u8>,
    ctx: Arc<SocksContext>,
) -> Result<()> {
    let (host, port, _absolute) = match wire::request_destination(&head) {
        Ok(dest) => dest,
        Err(e) => {
            wire::write_client_error(&mut client, 400, "Bad Request", &e.to_string()).await;
            return Err(e);
        }
    };
    let key = format!("{host}:{port}");

    // The destination sees an origin server request, not a proxy request.
    let mut outbound = head.clone();
    outbound.target = wire::origin_form(&head.target).to_string();
    outbound.remove_header("proxy-connection");
    outbound.remove_header("proxy-authorization");
    if outbound.header("host").is_none() {
        outbound.set_header("Host", &key);
    }

    // A pooled connection may have died while parked. Bodyless requests can
    // be replayed on a fresh handshake; anything with a body cannot (part of
    // it may already be consumed from the client).
    let replayable = leftover.is_empty() && wire::request_framing(&head) == BodyFraming::Length(0);

    let (pooled, reused) = match ctx.pool.checkout(&key) {
        Some(stream) => {
            debug!(destination = %key, "reusing pooled upstream connection");
            (stream, true)
        }
        None => {
            let stream = match connect_through_socks(&ctx, &host, port).await {
                Ok(stream) => stream,
                Err(e) => {
                    wire::write_client_error(&mut client, 502, "Bad Gateway", &e.to_string())
                        .await;
                    return Err(e);
                }
            };
            (stream, false)
        }
    };

    let mut attempt = exchange(&mut client, pooled, &head, &outbound, &leftover).await;
    if attempt.is_err() && reused && replayable {
        debug!(destination = %key, "pooled connection failed, retrying with a fresh handshake");
        match connect_through_socks(&ctx, &host, port).await {
            Ok(fresh) => {
                attempt = exchange(&mut client, fresh, &head, &outbound, &leftover).await;
            }
            Err(e) => {
                wire::write_client_error(&mut client, 502, "Bad Gateway", &e.to_string()).await;
                return Err(e);
            }
        }
    }

    let (mut upstream, resp_raw, resp_leftover) = match attempt {
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
    let framing = wire::response_framing(&head.method, &response);

    // One request per local connection; tell the client so.
    let mut client_head = response.clone();
    client_head.set_header("Connection", "close");
    client
        .write_all(client_head.serialize().as_bytes())
        .await
        .map_err(|e| ProxyError::Relay(format!("failed to send response to client: {e}")))?;

    let request_close = head
        .header("connection")
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false)
        || head
            .header("proxy-connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);
    let mut reusable = !request_close && !response.connection_close();
    if let BodyFraming::Length(n) = framing {
        // More body bytes than the declared length means framing is broken.
        if resp_leftover.len() as u64 > n {
            reusable = false;
        }
    }

    {
        let mut body_src = std::io::Cursor::new(resp_leftover).chain(&mut upstream);
        match framing {
            BodyFraming::Length(n) => {
                wire::copy_exact(&mut body_src, &mut client, n).await?;
            }
            BodyFraming::Chunked => {
                wire::relay_chunked(&mut body_src, &mut client).await?;
            }
            BodyFraming::Close => {
                // Delimited by connection close; nothing to park afterwards.
                reusable = false;
                tokio::io::copy(&mut body_src, &mut client)
                    .await
                    .map_err(|e| ProxyError::Relay(format!("body relay failed: {e}")))?;
            }
        }
    }

    // Best-effort half-close; if shutdown fails the peer will see a connection reset.
    let _ = client.shutdown().await;

    if reusable {
        ctx.pool.checkin(key, upstream);
    }
    Ok(())
}

/// Send the rewritten request and read the response head.
///
/// Returns the upstream stream (positioned at the start of the response
/// body), the raw response head, and any body bytes read past it.
async fn exchange(
    client: &mut TcpStream,
    mut upstream: TcpStream,
    head: &RequestHead,
    outbound: &RequestHead,
    leftover: &[u8],
) -> Result<(TcpStream, Vec<u8>, Vec<u8>)> {
    upstream
        .write_all(outbound.serialize().as_bytes())
        .await
        .map_err(|e| ProxyError::Relay(format!("failed to send request upstream: {e}")))?;

    match wire::request_framing(head) {
        BodyFraming::Length(0) => {
            if !leftover.is_empty() {
                upstream
                    .write_all(leftover)
                    .await
                    .map_err(|e| ProxyError::Relay(format!("failed to send request upstream: {e}")))?;
            }
        }
        BodyFraming::Length(n) => {
            let mut body_src = std::io::Cursor::new(leftover.to_vec()).chain(&mut *client);
            wire::copy_exact(&mut body_src, &mut upstream, n).await?;
        }
        BodyFraming::Chunked => {
            let mut body_src = std::io::Cursor::new(leftover.to_vec()).chain(&mut *client);
            wire::relay_chunked(&mut body_src, &mut upstream).await?;
        }
        // Requests are never close-delimited.
        BodyFraming::Close => {}
    }

    let (resp_raw, resp_leftover) = wire::read_head(&mut upstream).await?;
    Ok((upstream, resp_raw, resp_leftover))
}

/// Handshake with the upstream SOCKS5 proxy and ask it to reach `host:port`.
async fn connect_through_socks(ctx: &SocksContext, host: &str, port: u16) -> Result<TcpStream> {
    let proxy = (ctx.rule.host.as_str(), ctx.rule.port);
    let target = ctx.rule.authority();

    let connect = async {
        match &ctx.rule.credentials {
            Some(c) => {
                Socks5Stream::connect_with_password(proxy, (host, port), &c.username, &c.password)
                    .await
            }
            None => Socks5Stream::connect(proxy, (host, port)).await,
        }
    };

    match tokio::time::timeout(ctx.connect_timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream.into_inner()),
        Ok(Err(e)) => Err(ProxyError::UpstreamConnect {
            target,
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        }),
        Err(_) => Err(ProxyError::UpstreamConnect {
            target,
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out"),
        }),
    }
}
