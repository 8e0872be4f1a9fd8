//! Container-to-forwarder lifecycle management.
//!
//! The manager owns one running forwarder per container id. Containers
//! cannot attach credentials to their own proxy settings, so each container
//! gets a loopback URL pointing at a forwarder that injects them. An
//! upstream without credentials needs no forwarder at all; the manager
//! hands the container the upstream's URL directly.

use crate::http::HttpForwardProxy;
use crate::rules::{ProxyRule, ProxyScheme};
use crate::socks::SocksForwardProxy;
use crate::{ProxyError, ProxyHandle, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// An upstream proxy as configured for one container.
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    /// Proxy protocol: `http`, `https`, or `socks5`.
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl UpstreamProxy {
    fn scheme(&self) -> Result<ProxyScheme> {
        match self.kind.as_str() {
            "http" => Ok(ProxyScheme::Http),
            "https" => Ok(ProxyScheme::Https),
            "socks5" => Ok(ProxyScheme::Socks5),
            other => Err(ProxyError::UnsupportedType {
                kind: other.to_string(),
            }),
        }
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

struct ActiveProxy {
    handle: ProxyHandle,
}

/// Tracks the running forwarder for each container.
pub struct ProxyManager {
    active: Mutex<HashMap<String, ActiveProxy>>,
    connect_timeout: Option<Duration>,
    pool_idle_timeout: Option<Duration>,
}

impl Default for ProxyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyManager {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            connect_timeout: None,
            pool_idle_timeout: None,
        }
    }

    /// Override the upstream connect timeout for forwarders started later.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Override the SOCKS pool idle timeout for forwarders started later.
    pub fn with_pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = Some(timeout);
        self
    }

    /// Set up proxying for a container and return the URL it should use.
    ///
    /// With credentials, a forwarder is started and its loopback URL is
    /// returned; a forwarder already running for this container is stopped
    /// first. Without credentials nothing is started and the upstream's own
    /// URL is returned (any previous forwarder is still stopped).
    ///
    /// # Errors
    /// * `ProxyError::UnsupportedType` - unknown `kind`.
    /// * `ProxyError::InvalidRule` - host/port do not form a valid rule.
    /// * `ProxyError::Bind` - the forwarder could not bind its loopback port.
    pub async fn create_proxy(&self, container_id: &str, upstream: UpstreamProxy) -> Result<String> {
        let scheme = upstream.scheme()?;

        // Holding the map lock across the whole operation makes a concurrent
        // create for the same container serialize instead of leaking one of
        // the two forwarders.
        let mut active = self.active.lock().await;

        if let Some(mut previous) = active.remove(container_id) {
            debug!(container = %container_id, "stopping replaced forwarder");
            previous.handle.close().await?;
        }

        let descriptor = match upstream.credentials() {
            Some((user, pass)) => format!(
                "{}://{}:{}@{}:{}",
                scheme, user, pass, upstream.host, upstream.port
            ),
            None => {
                let direct = format!("{}://{}:{}", scheme, upstream.host, upstream.port);
                info!(container = %container_id, url = %direct, "no credentials, using upstream directly");
                return Ok(direct);
            }
        };
        let rule = ProxyRule::parse(&descriptor)?;
        let upstream_url = rule.direct_url();

        let handle = match scheme {
            ProxyScheme::Http | ProxyScheme::Https => {
                let mut forwarder = HttpForwardProxy::new(rule)?;
                if let Some(timeout) = self.connect_timeout {
                    forwarder = forwarder.with_connect_timeout(timeout);
                }
                forwarder.start().await?
            }
            ProxyScheme::Socks5 => {
                let mut forwarder = SocksForwardProxy::new(rule)?;
                if let Some(timeout) = self.connect_timeout {
                    forwarder = forwarder.with_connect_timeout(timeout);
                }
                if let Some(timeout) = self.pool_idle_timeout {
                    forwarder = forwarder.with_pool_idle_timeout(timeout);
                }
                forwarder.start().await?
            }
            // scheme() never returns Socks4.
            ProxyScheme::Socks4 => {
                return Err(ProxyError::UnsupportedType {
                    kind: upstream.kind,
                })
            }
        };

        let url = handle.url();
        info!(
            container = %container_id,
            upstream = %upstream_url,
            local = %url,
            "forwarder started"
        );
        active.insert(container_id.to_string(), ActiveProxy { handle });
        Ok(url)
    }

    /// Stop the forwarder for a container. A container with no forwarder is
    /// not an error.
    ///
    /// # Errors
    /// * `ProxyError::Shutdown` - the forwarder task did not stop cleanly.
    pub async fn stop_proxy(&self, container_id: &str) -> Result<()> {
        let removed = self.active.lock().await.remove(container_id);
        match removed {
            Some(mut proxy) => {
                info!(container = %container_id, "forwarder stopped");
                proxy.handle.close().await
            }
            None => Ok(()),
        }
    }

    /// Stop every running forwarder concurrently.
    ///
    /// # Errors
    /// * `ProxyError::Shutdown` - one of the shutdown tasks panicked; the
    ///   remaining forwarders are still stopped.
    pub async fn stop_all(&self) -> Result<()> {
        let drained: Vec<(String, ActiveProxy)> =
            self.active.lock().await.drain().collect();

        let mut tasks = Vec::with_capacity(drained.len());
        for (container_id, mut proxy) in drained {
            tasks.push(tokio::spawn(async move {
                let result = proxy.handle.close().await;
                (container_id, result)
            }));
        }

        let mut first_err = None;
        for task in tasks {
            match task.await {
                Ok((container_id, Ok(()))) => {
                    info!(container = %container_id, "forwarder stopped");
                }
                Ok((container_id, Err(e))) => {
                    debug!(container = %container_id, error = %e, "forwarder shutdown error");
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    first_err.get_or_insert(ProxyError::Shutdown(format!(
                        "shutdown task failed: {e}"
                    )));
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of running forwarders.
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// The loopback URL for a container's forwarder, if one is running.
    pub async fn local_url(&self, container_id: &str) -> Option<String> {
        self.active
            .lock()
            .await
            .get(container_id)
            .map(|proxy| proxy.handle.url())
    }
}
