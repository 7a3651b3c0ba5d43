//! Client-side load balancing across a pool of cache servers

use super::single::{HttpClientOptions, SingleUriService};
use super::{HttpRequest, HttpResponse, HttpService, SharedHttpService};
use crate::error::{RemoteError, Result};
use artcache_core::config::SlbConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
struct ServerHealth {
    consecutive_errors: u32,
    unhealthy_until: Option<Instant>,
}

/// Round-robin server picker that benches servers after repeated errors.
///
/// A server that fails `error_threshold` times in a row is skipped for
/// `cooldown`. Any success resets its error count.
#[derive(Debug)]
pub struct ClientSideSlb {
    servers: Vec<String>,
    health: Mutex<Vec<ServerHealth>>,
    next: AtomicUsize,
    error_threshold: u32,
    cooldown: Duration,
}

impl ClientSideSlb {
    /// Balance across `servers`.
    ///
    /// # Errors
    ///
    /// Returns error if `servers` is empty or `error_threshold` is zero
    pub fn new(servers: Vec<String>, error_threshold: u32, cooldown: Duration) -> Result<Self> {
        if servers.is_empty() {
            return Err(RemoteError::Config(
                "client-side load balancing requires at least one server".to_string(),
            ));
        }
        if error_threshold == 0 {
            return Err(RemoteError::Config(
                "slb error_threshold must be greater than zero".to_string(),
            ));
        }
        let health = vec![ServerHealth::default(); servers.len()];
        Ok(Self {
            servers,
            health: Mutex::new(health),
            next: AtomicUsize::new(0),
            error_threshold,
            cooldown,
        })
    }

    /// Build from the `[slb]` configuration section.
    ///
    /// # Errors
    ///
    /// Returns error if the section lists no servers
    pub fn from_config(config: &SlbConfig) -> Result<Self> {
        Self::new(
            config.servers.clone(),
            config.error_threshold,
            Duration::from_millis(config.cooldown_ms),
        )
    }

    /// Configured servers, in order
    #[must_use]
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Index of the next healthy server, round robin.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::NoHealthyServers`] if every server is cooling down
    pub fn next_server(&self) -> Result<usize> {
        let now = Instant::now();
        let mut health = self
            .health
            .lock()
            .map_err(|_| RemoteError::Config("slb state poisoned".to_string()))?;
        let count = self.servers.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for offset in 0..count {
            let index = (start + offset) % count;
            let server = &mut health[index];
            match server.unhealthy_until {
                Some(until) if until > now => continue,
                Some(_) => {
                    info!(server = %self.servers[index], "Cache server back in rotation");
                    server.unhealthy_until = None;
                    server.consecutive_errors = 0;
                }
                None => {}
            }
            return Ok(index);
        }
        Err(RemoteError::NoHealthyServers { servers: count })
    }

    /// Record a successful request to server `index`
    pub fn report_success(&self, index: usize) {
        if let Ok(mut health) = self.health.lock() {
            if let Some(server) = health.get_mut(index) {
                server.consecutive_errors = 0;
            }
        }
    }

    /// Record a failed request to server `index`
    pub fn report_error(&self, index: usize) {
        let Ok(mut health) = self.health.lock() else {
            return;
        };
        let Some(server) = health.get_mut(index) else {
            return;
        };
        server.consecutive_errors += 1;
        if server.consecutive_errors >= self.error_threshold && server.unhealthy_until.is_none() {
            warn!(
                server = %self.servers[index],
                errors = server.consecutive_errors,
                cooldown_ms = self.cooldown.as_millis(),
                "Taking cache server out of rotation"
            );
            server.unhealthy_until = Some(Instant::now() + self.cooldown);
        }
    }

    /// Number of servers currently in rotation
    #[must_use]
    pub fn healthy_count(&self) -> usize {
        let now = Instant::now();
        self.health
            .lock()
            .map(|health| {
                health
                    .iter()
                    .filter(|s| s.unhealthy_until.is_none_or(|until| until <= now))
                    .count()
            })
            .unwrap_or_default()
    }
}

/// Sends each request to the server the balancer picks
pub struct LoadBalancedService {
    slb: Arc<ClientSideSlb>,
    services: Vec<SharedHttpService>,
}

impl LoadBalancedService {
    /// One reqwest-backed service per balancer server.
    ///
    /// # Errors
    ///
    /// Returns error if a server URL is invalid
    pub fn new(slb: Arc<ClientSideSlb>, options: &HttpClientOptions) -> Result<Self> {
        let services = slb
            .servers()
            .iter()
            .map(|server| {
                SingleUriService::new(server, options.clone())
                    .map(|s| Arc::new(s) as SharedHttpService)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::with_services(slb, services)
    }

    /// Use `services[i]` for balancer server `i`.
    ///
    /// # Errors
    ///
    /// Returns error if the counts differ
    pub fn with_services(slb: Arc<ClientSideSlb>, services: Vec<SharedHttpService>) -> Result<Self> {
        if services.len() != slb.servers().len() {
            return Err(RemoteError::Config(format!(
                "{} services for {} balanced servers",
                services.len(),
                slb.servers().len()
            )));
        }
        Ok(Self { slb, services })
    }
}

#[async_trait]
impl HttpService for LoadBalancedService {
    async fn make_request(&self, request: HttpRequest) -> Result<HttpResponse> {
        let index = self.slb.next_server()?;
        match self.services[index].make_request(request).await {
            Ok(response) => {
                if response.status() >= 500 {
                    self.slb.report_error(index);
                } else {
                    self.slb.report_success(index);
                }
                Ok(response)
            }
            Err(e) => {
                self.slb.report_error(index);
                Err(e)
            }
        }
    }

    fn close(&self) {
        for service in &self.services {
            service.close();
        }
    }
}
