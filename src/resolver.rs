//! Container-backed host resolution
//!
//! The resolver keeps a [`ResolverCache`] of `hostname -> address` built from
//! running containers. A container serves a hostname when its environment
//! contains the configured identifier variable (e.g. `VIRTUAL_HOST=app.local`);
//! its address is the first network with a non-empty IP.
//!
//! Lifecycle:
//! - bootstrap: subscribe to runtime events, wait for the settle delay, then
//!   rescan once before serving. Events that arrive during the scan stay
//!   queued on the subscription and trigger a follow-up rescan
//! - listen: a single task consumes runtime events. Each event (re)arms one
//!   quiet-period timer; the rescan only runs once the timer elapses, so a
//!   burst of events costs one rescan
//! - shutdown: the listener exits when the shutdown channel flips to `true`.
//!   If the event stream fails or ends, the listener stops and the cache keeps
//!   its last contents

use crate::cache::{ResolverCache, SharedResolverCache};
use crate::config::{DockerLookupConfig, StaleEntries};
use crate::runtime::{ContainerRuntime, RuntimeError};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Environment variable naming the host a container serves
    pub host_identifier: String,
    pub settle_delay: Duration,
    pub debounce: Duration,
    pub stale_entries: StaleEntries,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self::from(&DockerLookupConfig::default())
    }
}

impl From<&DockerLookupConfig> for ResolverSettings {
    fn from(config: &DockerLookupConfig) -> Self {
        Self {
            host_identifier: config.host_identifier.clone(),
            settle_delay: config.settle_delay(),
            debounce: config.debounce(),
            stale_entries: config.stale_entries,
        }
    }
}

/// Outcome of one rescan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RescanReport {
    /// Running containers listed
    pub containers: usize,
    /// Containers that produced a cache entry
    pub resolved: usize,
    /// Hosts removed under [`StaleEntries::Evict`]
    pub evicted: Vec<String>,
}

pub struct Resolver<R: ContainerRuntime> {
    runtime: Arc<R>,
    cache: SharedResolverCache,
    settings: ResolverSettings,
}

impl<R: ContainerRuntime> Resolver<R> {
    pub fn new(runtime: Arc<R>, settings: ResolverSettings) -> Self {
        Self {
            runtime,
            cache: Arc::new(ResolverCache::new()),
            settings,
        }
    }

    /// Build a resolver, warm its cache, and start listening for events
    pub async fn start(
        runtime: Arc<R>,
        settings: ResolverSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let resolver = Self::new(runtime, settings);
        let (ready_tx, ready_rx) = oneshot::channel();
        let listener = resolver.spawn(shutdown_rx, Some(ready_tx));
        // An Err means the task is gone; the caller still gets its handle
        let _ = ready_rx.await;
        (resolver, listener)
    }

    /// Shared handle to the cache, for lookups by the proxy
    pub fn cache(&self) -> SharedResolverCache {
        Arc::clone(&self.cache)
    }

    pub fn address(&self, hostname: &str) -> Option<String> {
        self.cache.address(hostname)
    }

    /// Re-enumerate running containers into the cache.
    ///
    /// When several containers claim one hostname, the one listed last wins.
    pub async fn rescan(&self) -> Result<RescanReport, RuntimeError> {
        rescan_into(self.runtime.as_ref(), &self.cache, &self.settings).await
    }

    /// Spawn the event listener task without an initial scan
    pub fn spawn_listener(&self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        self.spawn(shutdown_rx, None)
    }

    fn spawn(
        &self,
        shutdown_rx: watch::Receiver<bool>,
        bootstrap: Option<oneshot::Sender<()>>,
    ) -> JoinHandle<()> {
        let runtime = Arc::clone(&self.runtime);
        let cache = Arc::clone(&self.cache);
        let settings = self.settings.clone();

        tokio::spawn(async move {
            listen(runtime, cache, settings, shutdown_rx, bootstrap).await;
        })
    }
}

/// Wait for the settle delay, then run the initial rescan. A failed scan is
/// logged and leaves the cache empty.
async fn bootstrap_into<R: ContainerRuntime>(
    runtime: &R,
    cache: &ResolverCache,
    settings: &ResolverSettings,
) {
    if !settings.settle_delay.is_zero() {
        tokio::time::sleep(settings.settle_delay).await;
    }

    match rescan_into(runtime, cache, settings).await {
        Ok(report) => info!(
            containers = report.containers,
            resolved = report.resolved,
            hosts = cache.len(),
            "Initial container scan complete"
        ),
        Err(e) => error!(error = %e, "Initial container scan failed, starting with an empty host cache"),
    }
}

async fn rescan_into<R: ContainerRuntime>(
    runtime: &R,
    cache: &ResolverCache,
    settings: &ResolverSettings,
) -> Result<RescanReport, RuntimeError> {
    let ids = runtime.list_running().await?;
    let mut report = RescanReport {
        containers: ids.len(),
        ..Default::default()
    };
    let mut seen = HashSet::new();
    let mut complete = true;

    for id in &ids {
        let details = match runtime.inspect(id).await {
            Ok(details) => details,
            Err(e) => {
                debug!(container_id = %id, error = %e, "Skipping container that could not be inspected");
                complete = false;
                continue;
            }
        };

        let Some(host) = details.env_value(&settings.host_identifier).filter(|h| !h.is_empty()) else {
            continue;
        };

        let Some(address) = details.first_address() else {
            debug!(container_id = %id, host, "Container has no network address");
            continue;
        };

        seen.insert(host.to_string());
        let previous = cache.insert(host, address);
        if previous.as_deref() != Some(address) {
            info!(host, ip_address = address, previous = ?previous, "Resolved container host");
        }
        report.resolved += 1;
    }

    if settings.stale_entries == StaleEntries::Evict {
        if complete {
            report.evicted = cache.retain_hosts(&seen);
            for host in &report.evicted {
                info!(host, "Evicted host no longer served by any container");
            }
        } else {
            warn!("Rescan was incomplete, keeping unseen hosts until the next scan");
        }
    }

    Ok(report)
}

/// Event loop: sole owner of the debounce timer. With `bootstrap`, the
/// initial scan runs after subscribing and `bootstrap` is signalled once the
/// cache is warm.
async fn listen<R: ContainerRuntime>(
    runtime: Arc<R>,
    cache: SharedResolverCache,
    settings: ResolverSettings,
    mut shutdown_rx: watch::Receiver<bool>,
    bootstrap: Option<oneshot::Sender<()>>,
) {
    let mut events = runtime.events();
    if let Some(ready) = bootstrap {
        bootstrap_into(runtime.as_ref(), &cache, &settings).await;
        let _ = ready.send(());
    }
    let timer = tokio::time::sleep(settings.debounce);
    tokio::pin!(timer);
    let mut armed = false;

    info!(
        debounce_ms = settings.debounce.as_millis() as u64,
        "Listening for container events"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Container event listener shutting down");
                    break;
                }
            }
            () = &mut timer, if armed => {
                armed = false;
                match rescan_into(runtime.as_ref(), &cache, &settings).await {
                    Ok(report) => debug!(
                        containers = report.containers,
                        resolved = report.resolved,
                        evicted = report.evicted.len(),
                        "Container rescan complete"
                    ),
                    Err(e) => error!(error = %e, "Container rescan failed"),
                }
            }
            item = events.next() => {
                match item {
                    Some(Ok(event)) => {
                        debug!(action = %event.action, actor = ?event.actor, "Container event");
                        timer.as_mut().reset(Instant::now() + settings.debounce);
                        armed = true;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Container event stream failed, host cache will no longer refresh");
                        break;
                    }
                    None => {
                        warn!("Container event stream ended, host cache will no longer refresh");
                        break;
                    }
                }
            }
        }
    }
}
