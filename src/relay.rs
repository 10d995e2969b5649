//! # Relay Listener — join admission and site-traffic dispatch
//!
//! A single well-known-address UDP listener serving arbitrarily many remote
//! sites. Every admitted site keeps sending to this one address; the
//! listener dispatches by message type and by observed sender:
//!
//! - `KeepAlive` requests are answered directly.
//! - `Join` starts an admission task — one task per request, so bringing
//!   one site up never delays admitting another.
//! - `Configure`, `Bundle` and `Goodbye` are resolved to an admitted site
//!   through the observed-sender map and acknowledged, forwarded, or
//!   turned into an immediate teardown respectively.
//!
//! For each accepted join the listener derives a reverse [`LinkConfig`]
//! targeting the **observed** sender address — never an address carried in
//! the join payload — and hands a transient reverse [`Link`] to the
//! [`Distributor`] collaborator to register and bring up. The reverse
//! link's own probe/keep-alive machinery then sustains the path back
//! through the site's NAT.
//!
//! Duplicate joins from the same endpoint (UDP retransmissions racing the
//! first admission) are deduplicated by a pending-join set with atomic
//! check-and-insert; entries are removed on every terminal outcome so a
//! later legitimate re-join from the same address is admitted.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use lru::LruCache;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{LinkConfig, AUTO_ASSIGN};
use crate::error::LinkError;
use crate::link::{BundleSink, Link, TASK_JOIN_TIMEOUT};
use crate::messages::{
    self, Envelope, JoinBody, Message, ResponsePayload, MAX_DATAGRAM_SIZE, MIN_MESSAGE_SIZE,
};

/// Maximum observed-sender entries retained.
/// Bounds the dispatch table against address churn; stale entries are
/// evicted least-recently-used and rebuilt on the next join.
const MAX_SITE_ADDR_ENTRIES: usize = 4096;

/// Registry of live links, consumed by the listener.
///
/// The distributor owns link lookup by site name and takes over each
/// admitted reverse link's lifecycle.
#[async_trait]
pub trait Distributor: Send + Sync {
    /// Whether a link is already registered under `name`.
    async fn contains_link_with_name(&self, name: &str) -> bool;

    /// Register `link` and bring it up. Returns false when bring-up or
    /// registration failed; the link must then be left Down.
    async fn add_and_bring_up(&self, link: Link) -> bool;

    /// Unregister the named link and tear it down, releasing its site
    /// name. Returns false when no such link was registered.
    async fn remove_and_take_down(&self, name: &str) -> bool;
}

/// Endpoints currently mid-admission, keyed by observed sender address.
struct PendingJoins {
    inner: StdMutex<HashSet<SocketAddr>>,
}

impl PendingJoins {
    fn new() -> Self {
        Self { inner: StdMutex::new(HashSet::new()) }
    }

    /// Atomic check-and-insert: true when `addr` was not already pending.
    fn try_begin(&self, addr: SocketAddr) -> bool {
        self.inner.lock().expect("pending-join lock poisoned").insert(addr)
    }

    /// Remove `addr` on a terminal admission outcome.
    fn finish(&self, addr: SocketAddr) {
        self.inner.lock().expect("pending-join lock poisoned").remove(&addr);
    }
}

/// Observed sender address → admitted site name.
///
/// Built at admission, consulted to attribute `Configure`/`Bundle`/
/// `Goodbye` traffic arriving on the shared listener socket.
struct SiteAddrs {
    inner: StdMutex<LruCache<SocketAddr, String>>,
}

impl SiteAddrs {
    fn new() -> Self {
        let cap = NonZeroUsize::new(MAX_SITE_ADDR_ENTRIES)
            .expect("MAX_SITE_ADDR_ENTRIES must be non-zero");
        Self { inner: StdMutex::new(LruCache::new(cap)) }
    }

    fn insert(&self, addr: SocketAddr, site: String) {
        self.inner.lock().expect("site-addr lock poisoned").put(addr, site);
    }

    fn lookup(&self, addr: SocketAddr) -> Option<String> {
        self.inner.lock().expect("site-addr lock poisoned").get(&addr).cloned()
    }

    fn remove(&self, addr: SocketAddr) {
        self.inner.lock().expect("site-addr lock poisoned").pop(&addr);
    }
}

#[derive(Clone)]
struct ListenerCtx {
    socket: Arc<UdpSocket>,
    distributor: Arc<dyn Distributor>,
    sink: Arc<dyn BundleSink>,
    pending: Arc<PendingJoins>,
    sites: Arc<SiteAddrs>,
    auto_names: Arc<AtomicU64>,
    shutdown: watch::Receiver<bool>,
}

/// The relay's rendezvous listener.
pub struct RelayListener {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayListener {
    /// Bind the well-known address and start the accept loop.
    pub async fn bind(
        bind_addr: SocketAddr,
        distributor: Arc<dyn Distributor>,
        sink: Arc<dyn BundleSink>,
    ) -> Result<Self, LinkError> {
        let socket =
            Arc::new(UdpSocket::bind(bind_addr).await.map_err(LinkError::SocketBind)?);
        let local_addr = socket.local_addr().map_err(LinkError::SocketBind)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = ListenerCtx {
            socket,
            distributor,
            sink,
            pending: Arc::new(PendingJoins::new()),
            sites: Arc::new(SiteAddrs::new()),
            auto_names: Arc::new(AtomicU64::new(0)),
            shutdown: shutdown_rx,
        };
        let accept_task = tokio::spawn(accept_loop(ctx));

        info!(addr = %local_addr, "relay listener started");
        Ok(Self {
            local_addr,
            shutdown: shutdown_tx,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// The bound listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the accept loop. Already-admitted reverse links are unaffected;
    /// they belong to the distributor.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.accept_task.lock().await.take() {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await.is_err() {
                warn!(addr = %self.local_addr, "accept loop did not stop within teardown bound");
            }
        }
        info!(addr = %self.local_addr, "relay listener stopped");
    }
}

async fn accept_loop(mut ctx: ListenerCtx) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            _ = ctx.shutdown.changed() => break,
            result = ctx.socket.recv_from(&mut buf) => match result {
                Ok((len, from)) => dispatch(&ctx, &buf[..len], from).await,
                Err(e) => {
                    if *ctx.shutdown.borrow() {
                        break;
                    }
                    // Fatal to the listener: a dead rendezvous socket can
                    // serve nobody.
                    error!(error = %e, "relay listener transport failure, stopping");
                    break;
                }
            }
        }
    }
    debug!("relay accept loop stopped");
}

async fn dispatch(ctx: &ListenerCtx, datagram: &[u8], from: SocketAddr) {
    if datagram.len() < MIN_MESSAGE_SIZE {
        warn!(from = %from, len = datagram.len(), "discarding undersized datagram");
        return;
    }

    let envelope = match messages::decode(datagram) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(from = %from, error = %e, "discarding malformed datagram");
            return;
        }
    };

    match envelope.message {
        Message::KeepAlive { is_request: true } => {
            respond(ctx, from, envelope.correlation_id, ResponsePayload::ok()).await;
        }
        Message::KeepAlive { is_request: false } => {
            trace!(from = %from, "peer keep-alive");
        }
        Message::Join(join) => {
            // One task per join: admitting a slow site must never block
            // other senders.
            let ctx = ctx.clone();
            let correlation_id = envelope.correlation_id;
            tokio::spawn(process_join(ctx, correlation_id, join, from));
        }
        Message::Configure(advert) => match ctx.sites.lookup(from) {
            Some(site) => {
                // The advert was already applied at admission; the
                // configure step is an idempotent re-assertion.
                debug!(site = %site, from = %from, bundling = advert.bundling.enabled, "configure acknowledged");
                respond(ctx, from, envelope.correlation_id, ResponsePayload::ok()).await;
            }
            None => {
                respond(
                    ctx,
                    from,
                    envelope.correlation_id,
                    ResponsePayload::error("sender is not an admitted site"),
                )
                .await;
            }
        },
        Message::Bundle { payload } => match ctx.sites.lookup(from) {
            Some(site) => ctx.sink.forward(&site, payload).await,
            None => debug!(from = %from, "dropping bundle from unadmitted sender"),
        },
        Message::Goodbye => match ctx.sites.lookup(from) {
            Some(site) => {
                info!(site = %site, from = %from, "site departed");
                ctx.sites.remove(from);
                // Teardown joins background tasks; keep the accept loop hot.
                let distributor = ctx.distributor.clone();
                tokio::spawn(async move {
                    distributor.remove_and_take_down(&site).await;
                });
            }
            None => debug!(from = %from, "goodbye from unadmitted sender"),
        },
        Message::Response(_) => {
            debug!(
                from = %from,
                kind = envelope.message.kind(),
                "unsupported control message on relay listener"
            );
        }
    }
}

async fn process_join(ctx: ListenerCtx, correlation_id: u32, join: JoinBody, from: SocketAddr) {
    if join.site_name != AUTO_ASSIGN
        && ctx.distributor.contains_link_with_name(&join.site_name).await
    {
        info!(site = %join.site_name, from = %from, "rejecting join: name taken");
        respond(
            &ctx,
            from,
            correlation_id,
            ResponsePayload::error(format!("site name '{}' is taken", join.site_name)),
        )
        .await;
        return;
    }

    if !ctx.pending.try_begin(from) {
        debug!(from = %from, "dropping duplicate join while admission in progress");
        return;
    }

    let site_name = resolve_site_name(&ctx, &join.site_name).await;
    let config = LinkConfig::reverse_for(&join.config, &site_name, from);
    let link = Link::reverse(config, ctx.sink.clone());

    let admitted = ctx.distributor.add_and_bring_up(link).await;
    ctx.pending.finish(from);

    if admitted {
        ctx.sites.insert(from, site_name.clone());
        info!(site = %site_name, from = %from, "admitted site");
        respond(&ctx, from, correlation_id, ResponsePayload::ok()).await;
    } else {
        // No response: the site's retries (or a later re-join) get another
        // chance once whatever failed has cleared.
        warn!(site = %site_name, from = %from, "abandoning admission: reverse link bring-up failed");
    }
}

/// Resolve the requested name: the auto-assign sentinel becomes a fresh
/// generated name that does not collide with a registered link.
async fn resolve_site_name(ctx: &ListenerCtx, requested: &str) -> String {
    if requested != AUTO_ASSIGN {
        return requested.to_string();
    }
    loop {
        let n = ctx.auto_names.fetch_add(1, Ordering::Relaxed) + 1;
        let candidate = format!("site-{}", n);
        if !ctx.distributor.contains_link_with_name(&candidate).await {
            return candidate;
        }
    }
}

async fn respond(ctx: &ListenerCtx, to: SocketAddr, correlation_id: u32, body: ResponsePayload) {
    let envelope = Envelope::new(correlation_id, Message::Response(body));
    match messages::encode(&envelope) {
        Ok(bytes) => {
            if let Err(e) = ctx.socket.send_to(&bytes, to).await {
                debug!(to = %to, error = %e, "response not delivered");
            }
        }
        Err(e) => error!(to = %to, error = %e, "failed to encode response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_joins_deduplicate_same_endpoint() {
        let pending = PendingJoins::new();
        let addr: SocketAddr = "198.51.100.7:50000".parse().unwrap();

        assert!(pending.try_begin(addr));
        assert!(!pending.try_begin(addr));

        let other: SocketAddr = "198.51.100.7:50001".parse().unwrap();
        assert!(pending.try_begin(other));
    }

    #[test]
    fn pending_joins_admit_again_after_terminal_outcome() {
        let pending = PendingJoins::new();
        let addr: SocketAddr = "198.51.100.7:50000".parse().unwrap();

        assert!(pending.try_begin(addr));
        pending.finish(addr);
        assert!(pending.try_begin(addr));
    }

    #[test]
    fn site_addrs_attribute_and_forget_senders() {
        let sites = SiteAddrs::new();
        let addr: SocketAddr = "198.51.100.7:50000".parse().unwrap();

        assert_eq!(sites.lookup(addr), None);
        sites.insert(addr, "alpha".to_string());
        assert_eq!(sites.lookup(addr), Some("alpha".to_string()));

        sites.remove(addr);
        assert_eq!(sites.lookup(addr), None);
    }

    #[test]
    fn site_addrs_rejoin_overwrites_attribution() {
        let sites = SiteAddrs::new();
        let addr: SocketAddr = "198.51.100.7:50000".parse().unwrap();

        sites.insert(addr, "alpha".to_string());
        sites.insert(addr, "site-4".to_string());
        assert_eq!(sites.lookup(addr), Some("site-4".to_string()));
    }
}
