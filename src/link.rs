//! # Link Lifecycle
//!
//! The per-peer state machine at the heart of the relay protocol. A
//! [`Link`] owns one UDP endpoint aimed at one peer and drives it through
//! an explicit state machine:
//!
//! ```text
//! Down ──up()──► Connecting ──handshake──► Up
//!   ▲                │                      │
//!   └────────────────┴───────down()─────────┘
//! ```
//!
//! Bring-up performs, in order: bind, receive-loop start, connectivity
//! probe, join, configure — aborting to Down on any step's failure. Every
//! request uses the same retry discipline: one correlation ID, up to three
//! transmissions, a fixed per-attempt response timeout.
//!
//! ## Tasks
//!
//! An Up link runs two background tasks: the receive loop (single owner of
//! the socket's read side) and the [`crate::pacemaker`] liveness task. Both
//! stop on a shared watch signal and are joined within a bounded wait
//! during teardown. A third, link-lifetime supervisor task consumes
//! liveness events (peer silence, transport failure, goodbye) and performs
//! teardown plus auto-reconnect where configured, so failures never have to
//! reach into the owning thread.
//!
//! `up()` is synchronous from its caller's point of view and blocks for the
//! full handshake; `reflect()`/`send()` never block on a response — the
//! transport is best-effort by design.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::channel::UdpChannel;
use crate::config::LinkConfig;
use crate::correlator::Correlator;
use crate::error::LinkError;
use crate::messages::{
    self, Envelope, JoinBody, Message, ResponsePayload, MAX_DATAGRAM_SIZE, MIN_MESSAGE_SIZE,
};
use crate::pacemaker::{self, PacemakerCtx};

/// Transmissions per handshake request before giving up.
pub const HANDSHAKE_ATTEMPTS: u32 = 3;

/// Per-attempt wait for a correlated response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Bounded wait for each background task during teardown.
pub const TASK_JOIN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Delay between reconnect attempts after an Up-state failure.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Lifecycle state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Initial and terminal: no socket, no tasks.
    Down,
    /// Handshake in progress.
    Connecting,
    /// Steady state: receive loop and pacemaker running.
    Up,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkState::Connecting,
            2 => LinkState::Up,
            _ => LinkState::Down,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LinkState::Down => 0,
            LinkState::Connecting => 1,
            LinkState::Up => 2,
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Down => write!(f, "down"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Up => write!(f, "up"),
        }
    }
}

/// Which side of the relay protocol this link plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkRole {
    /// A joining site: probes, joins, configures.
    Site,
    /// A relay-created reverse link: pre-admitted, probe only.
    Reverse,
}

/// Liveness events reported to the link supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkEvent {
    /// Nothing received within the keep-alive interval plus grace.
    PeerSilent,
    /// The receive loop hit an unexpected I/O error.
    TransportFailed,
    /// The peer announced a graceful teardown.
    GoodbyeReceived,
}

/// Consumer of decoded `Bundle` payloads.
///
/// Payload bytes are handed over unexamined; interpretation belongs to the
/// bundling/application layer.
#[async_trait]
pub trait BundleSink: Send + Sync {
    /// Accept one payload received on the named link.
    async fn forward(&self, source_link: &str, payload: Vec<u8>);
}

/// A sink that drops every payload. Useful for control-plane-only links.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl BundleSink for NullSink {
    async fn forward(&self, _source_link: &str, _payload: Vec<u8>) {}
}

/// Background state owned by an Up link.
struct Runtime {
    channel: Arc<UdpChannel>,
    shutdown: watch::Sender<bool>,
    receive_task: JoinHandle<()>,
    pacemaker_task: JoinHandle<()>,
}

struct LinkShared {
    config: LinkConfig,
    role: LinkRole,
    transient: bool,
    sink: Arc<dyn BundleSink>,
    correlator: Arc<Correlator>,
    /// Serializes `up()`/`down()`; an in-progress handshake runs to
    /// completion before a teardown can apply.
    lifecycle: Mutex<Option<Runtime>>,
    /// Mirror of the lifecycle state for lock-free observers.
    state: AtomicU8,
    /// True between `up()` and an explicit `down()`; gates auto-reconnect.
    want_up: AtomicBool,
    /// Data-path snapshot; readable without touching the lifecycle lock.
    active: RwLock<Option<Arc<UdpChannel>>>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
}

/// Handle to one relay link. Cheap to clone.
#[derive(Clone)]
pub struct Link {
    shared: Arc<LinkShared>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("name", &self.shared.config.name)
            .field("state", &self.state())
            .field("transient", &self.shared.transient)
            .finish()
    }
}

impl Link {
    /// A joining-site link. Created Down; call [`Link::up`] to connect.
    pub fn new(config: LinkConfig, sink: Arc<dyn BundleSink>) -> Self {
        Self::with_role(config, sink, LinkRole::Site, false)
    }

    /// A relay-side reverse link targeting an admitted site's observed
    /// address. Transient: never auto-reconnected.
    pub fn reverse(config: LinkConfig, sink: Arc<dyn BundleSink>) -> Self {
        Self::with_role(config, sink, LinkRole::Reverse, true)
    }

    fn with_role(
        config: LinkConfig,
        sink: Arc<dyn BundleSink>,
        role: LinkRole,
        transient: bool,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(LinkShared {
            config,
            role,
            transient,
            sink,
            correlator: Arc::new(Correlator::new()),
            lifecycle: Mutex::new(None),
            state: AtomicU8::new(LinkState::Down.as_u8()),
            want_up: AtomicBool::new(false),
            active: RwLock::new(None),
            events_tx,
        });
        tokio::spawn(supervise(Arc::downgrade(&shared), events_rx));
        Self { shared }
    }

    /// Bring the link up: bind, probe, join, configure, start liveness.
    ///
    /// No-op when already Up. Blocks for the full handshake; any step's
    /// failure leaves the link cleanly Down with no background task
    /// surviving.
    pub async fn up(&self) -> Result<(), LinkError> {
        self.shared.want_up.store(true, Ordering::Relaxed);
        self.shared.do_up().await
    }

    /// Tear the link down: best-effort goodbye, stop and join tasks,
    /// release the socket. Idempotent.
    pub async fn down(&self) {
        self.shared.want_up.store(false, Ordering::Relaxed);
        self.shared.do_down().await;
    }

    /// Fire-and-forget an opaque payload to the peer.
    pub async fn reflect(&self, payload: Vec<u8>) {
        self.send(Message::Bundle { payload }).await;
    }

    /// Fire-and-forget a control message to the peer.
    ///
    /// Never blocks on a response; silently dropped when the link is not
    /// Up.
    pub async fn send(&self, message: Message) {
        let channel = self.shared.active.read().expect("active lock poisoned").clone();
        match channel {
            None => trace!(
                link = %self.shared.config.name,
                kind = message.kind(),
                "link not up, dropping outbound message"
            ),
            Some(channel) => {
                if let Err(e) = channel.send(&Envelope::uncorrelated(message)).await {
                    debug!(link = %self.shared.config.name, error = %e, "best-effort send failed");
                }
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.shared.state.load(Ordering::Relaxed))
    }

    /// The link's configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }

    /// The link's name.
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// True for relay-created reverse links (never auto-reconnected).
    pub fn is_transient(&self) -> bool {
        self.shared.transient
    }

    /// The bound local address while Up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let active = self.shared.active.read().expect("active lock poisoned");
        active.as_ref().and_then(|channel| channel.local_addr().ok())
    }

    /// The resolved peer address while Up.
    pub fn target_addr(&self) -> Option<SocketAddr> {
        let active = self.shared.active.read().expect("active lock poisoned");
        active.as_ref().map(|channel| channel.target())
    }

    /// One-line status for an operations layer.
    pub fn summary(&self) -> String {
        match self.target_addr() {
            Some(target) => {
                format!("{}: {} -> {}", self.shared.config.name, self.state(), target)
            }
            None => format!(
                "{}: {} -> {}:{}",
                self.shared.config.name,
                self.state(),
                self.shared.config.address,
                self.shared.config.port
            ),
        }
    }
}

impl LinkShared {
    /// The single state-transition point.
    fn set_state(&self, next: LinkState) {
        let prev = self.state.swap(next.as_u8(), Ordering::Relaxed);
        let prev = LinkState::from_u8(prev);
        if prev != next {
            debug!(link = %self.config.name, from = %prev, to = %next, "state transition");
        }
    }

    async fn do_up(&self) -> Result<(), LinkError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            debug!(link = %self.config.name, "up() ignored: already up");
            return Ok(());
        }

        self.set_state(LinkState::Connecting);
        match self.bring_up().await {
            Ok(runtime) => {
                *self.active.write().expect("active lock poisoned") =
                    Some(runtime.channel.clone());
                info!(
                    link = %self.config.name,
                    local = ?runtime.channel.local_addr().ok(),
                    target = %runtime.channel.target(),
                    "link up"
                );
                *lifecycle = Some(runtime);
                self.set_state(LinkState::Up);
                Ok(())
            }
            Err(e) => {
                self.set_state(LinkState::Down);
                warn!(link = %self.config.name, error = %e, "link bring-up failed");
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<Runtime, LinkError> {
        let target = self.config.resolve_target().await.map_err(LinkError::SocketBind)?;
        let channel =
            Arc::new(UdpChannel::bind(self.config.local_bind_addr(), target).await?);
        self.correlator.reset();

        // The receive loop starts before anything is sent so no reply can
        // be missed.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let receive_task = tokio::spawn(receive_loop(ReceiveCtx {
            link: self.config.name.clone(),
            role: self.role,
            channel: channel.clone(),
            correlator: self.correlator.clone(),
            sink: self.sink.clone(),
            events: self.events_tx.clone(),
            shutdown: shutdown_rx.clone(),
        }));

        if let Err(e) = self.handshake(&channel).await {
            let _ = shutdown_tx.send(true);
            join_bounded(receive_task, "receive", &self.config.name).await;
            return Err(e);
        }

        let pacemaker_task = tokio::spawn(pacemaker::run(PacemakerCtx {
            link: self.config.name.clone(),
            channel: channel.clone(),
            correlator: self.correlator.clone(),
            events: self.events_tx.clone(),
            shutdown: shutdown_rx,
        }));

        Ok(Runtime { channel, shutdown: shutdown_tx, receive_task, pacemaker_task })
    }

    async fn handshake(&self, channel: &UdpChannel) -> Result<(), LinkError> {
        let probe = send_and_wait(
            channel,
            &self.correlator,
            Message::KeepAlive { is_request: true },
        )
        .await?;
        if probe.is_none() {
            return Err(LinkError::HandshakeTimeout {
                step: "probe",
                attempts: HANDSHAKE_ATTEMPTS,
            });
        }
        debug!(link = %self.config.name, target = %channel.target(), "connectivity probe answered");

        // Reverse links are pre-admitted by the relay: nothing to join.
        if self.role == LinkRole::Reverse {
            return Ok(());
        }

        let join = Message::Join(JoinBody {
            site_name: self.config.site_name.clone(),
            config: self.config.advert(),
        });
        match send_and_wait(channel, &self.correlator, join).await? {
            None => {
                return Err(LinkError::HandshakeTimeout {
                    step: "join",
                    attempts: HANDSHAKE_ATTEMPTS,
                })
            }
            Some(response) if !response.ok => {
                return Err(LinkError::HandshakeRejected {
                    step: "join",
                    reason: response.text,
                })
            }
            Some(_) => debug!(link = %self.config.name, "join accepted"),
        }

        match send_and_wait(channel, &self.correlator, Message::Configure(self.config.advert()))
            .await?
        {
            None => Err(LinkError::HandshakeTimeout {
                step: "configure",
                attempts: HANDSHAKE_ATTEMPTS,
            }),
            Some(response) if !response.ok => Err(LinkError::HandshakeRejected {
                step: "configure",
                reason: response.text,
            }),
            Some(_) => {
                debug!(link = %self.config.name, "configure accepted");
                Ok(())
            }
        }
    }

    async fn do_down(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(runtime) = lifecycle.take() else {
            debug!(link = %self.config.name, "down() ignored: already down");
            return;
        };
        *self.active.write().expect("active lock poisoned") = None;

        // Best-effort: lets the peer release this site immediately instead
        // of waiting out the liveness timeout.
        if let Err(e) =
            runtime.channel.send(&Envelope::uncorrelated(Message::Goodbye)).await
        {
            debug!(link = %self.config.name, error = %e, "goodbye not delivered");
        }

        let _ = runtime.shutdown.send(true);
        join_bounded(runtime.receive_task, "receive", &self.config.name).await;
        join_bounded(runtime.pacemaker_task, "pacemaker", &self.config.name).await;

        self.correlator.reset();
        self.set_state(LinkState::Down);
        info!(link = %self.config.name, "link down");
    }
}

/// Send `message` and wait for its correlated response: one ID, up to
/// [`HANDSHAKE_ATTEMPTS`] transmissions, [`RESPONSE_TIMEOUT`] per attempt.
///
/// Exhausting the retry budget is `Ok(None)`, not an error; callers map it
/// to the failing handshake step.
async fn send_and_wait(
    channel: &UdpChannel,
    correlator: &Correlator,
    message: Message,
) -> Result<Option<ResponsePayload>, LinkError> {
    let envelope = Envelope::new(correlator.assign_id(), message);
    for attempt in 1..=HANDSHAKE_ATTEMPTS {
        channel.send(&envelope).await?;
        if let Some(response) =
            correlator.await_response(envelope.correlation_id, RESPONSE_TIMEOUT).await
        {
            return Ok(Some(response));
        }
        debug!(
            kind = envelope.message.kind(),
            correlation_id = format_args!("{:#010x}", envelope.correlation_id),
            attempt,
            "no response within attempt timeout"
        );
    }
    Ok(None)
}

async fn join_bounded(task: JoinHandle<()>, task_name: &str, link: &str) {
    if tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await.is_err() {
        warn!(link, task = task_name, "background task did not stop within teardown bound");
    }
}

struct ReceiveCtx {
    link: String,
    role: LinkRole,
    channel: Arc<UdpChannel>,
    correlator: Arc<Correlator>,
    sink: Arc<dyn BundleSink>,
    events: mpsc::UnboundedSender<LinkEvent>,
    shutdown: watch::Receiver<bool>,
}

async fn receive_loop(mut ctx: ReceiveCtx) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            _ = ctx.shutdown.changed() => break,
            result = ctx.channel.recv(&mut buf) => match result {
                Ok((len, from)) => handle_datagram(&ctx, &buf[..len], from).await,
                Err(e) => {
                    if *ctx.shutdown.borrow() {
                        break;
                    }
                    error!(link = %ctx.link, error = %e, "receive loop transport failure");
                    let _ = ctx.events.send(LinkEvent::TransportFailed);
                    break;
                }
            }
        }
    }
    debug!(link = %ctx.link, "receive loop stopped");
}

async fn handle_datagram(ctx: &ReceiveCtx, datagram: &[u8], from: SocketAddr) {
    if datagram.len() < MIN_MESSAGE_SIZE {
        warn!(
            link = %ctx.link,
            from = %from,
            len = datagram.len(),
            "discarding undersized datagram"
        );
        return;
    }

    let envelope = match messages::decode(datagram) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(link = %ctx.link, from = %from, error = %e, "discarding malformed datagram");
            return;
        }
    };

    match envelope.message {
        Message::KeepAlive { is_request: true } => {
            let reply = Envelope::new(
                envelope.correlation_id,
                Message::Response(ResponsePayload::ok()),
            );
            if let Err(e) = ctx.channel.send_to(&reply, from).await {
                debug!(link = %ctx.link, error = %e, "keep-alive ack not delivered");
            }
        }
        Message::KeepAlive { is_request: false } => {
            trace!(link = %ctx.link, from = %from, "peer keep-alive");
        }
        Message::Response(body) => {
            ctx.correlator.deliver(envelope.correlation_id, body);
        }
        Message::Bundle { payload } => {
            ctx.sink.forward(&ctx.link, payload).await;
        }
        Message::Goodbye => match ctx.role {
            LinkRole::Reverse => {
                info!(link = %ctx.link, from = %from, "peer said goodbye");
                let _ = ctx.events.send(LinkEvent::GoodbyeReceived);
            }
            LinkRole::Site => {
                trace!(link = %ctx.link, from = %from, "ignoring goodbye on site link");
            }
        },
        Message::Join(_) | Message::Configure(_) => {
            debug!(
                link = %ctx.link,
                kind = envelope.message.kind(),
                "ignoring relay-only control message"
            );
        }
    }
}

/// Link-lifetime event consumer: tears the link down on liveness failures
/// and re-establishes it when the configuration asks for that.
///
/// Holds only a weak reference so an abandoned link can be dropped; the
/// event channel closes with it and the task exits.
async fn supervise(shared: Weak<LinkShared>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else { break };

        if LinkState::from_u8(shared.state.load(Ordering::Relaxed)) != LinkState::Up {
            trace!(link = %shared.config.name, event = ?event, "ignoring stale liveness event");
            continue;
        }

        match event {
            LinkEvent::GoodbyeReceived => {
                info!(link = %shared.config.name, "taking link down: peer departed")
            }
            LinkEvent::PeerSilent => {
                warn!(link = %shared.config.name, "taking link down: peer silent")
            }
            LinkEvent::TransportFailed => {
                warn!(link = %shared.config.name, "taking link down: transport failure")
            }
        }
        shared.do_down().await;

        if shared.transient || !shared.config.auto_reconnect {
            continue;
        }

        while shared.want_up.load(Ordering::Relaxed) {
            tokio::time::sleep(RECONNECT_BACKOFF).await;
            if !shared.want_up.load(Ordering::Relaxed) {
                break;
            }
            match shared.do_up().await {
                Ok(()) => {
                    info!(link = %shared.config.name, "link re-established");
                    break;
                }
                Err(e) => {
                    warn!(link = %shared.config.name, error = %e, "reconnect attempt failed")
                }
            }
        }
    }
}
