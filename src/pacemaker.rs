//! Per-link liveness task.
//!
//! Runs on its own cadence, independent of the owning link's callers: emits
//! an unsolicited keep-alive when the link has been send-idle too long, and
//! flags the peer as silent when nothing has been received within the
//! keep-alive interval plus a grace margin. Silence is reported to the
//! link's supervisor as a [`LinkEvent::PeerSilent`] event, which tears the
//! link down (and reconnects it where configured).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::channel::UdpChannel;
use crate::correlator::Correlator;
use crate::link::LinkEvent;
use crate::messages::{Envelope, Message};

/// Cadence of the liveness task.
pub const PACEMAKER_INTERVAL: Duration = Duration::from_millis(900);

/// Send-idle threshold before an unsolicited keep-alive goes out.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Extra receive-idle margin beyond [`KEEPALIVE_INTERVAL`] before the peer
/// is declared silent.
pub const SILENCE_GRACE: Duration = Duration::from_secs(5);

pub(crate) struct PacemakerCtx {
    pub link: String,
    pub channel: Arc<UdpChannel>,
    pub correlator: Arc<Correlator>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
    pub shutdown: watch::Receiver<bool>,
}

pub(crate) async fn run(mut ctx: PacemakerCtx) {
    let mut ticker = tokio::time::interval(PACEMAKER_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so a freshly-up link is not
    // probed before it has had a chance to carry traffic.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ctx.shutdown.changed() => break,
            _ = ticker.tick() => {
                if tick(&ctx).await {
                    break;
                }
            }
        }
    }
    debug!(link = %ctx.link, "pacemaker stopped");
}

/// One liveness pass. Returns true when the peer was declared silent and
/// the task should stop.
async fn tick(ctx: &PacemakerCtx) -> bool {
    let silent_for = ctx.channel.since_last_received();
    if silent_for > KEEPALIVE_INTERVAL + SILENCE_GRACE {
        warn!(
            link = %ctx.link,
            silent_secs = silent_for.as_secs(),
            "peer silent beyond keep-alive grace"
        );
        let _ = ctx.events.send(LinkEvent::PeerSilent);
        return true;
    }

    if ctx.channel.since_last_sent() > KEEPALIVE_INTERVAL {
        // Correlated so the ack can be parked; nobody blocks on it.
        let envelope = Envelope::new(
            ctx.correlator.assign_id(),
            Message::KeepAlive { is_request: true },
        );
        match ctx.channel.send(&envelope).await {
            Ok(()) => trace!(link = %ctx.link, "sent keep-alive"),
            Err(e) => debug!(link = %ctx.link, error = %e, "keep-alive send failed"),
        }
    }

    false
}
