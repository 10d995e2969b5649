//! Response correlation for requests in flight over an unreliable
//! transport.
//!
//! Each request that expects a reply is assigned a fresh random 32-bit
//! correlation ID. The link's receive task hands every incoming `Response`
//! to [`Correlator::deliver`]; a handshake step blocks in
//! [`Correlator::await_response`] until its ID arrives or the per-attempt
//! timeout elapses.
//!
//! Delivery and waiter registration take the same lock, so a response that
//! races ahead of its waiter is parked and found by the check-then-wait in
//! `await_response` — the wait can never be lost to that race. Responses
//! nobody ever awaits (retransmitted acks, keep-alive acks) are parked in a
//! bounded LRU so the table cannot grow without limit.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::oneshot;
use tracing::trace;

use crate::messages::ResponsePayload;

/// Maximum responses retained without a waiter.
/// Bounds the table against acks that are never consumed.
const MAX_PARKED_RESPONSES: usize = 256;

struct Inner {
    /// One pending waiter per outstanding correlation ID.
    waiters: HashMap<u32, oneshot::Sender<ResponsePayload>>,
    /// Responses that arrived before (or without) a waiter.
    parked: LruCache<u32, ResponsePayload>,
}

/// Matches asynchronous responses to pending requests by correlation ID.
///
/// Scoped to one link; [`Correlator::reset`] clears all state on
/// (re)connect.
pub struct Correlator {
    inner: Mutex<Inner>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// An empty correlation table.
    pub fn new() -> Self {
        let parked_cap =
            NonZeroUsize::new(MAX_PARKED_RESPONSES).expect("MAX_PARKED_RESPONSES must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                waiters: HashMap::new(),
                parked: LruCache::new(parked_cap),
            }),
        }
    }

    /// Produce a fresh random nonzero correlation ID.
    ///
    /// The ID is not yet registered; registration happens inside
    /// [`Correlator::await_response`] so retries reuse the same ID.
    pub fn assign_id(&self) -> u32 {
        let inner = self.inner.lock().expect("correlator lock poisoned");
        loop {
            let id: u32 = rand::random();
            if id != 0 && !inner.waiters.contains_key(&id) {
                return id;
            }
        }
    }

    /// Block until a response with `id` is observed or `timeout` elapses.
    ///
    /// Supports arbitrarily many concurrently outstanding IDs. Returns
    /// `None` on timeout; the caller decides whether to retry with the
    /// same ID.
    pub async fn await_response(&self, id: u32, timeout: Duration) -> Option<ResponsePayload> {
        let rx = {
            let mut inner = self.inner.lock().expect("correlator lock poisoned");
            if let Some(parked) = inner.parked.pop(&id) {
                return Some(parked);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.insert(id, tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Some(response),
            // Timed out, or the table was reset underneath us.
            _ => {
                let mut inner = self.inner.lock().expect("correlator lock poisoned");
                inner.waiters.remove(&id);
                None
            }
        }
    }

    /// Record an incoming response, waking the waiter for its ID if one is
    /// registered. Responses for unknown IDs are parked, not an error.
    pub fn deliver(&self, id: u32, response: ResponsePayload) {
        let mut inner = self.inner.lock().expect("correlator lock poisoned");
        match inner.waiters.remove(&id) {
            Some(waiter) => {
                // The waiter may have just timed out; parking keeps the
                // response available for a retry of the same ID.
                if let Err(response) = waiter.send(response) {
                    inner.parked.put(id, response);
                }
            }
            None => {
                trace!(correlation_id = format_args!("{:#010x}", id), "parking unawaited response");
                inner.parked.put(id, response);
            }
        }
    }

    /// Drop all waiters and parked responses. Called on (re)connect.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("correlator lock poisoned");
        inner.waiters.clear();
        inner.parked.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(50);
    const AMPLE: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn deliver_wakes_matching_waiter() {
        let correlator = std::sync::Arc::new(Correlator::new());
        let id = correlator.assign_id();

        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.await_response(id, AMPLE).await })
        };
        tokio::task::yield_now().await;

        correlator.deliver(id, ResponsePayload::ok());
        let got = waiter.await.unwrap();
        assert_eq!(got, Some(ResponsePayload::ok()));
    }

    #[tokio::test]
    async fn response_racing_ahead_of_waiter_is_not_lost() {
        let correlator = Correlator::new();
        let id = correlator.assign_id();

        correlator.deliver(id, ResponsePayload::error("early"));

        let got = correlator.await_response(id, SHORT).await;
        assert_eq!(got, Some(ResponsePayload::error("early")));
    }

    #[tokio::test]
    async fn mismatched_id_never_wakes_waiter() {
        let correlator = Correlator::new();
        let id = correlator.assign_id();
        let other = correlator.assign_id();
        assert_ne!(id, other);

        correlator.deliver(other, ResponsePayload::ok());
        assert_eq!(correlator.await_response(id, SHORT).await, None);
    }

    #[tokio::test]
    async fn timeout_returns_none_and_clears_waiter() {
        let correlator = Correlator::new();
        let id = correlator.assign_id();

        assert_eq!(correlator.await_response(id, SHORT).await, None);

        // A late delivery after timeout parks; a retry with the same ID
        // picks it up.
        correlator.deliver(id, ResponsePayload::ok());
        assert_eq!(correlator.await_response(id, SHORT).await, Some(ResponsePayload::ok()));
    }

    #[tokio::test]
    async fn concurrent_outstanding_requests_resolve_independently() {
        let correlator = std::sync::Arc::new(Correlator::new());
        let ids: Vec<u32> = (0..8).map(|_| correlator.assign_id()).collect();

        let waiters: Vec<_> = ids
            .iter()
            .map(|&id| {
                let correlator = correlator.clone();
                tokio::spawn(async move { correlator.await_response(id, AMPLE).await })
            })
            .collect();
        tokio::task::yield_now().await;

        for &id in ids.iter().rev() {
            correlator.deliver(id, ResponsePayload { ok: true, text: format!("{:08x}", id) });
        }

        for (waiter, &id) in waiters.into_iter().zip(&ids) {
            let got = waiter.await.unwrap().expect("waiter should resolve");
            assert_eq!(got.text, format!("{:08x}", id));
        }
    }

    #[tokio::test]
    async fn reset_clears_parked_responses() {
        let correlator = Correlator::new();
        let id = correlator.assign_id();
        correlator.deliver(id, ResponsePayload::ok());

        correlator.reset();
        assert_eq!(correlator.await_response(id, SHORT).await, None);
    }

    #[test]
    fn assigned_ids_are_nonzero() {
        let correlator = Correlator::new();
        for _ in 0..64 {
            assert_ne!(correlator.assign_id(), 0);
        }
    }
}
