//! Outbound queue: per-target FIFO delivery with bounded retry.
//!
//! Every target gets its own sub-queue drained by a single worker task, so
//! at most one attempt per target is in flight and messages to one target
//! are attempted in enqueue order. A shared [`DeliveryLane`] caps how many
//! targets deliver concurrently.
//!
//! A message keeps its idempotency key across every attempt. Each enqueued
//! message resolves exactly once: `Ack`, `Rejected`, `Exhausted` or
//! `Cancelled`.

use crate::supervisor::{ConnectionState, ConnectionSupervisor};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mattergate_channels::backend::ChatBackend;
use mattergate_runtime::delivery_lane::DeliveryLane;
use mattergate_runtime::retry::RetryConfig;
use mattergate_types::config::DeliveryConfig;
use mattergate_types::error::{BackendError, DeliveryError, DeliveryResult};
use mattergate_types::message::{Ack, IdempotencyKey, MessageKind, OutboundMessage, MAX_POST_LEN};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Resolves once the message reaches a terminal outcome.
///
/// Dropping the ticket does not cancel delivery.
#[derive(Debug)]
pub struct DeliveryTicket {
    key: IdempotencyKey,
    target: String,
    rx: oneshot::Receiver<DeliveryResult<Ack>>,
}

impl DeliveryTicket {
    pub fn idempotency_key(&self) -> &IdempotencyKey {
        &self.key
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Future for DeliveryTicket {
    type Output = DeliveryResult<Ack>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The worker was aborted during shutdown.
            Poll::Ready(Err(_)) => Poll::Ready(Err(DeliveryError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Terminal outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub delivered: u64,
    pub rejected: u64,
    pub exhausted: u64,
    pub cancelled: u64,
}

/// Result of draining the queue during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Every worker finished within the grace period.
    pub completed: bool,
    /// Workers aborted after the grace period.
    pub aborted: usize,
}

struct Pending {
    message: OutboundMessage,
    reply: oneshot::Sender<DeliveryResult<Ack>>,
}

/// Decrements the in-flight gauge when an attempt ends, including when its
/// worker is aborted mid-call.
struct InFlight<'a>(&'a watch::Sender<usize>);

impl<'a> InFlight<'a> {
    fn enter(gauge: &'a watch::Sender<usize>) -> Self {
        gauge.send_modify(|n| *n += 1);
        Self(gauge)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Per-target FIFO queue in front of a [`ChatBackend`].
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    backend: Arc<dyn ChatBackend>,
    supervisor: ConnectionSupervisor,
    retry: RetryConfig,
    request_timeout: Duration,
    lane: DeliveryLane,
    lanes: DashMap<String, VecDeque<Pending>>,
    workers: Mutex<JoinSet<()>>,
    outstanding: AtomicUsize,
    in_flight: watch::Sender<usize>,
    closing: watch::Sender<bool>,
    delivered: AtomicU64,
    rejected: AtomicU64,
    exhausted: AtomicU64,
    cancelled: AtomicU64,
}

impl OutboundQueue {
    pub fn new(
        config: &DeliveryConfig,
        backend: Arc<dyn ChatBackend>,
        supervisor: ConnectionSupervisor,
    ) -> Self {
        let (in_flight, _) = watch::channel(0);
        let (closing, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                backend,
                supervisor,
                retry: RetryConfig::delivery(config),
                request_timeout: config.request_timeout,
                lane: DeliveryLane::new(config.max_concurrency),
                lanes: DashMap::new(),
                workers: Mutex::new(JoinSet::new()),
                outstanding: AtomicUsize::new(0),
                in_flight,
                closing,
                delivered: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                exhausted: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
            }),
        }
    }

    /// Accept a message for delivery. Never blocks; the returned ticket
    /// resolves with the outcome.
    ///
    /// Messages that can never be delivered (unresolved direct target, empty
    /// or oversized body) resolve `Rejected` immediately. After shutdown has
    /// begun every message resolves `Cancelled`.
    pub fn enqueue(&self, message: OutboundMessage) -> DeliveryTicket {
        let (reply, rx) = oneshot::channel();
        let ticket = DeliveryTicket {
            key: message.idempotency_key.clone(),
            target: message.target.clone(),
            rx,
        };
        let pending = Pending { message, reply };

        if self.is_closing() {
            self.inner.finish(pending, Err(DeliveryError::Cancelled), false);
            return ticket;
        }
        if let Err(err) = validate(&pending.message) {
            debug!(target = %pending.message.target, error = %err, "Refusing message");
            self.inner.finish(pending, Err(err), false);
            return ticket;
        }

        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        self.inner.supervisor.start();

        let target = pending.message.target.clone();
        let spawn = match self.inner.lanes.entry(target.clone()) {
            Entry::Occupied(mut lane) => {
                lane.get_mut().push_back(pending);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::from([pending]));
                true
            }
        };
        if spawn {
            self.spawn_worker(target);
        }
        // Shutdown may have drained the lanes between the check above and the insert.
        if self.is_closing() {
            self.inner.cancel_queued();
        }
        ticket
    }

    /// Messages accepted but not yet resolved.
    pub fn depth(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Attempts currently awaiting a backend response.
    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    /// Targets with an active worker.
    pub fn active_targets(&self) -> usize {
        self.inner.lanes.len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            exhausted: self.inner.exhausted.load(Ordering::Relaxed),
            cancelled: self.inner.cancelled.load(Ordering::Relaxed),
        }
    }

    pub fn is_closing(&self) -> bool {
        *self.inner.closing.borrow()
    }

    /// Resolves once shutdown has begun.
    pub async fn closed(&self) {
        let mut rx = self.inner.closing.subscribe();
        let _ = rx.wait_for(|closing| *closing).await;
    }

    /// Stop accepting messages. Waiting workers give up their message as
    /// `Cancelled`; attempts already in flight run to completion.
    pub fn stop_accepting(&self) {
        if !self.inner.closing.send_replace(true) {
            info!(depth = self.depth(), "Outbound queue closing");
        }
    }

    /// Cancel every message still waiting in a sub-queue.
    pub fn cancel_queued(&self) -> usize {
        self.inner.cancel_queued()
    }

    /// Wait up to `grace` for workers to finish, then abort the rest.
    /// Aborted attempts resolve `Cancelled`.
    pub async fn drain(&self, grace: Duration) -> DrainReport {
        let mut workers = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );

        let completed = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        let aborted = workers.len();
        if aborted > 0 {
            warn!(aborted, "Grace period elapsed, aborting in-flight deliveries");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
            self.inner
                .cancelled
                .fetch_add(self.inner.outstanding.swap(0, Ordering::SeqCst) as u64, Ordering::Relaxed);
        }
        self.inner.lane.close();
        DrainReport { completed, aborted }
    }

    fn spawn_worker(&self, target: String) {
        let inner = self.inner.clone();
        let mut workers = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
        // Reap finished workers so the set does not grow with every target seen.
        while workers.try_join_next().is_some() {}
        workers.spawn(async move { inner.drain_target(target).await });
    }
}

impl QueueInner {
    /// Worker loop for one target. Exits when its sub-queue is empty.
    async fn drain_target(self: Arc<Self>, target: String) {
        debug!(%target, "Delivery worker started");
        loop {
            let next = self
                .lanes
                .get_mut(&target)
                .and_then(|mut lane| lane.pop_front());
            match next {
                Some(pending) => self.deliver(pending).await,
                None => {
                    if self
                        .lanes
                        .remove_if(&target, |_, lane| lane.is_empty())
                        .is_some()
                        || !self.lanes.contains_key(&target)
                    {
                        break;
                    }
                }
            }
        }
        debug!(%target, "Delivery worker idle, exiting");
    }

    async fn deliver(&self, mut pending: Pending) {
        let mut closing = self.closing.subscribe();
        let mut status = self.supervisor.subscribe();
        let target = pending.message.target.clone();

        loop {
            let connected = tokio::select! {
                ready = status.wait_for(|s| s.state == ConnectionState::Connected || s.shut_down) => {
                    ready.map(|s| !s.shut_down).unwrap_or(false)
                }
                _ = closing.wait_for(|c| *c) => false,
            };
            if !connected {
                return self.finish(pending, Err(DeliveryError::Cancelled), true);
            }

            let permit = tokio::select! {
                permit = self.lane.acquire() => permit,
                _ = closing.wait_for(|c| *c) => None,
            };
            let Some(slot) = permit else {
                return self.finish(pending, Err(DeliveryError::Cancelled), true);
            };
            if *closing.borrow() {
                return self.finish(pending, Err(DeliveryError::Cancelled), true);
            }

            pending.message.attempt_count += 1;
            let attempt = pending.message.attempt_count;
            let request = pending.message.post_request();
            let result = {
                let _in_flight = InFlight::enter(&self.in_flight);
                match tokio::time::timeout(self.request_timeout, self.backend.create_post(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Timeout),
                }
            };
            drop(slot);

            let err = match result {
                Ok(post) => {
                    let ack = Ack::from_post(post, &pending.message);
                    debug!(%target, post_id = %ack.post_id, attempts = attempt, "Delivered");
                    return self.finish(pending, Ok(ack), true);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                warn!(%target, attempt, error = %err, "Delivery rejected");
                let reason = err.to_string();
                return self.finish(pending, Err(DeliveryError::Rejected { reason }), true);
            }
            if attempt >= self.retry.max_attempts {
                warn!(%target, attempts = attempt, error = %err, "Delivery attempts exhausted");
                let failure = DeliveryError::Exhausted {
                    attempts: attempt,
                    last_error: err.to_string(),
                };
                return self.finish(pending, Err(failure), true);
            }

            let delay = self.retry.delay_for(attempt - 1);
            debug!(
                %target,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient delivery failure, retrying"
            );
            let cancelled = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = closing.wait_for(|c| *c) => true,
            };
            if cancelled {
                return self.finish(pending, Err(DeliveryError::Cancelled), true);
            }
        }
    }

    /// Resolve a message exactly once and update the counters.
    fn finish(&self, pending: Pending, result: DeliveryResult<Ack>, accepted: bool) {
        if accepted {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
        let counter = match &result {
            Ok(_) => &self.delivered,
            Err(DeliveryError::Rejected { .. }) => &self.rejected,
            Err(DeliveryError::Exhausted { .. }) => &self.exhausted,
            Err(DeliveryError::Cancelled) => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        // Caller may have dropped the ticket
        let _ = pending.reply.send(result);
    }

    fn cancel_queued(&self) -> usize {
        let targets: Vec<String> = self.lanes.iter().map(|lane| lane.key().clone()).collect();
        let mut cancelled = 0;
        for target in targets {
            let drained: Vec<Pending> = match self.lanes.get_mut(&target) {
                Some(mut lane) => lane.drain(..).collect(),
                None => continue,
            };
            for pending in drained {
                self.finish(pending, Err(DeliveryError::Cancelled), true);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(cancelled, "Cancelled queued messages");
        }
        cancelled
    }
}

/// Reject messages no number of attempts could deliver.
fn validate(message: &OutboundMessage) -> DeliveryResult<()> {
    if message.kind == MessageKind::Direct {
        return Err(DeliveryError::rejected(format!(
            "direct message to {} has no resolved channel",
            message.target
        )));
    }
    if message.target.trim().is_empty() {
        return Err(DeliveryError::rejected("empty target"));
    }
    if message.body.trim().is_empty() {
        return Err(DeliveryError::rejected("empty message body"));
    }
    let len = message.body.chars().count();
    if len > MAX_POST_LEN {
        return Err(DeliveryError::rejected(format!(
            "message body is {len} characters, limit is {MAX_POST_LEN}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_channel_message() {
        assert!(validate(&OutboundMessage::to_channel("C1", "hello")).is_ok());
    }

    #[test]
    fn test_validate_rejects_unresolved_direct() {
        let err = validate(&OutboundMessage::to_user("U1", "hello")).unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { .. }));
        assert!(validate(&OutboundMessage::to_user("U1", "hello").into_channel("D1")).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_and_oversized() {
        assert!(validate(&OutboundMessage::to_channel("C1", "   ")).is_err());
        assert!(validate(&OutboundMessage::to_channel("", "hi")).is_err());

        let at_limit = "é".repeat(MAX_POST_LEN);
        assert!(validate(&OutboundMessage::to_channel("C1", at_limit)).is_ok());
        let over = "x".repeat(MAX_POST_LEN + 1);
        assert!(validate(&OutboundMessage::to_channel("C1", over)).is_err());
    }

    #[test]
    fn test_ticket_pending_until_resolved() {
        let (reply, rx) = oneshot::channel();
        let mut ticket = tokio_test::task::spawn(DeliveryTicket {
            key: IdempotencyKey::new("k1"),
            target: "C1".to_string(),
            rx,
        });
        tokio_test::assert_pending!(ticket.poll());

        reply.send(Err(DeliveryError::rejected("nope"))).unwrap();
        assert!(ticket.is_woken());
        tokio_test::assert_ready_eq!(ticket.poll(), Err(DeliveryError::rejected("nope")));
    }

    #[tokio::test]
    async fn test_ticket_cancelled_when_sender_dropped() {
        let (reply, rx) = oneshot::channel();
        let ticket = DeliveryTicket {
            key: IdempotencyKey::new("k1"),
            target: "C1".to_string(),
            rx,
        };
        drop(reply);
        assert_eq!(ticket.idempotency_key().as_str(), "k1");
        assert_eq!(ticket.await, Err(DeliveryError::Cancelled));
    }
}
