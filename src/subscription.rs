//! # Subscriptions & Live Tailing
//!
//! Subscribers receive committed entries either from a single stream or from
//! the global `$all` feed. A catch-up subscription first replays history, then
//! switches to live delivery without missing or repeating anything.
//!
//! ## The Catch-Up + Live Pattern
//!
//! ```text
//!  subscribe()
//!    1. open notification receiver      ─┐ order matters: anything committed
//!    2. capture the live point (head)   ─┘ after (2) is already in (1)
//!
//!  ┌──────────────────────────────┐  ┌──────────────────────────────────┐
//!  │  CatchingUp                  │  │  Live                            │
//!  │  read history in batches     │─►│  receive notifications,          │
//!  │  up to the live point        │  │  skip anything <= live point     │
//!  └──────────────────────────────┘  └──────────────────────────────────┘
//!                 │                                  │
//!                 └────────── Terminated ◄───────────┘
//!        (cancel, stream deleted, slow consumer, store shutdown)
//! ```
//!
//! Notifications committed between (2) and the end of catch-up wait in the
//! receiver's buffer, so the handoff needs no locking against writers.
//! History is read from SQLite in `catchup_batch_size` steps; only one batch
//! is held in memory at a time.
//!
//! ## Backpressure
//!
//! Each subscription target has a bounded `tokio::sync::broadcast` channel.
//! Writers never block on subscribers. A subscriber that falls more than the
//! channel capacity behind gets [`Error::SlowConsumer`] and is terminated; it
//! resubscribes in catch-up mode from the last position it processed. Nothing
//! is dropped silently.
//!
//! Broadcast channels hold a power of two of notifications: a configured
//! capacity is rounded up, and [`Notifier::capacity`] reports the value in
//! effect.
//!
//! ## Cancellation
//!
//! [`Subscription::cancel`], a cloned [`CancelHandle`], dropping the
//! subscription, or store shutdown. A task blocked in
//! [`Subscription::next`] wakes up immediately and sees `None`.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::index::StreamIndex;
use crate::log::GlobalLog;
use crate::reader::VersionRange;
use crate::types::{
    GlobalPos, LogEntry, RecordedEvent, SharedEntry, StreamId, StreamTombstone, StreamVersion,
    ALL_STREAM,
};

// =============================================================================
// Notifier
// =============================================================================

/// Fan-out point between the global log and subscribers.
///
/// One broadcast channel feeds `$all` subscribers; stream subscribers share a
/// channel per stream, created on first subscription and removed when its
/// last receiver goes away.
pub struct Notifier {
    all: broadcast::Sender<SharedEntry>,
    streams: DashMap<StreamId, broadcast::Sender<SharedEntry>>,
    capacity: usize,
    shutdown: watch::Sender<bool>,
}

impl Notifier {
    /// Creates the notifier. `capacity` is rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let (all, _) = broadcast::channel(capacity);
        let (shutdown, _) = watch::channel(false);
        Self {
            all,
            streams: DashMap::new(),
            capacity,
            shutdown,
        }
    }

    /// Delivers a committed entry to `$all` and to its stream's subscribers.
    ///
    /// Never blocks. Send errors only mean nobody is listening.
    pub fn publish(&self, entry: &SharedEntry) {
        let _ = self.all.send(entry.clone());
        if let Some(tx) = self.streams.get(entry.stream_id()) {
            let _ = tx.send(entry.clone());
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<SharedEntry> {
        self.all.subscribe()
    }

    pub fn subscribe_stream(&self, stream_id: &StreamId) -> broadcast::Receiver<SharedEntry> {
        self.streams
            .entry(stream_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drops the stream's channel if nobody listens to it any more.
    pub fn release_stream(&self, stream_id: &StreamId) {
        self.streams
            .remove_if(stream_id, |_, tx| tx.receiver_count() == 0);
    }

    /// Notifications a subscriber may fall behind before it is failed.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of per-stream channels currently allocated.
    pub fn stream_channel_count(&self) -> usize {
        self.streams.len()
    }

    /// Terminates every subscription, present and future.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

// =============================================================================
// Public Types
// =============================================================================

/// Where a subscription starts.
///
/// `P` is [`StreamVersion`] for stream subscriptions and [`GlobalPos`] for `$all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode<P> {
    /// Replay history, then go live. `after` is exclusive: `None` replays from
    /// the beginning, `Some(p)` replays everything after `p`.
    CatchUp { after: Option<P> },
    /// Only entries committed after the subscription was created.
    Live,
}

impl<P> SubscriptionMode<P> {
    pub fn from_start() -> Self {
        SubscriptionMode::CatchUp { after: None }
    }

    pub fn after(position: P) -> Self {
        SubscriptionMode::CatchUp {
            after: Some(position),
        }
    }
}

/// An item delivered by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionMessage {
    Event(RecordedEvent),
    /// A stream was deleted. Only `$all` subscriptions see tombstones; stream
    /// subscriptions end with [`Error::StreamDeleted`] instead.
    Tombstone(StreamTombstone),
    /// Replay finished; everything after this is live.
    CaughtUp,
}

impl SubscriptionMessage {
    pub fn as_event(&self) -> Option<&RecordedEvent> {
        match self {
            SubscriptionMessage::Event(e) => Some(e),
            _ => None,
        }
    }
}

/// Cancels a subscription from anywhere, e.g. another task.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Tuning knobs passed down from the store configuration.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionSettings {
    pub catchup_batch_size: usize,
}

// =============================================================================
// Subscription
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    All,
    Stream {
        stream_id: StreamId,
        /// First version of the stream incarnation the subscription started in.
        first_visible: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    CatchingUp,
    Live,
    Terminated,
}

/// A single subscription. Poll it with [`next`](Subscription::next).
///
/// Positions below are raw `u64`s: global positions for `$all`, stream
/// versions for stream subscriptions.
pub struct Subscription {
    target: Target,
    phase: Phase,

    /// Last position delivered to the caller (or skipped as already seen).
    cursor: Option<u64>,
    /// Newest position that existed when the subscription was created.
    live_point: Option<u64>,
    /// Next position to read during catch-up.
    catch_up_from: u64,
    pending: VecDeque<LogEntry>,

    receiver: Option<broadcast::Receiver<SharedEntry>>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    shutdown_rx: watch::Receiver<bool>,

    log: Arc<GlobalLog>,
    settings: SubscriptionSettings,
}

impl Subscription {
    /// Subscribes to the global feed.
    pub fn to_all(
        log: Arc<GlobalLog>,
        mode: SubscriptionMode<GlobalPos>,
        settings: SubscriptionSettings,
    ) -> Result<Self> {
        let notifier = log.notifier().clone();
        Self::ensure_running(&notifier)?;

        let receiver = notifier.subscribe_all();
        let live_point = log.last_position().map(|p| p.as_raw());
        let after = match mode {
            SubscriptionMode::CatchUp { after } => after.map(|p| p.as_raw()),
            SubscriptionMode::Live => live_point,
        };

        debug!(?live_point, ?after, "subscribed to $all");
        Ok(Self::build(
            Target::All,
            mode_is_catch_up(&mode),
            after,
            live_point,
            receiver,
            log,
            settings,
        ))
    }

    /// Subscribes to one stream.
    ///
    /// A stream that was never written may be subscribed to; delivery starts
    /// when it is created. A soft-deleted stream fails with `StreamDeleted`.
    pub fn to_stream(
        stream_id: StreamId,
        log: Arc<GlobalLog>,
        index: &StreamIndex,
        mode: SubscriptionMode<StreamVersion>,
        settings: SubscriptionSettings,
    ) -> Result<Self> {
        stream_id.validate()?;
        let notifier = log.notifier().clone();
        Self::ensure_running(&notifier)?;

        let receiver = notifier.subscribe_stream(&stream_id);
        let info = index.get(&stream_id);

        if info.as_ref().is_some_and(|i| i.is_deleted()) {
            drop(receiver);
            notifier.release_stream(&stream_id);
            return Err(Error::StreamDeleted { stream_id });
        }

        let live_point = info.as_ref().map(|i| i.last_version.as_raw());
        let first_visible = info.as_ref().map_or(0, |i| i.first_visible.as_raw());
        let after = match mode {
            SubscriptionMode::CatchUp { after } => after.map(|v| v.as_raw()),
            SubscriptionMode::Live => live_point,
        };

        debug!(stream_id = %stream_id, ?live_point, ?after, "subscribed to stream");
        let mut subscription = Self::build(
            Target::Stream {
                stream_id,
                first_visible,
            },
            mode_is_catch_up(&mode),
            after,
            live_point,
            receiver,
            log,
            settings,
        );
        subscription.catch_up_from = subscription.catch_up_from.max(first_visible);
        Ok(subscription)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        target: Target,
        catch_up: bool,
        after: Option<u64>,
        live_point: Option<u64>,
        receiver: broadcast::Receiver<SharedEntry>,
        log: Arc<GlobalLog>,
        settings: SubscriptionSettings,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let shutdown_rx = log.notifier().shutdown_signal();

        Self {
            target,
            phase: if catch_up { Phase::CatchingUp } else { Phase::Live },
            cursor: after,
            live_point,
            catch_up_from: after.map_or(0, |p| p.saturating_add(1)),
            pending: VecDeque::new(),
            receiver: Some(receiver),
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            shutdown_rx,
            log,
            settings,
        }
    }

    fn ensure_running(notifier: &Notifier) -> Result<()> {
        if notifier.is_shut_down() {
            return Err(Error::EngineUnavailable("store has been shut down".into()));
        }
        Ok(())
    }

    /// Returns a handle that cancels this subscription from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    /// Cancels the subscription. Subsequent calls to `next` return `None`.
    pub fn cancel(&mut self) {
        self.cancel_tx.send_replace(true);
        self.terminate();
    }

    pub fn is_live(&self) -> bool {
        self.phase == Phase::Live
    }

    pub fn is_terminated(&self) -> bool {
        self.phase == Phase::Terminated
    }

    /// The subscription target: a stream id or `$all`.
    pub fn target(&self) -> &str {
        match &self.target {
            Target::All => ALL_STREAM,
            Target::Stream { stream_id, .. } => stream_id.as_str(),
        }
    }

    /// Waits for the next message.
    ///
    /// Returns `None` once the subscription is terminated. An error is
    /// returned once, right before termination.
    pub async fn next(&mut self) -> Option<Result<SubscriptionMessage>> {
        loop {
            if *self.cancel_rx.borrow() || *self.shutdown_rx.borrow() {
                self.terminate();
            }

            match self.phase {
                Phase::Terminated => return None,

                Phase::CatchingUp => {
                    if let Some(entry) = self.pending.pop_front() {
                        self.cursor = Some(self.position_of(&entry));
                        return Some(self.deliver(&entry));
                    }
                    match self.fill_catch_up().await {
                        Ok(true) => {}
                        Ok(false) => {
                            self.phase = Phase::Live;
                            debug!(target = self.target(), cursor = ?self.cursor, "subscription caught up");
                            return Some(Ok(SubscriptionMessage::CaughtUp));
                        }
                        Err(e) => {
                            warn!(target = self.target(), error = %e, "catch-up read failed");
                            self.terminate();
                            return Some(Err(e));
                        }
                    }
                }

                Phase::Live => {
                    let receiver = self.receiver.as_mut()?;
                    let wake = tokio::select! {
                        biased;
                        changed = self.cancel_rx.changed() => Wake::Signal { closed: changed.is_err() },
                        changed = self.shutdown_rx.changed() => Wake::Signal { closed: changed.is_err() },
                        received = receiver.recv() => Wake::Received(received),
                    };

                    match wake {
                        // Flags are re-checked at the top of the loop.
                        Wake::Signal { closed: false } => {}
                        Wake::Signal { closed: true } => self.terminate(),
                        Wake::Received(Ok(entry)) => {
                            if let Some(item) = self.accept_live(&entry) {
                                return Some(item);
                            }
                        }
                        Wake::Received(Err(broadcast::error::RecvError::Lagged(missed))) => {
                            warn!(target = self.target(), missed, "slow subscriber terminated");
                            let target = self.target().to_string();
                            self.terminate();
                            return Some(Err(Error::SlowConsumer { target, missed }));
                        }
                        Wake::Received(Err(broadcast::error::RecvError::Closed)) => {
                            self.terminate();
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Converts the subscription into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<SubscriptionMessage>> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|item| (item, subscription))
        })
    }

    /// Loads the next catch-up batch. Returns false when catch-up is complete.
    async fn fill_catch_up(&mut self) -> Result<bool> {
        let Some(live_point) = self.live_point else {
            return Ok(false);
        };
        if self.catch_up_from > live_point {
            return Ok(false);
        }

        let remaining = live_point - self.catch_up_from + 1;
        let batch = (self.settings.catchup_batch_size as u64).min(remaining).max(1);

        let entries: Vec<LogEntry> = match &self.target {
            Target::All => {
                self.log
                    .read_forward(GlobalPos::from_raw(self.catch_up_from), batch as usize)
                    .await?
            }
            Target::Stream { stream_id, .. } => {
                let range = VersionRange::forward(
                    StreamVersion::from_raw(self.catch_up_from),
                    StreamVersion::from_raw(self.catch_up_from + batch - 1),
                );
                self.log
                    .reader()
                    .read_stream(stream_id, range)
                    .await?
                    .into_iter()
                    .map(LogEntry::Event)
                    .collect()
            }
        };

        let Some(last) = entries.last() else {
            return Ok(false);
        };
        self.catch_up_from = self.position_of(last) + 1;
        self.pending.extend(entries);
        Ok(true)
    }

    /// Filters a live notification. `None` means skip it.
    fn accept_live(&mut self, entry: &SharedEntry) -> Option<Result<SubscriptionMessage>> {
        let stream_first_visible = match &self.target {
            Target::Stream { first_visible, .. } => Some(*first_visible),
            Target::All => None,
        };

        if let (Some(first_visible), LogEntry::Tombstone(tombstone)) =
            (stream_first_visible, entry.as_ref())
        {
            // A tombstone of an earlier incarnation of the stream.
            if tombstone.last_version.as_raw() < first_visible {
                return None;
            }
            let stream_id = tombstone.stream_id.clone();
            debug!(stream_id = %stream_id, "stream subscription ended by deletion");
            self.terminate();
            return Some(Err(Error::StreamDeleted { stream_id }));
        }

        let position = self.position_of(entry);
        let seen = self.cursor.max(self.live_point);
        if seen.is_some_and(|s| position <= s) {
            return None;
        }
        self.cursor = Some(position);
        Some(self.deliver(entry))
    }

    fn deliver(&self, entry: &LogEntry) -> Result<SubscriptionMessage> {
        Ok(match entry {
            LogEntry::Event(event) => SubscriptionMessage::Event(event.clone()),
            LogEntry::Tombstone(tombstone) => SubscriptionMessage::Tombstone(tombstone.clone()),
        })
    }

    fn position_of(&self, entry: &LogEntry) -> u64 {
        match (&self.target, entry) {
            (Target::Stream { .. }, LogEntry::Event(event)) => event.stream_version.as_raw(),
            _ => entry.global_position().as_raw(),
        }
    }

    fn terminate(&mut self) {
        if self.phase == Phase::Terminated {
            return;
        }
        self.phase = Phase::Terminated;
        self.pending.clear();
        self.release_receiver();
    }

    fn release_receiver(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            drop(receiver);
            if let Target::Stream { stream_id, .. } = &self.target {
                self.log.notifier().release_stream(stream_id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_receiver();
    }
}

enum Wake {
    Signal { closed: bool },
    Received(std::result::Result<SharedEntry, broadcast::error::RecvError>),
}

fn mode_is_catch_up<P>(mode: &SubscriptionMode<P>) -> bool {
    matches!(mode, SubscriptionMode::CatchUp { .. })
}

// =============================================================================
// Tests
// =============================================================================
