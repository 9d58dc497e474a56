//! The ingestion engine. Keeps one live connection to the chain and turns
//! it into a de-duplicated, checkpointed event stream.
//!
//! # Bootstrapping
//! Load the checkpoint and acquire the first client. Either failing is fatal.
//!
//! # Backfilling
//! Register live listeners first (their events buffer), then scan from the
//! cursor to the head observed on entry in `batch_size` windows. Per window:
//! query every kind → normalize → sort by `(position, sequence_hint)` →
//! publish → persist the window's upper bound.
//!
//! # Live
//! Publish listener events above the backfill horizon and persist each
//! event's position. A heartbeat task probes the client; a failed probe or a
//! listener stream ending moves the engine to `Reconnecting`.
//!
//! # Reconnecting
//! Drop the whole connection context, acquire a new client with a fixed retry
//! delay, optionally back-fill the gap, and resume `Live`.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::checkpoint::{CheckpointManager, CheckpointStore};
use crate::client::{ChainClient, ChainConnector, ListenerId};
use crate::config::{EngineConfig, EngineState};
use crate::cursor::Cursor;
use crate::error::StreamError;
use crate::normalize::normalize;
use crate::router::MessageRouter;
use crate::types::{EventKind, NormalizedEvent, RawEvent};

/// Counters exposed for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineMetrics {
    pub events_emitted: u64,
    pub malformed_skipped: u64,
    pub duplicates_dropped: u64,
    pub backfill_windows: u64,
    pub reconnections: u64,
    pub checkpoint_failures: u64,
}

/// A connection failure reported by the heartbeat task.
#[derive(Debug)]
struct ConnectionFault {
    generation: u64,
    error: StreamError,
}

type TaggedStream = BoxStream<'static, Option<(EventKind, RawEvent)>>;

/// Everything tied to one client connection. Replaced as a unit on reconnect.
struct LiveContext {
    generation: u64,
    client: Arc<dyn ChainClient>,
    listeners: Vec<ListenerId>,
    events: SelectAll<TaggedStream>,
    heartbeat: Option<JoinHandle<()>>,
    /// Live events at or below this height were already emitted by backfill.
    horizon: Option<u64>,
}

enum LiveExit {
    Shutdown,
    ConnectionLost(StreamError),
}

/// Keys of recently emitted events, bucketed by position.
#[derive(Default)]
struct RecentEvents {
    by_position: BTreeMap<u64, HashSet<String>>,
}

impl RecentEvents {
    /// Returns `false` if the event was already emitted.
    fn insert(&mut self, event: &NormalizedEvent) -> bool {
        self.by_position
            .entry(event.position)
            .or_default()
            .insert(event.sequence_hint.clone())
    }

    fn prune_below(&mut self, position: u64) {
        self.by_position = self.by_position.split_off(&position);
    }
}

/// Control handle for a spawned engine.
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<EngineState>,
    metrics: Arc<Mutex<EngineMetrics>>,
    task: JoinHandle<Result<(), StreamError>>,
}

impl EngineHandle {
    /// Current engine state.
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Watch channel following state transitions.
    pub fn state_watch(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    /// Snapshot of the engine counters.
    pub fn metrics(&self) -> EngineMetrics {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Ask the engine to shut down. Safe to call repeatedly and from any state.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait for the engine task to finish.
    pub async fn join(self) -> Result<(), StreamError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(StreamError::Aborted {
                reason: e.to_string(),
            }),
        }
    }

    /// Shut down and wait for completion.
    pub async fn stop(self) -> Result<(), StreamError> {
        self.shutdown();
        self.join().await
    }
}

/// The ingestion state machine. Runs as a single task.
pub struct IngestionEngine {
    config: EngineConfig,
    connector: Arc<dyn ChainConnector>,
    checkpoint: CheckpointManager,
    router: MessageRouter,
    cursor: Option<Cursor>,
    /// Set once the first back-fill to the head has completed.
    caught_up: bool,
    recent: RecentEvents,
    generation: u64,
    state: watch::Sender<EngineState>,
    metrics: Arc<Mutex<EngineMetrics>>,
}

impl IngestionEngine {
    pub fn new(
        config: EngineConfig,
        connector: Arc<dyn ChainConnector>,
        store: Arc<dyn CheckpointStore>,
        router: MessageRouter,
    ) -> Self {
        let checkpoint = CheckpointManager::new(store, config.stream_id.clone());
        let (state, _) = watch::channel(EngineState::Bootstrapping);
        Self {
            config,
            connector,
            checkpoint,
            router,
            cursor: None,
            caught_up: false,
            recent: RecentEvents::default(),
            generation: 0,
            state,
            metrics: Arc::new(Mutex::new(EngineMetrics::default())),
        }
    }

    /// The router events are published to.
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run the engine on a new Tokio task.
    ///
    /// Dropping the returned handle also stops the engine.
    pub fn spawn(self) -> EngineHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = self.state.subscribe();
        let metrics = Arc::clone(&self.metrics);
        let task = tokio::spawn(self.run(shutdown_rx));
        EngineHandle {
            shutdown,
            state,
            metrics,
            task,
        }
    }

    /// Run until `shutdown` turns `true` (or its sender is dropped), or a
    /// fatal error occurs.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), StreamError> {
        let result = self.drive(&mut shutdown).await;
        if let Err(e) = &result {
            tracing::error!(stream = %self.config.stream_id, error = %e, "engine failed");
        }

        self.set_state(EngineState::ShuttingDown);
        if let Err(e) = self.checkpoint.close().await {
            tracing::warn!(error = %e, "failed to release checkpoint store");
        }
        self.set_state(EngineState::Stopped);
        tracing::info!(stream = %self.config.stream_id, "engine stopped");
        result
    }

    async fn drive(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), StreamError> {
        self.set_state(EngineState::Bootstrapping);

        match self.checkpoint.load().await? {
            Some(cp) => {
                tracing::info!(
                    stream = %cp.stream_id,
                    position = cp.last_processed_position,
                    "resuming from checkpoint"
                );
                self.cursor = Some(Cursor::complete(cp.last_processed_position));
            }
            None => tracing::info!(
                stream = %self.config.stream_id,
                "no checkpoint stored, starting at chain head"
            ),
        }

        let timeout = self.config.request_timeout();
        let mut client = Some(with_deadline(timeout, "connect", self.connector.connect()).await?);
        let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();

        while let Some(current) = client.take() {
            if shutdown_requested(shutdown) {
                close_client(current.as_ref(), timeout).await;
                return Ok(());
            }

            self.generation += 1;
            let mut ctx = match self.establish(current, &fault_tx, shutdown).await {
                Ok(Some(ctx)) => ctx,
                Ok(None) => return Ok(()),
                Err(e) if e.is_transient() => {
                    tracing::warn!(generation = self.generation, error = %e, "connection setup failed");
                    self.bump(|m| m.reconnections += 1);
                    client = self.reconnect(shutdown, true).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.set_state(EngineState::Live);
            tracing::info!(generation = ctx.generation, horizon = ?ctx.horizon, "live");

            let exit = self.live(&mut ctx, &mut fault_rx, shutdown).await;
            self.teardown(ctx).await;

            match exit {
                LiveExit::Shutdown => return Ok(()),
                LiveExit::ConnectionLost(e) => {
                    tracing::warn!(generation = self.generation, error = %e, "connection lost");
                    self.bump(|m| m.reconnections += 1);
                    client = self.reconnect(shutdown, false).await;
                }
            }
        }
        Ok(())
    }

    /// Register listeners, back-fill, and start the heartbeat for a new
    /// client. Returns `None` if shutdown was requested mid-way.
    async fn establish(
        &mut self,
        client: Arc<dyn ChainClient>,
        faults: &mpsc::UnboundedSender<ConnectionFault>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Option<LiveContext>, StreamError> {
        let mut ctx = LiveContext {
            generation: self.generation,
            client,
            listeners: Vec::with_capacity(EventKind::ALL.len()),
            events: SelectAll::new(),
            heartbeat: None,
            horizon: None,
        };

        if let Err(e) = self.register_listeners(&mut ctx).await {
            self.teardown(ctx).await;
            return Err(e);
        }

        if !self.caught_up || self.config.backfill_on_reconnect {
            self.set_state(EngineState::Backfilling);
            match self.backfill(ctx.client.as_ref(), shutdown).await {
                Ok(Some(horizon)) => {
                    ctx.horizon = Some(horizon);
                    self.caught_up = true;
                }
                Ok(None) => {
                    self.teardown(ctx).await;
                    return Ok(None);
                }
                Err(e) => {
                    self.teardown(ctx).await;
                    return Err(e);
                }
            }
        }

        ctx.heartbeat = Some(spawn_heartbeat(
            Arc::clone(&ctx.client),
            ctx.generation,
            self.config.heartbeat_interval(),
            self.config.request_timeout(),
            faults.clone(),
        ));
        Ok(Some(ctx))
    }

    async fn register_listeners(&self, ctx: &mut LiveContext) -> Result<(), StreamError> {
        let timeout = self.config.request_timeout();
        for kind in EventKind::ALL {
            let sub = with_deadline(timeout, "subscribe_live", ctx.client.subscribe_live(kind)).await?;
            tracing::debug!(generation = ctx.generation, %kind, listener = %sub.id, "listener registered");
            ctx.listeners.push(sub.id);
            let tagged: TaggedStream = sub
                .events
                .map(move |raw| Some((kind, raw)))
                .chain(stream::once(async { None }))
                .boxed();
            ctx.events.push(tagged);
        }
        Ok(())
    }

    /// Scan `[cursor, head]` window by window.
    ///
    /// Returns the horizon (the highest position the scan vouches for), or
    /// `None` when interrupted by shutdown.
    async fn backfill(
        &mut self,
        client: &dyn ChainClient,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Option<u64>, StreamError> {
        let timeout = self.config.request_timeout();
        let batch = self.config.batch_size.max(1);
        let head = with_deadline(timeout, "current_head", client.current_head()).await?;

        // First run without a checkpoint: scan the head block only.
        let cursor = *self.cursor.get_or_insert(Cursor::partial(head));
        let from = cursor.next_block();
        let horizon = head.max(from.saturating_sub(1));

        if from > head {
            tracing::info!(from, head, "no historical blocks to process");
            return Ok(Some(horizon));
        }
        tracing::info!(from, head, batch, "starting backfill");

        let mut start = from;
        loop {
            if shutdown_requested(shutdown) {
                return Ok(None);
            }
            let end = start.saturating_add(batch - 1).min(head);

            let (transfers, approvals) = futures::try_join!(
                with_deadline(timeout, "query_range", client.query_range(EventKind::Transfer, start, end)),
                with_deadline(timeout, "query_range", client.query_range(EventKind::Approval, start, end)),
            )?;

            let mut events: Vec<NormalizedEvent> = Vec::with_capacity(transfers.len() + approvals.len());
            for (kind, raws) in [(EventKind::Transfer, transfers), (EventKind::Approval, approvals)] {
                for raw in &raws {
                    if let Some(event) = self.normalize_or_skip(kind, raw) {
                        events.push(event);
                    }
                }
            }
            events.sort_by(NormalizedEvent::delivery_order);

            let emitted = events.iter().filter(|e| self.emit(e)).count();
            self.advance_cursor(|c| c.advance_complete(end));
            self.persist(end).await;
            self.bump(|m| m.backfill_windows += 1);

            tracing::info!(from = start, to = end, head, emitted, "backfill window complete");

            match end.checked_add(1) {
                Some(next) if next <= head => start = next,
                _ => break,
            }
        }

        tracing::info!(at = head, "backfill complete");
        Ok(Some(horizon))
    }

    async fn live(
        &mut self,
        ctx: &mut LiveContext,
        faults: &mut mpsc::UnboundedReceiver<ConnectionFault>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LiveExit {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_signal(shutdown) => return LiveExit::Shutdown,
                Some(fault) = faults.recv() => {
                    if fault.generation != ctx.generation {
                        tracing::debug!(
                            stale = fault.generation,
                            current = ctx.generation,
                            error = %fault.error,
                            "ignoring fault from a replaced connection"
                        );
                        continue;
                    }
                    return LiveExit::ConnectionLost(fault.error);
                }
                item = ctx.events.next() => match item {
                    Some(Some((kind, raw))) => self.on_live_event(ctx.horizon, kind, raw).await,
                    Some(None) | None => {
                        return LiveExit::ConnectionLost(StreamError::Source(
                            "live listener stream ended".into(),
                        ))
                    }
                },
            }
        }
    }

    async fn on_live_event(&mut self, horizon: Option<u64>, kind: EventKind, raw: RawEvent) {
        let Some(event) = self.normalize_or_skip(kind, &raw) else {
            return;
        };
        if horizon.is_some_and(|h| event.position <= h) {
            tracing::trace!(position = event.position, "live event already covered by backfill");
            return;
        }
        if !self.emit(&event) {
            return;
        }
        self.advance_cursor(|c| c.advance_partial(event.position));
        self.persist(event.position).await;
    }

    fn normalize_or_skip(&self, kind: EventKind, raw: &RawEvent) -> Option<NormalizedEvent> {
        match normalize(kind, raw) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(tx = %raw.tx_hash, error = %e, "skipping malformed event");
                self.bump(|m| m.malformed_skipped += 1);
                None
            }
        }
    }

    /// Publish unless already emitted during this run.
    fn emit(&mut self, event: &NormalizedEvent) -> bool {
        if !self.recent.insert(event) {
            tracing::debug!(
                position = event.position,
                hint = %event.sequence_hint,
                "dropping duplicate event"
            );
            self.bump(|m| m.duplicates_dropped += 1);
            return false;
        }
        let receivers = self.router.publish_event(event);
        tracing::debug!(
            kind = %event.kind,
            position = event.position,
            hint = %event.sequence_hint,
            receivers,
            "event published"
        );
        self.bump(|m| m.events_emitted += 1);
        true
    }

    fn advance_cursor(&mut self, step: impl FnOnce(&mut Cursor)) {
        if let Some(cursor) = self.cursor.as_mut() {
            step(cursor);
            self.recent.prune_below(cursor.position);
        }
    }

    /// Persist a checkpoint. Failures are logged; the next write retries.
    async fn persist(&mut self, position: u64) {
        if let Err(e) = self.checkpoint.advance(position).await {
            tracing::warn!(position, error = %e, "checkpoint write failed, retrying on next event");
            self.bump(|m| m.checkpoint_failures += 1);
        }
    }

    /// Acquire a new client, retrying with a fixed delay until shutdown.
    async fn reconnect(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        delay_first: bool,
    ) -> Option<Arc<dyn ChainClient>> {
        self.set_state(EngineState::Reconnecting);
        let delay = self.config.reconnect_delay();
        let timeout = self.config.request_timeout();

        if delay_first && !pause(delay, shutdown).await {
            return None;
        }

        let mut attempt = 0u32;
        loop {
            if shutdown_requested(shutdown) {
                return None;
            }
            attempt += 1;
            match with_deadline(timeout, "connect", self.connector.connect()).await {
                Ok(client) => {
                    tracing::info!(attempt, "reconnected");
                    return Some(client);
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "reconnect failed");
                }
            }
            if !pause(delay, shutdown).await {
                return None;
            }
        }
    }

    /// Deregister listeners and release the client.
    async fn teardown(&self, ctx: LiveContext) {
        let timeout = self.config.request_timeout();
        if let Some(heartbeat) = ctx.heartbeat {
            heartbeat.abort();
        }
        for id in &ctx.listeners {
            if let Err(e) = with_deadline(timeout, "unsubscribe", ctx.client.unsubscribe(id)).await {
                tracing::debug!(listener = %id, error = %e, "listener removal failed");
            }
        }
        close_client(ctx.client.as_ref(), timeout).await;
        tracing::debug!(generation = ctx.generation, "connection context released");
    }

    fn set_state(&self, state: EngineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "engine state");
        }
    }

    fn bump(&self, f: impl FnOnce(&mut EngineMetrics)) {
        f(&mut self.metrics.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

fn spawn_heartbeat(
    client: Arc<dyn ChainClient>,
    generation: u64,
    interval: Duration,
    timeout: Duration,
    faults: mpsc::UnboundedSender<ConnectionFault>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = interval.max(Duration::from_millis(1));
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match with_deadline(timeout, "probe", client.probe()).await {
                Ok(()) => tracing::trace!(generation, "heartbeat ok"),
                Err(error) => {
                    tracing::warn!(generation, error = %error, "heartbeat probe failed");
                    let _ = faults.send(ConnectionFault { generation, error });
                    return;
                }
            }
        }
    })
}

async fn close_client(client: &dyn ChainClient, timeout: Duration) {
    if time::timeout(timeout, client.close()).await.is_err() {
        tracing::debug!("client close timed out");
    }
}

/// Apply a deadline to a remote call; expiry is a transient source error.
async fn with_deadline<T>(
    timeout: Duration,
    operation: &'static str,
    fut: impl Future<Output = Result<T, StreamError>>,
) -> Result<T, StreamError> {
    match time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StreamError::Timeout {
            operation,
            ms: timeout.as_millis() as u64,
        }),
    }
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Sleep for `delay`; returns `false` if shutdown was requested meanwhile.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown_signal(shutdown) => false,
        _ = time::sleep(delay) => !shutdown_requested(shutdown),
    }
}
