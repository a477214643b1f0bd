//! Stream Broadcaster - Shared Ticker Fan-out to SSE Clients
//!
//! Owns the bounded set of open price streams. Each connection moves
//! through `Opening -> Streaming -> Closed`:
//! - Opening: admission control against `max_connections`, no queuing
//! - Streaming: an initial reading on connect, then one reading per
//!   global tick, pushed to every open connection
//! - Closed: client disconnect, connection timeout, or shutdown
//!
//! Ticking is centralized so upstream traffic stays constant no matter
//! how many clients listen. The ticker starts when the first connection
//! opens and stops when the last one closes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::metrics::MetricsRegistry;
use crate::config::StreamConfig;
use crate::domain::price::PriceReading;
use crate::error::PriceFeedError;
use crate::usecases::price_service::PriceService;

pub type ConnectionId = Uuid;

/// Why a connection left the `Streaming` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnected,
    Timeout,
    Shutdown,
}

/// Broadcaster tuning.
#[derive(Debug, Clone)]
pub struct BroadcasterSettings {
    /// Shared ticker period.
    pub tick_interval: Duration,
    /// Admission ceiling.
    pub max_connections: usize,
    /// Lifetime of one stream, measured from open.
    pub connection_timeout: Duration,
    /// Budget for pushing one reading to one connection.
    pub push_timeout: Duration,
    /// Advertised on admission refusal.
    pub retry_after_secs: u64,
    /// Per-connection channel capacity.
    pub buffer_size: usize,
}

impl Default for BroadcasterSettings {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for BroadcasterSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            max_connections: config.max_connections,
            connection_timeout: config.connection_timeout(),
            push_timeout: config.push_timeout(),
            retry_after_secs: config.retry_after_secs,
            buffer_size: config.buffer_size.max(1),
        }
    }
}

/// Public view of one open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub opened_at: DateTime<Utc>,
    pub last_sent_at: Option<DateTime<Utc>>,
}

/// Broadcaster counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcasterStats {
    pub connections: usize,
    pub ticker_running: bool,
    pub ticker_starts: u64,
    pub ticker_stops: u64,
}

struct ClientConnection {
    info: ConnectionInfo,
    tx: mpsc::Sender<PriceReading>,
}

struct TickerHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TickerHandle {
    /// Signal the loop to exit after any tick in progress. The in-flight
    /// upstream call is left to finish on its own timeout.
    fn stop(self) {
        let _ = self.stop_tx.send(());
        drop(self.task);
    }
}

#[derive(Default)]
struct BroadcasterState {
    connections: HashMap<ConnectionId, ClientConnection>,
    ticker: Option<TickerHandle>,
    ticker_starts: u64,
    ticker_stops: u64,
    shut_down: bool,
}

impl BroadcasterState {
    /// Detach the ticker if the set just became empty.
    fn take_idle_ticker(&mut self) -> Option<TickerHandle> {
        if !self.connections.is_empty() {
            return None;
        }
        let ticker = self.ticker.take();
        if ticker.is_some() {
            self.ticker_stops += 1;
        }
        ticker
    }
}

/// Fans validated prices out to all open streams.
pub struct Broadcaster {
    service: Arc<PriceService>,
    metrics: Arc<MetricsRegistry>,
    settings: BroadcasterSettings,
    /// The only lock guarding the connection set and ticker.
    state: Mutex<BroadcasterState>,
}

impl Broadcaster {
    pub fn new(
        service: Arc<PriceService>,
        metrics: Arc<MetricsRegistry>,
        settings: BroadcasterSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            service,
            metrics,
            settings,
            state: Mutex::new(BroadcasterState::default()),
        })
    }

    pub fn settings(&self) -> &BroadcasterSettings {
        &self.settings
    }

    pub fn stats(&self) -> BroadcasterStats {
        let state = self.state.lock();
        BroadcasterStats {
            connections: state.connections.len(),
            ticker_running: state.ticker.is_some(),
            ticker_starts: state.ticker_starts,
            ticker_stops: state.ticker_stops,
        }
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.state
            .lock()
            .connections
            .values()
            .map(|c| c.info)
            .collect()
    }

    /// Admit a new stream and push its initial reading.
    ///
    /// Admission is decided synchronously under the state lock; a refused
    /// request creates no connection.
    #[instrument(skip(self))]
    pub async fn open(self: &Arc<Self>) -> Result<Subscription, PriceFeedError> {
        let (tx, rx) = mpsc::channel(self.settings.buffer_size);
        let id = Uuid::new_v4();

        let active = {
            let mut state = self.state.lock();
            if state.shut_down || state.connections.len() >= self.settings.max_connections {
                drop(state);
                self.metrics.stream_rejections.inc();
                warn!(
                    max = self.settings.max_connections,
                    "Stream refused: connection limit exceeded"
                );
                return Err(PriceFeedError::ConnectionLimitExceeded {
                    max: self.settings.max_connections,
                    retry_after_secs: self.settings.retry_after_secs,
                });
            }

            state.connections.insert(
                id,
                ClientConnection {
                    info: ConnectionInfo {
                        id,
                        opened_at: Utc::now(),
                        last_sent_at: None,
                    },
                    tx: tx.clone(),
                },
            );

            if state.ticker.is_none() {
                state.ticker = Some(self.spawn_ticker());
                state.ticker_starts += 1;
                info!(
                    interval_ms = self.settings.tick_interval.as_millis(),
                    "Price updates started"
                );
            }

            state.connections.len()
        };

        self.metrics
            .active_connections
            .set(i64::try_from(active).unwrap_or(i64::MAX));
        info!(connection = %id, active, "Stream client connected");

        // Guard first, so a cancelled open still unregisters.
        let subscription =
            Subscription::new(id, rx, Arc::clone(self), self.settings.connection_timeout);

        let reading = self.service.current_price().await;
        if self.push(id, &tx, reading).await {
            self.metrics.record_served("stream", &reading, 1);
        }

        Ok(subscription)
    }

    /// Run the chain once and push the reading to every open connection.
    ///
    /// Returns the number of connections that accepted the reading.
    pub async fn tick(&self) -> usize {
        self.metrics.ticks.inc();
        let reading = self.service.current_price().await;
        let delivered = self.broadcast(reading).await;
        debug!(
            price = reading.price,
            source = %reading.source,
            delivered,
            "Tick broadcast"
        );
        delivered
    }

    /// Push `reading` to all connections concurrently, each bounded by
    /// the push timeout so one slow client cannot hold up the rest.
    pub async fn broadcast(&self, reading: PriceReading) -> usize {
        let targets: Vec<(ConnectionId, mpsc::Sender<PriceReading>)> = self
            .state
            .lock()
            .connections
            .iter()
            .map(|(id, c)| (*id, c.tx.clone()))
            .collect();

        if targets.is_empty() {
            return 0;
        }

        let timeout = self.settings.push_timeout;
        let results = join_all(targets.into_iter().map(|(id, tx)| async move {
            (id, tx.send_timeout(reading, timeout).await)
        }))
        .await;

        let now = Utc::now();
        let mut delivered = 0;
        let mut gone = Vec::new();
        {
            let mut state = self.state.lock();
            for (id, result) in results {
                match result {
                    Ok(()) => {
                        delivered += 1;
                        if let Some(conn) = state.connections.get_mut(&id) {
                            conn.info.last_sent_at = Some(now);
                        }
                    }
                    Err(SendTimeoutError::Timeout(_)) => {
                        warn!(connection = %id, "Push timed out, slow client skipped");
                    }
                    Err(SendTimeoutError::Closed(_)) => gone.push(id),
                }
            }
        }

        for id in gone {
            self.close(id, CloseReason::ClientDisconnected);
        }

        self.metrics
            .record_served("stream", &reading, delivered as u64);
        delivered
    }

    /// Remove a connection. Returns false if it was already gone.
    pub fn close(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let (active, ticker) = {
            let mut state = self.state.lock();
            if state.connections.remove(&id).is_none() {
                return false;
            }
            (state.connections.len(), state.take_idle_ticker())
        };

        self.metrics
            .active_connections
            .set(i64::try_from(active).unwrap_or(i64::MAX));
        info!(connection = %id, ?reason, active, "Stream client closed");

        if let Some(ticker) = ticker {
            ticker.stop();
            info!("Price updates stopped");
        }
        true
    }

    /// Close every connection, stop the ticker and refuse new streams.
    pub fn shutdown(&self) {
        let (closed, ticker) = {
            let mut state = self.state.lock();
            state.shut_down = true;
            // Dropping the senders ends every subscription stream.
            let closed = state.connections.drain().count();
            (closed, state.take_idle_ticker())
        };

        self.metrics.active_connections.set(0);
        if let Some(ticker) = ticker {
            ticker.stop();
        }
        info!(closed, reason = ?CloseReason::Shutdown, "Broadcaster shut down");
    }

    async fn push(
        &self,
        id: ConnectionId,
        tx: &mpsc::Sender<PriceReading>,
        reading: PriceReading,
    ) -> bool {
        match tx.send_timeout(reading, self.settings.push_timeout).await {
            Ok(()) => {
                if let Some(conn) = self.state.lock().connections.get_mut(&id) {
                    conn.info.last_sent_at = Some(Utc::now());
                }
                true
            }
            Err(e) => {
                debug!(connection = %id, error = %e, "Initial push failed");
                false
            }
        }
    }

    /// Called with the state lock held.
    fn spawn_ticker(self: &Arc<Self>) -> TickerHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.settings.tick_interval;

        let task = tokio::spawn(async move {
            // Connect already pushed a reading; first tick one period later.
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        let Some(broadcaster) = weak.upgrade() else { break };
                        broadcaster.tick().await;
                    }
                }
            }
            debug!("Ticker task exited");
        });

        TickerHandle { stop_tx, task }
    }
}

/// Receiving end of one price stream.
///
/// Yields readings until the connection times out or the broadcaster
/// drops it. Dropping the subscription (client went away) closes the
/// connection.
pub struct Subscription {
    id: ConnectionId,
    rx: mpsc::Receiver<PriceReading>,
    deadline: Pin<Box<Sleep>>,
    broadcaster: Arc<Broadcaster>,
    finished: bool,
}

impl Subscription {
    fn new(
        id: ConnectionId,
        rx: mpsc::Receiver<PriceReading>,
        broadcaster: Arc<Broadcaster>,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            rx,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            broadcaster,
            finished: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Stream for Subscription {
    type Item = PriceReading;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            this.finished = true;
            this.broadcaster.close(this.id, CloseReason::Timeout);
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(reading)) => Poll::Ready(Some(reading)),
            Poll::Ready(None) => {
                // Sender dropped: removed by shutdown.
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster
            .close(self.id, CloseReason::ClientDisconnected);
    }
}
