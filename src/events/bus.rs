use crate::config::EventConfig;
use crate::error::GatewayError;
use crate::events::{DebounceBuffer, RefreshKind};
use crate::registry::model::ChangeEvent;
use futures_util::StreamExt;
use rand::Rng;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Pub/sub transport for change events. Redis is the production path;
/// the memory transport backs standalone deployments and tests.
pub enum EventTransport {
    Redis(RedisTransport),
    Memory(MemoryTransport),
}

impl EventTransport {
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), GatewayError> {
        match self {
            EventTransport::Redis(t) => t.publish(channel, payload).await,
            EventTransport::Memory(t) => t.publish(channel, payload),
        }
    }
}

pub struct RedisTransport {
    conn: redis::aio::ConnectionManager,
}

impl RedisTransport {
    pub async fn connect(url: &str) -> Result<Self, GatewayError> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Loopback transport over a broadcast channel.
pub struct MemoryTransport {
    sender: broadcast::Sender<(String, String)>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, channel: &str, payload: &str) -> Result<(), GatewayError> {
        // No receivers is fine: nobody is listening in standalone mode.
        let _ = self.sender.send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, String)> {
        self.sender.subscribe()
    }
}

/// Debounced, retrying event publisher. `publish` never blocks the caller;
/// a worker task owns the debounce buffer and flushes coalesced events
/// when their window closes.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl EventPublisher {
    pub fn start(
        transport: Arc<EventTransport>,
        config: EventConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(publish_loop(transport, config, rx, shutdown));
        Self { tx }
    }

    pub fn publish(&self, event: ChangeEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("events: publisher worker gone, event dropped");
        }
    }
}

async fn publish_loop(
    transport: Arc<EventTransport>,
    config: EventConfig,
    mut rx: mpsc::UnboundedReceiver<ChangeEvent>,
    shutdown: CancellationToken,
) {
    let mut buffer = DebounceBuffer::new(Duration::from_secs(config.debounce_window_secs));
    let mut tick = tokio::time::interval(Duration::from_millis(250));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                // Flush whatever is pending before exit.
                let far_future = Instant::now() + Duration::from_secs(3600);
                for event in buffer.take_due(far_future) {
                    publish_with_retry(&transport, &config, &event).await;
                }
                tracing::info!("events: publisher stopped");
                return;
            }
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(event) => buffer.offer(event, Instant::now()),
                    None => return,
                }
            }
            _ = tick.tick() => {
                for event in buffer.take_due(Instant::now()) {
                    publish_with_retry(&transport, &config, &event).await;
                }
            }
        }
    }
}

/// Bounded exponential backoff with jitter; the event is dropped after the
/// last attempt. Local state was already updated by the time an event is
/// published, so a drop costs other instances one poll interval of
/// staleness, never correctness.
async fn publish_with_retry(transport: &EventTransport, config: &EventConfig, event: &ChangeEvent) {
    let payload = match serde_json::to_string(event) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("events: serialize failed, kind={:?}, err={}", event.kind, e);
            return;
        }
    };

    for attempt in 1..=config.publish_max_attempts {
        match transport.publish(&config.channel, &payload).await {
            Ok(()) => {
                tracing::debug!(
                    "events: published, kind={:?}, event_id={}, attempt={}",
                    event.kind,
                    event.event_id,
                    attempt
                );
                metrics::counter!("portico_events_published_total").increment(1);
                return;
            }
            Err(e) if attempt < config.publish_max_attempts => {
                let backoff = backoff_delay_ms(config.publish_base_delay_ms, attempt);
                let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
                tracing::warn!(
                    "events: publish failed, retrying, attempt={}, backoff_ms={}, err={}",
                    attempt,
                    backoff + jitter,
                    e
                );
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
            }
            Err(e) => {
                tracing::error!(
                    "events: publish failed after {} attempts, dropping, kind={:?}, err={}",
                    attempt,
                    event.kind,
                    e
                );
                metrics::counter!("portico_events_dropped_total").increment(1);
            }
        }
    }
}

/// Doubles per attempt with the shift capped, so a generous attempt
/// budget cannot overflow the delay.
fn backoff_delay_ms(base: u64, attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u64 << shift)
}

/// Reconnecting subscriber. Each received event is mapped to a refresh
/// trigger and forwarded; the event payload itself is discarded after
/// dedupe, because the registry is the only source of truth.
pub struct EventSubscriber {
    channel: String,
    tx: mpsc::UnboundedSender<RefreshKind>,
    seen: RecentIds,
}

impl EventSubscriber {
    pub fn new(channel: &str, tx: mpsc::UnboundedSender<RefreshKind>) -> Self {
        Self {
            channel: channel.to_string(),
            tx,
            seen: RecentIds::new(1024),
        }
    }

    pub async fn run_redis(mut self, redis_url: String, shutdown: CancellationToken) {
        let mut backoff_secs = 1u64;
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self.subscribe_once(&redis_url, &shutdown).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(
                        "events: subscription lost, reconnecting in {}s, err={}",
                        backoff_secs,
                        e
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                    backoff_secs = (backoff_secs * 2).min(30);
                }
            }
        }
    }

    async fn subscribe_once(
        &mut self,
        redis_url: &str,
        shutdown: &CancellationToken,
    ) -> Result<(), GatewayError> {
        let client = redis::Client::open(redis_url)?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        tracing::info!("events: subscribed, channel={}", self.channel);

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                maybe_msg = stream.next() => {
                    let msg = match maybe_msg {
                        Some(m) => m,
                        None => return Err(GatewayError::Store("pubsub stream closed".to_string())),
                    };
                    let payload: String = msg.get_payload()?;
                    self.handle_payload(&payload);
                }
            }
        }
    }

    pub async fn run_memory(
        mut self,
        mut rx: broadcast::Receiver<(String, String)>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                received = rx.recv() => {
                    match received {
                        Ok((channel, payload)) if channel == self.channel => {
                            self.handle_payload(&payload);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("events: subscriber lagged, skipped={}", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    fn handle_payload(&mut self, payload: &str) {
        let event: ChangeEvent = match serde_json::from_str(payload) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("events: unparseable event ignored, err={}", e);
                return;
            }
        };

        if !self.seen.insert(&event.event_id) {
            tracing::debug!("events: duplicate event ignored, event_id={}", event.event_id);
            return;
        }

        let kind = RefreshKind::for_event(event.kind);
        tracing::info!(
            "events: refresh triggered, kind={:?}, event_id={}, routes={}, services={}, clients={}",
            event.kind,
            event.event_id,
            event.routes.len(),
            event.services.len(),
            event.clients.len()
        );
        metrics::counter!("portico_events_received_total").increment(1);
        let _ = self.tx.send(kind);
    }
}

/// Bounded set of recently-seen event ids for at-least-once dedupe.
struct RecentIds {
    order: VecDeque<String>,
    set: HashSet<String>,
    cap: usize,
}

impl RecentIds {
    fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(cap),
            set: HashSet::with_capacity(cap),
            cap,
        }
    }

    /// Returns false if the id was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.order.len() == self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.set.insert(id.to_string());
        true
    }
}
