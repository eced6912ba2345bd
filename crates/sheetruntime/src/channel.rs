//! Realtime status channel: publishes execution and node transitions to
//! subscribers, reconnecting dropped subscriptions in the background.

use crate::config::ChannelConfig;
use async_trait::async_trait;
use futures::Stream;
use sheetcore::{EntityId, EventSink, EventStatus, ExecutionId, StatusEvent, WorkflowRef};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type EventStream = Pin<Box<dyn Stream<Item = StatusEvent> + Send>>;

#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),
}

/// Which events a subscription wants
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    All,
    Workflow(WorkflowRef),
    Execution(ExecutionId),
    Entity(EntityId),
}

impl ChannelKey {
    pub fn matches(&self, event: &StatusEvent) -> bool {
        match self {
            ChannelKey::All => true,
            ChannelKey::Workflow(w) => event.workflow.as_ref() == Some(w),
            ChannelKey::Execution(id) => event.execution_id == Some(*id),
            ChannelKey::Entity(entity) => &event.entity_id == entity,
        }
    }
}

/// Carries status events between publishers and subscribers
#[async_trait]
pub trait StatusTransport: Send + Sync {
    fn publish(&self, event: StatusEvent) -> Result<(), ChannelError>;

    /// Open a stream of events matching `key`. The stream ending means the
    /// connection dropped.
    async fn connect(&self, key: &ChannelKey) -> Result<EventStream, ChannelError>;
}

/// In-process transport on a broadcast channel
pub struct LocalTransport {
    sender: broadcast::Sender<StatusEvent>,
}

impl LocalTransport {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

#[async_trait]
impl StatusTransport for LocalTransport {
    fn publish(&self, event: StatusEvent) -> Result<(), ChannelError> {
        // Nobody listening is not an error
        let _ = self.sender.send(event);
        Ok(())
    }

    async fn connect(&self, key: &ChannelKey) -> Result<EventStream, ChannelError> {
        let key = key.clone();
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(move |item| match item {
            Ok(event) if key.matches(&event) => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "status subscriber lagging; events dropped");
                None
            }
        });
        Ok(Box::pin(stream))
    }
}

struct Pump {
    sender: broadcast::Sender<StatusEvent>,
    cancel: CancellationToken,
    // Live `Subscription` handles attached to this pump
    handles: AtomicUsize,
}

type PumpMap = Arc<Mutex<HashMap<(ChannelKey, String), Arc<Pump>>>>;

fn lock(map: &PumpMap) -> MutexGuard<'_, HashMap<(ChannelKey, String), Arc<Pump>>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Publishes status events and hands out subscriptions
pub struct StatusChannel {
    transport: Arc<dyn StatusTransport>,
    config: ChannelConfig,
    pumps: PumpMap,
}

impl StatusChannel {
    pub fn new(transport: Arc<dyn StatusTransport>, config: ChannelConfig) -> Self {
        Self {
            transport,
            config,
            pumps: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Channel over a fresh in-process transport
    pub fn local(config: ChannelConfig) -> Self {
        let transport = Arc::new(LocalTransport::new(config.event_buffer_size));
        Self::new(transport, config)
    }

    pub fn emit(&self, event: StatusEvent) {
        if let Err(e) = self.transport.publish(event) {
            warn!(error = %e, "status event not delivered");
        }
    }

    /// Subscribe `subscriber` to events matching `key`.
    ///
    /// Calling again with the same pair attaches to the existing connection
    /// instead of opening a second one. Returns once the first connection
    /// attempt has finished, so events published afterwards are seen.
    pub async fn subscribe(&self, key: ChannelKey, subscriber: impl Into<String>) -> Subscription {
        let subscriber = subscriber.into();
        let map_key = (key.clone(), subscriber.clone());

        let (pump, ready) = {
            let mut pumps = lock(&self.pumps);
            match pumps.get(&map_key) {
                Some(pump) if !pump.cancel.is_cancelled() => {
                    pump.handles.fetch_add(1, Ordering::SeqCst);
                    (Arc::clone(pump), None)
                }
                _ => {
                    let (sender, _) = broadcast::channel(self.config.event_buffer_size);
                    let pump = Arc::new(Pump {
                        sender,
                        cancel: CancellationToken::new(),
                        handles: AtomicUsize::new(0),
                    });
                    pump.handles.fetch_add(1, Ordering::SeqCst);
                    pumps.insert(map_key.clone(), Arc::clone(&pump));
                    let (ready_tx, ready_rx) = oneshot::channel();
                    tokio::spawn(run_pump(
                        Arc::clone(&self.transport),
                        key.clone(),
                        subscriber.clone(),
                        pump.sender.clone(),
                        pump.cancel.clone(),
                        self.config.reconnect_delay(),
                        ready_tx,
                    ));
                    (pump, Some(ready_rx))
                }
            }
        };

        let receiver = pump.sender.subscribe();
        if let Some(ready) = ready {
            let _ = ready.await;
        }

        Subscription {
            key,
            subscriber,
            receiver,
            pump,
            pumps: Arc::clone(&self.pumps),
        }
    }

    /// Number of live (key, subscriber) connections
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.pumps)
            .values()
            .filter(|p| !p.cancel.is_cancelled())
            .count()
    }

    /// Close every subscription
    pub fn close_all(&self) {
        for (_, pump) in lock(&self.pumps).drain() {
            pump.cancel.cancel();
        }
    }
}

impl EventSink for StatusChannel {
    fn publish(&self, event: StatusEvent) {
        self.emit(event);
    }
}

async fn run_pump(
    transport: Arc<dyn StatusTransport>,
    key: ChannelKey,
    subscriber: String,
    sender: broadcast::Sender<StatusEvent>,
    cancel: CancellationToken,
    reconnect_delay: Duration,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = transport.connect(&key) => result,
        };
        if let Some(tx) = ready.take() {
            let _ = tx.send(());
        }

        match connected {
            Ok(mut stream) => {
                debug!(subscriber = %subscriber, key = ?key, "status subscription established");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = stream.next() => match next {
                            Some(event) => {
                                let _ = sender.send(event);
                            }
                            None => break,
                        },
                    }
                }
                warn!(
                    subscriber = %subscriber,
                    delay_ms = reconnect_delay.as_millis() as u64,
                    "status subscription dropped; reconnecting"
                );
            }
            Err(e) => {
                warn!(
                    subscriber = %subscriber,
                    error = %e,
                    delay_ms = reconnect_delay.as_millis() as u64,
                    "status subscription failed; retrying"
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }
    info!(subscriber = %subscriber, "status subscription closed");
}

/// Handle to a live subscription.
///
/// Delivery is at-least-once; pair with [`StatusTracker`] to drop repeats.
pub struct Subscription {
    key: ChannelKey,
    subscriber: String,
    receiver: broadcast::Receiver<StatusEvent>,
    pump: Arc<Pump>,
    pumps: PumpMap,
}

impl Subscription {
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    pub fn is_closed(&self) -> bool {
        self.pump.cancel.is_cancelled()
    }

    /// Next event, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        loop {
            tokio::select! {
                biased;
                result = self.receiver.recv() => match result {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(subscriber = %self.subscriber, skipped, "subscription lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                _ = self.pump.cancel.cancelled() => return None,
            }
        }
    }

    /// Turn the handle into a stream of events
    pub fn into_stream(self) -> impl Stream<Item = StatusEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }

    /// Close the connection shared by every handle for this (key, subscriber).
    pub fn close(self) {
        self.pump.cancel.cancel();
        self.forget(&mut lock(&self.pumps));
    }

    fn forget(&self, pumps: &mut HashMap<(ChannelKey, String), Arc<Pump>>) {
        let map_key = (self.key.clone(), self.subscriber.clone());
        if pumps
            .get(&map_key)
            .is_some_and(|p| Arc::ptr_eq(p, &self.pump))
        {
            pumps.remove(&map_key);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Under the map lock so subscribe never attaches to a dying pump
        let mut pumps = lock(&self.pumps);
        if self.pump.handles.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.pump.cancel.cancel();
            self.forget(&mut pumps);
        }
    }
}

/// Consumer-side filter that drops events repeating the last-seen state
#[derive(Debug, Default)]
pub struct StatusTracker {
    last: HashMap<(EntityId, Option<ExecutionId>), Seen>,
}

#[derive(Debug, PartialEq)]
struct Seen {
    status: EventStatus,
    progress: Option<u64>,
    message: Option<String>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the event changes what is known about its entity.
    pub fn observe(&mut self, event: &StatusEvent) -> bool {
        let seen = Seen {
            status: event.status,
            progress: event.progress.map(f64::to_bits),
            message: event.message.clone(),
        };
        let key = (event.entity_id.clone(), event.execution_id);
        if self.last.get(&key) == Some(&seen) {
            return false;
        }
        self.last.insert(key, seen);
        true
    }

    pub fn status_of(&self, entity: &EntityId, execution: Option<ExecutionId>) -> Option<EventStatus> {
        self.last
            .get(&(entity.clone(), execution))
            .map(|s| s.status)
    }
}
