use async_trait::async_trait;
use conductor_core::config::BusConfig;
use conductor_core::{Error, Event, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub type SubscriptionId = u64;

/// Receives events of the types it is subscribed to.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> Result<()> {
        (self.f)(event.clone()).await
    }
}

/// An emitted event together with the handlers subscribed at emit time.
struct QueueEntry {
    event: Arc<Event>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

#[derive(Default)]
struct Counters {
    emitted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub emitted: u64,
    /// Handler invocations that returned `Ok`.
    pub delivered: u64,
    /// Handler invocations that returned `Err` or panicked.
    pub failed: u64,
    /// Queue entries discarded by `stop`.
    pub dropped: u64,
}

struct Workers {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Publish/subscribe hub backed by a bounded queue and a fixed worker pool.
///
/// The queue outlives `start`/`stop` cycles: entries emitted while stopped
/// wait for the next `start`, or are dropped by the next `stop`.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<(SubscriptionId, Arc<dyn EventHandler>)>>>,
    next_id: AtomicU64,
    tx: mpsc::Sender<QueueEntry>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueEntry>>>,
    counters: Arc<Counters>,
    worker_count: usize,
    capacity: usize,
    shutdown_timeout: Duration,
    workers: Mutex<Option<Workers>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: &BusConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            counters: Arc::new(Counters::default()),
            worker_count: config.workers.max(1),
            capacity,
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
            workers: Mutex::new(None),
        }
    }

    pub fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.entry(event_type.to_string()).or_default().push((id, handler));
        debug!(event_type = %event_type, subscription = id, "Handler subscribed");
        id
    }

    /// Subscribe an async closure.
    pub fn subscribe_fn<F, Fut>(&self, event_type: &str, f: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(event_type, Arc::new(FnHandler { f }))
    }

    pub fn unsubscribe(&self, event_type: &str, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let Some(list) = subs.get_mut(event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subs.remove(event_type);
        }
        removed
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        let subs = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        subs.get(event_type).map_or(0, Vec::len)
    }

    fn snapshot(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        let subs = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        subs.get(event_type)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    fn entry_for(&self, event_type: &str, payload: serde_json::Value) -> Option<QueueEntry> {
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        let handlers = self.snapshot(event_type);
        if handlers.is_empty() {
            trace!(event_type = %event_type, "No subscribers, event discarded");
            return None;
        }
        Some(QueueEntry {
            event: Arc::new(Event::new(event_type, payload)),
            handlers,
        })
    }

    /// Enqueue an event for every current subscriber, waiting for queue space.
    pub async fn emit(&self, event_type: &str, payload: serde_json::Value) -> Result<()> {
        let Some(entry) = self.entry_for(event_type, payload) else {
            return Ok(());
        };
        self.tx
            .send(entry)
            .await
            .map_err(|_| Error::Other("event queue closed".to_string()))
    }

    /// Like [`emit`](Self::emit) but fails with `QueueFull` instead of waiting.
    pub fn try_emit(&self, event_type: &str, payload: serde_json::Value) -> Result<()> {
        let Some(entry) = self.entry_for(event_type, payload) else {
            return Ok(());
        };
        self.tx.try_send(entry).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull(self.capacity),
            mpsc::error::TrySendError::Closed(_) => Error::Other("event queue closed".to_string()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Spawn the worker pool. No-op when already running.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handles = (0..self.worker_count)
            .map(|n| {
                tokio::spawn(run_worker(
                    n,
                    self.rx.clone(),
                    self.counters.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        *workers = Some(Workers { cancel, handles });
        info!(workers = self.worker_count, "Event bus started");
    }

    /// Stop the workers, waiting up to the shutdown timeout, then drop queued entries.
    pub async fn stop(&self) {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(workers) = workers else {
            return;
        };
        workers.cancel.cancel();
        if tokio::time::timeout(self.shutdown_timeout, join_all(workers.handles))
            .await
            .is_err()
        {
            warn!(
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "Event bus workers still busy at shutdown, abandoning them"
            );
        }

        let dropped = self.drain();
        if dropped > 0 {
            warn!(dropped, "Dropped queued events at shutdown");
        }
        info!("Event bus stopped");
    }

    fn drain(&self) -> u64 {
        let Ok(mut rx) = self.rx.try_lock() else {
            return 0;
        };
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        self.counters.dropped.fetch_add(dropped, Ordering::Relaxed);
        dropped
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    n: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueEntry>>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    debug!(worker = n, "Bus worker started");
    loop {
        let entry = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            entry = async { rx.lock().await.recv().await } => entry,
        };
        let Some(entry) = entry else {
            break;
        };
        deliver(entry, &counters).await;
    }
    debug!(worker = n, "Bus worker exiting");
}

/// Fan an entry out to its handlers concurrently. Each handler runs on its own
/// task so a panic is contained to that invocation.
async fn deliver(entry: QueueEntry, counters: &Counters) {
    let event_type = entry.event.event_type.clone();
    let tasks = entry.handlers.into_iter().map(|handler| {
        let event = entry.event.clone();
        tokio::spawn(async move { handler.handle(&event).await })
    });
    for joined in join_all(tasks).await {
        match joined {
            Ok(Ok(())) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(event_type = %event_type, error = %e, "Event handler failed");
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(event_type = %event_type, error = %e, "Event handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &Arc<AtomicUsize>) -> impl Fn(Event) -> futures::future::Ready<Result<()>> {
        let counter = counter.clone();
        move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(()))
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_each_subscriber_runs_once_despite_failure() {
        let bus = EventBus::default();
        let good = Arc::new(AtomicUsize::new(0));
        let bad_calls = Arc::new(AtomicUsize::new(0));

        bus.subscribe_fn("X", counting(&good));
        let bad = bad_calls.clone();
        bus.subscribe_fn("X", move |_event| {
            bad.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), Error>(Error::Other("handler failure".to_string())) }
        });

        bus.start();
        bus.emit("X", serde_json::json!({"n": 1})).await.unwrap();
        wait_for(|| bus.stats().delivered + bus.stats().failed == 2).await;
        bus.stop().await;

        assert_eq!(good.load(Ordering::SeqCst), 1);
        assert_eq!(bad_calls.load(Ordering::SeqCst), 1);
        let stats = bus.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let bus = EventBus::default();
        let good = Arc::new(AtomicUsize::new(0));
        bus.subscribe_fn("X", |_event| async {
            if true {
                panic!("handler exploded");
            }
            Ok::<(), Error>(())
        });
        bus.subscribe_fn("X", counting(&good));

        bus.start();
        bus.emit("X", serde_json::Value::Null).await.unwrap();
        wait_for(|| bus.stats().delivered + bus.stats().failed == 2).await;
        bus.stop().await;

        assert_eq!(good.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::default();
        let early = Arc::new(AtomicUsize::new(0));
        let late = Arc::new(AtomicUsize::new(0));
        bus.subscribe_fn("X", counting(&early));

        // Queued while stopped, snapshot taken now.
        bus.emit("X", serde_json::Value::Null).await.unwrap();
        bus.subscribe_fn("X", counting(&late));
        bus.start();
        wait_for(|| early.load(Ordering::SeqCst) == 1).await;
        bus.stop().await;

        assert_eq!(early.load(Ordering::SeqCst), 1);
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe_fn("X", counting(&calls));
        assert_eq!(bus.subscriber_count("X"), 1);
        assert!(bus.unsubscribe("X", id));
        assert!(!bus.unsubscribe("X", id));
        assert!(!bus.unsubscribe("Y", id));
        assert_eq!(bus.subscriber_count("X"), 0);

        bus.start();
        bus.emit("X", serde_json::Value::Null).await.unwrap();
        bus.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent_and_restartable() {
        let bus = EventBus::default();
        let calls = Arc::new(AtomicUsize::new(0));
        bus.subscribe_fn("X", counting(&calls));

        bus.stop().await;
        bus.start();
        bus.start();
        assert!(bus.is_running());
        bus.stop().await;
        bus.stop().await;
        assert!(!bus.is_running());

        bus.start();
        bus.emit("X", serde_json::Value::Null).await.unwrap();
        wait_for(|| calls.load(Ordering::SeqCst) == 1).await;
        bus.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_drops_queued_entries() {
        let bus = EventBus::default();
        let calls = Arc::new(AtomicUsize::new(0));
        bus.subscribe_fn("X", counting(&calls));

        bus.start();
        // Ensure workers are parked, then stop and enqueue while stopped.
        bus.stop().await;
        for _ in 0..3 {
            bus.emit("X", serde_json::Value::Null).await.unwrap();
        }
        bus.start();
        bus.stop().await;

        let stats = bus.stats();
        assert_eq!(stats.emitted, 3);
        assert_eq!(stats.delivered + stats.dropped, 3);
        assert_eq!(calls.load(Ordering::SeqCst) as u64, stats.delivered);
    }

    #[tokio::test]
    async fn test_try_emit_reports_full_queue() {
        let config = BusConfig {
            queue_capacity: 1,
            ..BusConfig::default()
        };
        let bus = EventBus::new(&config);
        bus.subscribe_fn("X", |_event| async { Ok::<(), Error>(()) });

        bus.try_emit("X", serde_json::Value::Null).unwrap();
        assert!(matches!(
            bus.try_emit("X", serde_json::Value::Null),
            Err(Error::QueueFull(1))
        ));
        // Events without subscribers never occupy the queue.
        bus.try_emit("nobody", serde_json::Value::Null).unwrap();
    }

    #[tokio::test]
    async fn test_stop_abandons_slow_handlers() {
        let config = BusConfig {
            workers: 1,
            shutdown_timeout_ms: 50,
            ..BusConfig::default()
        };
        let bus = EventBus::new(&config);
        bus.subscribe_fn("slow", |_event| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<(), Error>(())
        });
        bus.start();
        bus.emit("slow", serde_json::Value::Null).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        bus.stop().await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
