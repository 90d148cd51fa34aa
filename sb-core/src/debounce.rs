//! Per-key burst debouncing.
//!
//! Items sharing a key are buffered until the key has been quiet for the
//! whole window, then delivered to the [`BatchHandler`] as one batch. Every
//! key owns a delivery lane: batches for one key reach the handler strictly
//! in arrival order, while different keys never wait on each other.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[async_trait]
pub trait BatchHandler<T>: Send + Sync {
    /// Receives one flushed batch. `key` is `None` for items that had no
    /// debounce key.
    async fn flush(&self, key: Option<&str>, items: Vec<T>) -> anyhow::Result<()>;

    /// Called when `flush` fails or panics. The batch is not redelivered.
    fn on_error(&self, key: Option<&str>, batch_len: usize, error: &anyhow::Error) {
        tracing::warn!(key = ?key, batch_len, %error, "debounced batch handler failed");
    }
}

type KeyFn<T> = Box<dyn Fn(&T) -> Option<String> + Send + Sync>;
type DebouncePredicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

pub struct Debouncer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Debouncer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

struct Shared<T> {
    window: Duration,
    key_fn: KeyFn<T>,
    should_debounce: DebouncePredicate<T>,
    handler: Arc<dyn BatchHandler<T>>,
    state: Mutex<State<T>>,
}

struct State<T> {
    buffers: HashMap<String, Buffer<T>>,
    // A lane exists exactly while its worker task is running.
    lanes: HashMap<String, VecDeque<LaneJob<T>>>,
    // Deliveries of keyless items; `flush_all` waits for these too.
    keyless: Vec<JoinHandle<()>>,
    next_generation: u64,
}

struct Buffer<T> {
    items: Vec<T>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl<T> Buffer<T> {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Completion handle returned by [`Debouncer::submit`].
pub struct Delivery(Option<oneshot::Receiver<()>>);

impl Delivery {
    /// Whether the item was buffered rather than handed to the handler.
    pub fn is_buffered(&self) -> bool {
        self.0.is_none()
    }

    pub async fn delivered(self) {
        if let Some(done) = self.0 {
            let _ = done.await;
        }
    }
}

enum LaneJob<T> {
    Batch(Vec<T>),
    Barrier(oneshot::Sender<()>),
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new(
        window: Duration,
        key_fn: impl Fn(&T) -> Option<String> + Send + Sync + 'static,
        should_debounce: impl Fn(&T) -> bool + Send + Sync + 'static,
        handler: Arc<dyn BatchHandler<T>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                window,
                key_fn: Box::new(key_fn),
                should_debounce: Box::new(should_debounce),
                handler,
                state: Mutex::new(State {
                    buffers: HashMap::new(),
                    lanes: HashMap::new(),
                    keyless: Vec::new(),
                    next_generation: 0,
                }),
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.shared.window
    }

    /// Buffers `item`, or delivers it right away when it cannot be debounced.
    /// Handler failures never surface here.
    pub async fn enqueue(&self, item: T) {
        self.submit(item).delivered().await;
    }

    /// Hands `item` over without waiting. Ordering against earlier items of
    /// the same key is fixed before this returns; the returned [`Delivery`]
    /// resolves once an undebounced item has reached the handler.
    pub fn submit(&self, item: T) -> Delivery {
        let key = (self.shared.key_fn)(&item).filter(|key| !key.trim().is_empty());
        let Some(key) = key else {
            let (done_tx, done_rx) = oneshot::channel();
            let shared = self.shared.clone();
            let task = tokio::spawn(async move {
                shared.deliver(None, vec![item]).await;
                let _ = done_tx.send(());
            });
            self.shared.with_state(|state| {
                state.keyless.retain(|handle| !handle.is_finished());
                state.keyless.push(task);
            });
            return Delivery(Some(done_rx));
        };

        let can_debounce = !self.shared.window.is_zero() && (self.shared.should_debounce)(&item);
        if !can_debounce {
            let (done_tx, done_rx) = oneshot::channel();
            self.shared.with_state(|state| {
                if let Some(mut pending) = state.buffers.remove(&key) {
                    pending.cancel_timer();
                    self.shared
                        .push_job(state, &key, LaneJob::Batch(pending.items));
                }
                self.shared
                    .push_job(state, &key, LaneJob::Batch(vec![item]));
                self.shared
                    .push_job(state, &key, LaneJob::Barrier(done_tx));
            });
            return Delivery(Some(done_rx));
        }

        self.shared.with_state(|state| {
            let generation = state.next_generation;
            state.next_generation = state.next_generation.wrapping_add(1);
            let buffer = state.buffers.entry(key.clone()).or_insert_with(|| Buffer {
                items: Vec::new(),
                generation,
                timer: None,
            });
            buffer.items.push(item);
            buffer.generation = generation;
            buffer.cancel_timer();
            buffer.timer = Some(self.shared.schedule_flush(key, generation));
        });
        Delivery(None)
    }

    /// Delivers the pending buffer for `key` now and waits until every batch
    /// already queued for that key has been handled.
    pub async fn flush_key(&self, key: &str) {
        let done = self.shared.with_state(|state| self.shared.seal_key(state, key));
        if let Some(done) = done {
            let _ = done.await;
        }
    }

    /// Delivers every pending buffer and waits for all in-flight handler
    /// calls, keyless ones included.
    pub async fn flush_all(&self) {
        let (waiters, keyless) = self.shared.with_state(|state| {
            let keys: BTreeSet<String> = state
                .buffers
                .keys()
                .chain(state.lanes.keys())
                .cloned()
                .collect();
            let waiters = keys
                .iter()
                .filter_map(|key| self.shared.seal_key(state, key))
                .collect::<Vec<_>>();
            (waiters, std::mem::take(&mut state.keyless))
        });
        for done in waiters {
            let _ = done.await;
        }
        for task in keyless {
            if let Err(error) = task.await {
                tracing::warn!(%error, "keyless delivery task failed");
            }
        }
    }

    /// Cancels every pending timer and drains all buffers.
    pub async fn shutdown(&self) {
        let pending = self.pending_keys();
        tracing::debug!(pending, "debouncer shutting down");
        self.flush_all().await;
    }

    pub fn pending_keys(&self) -> usize {
        self.shared.with_state(|state| state.buffers.len())
    }
}

impl<T: Send + 'static> Shared<T> {
    fn with_state<R>(&self, f: impl FnOnce(&mut State<T>) -> R) -> R {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    fn schedule_flush(self: &Arc<Self>, key: String, generation: u64) -> JoinHandle<()> {
        let shared = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(shared.window).await;
            shared.fire(&key, generation);
        })
    }

    fn fire(self: &Arc<Self>, key: &str, generation: u64) {
        self.with_state(|state| {
            let current = state.buffers.get(key).map(|buffer| buffer.generation);
            if current != Some(generation) {
                return;
            }
            if let Some(buffer) = state.buffers.remove(key) {
                self.push_job(state, key, LaneJob::Batch(buffer.items));
            }
        });
    }

    fn seal_key(self: &Arc<Self>, state: &mut State<T>, key: &str) -> Option<oneshot::Receiver<()>> {
        let pending = state.buffers.remove(key);
        if pending.is_none() && !state.lanes.contains_key(key) {
            return None;
        }
        if let Some(mut pending) = pending {
            pending.cancel_timer();
            self.push_job(state, key, LaneJob::Batch(pending.items));
        }
        let (done_tx, done_rx) = oneshot::channel();
        self.push_job(state, key, LaneJob::Barrier(done_tx));
        Some(done_rx)
    }

    fn push_job(self: &Arc<Self>, state: &mut State<T>, key: &str, job: LaneJob<T>) {
        if let Some(lane) = state.lanes.get_mut(key) {
            lane.push_back(job);
            return;
        }
        state.lanes.insert(key.to_string(), VecDeque::from([job]));
        let shared = self.clone();
        let key = key.to_string();
        tokio::spawn(async move { shared.run_lane(key).await });
    }

    async fn run_lane(self: Arc<Self>, key: String) {
        loop {
            let job = self.with_state(|state| {
                let lane = state.lanes.get_mut(&key)?;
                let job = lane.pop_front();
                if job.is_none() {
                    state.lanes.remove(&key);
                }
                job
            });
            match job {
                None => return,
                Some(LaneJob::Batch(items)) => self.deliver(Some(key.clone()), items).await,
                Some(LaneJob::Barrier(done)) => {
                    let _ = done.send(());
                }
            }
        }
    }

    async fn deliver(self: &Arc<Self>, key: Option<String>, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        let batch_len = items.len();
        let handler = self.handler.clone();
        let task_key = key.clone();
        // A panicking handler must not take the lane worker down with it.
        let outcome =
            tokio::spawn(async move { handler.flush(task_key.as_deref(), items).await }).await;
        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(error)) => error,
            Err(join_error) => anyhow::anyhow!("batch handler panicked: {join_error}"),
        };
        self.handler.on_error(key.as_deref(), batch_len, &error);
    }
}
