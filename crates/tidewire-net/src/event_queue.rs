//! Single-consumer event loop.
//!
//! Producers on any thread post events or closures; exactly one consumer
//! task executes them, so handlers owned by one queue never run
//! concurrently. Timers are driven by tokio's timer wheel and land on a
//! second channel drained by the same consumer.

use std::{
    collections::HashSet,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, warn};

use crate::{
    boundary::{self, PanicHandler, run_guarded},
    error::NetError,
};

/// Minimum event channel capacity.
pub const MIN_CAPACITY: usize = 10_000;

/// How long `post_wait` waits for its closure to run.
pub const POST_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A `post_wait` closure is skipped when less than this remains before the
/// caller's deadline.
const POST_WAIT_MIN_REMAINING: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct EventQueueConfig {
    /// Event channel capacity; values below `MIN_CAPACITY` are raised.
    pub capacity: usize,
    pub post_wait_timeout: Duration,
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        Self {
            capacity: MIN_CAPACITY,
            post_wait_timeout: POST_WAIT_TIMEOUT,
        }
    }
}

/// What the consumer's dispatch function receives.
#[derive(Debug)]
pub enum QueueEvent<E> {
    Event(E),
    /// Last item before the queue shuts down.
    Stopped,
}

type Job = Box<dyn FnOnce() + Send>;
type TimerJob = Box<dyn FnOnce(Instant) + Send>;

enum Item<E> {
    Call(Job),
    Event(E),
    Stopped,
}

struct Timer {
    fire: TimerJob,
    at: Instant,
}

struct Inner<E> {
    stopped: AtomicBool,
    events_tx: Mutex<Option<mpsc::Sender<Item<E>>>>,
    timers_tx: Mutex<Option<mpsc::Sender<Timer>>>,
    receivers: Mutex<Option<(mpsc::Receiver<Item<E>>, mpsc::Receiver<Timer>)>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    once_keys: Mutex<HashSet<String>>,
    dropped: AtomicU64,
    post_wait_timeout: Duration,
    runtime: Handle,
}

/// Cloneable handle to one event loop.
pub struct EventQueue<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for EventQueue<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Send + 'static> EventQueue<E> {
    /// Create a queue bound to the current tokio runtime.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn new(config: EventQueueConfig) -> Self {
        Self::with_runtime(config, Handle::current())
    }

    pub fn with_runtime(config: EventQueueConfig, runtime: Handle) -> Self {
        let capacity = config.capacity.max(MIN_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (timers_tx, timers_rx) = mpsc::channel(capacity);

        Self {
            inner: Arc::new(Inner {
                stopped: AtomicBool::new(false),
                events_tx: Mutex::new(Some(events_tx)),
                timers_tx: Mutex::new(Some(timers_tx)),
                receivers: Mutex::new(Some((events_rx, timers_rx))),
                consumer: Mutex::new(None),
                once_keys: Mutex::new(HashSet::new()),
                dropped: AtomicU64::new(0),
                post_wait_timeout: config.post_wait_timeout,
                runtime,
            }),
        }
    }

    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Number of posts discarded because the event channel was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Enqueue an event without blocking. Dropped when stopped or full.
    pub fn post(&self, event: E) {
        let _ = self.push(Item::Event(event));
    }

    /// Enqueue a closure without blocking. Dropped when stopped or full.
    pub fn post_fn(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.push(Item::Call(Box::new(f)));
    }

    fn push(&self, item: Item<E>) -> Result<(), NetError> {
        if self.is_stopped() {
            return Err(NetError::QueueStopped);
        }
        let guard = self.inner.events_tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(NetError::QueueStopped);
        };
        match tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "event queue full, dropping post");
                Err(NetError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(NetError::QueueStopped),
        }
    }

    /// Run `f` on the consumer and wait for its result.
    ///
    /// Gives up after the configured timeout. A panic inside `f` is returned
    /// as `NetError::Panicked`.
    pub async fn post_wait<F, R>(&self, f: F) -> Result<R, NetError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let timeout = self.inner.post_wait_timeout;
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();

        self.push(Item::Call(Box::new(move || {
            if tx.is_closed() || Instant::now() + POST_WAIT_MIN_REMAINING > deadline {
                return;
            }
            let _ = tx.send(boundary::guard(f));
        })))?;

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(panic))) => Err(NetError::Panicked(panic)),
            Ok(Err(_)) => Err(NetError::PostWaitTimeout(timeout)),
            Err(_) => Err(NetError::PostWaitTimeout(timeout)),
        }
    }

    /// Run `f` at most once per `key` over the queue's lifetime.
    pub fn once(&self, key: impl Into<String>, f: impl FnOnce() + Send + 'static) {
        let key = key.into();
        let inner = Arc::downgrade(&self.inner);
        self.post_fn(move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.once_keys.lock().insert(key) {
                f();
            }
        });
    }

    /// Run `f` on the consumer after `delay`.
    pub fn after_func(&self, delay: Duration, f: impl FnOnce(Instant) + Send + 'static) {
        self.schedule(Instant::now() + delay, Box::new(f));
    }

    /// Run `f` on the consumer at `at` (immediately if already past).
    pub fn until_func(&self, at: Instant, f: impl FnOnce(Instant) + Send + 'static) {
        self.schedule(at, Box::new(f));
    }

    /// Run `f` every `interval` for as long as it returns `true`.
    pub fn tick(&self, interval: Duration, f: impl FnMut(Instant) -> bool + Send + 'static) {
        Self::rearm(Arc::downgrade(&self.inner), interval, f);
    }

    fn rearm<F>(inner: Weak<Inner<E>>, interval: Duration, mut f: F)
    where
        F: FnMut(Instant) -> bool + Send + 'static,
    {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let queue = EventQueue { inner: strong };
        queue.after_func(interval, move |now| {
            if f(now) {
                Self::rearm(inner, interval, f);
            }
        });
    }

    fn schedule(&self, at: Instant, fire: TimerJob) {
        if self.is_stopped() {
            return;
        }
        let inner = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            tokio::time::sleep_until(at).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let tx = inner.timers_tx.lock().clone();
            if let Some(tx) = tx {
                let _ = tx
                    .send(Timer {
                        fire,
                        at: Instant::now(),
                    })
                    .await;
            }
        });
    }

    /// Start the consumer task.
    ///
    /// `dispatch` receives every posted event; closures and timers run
    /// directly. Panics are reported to `on_panic` (logged when `None`).
    pub fn run<D>(&self, on_panic: Option<PanicHandler>, mut dispatch: D) -> Result<(), NetError>
    where
        D: FnMut(QueueEvent<E>) + Send + 'static,
    {
        let Some((mut events, mut timers)) = self.inner.receivers.lock().take() else {
            return Err(NetError::AlreadyRunning);
        };
        let on_panic = on_panic.unwrap_or_else(|| boundary::log_panics("event_queue"));

        let handle = self.inner.runtime.spawn(async move {
            let mut events_open = true;
            let mut timers_open = true;

            while events_open || timers_open {
                tokio::select! {
                    item = events.recv(), if events_open => match item {
                        Some(Item::Call(f)) => run_guarded(&on_panic, f),
                        Some(Item::Event(event)) => {
                            run_guarded(&on_panic, || dispatch(QueueEvent::Event(event)))
                        }
                        Some(Item::Stopped) => run_guarded(&on_panic, || dispatch(QueueEvent::Stopped)),
                        None => events_open = false,
                    },
                    timer = timers.recv(), if timers_open => match timer {
                        Some(Timer { fire, at }) => run_guarded(&on_panic, move || fire(at)),
                        None => timers_open = false,
                    },
                }
            }
            debug!("event queue consumer exited");
        });

        *self.inner.consumer.lock() = Some(handle);
        Ok(())
    }

    /// Deliver `Stopped`, close both channels and wait for the consumer to
    /// drain them. Later posts and timers are ignored.
    pub async fn stop(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        let tx = self.inner.events_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(Item::Stopped).await;
        }

        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.events_tx.lock().take();
        self.inner.timers_tx.lock().take();

        let consumer = self.inner.consumer.lock().take();
        if let Some(consumer) = consumer {
            let _ = consumer.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use parking_lot::Mutex;
    use tokio::time::Instant;

    use super::{EventQueue, EventQueueConfig, QueueEvent};
    use crate::{boundary::PanicHandler, error::NetError};

    fn queue<E: Send + 'static>() -> EventQueue<E> {
        EventQueue::new(EventQueueConfig::default())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn per_poster_order_is_kept_and_handlers_never_overlap() {
        let queue = queue::<(u8, u32)>();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let busy = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));

        let (s, b, o) = (seen.clone(), busy.clone(), overlapped.clone());
        queue
            .run(None, move |ev| {
                if let QueueEvent::Event(item) = ev {
                    if b.swap(true, Ordering::SeqCst) {
                        o.store(true, Ordering::SeqCst);
                    }
                    s.lock().push(item);
                    std::thread::yield_now();
                    b.store(false, Ordering::SeqCst);
                }
            })
            .unwrap();

        let posters: Vec<_> = (0..2u8)
            .map(|poster| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        queue.post((poster, i));
                    }
                })
            })
            .collect();
        for p in posters {
            p.join().unwrap();
        }
        queue.post_wait(|| ()).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2000);
        for poster in 0..2u8 {
            let order: Vec<u32> = seen
                .iter()
                .filter(|(p, _)| *p == poster)
                .map(|(_, i)| *i)
                .collect();
            assert_eq!(order, (0..1000).collect::<Vec<_>>());
        }
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panics_are_reported_and_processing_continues() {
        let queue = queue::<()>();
        let panics = Arc::new(AtomicUsize::new(0));
        let p = panics.clone();
        let on_panic: PanicHandler = Arc::new(move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        });
        queue.run(Some(on_panic), |_| panic!("handler")).unwrap();

        queue.post(());
        queue.post_fn(|| panic!("closure"));
        assert_eq!(queue.post_wait(|| 42).await.unwrap(), 42);

        let err = queue.post_wait(|| -> u32 { panic!("inside") }).await;
        assert!(matches!(err, Err(NetError::Panicked(msg)) if msg == "inside"));
        assert_eq!(panics.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn post_wait_times_out_without_consumer() {
        let queue = queue::<()>();
        let started = Instant::now();
        let res = queue.post_wait(|| 1).await;
        assert!(matches!(res, Err(NetError::PostWaitTimeout(_))));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn timers_fire_in_deadline_order_and_tick_rearms() {
        let queue = queue::<()>();
        queue.run(None, |_| {}).unwrap();
        let fired = Arc::new(Mutex::new(Vec::new()));

        let f = fired.clone();
        queue.after_func(Duration::from_millis(300), move |_| f.lock().push("late"));
        let f = fired.clone();
        queue.after_func(Duration::from_millis(100), move |_| f.lock().push("early"));
        let f = fired.clone();
        queue.until_func(Instant::now(), move |_| f.lock().push("now"));

        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        queue.tick(Duration::from_millis(50), move |_| {
            t.fetch_add(1, Ordering::SeqCst) + 1 < 3
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.post_wait(|| ()).await.unwrap();

        assert_eq!(*fired.lock(), ["now", "early", "late"]);
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn once_runs_a_key_a_single_time() {
        let queue = queue::<()>();
        queue.run(None, |_| {}).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for key in ["init", "init", "other"] {
            let h = hits.clone();
            queue.once(key, move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.post_wait(|| ()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_drains_then_ignores_new_posts() {
        let queue = queue::<u32>();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        queue
            .run(None, move |ev| match ev {
                QueueEvent::Event(v) => s.lock().push(Some(v)),
                QueueEvent::Stopped => s.lock().push(None),
            })
            .unwrap();
        assert!(matches!(
            queue.run(None, |_| {}),
            Err(NetError::AlreadyRunning)
        ));

        for v in 0..100 {
            queue.post(v);
        }
        queue.stop().await;
        assert!(queue.is_stopped());

        queue.post(999);
        queue.after_func(Duration::ZERO, |_| panic!("timer after stop"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 101);
        assert_eq!(seen.last(), Some(&None));
        assert_eq!(seen[99], Some(99));
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let queue = EventQueue::<u32>::new(EventQueueConfig {
            capacity: 0,
            ..Default::default()
        });
        // Not running: the channel fills up at the minimum capacity.
        for v in 0..(super::MIN_CAPACITY as u32 + 5) {
            queue.post(v);
        }
        assert_eq!(queue.dropped(), 5);
    }
}
