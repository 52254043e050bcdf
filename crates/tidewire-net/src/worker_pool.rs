//! Elastic pool of OS threads for handlers that must not block the event
//! queue.
//!
//! A dispatcher thread pulls tasks from an unbounded channel and hands each
//! one to an idle worker, spawning a new worker while below capacity. Posting
//! never blocks; tasks beyond the busy workers wait in the channel. Idle
//! workers retire after `idle_timeout`; the first worker is kept alive for
//! the lifetime of the pool.

use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendError, Sender, bounded, unbounded};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::{
    boundary::{self, PanicHandler, run_guarded},
    error::NetError,
};

pub const DEFAULT_CAPACITY: usize = 10_000;
pub const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a dispatcher at capacity re-checks the live worker count.
const CAPACITY_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Upper bound on live workers. 0 means default.
    pub capacity: usize,
    pub idle_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            idle_timeout: WORKER_IDLE_TIMEOUT,
        }
    }
}

type Task = Box<dyn FnOnce() + Send>;

enum Job {
    Run(Task),
    Exit,
}

const IDLE: u8 = 0;
const ASSIGNED: u8 = 1;
const RETIRED: u8 = 2;

/// Handle the dispatcher uses to reach one idle worker.
struct WorkerSlot {
    state: Arc<AtomicU8>,
    tx: Sender<Job>,
}

impl WorkerSlot {
    fn claim(&self) -> bool {
        self.state
            .compare_exchange(IDLE, ASSIGNED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

struct Shared {
    idle_tx: Sender<WorkerSlot>,
    idle_rx: Receiver<WorkerSlot>,
    capacity: usize,
    idle_timeout: Duration,
    closing: AtomicBool,
    live: Mutex<usize>,
    all_exited: Condvar,
    busy: AtomicUsize,
    next_worker: AtomicUsize,
    on_panic: OnceLock<PanicHandler>,
}

struct PoolInner {
    shared: Arc<Shared>,
    tasks_tx: Mutex<Option<Sender<Task>>>,
    tasks_rx: Mutex<Option<Receiver<Task>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to a worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let capacity = if config.capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            config.capacity
        };
        let (tasks_tx, tasks_rx) = unbounded();
        let (idle_tx, idle_rx) = unbounded();

        Self {
            inner: Arc::new(PoolInner {
                shared: Arc::new(Shared {
                    idle_tx,
                    idle_rx,
                    capacity,
                    idle_timeout: config.idle_timeout,
                    closing: AtomicBool::new(false),
                    live: Mutex::new(0),
                    all_exited: Condvar::new(),
                    busy: AtomicUsize::new(0),
                    next_worker: AtomicUsize::new(0),
                    on_panic: OnceLock::new(),
                }),
                tasks_tx: Mutex::new(Some(tasks_tx)),
                tasks_rx: Mutex::new(Some(tasks_rx)),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Start the dispatcher and the keep-alive worker.
    pub fn run(&self, on_panic: Option<PanicHandler>) -> Result<(), NetError> {
        let Some(tasks_rx) = self.inner.tasks_rx.lock().take() else {
            return Err(NetError::AlreadyRunning);
        };
        let shared = Arc::clone(&self.inner.shared);
        let _ = shared
            .on_panic
            .set(on_panic.unwrap_or_else(|| boundary::log_panics("worker_pool")));

        shared.spawn_worker(true, None);

        let dispatcher = thread::Builder::new()
            .name("tidewire-pool-dispatch".into())
            .spawn(move || {
                for task in tasks_rx.iter() {
                    shared.dispatch(task);
                }
                shared.shutdown_idle();
                debug!("worker pool dispatcher exited");
            })?;
        *self.inner.dispatcher.lock() = Some(dispatcher);
        Ok(())
    }

    /// Queue `f` for execution without blocking. Silently dropped once the
    /// pool is closing.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        let tx = self.inner.tasks_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(Box::new(f));
        }
    }

    /// Stop accepting tasks. Already queued tasks still run.
    pub fn close(&self) {
        self.inner.tasks_tx.lock().take();
    }

    /// Block until the dispatcher and every worker have exited.
    pub fn wait_closed(&self) {
        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.join();
        }
        let shared = &self.inner.shared;
        let mut live = shared.live.lock();
        while *live > 0 {
            shared.all_exited.wait(&mut live);
        }
    }

    /// `close` followed by `wait_closed`.
    pub fn stop(&self) {
        self.close();
        self.wait_closed();
    }

    pub fn live_workers(&self) -> usize {
        *self.inner.shared.live.lock()
    }

    pub fn busy_workers(&self) -> usize {
        self.inner.shared.busy.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.inner.shared.capacity
    }
}

impl Shared {
    fn dispatch(self: &Arc<Self>, mut task: Task) {
        loop {
            while let Ok(slot) = self.idle_rx.try_recv() {
                match self.hand_off(slot, task) {
                    Ok(()) => return,
                    Err(t) => task = t,
                }
            }

            if *self.live.lock() < self.capacity {
                self.spawn_worker(false, Some(task));
                return;
            }

            // At capacity: wait for someone to become idle.
            match self.idle_rx.recv_timeout(CAPACITY_POLL) {
                Ok(slot) => match self.hand_off(slot, task) {
                    Ok(()) => return,
                    Err(t) => task = t,
                },
                Err(_) => continue,
            }
        }
    }

    /// Give `task` to the worker behind `slot`, or hand it back when the
    /// worker retired in the meantime.
    fn hand_off(&self, slot: WorkerSlot, task: Task) -> Result<(), Task> {
        if !slot.claim() {
            return Err(task);
        }
        match slot.tx.send(Job::Run(task)) {
            Ok(()) => Ok(()),
            Err(SendError(Job::Run(task))) => Err(task),
            Err(SendError(Job::Exit)) => Ok(()),
        }
    }

    fn spawn_worker(self: &Arc<Self>, keep_alive: bool, first: Option<Task>) {
        *self.live.lock() += 1;
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("tidewire-worker-{id}"))
            .spawn(move || shared.worker_loop(keep_alive, first));

        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn worker thread");
            self.worker_exited();
        }
    }

    fn worker_loop(&self, keep_alive: bool, first: Option<Task>) {
        let state = Arc::new(AtomicU8::new(ASSIGNED));
        let (tx, rx) = bounded::<Job>(1);

        if let Some(task) = first {
            self.run_task(task);
        }

        loop {
            state.store(IDLE, Ordering::SeqCst);
            let _ = self.idle_tx.send(WorkerSlot {
                state: Arc::clone(&state),
                tx: tx.clone(),
            });
            if self.closing.load(Ordering::SeqCst) && retire(&state) {
                break;
            }

            let job = if keep_alive {
                rx.recv().ok()
            } else {
                match rx.recv_timeout(self.idle_timeout) {
                    Ok(job) => Some(job),
                    Err(RecvTimeoutError::Timeout) if retire(&state) => break,
                    // Claimed by the dispatcher right as we timed out.
                    Err(RecvTimeoutError::Timeout) => rx.recv().ok(),
                    Err(RecvTimeoutError::Disconnected) => None,
                }
            };

            match job {
                Some(Job::Run(task)) => self.run_task(task),
                Some(Job::Exit) | None => break,
            }
        }

        self.worker_exited();
    }

    fn run_task(&self, task: Task) {
        self.busy.fetch_add(1, Ordering::SeqCst);
        match self.on_panic.get() {
            Some(on_panic) => run_guarded(on_panic, task),
            None => run_guarded(&boundary::log_panics("worker_pool"), task),
        }
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }

    fn worker_exited(&self) {
        let mut live = self.live.lock();
        *live -= 1;
        if *live == 0 {
            self.all_exited.notify_all();
        }
    }

    /// Tell every idle worker to exit; busy ones exit when they go idle.
    fn shutdown_idle(&self) {
        self.closing.store(true, Ordering::SeqCst);
        while let Ok(slot) = self.idle_rx.try_recv() {
            if slot.claim() {
                let _ = slot.tx.send(Job::Exit);
            }
        }
    }
}

fn retire(state: &AtomicU8) -> bool {
    state
        .compare_exchange(IDLE, RETIRED, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}
