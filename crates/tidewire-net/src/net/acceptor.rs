use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use tidewire_proto::{Codec, MessageRegistry};
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, error, info, info_span, warn};

use super::{
    inbound::NetEvent,
    session::{DEFAULT_RPC_TIMEOUT, HeartbeatConfig, Session, SessionConfig, WriteMode},
};
use crate::{
    boundary,
    dispatch::{ConcurrencyPolicy, LogHandler, Serialized, SessionHandler},
    error::NetError,
    event_queue::EventQueue,
};

/// First delay after a transient accept error.
pub const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
pub const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    pub codec: Codec,
    pub registry: Arc<MessageRegistry>,
    pub rpc_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
    pub debug_log: bool,
    pub log_span: Span,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            codec: Codec::Binary,
            registry: Arc::new(MessageRegistry::with_base_messages()),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            heartbeat: HeartbeatConfig::server(),
            debug_log: false,
            log_span: Span::none(),
        }
    }
}

struct AcceptorInner {
    local_addr: SocketAddr,
    queue: EventQueue<NetEvent>,
    config: AcceptorConfig,
    span: Span,
    listener: Mutex<Option<TcpListener>>,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    handler: RwLock<Arc<dyn SessionHandler>>,
    concurrency: RwLock<Arc<dyn ConcurrencyPolicy>>,
}

/// TCP server side: accepts connections and wraps each one in a batched
/// [`Session`] reporting to `queue`.
#[derive(Clone)]
pub struct Acceptor {
    inner: Arc<AcceptorInner>,
}

impl Acceptor {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        queue: EventQueue<NetEvent>,
        config: AcceptorConfig,
    ) -> Result<Self, NetError> {
        let listener = TcpListener::bind(addr).await?;
        Self::from_listener(listener, queue, config)
    }

    pub fn from_listener(
        listener: TcpListener,
        queue: EventQueue<NetEvent>,
        config: AcceptorConfig,
    ) -> Result<Self, NetError> {
        let local_addr = listener.local_addr()?;
        let span = info_span!(parent: &config.log_span, "acceptor", %local_addr);

        Ok(Self {
            inner: Arc::new(AcceptorInner {
                local_addr,
                queue,
                config,
                span,
                listener: Mutex::new(Some(listener)),
                shutdown: CancellationToken::new(),
                accept_task: Mutex::new(None),
                handler: RwLock::new(Arc::new(LogHandler)),
                concurrency: RwLock::new(Arc::new(Serialized)),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Handler installed on every session accepted from now on.
    pub fn set_handler(&self, handler: Arc<dyn SessionHandler>) {
        *self.inner.handler.write() = handler;
    }

    pub fn set_concurrency(&self, policy: Arc<dyn ConcurrencyPolicy>) {
        *self.inner.concurrency.write() = policy;
    }

    /// Spawn the accept loop. Later calls are no-ops.
    pub fn start_accept(&self) {
        let Some(listener) = self.inner.listener.lock().take() else {
            return;
        };
        let acceptor = self.clone();
        let task = self
            .inner
            .queue
            .runtime()
            .spawn(acceptor.accept_loop(listener).instrument(self.inner.span.clone()));
        *self.inner.accept_task.lock() = Some(task);
    }

    /// Stop accepting. Sessions already accepted keep running.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.listener.lock().take();
    }

    /// Wait for the accept loop to exit.
    pub async fn closed(&self) {
        let task = self.inner.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn accept_loop(self, listener: TcpListener) {
        info!("accepting connections");
        let mut backoff = Duration::ZERO;

        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = self.inner.shutdown.cancelled() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    backoff = Duration::ZERO;
                    if let Err(panic) = boundary::guard(|| self.start_session(stream, peer)) {
                        error!(%peer, panic = %panic, "session setup panicked");
                    }
                }
                Err(e) if is_transient(&e) => {
                    backoff = next_backoff(backoff);
                    warn!(error = %e, ?backoff, "accept error, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.inner.shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!(error = %e, "accept failed, stopping");
                    break;
                }
            }
        }

        info!("acceptor stopped");
    }

    fn start_session(&self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let local = stream.local_addr().unwrap_or(self.inner.local_addr);
        let config = &self.inner.config;
        let queue = &self.inner.queue;

        let session = Session::new(
            queue.clone(),
            local,
            peer,
            SessionConfig {
                write_mode: WriteMode::Batched,
                codec: config.codec,
                registry: Arc::clone(&config.registry),
                rpc_timeout: config.rpc_timeout,
                debug_log: config.debug_log,
                log_span: self.inner.span.clone(),
            },
        );
        session.set_handler(Arc::clone(&self.inner.handler.read()));
        session.set_concurrency(Arc::clone(&self.inner.concurrency.read()));

        let events = queue.clone();
        let closed = Arc::clone(&session);
        session.set_on_close(move |error| {
            events.post(NetEvent::Disconnected {
                session: closed,
                error,
            })
        });

        queue.post(NetEvent::Connected(Arc::clone(&session)));

        let heartbeat = config.heartbeat;
        let watched = Arc::clone(&session);
        queue.tick(heartbeat.interval, move |now| {
            watched.check_heartbeat(now, heartbeat.timeout)
        });

        session.start(stream);
    }
}

/// Delay before the next accept attempt after a transient error.
pub fn next_backoff(prev: Duration) -> Duration {
    if prev.is_zero() {
        ACCEPT_BACKOFF_START
    } else {
        (prev * 2).min(ACCEPT_BACKOFF_MAX)
    }
}

fn is_transient(e: &io::Error) -> bool {
    use io::ErrorKind::*;
    // ENFILE / EMFILE: out of descriptors, may clear up.
    matches!(
        e.kind(),
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock | TimedOut
    ) || matches!(e.raw_os_error(), Some(23 | 24))
}
