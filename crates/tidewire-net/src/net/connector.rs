use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use parking_lot::RwLock;
use strum::FromRepr;
use tidewire_proto::{AnyMessage, Codec, MessageRegistry, messages::base::Ping};
use tokio::{net::TcpStream, time::Instant};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use super::{
    inbound::{ConnectorStatus, NetEvent},
    session::{DEFAULT_RPC_TIMEOUT, HeartbeatConfig, RpcResult, Session, SessionConfig, WriteMode},
};
use crate::{
    boundary::spawn_guarded,
    dispatch::{ConcurrencyPolicy, LogHandler, Serialized, SessionHandler},
    error::NetError,
    event_queue::EventQueue,
};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum ConnectState {
    Invalid = 0,
    Connecting = 1,
    Connected = 2,
    Disconnected = 3,
}

/// Called instead of reconnecting when a dial fails or the session closes.
pub type ConnectFailedFn = Arc<dyn Fn(&Connector, &NetError) + Send + Sync>;

#[derive(Clone)]
struct ConnectorOptions {
    name: String,
    debug_log: bool,
    reconnect: bool,
    reconnect_delay: Duration,
    codec: Codec,
    dial_timeout: Duration,
    rpc_timeout: Duration,
    heartbeat: HeartbeatConfig,
    registry: Arc<MessageRegistry>,
    log_span: Span,
}

/// Builder for [`Connector`].
pub struct ConnectorBuilder {
    addr: String,
    queue: EventQueue<NetEvent>,
    options: ConnectorOptions,
    handler: Arc<dyn SessionHandler>,
    concurrency: Arc<dyn ConcurrencyPolicy>,
    on_connect_failed: Option<ConnectFailedFn>,
}

impl ConnectorBuilder {
    /// Trace every packet on the connection.
    pub fn debug_log(mut self) -> Self {
        self.options.debug_log = true;
        self
    }

    /// Dial again whenever the connection fails or closes.
    pub fn reconnect(mut self) -> Self {
        self.options.reconnect = true;
        self
    }

    /// Wait this long before each reconnect attempt.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.options.reconnect_delay = delay;
        self
    }

    pub fn json_codec(self) -> Self {
        self.codec(Codec::Text)
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.options.codec = codec;
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.options.dial_timeout = timeout;
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.options.rpc_timeout = timeout;
        self
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.options.heartbeat = heartbeat;
        self
    }

    pub fn registry(mut self, registry: Arc<MessageRegistry>) -> Self {
        self.options.registry = registry;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = name.into();
        self
    }

    pub fn log_span(mut self, span: Span) -> Self {
        self.options.log_span = span;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn SessionHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn concurrency(mut self, policy: Arc<dyn ConcurrencyPolicy>) -> Self {
        self.concurrency = policy;
        self
    }

    pub fn on_connect_failed(
        mut self,
        f: impl Fn(&Connector, &NetError) + Send + Sync + 'static,
    ) -> Self {
        self.on_connect_failed = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Connector {
        let span = info_span!(
            parent: &self.options.log_span,
            "connector",
            addr = %self.addr,
            name = %self.options.name
        );
        Connector {
            inner: Arc::new(ConnectorInner {
                addr: self.addr,
                queue: self.queue,
                options: self.options,
                span,
                state: AtomicU8::new(ConnectState::Invalid as u8),
                shut_down: AtomicBool::new(false),
                session: RwLock::new(None),
                handler: RwLock::new(self.handler),
                concurrency: RwLock::new(self.concurrency),
                on_connect_failed: RwLock::new(self.on_connect_failed),
            }),
        }
    }
}

struct ConnectorInner {
    addr: String,
    queue: EventQueue<NetEvent>,
    options: ConnectorOptions,
    span: Span,
    state: AtomicU8,
    shut_down: AtomicBool,
    session: RwLock<Option<Arc<Session>>>,
    handler: RwLock<Arc<dyn SessionHandler>>,
    concurrency: RwLock<Arc<dyn ConcurrencyPolicy>>,
    on_connect_failed: RwLock<Option<ConnectFailedFn>>,
}

/// TCP client side: owns at most one live [`Session`] to `addr`, with
/// heartbeat and optional reconnect.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl Connector {
    pub fn builder(addr: impl Into<String>, queue: EventQueue<NetEvent>) -> ConnectorBuilder {
        ConnectorBuilder {
            addr: addr.into(),
            queue,
            options: ConnectorOptions {
                name: String::new(),
                debug_log: false,
                reconnect: false,
                reconnect_delay: Duration::ZERO,
                codec: Codec::Binary,
                dial_timeout: DEFAULT_DIAL_TIMEOUT,
                rpc_timeout: DEFAULT_RPC_TIMEOUT,
                heartbeat: HeartbeatConfig::client(),
                registry: Arc::new(MessageRegistry::with_base_messages()),
                log_span: Span::none(),
            },
            handler: Arc::new(LogHandler),
            concurrency: Arc::new(Serialized),
            on_connect_failed: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn state(&self) -> ConnectState {
        ConnectState::from_repr(self.inner.state.load(Ordering::SeqCst))
            .unwrap_or(ConnectState::Invalid)
    }

    fn set_state(&self, state: ConnectState) {
        self.inner.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectState::Connected
    }

    /// The current (possibly closed) session.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.inner.session.read().clone()
    }

    fn live_session(&self) -> Option<Arc<Session>> {
        if !self.is_connected() {
            return None;
        }
        self.session()
    }

    pub fn handler(&self) -> Arc<dyn SessionHandler> {
        Arc::clone(&self.inner.handler.read())
    }

    /// Replace the handler for the current and future sessions.
    pub fn set_handler(&self, handler: Arc<dyn SessionHandler>) {
        if let Some(session) = self.session() {
            session.set_handler(Arc::clone(&handler));
        }
        *self.inner.handler.write() = handler;
    }

    pub fn set_concurrency(&self, policy: Arc<dyn ConcurrencyPolicy>) {
        if let Some(session) = self.session() {
            session.set_concurrency(Arc::clone(&policy));
        }
        *self.inner.concurrency.write() = policy;
    }

    pub fn set_on_connect_failed(&self, f: impl Fn(&Connector, &NetError) + Send + Sync + 'static) {
        *self.inner.on_connect_failed.write() = Some(Arc::new(f));
    }

    /// Start dialing. No-op unless the connector is idle or disconnected.
    pub fn connect(&self) {
        if self.inner.queue.is_stopped() || self.inner.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let claimed = [ConnectState::Invalid, ConnectState::Disconnected]
            .into_iter()
            .any(|from| {
                self.inner
                    .state
                    .compare_exchange(
                        from as u8,
                        ConnectState::Connecting as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
            });
        if !claimed {
            return;
        }

        let connector = self.clone();
        let on_panic = self.clone();
        spawn_guarded(
            self.inner.queue.runtime(),
            connector.dial().instrument(self.inner.span.clone()),
            move |panic| on_panic.dial_failed(NetError::Panicked(panic)),
        );
    }

    async fn dial(self) {
        let addr = self.inner.addr.as_str();
        let timeout = self.inner.options.dial_timeout;
        debug!("dialing");

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.dial_failed(NetError::Io(e)),
            Err(_) => {
                return self.dial_failed(NetError::DialTimeout {
                    addr: addr.to_owned(),
                    timeout,
                });
            }
        };

        if let Err(e) = self.start_session(stream) {
            self.dial_failed(e);
        }
    }

    fn dial_failed(&self, error: NetError) {
        warn!(parent: &self.inner.span, error = %error, "connect failed");
        self.set_state(ConnectState::Invalid);
        self.inner.queue.post(NetEvent::Connector {
            connector: self.clone(),
            status: ConnectorStatus::DialFailed(error),
        });
    }

    fn start_session(&self, stream: TcpStream) -> Result<(), NetError> {
        let _ = stream.set_nodelay(true);
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let options = &self.inner.options;

        let session = Session::new(
            self.inner.queue.clone(),
            local,
            remote,
            SessionConfig {
                write_mode: WriteMode::PerItem,
                codec: options.codec,
                registry: Arc::clone(&options.registry),
                rpc_timeout: options.rpc_timeout,
                debug_log: options.debug_log,
                log_span: self.inner.span.clone(),
            },
        );
        session.set_name(options.name.clone());
        session.set_handler(self.handler());
        session.set_concurrency(Arc::clone(&self.inner.concurrency.read()));

        let owner: Weak<ConnectorInner> = Arc::downgrade(&self.inner);
        session.set_on_close(move |error| {
            let Some(inner) = owner.upgrade() else {
                return;
            };
            let connector = Connector { inner };
            connector.set_state(ConnectState::Disconnected);
            connector.inner.queue.post(NetEvent::Connector {
                connector: connector.clone(),
                status: ConnectorStatus::Closed(error),
            });
        });

        *self.inner.session.write() = Some(Arc::clone(&session));
        self.set_state(ConnectState::Connected);
        info!(parent: &self.inner.span, %local, "connected");

        self.inner.queue.post(NetEvent::Connector {
            connector: self.clone(),
            status: ConnectorStatus::Connected,
        });
        session.start(stream);
        self.start_heartbeat(&session);
        Ok(())
    }

    /// Ping `session` now and every heartbeat interval until it closes or
    /// is replaced by a newer connection.
    fn start_heartbeat(&self, session: &Arc<Session>) {
        session.touch_pong();
        if let Err(e) = session.send(&Ping {}) {
            warn!(parent: &self.inner.span, error = %e, "initial ping failed");
            return;
        }

        let connector = self.clone();
        let session = Arc::clone(session);
        self.inner
            .queue
            .tick(self.inner.options.heartbeat.interval, move |now| {
                connector.heartbeat_tick(&session, now)
            });
    }

    fn heartbeat_tick(&self, session: &Arc<Session>, now: Instant) -> bool {
        let current = self
            .live_session()
            .is_some_and(|live| Arc::ptr_eq(&live, session));
        if !current {
            return false;
        }
        let limit = self.inner.options.heartbeat.timeout;
        if !session.check_heartbeat(now, limit) {
            return false;
        }
        if let Err(e) = session.send(&Ping {}) {
            session.close(e);
            return false;
        }
        true
    }

    /// Runs on the event queue for every status this connector posted.
    pub(crate) fn handle_status(&self, status: ConnectorStatus) {
        match status {
            ConnectorStatus::Connected => {
                if let Some(session) = self.session() {
                    self.handler().on_session_connected(&session);
                }
            }
            ConnectorStatus::DialFailed(error) => self.after_failure(&error),
            ConnectorStatus::Closed(error) => {
                if let Some(session) = self.session() {
                    self.handler().on_session_disconnected(&session, &error);
                }
                self.after_failure(&error);
            }
        }
    }

    fn after_failure(&self, error: &NetError) {
        if self.inner.options.reconnect && !self.inner.shut_down.load(Ordering::SeqCst) {
            let delay = self.inner.options.reconnect_delay;
            debug!(parent: &self.inner.span, ?delay, error = %error, "reconnecting");
            if delay.is_zero() {
                self.connect();
            } else {
                let connector = self.clone();
                self.inner.queue.after_func(delay, move |_| connector.connect());
            }
            return;
        }

        let on_failed = self.inner.on_connect_failed.read().clone();
        match on_failed {
            Some(f) => f(self, error),
            None => debug!(parent: &self.inner.span, error = %error, "connection lost"),
        }
    }

    /// Queue a normal message on the current session.
    pub fn send(&self, msg: &dyn AnyMessage) -> Result<(), NetError> {
        match self.live_session() {
            Some(session) => session.send(msg),
            None => Err(NetError::NotConnected),
        }
    }

    pub fn send_no_error(&self, msg: &dyn AnyMessage) {
        if let Err(e) = self.send(msg) {
            error!(parent: &self.inner.span, msg_id = msg.msg_id(), error = %e, "send failed");
        }
    }

    pub fn request(
        &self,
        msg: &dyn AnyMessage,
        callback: impl FnOnce(RpcResult) + Send + Sync + 'static,
    ) -> Result<(), NetError> {
        match self.live_session() {
            Some(session) => session.request(msg, callback),
            None => Err(NetError::NotConnected),
        }
    }

    /// Like [`request`](Self::request); when not connected the callback
    /// receives `NotConnected` right away.
    pub fn request_no_error(
        &self,
        msg: &dyn AnyMessage,
        callback: impl FnOnce(RpcResult) + Send + Sync + 'static,
    ) {
        match self.live_session() {
            Some(session) => session.request_no_error(msg, callback),
            None => callback(Err(NetError::NotConnected)),
        }
    }

    pub async fn call<T: tidewire_proto::Message>(
        &self,
        msg: &dyn AnyMessage,
    ) -> Result<T, NetError> {
        match self.live_session() {
            Some(session) => session.call(msg).await,
            None => Err(NetError::NotConnected),
        }
    }

    /// Close the current session. The reconnect policy still applies.
    pub fn close(&self, err: NetError) {
        if let Some(session) = self.live_session() {
            session.close(err);
        }
    }

    /// Close the current session and never reconnect.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        self.close(NetError::Closed("connector shut down".into()));
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("addr", &self.inner.addr)
            .field("name", &self.inner.options.name)
            .field("state", &self.state())
            .finish()
    }
}
