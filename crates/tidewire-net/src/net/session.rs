use std::{
    collections::VecDeque,
    fmt,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tidewire_proto::{
    AnyMessage, Codec, Message, MessageRegistry, ProtocolKind, constants::MAX_PACKET_LEN,
    frame::encode_frame, messages::base::ErrorReply,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Notify, oneshot},
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info_span, trace, warn};

use super::{
    framing::{PacketFramer, READ_CHUNK},
    inbound::{NetEvent, SessionId, next_session_id},
};
use crate::{
    boundary::spawn_guarded,
    dispatch::{ConcurrencyPolicy, LogHandler, Serialized, SessionHandler},
    error::NetError,
    event_queue::EventQueue,
};

/// Deadline for a single socket write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(2);
/// Shorter RPC timeouts are raised to this.
pub const MIN_RPC_TIMEOUT: Duration = Duration::from_millis(500);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// How the write loop puts queued frames on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// One write per frame.
    #[default]
    PerItem,
    /// Coalesce queued frames into writes of up to `MAX_PACKET_LEN` bytes.
    Batched,
}

/// Liveness policy: check every `interval`, close after `timeout` without
/// Ping/Pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl HeartbeatConfig {
    /// Passive check used on accepted sessions.
    pub const fn server() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: HEARTBEAT_TIMEOUT,
        }
    }

    /// Active ping used by connectors.
    pub const fn client() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: HEARTBEAT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub write_mode: WriteMode,
    pub codec: Codec,
    pub registry: Arc<MessageRegistry>,
    pub rpc_timeout: Duration,
    /// Trace every sent and received packet.
    pub debug_log: bool,
    /// Parent span for everything this session logs.
    pub log_span: Span,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_mode: WriteMode::PerItem,
            codec: Codec::Binary,
            registry: Arc::new(MessageRegistry::with_base_messages()),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            debug_log: false,
            log_span: Span::none(),
        }
    }
}

pub type RpcResult = Result<Box<dyn AnyMessage>, NetError>;
pub type RpcCallback = Box<dyn FnOnce(RpcResult) + Send + Sync>;
type CloseCallback = Box<dyn FnOnce(NetError) + Send>;

/// One framed connection.
///
/// Always held as `Arc<Session>`. A read loop and a write loop run as tokio
/// tasks from [`start`](Session::start) until the session closes; decoded
/// packets are posted to the owner's event queue.
pub struct Session {
    id: SessionId,
    name: RwLock<String>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    config: SessionConfig,
    span: Span,
    queue: EventQueue<NetEvent>,

    rpc_index: AtomicU32,
    pending: DashMap<u32, RpcCallback>,

    created: Instant,
    /// Millis since `created`.
    last_pong_ms: AtomicU64,

    closed: AtomicBool,
    on_close: Mutex<Option<CloseCallback>>,
    shutdown: CancellationToken,

    outbound: Mutex<VecDeque<Bytes>>,
    outbound_ready: Notify,

    handler: RwLock<Arc<dyn SessionHandler>>,
    concurrency: RwLock<Arc<dyn ConcurrencyPolicy>>,
}

impl Session {
    pub fn new(
        queue: EventQueue<NetEvent>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        mut config: SessionConfig,
    ) -> Arc<Self> {
        let id = next_session_id();
        config.rpc_timeout = config.rpc_timeout.max(MIN_RPC_TIMEOUT);
        let span = info_span!(parent: &config.log_span, "session", id, remote = %remote_addr);

        Arc::new(Self {
            id,
            name: RwLock::new(String::new()),
            local_addr,
            remote_addr,
            config,
            span,
            queue,
            rpc_index: AtomicU32::new(0),
            pending: DashMap::new(),
            created: Instant::now(),
            last_pong_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            on_close: Mutex::new(None),
            shutdown: CancellationToken::new(),
            outbound: Mutex::new(VecDeque::new()),
            outbound_ready: Notify::new(),
            handler: RwLock::new(Arc::new(LogHandler)),
            concurrency: RwLock::new(Arc::new(Serialized)),
        })
    }

    /// Spawn the read and write loops over `stream`.
    pub fn start<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let runtime = self.queue.runtime().clone();

        let session = Arc::clone(self);
        spawn_guarded(
            &runtime,
            Arc::clone(self)
                .read_loop(reader)
                .instrument(self.span.clone()),
            move |panic| session.close(NetError::Panicked(panic)),
        );

        let session = Arc::clone(self);
        spawn_guarded(
            &runtime,
            Arc::clone(self)
                .write_loop(writer)
                .instrument(self.span.clone()),
            move |panic| session.close(NetError::Panicked(panic)),
        );
    }

    async fn read_loop<R: AsyncRead + Unpin>(self: Arc<Self>, mut reader: R) {
        let mut framer = PacketFramer::new();

        loop {
            framer.buf_mut().reserve(READ_CHUNK);
            let read = tokio::select! {
                res = reader.read_buf(framer.buf_mut()) => res,
                _ = self.shutdown.cancelled() => return,
            };
            match read {
                Ok(0) => {
                    self.close(NetError::Eof);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    self.close(NetError::Io(e));
                    return;
                }
            }

            loop {
                match framer.next_packet(&self.config.registry, self.config.codec) {
                    Ok(Some(packet)) => {
                        if self.config.debug_log {
                            trace!(
                                msg_id = packet.msg_id(),
                                kind = ?packet.kind,
                                rpc_index = packet.rpc_index,
                                "recv"
                            );
                        }
                        self.queue.post(NetEvent::Packet {
                            session: Arc::clone(&self),
                            packet,
                        });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "framing error");
                        self.close(e.into());
                        return;
                    }
                }
            }
        }
    }

    async fn write_loop<W: AsyncWrite + Unpin>(self: Arc<Self>, mut writer: W) {
        let mut batch = BytesMut::new();

        loop {
            if self.is_closed() {
                break;
            }
            let pending: Vec<Bytes> = self.outbound.lock().drain(..).collect();
            if pending.is_empty() {
                tokio::select! {
                    _ = self.outbound_ready.notified() => continue,
                    _ = self.shutdown.cancelled() => break,
                }
            }

            let res = tokio::select! {
                res = self.write_pending(&mut writer, &mut batch, &pending) => res,
                _ = self.shutdown.cancelled() => break,
            };
            if let Err(e) = res {
                warn!(error = %e, "write failed");
                self.close(e);
                break;
            }
        }

        let _ = timeout(WRITE_TIMEOUT, writer.shutdown()).await;
    }

    async fn write_pending<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        batch: &mut BytesMut,
        pending: &[Bytes],
    ) -> Result<(), NetError> {
        match self.config.write_mode {
            WriteMode::PerItem => write_each(writer, pending).await,
            WriteMode::Batched => write_batched(writer, batch, pending).await,
        }
    }

    // --- send path ---

    /// Queue a normal message.
    pub fn send(&self, msg: &dyn AnyMessage) -> Result<(), NetError> {
        self.send_packet(ProtocolKind::Normal, 0, msg)
    }

    /// Like [`send`](Self::send), logging failures instead of returning them.
    pub fn send_no_error(&self, msg: &dyn AnyMessage) {
        if let Err(e) = self.send(msg) {
            error!(session_id = self.id, msg_id = msg.msg_id(), error = %e, "send failed");
        }
    }

    /// Queue an already encoded body under `msg_id`.
    pub fn send_bytes(&self, msg_id: &str, body: &[u8]) -> Result<(), NetError> {
        self.send_frame(ProtocolKind::Normal, 0, msg_id, body)
    }

    pub fn send_bytes_no_error(&self, msg_id: &str, body: &[u8]) {
        if let Err(e) = self.send_bytes(msg_id, body) {
            error!(session_id = self.id, msg_id, error = %e, "send failed");
        }
    }

    /// Answer the request that carried `rpc_index`.
    pub fn send_response(&self, rpc_index: u32, msg: &dyn AnyMessage) -> Result<(), NetError> {
        self.send_packet(ProtocolKind::RpcResponse, rpc_index, msg)
    }

    fn send_packet(
        &self,
        kind: ProtocolKind,
        rpc_index: u32,
        msg: &dyn AnyMessage,
    ) -> Result<(), NetError> {
        if self.is_closed() {
            return Err(NetError::SessionClosed);
        }
        let body = msg.encode(self.config.codec)?;
        self.send_frame(kind, rpc_index, msg.msg_id(), &body)
    }

    fn send_frame(
        &self,
        kind: ProtocolKind,
        rpc_index: u32,
        msg_id: &str,
        body: &[u8],
    ) -> Result<(), NetError> {
        if self.is_closed() {
            return Err(NetError::SessionClosed);
        }
        let frame = encode_frame(kind, rpc_index, msg_id, body)?;
        if self.config.debug_log {
            let _enter = self.span.enter();
            trace!(msg_id, ?kind, rpc_index, len = frame.len(), "send");
        }
        self.outbound.lock().push_back(Bytes::from(frame));
        self.outbound_ready.notify_one();
        Ok(())
    }

    // --- rpc ---

    fn next_rpc_index(&self) -> u32 {
        loop {
            // 0 marks normal packets
            let index = self.rpc_index.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if index != 0 {
                return index;
            }
        }
    }

    /// Send `msg` as a request; `callback` runs on the event queue exactly
    /// once with the response or a timeout error.
    ///
    /// On error the callback is dropped without being called.
    pub fn request(
        self: &Arc<Self>,
        msg: &dyn AnyMessage,
        callback: impl FnOnce(RpcResult) + Send + Sync + 'static,
    ) -> Result<(), NetError> {
        self.try_request(msg, Box::new(callback)).map_err(|(e, _)| e)
    }

    /// Like [`request`](Self::request), but a send failure is delivered to
    /// `callback` and closes the session.
    pub fn request_no_error(
        self: &Arc<Self>,
        msg: &dyn AnyMessage,
        callback: impl FnOnce(RpcResult) + Send + Sync + 'static,
    ) {
        if let Err((e, callback)) = self.try_request(msg, Box::new(callback)) {
            error!(session_id = self.id, msg_id = msg.msg_id(), error = %e, "request failed");
            let reason = e.to_string();
            callback(Err(e));
            self.close(NetError::Closed(reason));
        }
    }

    fn try_request(
        self: &Arc<Self>,
        msg: &dyn AnyMessage,
        callback: RpcCallback,
    ) -> Result<(), (NetError, RpcCallback)> {
        // The timeout timer needs a running queue.
        if self.queue.is_stopped() {
            return Err((NetError::QueueStopped, callback));
        }
        let index = self.next_rpc_index();
        // Registered before sending so a fast response always finds it.
        self.pending.insert(index, callback);

        if let Err(e) = self.send_packet(ProtocolKind::RpcRequest, index, msg) {
            return match self.pending.remove(&index) {
                Some((_, callback)) => Err((e, callback)),
                None => Err((e, Box::new(|_| {}))),
            };
        }

        let session = Arc::clone(self);
        let rpc_timeout = self.config.rpc_timeout;
        let msg_id = msg.msg_id();
        self.queue.after_func(rpc_timeout, move |_| {
            if let Some((_, callback)) = session.pending.remove(&index) {
                warn!(session_id = session.id, msg_id, rpc_index = index, "rpc response timeout");
                callback(Err(NetError::RpcTimeout(rpc_timeout)));
            }
        });
        if self.queue.is_stopped() {
            if let Some((_, callback)) = self.pending.remove(&index) {
                return Err((NetError::QueueStopped, callback));
            }
        }
        Ok(())
    }

    /// Await the typed reply to `msg`.
    ///
    /// A base `ErrorReply` becomes `NetError::Remote`; any other type is
    /// `NetError::UnexpectedResponse`.
    pub async fn call<T: Message>(self: &Arc<Self>, msg: &dyn AnyMessage) -> Result<T, NetError> {
        let (tx, rx) = oneshot::channel();
        self.request(msg, move |res| {
            let _ = tx.send(res);
        })?;
        let reply = rx.await.map_err(|_| NetError::SessionClosed)??;
        into_reply(reply)
    }

    /// Complete the pending request `rpc_index` with `msg`.
    pub(crate) fn response(&self, rpc_index: u32, msg: Box<dyn AnyMessage>) {
        match self.pending.remove(&rpc_index) {
            Some((_, callback)) => callback(Ok(msg)),
            None => {
                let _enter = self.span.enter();
                warn!(
                    rpc_index,
                    msg_id = msg.msg_id(),
                    "response without pending request, dropped"
                );
            }
        }
    }

    /// Number of requests still waiting for a response or timeout.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    // --- heartbeat ---

    pub fn touch_pong(&self) {
        let ms = self.created.elapsed().as_millis() as u64;
        self.last_pong_ms.store(ms, Ordering::Relaxed);
    }

    pub fn since_last_pong(&self, now: Instant) -> Duration {
        let last = self.created + Duration::from_millis(self.last_pong_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(last)
    }

    /// Close the session when the last Ping/Pong is older than `limit`.
    /// Returns whether the session is still open.
    pub fn check_heartbeat(&self, now: Instant, limit: Duration) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.since_last_pong(now) > limit {
            let _enter = self.span.enter();
            warn!(?limit, "heartbeat timeout");
            self.close(NetError::HeartbeatTimeout(limit));
            return false;
        }
        true
    }

    // --- lifecycle ---

    /// Called once with the error that closed the session.
    pub fn set_on_close(&self, f: impl FnOnce(NetError) + Send + 'static) {
        *self.on_close.lock() = Some(Box::new(f));
    }

    /// Close the session. Only the first call has any effect.
    pub fn close(&self, err: NetError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.outbound_ready.notify_one();
        {
            let _enter = self.span.enter();
            debug!(error = %err, "session closed");
        }

        let on_close = self.on_close.lock().take();
        if let Some(on_close) = on_close {
            on_close(err);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // --- accessors ---

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote_addr.ip()
    }

    pub fn codec(&self) -> Codec {
        self.config.codec
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.config.rpc_timeout
    }

    pub fn debug_log(&self) -> bool {
        self.config.debug_log
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn queue(&self) -> &EventQueue<NetEvent> {
        &self.queue
    }

    pub fn handler(&self) -> Arc<dyn SessionHandler> {
        Arc::clone(&self.handler.read())
    }

    pub fn set_handler(&self, handler: Arc<dyn SessionHandler>) {
        *self.handler.write() = handler;
    }

    pub fn concurrency(&self) -> Arc<dyn ConcurrencyPolicy> {
        Arc::clone(&self.concurrency.read())
    }

    pub fn set_concurrency(&self, policy: Arc<dyn ConcurrencyPolicy>) {
        *self.concurrency.write() = policy;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("local", &self.local_addr)
            .field("remote", &self.remote_addr)
            .field("codec", &self.config.codec)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Turn an RPC reply into the expected type.
pub fn into_reply<T: Message>(reply: Box<dyn AnyMessage>) -> Result<T, NetError> {
    match reply.downcast::<T>() {
        Ok(value) => Ok(*value),
        Err(other) => match other.downcast_ref::<ErrorReply>() {
            Some(e) => Err(NetError::Remote {
                code: e.code,
                message: e.message.clone(),
            }),
            None => Err(NetError::UnexpectedResponse {
                got: other.msg_id(),
                expected: T::MSG_ID,
            }),
        },
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<(), NetError> {
    match timeout(WRITE_TIMEOUT, writer.write_all(frame)).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(NetError::WriteTimeout(WRITE_TIMEOUT)),
    }
}

async fn write_each<W: AsyncWrite + Unpin>(writer: &mut W, frames: &[Bytes]) -> Result<(), NetError> {
    for frame in frames {
        write_frame(writer, frame).await?;
    }
    Ok(())
}

async fn write_batched<W: AsyncWrite + Unpin>(
    writer: &mut W,
    batch: &mut BytesMut,
    frames: &[Bytes],
) -> Result<(), NetError> {
    if let [single] = frames {
        return write_frame(writer, single).await;
    }

    batch.clear();
    for frame in frames {
        if !batch.is_empty() && batch.len() + frame.len() > MAX_PACKET_LEN {
            write_frame(writer, &batch[..]).await?;
            batch.clear();
        }
        batch.extend_from_slice(frame);
    }
    if !batch.is_empty() {
        write_frame(writer, &batch[..]).await?;
        batch.clear();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use serde::{Deserialize, Serialize};
    use tidewire_proto::{
        AnyMessage, Codec, MessageRegistry, ProtoError, ProtocolKind,
        constants::MAX_PACKET_LEN,
        frame::encode_message,
        messages::base::{ErrorReply, Ping, Pong},
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
        sync::mpsc,
        time::Instant,
    };

    use super::{HeartbeatConfig, Session, SessionConfig, WriteMode, into_reply};
    use crate::{
        dispatch::dispatch_net_events,
        error::NetError,
        event_queue::{EventQueue, EventQueueConfig},
        net::{framing::PacketFramer, inbound::NetEvent},
    };

    #[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
    struct Echo {
        value: String,
    }
    tidewire_proto::impl_message!(Echo => "test.Echo");

    fn registry() -> Arc<MessageRegistry> {
        Arc::new(MessageRegistry::with_base_messages().with::<Echo>())
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    fn running_queue() -> EventQueue<NetEvent> {
        let queue = EventQueue::new(EventQueueConfig::default());
        queue.run(None, dispatch_net_events(|_| {}, None)).unwrap();
        queue
    }

    fn session_pair(config: SessionConfig) -> (Arc<Session>, DuplexStream) {
        let (local, remote) = tokio::io::duplex(1 << 20);
        let session = Session::new(running_queue(), addr(), addr(), config);
        session.start(local);
        (session, remote)
    }

    async fn read_packets(
        peer: &mut DuplexStream,
        framer: &mut PacketFramer,
        want: usize,
    ) -> Vec<tidewire_proto::Packet> {
        let registry = registry();
        let mut out = Vec::new();
        while out.len() < want {
            let n = peer.read_buf(framer.buf_mut()).await.unwrap();
            assert!(n > 0, "peer closed early");
            out.extend(framer.drain_packets(&registry, Codec::Binary).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_callbacks() {
        let (session, mut peer) = session_pair(SessionConfig {
            registry: registry(),
            ..Default::default()
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..32 {
            let tx = tx.clone();
            session
                .request(&Echo { value: i.to_string() }, move |res| {
                    let _ = tx.send((i, res));
                })
                .unwrap();
        }
        drop(tx);

        let mut framer = PacketFramer::new();
        let requests = read_packets(&mut peer, &mut framer, 32).await;
        for req in requests.iter().rev() {
            assert_eq!(req.kind, ProtocolKind::RpcRequest);
            let frame = encode_message(
                Codec::Binary,
                ProtocolKind::RpcResponse,
                req.rpc_index,
                req.msg.as_ref(),
            )
            .unwrap();
            peer.write_all(&frame).await.unwrap();
        }

        let mut seen = Vec::new();
        while let Some((i, res)) = rx.recv().await {
            let echo: Echo = into_reply(res.unwrap()).unwrap();
            assert_eq!(echo.value, i.to_string());
            seen.push(i);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rpc_timeout_fires_once_and_late_response_is_dropped() {
        let (session, mut peer) = session_pair(SessionConfig {
            registry: registry(),
            rpc_timeout: Duration::from_millis(100),
            ..Default::default()
        });
        assert_eq!(session.rpc_timeout(), Duration::from_millis(500));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        session
            .request(&Echo { value: "late".into() }, move |res| {
                let _ = tx.send(res);
            })
            .unwrap();

        let res = rx.recv().await.unwrap();
        assert!(matches!(res, Err(NetError::RpcTimeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(session.pending_requests(), 0);

        let mut framer = PacketFramer::new();
        let req = read_packets(&mut peer, &mut framer, 1).await.remove(0);
        let frame = encode_message(
            Codec::Binary,
            ProtocolKind::RpcResponse,
            req.rpc_index,
            req.msg.as_ref(),
        )
        .unwrap();
        peer.write_all(&frame).await.unwrap();
        session.queue().post_wait(|| ()).await.unwrap();

        // The callback was consumed by the timeout; nothing else arrives.
        assert!(rx.recv().await.is_none());
        assert!(!session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_closes_exactly_once() {
        let (session, _peer) = session_pair(SessionConfig::default());
        let closes = Arc::new(AtomicUsize::new(0));
        let c = closes.clone();
        session.set_on_close(move |err| {
            assert!(matches!(err, NetError::HeartbeatTimeout(_)));
            c.fetch_add(1, Ordering::SeqCst);
        });

        let hb = HeartbeatConfig::server();
        let s = session.clone();
        session
            .queue()
            .tick(hb.interval, move |now| s.check_heartbeat(now, hb.timeout));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(!session.is_closed());

        tokio::time::sleep(Duration::from_secs(32)).await;
        session.queue().post_wait(|| ()).await.unwrap();
        assert!(session.is_closed());

        session.close(NetError::Eof);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn racing_closes_on_an_open_session_fire_on_close_once() {
        let (session, _peer) = session_pair(SessionConfig::default());
        let winners = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let w = winners.clone();
        session.set_on_close(move |err| w.lock().push(err.to_string()));

        let barrier = Arc::new(std::sync::Barrier::new(8));
        let racers: Vec<_> = (0..8)
            .map(|i| {
                let (s, b) = (session.clone(), barrier.clone());
                std::thread::spawn(move || {
                    b.wait();
                    s.close(NetError::Closed(format!("racer {i}")));
                })
            })
            .collect();
        for r in racers {
            r.join().unwrap();
        }

        assert!(session.is_closed());
        let winners = winners.lock();
        assert_eq!(winners.len(), 1);
        assert!(winners[0].contains("racer"));
    }

    #[tokio::test]
    async fn request_on_a_stopped_queue_fails_instead_of_hanging() {
        let (session, _peer) = session_pair(SessionConfig::default());
        session.queue().stop().await;

        assert!(matches!(
            session.request(&Ping {}, |_| {}),
            Err(NetError::QueueStopped)
        ));
        assert_eq!(session.pending_requests(), 0);

        let res = tokio::time::timeout(Duration::from_secs(1), session.call::<Pong>(&Ping {})).await;
        assert!(matches!(res, Ok(Err(NetError::QueueStopped))));
        assert!(!session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn close_interrupts_a_stalled_write() {
        // Tiny pipe the peer never drains.
        let (local, _peer) = tokio::io::duplex(64);
        let session = Session::new(running_queue(), addr(), addr(), SessionConfig {
            registry: registry(),
            ..Default::default()
        });
        session.start(local);
        session.send(&Echo { value: "x".repeat(4096) }).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        session.close(NetError::Closed("test".into()));
        // Both loops drop their handle once they exit.
        let loops_done = tokio::time::timeout(Duration::from_millis(500), async {
            while Arc::strong_count(&session) > 1 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        assert!(loops_done.is_ok(), "write loop still blocked after close");
    }

    #[tokio::test(start_paused = true)]
    async fn ping_updates_liveness_and_is_answered_with_pong() {
        let (session, mut peer) = session_pair(SessionConfig::default());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(session.since_last_pong(Instant::now()) >= Duration::from_secs(20));
        let ping = encode_message(Codec::Binary, ProtocolKind::Normal, 0, &Ping {}).unwrap();
        peer.write_all(&ping).await.unwrap();

        let mut framer = PacketFramer::new();
        let pong = read_packets(&mut peer, &mut framer, 1).await.remove(0);
        assert_eq!(pong.msg_id(), "base.Pong");
        assert!(session.since_last_pong(Instant::now()) < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn oversize_send_is_rejected_and_nothing_is_written() {
        let (session, mut peer) = session_pair(SessionConfig {
            registry: registry(),
            ..Default::default()
        });
        let big = Echo {
            value: "x".repeat(MAX_PACKET_LEN),
        };
        assert!(matches!(
            session.send(&big),
            Err(NetError::Proto(ProtoError::PacketTooLarge(_)))
        ));

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_millis(100), peer.read(&mut buf)).await;
        assert!(read.is_err(), "no bytes should reach the peer");
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn send_after_close_fails_and_request_no_error_reports() {
        let (session, _peer) = session_pair(SessionConfig::default());
        session.close(NetError::Closed("test".into()));

        assert!(matches!(session.send(&Ping {}), Err(NetError::SessionClosed)));
        assert!(matches!(
            session.send_bytes("base.Ping", &[]),
            Err(NetError::SessionClosed)
        ));

        let (tx, rx) = std::sync::mpsc::channel();
        session.request_no_error(&Ping {}, move |res| {
            let _ = tx.send(res.is_err());
        });
        assert!(rx.recv().unwrap());
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn garbage_length_prefix_closes_the_session() {
        let (session, mut peer) = session_pair(SessionConfig::default());
        let (tx, rx) = tokio::sync::oneshot::channel();
        session.set_on_close(move |err| {
            let _ = tx.send(err);
        });

        peer.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        let err = rx.await.unwrap();
        assert!(matches!(
            err,
            NetError::Proto(ProtoError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn batched_mode_coalesces_queued_frames() {
        let (session, mut peer) = session_pair(SessionConfig {
            write_mode: WriteMode::Batched,
            registry: registry(),
            ..Default::default()
        });
        for i in 0..50 {
            session.send(&Echo { value: i.to_string() }).unwrap();
        }

        let mut framer = PacketFramer::new();
        let got = read_packets(&mut peer, &mut framer, 50).await;
        let values: Vec<String> = got
            .iter()
            .map(|p| p.msg.downcast_ref::<Echo>().unwrap().value.clone())
            .collect();
        assert_eq!(values, (0..50).map(|i| i.to_string()).collect::<Vec<_>>());
    }

    #[test]
    fn remote_error_reply_maps_to_net_error() {
        let reply: Box<dyn AnyMessage> = Box::new(ErrorReply {
            code: 4,
            message: "denied".into(),
        });
        assert!(matches!(
            into_reply::<Echo>(reply),
            Err(NetError::Remote { code: 4, .. })
        ));

        let reply: Box<dyn AnyMessage> = Box::new(Ping {});
        assert!(matches!(
            into_reply::<Echo>(reply),
            Err(NetError::UnexpectedResponse {
                got: "base.Ping",
                ..
            })
        ));
    }
}
