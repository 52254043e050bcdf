//! TCP transport core: framed sessions with RPC correlation and heartbeat,
//! client/server connection managers, a single-consumer event queue and an
//! elastic worker pool for offloaded handlers.

pub mod boundary;
pub mod dispatch;
pub mod error;
pub mod event_queue;
pub mod net;
pub mod worker_pool;

pub use dispatch::{
    ConcurrencyPolicy, ConcurrentExcept, ListedConcurrent, LogHandler, Serialized,
    SessionHandler, dispatch_net_events,
};
pub use error::NetError;
pub use event_queue::{EventQueue, EventQueueConfig, QueueEvent};
pub use net::{
    acceptor::{Acceptor, AcceptorConfig},
    connector::{ConnectState, Connector, ConnectorBuilder},
    inbound::{ConnectorStatus, NetEvent, SessionId},
    session::{HeartbeatConfig, RpcResult, Session, SessionConfig, WriteMode},
    session_map::SessionMap,
};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
