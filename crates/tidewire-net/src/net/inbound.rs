use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tidewire_proto::Packet;

use super::{connector::Connector, session::Session};
use crate::error::NetError;

/// Unique session identifier assigned at construction.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Connection state changes reported by a [`Connector`].
#[derive(Debug)]
pub enum ConnectorStatus {
    Connected,
    DialFailed(NetError),
    Closed(NetError),
}

/// Events produced by the network layer and consumed on the event queue.
///
/// - `Connected` is posted once per accepted connection, before its loops start.
/// - `Packet` is posted for every decoded packet, in arrival order.
/// - `Disconnected` is posted once when an accepted session closes.
/// - `Connector` carries dial and lifecycle results of a client connection.
#[derive(Debug)]
pub enum NetEvent {
    Connected(Arc<Session>),
    Packet {
        session: Arc<Session>,
        packet: Packet,
    },
    Disconnected {
        session: Arc<Session>,
        error: NetError,
    },
    Connector {
        connector: Connector,
        status: ConnectorStatus,
    },
}
