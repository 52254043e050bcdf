use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Arc,
};

use tidewire_proto::{AnyMessage, Codec};
use tracing::warn;

use super::{inbound::SessionId, session::Session};
use crate::error::NetError;

/// Live sessions by id, owned by the event queue consumer.
#[derive(Debug, Default)]
pub struct SessionMap {
    sessions: HashMap<SessionId, Arc<Session>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `session`, replacing any previous entry with the same id.
    pub fn add(&mut self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
    }

    /// Remove `session` only if the entry is that exact instance.
    pub fn remove(&mut self, session: &Arc<Session>) -> bool {
        match self.sessions.entry(session.id()) {
            Entry::Occupied(entry) if Arc::ptr_eq(entry.get(), session) => {
                entry.remove();
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: SessionId) -> Option<&Arc<Session>> {
        self.sessions.get(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.sessions.values()
    }

    pub fn send_to(&self, id: SessionId, msg: &dyn AnyMessage) -> Result<(), NetError> {
        match self.sessions.get(&id) {
            Some(session) => session.send(msg),
            None => Err(NetError::SessionClosed),
        }
    }

    /// Broadcast `msg`, encoding it once per codec in use. Sessions that fail
    /// to accept it are closed and dropped from the map.
    pub fn send_to_all(&mut self, msg: &dyn AnyMessage) {
        let mut bodies: HashMap<Codec, Vec<u8>> = HashMap::new();
        let mut failed = Vec::new();

        for (id, session) in &self.sessions {
            let codec = session.codec();
            let body = match bodies.entry(codec) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => match msg.encode(codec) {
                    Ok(body) => entry.insert(body),
                    Err(e) => {
                        warn!(msg_id = msg.msg_id(), %codec, error = %e, "broadcast encode failed");
                        return;
                    }
                },
            };
            if let Err(e) = session.send_bytes(msg.msg_id(), body) {
                warn!(session_id = id, msg_id = msg.msg_id(), error = %e, "broadcast send failed");
                session.close(e);
                failed.push(*id);
            }
        }

        for id in failed {
            self.sessions.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc};

    use tidewire_proto::{Codec, MessageRegistry, ProtocolKind, messages::base::Pong};
    use tokio::io::AsyncReadExt;

    use super::SessionMap;
    use crate::{
        dispatch::dispatch_net_events,
        error::NetError,
        event_queue::{EventQueue, EventQueueConfig},
        net::{
            framing::PacketFramer,
            session::{Session, SessionConfig},
        },
    };

    fn session(queue: &EventQueue<crate::net::inbound::NetEvent>, codec: Codec) -> Arc<Session> {
        let addr: SocketAddr = "127.0.0.1:7100".parse().unwrap();
        Session::new(
            queue.clone(),
            addr,
            addr,
            SessionConfig {
                codec,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn remove_ignores_a_different_instance() {
        let queue = EventQueue::new(EventQueueConfig::default());
        let a = session(&queue, Codec::Binary);
        let b = session(&queue, Codec::Binary);

        let mut map = SessionMap::new();
        map.add(Arc::clone(&a));
        assert!(!map.remove(&b));
        assert_eq!(map.len(), 1);
        assert!(map.remove(&a));
        assert!(map.is_empty());
        assert!(matches!(map.send_to(a.id(), &Pong {}), Err(NetError::SessionClosed)));
    }

    #[tokio::test]
    async fn broadcast_reaches_live_sessions_and_drops_closed_ones() {
        let queue = EventQueue::new(EventQueueConfig::default());
        queue.run(None, dispatch_net_events(|_| {}, None)).unwrap();

        let mut map = SessionMap::new();
        let mut peers = Vec::new();
        for codec in [Codec::Binary, Codec::Text] {
            let (local, peer) = tokio::io::duplex(1 << 16);
            let s = session(&queue, codec);
            s.start(local);
            map.add(s);
            peers.push((codec, peer));
        }
        let dead = session(&queue, Codec::Binary);
        dead.close(NetError::Closed("test".into()));
        map.add(Arc::clone(&dead));

        map.send_to_all(&Pong {});
        assert_eq!(map.len(), 2);
        assert!(map.get(dead.id()).is_none());

        let registry = MessageRegistry::with_base_messages();
        for (codec, mut peer) in peers {
            let mut framer = PacketFramer::new();
            let packet = loop {
                peer.read_buf(framer.buf_mut()).await.unwrap();
                if let Some(p) = framer.next_packet(&registry, codec).unwrap() {
                    break p;
                }
            };
            assert_eq!(packet.kind, ProtocolKind::Normal);
            assert!(packet.msg.is::<Pong>());
        }
    }
}
