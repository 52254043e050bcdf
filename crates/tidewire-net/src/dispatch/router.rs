use std::sync::Arc;

use tidewire_proto::{
    Packet, ProtocolKind,
    messages::base::{Ping, Pong, is_heartbeat},
};
use tracing::{debug, error};

use crate::{
    event_queue::QueueEvent,
    net::{inbound::NetEvent, session::Session},
    worker_pool::WorkerPool,
};

/// Build the event queue consumer for network events.
///
/// Lifecycle events go to the session's handler (or the connector that owns
/// it), RPC responses complete their pending requests, Ping/Pong maintain
/// liveness, and everything else reaches the handler: on `pool` when the
/// session's concurrency policy marks the msg id, inline otherwise.
/// `fallback` receives `Stopped` after the pool has been closed.
pub fn dispatch_net_events<F>(
    mut fallback: F,
    pool: Option<WorkerPool>,
) -> impl FnMut(QueueEvent<NetEvent>) + Send + 'static
where
    F: FnMut(QueueEvent<NetEvent>) + Send + 'static,
{
    if let Some(pool) = &pool {
        // Already running is fine: the owner may have started it.
        let _ = pool.run(None);
    }

    move |event| match event {
        QueueEvent::Event(event) => route(event, pool.as_ref()),
        QueueEvent::Stopped => {
            if let Some(pool) = &pool {
                pool.close();
            }
            fallback(QueueEvent::Stopped);
        }
    }
}

fn route(event: NetEvent, pool: Option<&WorkerPool>) {
    match event {
        NetEvent::Connected(session) => session.handler().on_session_connected(&session),
        NetEvent::Disconnected { session, error } => {
            session.handler().on_session_disconnected(&session, &error)
        }
        NetEvent::Connector { connector, status } => connector.handle_status(status),
        NetEvent::Packet { session, packet } => route_packet(session, packet, pool),
    }
}

fn route_packet(session: Arc<Session>, packet: Packet, pool: Option<&WorkerPool>) {
    let msg_id = packet.msg_id();
    match packet.kind {
        ProtocolKind::RpcRequest => {
            let index = packet.rpc_index;
            let s = Arc::clone(&session);
            offload_or_run(pool, &session, msg_id, move || {
                let response = s.handler().on_rpc_request(&s, packet.msg);
                if let Err(e) = s.send_response(index, response.as_ref()) {
                    error!(session_id = s.id(), msg_id, rpc_index = index, error = %e, "send response failed");
                    s.close(e);
                }
            });
        }
        ProtocolKind::RpcResponse => session.response(packet.rpc_index, packet.msg),
        ProtocolKind::Normal if is_heartbeat(msg_id) => {
            session.touch_pong();
            if packet.msg.is::<Ping>() {
                session.send_no_error(&Pong {});
            }
        }
        ProtocolKind::Normal => {
            if session.debug_log() {
                debug!(session_id = session.id(), msg_id, "dispatch");
            }
            let s = Arc::clone(&session);
            offload_or_run(pool, &session, msg_id, move || {
                s.handler().on_normal_msg(&s, packet.msg)
            });
        }
    }
}

fn offload_or_run(
    pool: Option<&WorkerPool>,
    session: &Session,
    msg_id: &str,
    job: impl FnOnce() + Send + 'static,
) {
    match pool {
        Some(pool) if session.concurrency().should_run_concurrently(msg_id) => pool.post(job),
        _ => job(),
    }
}
