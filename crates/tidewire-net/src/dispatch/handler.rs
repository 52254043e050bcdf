use std::sync::Arc;

use tidewire_proto::{AnyMessage, messages::base::Success};
use tracing::{debug, info};

use crate::{error::NetError, net::session::Session};

/// Application callbacks for one session.
///
/// Every method has a logging default, so implementors override only what
/// they handle. Calls arrive on the event queue, or on a pool worker for
/// message ids the session's [`ConcurrencyPolicy`](super::ConcurrencyPolicy)
/// marks as concurrent.
pub trait SessionHandler: Send + Sync + 'static {
    fn on_session_connected(&self, session: &Arc<Session>) {
        info!(session_id = session.id(), remote = %session.remote_addr(), "session connected");
    }

    fn on_session_disconnected(&self, session: &Arc<Session>, error: &NetError) {
        info!(
            session_id = session.id(),
            remote = %session.remote_addr(),
            error = %error,
            "session disconnected"
        );
    }

    /// Produce the response for an RPC request. Defaults to an empty
    /// [`Success`].
    fn on_rpc_request(&self, session: &Arc<Session>, msg: Box<dyn AnyMessage>) -> Box<dyn AnyMessage> {
        debug!(session_id = session.id(), msg_id = msg.msg_id(), "unhandled rpc request");
        Box::new(Success {})
    }

    fn on_normal_msg(&self, session: &Arc<Session>, msg: Box<dyn AnyMessage>) {
        debug!(session_id = session.id(), msg_id = msg.msg_id(), "unhandled message");
    }
}

/// Handler that only logs; installed on every new session.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

impl SessionHandler for LogHandler {}
