pub mod acceptor;
pub mod connector;
pub mod framing;
pub mod inbound;
pub mod session;
pub mod session_map;
