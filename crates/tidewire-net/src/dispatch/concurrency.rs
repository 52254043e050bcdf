use std::collections::HashSet;

use tidewire_proto::Message;

/// Decides which message ids are handled on the worker pool.
pub trait ConcurrencyPolicy: Send + Sync + 'static {
    fn should_run_concurrently(&self, msg_id: &str) -> bool;
}

/// Everything runs on the event queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct Serialized;

impl ConcurrencyPolicy for Serialized {
    fn should_run_concurrently(&self, _msg_id: &str) -> bool {
        false
    }
}

/// Only listed message ids run on the pool.
#[derive(Debug, Default, Clone)]
pub struct ListedConcurrent {
    ids: HashSet<String>,
}

impl ListedConcurrent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Message>(self) -> Self {
        self.with_id(T::MSG_ID)
    }

    pub fn with_id(mut self, msg_id: impl Into<String>) -> Self {
        self.ids.insert(msg_id.into());
        self
    }
}

impl ConcurrencyPolicy for ListedConcurrent {
    fn should_run_concurrently(&self, msg_id: &str) -> bool {
        self.ids.contains(msg_id)
    }
}

/// Every message id runs on the pool except the listed ones.
#[derive(Debug, Default, Clone)]
pub struct ConcurrentExcept {
    ids: HashSet<String>,
}

impl ConcurrentExcept {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Message>(self) -> Self {
        self.with_id(T::MSG_ID)
    }

    pub fn with_id(mut self, msg_id: impl Into<String>) -> Self {
        self.ids.insert(msg_id.into());
        self
    }
}

impl ConcurrencyPolicy for ConcurrentExcept {
    fn should_run_concurrently(&self, msg_id: &str) -> bool {
        !self.ids.contains(msg_id)
    }
}

#[cfg(test)]
mod tests {
    use tidewire_proto::messages::base::{Ping, Success};

    use super::{ConcurrencyPolicy, ConcurrentExcept, ListedConcurrent, Serialized};

    #[test]
    fn policies_partition_message_ids() {
        let listed = ListedConcurrent::new().with::<Success>().with_id("game.Move");
        assert!(listed.should_run_concurrently("base.Success"));
        assert!(listed.should_run_concurrently("game.Move"));
        assert!(!listed.should_run_concurrently("base.Ping"));

        let except = ConcurrentExcept::new().with::<Ping>();
        assert!(!except.should_run_concurrently("base.Ping"));
        assert!(except.should_run_concurrently("game.Move"));

        assert!(!Serialized.should_run_concurrently("game.Move"));
    }
}
