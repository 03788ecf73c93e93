use std::sync::atomic::{AtomicUsize, Ordering};

use crate::hub::Hub;

/// Shared by every connection handler.
#[derive(Default)]
pub struct RelayState {
    pub hub: Hub,
    connections: AtomicUsize,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connected(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn disconnected(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}
