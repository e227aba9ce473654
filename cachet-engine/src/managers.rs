//! Host focus and connectivity state.
//!
//! Both are plain flags on watch channels. The client flips them; fetches
//! and pollers read them.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

#[derive(Clone)]
struct Flag {
    name: &'static str,
    tx: Arc<watch::Sender<bool>>,
}

impl Flag {
    fn new(name: &'static str, initial: bool) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            name,
            tx: Arc::new(tx),
        }
    }

    fn get(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns true when the value actually changed.
    fn set(&self, value: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
        if changed {
            debug!(flag = self.name, value, "Environment flag changed");
        }
        changed
    }

    async fn wait_for(&self, value: bool) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() == value {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Whether the host application currently has focus.
#[derive(Clone)]
pub struct FocusManager {
    flag: Flag,
}

impl Default for FocusManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FocusManager {
    /// Starts focused.
    pub fn new() -> Self {
        Self {
            flag: Flag::new("focused", true),
        }
    }

    pub fn is_focused(&self) -> bool {
        self.flag.get()
    }

    pub fn set_focused(&self, focused: bool) -> bool {
        self.flag.set(focused)
    }
}

/// Whether the network is reachable.
#[derive(Clone)]
pub struct OnlineManager {
    flag: Flag,
}

impl Default for OnlineManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OnlineManager {
    /// Starts online.
    pub fn new() -> Self {
        Self {
            flag: Flag::new("online", true),
        }
    }

    pub fn is_online(&self) -> bool {
        self.flag.get()
    }

    pub fn set_online(&self, online: bool) -> bool {
        self.flag.set(online)
    }

    /// Resolves once the network is reachable.
    pub async fn wait_online(&self) {
        self.flag.wait_for(true).await
    }
}
