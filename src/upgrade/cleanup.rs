//! Best-effort actions that run on every exit path of an upgrade.

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::Result;

/// Ordered cleanup actions. They run last-registered first; a failing action
/// is logged and the rest still run.
#[derive(Default)]
pub struct CleanupList<'a> {
    actions: Vec<(String, BoxFuture<'a, Result<()>>)>,
}

impl<'a> CleanupList<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, action: BoxFuture<'a, Result<()>>) {
        self.actions.push((name.into(), action));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub async fn run(self) {
        for (name, action) in self.actions.into_iter().rev() {
            match action.await {
                Ok(()) => debug!(action = %name, "Cleanup action finished"),
                Err(e) => warn!(action = %name, error = %e, "Cleanup action failed"),
            }
        }
    }
}
