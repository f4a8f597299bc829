// Copyright (c) 2026 The uresourced developers
//
// SPDX-License-Identifier: Apache-2.0
//

//! Outstanding-call accounting for clean shutdown.
//!
//! Every asynchronous bus call holds a [`PendingGuard`] for its lifetime;
//! [`PendingCalls::flush`] resolves once the count has drained to zero so
//! that shutdown writes are known to have reached the bus.

use std::cell::Cell;
use std::rc::Rc;

use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct PendingCalls {
    inner: Rc<Inner>,
}

#[derive(Default)]
struct Inner {
    count: Cell<u32>,
    drained: Notify,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u32 {
        self.inner.count.get()
    }

    /// Account for one outstanding call until the guard is dropped.
    pub fn guard(&self) -> PendingGuard {
        self.inner.count.set(self.inner.count.get() + 1);
        PendingGuard {
            inner: Rc::clone(&self.inner),
        }
    }

    /// Wait until no calls are outstanding.
    pub async fn flush(&self) {
        loop {
            if self.count() == 0 {
                return;
            }
            let drained = self.inner.drained.notified();
            if self.count() == 0 {
                return;
            }
            drained.await;
        }
    }
}

pub struct PendingGuard {
    inner: Rc<Inner>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let count = self.inner.count.get() - 1;
        self.inner.count.set(count);
        if count == 0 {
            self.inner.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn guards_track_count() {
        let pending = PendingCalls::new();
        assert_eq!(pending.count(), 0);

        let first = pending.guard();
        let second = pending.guard();
        assert_eq!(pending.count(), 2);

        drop(first);
        assert_eq!(pending.count(), 1);
        drop(second);
        assert_eq!(pending.count(), 0);
    }

    #[tokio::test]
    async fn flush_returns_once_drained() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let pending = PendingCalls::new();
                let guard = pending.guard();

                tokio::task::spawn_local(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    drop(guard);
                });

                pending.flush().await;
                assert_eq!(pending.count(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn flush_is_immediate_without_calls() {
        let pending = PendingCalls::new();
        pending.flush().await;
    }
}
