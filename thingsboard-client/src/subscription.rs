use std::fmt::Display;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;
use tracing::trace;

use crate::error::Error;
use crate::util::interrupt::Interrupt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Attributes,
    Rpc,
}

impl Display for SubscriptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionKind::Attributes => f.write_str("attributes"),
            SubscriptionKind::Rpc => f.write_str("rpc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    #[default]
    Inactive,
    Active,
    CleanupPending,
    Cleaned,
}

impl SubscriptionState {
    /// True while delivery may still happen
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SubscriptionState::Active | SubscriptionState::CleanupPending
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Status {
    state: SubscriptionState,
    // callbacks currently running
    deliveries: usize,
}

impl Status {
    fn is_settled(&self) -> bool {
        !self.state.is_live() && self.deliveries == 0
    }
}

/// Lifecycle of one subscription kind within a session.
///
/// The state lives in a watch channel so that teardown can be awaited
/// instead of polled. It is kept together with the number of running
/// callbacks, a callback is only started while the subscription is active
/// and teardown is not complete until every started callback has returned.
///
/// The interrupt is replaced on every activation and handed to whatever
/// delivers messages for the subscription.
pub(crate) struct Subscription {
    kind: SubscriptionKind,
    status: watch::Sender<Status>,
    interrupt: Mutex<Interrupt>,
}

/// Marks a running callback, see [Subscription::deliver]
struct Delivery<'a>(&'a Subscription);

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        self.0.status.send_modify(|status| status.deliveries -= 1);
    }
}

impl Subscription {
    pub fn new(kind: SubscriptionKind) -> Self {
        let (status, _) = watch::channel(Status::default());
        Self {
            kind,
            status,
            interrupt: Mutex::new(Interrupt::new()),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.status.borrow().state
    }

    /// Move to `Active`, running `install` as part of the same transition.
    ///
    /// Fails with [Error::AlreadyActive] if the subscription is active or
    /// still tearing down, in which case `install` is not called.
    pub fn activate<F>(&self, install: F) -> Result<Interrupt, Error>
    where
        F: FnOnce(),
    {
        let mut interrupt = None;
        let activated = self.status.send_if_modified(|status| {
            if status.state.is_live() {
                return false;
            }
            install();
            let fresh = Interrupt::new();
            *self.interrupt.lock().unwrap_or_else(PoisonError::into_inner) = fresh.clone();
            interrupt = Some(fresh);
            status.state = SubscriptionState::Active;
            true
        });

        match interrupt {
            Some(interrupt) if activated => {
                trace!(kind = %self.kind, "subscription active");
                Ok(interrupt)
            }
            _ => Err(Error::AlreadyActive(self.kind)),
        }
    }

    /// Request teardown of an active subscription and signal its interrupt.
    ///
    /// Returns false if there was nothing to tear down.
    pub fn request_teardown(&self) -> bool {
        let requested = self.status.send_if_modified(|status| {
            if status.state == SubscriptionState::Active {
                status.state = SubscriptionState::CleanupPending;
                true
            } else {
                false
            }
        });
        if requested {
            trace!(kind = %self.kind, "subscription cleanup pending");
            self.interrupt
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .trigger();
        }
        requested
    }

    /// Run `callback` if the subscription is active.
    ///
    /// Teardown waits for the callback to return. A callback must therefore
    /// not wait on the unsubscribe of its own subscription, it can hand that
    /// to a task instead.
    pub fn deliver<F>(&self, callback: F) -> bool
    where
        F: FnOnce(),
    {
        let mut admitted = false;
        // starting a delivery settles nothing, no need to wake waiters
        self.status.send_if_modified(|status| {
            if status.state == SubscriptionState::Active {
                status.deliveries += 1;
                admitted = true;
            }
            false
        });
        if !admitted {
            return false;
        }

        let _delivery = Delivery(self);
        callback();
        true
    }

    /// Mark delivery as finished, releasing anyone blocked in
    /// [Subscription::wait_cleaned] once running callbacks return
    pub fn mark_cleaned(&self) {
        let cleaned = self.status.send_if_modified(|status| {
            if status.state.is_live() {
                status.state = SubscriptionState::Cleaned;
                true
            } else {
                false
            }
        });
        if cleaned {
            trace!(kind = %self.kind, "subscription cleaned");
        }
    }

    /// Wait until no delivery is running for this subscription
    pub async fn wait_cleaned(&self) {
        let mut rx = self.status.subscribe();
        // the sender is owned by self so the channel cannot close under us
        let _ = rx.wait_for(Status::is_settled).await;
    }
}
