use std::sync::{Arc, Mutex, PoisonError};

use crate::session::Session;

/// Receives a JSON body pushed or returned by the platform.
///
/// The body is borrowed for the duration of the call only.
pub type Callback = Arc<dyn Fn(&Session, &str) + Send + Sync>;

/// Receives a server-side RPC call together with the id to reply to
pub type RpcRequestCallback = Arc<dyn Fn(&Session, &str, u32) + Send + Sync>;

struct Slot<T>(Mutex<Option<T>>);

impl<T: Clone> Slot<T> {
    fn set(&self, value: T) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    fn get(&self) -> Option<T> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self(Mutex::new(None))
    }
}

/// One handler per inbound event kind
#[derive(Default)]
pub(crate) struct Callbacks {
    attributes_reply: Slot<Callback>,
    attributes_update: Slot<Callback>,
    rpc_request: Slot<RpcRequestCallback>,
    rpc_reply: Slot<Callback>,
}

impl Callbacks {
    pub fn set_attributes_reply(&self, cb: Callback) {
        self.attributes_reply.set(cb)
    }

    pub fn set_attributes_update(&self, cb: Callback) {
        self.attributes_update.set(cb)
    }

    pub fn set_rpc_request(&self, cb: RpcRequestCallback) {
        self.rpc_request.set(cb)
    }

    pub fn set_rpc_reply(&self, cb: Callback) {
        self.rpc_reply.set(cb)
    }

    // Handlers are cloned out of their slot so that a callback may register
    // another one without deadlocking.

    pub fn attributes_reply(&self) -> Option<Callback> {
        self.attributes_reply.get()
    }

    pub fn attributes_update(&self) -> Option<Callback> {
        self.attributes_update.get()
    }

    pub fn rpc_request(&self) -> Option<RpcRequestCallback> {
        self.rpc_request.get()
    }

    pub fn rpc_reply(&self) -> Option<Callback> {
        self.rpc_reply.get()
    }
}
