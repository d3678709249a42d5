//! Lifecycle notifications of a serial channel
//!
//! Three independent subscription points (opened, closed, error). Handlers
//! run synchronously on the thread that called `open`/`close`, in the order
//! they were subscribed. The handler list is snapshotted before dispatch so a
//! handler may subscribe further handlers.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use super::SerialChannel;

/// `(channel, port, baud, is_open)`
pub type OpenedHandler = dyn Fn(&SerialChannel, u32, u32, bool) + Send + Sync;
/// `(channel, port, baud, is_now_closed)`
pub type ClosedHandler = dyn Fn(&SerialChannel, u32, u32, bool) + Send + Sync;
/// `(channel, port, baud, message)`
pub type ErrorHandler = dyn Fn(&SerialChannel, u32, u32, &str) + Send + Sync;

/// Owned form of a notification, for consumers that prefer a queue over callbacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelEvent {
    Opened {
        session_id: String,
        port: u32,
        baud: u32,
        is_open: bool,
    },
    Closed {
        session_id: String,
        port: u32,
        baud: u32,
        is_closed: bool,
    },
    Error {
        session_id: String,
        port: u32,
        baud: u32,
        message: String,
    },
}

struct HandlerList<H: ?Sized> {
    handlers: RwLock<Vec<Arc<H>>>,
}

impl<H: ?Sized> HandlerList<H> {
    fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    fn push(&self, handler: Arc<H>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    fn snapshot(&self) -> Vec<Arc<H>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Subscribers of one channel
pub(crate) struct EventHandlers {
    opened: HandlerList<OpenedHandler>,
    closed: HandlerList<ClosedHandler>,
    error: HandlerList<ErrorHandler>,
}

impl EventHandlers {
    pub(crate) fn new() -> Self {
        Self {
            opened: HandlerList::new(),
            closed: HandlerList::new(),
            error: HandlerList::new(),
        }
    }

    pub(crate) fn add_opened(&self, handler: Arc<OpenedHandler>) {
        self.opened.push(handler);
    }

    pub(crate) fn add_closed(&self, handler: Arc<ClosedHandler>) {
        self.closed.push(handler);
    }

    pub(crate) fn add_error(&self, handler: Arc<ErrorHandler>) {
        self.error.push(handler);
    }

    pub(crate) fn fire_opened(
        &self,
        channel: &SerialChannel,
        port: u32,
        baud: u32,
        is_open: bool,
    ) {
        for handler in self.opened.snapshot() {
            handler(channel, port, baud, is_open);
        }
    }

    pub(crate) fn fire_closed(
        &self,
        channel: &SerialChannel,
        port: u32,
        baud: u32,
        is_closed: bool,
    ) {
        for handler in self.closed.snapshot() {
            handler(channel, port, baud, is_closed);
        }
    }

    pub(crate) fn fire_error(
        &self,
        channel: &SerialChannel,
        port: u32,
        baud: u32,
        message: &str,
    ) {
        for handler in self.error.snapshot() {
            handler(channel, port, baud, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn handler_list_keeps_subscription_order() {
        let list: HandlerList<dyn Fn() -> usize + Send + Sync> = HandlerList::new();
        list.push(Arc::new(|| 1));
        list.push(Arc::new(|| 2));
        let order: Vec<usize> = list.snapshot().iter().map(|h| h()).collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn snapshot_allows_subscribing_during_dispatch() {
        let list: Arc<HandlerList<dyn Fn() + Send + Sync>> = Arc::new(HandlerList::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let inner_list = Arc::clone(&list);
        let inner_calls = Arc::clone(&calls);
        list.push(Arc::new(move || {
            inner_calls.fetch_add(1, Ordering::SeqCst);
            inner_list.push(Arc::new(|| {}));
        }));

        for handler in list.snapshot() {
            handler();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(list.snapshot().len(), 2);
    }
}
