//! Event dispatch to consumer handlers.
//!
//! Every channel keeps an ordered list of handlers. Dispatch snapshots the
//! list and calls handlers with no lock held, so a handler may register,
//! unregister or call back into the stream. A panicking handler is logged
//! and skipped; the rest still run.

use crate::domain::price::PriceRecord;
use crate::error::StreamError;
use crate::shared::TokenSlug;
use crate::ws::{ConnectionState, StreamEvent};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

/// Consumer-facing event channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    PriceUpdate,
    ConnectionChange,
    Error,
    SubscriptionUpdate,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::PriceUpdate => "price-update",
            Channel::ConnectionChange => "connection-change",
            Channel::Error => "error",
            Channel::SubscriptionUpdate => "subscription-update",
        };
        f.write_str(name)
    }
}

/// Returned by every registration; pass to [`EventDispatcher::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    channel: Channel,
    id: u64,
}

impl HandlerId {
    pub fn channel(&self) -> Channel {
        self.channel
    }
}

struct HandlerList<T: ?Sized> {
    channel: Channel,
    entries: RwLock<Vec<(u64, Arc<dyn Fn(&T) + Send + Sync>)>>,
}

impl<T: ?Sized> HandlerList<T> {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            entries: RwLock::new(Vec::new()),
        }
    }

    fn push(&self, id: u64, handler: Arc<dyn Fn(&T) + Send + Sync>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
    }

    fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn call(&self, value: &T) {
        let snapshot: Vec<Arc<dyn Fn(&T) + Send + Sync>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(value))).is_err() {
                tracing::error!("{} handler panicked", self.channel);
            }
        }
    }
}

/// Multi-subscriber event dispatcher.
pub struct EventDispatcher {
    next_id: AtomicU64,
    price_update: HandlerList<PriceRecord>,
    connection_change: HandlerList<ConnectionState>,
    error: HandlerList<StreamError>,
    subscription_update: HandlerList<[TokenSlug]>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            price_update: HandlerList::new(Channel::PriceUpdate),
            connection_change: HandlerList::new(Channel::ConnectionChange),
            error: HandlerList::new(Channel::Error),
            subscription_update: HandlerList::new(Channel::SubscriptionUpdate),
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("price_update", &self.price_update.len())
            .field("connection_change", &self.connection_change.len())
            .field("error", &self.error.len())
            .field("subscription_update", &self.subscription_update.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self, channel: Channel) -> HandlerId {
        HandlerId {
            channel,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn on_price_update<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&PriceRecord) + Send + Sync + 'static,
    {
        let id = self.next_id(Channel::PriceUpdate);
        self.price_update.push(id.id, Arc::new(handler));
        id
    }

    pub fn on_connection_change<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let id = self.next_id(Channel::ConnectionChange);
        self.connection_change.push(id.id, Arc::new(handler));
        id
    }

    pub fn on_error<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&StreamError) + Send + Sync + 'static,
    {
        let id = self.next_id(Channel::Error);
        self.error.push(id.id, Arc::new(handler));
        id
    }

    pub fn on_subscription_update<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&[TokenSlug]) + Send + Sync + 'static,
    {
        let id = self.next_id(Channel::SubscriptionUpdate);
        self.subscription_update.push(id.id, Arc::new(handler));
        id
    }

    /// Unregister one handler. Returns whether it was still registered.
    pub fn off(&self, id: HandlerId) -> bool {
        match id.channel {
            Channel::PriceUpdate => self.price_update.remove(id.id),
            Channel::ConnectionChange => self.connection_change.remove(id.id),
            Channel::Error => self.error.remove(id.id),
            Channel::SubscriptionUpdate => self.subscription_update.remove(id.id),
        }
    }

    /// Drop every handler on `channel`.
    pub fn clear(&self, channel: Channel) {
        match channel {
            Channel::PriceUpdate => self.price_update.clear(),
            Channel::ConnectionChange => self.connection_change.clear(),
            Channel::Error => self.error.clear(),
            Channel::SubscriptionUpdate => self.subscription_update.clear(),
        }
    }

    pub fn handler_count(&self, channel: Channel) -> usize {
        match channel {
            Channel::PriceUpdate => self.price_update.len(),
            Channel::ConnectionChange => self.connection_change.len(),
            Channel::Error => self.error.len(),
            Channel::SubscriptionUpdate => self.subscription_update.len(),
        }
    }

    /// Deliver `event` to its channel's handlers, in registration order.
    pub fn dispatch(&self, event: &StreamEvent) {
        match event {
            StreamEvent::PriceUpdate(record) => self.price_update.call(record),
            StreamEvent::ConnectionChange(state) => self.connection_change.call(state),
            StreamEvent::Error(err) => self.error.call(err),
            StreamEvent::SubscriptionUpdate(tokens) => {
                self.subscription_update.call(tokens.as_slice())
            }
        }
    }

    /// A scope whose handlers are unregistered when it is dropped.
    pub fn scope(self: &Arc<Self>) -> HandlerScope {
        HandlerScope {
            dispatcher: Arc::downgrade(self),
            ids: Vec::new(),
        }
    }
}

// ─── HandlerScope ────────────────────────────────────────────────────────────

/// Registrations tied to a consumer's lifetime (e.g. a mounted widget).
///
/// Holds the dispatcher weakly; dropping the scope after the stream is gone
/// is fine.
#[derive(Debug)]
pub struct HandlerScope {
    dispatcher: Weak<EventDispatcher>,
    ids: Vec<HandlerId>,
}

impl HandlerScope {
    fn register(&mut self, f: impl FnOnce(&EventDispatcher) -> HandlerId) -> Option<HandlerId> {
        let dispatcher = self.dispatcher.upgrade()?;
        let id = f(&dispatcher);
        self.ids.push(id);
        Some(id)
    }

    /// `None` once the dispatcher has been dropped.
    pub fn on_price_update<F>(&mut self, handler: F) -> Option<HandlerId>
    where
        F: Fn(&PriceRecord) + Send + Sync + 'static,
    {
        self.register(|d| d.on_price_update(handler))
    }

    pub fn on_connection_change<F>(&mut self, handler: F) -> Option<HandlerId>
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.register(|d| d.on_connection_change(handler))
    }

    pub fn on_error<F>(&mut self, handler: F) -> Option<HandlerId>
    where
        F: Fn(&StreamError) + Send + Sync + 'static,
    {
        self.register(|d| d.on_error(handler))
    }

    pub fn on_subscription_update<F>(&mut self, handler: F) -> Option<HandlerId>
    where
        F: Fn(&[TokenSlug]) + Send + Sync + 'static,
    {
        self.register(|d| d.on_subscription_update(handler))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            for id in self.ids.drain(..) {
                dispatcher.off(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_handlers_run_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let log = Arc::clone(&log);
            dispatcher.on_connection_change(move |state| {
                log.lock().unwrap().push(format!("{n}:{state}"));
            });
        }
        dispatcher.dispatch(&StreamEvent::ConnectionChange(ConnectionState::Connected));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["0:connected", "1:connected", "2:connected"]
        );
    }

    #[test]
    fn test_off_and_clear() {
        let dispatcher = EventDispatcher::new();
        let a = dispatcher.on_error(|_| {});
        dispatcher.on_error(|_| {});
        dispatcher.on_price_update(|_| {});

        assert!(dispatcher.off(a));
        assert!(!dispatcher.off(a));
        assert_eq!(dispatcher.handler_count(Channel::Error), 1);

        dispatcher.clear(Channel::Error);
        assert_eq!(dispatcher.handler_count(Channel::Error), 0);
        assert_eq!(dispatcher.handler_count(Channel::PriceUpdate), 1);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::<Vec<TokenSlug>>::new()));

        dispatcher.on_subscription_update(|_| panic!("handler bug"));
        {
            let seen = Arc::clone(&seen);
            dispatcher.on_subscription_update(move |tokens| {
                seen.lock().unwrap().push(tokens.to_vec());
            });
        }

        dispatcher.dispatch(&StreamEvent::SubscriptionUpdate(vec![TokenSlug::new(
            "bitcoin",
        )]));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_handler_can_unregister_itself() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let id_slot: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));

        let id = {
            let weak = Arc::downgrade(&dispatcher);
            let id_slot = Arc::clone(&id_slot);
            dispatcher.on_error(move |_| {
                if let (Some(d), Some(id)) = (weak.upgrade(), *id_slot.lock().unwrap()) {
                    d.off(id);
                }
            })
        };
        *id_slot.lock().unwrap() = Some(id);

        dispatcher.dispatch(&StreamEvent::Error(StreamError::NotConnected));
        assert_eq!(dispatcher.handler_count(Channel::Error), 0);
    }

    #[test]
    fn test_scope_unregisters_on_drop() {
        let dispatcher = Arc::new(EventDispatcher::new());
        dispatcher.on_price_update(|_| {});

        {
            let mut scope = dispatcher.scope();
            assert!(scope.on_price_update(|_| {}).is_some());
            assert!(scope.on_connection_change(|_| {}).is_some());
            assert_eq!(scope.len(), 2);
            assert_eq!(dispatcher.handler_count(Channel::PriceUpdate), 2);
        }

        assert_eq!(dispatcher.handler_count(Channel::PriceUpdate), 1);
        assert_eq!(dispatcher.handler_count(Channel::ConnectionChange), 0);
    }

    #[test]
    fn test_scope_outlives_dispatcher() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let mut scope = dispatcher.scope();
        scope.on_error(|_| {});
        drop(dispatcher);

        assert!(scope.on_error(|_| {}).is_none());
        drop(scope);
    }
}
