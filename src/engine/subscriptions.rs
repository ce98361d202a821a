//! Active subscriptions of a session

use super::dispatcher::EventCallback;
use crate::protocol::topic;
use std::sync::Arc;

struct ActiveSubscription {
    filter: String,
    handler: Option<Arc<dyn EventCallback>>,
}

/// Where an inbound message should go
pub(crate) enum Route {
    /// Matched a granted filter; deliver as a subscription message
    Subscription(Option<Arc<dyn EventCallback>>),
    Unmatched,
}

/// Filters the broker has granted, in grant order
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    active: Vec<ActiveSubscription>,
}

impl SubscriptionTable {
    /// Insert or replace `filter`
    pub(crate) fn insert(&mut self, filter: String, handler: Option<Arc<dyn EventCallback>>) {
        if let Some(existing) = self.active.iter_mut().find(|s| s.filter == filter) {
            existing.handler = handler;
            return;
        }
        self.active.push(ActiveSubscription { filter, handler });
    }

    pub(crate) fn remove(&mut self, filter: &str) -> bool {
        let before = self.active.len();
        self.active.retain(|s| s.filter != filter);
        self.active.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    /// Route a topic: the first matching filter with its own handler wins,
    /// otherwise any match goes to the handle callback
    pub(crate) fn route(&self, topic_name: &str) -> Route {
        let mut matched = false;
        for subscription in &self.active {
            if !topic::matches(&subscription.filter, topic_name) {
                continue;
            }
            if let Some(handler) = &subscription.handler {
                return Route::Subscription(Some(Arc::clone(handler)));
            }
            matched = true;
        }
        if matched {
            Route::Subscription(None)
        } else {
            Route::Unmatched
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dispatcher::MqttEvent;
    use crate::engine::handle_table::HandleId;

    fn handler() -> Arc<dyn EventCallback> {
        Arc::new(|_: HandleId, _: &MqttEvent| {})
    }

    #[test]
    fn test_unmatched_topic() {
        let mut table = SubscriptionTable::default();
        table.insert("a/+".into(), None);
        assert!(matches!(table.route("b/c"), Route::Unmatched));
        assert!(matches!(table.route("a/c"), Route::Subscription(None)));
    }

    #[test]
    fn test_handler_preferred_over_plain_match() {
        let mut table = SubscriptionTable::default();
        table.insert("a/#".into(), None);
        table.insert("a/b".into(), Some(handler()));
        assert!(matches!(table.route("a/b"), Route::Subscription(Some(_))));
        assert!(matches!(table.route("a/c"), Route::Subscription(None)));
    }

    #[test]
    fn test_insert_replaces_and_remove() {
        let mut table = SubscriptionTable::default();
        table.insert("x".into(), None);
        table.insert("x".into(), Some(handler()));
        assert_eq!(table.len(), 1);
        assert!(matches!(table.route("x"), Route::Subscription(Some(_))));

        assert!(table.remove("x"));
        assert!(!table.remove("x"));
        assert!(matches!(table.route("x"), Route::Unmatched));
    }
}
