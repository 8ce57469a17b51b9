//! Topic-keyed publish/subscribe.
//!
//! Producers and consumers agree on a topic string and the payload type it
//! carries; neither needs a reference to the other. Payloads travel
//! type-erased and each callback downcasts to the type it expects.
//!
//! Publishing to a topic nobody listens on is a no-op. A callback may
//! unsubscribe itself, or any other subscriber of the same topic, while a
//! publish is running: a subscriber removed before the walk reaches it is not
//! invoked, and nobody is invoked twice.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::rc::Rc;

use tracing::{error, trace};

use crate::list::{DispatchList, walk};

/// Identifies one subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

impl SubscriptionToken {
    /// Returns the raw token value.
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

/// A published message as seen by a subscriber.
#[derive(Clone, Copy)]
pub struct Message<'a> {
    topic: &'a str,
    payload: &'a dyn Any,
}

impl<'a> Message<'a> {
    /// The topic the message was published on.
    #[must_use]
    pub fn topic(&self) -> &'a str {
        self.topic
    }

    /// The type-erased payload.
    #[must_use]
    pub fn payload(&self) -> &'a dyn Any {
        self.payload
    }

    /// Downcast the payload to the type the topic carries.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&'a T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message").field("topic", &self.topic).finish_non_exhaustive()
    }
}

type Callback = Rc<dyn Fn(&Message<'_>)>;

#[derive(Clone)]
struct Subscriber {
    token: SubscriptionToken,
    callback: Callback,
}

type Subscribers = Rc<RefCell<DispatchList<Subscriber>>>;

/// A publish/subscribe channel keyed by topic string.
#[derive(Default)]
pub struct MessageBus {
    /// Subscriber lists keyed by topic.
    topics: RefCell<HashMap<String, Subscribers>>,
    /// Source of subscription tokens.
    next_token: Cell<u64>,
}

impl MessageBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a callback to `topic`.
    pub fn subscribe(
        &self,
        topic: &str,
        callback: impl Fn(&Message<'_>) + 'static,
    ) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.get() + 1);
        self.next_token.set(token.0);

        let list = Rc::clone(
            self.topics
                .borrow_mut()
                .entry(topic.to_string())
                .or_default(),
        );
        list.borrow_mut().push(Subscriber {
            token,
            callback: Rc::new(callback),
        });

        trace!(topic, token = token.0, "subscribed");
        token
    }

    /// Subscribe a callback that receives the payload already downcast to `T`.
    ///
    /// A message whose payload is not a `T` is a broken topic contract; it is
    /// logged and the callback is not invoked.
    pub fn subscribe_to<T: Any>(
        &self,
        topic: &str,
        callback: impl Fn(&T) + 'static,
    ) -> SubscriptionToken {
        self.subscribe(topic, move |message| match message.downcast_ref::<T>() {
            Some(payload) => callback(payload),
            None => error!(
                topic = message.topic(),
                expected = std::any::type_name::<T>(),
                "payload type does not match the topic contract"
            ),
        })
    }

    /// Remove a subscription. Safe to call from inside any callback.
    ///
    /// Returns `true` if the subscription existed.
    pub fn unsubscribe(&self, topic: &str, token: SubscriptionToken) -> bool {
        let Some(list) = self.subscribers(topic) else {
            return false;
        };

        let removed = list.borrow_mut().remove_where(|sub| sub.token == token);
        if removed {
            trace!(topic, token = token.0, "unsubscribed");
            self.prune(topic, &list);
        }
        removed
    }

    /// Invoke every callback currently subscribed to `topic`, in subscription
    /// order.
    pub fn publish<T: Any>(&self, topic: &str, payload: &T) {
        self.publish_erased(topic, payload);
    }

    /// [`MessageBus::publish`] for a payload that is already type-erased.
    pub fn publish_erased(&self, topic: &str, payload: &dyn Any) {
        let Some(list) = self.subscribers(topic) else {
            trace!(topic, "publish with no subscribers");
            return;
        };

        let message = Message { topic, payload };
        let _ = walk(&list, |sub| {
            (sub.callback)(&message);
            Ok::<_, Infallible>(())
        });
        self.prune(topic, &list);
    }

    /// Number of live subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers(topic).map_or(0, |list| list.borrow().len())
    }

    /// Topics with at least one live subscription, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self
            .topics
            .borrow()
            .iter()
            .filter(|(_, list)| !list.borrow().is_empty())
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Drop every subscription on every topic.
    pub fn clear(&self) {
        let lists: Vec<_> = self.topics.borrow_mut().drain().map(|(_, list)| list).collect();
        for list in lists {
            list.borrow_mut().clear();
        }
    }

    fn subscribers(&self, topic: &str) -> Option<Subscribers> {
        self.topics.borrow().get(topic).map(Rc::clone)
    }

    /// Drop the entry for `topic` once its list is empty and no publish is
    /// walking it.
    fn prune(&self, topic: &str, list: &Subscribers) {
        let idle = {
            let list = list.borrow();
            list.is_empty() && !list.is_walking()
        };
        if !idle {
            return;
        }
        let mut topics = self.topics.borrow_mut();
        if topics.get(topic).is_some_and(|current| Rc::ptr_eq(current, list)) {
            topics.remove(topic);
        }
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("topics", &self.topics())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> Rc<RefCell<Vec<String>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = MessageBus::new();
        bus.publish("tick", &1u32);
        assert_eq!(bus.subscriber_count("tick"), 0);
        assert!(bus.topics().is_empty());
    }

    #[test]
    fn test_publish_reaches_subscribers_in_order() {
        let bus = MessageBus::new();
        let log = recorder();
        for name in ["first", "second"] {
            let log = Rc::clone(&log);
            bus.subscribe("tick", move |message| {
                let value = message.downcast_ref::<u32>().copied().unwrap_or_default();
                log.borrow_mut().push(format!("{name}:{value}"));
            });
        }
        bus.publish("tick", &7u32);
        assert_eq!(*log.borrow(), vec!["first:7", "second:7"]);
    }

    #[test]
    fn test_unsubscribe_other_during_publish() {
        let bus = Rc::new(MessageBus::new());
        let log = recorder();
        let second_token = Rc::new(Cell::new(None));

        {
            let bus_ref = Rc::downgrade(&bus);
            let log = Rc::clone(&log);
            let second_token = Rc::clone(&second_token);
            bus.subscribe("tick", move |_| {
                log.borrow_mut().push("first".into());
                if let (Some(bus), Some(token)) = (bus_ref.upgrade(), second_token.get()) {
                    bus.unsubscribe("tick", token);
                }
            });
        }
        {
            let log = Rc::clone(&log);
            let token = bus.subscribe("tick", move |_| log.borrow_mut().push("second".into()));
            second_token.set(Some(token));
        }

        bus.publish("tick", &());
        assert_eq!(*log.borrow(), vec!["first"]);
        assert_eq!(bus.subscriber_count("tick"), 1);
    }

    #[test]
    fn test_self_unsubscribe_keeps_others() {
        let bus = Rc::new(MessageBus::new());
        let log = recorder();
        let own_token = Rc::new(Cell::new(None));

        {
            let log = Rc::clone(&log);
            bus.subscribe("tick", move |_| log.borrow_mut().push("a".into()));
        }
        {
            let bus_ref = Rc::downgrade(&bus);
            let log = Rc::clone(&log);
            let closure_token = Rc::clone(&own_token);
            let token = bus.subscribe("tick", move |_| {
                log.borrow_mut().push("b".into());
                if let (Some(bus), Some(token)) = (bus_ref.upgrade(), closure_token.get()) {
                    bus.unsubscribe("tick", token);
                }
            });
            own_token.set(Some(token));
        }
        {
            let log = Rc::clone(&log);
            bus.subscribe("tick", move |_| log.borrow_mut().push("c".into()));
        }

        bus.publish("tick", &());
        bus.publish("tick", &());
        assert_eq!(*log.borrow(), vec!["a", "b", "c", "a", "c"]);
    }

    #[test]
    fn test_typed_subscription() {
        let bus = MessageBus::new();
        let total = Rc::new(Cell::new(0.0));
        {
            let total = Rc::clone(&total);
            bus.subscribe_to::<f64>("dt", move |dt| total.set(total.get() + dt));
        }
        bus.publish("dt", &0.5f64);
        bus.publish("dt", &"not a float");
        bus.publish("dt", &0.25f64);
        assert!((total.get() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unsubscribe_unknown_token() {
        let bus = MessageBus::new();
        let token = bus.subscribe("a", |_| {});
        assert!(!bus.unsubscribe("b", token));
        assert!(bus.unsubscribe("a", token));
        assert!(!bus.unsubscribe("a", token));
        assert!(bus.topics().is_empty());
    }

    #[test]
    fn test_topic_emptied_during_publish_is_dropped() {
        let bus = Rc::new(MessageBus::new());
        let own_token = Rc::new(Cell::new(None));
        {
            let bus_ref = Rc::downgrade(&bus);
            let closure_token = Rc::clone(&own_token);
            let token = bus.subscribe("once", move |_| {
                if let (Some(bus), Some(token)) = (bus_ref.upgrade(), closure_token.get()) {
                    bus.unsubscribe("once", token);
                }
            });
            own_token.set(Some(token));
        }

        bus.publish("once", &());
        assert_eq!(bus.subscriber_count("once"), 0);
        assert!(bus.topics.borrow().is_empty());
    }

    #[test]
    fn test_nested_publish() {
        let bus = Rc::new(MessageBus::new());
        let log = recorder();
        {
            let bus_ref = Rc::downgrade(&bus);
            let log = Rc::clone(&log);
            bus.subscribe("outer", move |_| {
                log.borrow_mut().push("outer".into());
                if let Some(bus) = bus_ref.upgrade() {
                    bus.publish("inner", &());
                }
            });
        }
        {
            let log = Rc::clone(&log);
            bus.subscribe("inner", move |_| log.borrow_mut().push("inner".into()));
        }
        bus.publish("outer", &());
        assert_eq!(*log.borrow(), vec!["outer", "inner"]);
    }
}
