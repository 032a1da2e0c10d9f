//! Status values and their replay-latest containers.

use std::cell::RefCell;
use std::rc::Rc;

use smallvec::SmallVec;

/// GPS sensor state.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum GpsStatus {
    Enabled,
    Disabled,
}

/// Location permission state.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PermissionStatus {
    /// Permission is granted.
    Granted,

    /// Permission was refused, but the user may be asked again.
    Denied,

    /// Permission was refused permanently; only system settings can undo it.
    Blocked,
}

/// Handle for cancelling a status subscription.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SubscriptionId(u64);

type Callback<T> = Rc<RefCell<dyn FnMut(T)>>;

/// Latest status value plus its subscriber list.
///
/// A subscriber attaching after a value exists immediately receives that
/// value. Consecutive identical values are delivered once.
#[derive(Clone)]
pub struct StatusCell<T> {
    inner: Rc<RefCell<CellInner<T>>>,
}

struct CellInner<T> {
    subscribers: SmallVec<[(SubscriptionId, Callback<T>); 2]>,
    latest: Option<T>,
    next_id: u64,
}

impl<T> Default for StatusCell<T> {
    fn default() -> Self {
        let inner = CellInner { subscribers: SmallVec::new(), latest: None, next_id: 0 };
        Self { inner: Rc::new(RefCell::new(inner)) }
    }
}

impl<T: Copy + PartialEq + 'static> StatusCell<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the latest observed value, if any.
    pub fn get(&self) -> Option<T> {
        self.inner.borrow().latest
    }

    /// Get the number of active subscriptions.
    pub fn observer_count(&self) -> usize {
        self.inner.borrow().subscribers.len()
    }

    /// Register a subscriber.
    ///
    /// The current value is replayed into the callback before this returns
    /// whenever one exists.
    pub fn observe<F: FnMut(T) + 'static>(&self, callback: F) -> SubscriptionId {
        let callback: Callback<T> = Rc::new(RefCell::new(callback));

        let (id, latest) = {
            let mut inner = self.inner.borrow_mut();
            let id = SubscriptionId(inner.next_id);
            inner.next_id += 1;
            inner.subscribers.push((id, callback.clone()));
            (id, inner.latest)
        };

        // Replay the latest value after releasing the borrow, so the callback
        // may subscribe or unsubscribe itself.
        if let Some(value) = latest {
            (callback.borrow_mut())(value);
        }

        id
    }

    /// Cancel a subscription.
    ///
    /// Removal never affects other subscribers and is safe to call from
    /// within a callback of this cell.
    pub fn unobserve(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let old_len = inner.subscribers.len();
        inner.subscribers.retain(|(subscriber, _)| *subscriber != id);
        inner.subscribers.len() != old_len
    }

    /// Publish a new value, notifying all subscribers.
    ///
    /// Returns `false` without notifying anyone when the value matches the
    /// current one.
    pub fn emit(&self, value: T) -> bool {
        let subscribers = {
            let mut inner = self.inner.borrow_mut();
            if inner.latest == Some(value) {
                return false;
            }
            inner.latest = Some(value);
            inner.subscribers.clone()
        };

        for (id, callback) in subscribers {
            // Skip subscribers removed by an earlier callback of this emission.
            if !self.is_observed(id) {
                continue;
            }

            // Re-entrant emission into the running callback is skipped.
            if let Ok(mut callback) = callback.try_borrow_mut() {
                callback(value);
            }
        }

        true
    }

    fn is_observed(&self, id: SubscriptionId) -> bool {
        self.inner.borrow().subscribers.iter().any(|(subscriber, _)| *subscriber == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Subscribe a recording observer, returning its value log.
    fn record(cell: &StatusCell<GpsStatus>) -> (SubscriptionId, Rc<RefCell<Vec<GpsStatus>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let observer_log = log.clone();
        let id = cell.observe(move |status| observer_log.borrow_mut().push(status));
        (id, log)
    }

    #[test]
    fn replay_latest_on_observe() {
        let cell = StatusCell::new();
        cell.emit(GpsStatus::Enabled);

        let (_, log) = record(&cell);

        assert_eq!(*log.borrow(), vec![GpsStatus::Enabled]);
    }

    #[test]
    fn no_replay_without_value() {
        let cell = StatusCell::new();

        let (_, log) = record(&cell);

        assert!(log.borrow().is_empty());
        assert_eq!(cell.get(), None);
    }

    #[test]
    fn duplicate_values_are_suppressed() {
        let cell = StatusCell::new();
        let (_, log) = record(&cell);

        assert!(cell.emit(GpsStatus::Disabled));
        assert!(!cell.emit(GpsStatus::Disabled));
        assert!(cell.emit(GpsStatus::Enabled));

        assert_eq!(*log.borrow(), vec![GpsStatus::Disabled, GpsStatus::Enabled]);
    }

    #[test]
    fn emissions_are_delivered_in_order() {
        let cell = StatusCell::new();
        let (_, log) = record(&cell);

        cell.emit(GpsStatus::Enabled);
        cell.emit(GpsStatus::Disabled);
        cell.emit(GpsStatus::Enabled);

        let expected = vec![GpsStatus::Enabled, GpsStatus::Disabled, GpsStatus::Enabled];
        assert_eq!(*log.borrow(), expected);
    }

    #[test]
    fn unobserve_leaves_other_subscribers_untouched() {
        let cell = StatusCell::new();
        let (first, first_log) = record(&cell);
        let (_, second_log) = record(&cell);

        cell.emit(GpsStatus::Enabled);
        assert!(cell.unobserve(first));
        cell.emit(GpsStatus::Disabled);

        assert_eq!(*first_log.borrow(), vec![GpsStatus::Enabled]);
        assert_eq!(*second_log.borrow(), vec![GpsStatus::Enabled, GpsStatus::Disabled]);
    }

    #[test]
    fn unobserve_unknown_id_is_noop() {
        let cell = StatusCell::new();
        let (id, _) = record(&cell);

        assert!(cell.unobserve(id));
        assert!(!cell.unobserve(id));
    }

    #[test]
    fn unobserve_sibling_from_callback() {
        let cell = StatusCell::new();

        // First subscriber removes the second one on delivery.
        let unobserve_cell = cell.clone();
        let victim = Rc::new(RefCell::new(None));
        let stored_victim = victim.clone();
        cell.observe(move |_| {
            if let Some(id) = *stored_victim.borrow() {
                unobserve_cell.unobserve(id);
            }
        });

        let (second, second_log) = record(&cell);
        *victim.borrow_mut() = Some(second);

        cell.emit(GpsStatus::Enabled);

        // The sibling was removed before its delivery of this emission.
        assert!(second_log.borrow().is_empty());
        assert_eq!(cell.observer_count(), 1);
    }

    #[test]
    fn observe_from_callback_replays_once() {
        let cell = StatusCell::new();

        let log = Rc::new(RefCell::new(Vec::new()));
        let late_log = log.clone();
        let observe_cell = cell.clone();
        cell.observe(move |_| {
            let inner_log = late_log.clone();
            observe_cell.observe(move |status| inner_log.borrow_mut().push(status));
        });

        cell.emit(GpsStatus::Disabled);

        // The mid-emission subscriber got the value through replay only.
        assert_eq!(*log.borrow(), vec![GpsStatus::Disabled]);
    }
}
