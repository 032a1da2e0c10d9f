//! GPS sensor status source.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use calloop::LoopHandle;
use calloop::channel::{self, Event, Sender};

use crate::Result;
use crate::status::{GpsStatus, StatusCell, SubscriptionId};

/// Monitoring capability for the sensor-enabled flag.
pub trait GpsMonitor {
    /// Start watching the enabled flag.
    ///
    /// The watcher posts the current value once, then every change, until
    /// the returned guard is dropped.
    fn watch(&self, tx: Sender<bool>) -> WatchGuard;

    /// Post the current value once.
    fn query(&self, tx: Sender<bool>);
}

/// Keep-alive token for an active watcher.
///
/// Dropping the guard shuts the watcher down.
pub struct WatchGuard(#[allow(dead_code)] Box<dyn Any>);

impl WatchGuard {
    pub fn new(token: impl Any) -> Self {
        Self(Box::new(token))
    }
}

/// GPS sensor status.
pub struct Gps {
    cell: StatusCell<GpsStatus>,
    monitor: Rc<dyn GpsMonitor>,
    ingest: Sender<bool>,
    watch: RefCell<Option<WatchGuard>>,
}

impl Gps {
    pub fn new<D: 'static>(
        event_loop: &LoopHandle<'static, D>,
        monitor: Rc<dyn GpsMonitor>,
    ) -> Result<Rc<Self>> {
        let (tx, rx) = channel::channel();

        // Fold raw enabled flips into the status cell.
        let cell = StatusCell::new();
        let ingest_cell = cell.clone();
        event_loop.insert_source(rx, move |event, _, _| {
            let enabled = match event {
                Event::Msg(enabled) => enabled,
                Event::Closed => return,
            };

            let status = if enabled { GpsStatus::Enabled } else { GpsStatus::Disabled };
            ingest_cell.emit(status);
        })?;

        Ok(Rc::new(Self { cell, monitor, ingest: tx, watch: RefCell::new(None) }))
    }

    /// Register a subscriber, replaying the current status.
    ///
    /// The first subscriber starts sensor monitoring.
    pub fn observe<F: FnMut(GpsStatus) + 'static>(&self, callback: F) -> SubscriptionId {
        let first = self.cell.observer_count() == 0;
        let id = self.cell.observe(callback);

        if first {
            *self.watch.borrow_mut() = Some(self.monitor.watch(self.ingest.clone()));
        }

        id
    }

    /// Cancel a subscription, stopping monitoring with the last subscriber.
    pub fn unobserve(&self, id: SubscriptionId) {
        if self.cell.unobserve(id) && self.cell.observer_count() == 0 {
            *self.watch.borrow_mut() = None;
        }
    }

    /// Re-check the enabled flag.
    ///
    /// The result arrives through the regular ingest path, so an unchanged
    /// value stays silent.
    pub fn refresh(&self) {
        self.monitor.query(self.ingest.clone());
    }

    /// Latest known status.
    pub fn status(&self) -> Option<GpsStatus> {
        self.cell.get()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use calloop::EventLoop;

    use super::*;

    #[derive(Default)]
    struct FakeMonitor {
        watcher: RefCell<Option<Sender<bool>>>,
        token: RefCell<Option<Rc<()>>>,
        enabled: Cell<bool>,
        queries: Cell<usize>,
    }

    impl GpsMonitor for FakeMonitor {
        fn watch(&self, tx: Sender<bool>) -> WatchGuard {
            let token = Rc::new(());
            *self.token.borrow_mut() = Some(token.clone());
            *self.watcher.borrow_mut() = Some(tx);
            WatchGuard::new(token)
        }

        fn query(&self, tx: Sender<bool>) {
            self.queries.set(self.queries.get() + 1);
            let _ = tx.send(self.enabled.get());
        }
    }

    impl FakeMonitor {
        fn send(&self, enabled: bool) {
            self.watcher.borrow().as_ref().unwrap().send(enabled).unwrap();
        }

        fn watcher_alive(&self) -> bool {
            self.token.borrow().as_ref().is_some_and(|token| Rc::strong_count(token) > 1)
        }
    }

    fn pump(event_loop: &mut EventLoop<()>) {
        for _ in 0..10 {
            event_loop.dispatch(Some(Duration::ZERO), &mut ()).unwrap();
        }
    }

    #[test]
    fn monitoring_is_lazy() {
        let mut event_loop = EventLoop::try_new().unwrap();
        let monitor = Rc::new(FakeMonitor::default());
        let gps = Gps::new(&event_loop.handle(), monitor.clone()).unwrap();

        assert!(monitor.watcher.borrow().is_none());

        let id = gps.observe(|_| {});
        assert!(monitor.watcher_alive());

        gps.unobserve(id);
        assert!(!monitor.watcher_alive());

        // Re-attaching restarts the watcher.
        gps.observe(|_| {});
        assert!(monitor.watcher_alive());

        pump(&mut event_loop);
    }

    #[test]
    fn watcher_events_become_status() {
        let mut event_loop = EventLoop::try_new().unwrap();
        let monitor = Rc::new(FakeMonitor::default());
        let gps = Gps::new(&event_loop.handle(), monitor.clone()).unwrap();

        let log = Rc::new(RefCell::new(Vec::new()));
        let observer_log = log.clone();
        gps.observe(move |status| observer_log.borrow_mut().push(status));

        monitor.send(true);
        monitor.send(false);
        pump(&mut event_loop);

        assert_eq!(*log.borrow(), vec![GpsStatus::Enabled, GpsStatus::Disabled]);
        assert_eq!(gps.status(), Some(GpsStatus::Disabled));
    }

    #[test]
    fn duplicate_flips_are_suppressed() {
        let mut event_loop = EventLoop::try_new().unwrap();
        let monitor = Rc::new(FakeMonitor::default());
        let gps = Gps::new(&event_loop.handle(), monitor.clone()).unwrap();

        let log = Rc::new(RefCell::new(Vec::new()));
        let observer_log = log.clone();
        gps.observe(move |status| observer_log.borrow_mut().push(status));

        monitor.send(false);
        monitor.send(false);
        pump(&mut event_loop);

        assert_eq!(*log.borrow(), vec![GpsStatus::Disabled]);
    }

    #[test]
    fn refresh_requeries_the_monitor() {
        let mut event_loop = EventLoop::try_new().unwrap();
        let monitor = Rc::new(FakeMonitor::default());
        let gps = Gps::new(&event_loop.handle(), monitor.clone()).unwrap();

        gps.observe(|_| {});
        monitor.enabled.set(true);
        gps.refresh();
        pump(&mut event_loop);

        assert_eq!(monitor.queries.get(), 1);
        assert_eq!(gps.status(), Some(GpsStatus::Enabled));
    }

    #[test]
    fn late_observer_replays_latest() {
        let mut event_loop = EventLoop::try_new().unwrap();
        let monitor = Rc::new(FakeMonitor::default());
        let gps = Gps::new(&event_loop.handle(), monitor.clone()).unwrap();

        gps.observe(|_| {});
        monitor.send(true);
        pump(&mut event_loop);

        let log = Rc::new(RefCell::new(Vec::new()));
        let observer_log = log.clone();
        gps.observe(move |status| observer_log.borrow_mut().push(status));

        assert_eq!(*log.borrow(), vec![GpsStatus::Enabled]);
    }
}
