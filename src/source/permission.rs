//! Location permission status source.

use std::cell::Cell;
use std::rc::Rc;

use calloop::LoopHandle;
use calloop::channel::{self, Event, Sender};

use crate::Result;
use crate::status::{PermissionStatus, StatusCell, SubscriptionId};

/// Permission checking capability.
///
/// Both operations post exactly one terminal reply. The source serializes
/// invocations, so implementations never see overlapping calls for the same
/// permission.
pub trait PermissionBroker {
    /// Silent one-shot grant check.
    ///
    /// Posts `Granted` or `Denied`; never prompts.
    fn check(&self, reply: Sender<PermissionStatus>);

    /// Interactive permission-request flow.
    ///
    /// May open a system prompt; resolves without one when the permission is
    /// already granted.
    fn request(&self, reply: Sender<PermissionStatus>);
}

/// Operating mode, selected at construction.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Mode {
    /// Drive the interactive request flow when the permission is missing.
    Interactive,

    /// Silent checks only; `Blocked` is never surfaced since no prompt can
    /// be shown.
    Service,
}

/// Location permission status.
pub struct Permission {
    cell: StatusCell<PermissionStatus>,
    broker: Rc<dyn PermissionBroker>,
    ingest: Sender<PermissionStatus>,
    in_flight: Rc<Cell<bool>>,
    mode: Mode,
}

impl Permission {
    pub fn new<D: 'static>(
        event_loop: &LoopHandle<'static, D>,
        broker: Rc<dyn PermissionBroker>,
        mode: Mode,
    ) -> Result<Rc<Self>> {
        let (tx, rx) = channel::channel();

        let cell = StatusCell::new();
        let in_flight = Rc::new(Cell::new(false));

        // Ingest broker replies on the loop thread.
        let ingest_cell = cell.clone();
        let ingest_in_flight = in_flight.clone();
        event_loop.insert_source(rx, move |event, _, _| {
            let status = match event {
                Event::Msg(status) => status,
                Event::Closed => return,
            };

            ingest_in_flight.set(false);
            ingest_cell.emit(status);
        })?;

        Ok(Rc::new(Self { cell, broker, ingest: tx, in_flight, mode }))
    }

    /// Register a subscriber, replaying the current status.
    ///
    /// The first subscriber activates the mode's permission check.
    pub fn observe<F: FnMut(PermissionStatus) + 'static>(&self, callback: F) -> SubscriptionId {
        let first = self.cell.observer_count() == 0;
        let id = self.cell.observe(callback);

        if first {
            match self.mode {
                Mode::Interactive => self.trigger_interactive_check(),
                Mode::Service => self.silent_check(),
            }
        }

        id
    }

    /// Cancel a subscription.
    pub fn unobserve(&self, id: SubscriptionId) {
        self.cell.unobserve(id);
    }

    /// Run the interactive permission-request flow.
    ///
    /// While a check is unresolved this is a no-op, guaranteeing at most one
    /// prompt per permission. Service-mode sources cannot prompt and degrade
    /// to the silent check.
    pub fn trigger_interactive_check(&self) {
        if self.mode == Mode::Service {
            self.silent_check();
            return;
        }

        if self.in_flight.replace(true) {
            return;
        }

        self.broker.request(self.ingest.clone());
    }

    fn silent_check(&self) {
        if self.in_flight.replace(true) {
            return;
        }

        self.broker.check(self.ingest.clone());
    }

    /// Latest known status.
    pub fn status(&self) -> Option<PermissionStatus> {
        self.cell.get()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::time::Duration;

    use calloop::EventLoop;

    use super::*;

    #[derive(Default)]
    struct FakeBroker {
        reply: RefCell<Option<Sender<PermissionStatus>>>,
        checks: Cell<usize>,
        requests: Cell<usize>,
    }

    impl PermissionBroker for FakeBroker {
        fn check(&self, reply: Sender<PermissionStatus>) {
            self.checks.set(self.checks.get() + 1);
            *self.reply.borrow_mut() = Some(reply);
        }

        fn request(&self, reply: Sender<PermissionStatus>) {
            self.requests.set(self.requests.get() + 1);
            *self.reply.borrow_mut() = Some(reply);
        }
    }

    impl FakeBroker {
        fn resolve(&self, status: PermissionStatus) {
            self.reply.borrow_mut().take().unwrap().send(status).unwrap();
        }
    }

    fn pump(event_loop: &mut EventLoop<()>) {
        for _ in 0..10 {
            event_loop.dispatch(Some(Duration::ZERO), &mut ()).unwrap();
        }
    }

    #[test]
    fn interactive_activation_runs_request_flow() {
        let mut event_loop = EventLoop::try_new().unwrap();
        let broker = Rc::new(FakeBroker::default());
        let permission =
            Permission::new(&event_loop.handle(), broker.clone(), Mode::Interactive).unwrap();

        let log = Rc::new(RefCell::new(Vec::new()));
        let observer_log = log.clone();
        permission.observe(move |status| observer_log.borrow_mut().push(status));

        assert_eq!(broker.requests.get(), 1);
        assert_eq!(broker.checks.get(), 0);

        broker.resolve(PermissionStatus::Granted);
        pump(&mut event_loop);

        assert_eq!(*log.borrow(), vec![PermissionStatus::Granted]);
        assert_eq!(permission.status(), Some(PermissionStatus::Granted));
    }

    #[test]
    fn service_activation_checks_silently() {
        let mut event_loop = EventLoop::try_new().unwrap();
        let broker = Rc::new(FakeBroker::default());
        let permission =
            Permission::new(&event_loop.handle(), broker.clone(), Mode::Service).unwrap();

        permission.observe(|_| {});

        assert_eq!(broker.checks.get(), 1);
        assert_eq!(broker.requests.get(), 0);

        broker.resolve(PermissionStatus::Denied);
        pump(&mut event_loop);

        assert_eq!(permission.status(), Some(PermissionStatus::Denied));
    }

    #[test]
    fn checks_are_single_flight() {
        let mut event_loop = EventLoop::try_new().unwrap();
        let broker = Rc::new(FakeBroker::default());
        let permission =
            Permission::new(&event_loop.handle(), broker.clone(), Mode::Interactive).unwrap();

        permission.observe(|_| {});
        assert_eq!(broker.requests.get(), 1);

        // A second trigger while the first is unresolved spawns no prompt.
        permission.trigger_interactive_check();
        assert_eq!(broker.requests.get(), 1);

        broker.resolve(PermissionStatus::Denied);
        pump(&mut event_loop);

        permission.trigger_interactive_check();
        assert_eq!(broker.requests.get(), 2);
    }

    #[test]
    fn service_trigger_degrades_to_silent_check() {
        let mut event_loop = EventLoop::try_new().unwrap();
        let broker = Rc::new(FakeBroker::default());
        let permission =
            Permission::new(&event_loop.handle(), broker.clone(), Mode::Service).unwrap();

        permission.observe(|_| {});
        broker.resolve(PermissionStatus::Denied);
        pump(&mut event_loop);

        permission.trigger_interactive_check();

        assert_eq!(broker.checks.get(), 2);
        assert_eq!(broker.requests.get(), 0);
    }
}
