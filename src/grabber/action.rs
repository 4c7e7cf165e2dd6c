//! Serialized device mutations
//!
//! Every change to the active connection is an [`Action`] processed in order
//! by one worker. A disconnect cancels everything queued before it, and
//! connect/configure requests already pending are not queued twice.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::device::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Connect,
    Disconnect,
    Configure,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Connect => "connect",
            ActionKind::Disconnect => "disconnect",
            ActionKind::Configure => "configure",
        }
    }
}

#[derive(Clone)]
pub struct Action {
    pub kind: ActionKind,
    pub device: Option<Arc<Device>>,
}

impl Action {
    pub fn new(kind: ActionKind, device: Option<Arc<Device>>) -> Self {
        Self { kind, device }
    }

    pub fn device_id(&self) -> &str {
        self.device.as_deref().map(Device::id).unwrap_or("none")
    }
}

/// Same kind, same physical camera.
impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && match (&self.device, &other.device) {
                (Some(a), Some(b)) => a.same_handle(b),
                (None, None) => true,
                _ => false,
            }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, self.device_id())
    }
}

#[derive(Default)]
pub struct ActionQueue {
    state: Mutex<QueueState>,
    signal: Condvar,
}

#[derive(Default)]
struct QueueState {
    actions: VecDeque<Action>,
    closed: bool,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the action was queued.
    pub fn push(&self, action: Action) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }

        if action.kind == ActionKind::Disconnect {
            state.actions.clear();
        } else if state.actions.contains(&action) {
            return false;
        }

        state.actions.push_back(action);
        self.signal.notify_one();
        true
    }

    /// Block until an action is available; `None` once closed.
    pub fn next(&self) -> Option<Action> {
        let mut state = self.state.lock();
        self.signal
            .wait_while(&mut state, |s| s.actions.is_empty() && !s.closed);
        if state.closed {
            return None;
        }
        state.actions.pop_front()
    }

    /// Drop pending actions and release the worker.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.actions.clear();
        self.signal.notify_all();
    }

    /// Accept actions again after [`close`](Self::close).
    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> Vec<Action> {
        self.state.lock().actions.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::driver::sim::{SimCameraConfig, SimDriver};
    use crate::driver::{Camera, Driver};
    use crate::system::System;

    struct Fixture {
        driver: Arc<SimDriver>,
        system: Arc<System>,
    }

    impl Fixture {
        fn new() -> Self {
            let driver = SimDriver::new();
            let system = System::instance(&(driver.clone() as Arc<dyn Driver>));
            Self { driver, system }
        }

        fn device(&self, id: &str) -> Arc<Device> {
            let camera = match self.driver.camera(id) {
                Some(camera) => camera,
                None => self.driver.plug(SimCameraConfig::with_id(id)),
            };
            Arc::new(Device::new(self.system.clone(), camera as Arc<dyn Camera>))
        }
    }

    fn kinds(queue: &ActionQueue) -> Vec<ActionKind> {
        queue.pending().iter().map(|a| a.kind).collect()
    }

    #[test]
    fn disconnect_discards_pending_actions() {
        let fixture = Fixture::new();
        let queue = ActionQueue::new();
        let a = fixture.device("DEV_000F31000C01");
        let b = fixture.device("DEV_000F31000C02");

        for device in [&a, &b, &a] {
            queue.push(Action::new(ActionKind::Connect, Some(device.clone())));
            queue.push(Action::new(ActionKind::Configure, Some(device.clone())));
        }
        assert_eq!(queue.len(), 4);

        queue.push(Action::new(ActionKind::Disconnect, Some(a.clone())));
        assert_eq!(kinds(&queue), [ActionKind::Disconnect]);
    }

    #[test]
    fn duplicates_are_not_queued() {
        let fixture = Fixture::new();
        let queue = ActionQueue::new();
        // two snapshots of one camera are the same device
        let first = fixture.device("DEV_000F31000C03");
        let second = fixture.device("DEV_000F31000C03");

        assert!(queue.push(Action::new(ActionKind::Configure, Some(first))));
        assert!(!queue.push(Action::new(ActionKind::Configure, Some(second.clone()))));
        assert!(queue.push(Action::new(ActionKind::Connect, Some(second))));
        assert_eq!(kinds(&queue), [ActionKind::Configure, ActionKind::Connect]);
    }

    #[test]
    fn disconnect_without_device_is_allowed() {
        let queue = ActionQueue::new();
        assert!(queue.push(Action::new(ActionKind::Disconnect, None)));
        assert!(queue.push(Action::new(ActionKind::Disconnect, None)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().map(|a| a.kind), Some(ActionKind::Disconnect));
    }

    #[test]
    fn close_releases_a_waiting_worker() {
        let queue = Arc::new(ActionQueue::new());
        let worker = {
            let queue = queue.clone();
            thread::spawn(move || queue.next())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(worker.join().unwrap().is_none());
        assert!(!queue.push(Action::new(ActionKind::Disconnect, None)));
    }
}
