use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

type Callback = Box<dyn FnOnce() + Send>;

/// A one-shot event. It fires at most once; afterwards it stays fired. Clones share the
/// same event.
#[derive(Clone, Default)]
pub struct Notification {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    fired: Condvar,
}

#[derive(Default)]
struct State {
    fired: bool,
    callbacks: Vec<Callback>,
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notification")
            .field("fired", &self.is_fired())
            .finish()
    }
}

impl Notification {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fire the event and run the subscribed callbacks on the calling thread. Returns
    /// `false` if it had already fired.
    pub(crate) fn fire(&self) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.fired {
                return false;
            }
            state.fired = true;
            std::mem::take(&mut state.callbacks)
        };
        self.inner.fired.notify_all();

        for callback in callbacks {
            callback();
        }
        true
    }

    /// Run `callback` when the event fires, or right away if it already has.
    pub(crate) fn subscribe(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        if state.fired {
            drop(state);
            callback();
        } else {
            state.callbacks.push(Box::new(callback));
        }
    }

    pub fn is_fired(&self) -> bool {
        self.inner.state.lock().fired
    }

    /// Block until the event fires.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while !state.fired {
            self.inner.fired.wait(&mut state);
        }
    }

    /// Block until the event fires or `timeout` passes. Returns whether it fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.fired {
            if self.inner.fired.wait_until(&mut state, deadline).timed_out() {
                return state.fired;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use super::*;

    #[test]
    fn fires_once() {
        let n = Notification::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        n.subscribe(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(n.fire());
        assert!(!n.fire());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_subscriber_runs_immediately() {
        let n = Notification::new();
        n.fire();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        n.subscribe(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callbacks_may_touch_the_notification() {
        let n = Notification::new();
        let inner = n.clone();
        n.subscribe(move || assert!(inner.is_fired()));
        n.fire();
    }

    #[test]
    fn wait_wakes_up() {
        let n = Notification::new();
        let waiter = {
            let n = n.clone();
            thread::spawn(move || n.wait())
        };
        assert!(!n.wait_timeout(Duration::from_millis(20)));
        n.fire();
        waiter.join().unwrap();
        assert!(n.wait_timeout(Duration::ZERO));
    }
}
