use std::{collections::HashMap, time::Duration};

use parking_lot::{Condvar, Mutex};

/// Identifier handed out by [`StatusTracker::add_component`].
///
/// Components reference the tracker through this id rather than through
/// back-pointers; every operation checks existence, so a component that was
/// torn down concurrently degrades to a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentId(u64);

/// Aggregated idle/active registry for pipeline components.
///
/// Streams and the request engine register themselves and flip between
/// active and idle; session owners wait on the aggregate to know when the
/// pipeline has quiesced.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use aperture_core::prelude::StatusTracker;
///
/// let tracker = StatusTracker::new();
/// let id = tracker.add_component("stream 0");
/// tracker.mark_active(id);
/// assert!(!tracker.is_idle());
/// tracker.mark_idle(id);
/// assert!(tracker.wait_idle(Duration::from_millis(10)));
/// ```
#[derive(Debug, Default)]
pub struct StatusTracker {
    inner: Mutex<Inner>,
    idle_cv: Condvar,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    components: HashMap<u64, Component>,
}

#[derive(Debug)]
struct Component {
    name: String,
    active: bool,
}

impl StatusTracker {
    /// Empty tracker; components register on configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component, initially idle.
    pub fn add_component(&self, name: &str) -> ComponentId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.components.insert(
            id,
            Component {
                name: name.to_string(),
                active: false,
            },
        );
        ComponentId(id)
    }

    /// Remove a component. Unknown ids are ignored.
    pub fn remove_component(&self, id: ComponentId) {
        let mut inner = self.inner.lock();
        inner.components.remove(&id.0);
        if Self::all_idle(&inner) {
            self.idle_cv.notify_all();
        }
    }

    /// Mark a component as actively holding pipeline resources.
    pub fn mark_active(&self, id: ComponentId) {
        let mut inner = self.inner.lock();
        if let Some(component) = inner.components.get_mut(&id.0) {
            component.active = true;
        }
    }

    /// Mark a component as idle; wakes idle waiters when the aggregate
    /// becomes idle.
    pub fn mark_idle(&self, id: ComponentId) {
        let mut inner = self.inner.lock();
        if let Some(component) = inner.components.get_mut(&id.0) {
            component.active = false;
        }
        if Self::all_idle(&inner) {
            self.idle_cv.notify_all();
        }
    }

    /// Whether every registered component is idle.
    pub fn is_idle(&self) -> bool {
        Self::all_idle(&self.inner.lock())
    }

    /// Block until every component is idle or the timeout expires.
    ///
    /// Returns `true` if the tracker reached the idle state.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if Self::all_idle(&inner) {
            return true;
        }
        let result = self.idle_cv.wait_for(&mut inner, timeout);
        !result.timed_out() && Self::all_idle(&inner)
    }

    /// Names of currently active components, for diagnostics.
    pub fn active_components(&self) -> Vec<String> {
        self.inner
            .lock()
            .components
            .values()
            .filter(|component| component.active)
            .map(|component| component.name.clone())
            .collect()
    }

    fn all_idle(inner: &Inner) -> bool {
        inner.components.values().all(|component| !component.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn empty_tracker_is_idle() {
        assert!(StatusTracker::new().is_idle());
    }

    #[test]
    fn active_component_blocks_idle() {
        let tracker = StatusTracker::new();
        let a = tracker.add_component("a");
        let b = tracker.add_component("b");
        tracker.mark_active(a);
        tracker.mark_active(b);
        tracker.mark_idle(a);
        assert!(!tracker.is_idle());
        tracker.mark_idle(b);
        assert!(tracker.is_idle());
    }

    #[test]
    fn removed_component_no_longer_counts() {
        let tracker = StatusTracker::new();
        let id = tracker.add_component("stuck");
        tracker.mark_active(id);
        tracker.remove_component(id);
        assert!(tracker.is_idle());
    }

    #[test]
    fn stale_id_is_ignored() {
        let tracker = StatusTracker::new();
        let id = tracker.add_component("gone");
        tracker.remove_component(id);
        tracker.mark_active(id);
        assert!(tracker.is_idle());
    }

    #[test]
    fn wait_idle_wakes_on_transition() {
        let tracker = Arc::new(StatusTracker::new());
        let id = tracker.add_component("worker");
        tracker.mark_active(id);

        let waiter = {
            let tracker = tracker.clone();
            thread::spawn(move || tracker.wait_idle(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        tracker.mark_idle(id);
        assert!(waiter.join().expect("waiter"));
    }
}
