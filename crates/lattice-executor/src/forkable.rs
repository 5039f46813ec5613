//! Process-global registry of fork-aware components
//!
//! `fork()` and threads interact badly; components that own threads
//! register here so a fork wrapper can tear them down first and rebuild
//! them on both sides. `prepare_fork` callbacks run in registration
//! order, the postfork callbacks in reverse order.

use std::sync::{Mutex, Weak};

/// A component that must participate in fork events
pub trait Forkable: Send + Sync {
    /// Called before fork; must stop all owned threads
    fn prepare_fork(&self);

    /// Called in the parent after fork; restores normal operation
    fn postfork_parent(&self);

    /// Called in the child after fork; restores normal operation
    fn postfork_child(&self);
}

static REGISTRY: Mutex<Vec<Weak<dyn Forkable>>> = Mutex::new(Vec::new());

/// Enroll a component; the registry holds only a weak reference
pub fn register(f: Weak<dyn Forkable>) {
    REGISTRY.lock().unwrap().push(f);
}

/// Remove a previously-enrolled component
pub fn unregister(f: &Weak<dyn Forkable>) {
    REGISTRY
        .lock()
        .unwrap()
        .retain(|w| !Weak::ptr_eq(w, f));
}

fn snapshot() -> Vec<Weak<dyn Forkable>> {
    let mut registry = REGISTRY.lock().unwrap();
    // drop entries whose component is gone
    registry.retain(|w| w.strong_count() > 0);
    registry.clone()
}

/// Run `prepare_fork` on every live component, in registration order
pub fn prepare_fork_all() {
    for w in snapshot() {
        if let Some(f) = w.upgrade() {
            f.prepare_fork();
        }
    }
}

/// Run `postfork_parent` on every live component, in reverse order
pub fn postfork_parent_all() {
    for w in snapshot().into_iter().rev() {
        if let Some(f) = w.upgrade() {
            f.postfork_parent();
        }
    }
}

/// Run `postfork_child` on every live component, in reverse order
pub fn postfork_child_all() {
    for w in snapshot().into_iter().rev() {
        if let Some(f) = w.upgrade() {
            f.postfork_child();
        }
    }
}
