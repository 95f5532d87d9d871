//! Weak-reference collections and callbacks
//!
//! These are the lifetime-decoupling primitives the rest of the crate is built
//! on: a long-lived hub (mediator, notifier, requery bus) must never keep a
//! short-lived subscriber alive just because it once subscribed.
//!
//! - [`WeakList<T>`]: a sequence of weak slots that prunes dead entries
//!   opportunistically and never exposes them to callers.
//! - [`WeakCallback<A>`]: a method reference bound to a weakly-held receiver,
//!   comparable against a freshly built callback for the same method/receiver.
//! - [`CallbackSet<A>`]: a multicast list of weak callbacks with
//!   removal-by-equality, used for change-notification events.

use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

/// Result of invoking a weakly-bound callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    /// The receiver was alive (or the callback was unbound) and the call ran.
    Invoked,
    /// The receiver has been dropped; the call did not run.
    TargetDropped,
}

/// A list whose slots hold weak references.
///
/// A dead slot is functionally absent: every query treats it as missing, and
/// mutation or iteration start sweeps dead slots so they cannot accumulate.
/// Indices are therefore always *live* indices.
pub struct WeakList<T: ?Sized> {
    slots: Vec<Weak<T>>,
}

impl<T: ?Sized> WeakList<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
        }
    }

    /// Drop every slot whose referent is gone.
    pub fn prune(&mut self) {
        self.slots.retain(|slot| slot.strong_count() > 0);
    }

    /// Number of currently-live elements.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a weak reference to `item`.
    pub fn push(&mut self, item: &Arc<T>) {
        self.prune();
        self.slots.push(Arc::downgrade(item));
    }

    /// Insert a weak reference to `item` at a live index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is greater than the live length, matching `Vec`.
    pub fn insert(&mut self, index: usize, item: &Arc<T>) {
        self.prune();
        self.slots.insert(index, Arc::downgrade(item));
    }

    /// Remove the first slot referring to `item`. Returns whether a slot was
    /// removed.
    pub fn remove(&mut self, item: &Arc<T>) -> bool {
        self.prune();
        match self.position_of(item) {
            Some(index) => {
                self.slots.remove(index);
                true
            }
            None => false,
        }
    }

    /// Whether some live slot refers to `item`.
    pub fn contains(&self, item: &Arc<T>) -> bool {
        self.position_of(item).is_some()
    }

    /// Live index of `item`, if present.
    pub fn index_of(&self, item: &Arc<T>) -> Option<usize> {
        let mut live = 0;
        for slot in &self.slots {
            if let Some(current) = slot.upgrade() {
                if Arc::ptr_eq(&current, item) {
                    return Some(live);
                }
                live += 1;
            }
        }
        None
    }

    /// Upgrade the element at a live index.
    pub fn get(&self, index: usize) -> Option<Arc<T>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.upgrade())
            .nth(index)
    }

    /// Iterate the currently-live elements.
    ///
    /// Dead slots are swept before iteration begins. Each yielded [`Arc`] is
    /// the only thing keeping that element alive from the list's side; once
    /// the caller drops it, the element may die before the next yield.
    pub fn iter(&mut self) -> impl Iterator<Item = Arc<T>> + '_ {
        self.prune();
        self.slots.iter().filter_map(|slot| slot.upgrade())
    }

    /// Raw slot index of `item` (dead slots included), for internal removal.
    fn position_of(&self, item: &Arc<T>) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.upgrade()
                .map(|current| Arc::ptr_eq(&current, item))
                .unwrap_or(false)
        })
    }
}

impl<T: ?Sized> Default for WeakList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> std::fmt::Debug for WeakList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakList")
            .field("live", &self.len())
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// A callable bound to a weakly-held receiver.
///
/// Stores the receiver as a weak reference (or nothing for free functions)
/// plus the method as a plain function pointer, so two callbacks for the same
/// method on the same receiver compare equal without either of them keeping
/// the receiver alive.
pub struct WeakCallback<A: ?Sized = ()> {
    target: Option<Weak<dyn Any + Send + Sync>>,
    method_id: usize,
    trampoline: Arc<dyn Fn(&A) -> CallOutcome + Send + Sync>,
}

impl<A: ?Sized + 'static> WeakCallback<A> {
    /// A callback for `method` on `target`, holding `target` weakly.
    pub fn bound<S>(target: &Arc<S>, method: fn(&S, &A)) -> Self
    where
        S: Send + Sync + 'static,
    {
        let erased: Arc<dyn Any + Send + Sync> = Arc::clone(target) as Arc<dyn Any + Send + Sync>;
        let weak = Arc::downgrade(target);
        Self {
            target: Some(Arc::downgrade(&erased)),
            method_id: method as usize,
            trampoline: Arc::new(move |arg: &A| match weak.upgrade() {
                Some(receiver) => {
                    method(&receiver, arg);
                    CallOutcome::Invoked
                }
                None => CallOutcome::TargetDropped,
            }),
        }
    }

    /// A callback for a free function; always alive.
    pub fn unbound(function: fn(&A)) -> Self {
        Self {
            target: None,
            method_id: function as usize,
            trampoline: Arc::new(move |arg: &A| {
                function(arg);
                CallOutcome::Invoked
            }),
        }
    }

    /// True if the callback is unbound or its receiver still exists.
    pub fn is_alive(&self) -> bool {
        match &self.target {
            None => true,
            Some(weak) => weak.strong_count() > 0,
        }
    }

    /// Invoke the callback if its receiver is still alive.
    pub fn invoke(&self, arg: &A) -> CallOutcome {
        (self.trampoline)(arg)
    }
}

impl<A: ?Sized> Clone for WeakCallback<A> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            method_id: self.method_id,
            trampoline: Arc::clone(&self.trampoline),
        }
    }
}

impl<A: ?Sized> PartialEq for WeakCallback<A> {
    fn eq(&self, other: &Self) -> bool {
        if self.method_id != other.method_id {
            return false;
        }
        match (&self.target, &other.target) {
            (None, None) => true,
            (Some(a), Some(b)) => match (a.upgrade(), b.upgrade()) {
                // Comparing through temporary upgrades: the receivers live
                // only for the duration of this comparison.
                (Some(x), Some(y)) => Arc::ptr_eq(&x, &y),
                _ => false,
            },
            _ => false,
        }
    }
}

impl<A: ?Sized> std::fmt::Debug for WeakCallback<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakCallback")
            .field("bound", &self.target.is_some())
            .field("alive", &match &self.target {
                None => true,
                Some(weak) => weak.strong_count() > 0,
            })
            .finish()
    }
}

/// A multicast list of weak callbacks.
///
/// Subscribers are removed either explicitly (by equality against a freshly
/// built [`WeakCallback`]) or implicitly when a raise observes their receiver
/// dead.
pub struct CallbackSet<A: ?Sized = ()> {
    handlers: Mutex<Vec<WeakCallback<A>>>,
}

impl<A: ?Sized + 'static> CallbackSet<A> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, callback: WeakCallback<A>) {
        self.handlers.lock().unwrap().push(callback);
    }

    /// Remove the first handler equal to `callback`.
    pub fn remove(&self, callback: &WeakCallback<A>) -> bool {
        let mut handlers = self.handlers.lock().unwrap();
        match handlers.iter().position(|existing| existing == callback) {
            Some(index) => {
                handlers.remove(index);
                true
            }
            None => false,
        }
    }

    /// Invoke every live handler; sweep the ones whose receivers are gone.
    ///
    /// Handlers run outside the lock, so a handler may add or remove
    /// subscriptions without deadlocking.
    pub fn raise(&self, arg: &A) {
        let snapshot: Vec<WeakCallback<A>> = self.handlers.lock().unwrap().clone();
        let mut any_dead = false;
        for handler in &snapshot {
            if handler.invoke(arg) == CallOutcome::TargetDropped {
                any_dead = true;
            }
        }
        if any_dead {
            self.handlers
                .lock()
                .unwrap()
                .retain(|handler| handler.is_alive());
        }
    }

    /// Number of currently-live handlers.
    pub fn len(&self) -> usize {
        self.handlers
            .lock()
            .unwrap()
            .iter()
            .filter(|handler| handler.is_alive())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A: ?Sized + 'static> Default for CallbackSet<A> {
    fn default() -> Self {
        Self::new()
    }
}
