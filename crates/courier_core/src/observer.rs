//! Property-change observation without strong coupling
//!
//! An observable object owns a [`ChangeNotifier`] and raises it with the name
//! of each property that changed (the empty name means "all properties
//! changed"). A [`PropertyObserver`] lets another object react to those
//! changes per property name, while holding the source only weakly and being
//! held by the source only weakly, so neither side can accidentally prolong
//! the other's lifetime.
//!
//! Failure handling is asymmetric on purpose: a named handler is a single
//! well-known reaction whose panic should be visible to whoever raised the
//! change, whereas the catch-all channel tends to collect many independent,
//! low-trust subscribers (diagnostics, logging). A panicking global handler is
//! therefore caught, logged, and unsubscribed instead of breaking the whole
//! broadcast.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rustc_hash::FxHashMap;
use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use tracing::{error, trace};

use crate::weak::WeakList;

/// The property name that stands for "every property".
///
/// Raising it notifies everything; observing it installs a catch-all callback
/// that fires on every change.
pub const ALL_PROPERTIES: &str = "";

new_key_type! {
    /// Unique identifier for a global (fires-on-every-change) handler
    pub struct GlobalHandlerId;
}

/// Receives property-change notifications from a [`ChangeNotifier`].
pub trait ChangeListener: Send + Sync {
    fn property_changed(&self, property: &str);
}

/// The change-notification source an observable object owns.
///
/// Listeners are held weakly; a listener that has been dropped is pruned the
/// next time the notifier raises or mutates its list.
pub struct ChangeNotifier {
    listeners: Mutex<WeakList<dyn ChangeListener>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(WeakList::new()),
        }
    }

    pub fn subscribe(&self, listener: &Arc<dyn ChangeListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn unsubscribe(&self, listener: &Arc<dyn ChangeListener>) -> bool {
        self.listeners.lock().unwrap().remove(listener)
    }

    /// Notify every live listener that `property` changed.
    ///
    /// Listeners are snapshotted first and invoked outside the lock, so a
    /// listener may subscribe or unsubscribe during the raise.
    pub fn raise(&self, property: &str) {
        let snapshot: SmallVec<[Arc<dyn ChangeListener>; 4]> =
            self.listeners.lock().unwrap().iter().collect();
        trace!(property, listeners = snapshot.len(), "property changed");
        for listener in snapshot {
            listener.property_changed(property);
        }
    }

    /// Notify every live listener that all properties changed.
    pub fn raise_all(&self) {
        self.raise(ALL_PROPERTIES);
    }

    /// Number of currently-live listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// An object whose property changes can be observed.
pub trait Observable: Send + Sync + 'static {
    fn change_notifier(&self) -> &ChangeNotifier;
}

type SourceCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ObserverInner<T: Observable> {
    source: Weak<T>,
    named: Mutex<FxHashMap<String, SourceCallback<T>>>,
    globals: Mutex<SlotMap<GlobalHandlerId, SourceCallback<T>>>,
    subscribed: AtomicBool,
}

impl<T: Observable> ObserverInner<T> {
    fn dispatch(&self, property: &str) {
        let Some(source) = self.source.upgrade() else {
            return;
        };

        // Named callbacks: snapshot-copied so a callback may mutate the
        // registrations without invalidating this iteration.
        if property.is_empty() {
            let snapshot: SmallVec<[SourceCallback<T>; 4]> =
                self.named.lock().unwrap().values().cloned().collect();
            for callback in snapshot {
                callback(&source);
            }
        } else {
            let (named, catch_all) = {
                let map = self.named.lock().unwrap();
                (map.get(property).cloned(), map.get(ALL_PROPERTIES).cloned())
            };
            if let Some(callback) = named {
                callback(&source);
            }
            if let Some(callback) = catch_all {
                callback(&source);
            }
        }

        // Global callbacks: a panicking subscriber is quarantined rather than
        // allowed to break the rest of the broadcast.
        let snapshot: SmallVec<[(GlobalHandlerId, SourceCallback<T>); 4]> = self
            .globals
            .lock()
            .unwrap()
            .iter()
            .map(|(id, callback)| (id, Arc::clone(callback)))
            .collect();
        let mut quarantined: SmallVec<[GlobalHandlerId; 2]> = SmallVec::new();
        for (id, callback) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(&source))).is_err() {
                error!(property, "global property-change handler panicked; unsubscribing it");
                quarantined.push(id);
            }
        }
        if !quarantined.is_empty() {
            let mut globals = self.globals.lock().unwrap();
            for id in quarantined {
                globals.remove(id);
            }
        }
    }
}

impl<T: Observable> ChangeListener for ObserverInner<T> {
    fn property_changed(&self, property: &str) {
        self.dispatch(property);
    }
}

/// Reacts to named property changes on one weakly-held source object.
///
/// One observer wraps exactly one source; many property-name → callback
/// registrations. Nothing is subscribed until the first callback is
/// registered, and dropping the observer (or calling [`close`](Self::close))
/// detaches it from the source completely.
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use courier_core::observer::{ChangeNotifier, Observable, PropertyObserver};
///
/// struct Person {
///     name: Mutex<String>,
///     notifier: ChangeNotifier,
/// }
///
/// impl Observable for Person {
///     fn change_notifier(&self) -> &ChangeNotifier {
///         &self.notifier
///     }
/// }
///
/// impl Person {
///     fn set_name(&self, name: &str) {
///         *self.name.lock().unwrap() = name.to_string();
///         self.notifier.raise("name");
///     }
/// }
///
/// let person = Arc::new(Person {
///     name: Mutex::new(String::new()),
///     notifier: ChangeNotifier::new(),
/// });
/// let observer = PropertyObserver::new(&person);
/// observer.observe("name", |p: &Person| {
///     println!("name is now {}", p.name.lock().unwrap());
/// });
/// person.set_name("Ada");
/// ```
pub struct PropertyObserver<T: Observable> {
    inner: Arc<ObserverInner<T>>,
}

impl<T: Observable> PropertyObserver<T> {
    /// Wrap `source` without subscribing to anything yet.
    pub fn new(source: &Arc<T>) -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                source: Arc::downgrade(source),
                named: Mutex::new(FxHashMap::default()),
                globals: Mutex::new(SlotMap::with_key()),
                subscribed: AtomicBool::new(false),
            }),
        }
    }

    /// Register `callback` for changes to the property named `property`,
    /// overwriting any prior callback for that name.
    ///
    /// Observing [`ALL_PROPERTIES`] installs a catch-all that fires on every
    /// change. Named callbacks are not panic-isolated; see
    /// [`subscribe_any`](Self::subscribe_any) for the quarantined channel.
    pub fn observe(
        &self,
        property: impl Into<String>,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) {
        self.inner
            .named
            .lock()
            .unwrap()
            .insert(property.into(), Arc::new(callback));
        self.ensure_subscribed();
    }

    /// Remove the callback registered for `property`. Returns whether one was
    /// removed. The last removal detaches the observer from the source.
    pub fn unobserve(&self, property: &str) -> bool {
        let removed = self.inner.named.lock().unwrap().remove(property).is_some();
        if removed {
            self.detach_if_idle();
        }
        removed
    }

    /// Register a callback that fires on every change regardless of name.
    ///
    /// If the callback panics it is caught, logged, and unsubscribed; the
    /// remaining global callbacks still run.
    pub fn subscribe_any(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> GlobalHandlerId {
        let id = self.inner.globals.lock().unwrap().insert(Arc::new(callback));
        self.ensure_subscribed();
        id
    }

    /// Remove a global callback by id.
    pub fn unsubscribe_any(&self, id: GlobalHandlerId) -> bool {
        let removed = self.inner.globals.lock().unwrap().remove(id).is_some();
        if removed {
            self.detach_if_idle();
        }
        removed
    }

    /// The observed source, if it is still alive.
    pub fn source(&self) -> Option<Arc<T>> {
        self.inner.source.upgrade()
    }

    /// Detach from the source and drop every registration. Idempotent.
    pub fn close(&self) {
        self.detach();
        self.inner.named.lock().unwrap().clear();
        self.inner.globals.lock().unwrap().clear();
    }

    fn ensure_subscribed(&self) {
        if self.inner.subscribed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(source) = self.inner.source.upgrade() {
            let listener: Arc<dyn ChangeListener> = Arc::clone(&self.inner) as _;
            source.change_notifier().subscribe(&listener);
        }
    }

    fn detach_if_idle(&self) {
        let idle = self.inner.named.lock().unwrap().is_empty()
            && self.inner.globals.lock().unwrap().is_empty();
        if idle {
            self.detach();
        }
    }

    fn detach(&self) {
        if !self.inner.subscribed.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(source) = self.inner.source.upgrade() {
            let listener: Arc<dyn ChangeListener> = Arc::clone(&self.inner) as _;
            source.change_notifier().unsubscribe(&listener);
        }
    }
}

impl<T: Observable> Drop for PropertyObserver<T> {
    fn drop(&mut self) {
        self.close();
    }
}
