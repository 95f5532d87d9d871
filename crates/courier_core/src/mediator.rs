//! Message mediation: a keyed and typed publish/subscribe hub
//!
//! The mediator decouples message senders from receivers entirely. Receivers
//! register either as *recipients* (an instance held weakly, whose handler
//! methods are declared through [`Recipient::routes`]) or as standalone
//! handler closures. Senders publish by payload type, by trait facet, or by
//! explicit string key; the mediator invokes every live handler whose route
//! matches, exactly once each.
//!
//! Routing keys come in two flavors:
//!
//! - **Implicit**: the payload's [`TypeId`], used by [`MessageMediator::send`]
//!   and [`MessageMediator::send_as`]. A message may additionally declare
//!   trait facets (see [`Message::fan_out`] and the [`message!`](crate::message)
//!   macro), which fan a typed send out to handlers bound to those traits,
//!   always after the concrete-type handlers.
//! - **Explicit**: a caller-chosen string, used by
//!   [`MessageMediator::send_keyed`]. Explicit-key routes never fire from
//!   typed sends and vice versa.
//!
//! The registration table sits behind one mutex that is never held while a
//! handler runs, so handlers are free to send, register, and unregister
//! reentrantly. Handlers whose owning instance has been dropped are skipped at
//! dispatch time and swept after the iteration completes. A panicking handler
//! is not caught; it propagates to the sender.
//!
//! ```
//! use courier_core::mediator::MessageMediator;
//! use courier_core::message;
//!
//! struct TickEvent(u64);
//! message!(TickEvent);
//!
//! let mediator = MessageMediator::new();
//! mediator.register_handler::<TickEvent>(|tick| println!("tick {}", tick.0));
//! assert!(mediator.send(&TickEvent(1)));
//! ```

use std::any::{type_name, Any, TypeId};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::weak::CallOutcome;

new_key_type! {
    /// Unique identifier for a registered handler record
    pub struct HandlerId;
}

/// Errors raised by mis-configured registrations or keyed sends.
///
/// These are programmer errors surfaced at the offending call; the absence of
/// receivers is never an error (sends report it as `false`).
#[derive(Error, Debug)]
pub enum MediatorError {
    /// A key is already bound to a different payload type.
    #[error("key '{key}' is bound to payload type {bound}, cannot accept {offered}")]
    KeyTypeConflict {
        key: String,
        bound: &'static str,
        offered: &'static str,
    },

    /// A keyed send's payload type does not match the key's bound type.
    #[error("key '{key}' expects payload type {expected}, got {found}")]
    PayloadTypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// A payload that can be published through [`MessageMediator::send`].
///
/// `fan_out` declares the trait facets of the message: after the concrete-type
/// handlers fire, the mediator gives the payload a chance to deliver itself
/// under each trait key it wants to be visible as. Implement it by calling
/// [`MessageMediator::send_as`] per facet, or use the
/// [`message!`](crate::message) macro.
pub trait Message: Any + Send + Sync {
    /// Deliver this message to handlers bound to its trait facets.
    ///
    /// Returns true if any facet handler was actually invoked.
    fn fan_out(&self, mediator: &MessageMediator) -> bool {
        let _ = mediator;
        false
    }
}

/// Implements [`Message`] for a payload type, optionally declaring the trait
/// facets typed sends fan out to (in the order given).
///
/// ```
/// use courier_core::message;
///
/// trait AuditEvent: Send + Sync {
///     fn description(&self) -> String;
/// }
///
/// struct SaveRequested {
///     document: String,
/// }
///
/// impl AuditEvent for SaveRequested {
///     fn description(&self) -> String {
///         format!("save {}", self.document)
///     }
/// }
///
/// message!(SaveRequested => dyn AuditEvent);
/// ```
#[macro_export]
macro_rules! message {
    ($ty:ty) => {
        impl $crate::mediator::Message for $ty {}
    };
    ($ty:ty => $($facet:ty),+ $(,)?) => {
        impl $crate::mediator::Message for $ty {
            fn fan_out(&self, mediator: &$crate::mediator::MessageMediator) -> bool {
                let mut delivered = false;
                $(delivered |= mediator.send_as::<$facet>(self);)+
                delivered
            }
        }
    };
}

/// An object that declares message routes for its own handler methods.
///
/// This is the statically-typed counterpart of scanning an instance for
/// annotated handler methods: each recipient lists its handlers once, as plain
/// method references, and [`MessageMediator::register`] materializes them with
/// a weak reference to the instance.
///
/// ```
/// use courier_core::mediator::{Recipient, Routes};
/// # use courier_core::message;
/// # struct SaveRequested;
/// # message!(SaveRequested);
///
/// struct DocumentViewModel;
///
/// impl DocumentViewModel {
///     fn on_save(&self, _request: &SaveRequested) {}
/// }
///
/// impl Recipient for DocumentViewModel {
///     fn routes(routes: &mut Routes<Self>) {
///         routes.on(Self::on_save);
///     }
/// }
/// ```
pub trait Recipient: Send + Sync + Sized + 'static {
    /// Declare this type's handler methods and their routing keys.
    fn routes(routes: &mut Routes<Self>);
}

/// Route declarations collected from [`Recipient::routes`].
///
/// Listing the same method more than once produces one handler record per
/// listing; no deduplication is performed.
pub struct Routes<S: Recipient> {
    entries: Vec<Box<dyn FnOnce(&Arc<S>) -> HandlerRecord>>,
}

impl<S: Recipient> Routes<S> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Route messages of type `M` (and typed sends forced to `M` via
    /// [`MessageMediator::send_as`]) to `method`.
    pub fn on<M: ?Sized + 'static>(&mut self, method: fn(&S, &M)) -> &mut Self {
        self.entries.push(Box::new(move |instance| {
            HandlerRecord::for_instance(RouteKey::Type(TypeId::of::<M>()), instance, method)
        }));
        self
    }

    /// Route messages sent under the explicit string `key` to `method`.
    ///
    /// Explicit-key routes respond only to [`MessageMediator::send_keyed`],
    /// never to typed sends. The key binds to `M` on first registration; a
    /// route offering a different payload type for an already-bound key is
    /// rejected at [`MessageMediator::register`] time.
    pub fn on_keyed<M: 'static>(&mut self, key: &str, method: fn(&S, &M)) -> &mut Self {
        let key = key.to_string();
        self.entries.push(Box::new(move |instance| {
            HandlerRecord::for_instance(RouteKey::Named(key), instance, method)
        }));
        self
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
enum RouteKey {
    Type(TypeId),
    Named(String),
}

/// Type-erased invoker stored in a handler record.
///
/// The concrete stored type is always `ErasedHandler<M>` for the record's
/// payload type `M`, recovered by downcast at dispatch time.
type ErasedHandler<M: ?Sized> = Arc<dyn Fn(&M) -> CallOutcome + Send + Sync>;

struct HandlerRecord {
    key: RouteKey,
    payload_type: TypeId,
    payload_type_name: &'static str,
    /// Identity of the owning instance's allocation, for unregistration.
    owner: Option<usize>,
    callback: Box<dyn Any + Send + Sync>,
}

impl HandlerRecord {
    fn for_instance<S, M>(key: RouteKey, instance: &Arc<S>, method: fn(&S, &M)) -> Self
    where
        S: Recipient,
        M: ?Sized + 'static,
    {
        let weak = Arc::downgrade(instance);
        let callback: ErasedHandler<M> = Arc::new(move |payload: &M| match weak.upgrade() {
            Some(receiver) => {
                method(&receiver, payload);
                CallOutcome::Invoked
            }
            None => CallOutcome::TargetDropped,
        });
        Self {
            key,
            payload_type: TypeId::of::<M>(),
            payload_type_name: type_name::<M>(),
            owner: Some(Arc::as_ptr(instance) as *const () as usize),
            callback: Box::new(callback),
        }
    }

    fn for_closure<M, F>(key: RouteKey, handler: F) -> Self
    where
        M: ?Sized + 'static,
        F: Fn(&M) + Send + Sync + 'static,
    {
        let callback: ErasedHandler<M> = Arc::new(move |payload: &M| {
            handler(payload);
            CallOutcome::Invoked
        });
        Self {
            key,
            payload_type: TypeId::of::<M>(),
            payload_type_name: type_name::<M>(),
            owner: None,
            callback: Box::new(callback),
        }
    }
}

#[derive(Default)]
struct MediatorInner {
    records: SlotMap<HandlerId, Arc<HandlerRecord>>,
    routes: FxHashMap<RouteKey, Vec<HandlerId>>,
}

impl MediatorInner {
    fn insert(&mut self, record: HandlerRecord) -> HandlerId {
        let key = record.key.clone();
        let id = self.records.insert(Arc::new(record));
        self.routes.entry(key).or_default().push(id);
        id
    }

    fn remove(&mut self, id: HandlerId) -> bool {
        let Some(record) = self.records.remove(id) else {
            return false;
        };
        if let Some(ids) = self.routes.get_mut(&record.key) {
            ids.retain(|existing| *existing != id);
            if ids.is_empty() {
                // An emptied explicit key also sheds its type binding.
                self.routes.remove(&record.key);
            }
        }
        true
    }

    /// The payload type an explicit key is currently bound to.
    fn bound_type(&self, key: &RouteKey) -> Option<(&'static str, TypeId)> {
        let ids = self.routes.get(key)?;
        let first = ids.first()?;
        let record = self.records.get(*first)?;
        Some((record.payload_type_name, record.payload_type))
    }
}

/// The central publish/subscribe registry.
///
/// Cheap to share via `Arc`; all methods take `&self`.
pub struct MessageMediator {
    inner: Mutex<MediatorInner>,
}

impl MessageMediator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MediatorInner::default()),
        }
    }

    // =========================================================================
    // REGISTRATION
    // =========================================================================

    /// Register every route declared by `instance`'s [`Recipient`] impl,
    /// holding the instance weakly.
    ///
    /// A recipient that declares zero routes registers nothing; that is not an
    /// error. Registering the same instance twice duplicates its handler
    /// records. A keyed route whose payload type conflicts with the key's
    /// existing binding is not registered; the conflict is logged.
    pub fn register<S: Recipient>(&self, instance: &Arc<S>) {
        let mut routes = Routes::new();
        S::routes(&mut routes);
        let records: Vec<HandlerRecord> = routes
            .entries
            .into_iter()
            .map(|build| build(instance))
            .collect();
        let mut registered = 0;
        let mut inner = self.inner.lock().unwrap();
        for record in records {
            if let RouteKey::Named(name) = &record.key {
                if let Some((bound, bound_type)) = inner.bound_type(&record.key) {
                    if bound_type != record.payload_type {
                        warn!(
                            recipient = type_name::<S>(),
                            key = %name,
                            bound,
                            offered = record.payload_type_name,
                            "keyed route conflicts with the key's bound payload type; route skipped"
                        );
                        continue;
                    }
                }
            }
            inner.insert(record);
            registered += 1;
        }
        debug!(
            recipient = type_name::<S>(),
            routes = registered,
            "registered recipient"
        );
    }

    /// Remove every handler record owned by `instance` (pointer identity).
    ///
    /// Returns the number of records removed; unknown instances remove zero.
    pub fn unregister<S: Recipient>(&self, instance: &Arc<S>) -> usize {
        let owner = Arc::as_ptr(instance) as *const () as usize;
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<HandlerId> = inner
            .records
            .iter()
            .filter(|(_, record)| record.owner == Some(owner))
            .map(|(id, _)| id)
            .collect();
        for id in &ids {
            inner.remove(*id);
        }
        debug!(
            recipient = type_name::<S>(),
            removed = ids.len(),
            "unregistered recipient"
        );
        ids.len()
    }

    /// Register a standalone handler under the implicit type key `M`.
    ///
    /// The closure itself keeps whatever it captures alive; there is no owner
    /// lifetime tracking. Remove it with [`MessageMediator::remove_handler`].
    pub fn register_handler<M: ?Sized + 'static>(
        &self,
        handler: impl Fn(&M) + Send + Sync + 'static,
    ) -> HandlerId {
        let record = HandlerRecord::for_closure(RouteKey::Type(TypeId::of::<M>()), handler);
        self.inner.lock().unwrap().insert(record)
    }

    /// Register a standalone handler under an explicit string key.
    ///
    /// The first registration binds the key to `M`; registering a different
    /// payload type under the same key afterwards is a
    /// [`MediatorError::KeyTypeConflict`].
    pub fn register_keyed_handler<M: 'static>(
        &self,
        key: impl Into<String>,
        handler: impl Fn(&M) + Send + Sync + 'static,
    ) -> Result<HandlerId, MediatorError> {
        let key = key.into();
        let route = RouteKey::Named(key.clone());
        let mut inner = self.inner.lock().unwrap();
        if let Some((bound_name, bound_type)) = inner.bound_type(&route) {
            if bound_type != TypeId::of::<M>() {
                return Err(MediatorError::KeyTypeConflict {
                    key,
                    bound: bound_name,
                    offered: type_name::<M>(),
                });
            }
        }
        Ok(inner.insert(HandlerRecord::for_closure(route, handler)))
    }

    /// Remove a handler registered through [`MessageMediator::register_handler`]
    /// or [`MessageMediator::register_keyed_handler`].
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.inner.lock().unwrap().remove(id)
    }

    // =========================================================================
    // SENDING
    // =========================================================================

    /// Publish `payload` under its concrete type key, then under each trait
    /// facet it declares (concrete handlers strictly first).
    ///
    /// Returns true iff at least one live handler was invoked. No matching
    /// handlers is not an error.
    pub fn send<M: Message>(&self, payload: &M) -> bool {
        let direct = self.deliver(&RouteKey::Type(TypeId::of::<M>()), payload) > 0;
        let fanned = payload.fan_out(self);
        direct || fanned
    }

    /// Publish `payload` under the type key `M` only.
    ///
    /// This forces the lookup key, which is how a sender deliberately targets
    /// a base or trait key: `mediator.send_as::<dyn AuditEvent>(&event)`. No
    /// facet fan-out is performed.
    pub fn send_as<M: ?Sized + 'static>(&self, payload: &M) -> bool {
        self.deliver(&RouteKey::Type(TypeId::of::<M>()), payload) > 0
    }

    /// Publish `payload` under an explicit string key only.
    ///
    /// The payload type must match the type the key was bound to at
    /// registration; a mismatch is a caller error reported as
    /// [`MediatorError::PayloadTypeMismatch`]. `Ok(false)` means the key has
    /// no live handlers.
    pub fn send_keyed<M: 'static>(&self, key: &str, payload: &M) -> Result<bool, MediatorError> {
        let route = RouteKey::Named(key.to_string());
        {
            let inner = self.inner.lock().unwrap();
            match inner.bound_type(&route) {
                None => return Ok(false),
                Some((bound_name, bound_type)) => {
                    if bound_type != TypeId::of::<M>() {
                        return Err(MediatorError::PayloadTypeMismatch {
                            key: key.to_string(),
                            expected: bound_name,
                            found: type_name::<M>(),
                        });
                    }
                }
            }
        }
        Ok(self.deliver(&route, payload) > 0)
    }

    /// Snapshot of table sizes, for diagnostics.
    pub fn stats(&self) -> MediatorStats {
        let inner = self.inner.lock().unwrap();
        MediatorStats {
            handler_count: inner.records.len(),
            route_count: inner.routes.len(),
        }
    }

    // =========================================================================
    // INTERNAL
    // =========================================================================

    /// Invoke every record in `key`'s bucket, in registration order.
    ///
    /// The bucket is snapshotted under the lock and invoked outside it, so
    /// handlers may reenter the mediator. Records whose owner died are skipped
    /// and swept after the iteration completes, never mid-iteration.
    fn deliver<M: ?Sized + 'static>(&self, key: &RouteKey, payload: &M) -> usize {
        let batch: SmallVec<[(HandlerId, Arc<HandlerRecord>); 4]> = {
            let inner = self.inner.lock().unwrap();
            let Some(ids) = inner.routes.get(key) else {
                return 0;
            };
            ids.iter()
                .filter_map(|id| inner.records.get(*id).map(|record| (*id, Arc::clone(record))))
                .collect()
        };

        let mut delivered = 0;
        let mut dead: SmallVec<[HandlerId; 4]> = SmallVec::new();
        for (id, record) in &batch {
            // Type buckets can only hold matching callbacks; a keyed bucket
            // was type-checked by the caller. Anything else is skipped.
            let Some(callback) = record.callback.downcast_ref::<ErasedHandler<M>>() else {
                continue;
            };
            match callback(payload) {
                CallOutcome::Invoked => delivered += 1,
                CallOutcome::TargetDropped => dead.push(*id),
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.lock().unwrap();
            for id in &dead {
                inner.remove(*id);
            }
            trace!(swept = dead.len(), "swept dead handler records");
        }
        trace!(?key, matched = batch.len(), delivered, "dispatched message");
        delivered
    }
}

impl Default for MessageMediator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MediatorStats {
    pub handler_count: usize,
    pub route_count: usize,
}
