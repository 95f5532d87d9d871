//! Command adapters for UI binding layers
//!
//! A [`Command`] wraps "something the user can invoke" behind the standard
//! invocable/queryable shape a binding layer consumes: `can_execute`,
//! `execute`, and a change-notification channel that tells the UI to re-query
//! availability. [`RelayCommand`] adapts a plain action plus an optional
//! predicate; [`AsyncRelayCommand`] offloads the action to a worker thread and
//! reports completion or failure through callbacks.
//!
//! Change notification runs over one of two channels, chosen at construction:
//! a private per-command subscriber list, or a shared [`RequeryBus`] so that
//! one "something changed" signal re-evaluates every command wired to the bus.
//! The bus is an explicit, injectable object rather than process-wide state,
//! which keeps it testable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error};

use crate::weak::{CallbackSet, WeakCallback};

/// Error type carried out of a failed [`AsyncRelayCommand`] action.
pub type CommandError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The invocable-command shape exposed to UI binding layers.
///
/// `execute` does not consult `can_execute`; callers are expected to check
/// first. Availability changes are announced through the subscription pair,
/// with subscribers held weakly so a command never keeps a UI element alive.
pub trait Command<P = ()>: Send + Sync {
    /// Whether the command is currently available for `parameter`.
    fn can_execute(&self, parameter: &P) -> bool;

    /// Invoke the command. Unconditional; no internal availability guard.
    fn execute(&self, parameter: &P);

    /// Subscribe to availability-change notifications.
    fn subscribe_can_execute_changed(&self, callback: WeakCallback);

    /// Remove a subscription by equality against a freshly built callback.
    fn unsubscribe_can_execute_changed(&self, callback: &WeakCallback) -> bool;

    /// Manually announce that availability may have changed.
    fn raise_can_execute_changed(&self);
}

/// A shared re-query channel: one raise re-evaluates every command wired to
/// it.
///
/// Commands in bus mode mirror their subscriptions here instead of keeping a
/// private list, so UI layers that subscribe through any one command are
/// notified when any bus-wired command raises.
pub struct RequeryBus {
    listeners: CallbackSet,
}

impl RequeryBus {
    pub fn new() -> Self {
        Self {
            listeners: CallbackSet::new(),
        }
    }

    pub fn subscribe(&self, callback: WeakCallback) {
        self.listeners.add(callback);
    }

    pub fn unsubscribe(&self, callback: &WeakCallback) -> bool {
        self.listeners.remove(callback)
    }

    /// Ask every live subscriber to re-query command availability.
    pub fn raise_requery(&self) {
        debug!(listeners = self.listeners.len(), "requery requested");
        self.listeners.raise(&());
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Default for RequeryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a command's availability-change notifications go.
enum NotifyChannel {
    Private(CallbackSet),
    Bus(Arc<RequeryBus>),
}

impl NotifyChannel {
    fn subscribe(&self, callback: WeakCallback) {
        match self {
            Self::Private(set) => set.add(callback),
            Self::Bus(bus) => bus.subscribe(callback),
        }
    }

    fn unsubscribe(&self, callback: &WeakCallback) -> bool {
        match self {
            Self::Private(set) => set.remove(callback),
            Self::Bus(bus) => bus.unsubscribe(callback),
        }
    }

    fn raise(&self) {
        match self {
            Self::Private(set) => set.raise(&()),
            Self::Bus(bus) => bus.raise_requery(),
        }
    }
}

/// Adapts an action plus an optional predicate into a [`Command`].
///
/// ```
/// use courier_core::command::{Command, RelayCommand};
///
/// let save = RelayCommand::new(|name: &String| println!("saving {name}"))
///     .with_predicate(|name: &String| !name.is_empty());
///
/// assert!(!save.can_execute(&String::new()));
/// assert!(save.can_execute(&"notes.txt".to_string()));
/// save.execute(&"notes.txt".to_string());
/// ```
pub struct RelayCommand<P = ()> {
    action: Box<dyn Fn(&P) + Send + Sync>,
    predicate: Option<Box<dyn Fn(&P) -> bool + Send + Sync>>,
    notify: NotifyChannel,
}

impl<P: 'static> RelayCommand<P> {
    pub fn new(action: impl Fn(&P) + Send + Sync + 'static) -> Self {
        Self {
            action: Box::new(action),
            predicate: None,
            notify: NotifyChannel::Private(CallbackSet::new()),
        }
    }

    /// Gate `can_execute` on `predicate`. Without one, the command is always
    /// available.
    pub fn with_predicate(mut self, predicate: impl Fn(&P) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    /// Route change notifications over a shared [`RequeryBus`] instead of the
    /// private subscriber list.
    pub fn via_requery_bus(mut self, bus: &Arc<RequeryBus>) -> Self {
        self.notify = NotifyChannel::Bus(Arc::clone(bus));
        self
    }
}

impl<P: 'static> Command<P> for RelayCommand<P> {
    fn can_execute(&self, parameter: &P) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(parameter),
            None => true,
        }
    }

    fn execute(&self, parameter: &P) {
        (self.action)(parameter);
    }

    fn subscribe_can_execute_changed(&self, callback: WeakCallback) {
        self.notify.subscribe(callback);
    }

    fn unsubscribe_can_execute_changed(&self, callback: &WeakCallback) -> bool {
        self.notify.unsubscribe(callback)
    }

    fn raise_can_execute_changed(&self) {
        self.notify.raise();
    }
}

/// A [`Command`] whose action runs on a background worker thread.
///
/// While a run is in flight, `can_execute` reports `false`
/// (single-concurrent-execution). The gate is advisory: `execute` itself never
/// refuses, so a caller that ignores `can_execute` gets a second worker.
///
/// The action reports failure by returning `Err`; the error is delivered to
/// the `on_error` callback, or logged if none was installed, never silently
/// dropped. Completion and error callbacks run on the worker thread;
/// marshalling to a UI thread is the caller's concern.
pub struct AsyncRelayCommand<P = ()> {
    action: Arc<dyn Fn(&P) -> Result<(), CommandError> + Send + Sync>,
    predicate: Option<Box<dyn Fn(&P) -> bool + Send + Sync>>,
    on_completed: Option<Arc<dyn Fn() + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(CommandError) + Send + Sync>>,
    busy: Arc<AtomicBool>,
    notify: Arc<NotifyChannel>,
}

impl<P: Clone + Send + Sync + 'static> AsyncRelayCommand<P> {
    pub fn new(action: impl Fn(&P) -> Result<(), CommandError> + Send + Sync + 'static) -> Self {
        Self {
            action: Arc::new(action),
            predicate: None,
            on_completed: None,
            on_error: None,
            busy: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(NotifyChannel::Private(CallbackSet::new())),
        }
    }

    /// Gate `can_execute` on `predicate`, in addition to the busy gate.
    pub fn with_predicate(mut self, predicate: impl Fn(&P) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    /// Callback invoked on the worker thread after a successful run.
    pub fn on_completed(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_completed = Some(Arc::new(callback));
        self
    }

    /// Callback invoked on the worker thread when the action returns `Err`.
    pub fn on_error(mut self, callback: impl Fn(CommandError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Route change notifications over a shared [`RequeryBus`].
    pub fn via_requery_bus(mut self, bus: &Arc<RequeryBus>) -> Self {
        self.notify = Arc::new(NotifyChannel::Bus(Arc::clone(bus)));
        self
    }

    /// Whether a run is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

impl<P: Clone + Send + Sync + 'static> Command<P> for AsyncRelayCommand<P> {
    fn can_execute(&self, parameter: &P) -> bool {
        if self.busy.load(Ordering::SeqCst) {
            return false;
        }
        match &self.predicate {
            Some(predicate) => predicate(parameter),
            None => true,
        }
    }

    fn execute(&self, parameter: &P) {
        let action = Arc::clone(&self.action);
        let on_completed = self.on_completed.clone();
        let on_error = self.on_error.clone();
        let busy = Arc::clone(&self.busy);
        let notify = Arc::clone(&self.notify);
        let parameter = parameter.clone();

        busy.store(true, Ordering::SeqCst);
        self.notify.raise();

        thread::spawn(move || {
            let result = action(&parameter);
            // Clear the gate before callbacks so a completion callback
            // observes the command as available again.
            busy.store(false, Ordering::SeqCst);
            match result {
                Ok(()) => {
                    if let Some(callback) = &on_completed {
                        callback();
                    }
                }
                Err(err) => match &on_error {
                    Some(callback) => callback(err),
                    None => {
                        error!(error = %err, "async command action failed; no error callback installed");
                    }
                },
            }
            notify.raise();
        });
    }

    fn subscribe_can_execute_changed(&self, callback: WeakCallback) {
        self.notify.subscribe(callback);
    }

    fn unsubscribe_can_execute_changed(&self, callback: &WeakCallback) -> bool {
        self.notify.unsubscribe(callback)
    }

    fn raise_can_execute_changed(&self) {
        self.notify.raise();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Mutex};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    struct Requery {
        hits: AtomicUsize,
    }

    impl Requery {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
            })
        }

        fn on_requery(&self, _arg: &()) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn can_execute_defaults_to_true() {
        let command = RelayCommand::new(|_: &()| {});
        assert!(command.can_execute(&()));
    }

    #[test]
    fn predicate_gates_can_execute_but_not_execute() {
        let executed = Arc::new(AtomicUsize::new(0));
        let executed_in = Arc::clone(&executed);
        let command = RelayCommand::new(move |_: &u32| {
            executed_in.fetch_add(1, Ordering::SeqCst);
        })
        .with_predicate(|value: &u32| *value > 10);

        assert!(!command.can_execute(&5));
        assert!(command.can_execute(&11));

        // Execute is unconditional; the caller owns the check.
        command.execute(&5);
        assert_eq!(executed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn private_change_notification() {
        let command = RelayCommand::new(|_: &()| {});
        let listener = Requery::new();
        command.subscribe_can_execute_changed(WeakCallback::bound(&listener, Requery::on_requery));

        command.raise_can_execute_changed();
        assert_eq!(listener.hits.load(Ordering::SeqCst), 1);

        // Removal by equality against a freshly built callback.
        assert!(command
            .unsubscribe_can_execute_changed(&WeakCallback::bound(&listener, Requery::on_requery)));
        command.raise_can_execute_changed();
        assert_eq!(listener.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_subscriber_is_swept_not_invoked() {
        let command = RelayCommand::new(|_: &()| {});
        let listener = Requery::new();
        command.subscribe_can_execute_changed(WeakCallback::bound(&listener, Requery::on_requery));
        drop(listener);
        // Raising with a dead subscriber neither panics nor leaks the slot.
        command.raise_can_execute_changed();
    }

    #[test]
    fn bus_mode_mirrors_subscriptions_and_raises() {
        let bus = Arc::new(RequeryBus::new());
        let save = RelayCommand::new(|_: &()| {}).via_requery_bus(&bus);
        let undo = RelayCommand::new(|_: &()| {}).via_requery_bus(&bus);

        let listener = Requery::new();
        save.subscribe_can_execute_changed(WeakCallback::bound(&listener, Requery::on_requery));
        assert_eq!(bus.listener_count(), 1);

        // Any bus-wired command's raise reaches subscribers of all of them.
        undo.raise_can_execute_changed();
        assert_eq!(listener.hits.load(Ordering::SeqCst), 1);

        bus.raise_requery();
        assert_eq!(listener.hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn commands_are_object_safe() {
        let command: Arc<dyn Command<u32>> = Arc::new(RelayCommand::new(|_: &u32| {}));
        assert!(command.can_execute(&1));
        command.execute(&1);
    }

    #[test]
    fn async_command_runs_the_action_on_a_worker() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let command = AsyncRelayCommand::new(|value: &u32| {
            assert_eq!(*value, 7);
            Ok(())
        })
        .on_completed(move || {
            tx.lock().unwrap().send(()).unwrap();
        });

        command.execute(&7);
        rx.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn async_command_is_unavailable_while_in_flight() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let (done_tx, done_rx) = mpsc::channel();
        let done_tx = Mutex::new(done_tx);

        let command = AsyncRelayCommand::new(move |_: &()| {
            release_rx.lock().unwrap().recv().unwrap();
            Ok(())
        })
        .on_completed(move || {
            done_tx.lock().unwrap().send(()).unwrap();
        });

        assert!(command.can_execute(&()));
        command.execute(&());
        // Busy is set synchronously in execute, before the worker starts.
        assert!(!command.can_execute(&()));
        assert!(command.is_busy());

        release_tx.send(()).unwrap();
        done_rx.recv_timeout(WAIT).unwrap();
        // The gate clears before the completion callback fires.
        assert!(command.can_execute(&()));
    }

    #[test]
    fn async_command_delivers_errors_to_the_callback() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let command = AsyncRelayCommand::new(|_: &()| Err("disk full".into()))
            .on_error(move |err| {
                tx.lock().unwrap().send(err.to_string()).unwrap();
            });

        command.execute(&());
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "disk full");
        assert!(!command.is_busy());
    }

    #[test]
    fn async_command_raises_requery_on_both_edges() {
        let bus = Arc::new(RequeryBus::new());
        let (done_tx, done_rx) = mpsc::channel();
        let done_tx = Mutex::new(done_tx);
        let command = AsyncRelayCommand::new(|_: &()| Ok(()))
            .on_completed(move || {
                done_tx.lock().unwrap().send(()).unwrap();
            })
            .via_requery_bus(&bus);

        let listener = Requery::new();
        bus.subscribe(WeakCallback::bound(&listener, Requery::on_requery));

        command.execute(&());
        done_rx.recv_timeout(WAIT).unwrap();
        // One raise when the run started, one when it finished. The finish
        // raise happens after the completion callback, so wait for it.
        let deadline = std::time::Instant::now() + WAIT;
        while listener.hits.load(Ordering::SeqCst) < 2 {
            assert!(std::time::Instant::now() < deadline, "requery raises not observed");
            thread::yield_now();
        }
        assert_eq!(listener.hits.load(Ordering::SeqCst), 2);
    }
}
