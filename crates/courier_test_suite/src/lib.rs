//! Shared fixtures for Courier integration scenarios
//!
//! The view-models here are deliberately small but wired the way real MVVM
//! code is: a recipient with typed, facet, and keyed routes; an observable
//! with a change notifier; and a probe for requery broadcasts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use courier_core::mediator::{Recipient, Routes};
use courier_core::message;
use courier_core::observer::{ChangeNotifier, Observable};

/// The trait facet `SaveRequested` fans out to on typed sends.
pub trait DataEvent: Send + Sync {
    fn name(&self) -> &str;
}

pub struct SaveRequested {
    pub document: String,
}

impl DataEvent for SaveRequested {
    fn name(&self) -> &str {
        &self.document
    }
}

message!(SaveRequested => dyn DataEvent);

/// A recipient with one route per flavor: implicit type key, trait facet,
/// and explicit string key. Every delivery is appended to `log`.
#[derive(Default)]
pub struct DocumentViewModel {
    log: Mutex<Vec<String>>,
}

impl DocumentViewModel {
    fn on_save(&self, request: &SaveRequested) {
        self.record(format!("typed:{}", request.document));
    }

    fn on_data_event(&self, event: &dyn DataEvent) {
        self.record(format!("facet:{}", event.name()));
    }

    fn on_save_keyed(&self, request: &SaveRequested) {
        self.record(format!("keyed:{}", request.document));
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    /// Drain and return everything delivered so far.
    pub fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }
}

impl Recipient for DocumentViewModel {
    fn routes(routes: &mut Routes<Self>) {
        routes
            .on(Self::on_save)
            .on(Self::on_data_event)
            .on_keyed("save", Self::on_save_keyed);
    }
}

/// An observable view-model with a single `status` property.
pub struct StatusViewModel {
    pub status: Mutex<String>,
    notifier: ChangeNotifier,
}

impl StatusViewModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(String::new()),
            notifier: ChangeNotifier::new(),
        })
    }

    pub fn set_status(&self, status: &str) {
        *self.status.lock().unwrap() = status.to_string();
        self.notifier.raise("status");
    }
}

impl Observable for StatusViewModel {
    fn change_notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }
}

/// Counts requery notifications delivered to it.
pub struct RequeryProbe {
    hits: AtomicUsize,
}

impl RequeryProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hits: AtomicUsize::new(0),
        })
    }

    pub fn on_requery(&self, _arg: &()) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Install a fmt subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
