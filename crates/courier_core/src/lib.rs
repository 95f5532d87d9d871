//! Courier Core
//!
//! This crate provides the messaging and binding primitives for MVVM-style
//! Rust applications:
//!
//! - **Message Mediation**: A keyed and typed publish/subscribe hub that
//!   decouples senders from receivers entirely
//! - **Property Observation**: React to another object's property changes
//!   without either side keeping the other alive
//! - **Commands**: Adapt actions and predicates into the standard
//!   invocable/queryable shape UI binding layers consume
//! - **Weak Primitives**: Self-pruning weak lists and equality-comparable
//!   weak callbacks underpinning all of the above
//!
//! # Example
//!
//! ```rust
//! use courier_core::mediator::MessageMediator;
//! use courier_core::message;
//!
//! struct DocumentSaved {
//!     path: String,
//! }
//! message!(DocumentSaved);
//!
//! let mediator = MessageMediator::new();
//! mediator.register_handler::<DocumentSaved>(|saved| {
//!     println!("saved {}", saved.path);
//! });
//!
//! assert!(mediator.send(&DocumentSaved {
//!     path: "notes.txt".into(),
//! }));
//! ```

pub mod command;
pub mod mediator;
pub mod observer;
pub mod weak;

pub use command::{
    AsyncRelayCommand, Command, CommandError, RelayCommand, RequeryBus,
};
pub use mediator::{
    HandlerId, MediatorError, MediatorStats, Message, MessageMediator, Recipient, Routes,
};
pub use observer::{
    ChangeListener, ChangeNotifier, GlobalHandlerId, Observable, PropertyObserver, ALL_PROPERTIES,
};
pub use weak::{CallOutcome, CallbackSet, WeakCallback, WeakList};
