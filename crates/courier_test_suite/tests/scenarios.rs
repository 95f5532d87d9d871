//! End-to-end scenarios wiring the mediator, observer, and commands together
//! the way an MVVM application does.

use std::sync::Arc;

use courier_core::command::{Command, RelayCommand, RequeryBus};
use courier_core::mediator::MessageMediator;
use courier_core::observer::PropertyObserver;
use courier_core::weak::WeakCallback;
use courier_test_suite::{
    init_tracing, DataEvent, DocumentViewModel, RequeryProbe, SaveRequested, StatusViewModel,
};

fn save(document: &str) -> SaveRequested {
    SaveRequested {
        document: document.to_string(),
    }
}

#[test]
fn typed_send_hits_typed_and_facet_routes_but_not_keyed() -> anyhow::Result<()> {
    init_tracing();
    let mediator = MessageMediator::new();
    let vm = Arc::new(DocumentViewModel::default());
    mediator.register(&vm);

    // Implicit-type send: the typed route fires first, then the facet route.
    // The explicit "save" key stays silent.
    assert!(mediator.send(&save("notes.txt")));
    assert_eq!(vm.take_log(), vec!["typed:notes.txt", "facet:notes.txt"]);

    // Only the explicit keyed send reaches the keyed route.
    assert!(mediator.send_keyed("save", &save("notes.txt"))?);
    assert_eq!(vm.take_log(), vec!["keyed:notes.txt"]);
    Ok(())
}

#[test]
fn facet_targeted_send_skips_the_concrete_route() {
    let mediator = MessageMediator::new();
    let vm = Arc::new(DocumentViewModel::default());
    mediator.register(&vm);

    assert!(mediator.send_as::<dyn DataEvent>(&save("report.txt")));
    assert_eq!(vm.take_log(), vec!["facet:report.txt"]);
}

#[test]
fn broadcast_reaches_every_registered_view_model() {
    let mediator = MessageMediator::new();
    let first = Arc::new(DocumentViewModel::default());
    let second = Arc::new(DocumentViewModel::default());
    mediator.register(&first);
    mediator.register(&second);

    assert!(mediator.send(&save("shared.txt")));
    assert_eq!(first.take_log(), vec!["typed:shared.txt", "facet:shared.txt"]);
    assert_eq!(second.take_log(), vec!["typed:shared.txt", "facet:shared.txt"]);
}

#[test]
fn dropped_view_model_no_longer_receives() {
    let mediator = MessageMediator::new();
    let survivor = Arc::new(DocumentViewModel::default());
    let doomed = Arc::new(DocumentViewModel::default());
    mediator.register(&survivor);
    mediator.register(&doomed);

    drop(doomed);
    assert!(mediator.send(&save("after.txt")));
    assert_eq!(
        survivor.take_log(),
        vec!["typed:after.txt", "facet:after.txt"]
    );
}

#[test]
fn unregistered_view_model_no_longer_receives() {
    let mediator = MessageMediator::new();
    let vm = Arc::new(DocumentViewModel::default());
    mediator.register(&vm);

    assert!(mediator.unregister(&vm) > 0);
    assert!(!mediator.send(&save("silent.txt")));
    assert!(vm.take_log().is_empty());
}

#[test]
fn property_change_requeries_commands_over_the_bus() {
    init_tracing();
    let status_vm = StatusViewModel::new();
    let bus = Arc::new(RequeryBus::new());

    // Availability follows the view-model's status, held weakly so the
    // command cannot prolong the view-model's life.
    let vm_gate = Arc::downgrade(&status_vm);
    let submit = RelayCommand::new(|_: &()| {})
        .with_predicate(move |_| {
            vm_gate
                .upgrade()
                .is_some_and(|vm| !vm.status.lock().unwrap().is_empty())
        })
        .via_requery_bus(&bus);

    let probe = RequeryProbe::new();
    submit.subscribe_can_execute_changed(WeakCallback::bound(&probe, RequeryProbe::on_requery));

    // A status change triggers one bus-wide requery.
    let observer = PropertyObserver::new(&status_vm);
    let bus_in = Arc::clone(&bus);
    observer.observe("status", move |_: &StatusViewModel| bus_in.raise_requery());

    assert!(!submit.can_execute(&()));
    status_vm.set_status("ready");
    assert_eq!(probe.hits(), 1);
    assert!(submit.can_execute(&()));
}
