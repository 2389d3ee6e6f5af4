//! Event registration and relay delivery.

use std::time::{Duration, Instant};

use ihaproxy::app::events::{AppletEvent, EventSource};
use ihaproxy::app::ports::HandlerRef;
use ihaproxy::app::service::ServiceOptions;
use ihaproxy::error::Status;
use ihaproxy::relay::RelayCounters;

use crate::harness::{APP, OTHER_APP, Stack, next_event, recording_handler};

fn quiet_handler() -> HandlerRef {
    HandlerRef::new(|_: &AppletEvent| Ok(()))
}

/// Wait for the relay thread to reach `pred`.
fn wait_for(stack: &Stack, pred: impl Fn(&RelayCounters) -> bool) -> RelayCounters {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let c = stack.relay.counters();
        if pred(&c) || Instant::now() > deadline {
            return c;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn one_handler_per_app() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    let cb1 = quiet_handler();
    let cb2 = quiet_handler();

    client.register_events(APP, cb1.clone()).unwrap();
    assert!(stack.sim.is_subscribed(APP));
    assert_eq!(
        client.register_events(APP, cb2.clone()),
        Err(Status::AlreadyRegistered)
    );
    // The same handler again is not a conflict.
    assert_eq!(client.register_events(APP, cb1.clone()), Ok(()));

    client.unregister_events(APP).unwrap();
    assert!(!stack.sim.is_subscribed(APP));
    assert_eq!(client.register_events(APP, cb2), Ok(()));
}

#[test]
fn unregister_without_registration_is_harmless() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();
    assert_eq!(client.unregister_events(OTHER_APP), Ok(()));
    assert_eq!(client.unregister_events(OTHER_APP), Ok(()));
}

#[test]
fn events_reach_the_registered_handler() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    let (handler, rx) = recording_handler();
    client.register_events(APP, handler).unwrap();

    stack.sim.inject_event(APP, vec![1, 2, 3]);
    assert_eq!(stack.pump(), 1);

    let event = next_event(&rx).expect("event delivered");
    assert_eq!(event.app, APP);
    assert_eq!(event.data, vec![1, 2, 3]);
    assert_eq!(event.source, EventSource::Applet);
    assert_eq!(wait_for(&stack, |c| c.delivered == 1).delivered, 1);
}

#[test]
fn events_interleaved_with_a_reply_are_not_lost() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    let (handler, rx) = recording_handler();
    client.register_events(APP, handler).unwrap();

    // Goes out ahead of the reply to the next request.
    stack.sim.inject_event(APP, b"early".to_vec());
    client.send_data(APP, 0, 1, b"x").unwrap();

    assert_eq!(next_event(&rx).map(|e| e.data), Some(b"early".to_vec()));
}

#[test]
fn events_without_a_handler_are_counted_and_dropped() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    stack.sim.inject_event(OTHER_APP, vec![9]);
    stack.pump();
    let c = wait_for(&stack, |c| c.unbound == 1);
    assert_eq!(c.unbound, 1);
    assert_eq!(c.delivered, 0);
}

#[test]
fn failing_handler_does_not_stop_the_relay() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    let failing = HandlerRef::new(|_: &AppletEvent| Err(anyhow::anyhow!("client gone")));
    client.register_events(OTHER_APP, failing).unwrap();
    let (handler, rx) = recording_handler();
    client.register_events(APP, handler).unwrap();

    stack.sim.inject_event(OTHER_APP, vec![0]);
    stack.sim.inject_event(APP, vec![1]);
    stack.pump();

    assert_eq!(next_event(&rx).map(|e| e.data), Some(vec![1]));
    assert_eq!(wait_for(&stack, |c| c.failed == 1).failed, 1);
}

#[test]
fn instance_handler_receives_events() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    let (handler, rx) = recording_handler();
    let id = client.start_instance(APP, Some(handler)).unwrap();
    assert_ne!(id, 0);
    assert!(stack.sim.is_subscribed(APP));

    stack.sim.inject_event(APP, vec![7]);
    stack.pump();
    assert_eq!(next_event(&rx).map(|e| e.data), Some(vec![7]));

    client.stop_instance(id).unwrap();
    assert!(!stack.sim.is_subscribed(APP));
}

#[test]
fn registration_is_refused_when_events_are_disabled() {
    let stack = Stack::with_options(ServiceOptions {
        install_enabled: true,
        events_enabled: false,
    });
    let client = stack.client();
    client.init().unwrap();
    assert_eq!(
        client.register_events(APP, quiet_handler()),
        Err(Status::NotImplemented)
    );
    assert_eq!(
        client.start_instance(APP, Some(quiet_handler())),
        Err(Status::NotImplemented)
    );
    // Instances without a handler are unaffected.
    assert!(client.start_instance(APP, None).is_ok());
}

#[test]
fn registration_survives_a_channel_reset() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    let (handler, rx) = recording_handler();
    client.register_events(APP, handler).unwrap();
    assert!(stack.sim.is_subscribed(APP));

    stack.sim.garble_next();
    assert_eq!(client.send_data(APP, 0, 1, b"x"), Err(Status::InternalError));
    assert!(!stack.sim.is_subscribed(APP));

    // The next call on the app reopens the session and subscribes again.
    client.send_data(APP, 0, 1, b"y").unwrap();
    assert!(stack.sim.is_subscribed(APP));
    stack.sim.inject_event(APP, b"after".to_vec());
    stack.pump();
    assert_eq!(next_event(&rx).map(|e| e.data), Some(b"after".to_vec()));
}
