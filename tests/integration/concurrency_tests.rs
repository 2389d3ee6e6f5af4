//! Concurrent callers through the worker pool.

use std::sync::{Arc, Barrier};

use ihaproxy::app::events::AppletEvent;
use ihaproxy::app::ports::{Caller, HandlerRef};
use ihaproxy::error::Status;

use crate::harness::{APP, Stack};

const CALLERS: u32 = 8;

fn race<T: Send + 'static>(
    stack: &Stack,
    op: impl Fn(u32, &ihaproxy::rpc::client::IhaClient<ihaproxy::rpc::pool::PoolClient>) -> T
        + Send
        + Sync
        + 'static,
) -> Vec<T> {
    let pool = stack.pool(4);
    let op = Arc::new(op);
    let barrier = Arc::new(Barrier::new(CALLERS as usize));
    let threads: Vec<_> = (0..CALLERS)
        .map(|n| {
            let client = Stack::pooled_client(&pool, Caller::new(1000 + n, 0));
            let op = Arc::clone(&op);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                op(n, &client)
            })
        })
        .collect();
    let out = threads.into_iter().map(|t| t.join().unwrap()).collect();
    pool.shutdown();
    out
}

#[test]
fn concurrent_start_provisioning_has_one_winner() {
    let stack = Stack::new();
    stack.client().init().unwrap();

    let results = race(&stack, |_, client| client.start_provisioning(APP));
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(
        results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| *r == Err(Status::InvalidRequest))
    );
}

#[test]
fn concurrent_registration_has_one_winner() {
    let stack = Stack::new();
    stack.client().init().unwrap();

    let results = race(&stack, |_, client| {
        client.register_events(APP, HandlerRef::new(|_: &AppletEvent| Ok(())))
    });
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| **r == Err(Status::AlreadyRegistered))
            .count(),
        CALLERS as usize - 1
    );
}

#[test]
fn independent_apps_proceed_in_parallel() {
    let stack = Stack::new();
    stack.client().init().unwrap();
    for n in 0..CALLERS {
        stack.sim.install(format!("app-{n}"));
    }

    let results = race(&stack, |n, client| {
        let app = format!("app-{n}");
        let h = client.start_provisioning(&app)?;
        client.end_provisioning_negotiated(&app, h)
    });
    for token in results {
        assert_eq!(token.map(|t| t.len()), Ok(16));
    }
    assert_eq!(stack.engine.served(), 1 + 2 * u64::from(CALLERS));
}
