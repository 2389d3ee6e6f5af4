//! The Unix-socket endpoint, client and daemon in one process.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use ihaproxy::adapters::socket::{ServerHandle, SocketRemote, SocketServer};
use ihaproxy::app::events::AppletEvent;
use ihaproxy::app::ports::{Caller, HandlerRef};
use ihaproxy::app::service::SERVICE_VERSION;
use ihaproxy::config::INTERFACE_DESCRIPTOR;
use ihaproxy::error::Status;
use ihaproxy::rpc::client::IhaClient;
use ihaproxy::rpc::pool::{IpcError, Remote, ServerPool};
use ihaproxy::rpc::parcel::Parcel;

use crate::harness::{APP, OTHER_APP, Stack, next_event, recording_handler};

struct Endpoint {
    _dir: tempfile::TempDir,
    pool: Arc<ServerPool>,
    server: ServerHandle,
}

impl Endpoint {
    fn start(stack: &Stack) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = stack.pool(2);
        let server = SocketServer::bind(dir.path().join("iha.sock"), Arc::clone(&pool))
            .unwrap()
            .spawn()
            .unwrap();
        Self {
            _dir: dir,
            pool,
            server,
        }
    }

    fn client(&self) -> IhaClient<SocketRemote> {
        IhaClient::new(
            SocketRemote::connect(self.server.path()).unwrap(),
            INTERFACE_DESCRIPTOR,
            64,
        )
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.server.shutdown();
        self.pool.shutdown();
    }
}

#[test]
fn calls_round_trip_over_the_socket() {
    let stack = Stack::new();
    let endpoint = Endpoint::start(&stack);
    let client = endpoint.client();

    assert_eq!(client.version(), Ok(SERVICE_VERSION));
    client.init().unwrap();
    let h = client.start_provisioning(APP).unwrap();
    assert_eq!(client.end_provisioning_negotiated(APP, h).unwrap().len(), 16);
}

#[test]
fn events_come_back_over_the_connection() {
    let stack = Stack::new();
    let endpoint = Endpoint::start(&stack);
    let client = endpoint.client();
    client.init().unwrap();

    let (handler, rx) = recording_handler();
    client.register_events(APP, handler.clone()).unwrap();
    // Same local handler maps to the same server-side proxy.
    assert_eq!(client.register_events(APP, handler), Ok(()));
    assert_eq!(
        client.register_events(APP, HandlerRef::new(|_: &AppletEvent| Ok(()))),
        Err(Status::AlreadyRegistered)
    );

    stack.sim.inject_event(APP, b"ping".to_vec());
    stack.pump();
    let event = next_event(&rx).expect("event over socket");
    assert_eq!(event.app, APP);
    assert_eq!(event.data, b"ping".to_vec());
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[test]
fn caller_identity_comes_from_the_peer() {
    let stack = Stack::new();
    let endpoint = Endpoint::start(&stack);
    let remote_client = endpoint.client();
    remote_client.init().unwrap();

    let id = remote_client.start_instance(APP, None).unwrap();
    // Same process, so the in-process caller with our pid owns it too.
    let local = stack.client_as(Caller::new(std::process::id(), 0));
    assert_eq!(local.stop_instance(id), Ok(()));
}

#[test]
fn calls_after_server_shutdown_fail_with_disconnect() {
    let stack = Stack::new();
    let mut endpoint = Endpoint::start(&stack);
    let remote = SocketRemote::connect(endpoint.server.path()).unwrap();
    endpoint.server.shutdown();
    endpoint.pool.shutdown();

    // The connection thread notices the closed pool and hangs up.
    let first = remote.transact(11, Parcel::new());
    assert!(first.is_err());
    assert_eq!(
        remote.transact(11, Parcel::new()).err(),
        Some(IpcError::Disconnected)
    );
}

#[test]
fn handlers_may_call_back_over_the_same_connection() {
    let stack = Stack::new();
    let endpoint = Endpoint::start(&stack);
    let client = Arc::new(endpoint.client());
    client.init().unwrap();

    let (tx, rx) = mpsc::channel();
    let weak = Arc::downgrade(&client);
    let handler = HandlerRef::new(move |_: &AppletEvent| {
        let client = weak.upgrade().ok_or_else(|| anyhow::anyhow!("client gone"))?;
        tx.send(client.version())
            .map_err(|_| anyhow::anyhow!("receiver gone"))
    });
    client.register_events(APP, handler).unwrap();

    stack.sim.inject_event(APP, b"ping".to_vec());
    stack.pump();
    let answer = rx
        .recv_timeout(Duration::from_secs(2))
        .expect("handler's own call completed");
    assert_eq!(answer, Ok(SERVICE_VERSION));
}

#[test]
fn handlers_are_released_when_the_daemon_lets_go() {
    let stack = Stack::new();
    let endpoint = Endpoint::start(&stack);
    let client = endpoint.client();
    client.init().unwrap();
    let (handler, _rx) = recording_handler();

    client.register_events(APP, handler.clone()).unwrap();
    assert!(handler.strong_count() > 1);
    client.unregister_events(APP).unwrap();
    assert_eq!(handler.strong_count(), 1);

    client.register_events(APP, handler.clone()).unwrap();
    client.uninstall(APP).unwrap();
    assert_eq!(handler.strong_count(), 1);

    let id = client.start_instance(OTHER_APP, Some(handler.clone())).unwrap();
    assert!(handler.strong_count() > 1);
    client.stop_instance(id).unwrap();
    assert_eq!(handler.strong_count(), 1);
}

#[test]
fn refused_handlers_are_not_kept() {
    let stack = Stack::new();
    let endpoint = Endpoint::start(&stack);
    let client = endpoint.client();
    client.init().unwrap();

    let (bound, _rx) = recording_handler();
    client.register_events(APP, bound).unwrap();
    let refused = HandlerRef::new(|_: &AppletEvent| Ok(()));
    assert_eq!(
        client.register_events(APP, refused.clone()),
        Err(Status::AlreadyRegistered)
    );
    assert_eq!(refused.strong_count(), 1);
}
