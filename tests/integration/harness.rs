//! Shared wiring for the integration tests.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use ihaproxy::adapters::sim::{SimHandle, SimulatedCoprocessor};
use ihaproxy::app::events::AppletEvent;
use ihaproxy::app::ports::{Caller, HandlerRef, NativeRuntime};
use ihaproxy::app::registry::SessionRegistry;
use ihaproxy::app::service::{ServiceOptions, SessionService};
use ihaproxy::applet::AppletLink;
use ihaproxy::config::INTERFACE_DESCRIPTOR;
use ihaproxy::relay::NotificationRelay;
use ihaproxy::rpc::client::IhaClient;
use ihaproxy::rpc::engine::RpcEngine;
use ihaproxy::rpc::pool::{DirectRemote, PoolClient, ServerPool};
use uuid::Uuid;

pub const APP: &str = "otp-applet";
pub const OTHER_APP: &str = "pavp-applet";

pub type Service = SessionService<SimulatedCoprocessor>;
pub type Client = IhaClient<DirectRemote<Service>>;

/// Everything a test needs, torn down in order on drop.
pub struct Stack {
    pub sim: SimHandle,
    pub service: Arc<Service>,
    pub engine: Arc<RpcEngine<Service>>,
    pub relay: NotificationRelay,
}

impl Stack {
    pub fn new() -> Self {
        Self::with_options(ServiceOptions {
            install_enabled: true,
            events_enabled: true,
        })
    }

    pub fn with_options(options: ServiceOptions) -> Self {
        let (sim, handle) = SimulatedCoprocessor::with_apps([APP, OTHER_APP]);
        let registry = Arc::new(SessionRegistry::new());
        let relay = NotificationRelay::start(Arc::clone(&registry), Arc::new(NativeRuntime))
            .expect("relay thread");
        let link = AppletLink::new(sim, Uuid::from_u128(0x1a2b), relay.sink());
        let service = Arc::new(SessionService::new(registry, link, options));
        let engine = Arc::new(RpcEngine::new(Arc::clone(&service), INTERFACE_DESCRIPTOR));
        Self {
            sim: handle,
            service,
            engine,
            relay,
        }
    }

    /// Client stub calling the dispatcher on the test thread.
    pub fn client(&self) -> Client {
        self.client_as(Caller::new(std::process::id(), 0))
    }

    pub fn client_as(&self, caller: Caller) -> Client {
        IhaClient::new(
            DirectRemote::new(Arc::clone(&self.engine), caller),
            INTERFACE_DESCRIPTOR,
            64,
        )
    }

    /// Worker pool over the same dispatcher.
    pub fn pool(&self, threads: usize) -> Arc<ServerPool> {
        ServerPool::start(Arc::clone(&self.engine), threads).expect("worker threads")
    }

    pub fn pooled_client(pool: &Arc<ServerPool>, caller: Caller) -> IhaClient<PoolClient> {
        IhaClient::new(pool.client(caller), INTERFACE_DESCRIPTOR, 64)
    }

    /// Pull injected events off the link into the relay.
    pub fn pump(&self) -> usize {
        self.service.poll_events().expect("poll")
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.relay.shutdown();
    }
}

/// A handler that forwards every event into a channel.
pub fn recording_handler() -> (HandlerRef, Receiver<AppletEvent>) {
    let (tx, rx) = mpsc::channel();
    let handler = HandlerRef::new(move |event: &AppletEvent| {
        tx.send(event.clone())
            .map_err(|_| anyhow::anyhow!("receiver gone"))
    });
    (handler, rx)
}

pub fn next_event(rx: &Receiver<AppletEvent>) -> Option<AppletEvent> {
    rx.recv_timeout(Duration::from_secs(2)).ok()
}
