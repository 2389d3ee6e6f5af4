//! Port traits — the boundary between the session core and the outside world.
//!
//! ```text
//!   RpcEngine ──▶ IhaOperations ──▶ SessionService ──▶ Transport
//!                                         │
//!   AppletLink ──▶ EventSink ──▶ NotificationRelay ──▶ EventHandler
//! ```
//!
//! The dispatcher only knows [`IhaOperations`]; the relay only knows
//! [`EventHandler`] and [`CallerRuntime`]. Neither sees the wire format.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::Status;
use crate::rpc::negotiate::Negotiated;

use super::events::AppletEvent;

// ───────────────────────────────────────────────────────────────
// Caller identity
// ───────────────────────────────────────────────────────────────

/// Credentials of the process on the other side of the IPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Caller {
    pub pid: u32,
    pub uid: u32,
}

impl Caller {
    pub const fn new(pid: u32, uid: u32) -> Self {
        Self { pid, uid }
    }

    /// The daemon itself, for in-process calls.
    pub fn current() -> Self {
        // SAFETY: getuid never fails and touches no memory.
        #[cfg(unix)]
        let uid = unsafe { libc::getuid() };
        #[cfg(not(unix))]
        let uid = 0;
        Self {
            pid: std::process::id(),
            uid,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Event handler (registered callback object)
// ───────────────────────────────────────────────────────────────

/// Receiver of asynchronous notifications for one app identifier.
///
/// Called on the relay thread, never on the transport reader. Errors and
/// panics are caught and logged by the relay.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &AppletEvent) -> anyhow::Result<()>;
}

/// Strong, clonable reference to a registered [`EventHandler`].
///
/// Equality is object identity: two `HandlerRef`s are equal when they point
/// at the same handler allocation.
#[derive(Clone)]
pub struct HandlerRef(Arc<dyn EventHandler>);

impl HandlerRef {
    pub fn new(handler: impl EventHandler + 'static) -> Self {
        Self(Arc::new(handler))
    }

    pub fn from_arc(handler: Arc<dyn EventHandler>) -> Self {
        Self(handler)
    }

    pub fn handler(&self) -> &dyn EventHandler {
        self.0.as_ref()
    }

    pub fn same_as(&self, other: &Self) -> bool {
        Arc::as_ptr(&self.0).cast::<()>() == Arc::as_ptr(&other.0).cast::<()>()
    }

    /// Number of live strong references (registry bookkeeping checks).
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn downgrade(&self) -> WeakHandlerRef {
        WeakHandlerRef(Arc::downgrade(&self.0))
    }
}

/// Non-owning counterpart of [`HandlerRef`].
#[derive(Clone)]
pub struct WeakHandlerRef(Weak<dyn EventHandler>);

impl WeakHandlerRef {
    pub fn upgrade(&self) -> Option<HandlerRef> {
        self.0.upgrade().map(HandlerRef)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl PartialEq for HandlerRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for HandlerRef {}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandlerRef({:p})", Arc::as_ptr(&self.0).cast::<()>())
    }
}

impl<F> EventHandler for F
where
    F: Fn(&AppletEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &AppletEvent) -> anyhow::Result<()> {
        self(event)
    }
}

// ───────────────────────────────────────────────────────────────
// Caller runtime (attach / detach around each delivery)
// ───────────────────────────────────────────────────────────────

/// Execution context a handler must run inside, e.g. a managed runtime
/// the relay thread has to attach to before calling into it.
pub trait CallerRuntime: Send + Sync {
    fn attach(&self) -> anyhow::Result<()>;
    fn detach(&self);
}

/// Native handlers need no attachment.
pub struct NativeRuntime;

impl CallerRuntime for NativeRuntime {
    fn attach(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn detach(&self) {}
}

// ───────────────────────────────────────────────────────────────
// Event sink (driven adapter: co-processor → relay)
// ───────────────────────────────────────────────────────────────

/// Accepts events from the transport reader. Must never block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AppletEvent);
}

/// Sink that discards everything; used when events are disabled.
pub struct DiscardSink;

impl EventSink for DiscardSink {
    fn emit(&self, event: AppletEvent) {
        log::debug!("event for {} discarded ({} bytes)", event.app, event.data.len());
    }
}

// ───────────────────────────────────────────────────────────────
// Session operations (driving port: dispatcher → service)
// ───────────────────────────────────────────────────────────────

/// Arguments of a one-time-password request after validation.
///
/// Exactly one of `handle` / `token` identifies the provisioning context.
/// Empty vectors and zero capacities mean "absent".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OtpRequest {
    pub handle: Option<u32>,
    pub token: Vec<u8>,
    pub vendor_data: Vec<u8>,
    pub otp_capacity: u32,
    pub token_capacity: u32,
}

/// One OTP plus, when requested, the refreshed encrypted token.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OtpOutput {
    pub otp: Vec<u8>,
    pub token: Vec<u8>,
}

/// The logical operation set behind every protocol version.
///
/// Inputs have already passed wire validation; implementations still own
/// every session-state check.
pub trait IhaOperations: Send + Sync {
    fn init(&self) -> Result<(), Status>;
    fn deinit(&self) -> Result<(), Status>;
    fn version(&self) -> u32;

    fn start_provisioning(&self, app: &str) -> Result<u32, Status>;
    fn end_provisioning(
        &self,
        app: &str,
        handle: u32,
        capacity: u32,
    ) -> Result<Negotiated<Vec<u8>>, Status>;

    fn send_data(
        &self,
        app: &str,
        handle: Option<u32>,
        data_type: u32,
        data: &[u8],
    ) -> Result<(), Status>;
    fn receive_data(
        &self,
        app: &str,
        handle: Option<u32>,
        data_type: u32,
        capacity: u32,
    ) -> Result<Negotiated<Vec<u8>>, Status>;
    fn send_and_receive(
        &self,
        app: &str,
        handle: Option<u32>,
        data_type: u32,
        data: &[u8],
        capacity: u32,
    ) -> Result<Negotiated<Vec<u8>>, Status>;

    fn capabilities(
        &self,
        app: &str,
        cap_type: u32,
        capacity: u32,
    ) -> Result<Negotiated<Vec<u8>>, Status>;

    fn install(&self, app: &str, source: &str) -> Result<(), Status>;
    fn uninstall(&self, app: &str) -> Result<(), Status>;

    fn get_otp(&self, app: &str, request: &OtpRequest) -> Result<Negotiated<OtpOutput>, Status>;
    fn otps_status(&self, app: &str, handle: Option<u32>, status_type: u32)
    -> Result<u32, Status>;

    /// Instance token and sharing flags of the app's exclusive session.
    fn app_instance(&self, app: &str) -> Result<(u32, u32), Status>;

    fn register_events(&self, app: &str, handler: HandlerRef) -> Result<(), Status>;
    fn unregister_events(&self, app: &str) -> Result<(), Status>;

    fn start_instance(
        &self,
        caller: Caller,
        app: &str,
        handler: Option<HandlerRef>,
    ) -> Result<u32, Status>;
    fn stop_instance(&self, caller: Caller, instance: u32) -> Result<(), Status>;
}
