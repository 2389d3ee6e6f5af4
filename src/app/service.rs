//! Session service — the hexagonal core.
//!
//! [`SessionService`] implements [`IhaOperations`] on top of the
//! [`SessionRegistry`] and the [`AppletLink`]. It is the only place that
//! knows the per-app state machine:
//!
//! ```text
//!  UNINITIALIZED ──load──▶ LOADED ──start──▶ PROVISIONING_ACTIVE
//!                            ▲                     │
//!                            └──────── end ────────┘
//!                            │
//!                        uninstall ──▶ UNLOADED (row removed)
//! ```
//!
//! Every mutating operation runs inside [`SessionRegistry::with_entry`], so
//! the check, the co-processor round trip and the registry update happen
//! under one row lock. Lock order is row → link; the link never calls back
//! into the registry.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::applet::protocol::{AppletReply, AppletRequest, NO_HANDLE};
use crate::applet::{AppletLink, LinkError};
use crate::config::ServiceConfig;
use crate::error::{ErrorClass, Status};
use crate::rpc::negotiate::Negotiated;
use crate::rpc::transport::Transport;

use super::ports::{Caller, HandlerRef, IhaOperations, OtpOutput, OtpRequest};
use super::registry::{NON_SHARED, SessionEntry, SessionRegistry};

/// Protocol version reported by `GetVersion` (major.minor in the high and
/// low half-words).
pub const SERVICE_VERSION: u32 = 0x0003_0000;

/// Data type the v1 SVP calls map onto.
pub const DATA_TYPE_PROVISIONING: u32 = 600;

/// Feature switches taken from the service configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceOptions {
    pub install_enabled: bool,
    pub events_enabled: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            install_enabled: true,
            events_enabled: cfg!(feature = "events"),
        }
    }
}

impl From<&ServiceConfig> for ServiceOptions {
    fn from(cfg: &ServiceConfig) -> Self {
        Self {
            install_enabled: cfg.install_enabled,
            events_enabled: cfg!(feature = "events") && cfg.events_enabled,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// SessionService
// ───────────────────────────────────────────────────────────────

pub struct SessionService<T: Transport> {
    registry: Arc<SessionRegistry>,
    link: AppletLink<T>,
    options: ServiceOptions,
}

impl<T: Transport> SessionService<T> {
    pub fn new(registry: Arc<SessionRegistry>, link: AppletLink<T>, options: ServiceOptions) -> Self {
        Self {
            registry,
            link,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn is_initialized(&self) -> bool {
        self.link.is_connected()
    }

    /// Forward pending co-processor events to the relay. Called by the
    /// event pump between requests.
    pub fn poll_events(&self) -> Result<usize, Status> {
        self.link.poll_events().map_err(Status::from)
    }

    // ── Helpers ───────────────────────────────────────────────

    fn require_init(&self) -> Result<(), Status> {
        if self.link.is_connected() {
            Ok(())
        } else {
            Err(Status::LibraryNotInitialized)
        }
    }

    fn call(&self, request: &AppletRequest) -> Result<AppletReply, Status> {
        self.link.exchange(request).map_err(|e: LinkError| {
            warn!("IHA: {} failed: {}", request.kind(), e);
            Status::from(e)
        })
    }

    /// Open a session with the app unless one is already open on the
    /// current connection. A session left over from a connection the link
    /// has since reset is reopened, and resubscribed if a callback is bound.
    fn ensure_loaded(&self, entry: &mut SessionEntry) -> Result<(), Status> {
        let epoch = self.link.epoch();
        if entry.loaded && entry.opened_on != epoch {
            warn!("IHA: {} session lost with the channel, reopening", entry.app());
            entry.loaded = false;
            entry.end_provisioning();
        }
        if entry.loaded {
            return Ok(());
        }
        self.call(&AppletRequest::Open {
            app: entry.app().to_owned(),
            shared: entry.shared,
        })?
        .into_done()?;
        entry.loaded = true;
        entry.opened_on = epoch;
        debug!(
            "IHA: {} loaded ({})",
            entry.app(),
            if entry.shared { "shared" } else { "exclusive" }
        );
        if entry.callback().is_some() {
            self.call(&AppletRequest::Subscribe {
                app: entry.app().to_owned(),
            })?
            .into_done()?;
        }
        Ok(())
    }

    /// Best-effort close; failures are logged, never returned.
    fn close_quietly(&self, entry: &mut SessionEntry) {
        if !entry.loaded {
            return;
        }
        let req = AppletRequest::Close {
            app: entry.app().to_owned(),
        };
        if let Err(e) = self.call(&req).and_then(|r| r.into_done()) {
            warn!("IHA: close of {} failed: {}", entry.app(), e);
        }
        entry.loaded = false;
    }

    fn unsubscribe_quietly(&self, app: &str) {
        let req = AppletRequest::Unsubscribe { app: app.to_owned() };
        if let Err(e) = self.call(&req).and_then(|r| r.into_done()) {
            warn!("IHA: unsubscribe of {} failed: {}", app, e);
        }
    }

    /// A handle supplied by the caller must name the active provisioning
    /// session; an absent handle is sent as [`NO_HANDLE`].
    fn session_handle(entry: &SessionEntry, handle: Option<u32>) -> Result<u32, Status> {
        match handle {
            Some(h) => entry.expect_provisioning(h).map(|()| h),
            None => Ok(NO_HANDLE),
        }
    }

    fn events_gate(&self) -> Result<(), Status> {
        if self.options.events_enabled {
            Ok(())
        } else {
            Err(Status::NotImplemented)
        }
    }

    fn install_gate(&self) -> Result<(), Status> {
        if self.options.install_enabled {
            Ok(())
        } else {
            Err(Status::NotImplemented)
        }
    }

    /// Run a negotiated data call against a loaded session.
    fn data_call(
        &self,
        app: &str,
        handle: Option<u32>,
        capacity: u32,
        build: impl FnOnce(u32) -> AppletRequest,
    ) -> Result<Negotiated<Vec<u8>>, Status> {
        self.require_init()?;
        self.registry.with_entry(app, |e| {
            let handle = Self::session_handle(e, handle)?;
            self.ensure_loaded(e)?;
            self.call(&build(handle))?.into_data(capacity)
        })
    }
}

impl<T: Transport> IhaOperations for SessionService<T> {
    fn init(&self) -> Result<(), Status> {
        self.link.connect().map_err(Status::from)?;
        info!("IHA: initialized (version {:#010x})", SERVICE_VERSION);
        Ok(())
    }

    fn deinit(&self) -> Result<(), Status> {
        if !self.link.is_connected() {
            debug!("IHA: deinit while not initialized");
            return Ok(());
        }
        for snap in self.registry.drain() {
            if snap.has_callback {
                self.unsubscribe_quietly(&snap.app);
            }
            if snap.loaded {
                let req = AppletRequest::Close { app: snap.app.clone() };
                if let Err(e) = self.call(&req).and_then(|r| r.into_done()) {
                    warn!("IHA: close of {} during deinit failed: {}", snap.app, e);
                }
            }
        }
        self.link.disconnect();
        info!("IHA: deinitialized");
        Ok(())
    }

    fn version(&self) -> u32 {
        SERVICE_VERSION
    }

    fn start_provisioning(&self, app: &str) -> Result<u32, Status> {
        self.require_init()?;
        self.registry.with_entry(app, |e| {
            if e.provisioning.is_some() {
                return Err(Status::InvalidRequest);
            }
            self.ensure_loaded(e)?;
            let handle = self
                .call(&AppletRequest::StartProvisioning { app: app.to_owned() })?
                .into_handle()?;
            e.begin_provisioning(handle)?;
            info!("IHA: {} provisioning started (handle {:#x})", app, handle);
            Ok(handle)
        })
    }

    fn end_provisioning(
        &self,
        app: &str,
        handle: u32,
        capacity: u32,
    ) -> Result<Negotiated<Vec<u8>>, Status> {
        self.require_init()?;
        self.registry
            .with_existing(app, |e| {
                e.expect_provisioning(handle)?;
                let reply = self.call(&AppletRequest::EndProvisioning {
                    app: app.to_owned(),
                    handle,
                    capacity,
                })?;
                match reply.into_data(capacity) {
                    Ok(Negotiated::Complete(token)) => {
                        e.end_provisioning();
                        info!("IHA: {} provisioning ended ({} B token)", app, token.len());
                        Ok(Negotiated::Complete(token))
                    }
                    // Handle stays active so the caller can retry.
                    Ok(too_small) => Ok(too_small),
                    Err(status) => {
                        if status.class() == ErrorClass::Applet {
                            e.end_provisioning();
                        }
                        Err(status)
                    }
                }
            })
            .unwrap_or(Err(Status::InvalidRequest))
    }

    fn send_data(
        &self,
        app: &str,
        handle: Option<u32>,
        data_type: u32,
        data: &[u8],
    ) -> Result<(), Status> {
        self.require_init()?;
        if data.is_empty() {
            return Err(Status::InvalidInput);
        }
        self.registry.with_entry(app, |e| {
            let handle = Self::session_handle(e, handle)?;
            self.ensure_loaded(e)?;
            self.call(&AppletRequest::SendData {
                app: app.to_owned(),
                handle,
                data_type,
                data: data.to_vec(),
            })?
            .into_done()
        })
    }

    fn receive_data(
        &self,
        app: &str,
        handle: Option<u32>,
        data_type: u32,
        capacity: u32,
    ) -> Result<Negotiated<Vec<u8>>, Status> {
        if capacity == 0 {
            return Err(Status::InvalidInput);
        }
        self.data_call(app, handle, capacity, |handle| AppletRequest::ReceiveData {
            app: app.to_owned(),
            handle,
            data_type,
            capacity,
        })
    }

    fn send_and_receive(
        &self,
        app: &str,
        handle: Option<u32>,
        data_type: u32,
        data: &[u8],
        capacity: u32,
    ) -> Result<Negotiated<Vec<u8>>, Status> {
        if data.is_empty() || capacity == 0 {
            return Err(Status::InvalidInput);
        }
        self.data_call(app, handle, capacity, |handle| AppletRequest::SendAndReceive {
            app: app.to_owned(),
            handle,
            data_type,
            data: data.to_vec(),
            capacity,
        })
    }

    fn capabilities(
        &self,
        app: &str,
        cap_type: u32,
        capacity: u32,
    ) -> Result<Negotiated<Vec<u8>>, Status> {
        if capacity == 0 {
            return Err(Status::InvalidInput);
        }
        self.data_call(app, None, capacity, |_| AppletRequest::Capabilities {
            app: app.to_owned(),
            cap_type,
            capacity,
        })
    }

    fn install(&self, app: &str, source: &str) -> Result<(), Status> {
        self.install_gate()?;
        self.require_init()?;
        self.registry.with_entry(app, |e| {
            self.call(&AppletRequest::Install {
                app: app.to_owned(),
                source: source.to_owned(),
            })?
            .into_done()?;
            info!("IHA: {} installed from {}", app, source);
            self.ensure_loaded(e)
        })
    }

    fn uninstall(&self, app: &str) -> Result<(), Status> {
        self.install_gate()?;
        self.require_init()?;
        self.registry.with_entry(app, |e| {
            if e.callback().is_some() {
                self.unsubscribe_quietly(app);
            }
            self.close_quietly(e);
            self.call(&AppletRequest::Uninstall { app: app.to_owned() })?
                .into_done()?;
            e.retire();
            info!("IHA: {} uninstalled", app);
            Ok(())
        })
    }

    fn get_otp(&self, app: &str, request: &OtpRequest) -> Result<Negotiated<OtpOutput>, Status> {
        if request.otp_capacity == 0 {
            return Err(Status::InvalidInput);
        }
        if request.handle.is_none() && request.token.is_empty() {
            return Err(Status::InvalidInput);
        }
        self.require_init()?;
        self.registry.with_entry(app, |e| {
            let handle = Self::session_handle(e, request.handle)?;
            self.ensure_loaded(e)?;
            let out = self
                .call(&AppletRequest::GetOtp {
                    app: app.to_owned(),
                    handle,
                    token: request.token.clone(),
                    vendor_data: request.vendor_data.clone(),
                    otp_capacity: request.otp_capacity,
                    token_capacity: request.token_capacity,
                })?
                .into_otp(request.otp_capacity, request.token_capacity)?;
            Ok(out.map(|(otp, token)| OtpOutput { otp, token }))
        })
    }

    fn otps_status(
        &self,
        app: &str,
        handle: Option<u32>,
        status_type: u32,
    ) -> Result<u32, Status> {
        self.require_init()?;
        self.registry.with_entry(app, |e| {
            let handle = Self::session_handle(e, handle)?;
            self.ensure_loaded(e)?;
            self.call(&AppletRequest::OtpsStatus {
                app: app.to_owned(),
                handle,
                status_type,
            })?
            .into_value()
        })
    }

    fn app_instance(&self, app: &str) -> Result<(u32, u32), Status> {
        self.require_init()?;
        self.registry
            .with_existing(app, |e| {
                if !e.loaded || e.shared {
                    return Err(Status::AppletSessionUnavailable);
                }
                let owner = e.owner_pid.unwrap_or_else(|| Caller::current().pid);
                Ok((self.registry.issue_instance(e, owner), NON_SHARED))
            })
            .unwrap_or(Err(Status::AppletSessionUnavailable))
    }

    fn register_events(&self, app: &str, handler: HandlerRef) -> Result<(), Status> {
        self.events_gate()?;
        self.require_init()?;
        self.registry.with_entry(app, |e| {
            if e.check_bind(&handler)? {
                return Ok(());
            }
            // An exclusive session is required for notifications; reopen
            // a shared one.
            if e.loaded && e.shared {
                self.close_quietly(e);
            }
            e.shared = false;
            self.ensure_loaded(e)?;
            self.call(&AppletRequest::Subscribe { app: app.to_owned() })?
                .into_done()?;
            e.bind_callback(handler)?;
            info!("IHA: {} registered for events", app);
            Ok(())
        })
    }

    fn unregister_events(&self, app: &str) -> Result<(), Status> {
        self.require_init()?;
        self.registry
            .with_existing(app, |e| {
                if e.callback().is_none() {
                    return;
                }
                self.unsubscribe_quietly(app);
                drop(e.unbind_callback());
                info!("IHA: {} unregistered from events", app);
            })
            .unwrap_or_default();
        Ok(())
    }

    fn start_instance(
        &self,
        caller: Caller,
        app: &str,
        handler: Option<HandlerRef>,
    ) -> Result<u32, Status> {
        if handler.is_some() {
            self.events_gate()?;
        }
        self.require_init()?;
        self.registry.with_entry(app, |e| {
            if e.instance.is_some() {
                return Err(Status::InstanceAlreadyAvailable);
            }
            if let Some(h) = &handler {
                e.check_bind(h)?;
                if e.loaded && e.shared {
                    self.close_quietly(e);
                }
                e.shared = false;
            }
            self.ensure_loaded(e)?;
            if let Some(h) = handler {
                self.call(&AppletRequest::Subscribe { app: app.to_owned() })?
                    .into_done()?;
                e.bind_callback(h)?;
            }
            let id = self.registry.issue_instance(e, caller.pid);
            info!("IHA: instance {} of {} started by pid {}", id, app, caller.pid);
            Ok(id)
        })
    }

    fn stop_instance(&self, caller: Caller, instance: u32) -> Result<(), Status> {
        self.require_init()?;
        let record = self
            .registry
            .resolve_instance(instance)
            .ok_or(Status::InvalidInstanceId)?;
        if record.owner_pid != caller.pid {
            warn!(
                "IHA: pid {} tried to stop instance {} owned by pid {}",
                caller.pid, instance, record.owner_pid
            );
            return Err(Status::InvalidProcess);
        }
        self.registry
            .with_existing(&record.app, |e| {
                if e.instance != Some(instance) {
                    return Err(Status::InvalidInstanceId);
                }
                if e.callback().is_some() {
                    self.unsubscribe_quietly(&record.app);
                }
                self.close_quietly(e);
                e.retire();
                info!("IHA: instance {} of {} stopped", instance, record.app);
                Ok(())
            })
            .unwrap_or(Err(Status::InvalidInstanceId))
    }
}
