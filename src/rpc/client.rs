//! Client stub — the mirror image of the engine.
//!
//! [`IhaClient`] encodes a typed call, sends it through any [`Remote`],
//! and decodes the reply. IPC failures become [`Status::CommsError`];
//! replies that do not decode become [`Status::InternalError`].
//!
//! Variable-length outputs come in two flavours:
//!
//! - the plain call returns [`Negotiated`], leaving the retry to the caller;
//! - the `*_negotiated` call performs the one transparent retry with the
//!   corrected length and only surfaces "too small" if the retry is short
//!   as well.
//!
//! The client also remembers which handler the daemon holds for each app,
//! so the [`Remote`] can drop its own reference once the daemon has let go
//! (unregister, uninstall, instance stop, deinit, or a refused bind).

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::app::ports::{HandlerRef, OtpOutput, OtpRequest};
use crate::error::Status;

use super::messages::{Reply, ReplyBody, Request};
use super::negotiate::{self, Negotiated, retry_once};
use super::pool::Remote;

/// Handlers the daemon holds on this client's behalf.
#[derive(Default)]
struct Bindings {
    by_app: HashMap<String, HandlerRef>,
    /// Instance id → app it was started for.
    instances: HashMap<u32, String>,
}

impl Bindings {
    fn holds(&self, handler: &HandlerRef) -> bool {
        self.by_app.values().any(|h| h.same_as(handler))
    }
}

pub struct IhaClient<R: Remote> {
    remote: R,
    descriptor: String,
    /// Capacity used for the first attempt of a negotiated call.
    initial_len: u32,
    bindings: Mutex<Bindings>,
}

impl<R: Remote> IhaClient<R> {
    pub fn new(remote: R, descriptor: impl Into<String>, initial_len: u32) -> Self {
        Self {
            remote,
            descriptor: descriptor.into(),
            initial_len: initial_len.clamp(1, negotiate::MAX_BUFFER_LEN),
            bindings: Mutex::new(Bindings::default()),
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    // ── Handler bookkeeping ───────────────────────────────────

    fn bindings(&self) -> MutexGuard<'_, Bindings> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bind(&self, app: &str, handler: &HandlerRef) {
        self.bindings().by_app.insert(app.to_owned(), handler.clone());
    }

    /// Release `handler` unless another app still has it bound.
    fn release_unless_bound(&self, handler: &HandlerRef) {
        if !self.bindings().holds(handler) {
            self.remote.release(handler);
        }
    }

    /// The daemon dropped whatever `app` had bound.
    fn unbind(&self, app: &str) {
        let released = {
            let mut b = self.bindings();
            b.instances.retain(|_, owner| owner != app);
            b.by_app.remove(app)
        };
        if let Some(handler) = released {
            self.release_unless_bound(&handler);
        }
    }

    fn unbind_all(&self) {
        let released: Vec<_> = {
            let mut b = self.bindings();
            b.instances.clear();
            b.by_app.drain().map(|(_, h)| h).collect()
        };
        for handler in &released {
            self.remote.release(handler);
        }
    }

    // ── Plumbing ──────────────────────────────────────────────

    fn call(&self, request: &Request) -> Result<Reply, Status> {
        let op = request.opcode();
        let out = self
            .remote
            .transact(op.code(), request.encode(&self.descriptor))
            .map_err(|e| {
                debug!("RPC: {} transport failure: {}", op, e);
                Status::from(e)
            })?;
        Reply::decode(op, &out).map_err(|e| {
            debug!("RPC: {} reply undecodable: {}", op, e);
            Status::InternalError
        })
    }

    /// Call an operation without negotiated outputs.
    fn call_body(&self, request: &Request) -> Result<ReplyBody, Status> {
        match self.call(request)? {
            Reply::Ok(body) => Ok(body),
            Reply::TooSmall(_) => Err(Status::InsufficientBuffer),
            Reply::Failed(status) => Err(status),
        }
    }

    fn call_unit(&self, request: &Request) -> Result<(), Status> {
        self.call_body(request).map(|_| ())
    }

    fn call_value(&self, request: &Request) -> Result<u32, Status> {
        match self.call_body(request)? {
            ReplyBody::Value(v) | ReplyBody::Handle(v) => Ok(v),
            _ => Err(Status::InternalError),
        }
    }

    fn call_data(&self, request: &Request) -> Result<Negotiated<Vec<u8>>, Status> {
        match self.call(request)? {
            Reply::Ok(ReplyBody::Data(data)) => Ok(Negotiated::Complete(data)),
            Reply::Ok(_) => Err(Status::InternalError),
            Reply::TooSmall(lengths) => Ok(Negotiated::TooSmall(lengths)),
            Reply::Failed(status) => Err(status),
        }
    }

    /// One call plus at most one retry with the corrected capacity.
    fn negotiate_data(
        &self,
        build: impl Fn(u32) -> Request,
    ) -> Result<Vec<u8>, Status> {
        let initial = negotiate::lengths(&[self.initial_len]);
        let out = retry_once(initial, |caps| {
            self.call_data(&build(caps.first().copied().unwrap_or(self.initial_len)))
        })?;
        out.complete().ok_or(Status::InsufficientBuffer)
    }

    // ── Library lifecycle ─────────────────────────────────────

    pub fn init(&self) -> Result<(), Status> {
        self.call_unit(&Request::Init)
    }

    pub fn deinit(&self) -> Result<(), Status> {
        self.call_unit(&Request::DeInit)?;
        self.unbind_all();
        Ok(())
    }

    pub fn version(&self) -> Result<u32, Status> {
        self.call_value(&Request::GetVersion)
    }

    pub fn do_fw_update(&self) -> Result<(), Status> {
        self.call_unit(&Request::DoFwUpdate)
    }

    // ── Provisioning ──────────────────────────────────────────

    pub fn start_provisioning(&self, app: &str) -> Result<u32, Status> {
        self.call_value(&Request::StartProvisioning {
            app: Some(app.into()),
        })
    }

    pub fn end_provisioning(
        &self,
        app: &str,
        handle: u32,
        capacity: u32,
    ) -> Result<Negotiated<Vec<u8>>, Status> {
        self.call_data(&Request::EndProvisioning {
            app: Some(app.into()),
            handle,
            capacity,
        })
    }

    pub fn end_provisioning_negotiated(&self, app: &str, handle: u32) -> Result<Vec<u8>, Status> {
        self.negotiate_data(|capacity| Request::EndProvisioning {
            app: Some(app.into()),
            handle,
            capacity,
        })
    }

    // ── Data exchange ─────────────────────────────────────────

    pub fn send_data(&self, app: &str, handle: u32, data_type: u32, data: &[u8]) -> Result<(), Status> {
        self.call_unit(&Request::SendData {
            app: Some(app.into()),
            handle,
            data_type,
            data: data.to_vec(),
        })
    }

    pub fn receive_data(
        &self,
        app: &str,
        handle: u32,
        data_type: u32,
        capacity: u32,
    ) -> Result<Negotiated<Vec<u8>>, Status> {
        self.call_data(&Request::ReceiveData {
            app: Some(app.into()),
            handle,
            data_type,
            capacity,
        })
    }

    pub fn receive_data_negotiated(
        &self,
        app: &str,
        handle: u32,
        data_type: u32,
    ) -> Result<Vec<u8>, Status> {
        self.negotiate_data(|capacity| Request::ReceiveData {
            app: Some(app.into()),
            handle,
            data_type,
            capacity,
        })
    }

    pub fn send_and_receive(
        &self,
        app: &str,
        handle: u32,
        data_type: u32,
        data: &[u8],
        capacity: u32,
    ) -> Result<Negotiated<Vec<u8>>, Status> {
        self.call_data(&Request::SendAndReceiveData {
            app: Some(app.into()),
            handle,
            data_type,
            data: data.to_vec(),
            capacity,
        })
    }

    pub fn send_and_receive_negotiated(
        &self,
        app: &str,
        handle: u32,
        data_type: u32,
        data: &[u8],
    ) -> Result<Vec<u8>, Status> {
        self.negotiate_data(|capacity| Request::SendAndReceiveData {
            app: Some(app.into()),
            handle,
            data_type,
            data: data.to_vec(),
            capacity,
        })
    }

    pub fn process_svp_message(&self, app: &str, handle: u32, data: &[u8]) -> Result<(), Status> {
        self.call_unit(&Request::ProcessSvpMessage {
            app: Some(app.into()),
            handle,
            data: data.to_vec(),
        })
    }

    pub fn get_svp_message(&self, app: &str, handle: u32) -> Result<Vec<u8>, Status> {
        self.negotiate_data(|capacity| Request::GetSvpMessage {
            app: Some(app.into()),
            handle,
            capacity,
        })
    }

    // ── Capabilities ──────────────────────────────────────────

    pub fn capabilities(
        &self,
        app: &str,
        cap_type: u32,
        capacity: u32,
    ) -> Result<Negotiated<Vec<u8>>, Status> {
        self.call_data(&Request::GetCapabilities {
            app: Some(app.into()),
            cap_type,
            capacity,
        })
    }

    pub fn capabilities_negotiated(&self, app: &str, cap_type: u32) -> Result<Vec<u8>, Status> {
        self.negotiate_data(|capacity| Request::GetCapabilities {
            app: Some(app.into()),
            cap_type,
            capacity,
        })
    }

    pub fn otp_capabilities(&self, app: &str, cap_type: u32) -> Result<Vec<u8>, Status> {
        self.negotiate_data(|capacity| Request::GetOtpCapabilities {
            app: Some(app.into()),
            cap_type,
            capacity,
        })
    }

    // ── Install ───────────────────────────────────────────────

    pub fn install(&self, app: &str, source: &str) -> Result<(), Status> {
        self.call_unit(&Request::Install {
            app: Some(app.into()),
            source: Some(source.into()),
        })
    }

    pub fn uninstall(&self, app: &str) -> Result<(), Status> {
        self.call_unit(&Request::Uninstall {
            app: Some(app.into()),
        })?;
        self.unbind(app);
        Ok(())
    }

    pub fn install_otps(&self, app: &str, source: &str) -> Result<(), Status> {
        self.call_unit(&Request::InstallOtps {
            app: Some(app.into()),
            source: Some(source.into()),
        })
    }

    pub fn uninstall_otps(&self, app: &str) -> Result<(), Status> {
        self.call_unit(&Request::UninstallOtps {
            app: Some(app.into()),
        })?;
        self.unbind(app);
        Ok(())
    }

    // ── OTP ───────────────────────────────────────────────────

    pub fn get_otp(&self, app: &str, request: &OtpRequest) -> Result<Negotiated<OtpOutput>, Status> {
        let reply = self.call(&Request::GetOtp {
            app: Some(app.into()),
            handle: request.handle.unwrap_or(0),
            token: request.token.clone(),
            vendor_data: request.vendor_data.clone(),
            otp_capacity: request.otp_capacity,
            token_capacity: request.token_capacity,
        })?;
        match reply {
            Reply::Ok(ReplyBody::Otp { otp, token }) => {
                Ok(Negotiated::Complete(OtpOutput { otp, token }))
            }
            Reply::Ok(_) => Err(Status::InternalError),
            Reply::TooSmall(lengths) => Ok(Negotiated::TooSmall(lengths)),
            Reply::Failed(status) => Err(status),
        }
    }

    /// `GetOTP` with the retry. A zero OTP capacity in `request` starts
    /// from the client default; the out-token capacity is kept as given
    /// (zero = not wanted).
    pub fn get_otp_negotiated(&self, app: &str, request: &OtpRequest) -> Result<OtpOutput, Status> {
        let otp_cap = if request.otp_capacity == 0 {
            self.initial_len
        } else {
            request.otp_capacity
        };
        let initial = negotiate::lengths(&[otp_cap, request.token_capacity]);
        let out = retry_once(initial, |caps| {
            let attempt = OtpRequest {
                otp_capacity: caps.first().copied().unwrap_or(otp_cap),
                token_capacity: caps.get(1).copied().unwrap_or(0),
                ..request.clone()
            };
            self.get_otp(app, &attempt)
        })?;
        out.complete().ok_or(Status::InsufficientBuffer)
    }

    pub fn otps_status(&self, app: &str, handle: u32, status_type: u32) -> Result<u32, Status> {
        self.call_value(&Request::GetOtpsStatus {
            app: Some(app.into()),
            handle,
            status_type,
        })
    }

    // ── Sessions, events and instances ────────────────────────

    pub fn app_instance(&self, app: &str) -> Result<(u32, u32), Status> {
        match self.call_body(&Request::GetAppInstId {
            app: Some(app.into()),
        })? {
            ReplyBody::Instance { id, flags } => Ok((id, flags)),
            _ => Err(Status::InternalError),
        }
    }

    pub fn register_events(&self, app: &str, handler: HandlerRef) -> Result<(), Status> {
        let result = self.call_unit(&Request::RegisterEventCb {
            app: Some(app.into()),
            handler: Some(handler.clone()),
        });
        match result {
            Ok(()) => self.bind(app, &handler),
            Err(_) => self.release_unless_bound(&handler),
        }
        result
    }

    pub fn unregister_events(&self, app: &str) -> Result<(), Status> {
        let result = self.call_unit(&Request::UnregisterEventCb {
            app: Some(app.into()),
        });
        if matches!(result, Ok(()) | Err(Status::NotRegisteredForEvents)) {
            self.unbind(app);
        }
        result
    }

    pub fn start_instance(&self, app: &str, handler: Option<HandlerRef>) -> Result<u32, Status> {
        let result = self.call_value(&Request::StartInstance {
            app: Some(app.into()),
            handler: handler.clone(),
        });
        match (&result, handler) {
            (Ok(id), handler) => {
                if let Some(h) = &handler {
                    self.bind(app, h);
                }
                self.bindings().instances.insert(*id, app.to_owned());
            }
            (Err(_), Some(h)) => self.release_unless_bound(&h),
            (Err(_), None) => {}
        }
        result
    }

    pub fn stop_instance(&self, instance: u32) -> Result<(), Status> {
        self.call_unit(&Request::StopInstance { instance })?;
        let app = self.bindings().instances.remove(&instance);
        if let Some(app) = app {
            self.unbind(&app);
        }
        Ok(())
    }
}
