//! RPC engine — dispatches incoming envelopes to the session operations.
//!
//! **Transport-decoupled**: the engine does not own an IPC endpoint.
//! Callers hand it `(caller, code, envelope)` via [`RpcEngine::on_transact`]
//! and get the reply envelope back. The worker pool and the socket server
//! bridge the IPC substrate to this engine.
//!
//! Every call passes through a four-stage pipeline and keeps no state
//! across calls:
//!
//! 1. **Decode**: interface token, opcode lookup, per-opcode fields.
//! 2. **Validate**: app identifier, mandatory vs. optional lengths,
//!    capacity bounds.
//! 3. **Invoke**: one [`IhaOperations`] call; the v1 and v3 entry points
//!    are thin adapters onto the same operation set.
//! 4. **Encode**: status first, then the body on success or the
//!    corrected lengths on insufficient buffer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};

use crate::app::ports::{Caller, IhaOperations, OtpRequest};
use crate::app::registry::APP_NAME_MAX_LEN;
use crate::app::service::DATA_TYPE_PROVISIONING;
use crate::error::Status;

use super::messages::{Reply, ReplyBody, Request};
use super::negotiate::{Negotiated, check_capacity};
use super::opcode::Opcode;
use super::parcel::Parcel;

/// Transport-decoupled dispatcher over an [`IhaOperations`] implementation.
pub struct RpcEngine<S: IhaOperations + ?Sized> {
    ops: Arc<S>,
    descriptor: String,
    served: AtomicU64,
}

impl<S: IhaOperations + ?Sized> RpcEngine<S> {
    pub fn new(ops: Arc<S>, descriptor: impl Into<String>) -> Self {
        Self {
            ops,
            descriptor: descriptor.into(),
            served: AtomicU64::new(0),
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn operations(&self) -> &Arc<S> {
        &self.ops
    }

    /// Transactions handled so far, successful or not.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Handle one raw transaction.
    pub fn on_transact(&self, caller: Caller, code: u32, data: &Parcel) -> Parcel {
        self.served.fetch_add(1, Ordering::Relaxed);

        let request = match Request::from_parcel(code, &self.descriptor, data) {
            Ok(req) => req,
            Err(e) => {
                warn!("RPC[{}]: code {} rejected: {}", caller.pid, code, e);
                return Reply::failed(Status::from(e)).encode();
            }
        };

        let op = request.opcode();
        let reply = self.dispatch(caller, request);
        let status = reply.status();
        if !status.is_success() {
            debug!("RPC[{}]: {} -> {} ({})", caller.pid, op, status.code(), status);
        }
        reply.encode()
    }

    /// Validate and invoke a decoded request.
    pub fn dispatch(&self, caller: Caller, request: Request) -> Reply {
        self.invoke(caller, request).unwrap_or_else(Reply::failed)
    }

    fn invoke(&self, caller: Caller, request: Request) -> Result<Reply, Status> {
        let ops = self.ops.as_ref();
        let done = |()| Reply::Ok(ReplyBody::Empty);

        match request {
            Request::Init => ops.init().map(done),
            Request::DeInit => ops.deinit().map(done),
            Request::GetVersion => Ok(Reply::Ok(ReplyBody::Value(ops.version()))),
            // Firmware update is not served by this daemon.
            Request::DoFwUpdate => Err(Status::NotImplemented),

            Request::StartProvisioning { app } => {
                let app = app_name(app.as_deref())?;
                ops.start_provisioning(app).map(|h| Reply::Ok(ReplyBody::Handle(h)))
            }
            Request::EndProvisioning {
                app,
                handle,
                capacity,
            } => {
                let app = app_name(app.as_deref())?;
                check_capacity(capacity, true)?;
                ops.end_provisioning(app, handle, capacity).map(data_reply)
            }

            Request::SendData {
                app,
                handle,
                data_type,
                data,
            } => {
                let app = app_name(app.as_deref())?;
                mandatory(&data)?;
                ops.send_data(app, optional(handle), data_type, &data).map(done)
            }
            Request::ProcessSvpMessage { app, handle, data } => {
                let app = app_name(app.as_deref())?;
                mandatory(&data)?;
                ops.send_data(app, optional(handle), DATA_TYPE_PROVISIONING, &data)
                    .map(done)
            }
            Request::ReceiveData {
                app,
                handle,
                data_type,
                capacity,
            } => {
                let app = app_name(app.as_deref())?;
                check_capacity(capacity, true)?;
                ops.receive_data(app, optional(handle), data_type, capacity)
                    .map(data_reply)
            }
            Request::GetSvpMessage {
                app,
                handle,
                capacity,
            } => {
                let app = app_name(app.as_deref())?;
                check_capacity(capacity, true)?;
                ops.receive_data(app, optional(handle), DATA_TYPE_PROVISIONING, capacity)
                    .map(data_reply)
            }
            Request::SendAndReceiveData {
                app,
                handle,
                data_type,
                data,
                capacity,
            } => {
                let app = app_name(app.as_deref())?;
                mandatory(&data)?;
                check_capacity(capacity, true)?;
                ops.send_and_receive(app, optional(handle), data_type, &data, capacity)
                    .map(data_reply)
            }

            Request::GetCapabilities {
                app,
                cap_type,
                capacity,
            }
            | Request::GetOtpCapabilities {
                app,
                cap_type,
                capacity,
            } => {
                let app = app_name(app.as_deref())?;
                check_capacity(capacity, true)?;
                ops.capabilities(app, cap_type, capacity).map(data_reply)
            }

            Request::Install { app, source } | Request::InstallOtps { app, source } => {
                let app = app_name(app.as_deref())?;
                let source = source
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .ok_or(Status::InvalidInput)?;
                ops.install(app, source).map(done)
            }
            Request::Uninstall { app } | Request::UninstallOtps { app } => {
                ops.uninstall(app_name(app.as_deref())?).map(done)
            }

            Request::GetOtp {
                app,
                handle,
                token,
                vendor_data,
                otp_capacity,
                token_capacity,
            } => {
                let app = app_name(app.as_deref())?;
                let request = otp_request(handle, token, vendor_data, otp_capacity, token_capacity)?;
                ops.get_otp(app, &request).map(|out| match out {
                    Negotiated::Complete(out) => Reply::Ok(ReplyBody::Otp {
                        otp: out.otp,
                        token: out.token,
                    }),
                    Negotiated::TooSmall(lengths) => Reply::TooSmall(lengths),
                })
            }
            Request::GetOtpsStatus {
                app,
                handle,
                status_type,
            } => {
                let app = app_name(app.as_deref())?;
                ops.otps_status(app, optional(handle), status_type)
                    .map(|v| Reply::Ok(ReplyBody::Value(v)))
            }

            Request::GetAppInstId { app } => {
                let (id, flags) = ops.app_instance(app_name(app.as_deref())?)?;
                Ok(Reply::Ok(ReplyBody::Instance { id, flags }))
            }
            Request::RegisterEventCb { app, handler } => {
                let app = app_name(app.as_deref())?;
                let handler = handler.ok_or(Status::InvalidInput)?;
                ops.register_events(app, handler).map(done)
            }
            Request::UnregisterEventCb { app } => {
                ops.unregister_events(app_name(app.as_deref())?).map(done)
            }

            Request::StartInstance { app, handler } => {
                let app = app_name(app.as_deref())?;
                ops.start_instance(caller, app, handler)
                    .map(|id| Reply::Ok(ReplyBody::Value(id)))
            }
            Request::StopInstance { instance } => {
                if instance == 0 {
                    return Err(Status::InvalidInstanceId);
                }
                ops.stop_instance(caller, instance).map(done)
            }
        }
    }
}

// ── Validation helpers ───────────────────────────────────────

/// App identifier: present, non-empty, at most [`APP_NAME_MAX_LEN`] bytes.
pub fn app_name(app: Option<&str>) -> Result<&str, Status> {
    match app {
        Some(name) if !name.is_empty() && name.len() <= APP_NAME_MAX_LEN => Ok(name),
        _ => Err(Status::InvalidInput),
    }
}

fn mandatory(data: &[u8]) -> Result<(), Status> {
    if data.is_empty() || data.len() > super::negotiate::MAX_BUFFER_LEN as usize {
        Err(Status::InvalidInput)
    } else {
        Ok(())
    }
}

/// Zero is "no handle".
fn optional(handle: u32) -> Option<u32> {
    (handle != 0).then_some(handle)
}

fn data_reply(out: Negotiated<Vec<u8>>) -> Reply {
    match out {
        Negotiated::Complete(data) => Reply::Ok(ReplyBody::Data(data)),
        Negotiated::TooSmall(lengths) => Reply::TooSmall(lengths),
    }
}

/// `GetOTP` argument rules: the OTP capacity is mandatory; the context is
/// either a session handle or an encrypted token, never both; a refreshed
/// token can only be requested on the token path; vendor data is optional.
fn otp_request(
    handle: u32,
    token: Vec<u8>,
    vendor_data: Vec<u8>,
    otp_capacity: u32,
    token_capacity: u32,
) -> Result<OtpRequest, Status> {
    check_capacity(otp_capacity, true)?;
    check_capacity(token_capacity, false)?;
    let handle = optional(handle);
    match handle {
        Some(_) if !token.is_empty() || token_capacity != 0 => return Err(Status::InvalidInput),
        None if token.is_empty() => return Err(Status::InvalidInput),
        _ => {}
    }
    Ok(OtpRequest {
        handle,
        token,
        vendor_data,
        otp_capacity,
        token_capacity,
    })
}

impl<S: IhaOperations + ?Sized> core::fmt::Debug for RpcEngine<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RpcEngine")
            .field("descriptor", &self.descriptor)
            .field("served", &self.served())
            .finish_non_exhaustive()
    }
}

/// Name of the opcode for `code`, for log lines.
pub fn opcode_name(code: u32) -> &'static str {
    Opcode::from_code(code).map_or("unknown", Opcode::name)
}
