//! Typed requests and replies, and their envelope encoding.
//!
//! Field order per opcode (after the interface token):
//!
//! | Opcode | Request fields |
//! |---|---|
//! | StartProvisioning | app |
//! | EndProvisioning | app, handle, token capacity |
//! | SendData | app, handle, type, blob |
//! | ReceiveData | app, handle, type, capacity |
//! | ProcessSVPMessage | app, handle, blob |
//! | GetSVPMessage | app, handle, capacity |
//! | SendAndReceiveData | app, handle, type, blob, capacity |
//! | GetCapabilities / GetOTPCapabilities | app, type, capacity |
//! | Install / InstallOTPS | app, source path |
//! | Uninstall / UninstallOTPS / GetAppInstId / UnregisterEventCb | app |
//! | GetOTP | app, handle, token blob, vendor blob, otp capacity, token capacity |
//! | GetOTPSStatus | app, handle, type |
//! | RegisterEventCb / StartInstance | app, handler |
//! | StopInstance | instance id |
//!
//! Replies are `status` followed by the [`BodyShape`] fields on success, or
//! by the corrected lengths on [`Status::InsufficientBuffer`].

use crate::app::ports::HandlerRef;
use crate::error::Status;

use super::negotiate::Lengths;
use super::opcode::{BodyShape, Opcode};
use super::parcel::{CodecError, Parcel, ParcelReader};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A decoded request. Values are carried exactly as on the wire; a zero
/// handle or capacity means "absent" and is interpreted by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Init,
    DeInit,
    StartProvisioning {
        app: Option<String>,
    },
    EndProvisioning {
        app: Option<String>,
        handle: u32,
        capacity: u32,
    },
    SendData {
        app: Option<String>,
        handle: u32,
        data_type: u32,
        data: Vec<u8>,
    },
    ReceiveData {
        app: Option<String>,
        handle: u32,
        data_type: u32,
        capacity: u32,
    },
    ProcessSvpMessage {
        app: Option<String>,
        handle: u32,
        data: Vec<u8>,
    },
    GetSvpMessage {
        app: Option<String>,
        handle: u32,
        capacity: u32,
    },
    SendAndReceiveData {
        app: Option<String>,
        handle: u32,
        data_type: u32,
        data: Vec<u8>,
        capacity: u32,
    },
    GetCapabilities {
        app: Option<String>,
        cap_type: u32,
        capacity: u32,
    },
    GetVersion,
    Install {
        app: Option<String>,
        source: Option<String>,
    },
    Uninstall {
        app: Option<String>,
    },
    DoFwUpdate,
    GetOtp {
        app: Option<String>,
        handle: u32,
        token: Vec<u8>,
        vendor_data: Vec<u8>,
        otp_capacity: u32,
        token_capacity: u32,
    },
    GetOtpsStatus {
        app: Option<String>,
        handle: u32,
        status_type: u32,
    },
    GetOtpCapabilities {
        app: Option<String>,
        cap_type: u32,
        capacity: u32,
    },
    InstallOtps {
        app: Option<String>,
        source: Option<String>,
    },
    UninstallOtps {
        app: Option<String>,
    },
    GetAppInstId {
        app: Option<String>,
    },
    RegisterEventCb {
        app: Option<String>,
        handler: Option<HandlerRef>,
    },
    UnregisterEventCb {
        app: Option<String>,
    },
    StartInstance {
        app: Option<String>,
        handler: Option<HandlerRef>,
    },
    StopInstance {
        instance: u32,
    },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Init => Opcode::Init,
            Self::DeInit => Opcode::DeInit,
            Self::StartProvisioning { .. } => Opcode::StartProvisioning,
            Self::EndProvisioning { .. } => Opcode::EndProvisioning,
            Self::SendData { .. } => Opcode::SendData,
            Self::ReceiveData { .. } => Opcode::ReceiveData,
            Self::ProcessSvpMessage { .. } => Opcode::ProcessSvpMessage,
            Self::GetSvpMessage { .. } => Opcode::GetSvpMessage,
            Self::SendAndReceiveData { .. } => Opcode::SendAndReceiveData,
            Self::GetCapabilities { .. } => Opcode::GetCapabilities,
            Self::GetVersion => Opcode::GetVersion,
            Self::Install { .. } => Opcode::Install,
            Self::Uninstall { .. } => Opcode::Uninstall,
            Self::DoFwUpdate => Opcode::DoFwUpdate,
            Self::GetOtp { .. } => Opcode::GetOtp,
            Self::GetOtpsStatus { .. } => Opcode::GetOtpsStatus,
            Self::GetOtpCapabilities { .. } => Opcode::GetOtpCapabilities,
            Self::InstallOtps { .. } => Opcode::InstallOtps,
            Self::UninstallOtps { .. } => Opcode::UninstallOtps,
            Self::GetAppInstId { .. } => Opcode::GetAppInstId,
            Self::RegisterEventCb { .. } => Opcode::RegisterEventCb,
            Self::UnregisterEventCb { .. } => Opcode::UnregisterEventCb,
            Self::StartInstance { .. } => Opcode::StartInstance,
            Self::StopInstance { .. } => Opcode::StopInstance,
        }
    }

    /// App identifier the request targets, if the opcode carries one.
    pub fn app(&self) -> Option<&str> {
        match self {
            Self::StartProvisioning { app }
            | Self::EndProvisioning { app, .. }
            | Self::SendData { app, .. }
            | Self::ReceiveData { app, .. }
            | Self::ProcessSvpMessage { app, .. }
            | Self::GetSvpMessage { app, .. }
            | Self::SendAndReceiveData { app, .. }
            | Self::GetCapabilities { app, .. }
            | Self::Install { app, .. }
            | Self::Uninstall { app }
            | Self::GetOtp { app, .. }
            | Self::GetOtpsStatus { app, .. }
            | Self::GetOtpCapabilities { app, .. }
            | Self::InstallOtps { app, .. }
            | Self::UninstallOtps { app }
            | Self::GetAppInstId { app }
            | Self::RegisterEventCb { app, .. }
            | Self::UnregisterEventCb { app }
            | Self::StartInstance { app, .. } => app.as_deref(),
            Self::Init | Self::DeInit | Self::GetVersion | Self::DoFwUpdate => None,
            Self::StopInstance { .. } => None,
        }
    }

    /// Write the interface token and every field in declared order.
    pub fn encode(&self, descriptor: &str) -> Parcel {
        let mut p = Parcel::new();
        p.write_interface_token(descriptor);

        match self {
            Self::Init | Self::DeInit | Self::GetVersion | Self::DoFwUpdate => {}
            Self::StartProvisioning { app }
            | Self::Uninstall { app }
            | Self::UninstallOtps { app }
            | Self::GetAppInstId { app }
            | Self::UnregisterEventCb { app } => p.write_str(app.as_deref()),
            Self::EndProvisioning {
                app,
                handle,
                capacity,
            } => {
                p.write_str(app.as_deref());
                p.write_u32(*handle);
                p.write_u32(*capacity);
            }
            Self::SendData {
                app,
                handle,
                data_type,
                data,
            } => {
                p.write_str(app.as_deref());
                p.write_u32(*handle);
                p.write_u32(*data_type);
                p.write_blob(data);
            }
            Self::ReceiveData {
                app,
                handle,
                data_type,
                capacity,
            } => {
                p.write_str(app.as_deref());
                p.write_u32(*handle);
                p.write_u32(*data_type);
                p.write_u32(*capacity);
            }
            Self::ProcessSvpMessage { app, handle, data } => {
                p.write_str(app.as_deref());
                p.write_u32(*handle);
                p.write_blob(data);
            }
            Self::GetSvpMessage {
                app,
                handle,
                capacity,
            } => {
                p.write_str(app.as_deref());
                p.write_u32(*handle);
                p.write_u32(*capacity);
            }
            Self::SendAndReceiveData {
                app,
                handle,
                data_type,
                data,
                capacity,
            } => {
                p.write_str(app.as_deref());
                p.write_u32(*handle);
                p.write_u32(*data_type);
                p.write_blob(data);
                p.write_u32(*capacity);
            }
            Self::GetCapabilities {
                app,
                cap_type,
                capacity,
            }
            | Self::GetOtpCapabilities {
                app,
                cap_type,
                capacity,
            } => {
                p.write_str(app.as_deref());
                p.write_u32(*cap_type);
                p.write_u32(*capacity);
            }
            Self::Install { app, source } | Self::InstallOtps { app, source } => {
                p.write_str(app.as_deref());
                p.write_str(source.as_deref());
            }
            Self::GetOtp {
                app,
                handle,
                token,
                vendor_data,
                otp_capacity,
                token_capacity,
            } => {
                p.write_str(app.as_deref());
                p.write_u32(*handle);
                p.write_blob(token);
                p.write_blob(vendor_data);
                p.write_u32(*otp_capacity);
                p.write_u32(*token_capacity);
            }
            Self::GetOtpsStatus {
                app,
                handle,
                status_type,
            } => {
                p.write_str(app.as_deref());
                p.write_u32(*handle);
                p.write_u32(*status_type);
            }
            Self::RegisterEventCb { app, handler } | Self::StartInstance { app, handler } => {
                p.write_str(app.as_deref());
                p.write_handler(handler.as_ref());
            }
            Self::StopInstance { instance } => p.write_u32(*instance),
        }

        p
    }

    /// Decode the fields of `op` from a reader positioned after the
    /// interface token.
    pub fn decode(op: Opcode, r: &mut ParcelReader<'_>) -> Result<Self, CodecError> {
        let req = match op {
            Opcode::Init => Self::Init,
            Opcode::DeInit => Self::DeInit,
            Opcode::GetVersion => Self::GetVersion,
            Opcode::DoFwUpdate => Self::DoFwUpdate,
            Opcode::StartProvisioning => Self::StartProvisioning { app: r.read_str()? },
            Opcode::EndProvisioning => Self::EndProvisioning {
                app: r.read_str()?,
                handle: r.read_u32()?,
                capacity: r.read_u32()?,
            },
            Opcode::SendData => Self::SendData {
                app: r.read_str()?,
                handle: r.read_u32()?,
                data_type: r.read_u32()?,
                data: r.read_blob()?,
            },
            Opcode::ReceiveData => Self::ReceiveData {
                app: r.read_str()?,
                handle: r.read_u32()?,
                data_type: r.read_u32()?,
                capacity: r.read_u32()?,
            },
            Opcode::ProcessSvpMessage => Self::ProcessSvpMessage {
                app: r.read_str()?,
                handle: r.read_u32()?,
                data: r.read_blob()?,
            },
            Opcode::GetSvpMessage => Self::GetSvpMessage {
                app: r.read_str()?,
                handle: r.read_u32()?,
                capacity: r.read_u32()?,
            },
            Opcode::SendAndReceiveData => Self::SendAndReceiveData {
                app: r.read_str()?,
                handle: r.read_u32()?,
                data_type: r.read_u32()?,
                data: r.read_blob()?,
                capacity: r.read_u32()?,
            },
            Opcode::GetCapabilities => Self::GetCapabilities {
                app: r.read_str()?,
                cap_type: r.read_u32()?,
                capacity: r.read_u32()?,
            },
            Opcode::GetOtpCapabilities => Self::GetOtpCapabilities {
                app: r.read_str()?,
                cap_type: r.read_u32()?,
                capacity: r.read_u32()?,
            },
            Opcode::Install => Self::Install {
                app: r.read_str()?,
                source: r.read_str()?,
            },
            Opcode::InstallOtps => Self::InstallOtps {
                app: r.read_str()?,
                source: r.read_str()?,
            },
            Opcode::Uninstall => Self::Uninstall { app: r.read_str()? },
            Opcode::UninstallOtps => Self::UninstallOtps { app: r.read_str()? },
            Opcode::GetAppInstId => Self::GetAppInstId { app: r.read_str()? },
            Opcode::UnregisterEventCb => Self::UnregisterEventCb { app: r.read_str()? },
            Opcode::GetOtp => Self::GetOtp {
                app: r.read_str()?,
                handle: r.read_u32()?,
                token: r.read_blob()?,
                vendor_data: r.read_blob()?,
                otp_capacity: r.read_u32()?,
                token_capacity: r.read_u32()?,
            },
            Opcode::GetOtpsStatus => Self::GetOtpsStatus {
                app: r.read_str()?,
                handle: r.read_u32()?,
                status_type: r.read_u32()?,
            },
            Opcode::RegisterEventCb => Self::RegisterEventCb {
                app: r.read_str()?,
                handler: r.read_handler()?,
            },
            Opcode::StartInstance => Self::StartInstance {
                app: r.read_str()?,
                handler: r.read_handler()?,
            },
            Opcode::StopInstance => Self::StopInstance {
                instance: r.read_u32()?,
            },
        };
        Ok(req)
    }

    /// Decode a complete request envelope (token check included).
    pub fn from_parcel(code: u32, descriptor: &str, parcel: &Parcel) -> Result<Self, CodecError> {
        let mut r = parcel.reader();
        r.enforce_interface(descriptor)?;
        let op = Opcode::from_code(code).ok_or(CodecError::UnknownOpcode(code))?;
        let req = Self::decode(op, &mut r)?;
        if !r.is_exhausted() {
            return Err(CodecError::Trailing(r.remaining()));
        }
        Ok(req)
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// Fields of a successful reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Empty,
    Handle(u32),
    Value(u32),
    Data(Vec<u8>),
    Otp { otp: Vec<u8>, token: Vec<u8> },
    Instance { id: u32, flags: u32 },
}

impl ReplyBody {
    pub fn shape(&self) -> BodyShape {
        match self {
            Self::Empty => BodyShape::Empty,
            Self::Handle(_) => BodyShape::Handle,
            Self::Value(_) => BodyShape::Value,
            Self::Data(_) => BodyShape::Data,
            Self::Otp { .. } => BodyShape::Otp,
            Self::Instance { .. } => BodyShape::Instance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(ReplyBody),
    /// Insufficient output buffer, with the corrected length(s).
    TooSmall(Lengths),
    /// Any other status; no further fields.
    Failed(Status),
}

impl Reply {
    pub fn status(&self) -> Status {
        match self {
            Self::Ok(_) => Status::Success,
            Self::TooSmall(_) => Status::InsufficientBuffer,
            Self::Failed(s) => *s,
        }
    }

    /// Build a failure reply, folding the two statuses that carry fields.
    pub fn failed(status: Status) -> Self {
        match status {
            Status::Success => Self::Ok(ReplyBody::Empty),
            Status::InsufficientBuffer => Self::TooSmall(Lengths::new()),
            other => Self::Failed(other),
        }
    }

    pub fn encode(&self) -> Parcel {
        let mut p = Parcel::new();
        p.write_i32(self.status().to_wire());

        match self {
            Self::Ok(body) => match body {
                ReplyBody::Empty => {}
                ReplyBody::Handle(v) | ReplyBody::Value(v) => p.write_u32(*v),
                ReplyBody::Data(bytes) => p.write_blob(bytes),
                ReplyBody::Otp { otp, token } => {
                    p.write_blob(otp);
                    p.write_blob(token);
                }
                ReplyBody::Instance { id, flags } => {
                    p.write_u32(*id);
                    p.write_u32(*flags);
                }
            },
            Self::TooSmall(lengths) => {
                for len in lengths {
                    p.write_u32(*len);
                }
            }
            Self::Failed(_) => {}
        }

        p
    }

    /// Decode a reply to `op`. Status first; body only on success;
    /// corrected lengths, if present, on insufficient buffer.
    pub fn decode(op: Opcode, parcel: &Parcel) -> Result<Self, CodecError> {
        let mut r = parcel.reader();
        let status = Status::from_wire(r.read_i32()?);
        let desc = op.descriptor();

        match status {
            Status::Success => {
                let body = match desc.body {
                    BodyShape::Empty => ReplyBody::Empty,
                    BodyShape::Handle => ReplyBody::Handle(r.read_u32()?),
                    BodyShape::Value => ReplyBody::Value(r.read_u32()?),
                    BodyShape::Data => ReplyBody::Data(r.read_blob()?),
                    BodyShape::Otp => ReplyBody::Otp {
                        otp: r.read_blob()?,
                        token: r.read_blob()?,
                    },
                    BodyShape::Instance => ReplyBody::Instance {
                        id: r.read_u32()?,
                        flags: r.read_u32()?,
                    },
                };
                Ok(Self::Ok(body))
            }
            Status::InsufficientBuffer => {
                let mut lengths = Lengths::new();
                while lengths.len() < desc.outputs {
                    let Ok(len) = r.read_u32() else { break };
                    let _ = lengths.push(len);
                }
                Ok(Self::TooSmall(lengths))
            }
            other => Ok(Self::Failed(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::negotiate::lengths;

    const DESC: &str = "test.ISvc";

    fn round_trip(req: &Request) -> Request {
        let p = req.encode(DESC);
        Request::from_parcel(req.opcode().code(), DESC, &p).unwrap()
    }

    #[test]
    fn requests_round_trip_with_optional_fields_empty() {
        let req = Request::GetOtp {
            app: Some("otp".into()),
            handle: 7,
            token: Vec::new(),
            vendor_data: Vec::new(),
            otp_capacity: 8,
            token_capacity: 0,
        };
        assert_eq!(round_trip(&req), req);

        let req = Request::StartProvisioning { app: None };
        assert_eq!(round_trip(&req), req);
    }

    #[test]
    fn reply_decode_stops_after_failure_status() {
        let mut p = Parcel::new();
        p.write_i32(Status::InvalidInput.to_wire());
        // Garbage that must be ignored.
        p.write_i32(-99);
        assert_eq!(
            Reply::decode(Opcode::ReceiveData, &p).unwrap(),
            Reply::Failed(Status::InvalidInput)
        );
    }

    #[test]
    fn insufficient_buffer_carries_lengths() {
        let reply = Reply::TooSmall(lengths(&[16]));
        let p = reply.encode();
        assert_eq!(Reply::decode(Opcode::EndProvisioning, &p).unwrap(), reply);

        let reply = Reply::TooSmall(lengths(&[8, 24]));
        assert_eq!(Reply::decode(Opcode::GetOtp, &reply.encode()).unwrap(), reply);
    }

    #[test]
    fn insufficient_buffer_without_lengths_is_tolerated() {
        let mut p = Parcel::new();
        p.write_i32(Status::InsufficientBuffer.to_wire());
        assert_eq!(
            Reply::decode(Opcode::ReceiveData, &p).unwrap(),
            Reply::TooSmall(Lengths::new())
        );
    }

    #[test]
    fn truncated_success_body_is_an_error() {
        let mut p = Parcel::new();
        p.write_i32(0);
        assert_eq!(
            Reply::decode(Opcode::StartProvisioning, &p),
            Err(CodecError::Truncated)
        );
    }

    #[test]
    fn unknown_opcode_is_reported() {
        let p = Request::Init.encode(DESC);
        assert_eq!(
            Request::from_parcel(99, DESC, &p),
            Err(CodecError::UnknownOpcode(99))
        );
    }

    #[test]
    fn extra_fields_after_the_last_one_are_malformed() {
        let mut p = Request::StopInstance { instance: 3 }.encode(DESC);
        p.write_u32(0);
        let err = Request::from_parcel(Opcode::StopInstance.code(), DESC, &p).unwrap_err();
        assert_eq!(err, CodecError::Trailing(4));
        assert_eq!(Status::from(err), Status::InternalError);

        let mut p = Request::Init.encode(DESC);
        p.write_str(Some("stray"));
        assert!(matches!(
            Request::from_parcel(Opcode::Init.code(), DESC, &p),
            Err(CodecError::Trailing(_))
        ));
    }

    #[test]
    fn failed_folds_field_carrying_statuses() {
        assert_eq!(Reply::failed(Status::InsufficientBuffer).status(), Status::InsufficientBuffer);
        assert_eq!(Reply::failed(Status::CommsError), Reply::Failed(Status::CommsError));
    }
}
