//! Messages exchanged with the embedded app host on the co-processor.
//!
//! Each message is `postcard`-encoded and carried in one length-prefixed
//! frame (see [`crate::rpc::codec`]). The host answers every
//! [`AppletRequest`] with exactly one [`Inbound::Reply`], and may interleave
//! [`Inbound::Event`] frames at any point.

use serde::{Deserialize, Serialize};

use crate::app::events::AppletEvent;
use crate::error::Status;
use crate::rpc::negotiate::{self, Negotiated};

/// Handle value meaning "no provisioning session".
pub const NO_HANDLE: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppletRequest {
    /// Open (or reopen) a session with the app, shared or exclusive.
    Open { app: String, shared: bool },
    Close { app: String },
    Install { app: String, source: String },
    Uninstall { app: String },
    StartProvisioning { app: String },
    EndProvisioning { app: String, handle: u32, capacity: u32 },
    SendData { app: String, handle: u32, data_type: u32, data: Vec<u8> },
    ReceiveData { app: String, handle: u32, data_type: u32, capacity: u32 },
    SendAndReceive {
        app: String,
        handle: u32,
        data_type: u32,
        data: Vec<u8>,
        capacity: u32,
    },
    Capabilities { app: String, cap_type: u32, capacity: u32 },
    GetOtp {
        app: String,
        handle: u32,
        token: Vec<u8>,
        vendor_data: Vec<u8>,
        otp_capacity: u32,
        token_capacity: u32,
    },
    OtpsStatus { app: String, handle: u32, status_type: u32 },
    Subscribe { app: String },
    Unsubscribe { app: String },
}

impl AppletRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Close { .. } => "close",
            Self::Install { .. } => "install",
            Self::Uninstall { .. } => "uninstall",
            Self::StartProvisioning { .. } => "start-prov",
            Self::EndProvisioning { .. } => "end-prov",
            Self::SendData { .. } => "send",
            Self::ReceiveData { .. } => "receive",
            Self::SendAndReceive { .. } => "send-receive",
            Self::Capabilities { .. } => "caps",
            Self::GetOtp { .. } => "otp",
            Self::OtpsStatus { .. } => "otps-status",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppletReply {
    Done,
    Handle(u32),
    Value(u32),
    Data(Vec<u8>),
    Otp { otp: Vec<u8>, token: Vec<u8> },
    /// Declared capacity too small; required length per output.
    TooSmall { required: Vec<u32> },
    /// Status code raised by the co-processor, passed through verbatim.
    Failed(u32),
}

impl AppletReply {
    /// Build the reply for a negotiated single output.
    pub fn from_data(out: Negotiated<Vec<u8>>) -> Self {
        match out {
            Negotiated::Complete(data) => Self::Data(data),
            Negotiated::TooSmall(l) => Self::TooSmall {
                required: l.to_vec(),
            },
        }
    }

    pub fn failed(status: Status) -> Self {
        Self::Failed(status.code())
    }

    fn unexpected(&self, wanted: &str) -> Status {
        log::warn!("LINK: expected {wanted} reply, got {:?}", self);
        Status::InternalError
    }

    pub fn into_done(self) -> Result<(), Status> {
        match self {
            Self::Done => Ok(()),
            Self::Failed(code) => Err(Status::from_code(code)),
            other => Err(other.unexpected("done")),
        }
    }

    pub fn into_handle(self) -> Result<u32, Status> {
        match self {
            Self::Handle(h) => Ok(h),
            Self::Failed(code) => Err(Status::from_code(code)),
            other => Err(other.unexpected("handle")),
        }
    }

    pub fn into_value(self) -> Result<u32, Status> {
        match self {
            Self::Value(v) => Ok(v),
            Self::Failed(code) => Err(Status::from_code(code)),
            other => Err(other.unexpected("value")),
        }
    }

    /// Negotiated single blob. Data longer than the declared capacity is
    /// folded back into a "too small" answer.
    pub fn into_data(self, capacity: u32) -> Result<Negotiated<Vec<u8>>, Status> {
        match self {
            Self::Data(data) => Ok(negotiate::fit(data, capacity)),
            Self::TooSmall { required } => Ok(Negotiated::TooSmall(negotiate::lengths(&required))),
            Self::Failed(code) => Err(Status::from_code(code)),
            other => Err(other.unexpected("data")),
        }
    }

    pub fn into_otp(
        self,
        otp_capacity: u32,
        token_capacity: u32,
    ) -> Result<Negotiated<(Vec<u8>, Vec<u8>)>, Status> {
        match self {
            Self::Otp { otp, token } => Ok(negotiate::fit_pair(
                otp,
                otp_capacity,
                token,
                token_capacity,
            )),
            Self::TooSmall { required } => Ok(Negotiated::TooSmall(negotiate::lengths(&required))),
            Self::Failed(code) => Err(Status::from_code(code)),
            other => Err(other.unexpected("otp")),
        }
    }
}

/// Everything the co-processor can send to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Inbound {
    Reply(AppletReply),
    Event(AppletEvent),
}
