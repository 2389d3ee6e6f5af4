//! Opcode table.
//!
//! Values are stable across client and server builds: they start at
//! [`FIRST_CALL_TRANSACTION`] in the historical order, and new operations
//! are only ever appended.
//!
//! Each opcode has a static [`OpDescriptor`] that drives the generic
//! envelope codec and the dispatcher, so adding an operation means adding
//! one row here rather than another hand-written marshalling routine.

/// First user transaction code of the IPC substrate.
pub const FIRST_CALL_TRANSACTION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    Init = FIRST_CALL_TRANSACTION,
    DeInit,
    StartProvisioning,
    EndProvisioning,
    SendData,
    ReceiveData,
    ProcessSvpMessage,
    GetSvpMessage,
    SendAndReceiveData,
    GetCapabilities,
    GetVersion,
    Install,
    Uninstall,
    DoFwUpdate,
    GetOtp,
    GetOtpsStatus,
    GetOtpCapabilities,
    InstallOtps,
    UninstallOtps,
    GetAppInstId,
    RegisterEventCb,
    UnregisterEventCb,
    StartInstance,
    StopInstance,
}

/// Which API family an opcode belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiLevel {
    /// Library lifecycle, shared by every family.
    Library,
    /// v1.x "OTPS" entry points.
    Otps,
    /// v2.x "IHA" entry points.
    Iha,
    /// v3.x instance-id based entry points.
    Instance,
}

/// Fields present in a successful reply after the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyShape {
    Empty,
    /// Provisioning handle.
    Handle,
    /// One 32-bit value (version, status word, instance id).
    Value,
    /// One negotiated blob.
    Data,
    /// OTP blob then refreshed-token blob.
    Otp,
    /// Instance token then sharing flags.
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpDescriptor {
    pub opcode: Opcode,
    pub name: &'static str,
    pub api: ApiLevel,
    pub body: BodyShape,
    /// Number of corrected lengths carried by an insufficient-buffer reply.
    pub outputs: usize,
    /// Mutates per-app session state (serialized per app).
    pub mutates: bool,
}

const fn op(
    opcode: Opcode,
    name: &'static str,
    api: ApiLevel,
    body: BodyShape,
    outputs: usize,
    mutates: bool,
) -> OpDescriptor {
    OpDescriptor {
        opcode,
        name,
        api,
        body,
        outputs,
        mutates,
    }
}

use ApiLevel::{Iha, Instance, Library, Otps};
use BodyShape as B;

static DESCRIPTORS: [OpDescriptor; 24] = [
    op(Opcode::Init, "Init", Library, B::Empty, 0, false),
    op(Opcode::DeInit, "DeInit", Library, B::Empty, 0, true),
    op(Opcode::StartProvisioning, "StartProvisioning", Iha, B::Handle, 0, true),
    op(Opcode::EndProvisioning, "EndProvisioning", Iha, B::Data, 1, true),
    op(Opcode::SendData, "SendData", Iha, B::Empty, 0, false),
    op(Opcode::ReceiveData, "ReceiveData", Iha, B::Data, 1, false),
    op(Opcode::ProcessSvpMessage, "ProcessSVPMessage", Otps, B::Empty, 0, false),
    op(Opcode::GetSvpMessage, "GetSVPMessage", Otps, B::Data, 1, false),
    op(Opcode::SendAndReceiveData, "SendAndReceiveData", Iha, B::Data, 1, false),
    op(Opcode::GetCapabilities, "GetCapabilities", Iha, B::Data, 1, false),
    op(Opcode::GetVersion, "GetVersion", Library, B::Value, 0, false),
    op(Opcode::Install, "Install", Iha, B::Empty, 0, true),
    op(Opcode::Uninstall, "Uninstall", Iha, B::Empty, 0, true),
    op(Opcode::DoFwUpdate, "DoFWUpdate", Library, B::Empty, 0, false),
    op(Opcode::GetOtp, "GetOTP", Iha, B::Otp, 2, false),
    op(Opcode::GetOtpsStatus, "GetOTPSStatus", Otps, B::Value, 0, false),
    op(Opcode::GetOtpCapabilities, "GetOTPCapabilities", Otps, B::Data, 1, false),
    op(Opcode::InstallOtps, "InstallOTPS", Otps, B::Empty, 0, true),
    op(Opcode::UninstallOtps, "UninstallOTPS", Otps, B::Empty, 0, true),
    op(Opcode::GetAppInstId, "GetAppInstId", Iha, B::Instance, 0, false),
    op(Opcode::RegisterEventCb, "RegisterEventCb", Iha, B::Empty, 0, true),
    op(Opcode::UnregisterEventCb, "UnregisterEventCb", Iha, B::Empty, 0, true),
    op(Opcode::StartInstance, "StartInstance", Instance, B::Value, 0, true),
    op(Opcode::StopInstance, "StopInstance", Instance, B::Empty, 0, true),
];

impl Opcode {
    pub const ALL: [Self; 24] = [
        Self::Init,
        Self::DeInit,
        Self::StartProvisioning,
        Self::EndProvisioning,
        Self::SendData,
        Self::ReceiveData,
        Self::ProcessSvpMessage,
        Self::GetSvpMessage,
        Self::SendAndReceiveData,
        Self::GetCapabilities,
        Self::GetVersion,
        Self::Install,
        Self::Uninstall,
        Self::DoFwUpdate,
        Self::GetOtp,
        Self::GetOtpsStatus,
        Self::GetOtpCapabilities,
        Self::InstallOtps,
        Self::UninstallOtps,
        Self::GetAppInstId,
        Self::RegisterEventCb,
        Self::UnregisterEventCb,
        Self::StartInstance,
        Self::StopInstance,
    ];

    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let idx = code.checked_sub(FIRST_CALL_TRANSACTION)? as usize;
        Self::ALL.get(idx).copied()
    }

    pub fn descriptor(self) -> &'static OpDescriptor {
        &DESCRIPTORS[(self.code() - FIRST_CALL_TRANSACTION) as usize]
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }
}

impl core::fmt::Display for Opcode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}
