#![no_std]

//! Wire structures for SCSI over Fibre Channel (FCP).
//!
//! Every structure here is a serialization boundary: values are held in native
//! form and converted to and from their fixed on-the-wire layout explicitly.
//! FCP units are big-endian; scatter-gather descriptors consumed by the adapter
//! are little-endian words.

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use core::{convert::TryFrom, fmt};

/// Number of bytes in an encoded [`FcpCmnd`].
pub const FCP_CMND_LEN: usize = 32;
/// Number of bytes in an encoded [`FcpRsp`].
pub const FCP_RSP_LEN: usize = 160;
/// Offset of the response-info bytes inside an [`FcpRsp`].
pub const FCP_RSP_INFO_OFFSET: usize = 24;
/// Bytes of response-info plus sense payload carried by an [`FcpRsp`].
pub const FCP_RSP_PAYLOAD_LEN: usize = FCP_RSP_LEN - FCP_RSP_INFO_OFFSET;
/// Maximum CDB length carried by an [`FcpCmnd`].
pub const MAX_CDB_LEN: usize = 16;
/// Number of bytes in an encoded modern scatter-gather entry.
pub const SGE_LEN: usize = 16;
/// Number of bytes in an encoded legacy buffer descriptor.
pub const BDE_LEN: usize = 12;
/// Largest byte count or offset representable in a descriptor.
pub const DESCRIPTOR_FIELD_MAX: u32 = 0x00FF_FFFF;

/// Local-reject reasons with this bit set originate in the driver, not the wire.
pub const IOERR_DRVR_MASK: u32 = 0x100;

/// SCSI status bytes the exchange engine acts on.
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
    pub const TASK_SET_FULL: u8 = 0x28;
}

/// CDB opcodes the engine inspects.
pub mod opcode {
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2a;
}

/// Errors surfaced while decoding wire structures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// Buffer length did not match the layout.
    InvalidLength { expected: usize, actual: usize },
    /// Field value failed validation.
    InvalidValue(&'static str),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::InvalidLength { expected, actual } => {
                write!(f, "invalid length {actual}, expected at least {expected}")
            }
            ProtoError::InvalidValue(field) => write!(f, "invalid field value: {field}"),
        }
    }
}

impl core::error::Error for ProtoError {}

/// Result alias for wire decoding.
pub type Result<T> = core::result::Result<T, ProtoError>;

fn check_len(bytes: &[u8], expected: usize) -> Result<()> {
    if bytes.len() < expected {
        return Err(ProtoError::InvalidLength {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// 24-bit Fibre Channel port address (D_ID) identifying a remote port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(u32);

impl PortId {
    pub const MAX: u32 = 0x00FF_FFFF;

    pub fn new(raw: u32) -> Result<Self> {
        if raw > Self::MAX {
            return Err(ProtoError::InvalidValue("port id"));
        }
        Ok(Self(raw))
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x}", self.0)
    }
}

/// SAM task attribute carried in `cntl1`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskAttribute {
    #[default]
    Simple = 0,
    HeadOfQueue = 1,
    Ordered = 2,
}

impl TryFrom<u8> for TaskAttribute {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self> {
        match value & 0x07 {
            0 => Ok(Self::Simple),
            1 => Ok(Self::HeadOfQueue),
            2 => Ok(Self::Ordered),
            _ => Err(ProtoError::InvalidValue("task attribute")),
        }
    }
}

/// Data phase carried in `cntl3`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum DataPhase {
    #[default]
    None = 0x00,
    Write = 0x01,
    Read = 0x02,
}

impl TryFrom<u8> for DataPhase {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::Write),
            0x02 => Ok(Self::Read),
            _ => Err(ProtoError::InvalidValue("data phase")),
        }
    }
}

bitflags! {
    /// Task management flags carried in `cntl2`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TaskMgmtFlags: u8 {
        const ABORT_TASK_SET = 0x02;
        const CLEAR_TASK_SET = 0x04;
        const BUS_RESET = 0x08;
        const LUN_RESET = 0x10;
        const TARGET_RESET = 0x20;
        const CLEAR_ACA = 0x40;
        const TERMINATE_TASK = 0x80;
    }
}

bitflags! {
    /// Validity flags carried in FCP_RSP status byte 2.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RspFlags: u8 {
        const RSP_LEN_VALID = 0x01;
        const SNS_LEN_VALID = 0x02;
        const RESID_OVER = 0x04;
        const RESID_UNDER = 0x08;
    }
}

/// Encode a LUN number into the 8-byte SAM representation.
pub fn encode_lun(lun: u64) -> [u8; 8] {
    let mut out = [0u8; 8];
    let mut rest = lun;
    for pair in out.chunks_exact_mut(2) {
        pair[0] = (rest >> 8) as u8;
        pair[1] = rest as u8;
        rest >>= 16;
    }
    out
}

/// Inverse of [`encode_lun`].
pub fn decode_lun(bytes: [u8; 8]) -> u64 {
    bytes
        .chunks_exact(2)
        .enumerate()
        .fold(0u64, |acc, (level, pair)| {
            let word = u64::from(BigEndian::read_u16(pair));
            acc | (word << (level * 16))
        })
}

/// FCP_CMND information unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FcpCmnd {
    pub lun: u64,
    pub task_attribute: TaskAttribute,
    pub task_mgmt: TaskMgmtFlags,
    pub phase: DataPhase,
    pub cdb: [u8; MAX_CDB_LEN],
    /// Expected data transfer length.
    pub fcp_dl: u32,
}

impl FcpCmnd {
    pub fn encode(&self) -> [u8; FCP_CMND_LEN] {
        let mut buf = [0u8; FCP_CMND_LEN];
        buf[0..8].copy_from_slice(&encode_lun(self.lun));
        buf[9] = self.task_attribute as u8;
        buf[10] = self.task_mgmt.bits();
        buf[11] = self.phase as u8;
        buf[12..28].copy_from_slice(&self.cdb);
        BigEndian::write_u32(&mut buf[28..32], self.fcp_dl);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, FCP_CMND_LEN)?;
        let mut lun = [0u8; 8];
        lun.copy_from_slice(&bytes[0..8]);
        let mut cdb = [0u8; MAX_CDB_LEN];
        cdb.copy_from_slice(&bytes[12..28]);
        Ok(Self {
            lun: decode_lun(lun),
            task_attribute: TaskAttribute::try_from(bytes[9])?,
            task_mgmt: TaskMgmtFlags::from_bits_truncate(bytes[10]),
            phase: DataPhase::try_from(bytes[11])?,
            cdb,
            fcp_dl: BigEndian::read_u32(&bytes[28..32]),
        })
    }
}

/// FCP_RSP information unit.
///
/// `payload` holds the response-info bytes followed by sense data, exactly as
/// they appear on the wire starting at [`FCP_RSP_INFO_OFFSET`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FcpRsp {
    pub flags: RspFlags,
    pub scsi_status: u8,
    pub residual: u32,
    pub sense_len: u32,
    pub rsp_info_len: u32,
    pub payload: [u8; FCP_RSP_PAYLOAD_LEN],
}

impl Default for FcpRsp {
    fn default() -> Self {
        Self {
            flags: RspFlags::empty(),
            scsi_status: scsi_status::GOOD,
            residual: 0,
            sense_len: 0,
            rsp_info_len: 0,
            payload: [0u8; FCP_RSP_PAYLOAD_LEN],
        }
    }
}

impl FcpRsp {
    /// Response carrying only a SCSI status byte.
    pub fn with_status(scsi_status: u8) -> Self {
        Self {
            scsi_status,
            ..Self::default()
        }
    }

    /// Attach sense bytes after the response info, truncating to what fits.
    pub fn sense(mut self, sense: &[u8]) -> Self {
        let start = (self.rsp_info_len as usize).min(FCP_RSP_PAYLOAD_LEN);
        let len = sense.len().min(FCP_RSP_PAYLOAD_LEN - start);
        self.payload[start..start + len].copy_from_slice(&sense[..len]);
        self.sense_len = len as u32;
        self.flags |= RspFlags::SNS_LEN_VALID;
        self
    }

    pub fn residual_under(mut self, residual: u32) -> Self {
        self.flags |= RspFlags::RESID_UNDER;
        self.flags.remove(RspFlags::RESID_OVER);
        self.residual = residual;
        self
    }

    pub fn residual_over(mut self, residual: u32) -> Self {
        self.flags |= RspFlags::RESID_OVER;
        self.flags.remove(RspFlags::RESID_UNDER);
        self.residual = residual;
        self
    }

    /// Attach a response-info block with the given length and response code.
    pub fn response_info(mut self, len: u32, code: u8) -> Self {
        self.flags |= RspFlags::RSP_LEN_VALID;
        self.rsp_info_len = len;
        self.payload[3] = code;
        self
    }

    /// The FCP_RSP_INFO response code byte.
    pub fn rsp_code(&self) -> u8 {
        self.payload[3]
    }

    /// Sense bytes, bounded by the payload actually present.
    pub fn sense_bytes(&self) -> &[u8] {
        if !self.flags.contains(RspFlags::SNS_LEN_VALID) {
            return &[];
        }
        let start = if self.flags.contains(RspFlags::RSP_LEN_VALID) {
            (self.rsp_info_len as usize).min(FCP_RSP_PAYLOAD_LEN)
        } else {
            0
        };
        let len = (self.sense_len as usize).min(FCP_RSP_PAYLOAD_LEN - start);
        &self.payload[start..start + len]
    }

    pub fn encode(&self) -> [u8; FCP_RSP_LEN] {
        let mut buf = [0u8; FCP_RSP_LEN];
        buf[10] = self.flags.bits();
        buf[11] = self.scsi_status;
        BigEndian::write_u32(&mut buf[12..16], self.residual);
        BigEndian::write_u32(&mut buf[16..20], self.sense_len);
        BigEndian::write_u32(&mut buf[20..24], self.rsp_info_len);
        buf[FCP_RSP_INFO_OFFSET..].copy_from_slice(&self.payload);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, FCP_RSP_LEN)?;
        let mut payload = [0u8; FCP_RSP_PAYLOAD_LEN];
        payload.copy_from_slice(&bytes[FCP_RSP_INFO_OFFSET..FCP_RSP_LEN]);
        Ok(Self {
            flags: RspFlags::from_bits_truncate(bytes[10]),
            scsi_status: bytes[11],
            residual: BigEndian::read_u32(&bytes[12..16]),
            sense_len: BigEndian::read_u32(&bytes[16..20]),
            rsp_info_len: BigEndian::read_u32(&bytes[20..24]),
            payload,
        })
    }
}

/// Legacy buffer-descriptor type flags.
pub mod bde_flags {
    /// Host-to-adapter data or a command/response region.
    pub const BDE_64: u8 = 0x00;
    /// Adapter-to-host (input) data.
    pub const BDE_64I: u8 = 0x08;
    /// Descriptor pointing at a descriptor list.
    pub const BLP_64: u8 = 0x40;
}

/// One scatter-gather entry in host-native form.
///
/// The modern encoding carries `offset` and `last`; the legacy encoding carries
/// neither, because the descriptor count is conveyed out of band.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SgEntry {
    pub addr: u64,
    pub len: u32,
    pub offset: u32,
    pub last: bool,
}

impl SgEntry {
    pub const fn new(addr: u64, len: u32) -> Self {
        Self {
            addr,
            len,
            offset: 0,
            last: false,
        }
    }

    pub fn encode_sge(&self) -> Result<[u8; SGE_LEN]> {
        if self.offset > DESCRIPTOR_FIELD_MAX {
            return Err(ProtoError::InvalidValue("sge offset"));
        }
        let mut buf = [0u8; SGE_LEN];
        LittleEndian::write_u32(&mut buf[0..4], (self.addr >> 32) as u32);
        LittleEndian::write_u32(&mut buf[4..8], self.addr as u32);
        let word2 = self.offset | if self.last { 1 << 31 } else { 0 };
        LittleEndian::write_u32(&mut buf[8..12], word2);
        LittleEndian::write_u32(&mut buf[12..16], self.len);
        Ok(buf)
    }

    pub fn decode_sge(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, SGE_LEN)?;
        let hi = u64::from(LittleEndian::read_u32(&bytes[0..4]));
        let lo = u64::from(LittleEndian::read_u32(&bytes[4..8]));
        let word2 = LittleEndian::read_u32(&bytes[8..12]);
        Ok(Self {
            addr: (hi << 32) | lo,
            len: LittleEndian::read_u32(&bytes[12..16]),
            offset: word2 & DESCRIPTOR_FIELD_MAX,
            last: word2 & (1 << 31) != 0,
        })
    }

    pub fn encode_bde(&self, flags: u8) -> Result<[u8; BDE_LEN]> {
        if self.len > DESCRIPTOR_FIELD_MAX {
            return Err(ProtoError::InvalidValue("bde size"));
        }
        let mut buf = [0u8; BDE_LEN];
        LittleEndian::write_u32(&mut buf[0..4], (self.addr >> 32) as u32);
        LittleEndian::write_u32(&mut buf[4..8], self.addr as u32);
        LittleEndian::write_u32(&mut buf[8..12], self.len | (u32::from(flags) << 24));
        Ok(buf)
    }

    /// Decode a legacy descriptor, returning the entry and its type flags.
    pub fn decode_bde(bytes: &[u8]) -> Result<(Self, u8)> {
        check_len(bytes, BDE_LEN)?;
        let hi = u64::from(LittleEndian::read_u32(&bytes[0..4]));
        let lo = u64::from(LittleEndian::read_u32(&bytes[4..8]));
        let tus = LittleEndian::read_u32(&bytes[8..12]);
        Ok((
            Self::new((hi << 32) | lo, tus & DESCRIPTOR_FIELD_MAX),
            (tus >> 24) as u8,
        ))
    }
}

/// Completion status reported by the adapter for one exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IoStatus {
    Success = 0x0,
    FcpRspError = 0x1,
    RemoteStop = 0x2,
    LocalReject = 0x3,
    NportReject = 0x4,
    FabricReject = 0x5,
    NportBusy = 0x6,
    FabricBusy = 0x7,
    IntermediateRsp = 0x8,
    LsReject = 0x9,
    BaReject = 0xa,
    DriverReject = 0xd,
    Default = 0xf,
}

impl IoStatus {
    /// Number of defined status codes; anything at or above maps to `Default`.
    pub const COUNT: u8 = 0x10;

    /// Total conversion: unknown codes collapse to [`IoStatus::Default`].
    pub fn from_raw(value: u8) -> Self {
        match value {
            0x0 => Self::Success,
            0x1 => Self::FcpRspError,
            0x2 => Self::RemoteStop,
            0x3 => Self::LocalReject,
            0x4 => Self::NportReject,
            0x5 => Self::FabricReject,
            0x6 => Self::NportBusy,
            0x7 => Self::FabricBusy,
            0x8 => Self::IntermediateRsp,
            0x9 => Self::LsReject,
            0xa => Self::BaReject,
            0xd => Self::DriverReject,
            _ => Self::Default,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::FcpRspError => "fcp_rsp_error",
            Self::RemoteStop => "remote_stop",
            Self::LocalReject => "local_reject",
            Self::NportReject => "nport_reject",
            Self::FabricReject => "fabric_reject",
            Self::NportBusy => "nport_busy",
            Self::FabricBusy => "fabric_busy",
            Self::IntermediateRsp => "intermediate_rsp",
            Self::LsReject => "ls_reject",
            Self::BaReject => "ba_reject",
            Self::DriverReject => "driver_reject",
            Self::Default => "default",
        }
    }
}

impl From<IoStatus> for u8 {
    fn from(status: IoStatus) -> Self {
        status as u8
    }
}

impl fmt::Display for IoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local-reject reason reported alongside [`IoStatus::LocalReject`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RejectReason {
    SequenceTimeout,
    InvalidRpi,
    NoXri,
    NoResources,
    AbortInProgress,
    AbortRequested,
    LinkDown,
    SlerCmdRcvFailure,
    /// Rejected by the driver before reaching the wire.
    SliAborted,
    Other(u32),
}

impl RejectReason {
    pub fn from_raw(value: u32) -> Self {
        match value {
            0x02 => Self::SequenceTimeout,
            0x04 => Self::InvalidRpi,
            0x05 => Self::NoXri,
            0x11 => Self::NoResources,
            0x15 => Self::AbortInProgress,
            0x16 => Self::AbortRequested,
            0x1a => Self::LinkDown,
            0x2b => Self::SlerCmdRcvFailure,
            0x103 => Self::SliAborted,
            other => Self::Other(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::SequenceTimeout => 0x02,
            Self::InvalidRpi => 0x04,
            Self::NoXri => 0x05,
            Self::NoResources => 0x11,
            Self::AbortInProgress => 0x15,
            Self::AbortRequested => 0x16,
            Self::LinkDown => 0x1a,
            Self::SlerCmdRcvFailure => 0x2b,
            Self::SliAborted => 0x103,
            Self::Other(raw) => raw,
        }
    }

    /// Whether the reason was raised by the driver rather than the adapter.
    pub fn is_driver(self) -> bool {
        self.raw() & IOERR_DRVR_MASK != 0
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SequenceTimeout => f.write_str("sequence_timeout"),
            Self::InvalidRpi => f.write_str("invalid_rpi"),
            Self::NoXri => f.write_str("no_xri"),
            Self::NoResources => f.write_str("no_resources"),
            Self::AbortInProgress => f.write_str("abort_in_progress"),
            Self::AbortRequested => f.write_str("abort_requested"),
            Self::LinkDown => f.write_str("link_down"),
            Self::SlerCmdRcvFailure => f.write_str("sler_cmd_rcv_failure"),
            Self::SliAborted => f.write_str("sli_aborted"),
            Self::Other(raw) => write!(f, "ioerr 0x{raw:x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lun_encoding_matches_sam_layout() {
        assert_eq!(encode_lun(5), [0, 5, 0, 0, 0, 0, 0, 0]);
        assert_eq!(encode_lun(0x0102_0304), [0x03, 0x04, 0x01, 0x02, 0, 0, 0, 0]);
        assert_eq!(decode_lun(encode_lun(0x4001)), 0x4001);
    }

    #[test]
    fn fcp_dl_is_big_endian() {
        let cmnd = FcpCmnd {
            lun: 1,
            task_attribute: TaskAttribute::Ordered,
            task_mgmt: TaskMgmtFlags::empty(),
            phase: DataPhase::Read,
            cdb: [0x28, 0, 0, 0, 0, 0x10, 0, 0, 0x80, 0, 0, 0, 0, 0, 0, 0],
            fcp_dl: 0x0001_0000,
        };
        let bytes = cmnd.encode();
        assert_eq!(&bytes[28..32], &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(bytes[9], 2);
        assert_eq!(bytes[11], 0x02);
        assert_eq!(FcpCmnd::decode(&bytes).unwrap(), cmnd);
    }

    #[test]
    fn fcp_cmnd_decode_rejects_short_buffer() {
        let err = FcpCmnd::decode(&[0u8; 12]).unwrap_err();
        assert_eq!(
            err,
            ProtoError::InvalidLength {
                expected: FCP_CMND_LEN,
                actual: 12
            }
        );
    }

    #[test]
    fn sense_follows_response_info() {
        let rsp = FcpRsp::with_status(scsi_status::CHECK_CONDITION)
            .response_info(8, 0)
            .sense(&[0x70, 0, 0x06, 0, 0, 0, 0, 10, 0, 0, 0, 0, 0x29, 0x00]);
        let bytes = rsp.encode();
        assert_eq!(bytes[FCP_RSP_INFO_OFFSET + 8], 0x70);
        let decoded = FcpRsp::decode(&bytes).unwrap();
        assert_eq!(decoded.sense_bytes()[2], 0x06);
        assert_eq!(decoded.sense_bytes().len(), 14);
    }

    #[test]
    fn sense_is_empty_without_valid_flag() {
        let mut rsp = FcpRsp::with_status(scsi_status::GOOD);
        rsp.sense_len = 20;
        assert!(rsp.sense_bytes().is_empty());
    }

    #[test]
    fn sge_carries_offset_and_last_marker() {
        let entry = SgEntry {
            addr: 0x1_2345_6789,
            len: 4096,
            offset: 8192,
            last: true,
        };
        let bytes = entry.encode_sge().unwrap();
        assert_eq!(LittleEndian::read_u32(&bytes[0..4]), 0x1);
        assert_eq!(LittleEndian::read_u32(&bytes[8..12]), 8192 | 1 << 31);
        assert_eq!(SgEntry::decode_sge(&bytes).unwrap(), entry);
    }

    #[test]
    fn bde_rejects_oversized_length() {
        let entry = SgEntry::new(0x1000, DESCRIPTOR_FIELD_MAX + 1);
        assert_eq!(
            entry.encode_bde(bde_flags::BDE_64),
            Err(ProtoError::InvalidValue("bde size"))
        );
        let ok = SgEntry::new(0x1000, 512).encode_bde(bde_flags::BDE_64I).unwrap();
        let (decoded, flags) = SgEntry::decode_bde(&ok).unwrap();
        assert_eq!(decoded.len, 512);
        assert_eq!(flags, bde_flags::BDE_64I);
    }

    #[test]
    fn unknown_status_collapses_to_default() {
        assert_eq!(IoStatus::from_raw(0x1f), IoStatus::Default);
        assert_eq!(IoStatus::from_raw(0x6), IoStatus::NportBusy);
        assert!(RejectReason::from_raw(0x103).is_driver());
        assert_eq!(RejectReason::from_raw(0x99), RejectReason::Other(0x99));
    }
}
