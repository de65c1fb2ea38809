//! Wire framing: magic delimiter, fixed meta header, bincode payload.
//!
//! Every message on the fabric is `[magic | meta header | payload]`:
//!
//! ```text
//! magic:u32 = 0x5ADB0BB1   (little-endian, part of the header)
//! unit_type:u32  payload_size:u32  package_type:u32
//! src_uuid:u64   tgt_uuid:u64
//! ```
//!
//! The header is packed (no padding) and always little-endian, 32 bytes in
//! total. The payload is a bincode-serialized message whose concrete type
//! is identified by `package_type`.
//!
//! [`extract_frames`] is the stream parser shared by both sides: it walks a
//! receive buffer invoking a callback per complete frame, then compacts the
//! unconsumed tail to the buffer start and reports how many bytes are left.

use crate::plan::ClientUuid;
use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Frame delimiter. Appears little-endian on the wire.
pub const FRAME_MAGIC: u32 = 0x5ADB_0BB1;

/// Size of the packed meta header in bytes.
pub const META_SIZE: usize = 32;

/// The class of a connected client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum UnitType {
    Undefined = 0,
    QueryPlanner = 1,
    ComputeUnit = 2,
    Monitor = 3,
}

impl UnitType {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => UnitType::QueryPlanner,
            2 => UnitType::ComputeUnit,
            3 => UnitType::Monitor,
            _ => UnitType::Undefined,
        }
    }
}

/// Identifies the payload schema of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum PackageType {
    Undefined = 0,
    UpdateUnitType = 1,
    UuidCollision = 2,
    Work = 3,
    RerouteWork = 4,
    QueryPlan = 5,
    QueryGroup = 6,
    PlanResponse = 7,
    Text = 8,
    ConfigurationAction = 9,
    MonitorRequest = 10,
    UuidForUnitRequest = 11,
    UuidForUnitResponse = 12,
    ServerConfiguration = 13,
    ServerConfigurationResponse = 14,
    TaskFinished = 15,
    ConnectAction = 16,
    ConnectActionInfo = 17,
}

impl PackageType {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => PackageType::UpdateUnitType,
            2 => PackageType::UuidCollision,
            3 => PackageType::Work,
            4 => PackageType::RerouteWork,
            5 => PackageType::QueryPlan,
            6 => PackageType::QueryGroup,
            7 => PackageType::PlanResponse,
            8 => PackageType::Text,
            9 => PackageType::ConfigurationAction,
            10 => PackageType::MonitorRequest,
            11 => PackageType::UuidForUnitRequest,
            12 => PackageType::UuidForUnitResponse,
            13 => PackageType::ServerConfiguration,
            14 => PackageType::ServerConfigurationResponse,
            15 => PackageType::TaskFinished,
            16 => PackageType::ConnectAction,
            17 => PackageType::ConnectActionInfo,
            _ => PackageType::Undefined,
        }
    }
}

/// The fixed-size frame header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaHeader {
    pub unit_type: UnitType,
    pub payload_size: u32,
    pub package_type: PackageType,
    pub src_uuid: ClientUuid,
    pub tgt_uuid: ClientUuid,
}

impl MetaHeader {
    pub fn new(package_type: PackageType, src_uuid: ClientUuid, tgt_uuid: ClientUuid) -> Self {
        Self {
            unit_type: UnitType::Undefined,
            payload_size: 0,
            package_type,
            src_uuid,
            tgt_uuid,
        }
    }

    /// Total frame size, header included.
    pub fn frame_size(&self) -> usize {
        META_SIZE + self.payload_size as usize
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], FRAME_MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], self.unit_type as u32);
        LittleEndian::write_u32(&mut buf[8..12], self.payload_size);
        LittleEndian::write_u32(&mut buf[12..16], self.package_type as u32);
        LittleEndian::write_u64(&mut buf[16..24], self.src_uuid);
        LittleEndian::write_u64(&mut buf[24..32], self.tgt_uuid);
    }

    /// Parse a header from `buf`. The magic must sit at byte 0.
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < META_SIZE || LittleEndian::read_u32(&buf[0..4]) != FRAME_MAGIC {
            return None;
        }
        Some(Self {
            unit_type: UnitType::from_u32(LittleEndian::read_u32(&buf[4..8])),
            payload_size: LittleEndian::read_u32(&buf[8..12]),
            package_type: PackageType::from_u32(LittleEndian::read_u32(&buf[12..16])),
            src_uuid: LittleEndian::read_u64(&buf[16..24]),
            tgt_uuid: LittleEndian::read_u64(&buf[24..32]),
        })
    }
}

/// Encode a full frame for a serializable payload.
pub fn encode_frame<T: Serialize>(
    package_type: PackageType,
    src_uuid: ClientUuid,
    tgt_uuid: ClientUuid,
    payload: &T,
) -> anyhow::Result<Vec<u8>> {
    let body = bincode::serialize(payload)?;
    let mut header = MetaHeader::new(package_type, src_uuid, tgt_uuid);
    header.payload_size = body.len() as u32;
    let mut out = vec![0u8; META_SIZE + body.len()];
    header.write_to(&mut out[..META_SIZE]);
    out[META_SIZE..].copy_from_slice(&body);
    Ok(out)
}

/// A header-only frame (handshake control messages carry no payload).
pub fn encode_empty_frame(
    package_type: PackageType,
    src_uuid: ClientUuid,
    tgt_uuid: ClientUuid,
) -> Vec<u8> {
    let header = MetaHeader::new(package_type, src_uuid, tgt_uuid);
    let mut out = vec![0u8; META_SIZE];
    header.write_to(&mut out);
    out
}

pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> anyhow::Result<T> {
    Ok(bincode::deserialize(payload)?)
}

/// Parse all complete frames in `buf[..filled]`.
///
/// Invokes `on_frame` once per complete frame, in stream order. Leading
/// garbage before the first magic is discarded (with a warning; a healthy
/// stream always has the delimiter at byte 0). The unconsumed tail - a
/// partial frame, if any - is moved to the start of the buffer, and its
/// length returned.
pub fn extract_frames(
    buf: &mut [u8],
    filled: usize,
    mut on_frame: impl FnMut(&MetaHeader, &[u8]),
) -> usize {
    let mut cursor = 0usize;

    // Scan to the first delimiter.
    while cursor + 4 <= filled && LittleEndian::read_u32(&buf[cursor..cursor + 4]) != FRAME_MAGIC {
        cursor += 1;
    }
    if cursor > 0 {
        warn!(skipped = cursor, "skipped bytes before frame delimiter");
    }

    loop {
        let remaining = filled - cursor;
        if remaining < META_SIZE {
            break;
        }
        let Some(header) = MetaHeader::read_from(&buf[cursor..filled]) else {
            break;
        };
        if header.frame_size() > remaining {
            break;
        }
        let payload_start = cursor + META_SIZE;
        let payload_end = payload_start + header.payload_size as usize;
        on_frame(&header, &buf[payload_start..payload_end]);
        cursor = payload_end;
    }

    let leftover = filled - cursor;
    if leftover > 0 && cursor > 0 {
        buf.copy_within(cursor..filled, 0);
    }
    leftover
}

/// Handshake payload: a client announcing its class and display name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnitDefinition {
    pub unit_type: UnitType,
    pub pretty_name: String,
}

/// Runtime reconfiguration of a compute unit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ConfigurationAction {
    SetWorker { count: usize },
    ResetCatalog,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UuidForUnitRequest {
    pub unit_type: UnitType,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UuidForUnitResponse {
    pub unit_type: UnitType,
    pub names: Vec<String>,
    pub uuids: Vec<ClientUuid>,
}

/// Router reconfiguration: grouping window and clustering knobs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerConfiguration {
    pub window_ms: Option<u64>,
    pub threshold: Option<u64>,
    pub max_merge_overhead: Option<f32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfigurationResponse {
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut header = MetaHeader::new(PackageType::QueryPlan, 7, 9);
        header.payload_size = 42;
        let mut buf = [0u8; META_SIZE];
        header.write_to(&mut buf);
        let back = MetaHeader::read_from(&buf).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn read_rejects_bad_magic() {
        let buf = [0u8; META_SIZE];
        assert!(MetaHeader::read_from(&buf).is_none());
    }
}
