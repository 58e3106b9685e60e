//! OpenIGTLink message header codec.
//!
//! Every unit on the wire is a fixed 58-byte header followed by a body of
//! `body_size` bytes. All integers are network byte order. The timestamp is
//! 32.32 fixed-point seconds since the Unix epoch. The CRC is CRC-64/ECMA-182
//! over the body only; checking on receive is optional and configured.

use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 58;
pub const DEVICE_TYPE_LEN: usize = 12;
pub const DEVICE_NAME_LEN: usize = 20;

/// Protocol version this server speaks.
pub const PROTOCOL_VERSION: u16 = 1;

const CRC64_POLY: u64 = 0x42F0_E1EB_A9EA_3693;

const fn build_crc64_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u64) << 56;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000_0000_0000 != 0 {
                (crc << 1) ^ CRC64_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC64_TABLE: [u64; 256] = build_crc64_table();

/// CRC-64/ECMA-182 (init 0, not reflected, no final xor).
pub fn crc64(data: &[u8]) -> u64 {
    data.iter().fold(0u64, |crc, &byte| {
        (crc << 8) ^ CRC64_TABLE[(((crc >> 56) as u8) ^ byte) as usize]
    })
}

/// Seconds since epoch to 32.32 fixed point.
pub fn timestamp_to_wire(seconds: f64) -> u64 {
    if seconds <= 0.0 {
        return 0;
    }
    let whole = seconds.floor();
    let frac = seconds - whole;
    ((whole as u64) << 32) | ((frac * 4_294_967_296.0) as u64 & 0xFFFF_FFFF)
}

/// 32.32 fixed point to seconds since epoch.
pub fn timestamp_from_wire(wire: u64) -> f64 {
    (wire >> 32) as f64 + (wire & 0xFFFF_FFFF) as f64 / 4_294_967_296.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    pub version: u16,
    pub device_type: String,
    pub device_name: String,
    /// Seconds since the Unix epoch (UTC) on the wire.
    pub timestamp: f64,
    pub body_size: u64,
    pub crc: u64,
}

fn pack_fixed_str(out: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(out.len());
    out[..n].copy_from_slice(&bytes[..n]);
}

fn unpack_fixed_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl MessageHeader {
    pub fn pack(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&self.version.to_be_bytes());
        pack_fixed_str(&mut out[2..14], &self.device_type);
        pack_fixed_str(&mut out[14..34], &self.device_name);
        out[34..42].copy_from_slice(&timestamp_to_wire(self.timestamp).to_be_bytes());
        out[42..50].copy_from_slice(&self.body_size.to_be_bytes());
        out[50..58].copy_from_slice(&self.crc.to_be_bytes());
        out
    }

    pub fn unpack(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "header too short: {} bytes",
                raw.len()
            )));
        }
        let version = u16::from_be_bytes([raw[0], raw[1]]);
        let device_type = unpack_fixed_str(&raw[2..14]);
        let device_name = unpack_fixed_str(&raw[14..34]);
        let timestamp = timestamp_from_wire(u64::from_be_bytes(raw[34..42].try_into().unwrap()));
        let body_size = u64::from_be_bytes(raw[42..50].try_into().unwrap());
        let crc = u64::from_be_bytes(raw[50..58].try_into().unwrap());
        Ok(Self {
            version,
            device_type,
            device_name,
            timestamp,
            body_size,
            crc,
        })
    }
}

/// One fully-formed outbound message: header metadata plus packed body.
#[derive(Debug, Clone, PartialEq)]
pub struct IgtlMessage {
    pub device_type: String,
    pub device_name: String,
    /// Seconds since the Unix epoch (UTC).
    pub timestamp: f64,
    pub body: Vec<u8>,
}

impl IgtlMessage {
    pub fn new(
        device_type: impl Into<String>,
        device_name: impl Into<String>,
        timestamp: f64,
        body: Vec<u8>,
    ) -> Self {
        Self {
            device_type: device_type.into(),
            device_name: device_name.into(),
            timestamp,
            body,
        }
    }

    /// Serialize header + body into one wire buffer.
    pub fn pack(&self) -> Vec<u8> {
        let header = MessageHeader {
            version: PROTOCOL_VERSION,
            device_type: self.device_type.clone(),
            device_name: self.device_name.clone(),
            timestamp: self.timestamp,
            body_size: self.body.len() as u64,
            crc: crc64(&self.body),
        };
        let mut out = Vec::with_capacity(HEADER_SIZE + self.body.len());
        out.extend_from_slice(&header.pack());
        out.extend_from_slice(&self.body);
        out
    }
}

/// Verify a received body against its header CRC.
pub fn check_body_crc(header: &MessageHeader, body: &[u8]) -> Result<()> {
    let computed = crc64(body);
    if computed != header.crc {
        return Err(Error::Protocol(format!(
            "CRC mismatch for {} message: header {:#018x}, body {:#018x}",
            header.device_type, header.crc, computed
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_header_round_trip() {
        let header = MessageHeader {
            version: 1,
            device_type: "IMAGE".to_string(),
            device_name: "ServerImage".to_string(),
            timestamp: 1_000.25,
            body_size: 1234,
            crc: 0xDEAD_BEEF,
        };
        let packed = header.pack();
        assert_eq!(packed.len(), HEADER_SIZE);
        let unpacked = MessageHeader::unpack(&packed).unwrap();
        assert_eq!(unpacked.version, 1);
        assert_eq!(unpacked.device_type, "IMAGE");
        assert_eq!(unpacked.device_name, "ServerImage");
        assert_relative_eq!(unpacked.timestamp, 1_000.25, epsilon = 1.0e-6);
        assert_eq!(unpacked.body_size, 1234);
        assert_eq!(unpacked.crc, 0xDEAD_BEEF);
    }

    #[test]
    fn test_device_name_truncated_to_field_width() {
        let header = MessageHeader {
            version: 1,
            device_type: "TRANSFORM".to_string(),
            device_name: "AVeryLongDeviceNameThatOverflows".to_string(),
            timestamp: 0.0,
            body_size: 0,
            crc: 0,
        };
        let unpacked = MessageHeader::unpack(&header.pack()).unwrap();
        assert_eq!(unpacked.device_name.len(), DEVICE_NAME_LEN);
    }

    #[test]
    fn test_timestamp_fixed_point_precision() {
        for ts in [0.0, 1.0, 1_000.000_1, 1_660_000_000.5] {
            let wire = timestamp_to_wire(ts);
            assert_relative_eq!(timestamp_from_wire(wire), ts, epsilon = 1.0e-6);
        }
    }

    #[test]
    fn test_crc64_known_vector() {
        // CRC-64/ECMA-182 of "123456789".
        assert_eq!(crc64(b"123456789"), 0x6C40_DF5F_0B49_7347);
    }

    #[test]
    fn test_message_pack_and_crc_check() {
        let message = IgtlMessage::new("STATUS", "Server", 5.0, vec![1, 2, 3, 4]);
        let wire = message.pack();
        let header = MessageHeader::unpack(&wire[..HEADER_SIZE]).unwrap();
        assert_eq!(header.body_size, 4);
        assert!(check_body_crc(&header, &wire[HEADER_SIZE..]).is_ok());
        assert!(check_body_crc(&header, &[9, 9, 9, 9]).is_err());
    }
}
