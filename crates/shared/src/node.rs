//! On-device node addressing and raw field layouts.
//!
//! Field offsets differ between the classic/mini and BLE protocol variants,
//! so encoding/decoding here is parameterized by a [`NodeSizes`] table handed
//! in by whichever [`crate::protocol::MessageProtocol`] is active, rather than
//! being hard-coded per type.

use crate::protocol::NodeSizes;
use serde::{Deserialize, Serialize};

/// A 2-byte (page, slot) on-device address. `0x0000` ("page 0, slot 0") is
/// the reserved "no address" sentinel used throughout the node graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Address {
    pub page: u8,
    pub slot: u8,
}

impl Address {
    pub const EMPTY: Address = Address { page: 0, slot: 0 };

    pub const fn new(page: u8, slot: u8) -> Self {
        Self { page, slot }
    }

    pub const fn is_empty(&self) -> bool {
        self.page == 0 && self.slot == 0
    }

    pub const fn to_bytes(self) -> [u8; 2] {
        [self.page, self.slot]
    }

    pub const fn from_bytes(b: [u8; 2]) -> Self {
        Self {
            page: b[0],
            slot: b[1],
        }
    }

    /// Dense key suitable for a `HashMap`, matching device address ordering.
    pub const fn as_u16(self) -> u16 {
        ((self.page as u16) << 8) | self.slot as u16
    }
}

/// Monotonic 3-byte encryption counter, used as nonce material for
/// password/data encryption. Comparison and increment operate on the
/// counter's numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Ctr([u8; 3]);

impl Ctr {
    pub const ZERO: Ctr = Ctr([0, 0, 0]);

    pub fn from_bytes(b: [u8; 3]) -> Self {
        Self(b)
    }

    pub fn to_bytes(self) -> [u8; 3] {
        self.0
    }

    pub fn as_u32(self) -> u32 {
        ((self.0[0] as u32) << 16) | ((self.0[1] as u32) << 8) | self.0[2] as u32
    }

    /// Next counter value, saturating rather than wrapping back to zero
    /// (a device never hands out a nonce twice).
    #[must_use]
    pub fn next(self) -> Self {
        let v = self.as_u32().saturating_add(1).min(0x00FF_FFFF);
        Self([(v >> 16) as u8, (v >> 8) as u8, v as u8])
    }
}

/// 24-byte smart-card identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cpz(#[serde(with = "serde_bytes_24")] pub [u8; 24]);

impl Cpz {
    pub fn from_bytes(b: [u8; 24]) -> Self {
        Self(b)
    }

    pub fn to_bytes(self) -> [u8; 24] {
        self.0
    }
}

mod serde_bytes_24 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; 24], s: S) -> Result<S::Ok, S::Error> {
        v.to_vec().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 24], D::Error> {
        let v = Vec::<u8>::deserialize(d)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("expected 24 bytes"))
    }
}

/// The four on-device node kinds. Parent kinds share one field layout
/// ([`ParentFields`]); the distinction is which chain a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    CredParent,
    CredChild,
    DataParent,
    DataChild,
}

impl NodeKind {
    pub const fn is_parent(self) -> bool {
        matches!(self, NodeKind::CredParent | NodeKind::DataParent)
    }
}

/// Failure decoding a raw on-device buffer into typed fields.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeCodecError {
    #[error("node buffer too short: expected {expected}, got {got}")]
    TooShort { expected: usize, got: usize },
    #[error("service name is not null-terminated within its field")]
    ServiceNameNotTerminated,
    #[error("login is not null-terminated within its field")]
    LoginNotTerminated,
}

/// Parent node fields (shared by credential and data parents).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentFields {
    pub service_name: String,
    pub prev: Address,
    pub next: Address,
    pub first_child: Address,
}

/// Credential child node fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredChildFields {
    pub login: String,
    /// Ciphertext of the password; always `sizes.pwd_enc_len` bytes.
    pub password_enc: Vec<u8>,
    pub description: String,
    pub prev: Address,
    pub next: Address,
    pub date_created: u16,
    pub date_used: u16,
}

/// Data child node fields: one `sizes.data_payload_len`-byte block of a
/// larger blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChildFields {
    pub seq: u16,
    pub next: Address,
    pub payload: Vec<u8>,
}

fn write_cstr(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len().saturating_sub(1));
    buf[..n].copy_from_slice(&bytes[..n]);
    for b in &mut buf[n..] {
        *b = 0;
    }
}

fn read_cstr(buf: &[u8]) -> Result<String, NodeCodecError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(NodeCodecError::ServiceNameNotTerminated)?;
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Encodes a parent node into a freshly allocated `sizes.parent_size` buffer.
pub fn encode_parent(fields: &ParentFields, sizes: &NodeSizes) -> Vec<u8> {
    let mut buf = vec![0u8; sizes.parent_size];
    buf[0..2].copy_from_slice(&[0, 0]); // flags, unused by the host
    buf[2..4].copy_from_slice(&fields.prev.to_bytes());
    buf[4..6].copy_from_slice(&fields.next.to_bytes());
    buf[6..8].copy_from_slice(&fields.first_child.to_bytes());
    write_cstr(&mut buf[8..], &fields.service_name);
    buf
}

/// Decodes a parent node from a `sizes.parent_size`-byte buffer.
pub fn decode_parent(buf: &[u8], sizes: &NodeSizes) -> Result<ParentFields, NodeCodecError> {
    if buf.len() < sizes.parent_size {
        return Err(NodeCodecError::TooShort {
            expected: sizes.parent_size,
            got: buf.len(),
        });
    }
    Ok(ParentFields {
        prev: Address::from_bytes([buf[2], buf[3]]),
        next: Address::from_bytes([buf[4], buf[5]]),
        first_child: Address::from_bytes([buf[6], buf[7]]),
        service_name: read_cstr(&buf[8..])?,
    })
}

/// Encodes a credential child node into a freshly allocated
/// `sizes.child_size` buffer, per the fixed field layout:
/// `[flags:2][prev:2][next:2][description][date_created:2][date_used:2][login][pad:1][password_enc]`.
pub fn encode_cred_child(fields: &CredChildFields, sizes: &NodeSizes) -> Vec<u8> {
    let mut buf = vec![0u8; sizes.child_size];
    buf[2..4].copy_from_slice(&fields.prev.to_bytes());
    buf[4..6].copy_from_slice(&fields.next.to_bytes());
    let desc_start = 6;
    let desc_end = desc_start + sizes.description_len;
    write_cstr(&mut buf[desc_start..desc_end], &fields.description);
    let dc_start = desc_end;
    buf[dc_start..dc_start + 2].copy_from_slice(&fields.date_created.to_le_bytes());
    let du_start = dc_start + 2;
    buf[du_start..du_start + 2].copy_from_slice(&fields.date_used.to_le_bytes());
    let login_start = du_start + 2;
    let login_end = login_start + sizes.login_max_len + 1;
    write_cstr(&mut buf[login_start..login_end], &fields.login);
    let pwd_start = login_end + 1; // one padding byte
    let pwd_end = pwd_start + sizes.pwd_enc_len;
    let n = fields.password_enc.len().min(sizes.pwd_enc_len);
    buf[pwd_start..pwd_start + n].copy_from_slice(&fields.password_enc[..n]);
    debug_assert!(pwd_end <= buf.len());
    buf
}

pub fn decode_cred_child(buf: &[u8], sizes: &NodeSizes) -> Result<CredChildFields, NodeCodecError> {
    if buf.len() < sizes.child_size {
        return Err(NodeCodecError::TooShort {
            expected: sizes.child_size,
            got: buf.len(),
        });
    }
    let prev = Address::from_bytes([buf[2], buf[3]]);
    let next = Address::from_bytes([buf[4], buf[5]]);
    let desc_start = 6;
    let desc_end = desc_start + sizes.description_len;
    let description = read_cstr(&buf[desc_start..desc_end]).unwrap_or_default();
    let dc_start = desc_end;
    let date_created = u16::from_le_bytes([buf[dc_start], buf[dc_start + 1]]);
    let du_start = dc_start + 2;
    let date_used = u16::from_le_bytes([buf[du_start], buf[du_start + 1]]);
    let login_start = du_start + 2;
    let login_end = login_start + sizes.login_max_len + 1;
    let login = read_cstr(&buf[login_start..login_end]).map_err(|_| NodeCodecError::LoginNotTerminated)?;
    let pwd_start = login_end + 1;
    let pwd_end = pwd_start + sizes.pwd_enc_len;
    let password_enc = buf[pwd_start..pwd_end].to_vec();
    Ok(CredChildFields {
        login,
        password_enc,
        description,
        prev,
        next,
        date_created,
        date_used,
    })
}

/// Encodes a data child node: `[flags:2][seq:2][next:2][payload...]`.
pub fn encode_data_child(fields: &DataChildFields, sizes: &NodeSizes) -> Vec<u8> {
    let mut buf = vec![0u8; sizes.child_size];
    buf[2..4].copy_from_slice(&fields.seq.to_le_bytes());
    buf[4..6].copy_from_slice(&fields.next.to_bytes());
    let n = fields.payload.len().min(sizes.data_payload_len);
    buf[6..6 + n].copy_from_slice(&fields.payload[..n]);
    buf
}

pub fn decode_data_child(buf: &[u8], sizes: &NodeSizes) -> Result<DataChildFields, NodeCodecError> {
    if buf.len() < sizes.child_size {
        return Err(NodeCodecError::TooShort {
            expected: sizes.child_size,
            got: buf.len(),
        });
    }
    let seq = u16::from_le_bytes([buf[2], buf[3]]);
    let next = Address::from_bytes([buf[4], buf[5]]);
    let payload = buf[6..6 + sizes.data_payload_len].to_vec();
    Ok(DataChildFields { seq, next, payload })
}

/// Encodes `(year_since_base << 9) | (month << 5) | day` as used by the
/// device's compact date field.
pub fn encode_date(year_since_base: u16, month: u8, day: u8) -> u16 {
    (year_since_base << 9) | ((month as u16) << 5) | day as u16
}

/// Decodes a compact date field into `(year_since_base, month, day)`.
pub fn decode_date(raw: u16) -> (u16, u8, u8) {
    let day = (raw & 0x1F) as u8;
    let month = ((raw >> 5) & 0x0F) as u8;
    let year_since_base = raw >> 9;
    (year_since_base, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NodeSizes;

    fn sizes() -> NodeSizes {
        NodeSizes::classic()
    }

    #[test]
    fn address_empty_sentinel() {
        assert!(Address::EMPTY.is_empty());
        assert!(!Address::new(1, 0).is_empty());
    }

    #[test]
    fn ctr_increments_as_u32() {
        let c = Ctr::from_bytes([0, 0, 5]);
        assert_eq!(c.next().as_u32(), 6);
    }

    #[test]
    fn parent_round_trip() {
        let sizes = sizes();
        let fields = ParentFields {
            service_name: "github.com".to_string(),
            prev: Address::new(1, 2),
            next: Address::new(3, 4),
            first_child: Address::new(5, 6),
        };
        let buf = encode_parent(&fields, &sizes);
        assert_eq!(buf.len(), sizes.parent_size);
        let decoded = decode_parent(&buf, &sizes).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn cred_child_round_trip() {
        let sizes = sizes();
        let fields = CredChildFields {
            login: "alice".to_string(),
            password_enc: vec![0xAB; sizes.pwd_enc_len],
            description: "main account".to_string(),
            prev: Address::new(0, 0),
            next: Address::new(1, 1),
            date_created: encode_date(15, 3, 20),
            date_used: encode_date(15, 6, 1),
        };
        let buf = encode_cred_child(&fields, &sizes);
        assert_eq!(buf.len(), sizes.child_size);
        let decoded = decode_cred_child(&buf, &sizes).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn data_child_round_trip() {
        let sizes = sizes();
        let fields = DataChildFields {
            seq: 3,
            next: Address::new(2, 2),
            payload: vec![0x42; sizes.data_payload_len],
        };
        let buf = encode_data_child(&fields, &sizes);
        let decoded = decode_data_child(&buf, &sizes).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn date_encoding_round_trip() {
        let raw = encode_date(20, 11, 27);
        assert_eq!(decode_date(raw), (20, 11, 27));
    }

    #[test]
    fn short_buffer_is_rejected() {
        let sizes = sizes();
        let err = decode_parent(&[0u8; 4], &sizes).unwrap_err();
        assert!(matches!(err, NodeCodecError::TooShort { .. }));
    }
}
