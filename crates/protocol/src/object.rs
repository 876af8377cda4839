use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// 256-bit unsigned object id, stored big-endian.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    pub const fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Low 64 bits, used where the chain guarantees ids fit a word.
    pub fn low_u64(&self) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.0[24..]);
        u64::from_be_bytes(word)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl From<u64> for ObjectId {
    fn from(v: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&v.to_be_bytes());
        Self(bytes)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("0");
        }
        let mut num = self.0;
        let mut digits = Vec::with_capacity(78);
        while num.iter().any(|b| *b != 0) {
            let mut rem: u32 = 0;
            for byte in num.iter_mut() {
                let acc = (rem << 8) | u32::from(*byte);
                *byte = (acc / 10) as u8;
                rem = acc % 10;
            }
            digits.push(char::from(b'0' + rem as u8));
        }
        let text: String = digits.iter().rev().collect();
        f.write_str(&text)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseObjectIdError(pub String);

impl fmt::Display for ParseObjectIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid object id '{}'", self.0)
    }
}

impl std::error::Error for ParseObjectIdError {}

impl FromStr for ObjectId {
    type Err = ParseObjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseObjectIdError(s.to_string()));
        }
        let mut num = [0u8; 32];
        for digit in s.bytes() {
            let mut carry = u32::from(digit - b'0');
            for byte in num.iter_mut().rev() {
                let acc = u32::from(*byte) * 10 + carry;
                *byte = (acc & 0xff) as u8;
                carry = acc >> 8;
            }
            if carry != 0 {
                return Err(ParseObjectIdError(s.to_string()));
            }
        }
        Ok(Self(num))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RedundancyType {
    #[default]
    ErasureCode,
    Replica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ObjectStatus {
    #[default]
    Init,
    InService,
    Sealed,
    Discontinued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Visibility {
    #[default]
    Private,
    PublicRead,
    Inherit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ObjectInfo {
    pub id: ObjectId,
    pub bucket_name: String,
    pub object_name: String,
    pub payload_size: u64,
    pub redundancy_type: RedundancyType,
    /// Index 0 is the integrity hash of the whole object, 1..=N the expected
    /// integrity hash of each secondary's shard set.
    pub checksums: Vec<Vec<u8>>,
    pub secondary_sp_addresses: Vec<String>,
    pub content_type: String,
    pub status: ObjectStatus,
    pub visibility: Visibility,
    pub create_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageParams {
    pub max_segment_size: u64,
    pub data_chunk_num: u32,
    pub parity_chunk_num: u32,
    pub max_payload_size: u64,
}

impl Default for StorageParams {
    fn default() -> Self {
        Self {
            max_segment_size: 16 * 1024 * 1024,
            data_chunk_num: 4,
            parity_chunk_num: 2,
            max_payload_size: 64 * 1024 * 1024 * 1024,
        }
    }
}

impl StorageParams {
    pub fn redundancy_count(&self) -> u32 {
        self.data_chunk_num + self.parity_chunk_num
    }

    pub fn segment_count(&self, payload_size: u64) -> u32 {
        if self.max_segment_size == 0 {
            return 0;
        }
        payload_size.div_ceil(self.max_segment_size) as u32
    }

    /// Size of segment `segment_idx`; only the last one may be short.
    pub fn segment_size(&self, payload_size: u64, segment_idx: u32) -> u64 {
        let count = self.segment_count(payload_size);
        if count == 0 || segment_idx >= count {
            return 0;
        }
        if segment_idx + 1 < count {
            return self.max_segment_size;
        }
        payload_size - u64::from(count - 1) * self.max_segment_size
    }

    /// Size of one erasure shard of segment `segment_idx`.
    pub fn ec_piece_size(&self, payload_size: u64, segment_idx: u32) -> u64 {
        if self.data_chunk_num == 0 {
            return 0;
        }
        self.segment_size(payload_size, segment_idx)
            .div_ceil(u64::from(self.data_chunk_num))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SpStatus {
    #[default]
    InService,
    InMaintenance,
    GracefulExiting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StorageProvider {
    pub operator_address: String,
    pub approval_address: String,
    /// Overlay peer id the provider is reachable at.
    pub endpoint: String,
    pub status: SpStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_decimal_round_trip() {
        let id = ObjectId::from(1_234_567_890_123u64);
        assert_eq!(id.to_string(), "1234567890123");
        assert_eq!("1234567890123".parse::<ObjectId>(), Ok(id));
        assert_eq!(ObjectId::default().to_string(), "0");
        assert_eq!(id.low_u64(), 1_234_567_890_123);
    }

    #[test]
    fn object_id_handles_full_width() {
        let max = ObjectId::from_be_bytes([0xff; 32]);
        let text = max.to_string();
        assert_eq!(
            text,
            "115792089237316195423570985008687907853269984665640564039457584007913129639935"
        );
        assert_eq!(text.parse::<ObjectId>(), Ok(max));
        let overflow = "115792089237316195423570985008687907853269984665640564039457584007913129639936";
        assert!(overflow.parse::<ObjectId>().is_err());
        assert!("12a".parse::<ObjectId>().is_err());
    }

    #[test]
    fn segment_math_for_three_full_segments() {
        let params = StorageParams::default();
        let payload = 48 * 1024 * 1024;
        assert_eq!(params.segment_count(payload), 3);
        assert_eq!(params.segment_size(payload, 2), 16 * 1024 * 1024);
        assert_eq!(params.ec_piece_size(payload, 0), 4 * 1024 * 1024);
        assert_eq!(params.segment_size(payload, 3), 0);
    }

    #[test]
    fn short_tail_segment() {
        let params = StorageParams {
            max_segment_size: 10,
            data_chunk_num: 4,
            parity_chunk_num: 2,
            max_payload_size: 1000,
        };
        assert_eq!(params.segment_count(25), 3);
        assert_eq!(params.segment_size(25, 2), 5);
        assert_eq!(params.ec_piece_size(25, 2), 2);
        assert_eq!(params.redundancy_count(), 6);
    }
}
