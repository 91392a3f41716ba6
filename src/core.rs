use serde::{Deserialize, Serialize};

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = std::sync::Arc<str>;

/// A 32-byte BLAKE3 hash used for change detection.
///
/// In `trellis`, this serves as the fingerprint of a resource's fully
/// resolved input map. The convergence engine compares it against the
/// last-applied fingerprint to decide whether a node needs a provider call
/// at all.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl Serialize for Hash32 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        let mut bytes = [0u8; 32];

        if hex.len() != 64 {
            return Err(serde::de::Error::custom("expected 64 hex characters"));
        }

        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let high = (chunk[0] as char)
                .to_digit(16)
                .ok_or_else(|| serde::de::Error::custom("invalid hex digit"))?;
            let low = (chunk[1] as char)
                .to_digit(16)
                .ok_or_else(|| serde::de::Error::custom("invalid hex digit"))?;
            bytes[i] = ((high << 4) | low) as u8;
        }

        Ok(Hash32(bytes))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let hash = Hash32::hash(b"10.0.0.0/16");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);

        let json = serde_json::to_string(&hash).unwrap();
        let back: Hash32 = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, back);
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(Hash32::hash(b"cluster"), Hash32::hash(b"cluster"));
        assert_ne!(Hash32::hash(b"cluster"), Hash32::hash(b"network"));
    }
}
