use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// A torrent's 20-byte infohash. Compared, hashed and ordered by value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn new(from: [u8; 20]) -> InfoHash {
        InfoHash(from)
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_bytes(b: &[u8]) -> anyhow::Result<Self> {
        let mut v = [0u8; 20];
        if b.len() != 20 {
            anyhow::bail!("buffer length must be 20, but it's {}", b.len());
        }
        v.copy_from_slice(b);
        Ok(InfoHash(v))
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x?}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for InfoHash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 20];
        if s.len() != 40 {
            anyhow::bail!("expected a hex string of length 40, got {}", s.len());
        }
        hex::decode_to_slice(s, &mut out)?;
        Ok(InfoHash(out))
    }
}

impl Serialize for InfoHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;
        impl serde::de::Visitor<'_> for Visitor {
            type Value = InfoHash;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a 20 byte slice")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.len() != 20 {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut buf = [0u8; 20];
                buf.copy_from_slice(v);
                Ok(InfoHash(buf))
            }
        }
        deserializer.deserialize_bytes(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::InfoHash;

    #[test]
    fn test_parse_hex() {
        let hash = InfoHash::from_str("775459190aa65566591634203f8d9f17d341f969").unwrap();
        assert_eq!(hash.as_string(), "775459190aa65566591634203f8d9f17d341f969");
        assert_eq!(format!("{:?}", hash), "775459190aa65566591634203f8d9f17d341f969");
    }

    #[test]
    fn test_parse_hex_wrong_length() {
        assert!(InfoHash::from_str("7754").is_err());
    }

    #[test]
    fn test_from_bytes() {
        let hash = InfoHash::from_bytes(&[7u8; 20]).unwrap();
        assert_eq!(hash, InfoHash([7u8; 20]));
        assert!(InfoHash::from_bytes(&[7u8; 19]).is_err());
    }
}
