use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

/// 48-bit remote device address stored in little-endian byte order
/// ([Vol 6] Part B, Section 1.3).
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Addr([u8; 6]);

impl Addr {
    /// Creates an address from little-endian bytes.
    #[inline]
    #[must_use]
    pub const fn from_le_bytes(v: [u8; 6]) -> Self {
        Self(v)
    }

    /// Returns the address as little-endian bytes.
    #[inline]
    #[must_use]
    pub const fn as_le_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl Debug for Addr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // [Vol 3] Part C, Section 3.2.1.3
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[5], self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

impl Display for Addr {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Error returned when a device address string cannot be parsed.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("invalid device address: {0:?}")]
pub struct ParseAddrError(pub String);

impl FromStr for Addr {
    type Err = ParseAddrError;

    /// Parses the `XX:XX:XX:XX:XX:XX` form, most significant byte first.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut v = [0; 6];
        let mut parts = s.split(':');
        for b in v.iter_mut().rev() {
            let p = (parts.next())
                .filter(|p| p.len() == 2 && p.bytes().all(|b| b.is_ascii_hexdigit()));
            *b = (p.and_then(|p| u8::from_str_radix(p, 16).ok()))
                .ok_or_else(|| ParseAddrError(s.to_owned()))?;
        }
        if parts.next().is_some() {
            return Err(ParseAddrError(s.to_owned()));
        }
        Ok(Self(v))
    }
}

impl serde::Serialize for Addr {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Addr {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
