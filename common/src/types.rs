use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayType {
    Workday,
    Holiday,
}

impl DayType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workday => "workday",
            Self::Holiday => "holiday",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Start,
    Stop,
}

impl Direction {
    pub fn sign(self) -> char {
        match self {
            Self::Start => '+',
            Self::Stop => '-',
        }
    }
}

/// Hardware address of a managed device, accepted as `AA:BB:CC:DD:EE:FF` or
/// `AA-BB-CC-DD-EE-FF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn octets(self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidMac(value.to_string());
        let bytes = value.as_bytes();
        if bytes.len() != 17 || !value.is_ascii() {
            return Err(invalid());
        }

        let separator = bytes[2];
        if separator != b':' && separator != b'-' {
            return Err(invalid());
        }

        let mut out = [0u8; 6];
        for (index, octet) in out.iter_mut().enumerate() {
            let start = index * 3;
            if index > 0 && bytes[start - 1] != separator {
                return Err(invalid());
            }
            let pair = &value[start..start + 2];
            if !pair.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(pair, 16).map_err(|_| invalid())?;
        }
        Ok(Self(out))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colon_and_hyphen_forms() {
        let colon: MacAddr = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let hyphen: MacAddr = "aa-bb-cc-dd-ee-ff".parse().unwrap();

        assert_eq!(colon, hyphen);
        assert_eq!(colon.octets(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(hyphen.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn rejects_mixed_separators_and_bad_digits() {
        assert!("AA:BB-CC:DD:EE:FF".parse::<MacAddr>().is_err());
        assert!("AA:BB:CC:DD:EE:GG".parse::<MacAddr>().is_err());
        assert!("AABBCCDDEEFF".parse::<MacAddr>().is_err());
        assert!("".parse::<MacAddr>().is_err());
    }
}
