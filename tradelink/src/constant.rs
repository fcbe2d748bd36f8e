use std::fmt::{Display, Formatter};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bar timeframe expressed in whole minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timeframe(u32);

impl Timeframe {
    pub const M1: Self = Self(1);
    pub const M5: Self = Self(5);
    pub const M15: Self = Self(15);
    pub const M30: Self = Self(30);
    pub const H1: Self = Self(60);
    pub const H4: Self = Self(240);
    pub const D1: Self = Self(1440);

    pub fn from_minutes(minutes: u32) -> Result<Self, ModelError> {
        if minutes == 0 {
            return Err(ModelError::InvalidTimeframe(minutes.to_string()));
        }
        Ok(Self(minutes))
    }

    pub fn from_seconds(seconds: u32) -> Result<Self, ModelError> {
        if seconds == 0 || seconds % 60 != 0 {
            return Err(ModelError::InvalidTimeframe(format!("{seconds}s")));
        }
        Ok(Self(seconds / 60))
    }

    pub fn minutes(self) -> u32 {
        self.0
    }

    pub fn duration(self) -> Duration {
        Duration::minutes(i64::from(self.0))
    }

    /// True when `self` can be built by merging whole bars of `base`.
    pub fn is_multiple_of(self, base: Timeframe) -> bool {
        self.0 % base.0 == 0
    }

    pub fn parse(value: &str) -> Result<Self, ModelError> {
        let text = value.trim().to_ascii_lowercase();
        let invalid = || ModelError::InvalidTimeframe(value.to_string());
        let (split, unit) = text.char_indices().last().ok_or_else(invalid)?;
        let count = text[..split].parse::<u32>().map_err(|_| invalid())?;
        let minutes = match unit {
            'm' => count,
            'h' => count.checked_mul(60).ok_or_else(invalid)?,
            'd' => count.checked_mul(1440).ok_or_else(invalid)?,
            _ => return Err(invalid()),
        };
        Self::from_minutes(minutes)
    }
}

impl Display for Timeframe {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0 % 1440 == 0 {
            write!(f, "{}d", self.0 / 1440)
        } else if self.0 % 60 == 0 {
            write!(f, "{}h", self.0 / 60)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn code(self) -> &'static str {
        match self {
            Self::Buy => "B",
            Self::Sell => "S",
        }
    }

    /// Accepts both the one-letter native codes and the spelled-out REST forms.
    pub fn parse(value: &str) -> Result<Self, ModelError> {
        match value.trim().to_ascii_uppercase().as_str() {
            "B" | "BUY" => Ok(Self::Buy),
            "S" | "SELL" => Ok(Self::Sell),
            _ => Err(ModelError::InvalidSide(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Forwarding,
    Active,
    Watching,
    Matched,
    Cancelled,
    Disabled,
    Lost,
    Inactive,
}

impl OrderStatus {
    /// Maps a native status word onto the closed status set.
    ///
    /// Broker words outside the set are folded into the nearest member;
    /// `None` means the word is unknown and the caller keeps the old status.
    pub fn from_wire(value: &str) -> Option<Self> {
        let status = match value.trim().to_ascii_lowercase().as_str() {
            "forwarding" => Self::Forwarding,
            "active" => Self::Active,
            "watching" | "wait" => Self::Watching,
            "matched" => Self::Matched,
            "cancelled" | "expired" | "removed" => Self::Cancelled,
            "disabled" | "denied" | "rejected" | "refused" | "failed" => Self::Disabled,
            "lost" => Self::Lost,
            "inactive" | "none" => Self::Inactive,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_live(self) -> bool {
        matches!(self, Self::Forwarding | Self::Active | Self::Watching)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid timeframe: {0}")]
    InvalidTimeframe(String),
    #[error("invalid side: {0}")]
    InvalidSide(String),
    #[error("invalid datetime: {0}")]
    InvalidDatetime(String),
}

#[cfg(test)]
mod tests {
    use super::{OrderStatus, Side, Timeframe};

    #[test]
    fn timeframe_parse_and_display_agree() {
        for text in ["1m", "5m", "30m", "1h", "4h", "1d"] {
            let tf = Timeframe::parse(text).expect("valid timeframe");
            assert_eq!(tf.to_string(), text);
        }
        assert_eq!(Timeframe::parse("90m").unwrap().to_string(), "90m");
        assert!(Timeframe::parse("0m").is_err());
        assert!(Timeframe::parse("m").is_err());
        assert!(Timeframe::parse("5x").is_err());
        assert!(Timeframe::parse("").is_err());
    }

    #[test]
    fn timeframe_parse_rejects_multibyte_units() {
        assert!(Timeframe::parse("5é").is_err());
        assert!(Timeframe::parse("5м").is_err());
        assert!(Timeframe::parse("é").is_err());
        assert!(Timeframe::parse("1ч5m").is_err());
    }

    #[test]
    fn timeframe_from_seconds_requires_whole_minutes() {
        assert_eq!(Timeframe::from_seconds(300).unwrap(), Timeframe::M5);
        assert!(Timeframe::from_seconds(90).is_err());
        assert!(Timeframe::H1.is_multiple_of(Timeframe::M15));
        assert!(!Timeframe::M5.is_multiple_of(Timeframe::M15));
    }

    #[test]
    fn wire_status_words_fold_into_closed_set() {
        assert_eq!(OrderStatus::from_wire("matched"), Some(OrderStatus::Matched));
        assert_eq!(OrderStatus::from_wire("denied"), Some(OrderStatus::Disabled));
        assert_eq!(OrderStatus::from_wire("expired"), Some(OrderStatus::Cancelled));
        assert_eq!(OrderStatus::from_wire("bogus"), None);
        assert!(OrderStatus::Watching.is_live());
        assert!(!OrderStatus::Matched.is_live());
    }

    #[test]
    fn side_accepts_native_and_rest_spellings() {
        assert_eq!(Side::parse("B").unwrap(), Side::Buy);
        assert_eq!(Side::parse("sell").unwrap(), Side::Sell);
        assert!(Side::parse("X").is_err());
    }
}
