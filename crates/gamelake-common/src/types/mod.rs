//! Common types used across Gamelake

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CommonError;

/// Date bucket for one run's outputs (`dt=YYYY-MM-DD`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionDate(NaiveDate);

impl PartitionDate {
    pub const FORMAT: &'static str = "%Y-%m-%d";

    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// Partition for the current UTC date
    pub fn today() -> Self {
        Self(Utc::now().date_naive())
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for PartitionDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(Self::FORMAT))
    }
}

impl FromStr for PartitionDate {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), Self::FORMAT)
            .map(Self)
            .map_err(|_| CommonError::InvalidPartition {
                value: s.to_string(),
            })
    }
}

impl TryFrom<String> for PartitionDate {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PartitionDate> for String {
    fn from(value: PartitionDate) -> Self {
        value.to_string()
    }
}

/// Lifecycle tag carried by every batch object (`status=<value>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStatus {
    /// Written but not yet published
    Temp,
    /// Visible to readers
    Final,
    /// Superseded by a full refresh, retained for audit
    Outdated,
}

impl ObjectStatus {
    /// Tag key used for the status tag on stored objects
    pub const TAG_KEY: &'static str = "status";

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectStatus::Temp => "temp",
            ObjectStatus::Final => "final",
            ObjectStatus::Outdated => "outdated",
        }
    }
}

impl fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectStatus {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "temp" => Ok(ObjectStatus::Temp),
            "final" => Ok(ObjectStatus::Final),
            "outdated" => Ok(ObjectStatus::Outdated),
            other => Err(CommonError::InvalidStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_date_roundtrip_display() {
        let partition: PartitionDate = "2025-01-15".parse().unwrap();
        assert_eq!(partition.to_string(), "2025-01-15");
        assert_eq!(partition.date(), NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());
    }

    #[test]
    fn test_partition_date_rejects_garbage() {
        assert!("2025/01/15".parse::<PartitionDate>().is_err());
        assert!("yesterday".parse::<PartitionDate>().is_err());
        assert!("2025-02-30".parse::<PartitionDate>().is_err());
    }

    #[test]
    fn test_partition_date_serde_as_string() {
        let partition: PartitionDate = "2024-12-31".parse().unwrap();
        let json = serde_json::to_string(&partition).unwrap();
        assert_eq!(json, "\"2024-12-31\"");
        let back: PartitionDate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, partition);
    }

    #[test]
    fn test_object_status_from_str() {
        assert_eq!("final".parse::<ObjectStatus>().unwrap(), ObjectStatus::Final);
        assert_eq!("TEMP".parse::<ObjectStatus>().unwrap(), ObjectStatus::Temp);
        assert_eq!("outdated".parse::<ObjectStatus>().unwrap(), ObjectStatus::Outdated);
        assert!("deleted".parse::<ObjectStatus>().is_err());
    }
}
