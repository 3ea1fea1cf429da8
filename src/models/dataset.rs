//! Dataset metadata as stored by the metadata store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Visibility of a dataset record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DatasetStatus {
    Active,
    Removed,
}

/// A published dataset. Owned by the metadata store; sagas only issue
/// create/delete/restore requests against it.
#[derive(Clone, Debug, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRecord {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub category: String,
    pub license: String,
    /// Object name of the canonical bytes in object storage.
    pub object_name: String,
    pub file_size: i64,
    pub is_free: bool,
    /// Price in ether as a decimal string ("0" for free datasets).
    pub price: String,
    pub status: DatasetStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Seller-supplied description of a dataset, sent with the publish request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetDetails {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub license: String,
    pub is_free: bool,
    /// Price in ether, e.g. `"0.25"`. Ignored for free datasets.
    #[serde(default)]
    pub price: String,
}

/// Fields registered with the metadata store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewDataset {
    pub title: String,
    pub description: String,
    pub category: String,
    pub license: String,
    pub object_name: String,
    pub file_size: u64,
    pub is_free: bool,
    pub price: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid price `{0}`")]
pub struct InvalidPrice(pub String);

const WEI_DECIMALS: usize = 18;

/// Convert a decimal ether amount into wei using exact integer arithmetic.
pub fn parse_ether(value: &str) -> Result<u128, InvalidPrice> {
    let invalid = || InvalidPrice(value.to_string());
    let trimmed = value.trim();
    let (whole, fraction) = match trimmed.split_once('.') {
        Some((w, f)) => (w, f),
        None => (trimmed, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if fraction.len() > WEI_DECIMALS
        || !whole.bytes().all(|b| b.is_ascii_digit())
        || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }

    let whole: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let mut padded = fraction.to_string();
    padded.extend(std::iter::repeat_n('0', WEI_DECIMALS - fraction.len()));
    let fraction: u128 = padded.parse().map_err(|_| invalid())?;

    whole
        .checked_mul(10u128.pow(WEI_DECIMALS as u32))
        .and_then(|w| w.checked_add(fraction))
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_whole_and_fractional_ether() {
        assert_eq!(parse_ether("1").unwrap(), 1_000_000_000_000_000_000);
        assert_eq!(parse_ether("0.25").unwrap(), 250_000_000_000_000_000);
        assert_eq!(parse_ether(".5").unwrap(), 500_000_000_000_000_000);
        assert_eq!(parse_ether("0.000000000000000001").unwrap(), 1);
    }

    #[test]
    fn rejects_malformed_prices() {
        assert!(parse_ether("").is_err());
        assert!(parse_ether(".").is_err());
        assert!(parse_ether("-1").is_err());
        assert!(parse_ether("1.2.3").is_err());
        assert!(parse_ether("0.0000000000000000001").is_err());
        assert!(parse_ether("abc").is_err());
    }
}
