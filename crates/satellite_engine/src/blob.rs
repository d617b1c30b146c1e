//! CBOR blobs for persisted sync state.

use crate::error::{SatelliteError, SatelliteResult};
use satellite_storage::{Row, SqlValue};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes `value` as a CBOR blob.
pub(crate) fn to_blob<T: Serialize>(value: &T) -> SatelliteResult<SqlValue> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| SatelliteError::Corrupt(e.to_string()))?;
    Ok(SqlValue::Blob(buf))
}

/// Decodes the CBOR blob stored in `column` of `row`.
pub(crate) fn from_blob<T: DeserializeOwned>(row: &Row, column: &str) -> SatelliteResult<T> {
    let bytes = row
        .get(column)
        .and_then(SqlValue::as_blob)
        .ok_or_else(|| SatelliteError::Corrupt(format!("missing blob column {column}")))?;
    ciborium::from_reader(bytes).map_err(|e| SatelliteError::Corrupt(e.to_string()))
}

/// Reads a non-negative integer column.
pub(crate) fn read_u64(row: &Row, column: &str) -> SatelliteResult<u64> {
    row.get(column)
        .and_then(SqlValue::as_integer)
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| SatelliteError::Corrupt(format!("missing integer column {column}")))
}

/// Reads a text column.
pub(crate) fn read_text(row: &Row, column: &str) -> SatelliteResult<String> {
    row.get(column)
        .and_then(SqlValue::as_text)
        .map(str::to_string)
        .ok_or_else(|| SatelliteError::Corrupt(format!("missing text column {column}")))
}

/// Stores a `u64` in an integer column.
pub(crate) fn int(n: u64) -> SqlValue {
    SqlValue::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use satellite_storage::row;

    #[test]
    fn blob_roundtrip() {
        let value = vec![("a".to_string(), 1u64)];
        let r = row([("b", to_blob(&value).unwrap())]);
        let back: Vec<(String, u64)> = from_blob(&r, "b").unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn missing_columns_are_corrupt() {
        let r = row([("n", SqlValue::from(-1))]);
        assert!(matches!(read_u64(&r, "n"), Err(SatelliteError::Corrupt(_))));
        assert!(matches!(read_text(&r, "t"), Err(SatelliteError::Corrupt(_))));
        assert!(from_blob::<u64>(&r, "n").is_err());
    }
}
