//! Keyset-pagination cursor for the message history endpoints.
//!
//! The cursor travels as base64url of its JSON form, so clients treat it as
//! an opaque token.

use crate::error::{AppError, AppResult};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MIN_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub last_created_at: DateTime<Utc>,
    pub page_size: i64,
}

pub fn is_valid_page_size(page_size: i64) -> bool {
    (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
}

impl Cursor {
    pub fn is_valid(&self) -> bool {
        is_valid_page_size(self.page_size)
    }
}

pub fn encode(cursor: &Cursor) -> AppResult<String> {
    let bytes = serde_json::to_vec(cursor)
        .map_err(|e| AppError::Internal(format!("cursor marshal: {e}")))?;

    Ok(URL_SAFE.encode(bytes))
}

pub fn decode(input: &str) -> AppResult<Cursor> {
    let bytes = URL_SAFE.decode(input).map_err(|_| AppError::InvalidCursor)?;
    let cursor: Cursor = serde_json::from_slice(&bytes).map_err(|_| AppError::InvalidCursor)?;

    if !cursor.is_valid() {
        return Err(AppError::InvalidCursor);
    }

    Ok(cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cursor() -> Cursor {
        Cursor {
            last_created_at: Utc.with_ymd_and_hms(2023, 10, 1, 12, 30, 0).unwrap(),
            page_size: 20,
        }
    }

    #[test]
    fn round_trips() {
        let encoded = encode(&cursor()).unwrap();
        assert_eq!(decode(&encoded).unwrap(), cursor());
    }

    #[test]
    fn encode_of_decode_is_identity() {
        let encoded = encode(&cursor()).unwrap();
        let reencoded = encode(&decode(&encoded).unwrap()).unwrap();
        assert_eq!(reencoded, encoded);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(decode("not base64!!"), Err(AppError::InvalidCursor)));
        let not_json = URL_SAFE.encode(b"plain text");
        assert!(matches!(decode(&not_json), Err(AppError::InvalidCursor)));
    }

    #[test]
    fn rejects_out_of_range_page_size() {
        for bad in [9, 101, 0, -5] {
            let mut c = cursor();
            c.page_size = bad;
            let encoded = encode(&c).unwrap();
            assert!(matches!(decode(&encoded), Err(AppError::InvalidCursor)));
        }
    }

    #[test]
    fn page_size_bounds() {
        assert!(is_valid_page_size(10));
        assert!(is_valid_page_size(100));
        assert!(!is_valid_page_size(9));
        assert!(!is_valid_page_size(101));
    }
}
