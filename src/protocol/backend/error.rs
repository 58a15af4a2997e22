//! ErrorResponse and NoticeResponse parsing.
//!
//! Both messages are a list of `(field code byte, C-string value)` pairs
//! closed by a zero byte, and both land in the same [`PgError`] structure;
//! whether it is an error or a notice is decided by the tag byte upstream.

use crate::error::{PgError, Result};
use crate::protocol::codec::Scan;

/// Parse an ErrorResponse ('E') payload.
pub fn parse_error(payload: &[u8]) -> Result<PgError> {
    parse_fields(payload)
}

/// Parse a NoticeResponse ('N') payload.
pub fn parse_notice(payload: &[u8]) -> Result<PgError> {
    parse_fields(payload)
}

fn parse_fields(payload: &[u8]) -> Result<PgError> {
    let mut scan = Scan::new(payload);
    let mut fields = PgError::default();
    loop {
        let code = scan.u8()?;
        if code == 0 {
            break;
        }
        apply_field(&mut fields, code, scan.cstr()?);
    }
    Ok(fields)
}

/// Route one field into its slot. Numeric fields parse leniently; codes
/// this client does not know are skipped so newer servers stay readable.
fn apply_field(fields: &mut PgError, code: u8, value: &str) {
    let slot = match code {
        b'S' => &mut fields.severity,
        b'V' => &mut fields.severity_non_localized,
        b'C' => &mut fields.code,
        b'M' => &mut fields.message,
        b'D' => &mut fields.detail,
        b'H' => &mut fields.hint,
        b'q' => &mut fields.internal_query,
        b'W' => &mut fields.where_,
        b's' => &mut fields.schema,
        b't' => &mut fields.table,
        b'c' => &mut fields.column,
        b'd' => &mut fields.data_type,
        b'n' => &mut fields.constraint,
        b'F' => &mut fields.file,
        b'R' => &mut fields.routine,
        b'P' => {
            fields.position = value.parse().ok();
            return;
        }
        b'p' => {
            fields.internal_position = value.parse().ok();
            return;
        }
        b'L' => {
            fields.line = value.parse().ok();
            return;
        }
        other => {
            tracing::debug!("ignoring unknown error field '{}'", other as char);
            return;
        }
    };
    *slot = Some(value.to_string());
}
