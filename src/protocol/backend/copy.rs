//! COPY sub-protocol backend messages.
//!
//! CopyInResponse ('G') and CopyOutResponse ('H') share one payload
//! layout, so a single type covers both directions.

use crate::error::Result;
use crate::protocol::codec::Scan;
use crate::protocol::types::FormatCode;

/// Header opening a COPY transfer in either direction.
#[derive(Debug, Clone)]
pub struct CopyResponse {
    /// Overall format (0=text, 1=binary)
    pub format: FormatCode,
    /// Per-column format codes
    pub column_formats: Vec<FormatCode>,
}

impl CopyResponse {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut scan = Scan::new(payload);
        let format = FormatCode::from_u16(scan.u8()? as u16);
        let column_count = scan.u16()?;
        let column_formats = (0..column_count)
            .map(|_| scan.u16().map(FormatCode::from_u16))
            .collect::<Result<_>>()?;
        Ok(Self {
            format,
            column_formats,
        })
    }

    pub fn is_binary(&self) -> bool {
        matches!(self.format, FormatCode::Binary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_copy_with_mixed_columns() {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&2_u16.to_be_bytes());
        payload.extend_from_slice(&0_u16.to_be_bytes());
        payload.extend_from_slice(&1_u16.to_be_bytes());

        let response = CopyResponse::parse(&payload).unwrap();
        assert!(!response.is_binary());
        assert_eq!(
            response.column_formats,
            vec![FormatCode::Text, FormatCode::Binary]
        );
    }

    #[test]
    fn truncated_column_list_is_rejected() {
        let mut payload = vec![1u8];
        payload.extend_from_slice(&3_u16.to_be_bytes());
        payload.extend_from_slice(&1_u16.to_be_bytes());
        assert!(CopyResponse::parse(&payload).is_err());
    }
}
