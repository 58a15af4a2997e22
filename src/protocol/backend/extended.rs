//! Extended-protocol backend messages that carry a payload.
//!
//! The completion markers of this protocol family (ParseComplete,
//! BindComplete, CloseComplete, NoData, PortalSuspended) are empty; the
//! connection handles them by tag byte without decoding anything.

use crate::error::Result;
use crate::protocol::codec::Scan;
use crate::protocol::types::Oid;

/// ParameterDescription ('t'): OIDs of a described statement's parameters.
#[derive(Debug, Clone)]
pub struct ParameterDescription {
    pub param_oids: Vec<Oid>,
}

impl ParameterDescription {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut scan = Scan::new(payload);
        let count = scan.i16()?.max(0);
        let param_oids = (0..count).map(|_| scan.u32()).collect::<Result<_>>()?;
        Ok(Self { param_oids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_list_round_trips() {
        let mut payload = 2_i16.to_be_bytes().to_vec();
        payload.extend_from_slice(&23_u32.to_be_bytes());
        payload.extend_from_slice(&25_u32.to_be_bytes());
        let desc = ParameterDescription::parse(&payload).unwrap();
        assert_eq!(desc.param_oids, vec![23, 25]);
    }

    #[test]
    fn zero_parameters_is_fine() {
        let payload = 0_i16.to_be_bytes();
        assert!(
            ParameterDescription::parse(&payload)
                .unwrap()
                .param_oids
                .is_empty()
        );
    }

    #[test]
    fn truncated_oid_list_is_rejected() {
        let mut payload = 2_i16.to_be_bytes().to_vec();
        payload.extend_from_slice(&23_u32.to_be_bytes());
        assert!(ParameterDescription::parse(&payload).is_err());
    }
}
