use super::{
    super::frame::{
        message::{parse_szl_response, szl_request_payload},
        types::subfunction,
        CpuFunctionGroup, S7Pdu, UserDataParam,
    },
    check_user_data, Session,
};
use crate::types::ControllerType;
use plcwire_sdk::{DriverError, DriverResult};

/// SZL "module identification"
const SZL_MODULE_ID: u16 = 0x0011;
/// Record carrying the CPU's own MLFB
const MLFB_RECORD_INDEX: u16 = 0x0001;
const MLFB_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Identity {
    pub article_number: String,
    /// `None` when the article number does not name a known family
    pub controller: Option<ControllerType>,
}

/// Read SZL 0x0011 and classify the CPU.
pub(super) async fn identify(session: &Session) -> DriverResult<Option<Identity>> {
    const STAGE: &str = "identification";
    let param =
        UserDataParam::request(CpuFunctionGroup::CpuFunctions, subfunction::READ_SZL, 0).encode();
    let payload = szl_request_payload(SZL_MODULE_ID, 0x0000);
    let resp = session
        .exchange(session.config.request_timeout(), |pdu_ref| {
            S7Pdu::user_data(pdu_ref, param, payload)
        })
        .await
        .map_err(|e| DriverError::handshake(STAGE, e.to_string()))?;
    let (_, items) =
        check_user_data(&resp).map_err(|e| DriverError::handshake(STAGE, e.to_string()))?;
    let Some(item) = items.first() else {
        return Ok(None);
    };
    let identity =
        parse_identity(&item.data).map_err(|e| DriverError::handshake(STAGE, e.to_string()))?;
    match &identity {
        Some(id) => tracing::debug!(
            article = %id.article_number,
            controller = ?id.controller,
            "controller identified"
        ),
        None => tracing::warn!("SZL 0x0011 carried no MLFB record"),
    }
    Ok(identity)
}

pub(super) fn parse_identity(data: &[u8]) -> DriverResult<Option<Identity>> {
    let (_, _, records) = parse_szl_response(data)?;
    Ok(records
        .iter()
        .find(|r| r.len() >= 2 + MLFB_LEN && u16::from_be_bytes([r[0], r[1]]) == MLFB_RECORD_INDEX)
        .map(|r| {
            let article_number = String::from_utf8_lossy(&r[2..2 + MLFB_LEN])
                .trim()
                .to_string();
            Identity {
                controller: ControllerType::from_article_number(&article_number),
                article_number,
            }
        }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    /// SZL 0x0011 response body with one record per `(index, mlfb)`.
    pub(crate) fn szl_module_id(records: &[(u16, &str)]) -> Vec<u8> {
        let mut b = BytesMut::new();
        b.put_u16(SZL_MODULE_ID);
        b.put_u16(0x0000);
        b.put_u16(28);
        b.put_u16(records.len() as u16);
        for (index, mlfb) in records {
            b.put_u16(*index);
            let mut name = [b' '; MLFB_LEN];
            name[..mlfb.len()].copy_from_slice(mlfb.as_bytes());
            b.put_slice(&name);
            b.put_slice(&[0x00, 0x00, 0x00, 0x01, 0x00, 0x01]);
        }
        b.to_vec()
    }

    #[test]
    fn picks_the_cpu_record() {
        let data = szl_module_id(&[
            (0x0006, "6ES7 954-8LE03-0AA0"),
            (0x0001, "6ES7 315-2EH14-0AB0"),
        ]);
        let id = parse_identity(&data).unwrap().unwrap();
        assert_eq!(id.article_number, "6ES7 315-2EH14-0AB0");
        assert_eq!(id.controller, Some(ControllerType::S7_300));
    }

    #[test]
    fn unknown_family_keeps_article() {
        let data = szl_module_id(&[(0x0001, "6ES7 151-8AB01-0AB0")]);
        let id = parse_identity(&data).unwrap().unwrap();
        assert_eq!(id.controller, None);
    }

    #[test]
    fn missing_record_is_not_an_error() {
        let data = szl_module_id(&[(0x0006, "6ES7 954-8LE03-0AA0")]);
        assert_eq!(parse_identity(&data).unwrap(), None);
    }
}
