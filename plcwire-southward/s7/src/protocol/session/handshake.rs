use super::{
    super::frame::{tpdu_size_code_for, ConnectionParams, Cotp, S7Message, S7Pdu, SetupCommunication},
    Session,
};
use bytes::Bytes;
use plcwire_sdk::{DriverError, DriverResult};

/// COTP connection request / confirm on the current logical channel.
///
/// Returns the confirm parameters; the TPDU size in them is the one the
/// peer accepted.
pub(super) async fn iso_connect(session: &Session) -> DriverResult<ConnectionParams> {
    let params = session.params.load();
    let cr = ConnectionParams::request(
        params.local_tsap,
        params.remote_tsap,
        tpdu_size_code_for(session.config.tpdu_size),
    );
    tracing::debug!(
        local_tsap = format_args!("{:#06x}", params.local_tsap),
        remote_tsap = format_args!("{:#06x}", params.remote_tsap),
        "sending COTP connection request"
    );
    let reply = session
        .control(S7Message::control(Cotp::Cr(cr)), session.config.request_timeout())
        .await
        .map_err(|e| DriverError::handshake("cotp", e.to_string()))?;
    match reply.cotp {
        Cotp::Cc(cc) => {
            tracing::debug!(tpdu_size = ?cc.tpdu_size_bytes(), "COTP connection confirmed");
            Ok(cc)
        }
        Cotp::Dr { reason, .. } => Err(DriverError::handshake(
            "cotp",
            format!("peer refused the connection (reason {reason:#04x})"),
        )),
        other => Err(DriverError::handshake(
            "cotp",
            format!("expected connection confirm, got {other:?}"),
        )),
    }
}

/// Setup communication: propose PDU size and AMQ values, return what the CPU granted.
pub(super) async fn negotiate(session: &Session) -> DriverResult<SetupCommunication> {
    const STAGE: &str = "setup communication";
    let config = &session.config;
    let proposal = SetupCommunication {
        amq_caller: config.max_amq_caller,
        amq_callee: config.max_amq_callee,
        pdu_len: config.pdu_size,
    };
    let param = proposal.encode();
    let resp = session
        .exchange(config.request_timeout(), |pdu_ref| {
            S7Pdu::job(pdu_ref, param, Bytes::new())
        })
        .await
        .map_err(|e| DriverError::handshake(STAGE, e.to_string()))?;

    let err = resp.header_error();
    if !err.is_ok() {
        return Err(DriverError::handshake(
            STAGE,
            format!("device error class={:#04x} code={:#04x}", err.class, err.code),
        ));
    }
    let agreed = SetupCommunication::parse(&resp.param)
        .map_err(|e| DriverError::handshake(STAGE, e.to_string()))?;
    if agreed.amq_caller == 0 || agreed.pdu_len == 0 {
        return Err(DriverError::handshake(
            STAGE,
            format!("device granted unusable values {agreed:?}"),
        ));
    }
    tracing::debug!(
        amq_caller = agreed.amq_caller,
        amq_callee = agreed.amq_callee,
        pdu_len = agreed.pdu_len,
        "communication parameters negotiated"
    );
    Ok(agreed)
}
