use super::frame::{Cotp, S7AppBody, S7Message, S7Pdu, Tpkt};
use bytes::{BufMut, BytesMut};
use plcwire_sdk::{WireDecode, WireEncode};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// RFC1006 (TPKT) + COTP + S7 framing
#[derive(Debug, Default, Clone)]
pub struct Codec;

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl Decoder for Codec {
    type Item = S7Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        if src[0] != 0x03 || src[1] != 0x00 {
            return Err(invalid("invalid TPKT header".into()));
        }
        let length = u16::from_be_bytes([src[2], src[3]]) as usize;
        if length < 7 {
            return Err(invalid(format!("invalid TPKT length {length}")));
        }
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let frame = src.split_to(length).freeze();
        let (_, tpkt) = Tpkt::parse(&frame, &frame, &()).map_err(|e| invalid(e.to_string()))?;
        let (user, cotp) =
            Cotp::parse(&frame[4..], &frame, &()).map_err(|e| invalid(format!("cotp: {e}")))?;

        let app = match &cotp {
            Cotp::D { eot, .. } if !user.is_empty() => {
                let user_bytes = frame.slice_ref(user);
                if !*eot {
                    Some(S7AppBody::Segmented(user_bytes))
                } else {
                    match S7Pdu::parse(user, &frame, &()) {
                        Ok((_, pdu)) => Some(S7AppBody::Parsed(pdu)),
                        Err(e) => {
                            tracing::debug!(error = %e, "S7 payload did not parse, keeping raw bytes");
                            Some(S7AppBody::Segmented(user_bytes))
                        }
                    }
                }
            }
            _ => None,
        };
        Ok(Some(S7Message { tpkt, cotp, app }))
    }
}

impl Encoder<S7Message> for Codec {
    type Error = io::Error;

    fn encode(&mut self, item: S7Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let cotp_len = item.cotp.encoded_len(&());
        let app_len = match (&item.cotp, &item.app) {
            (Cotp::D { .. }, Some(S7AppBody::Segmented(b))) => b.len(),
            (Cotp::D { .. }, Some(S7AppBody::Parsed(p))) => p.encoded_len(&()),
            _ => 0,
        };
        let tpkt = Tpkt::for_payload(cotp_len + app_len);
        dst.reserve(tpkt.length as usize);

        tpkt.encode_to(dst, &()).map_err(|e| invalid(e.to_string()))?;
        item.cotp
            .encode_to(dst, &())
            .map_err(|e| invalid(e.to_string()))?;
        match (item.cotp, item.app) {
            (Cotp::D { .. }, Some(S7AppBody::Segmented(b))) => dst.put_slice(&b),
            (Cotp::D { .. }, Some(S7AppBody::Parsed(p))) => {
                p.encode_to(dst, &()).map_err(|e| invalid(e.to_string()))?
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::frame::{ConnectionParams, SetupCommunication};
    use super::*;

    #[test]
    fn encodes_and_decodes_setup_job() {
        let pdu = S7Pdu::job(
            10,
            SetupCommunication {
                amq_caller: 8,
                amq_callee: 8,
                pdu_len: 960,
            }
            .encode(),
            bytes::Bytes::new(),
        );
        let mut buf = BytesMut::new();
        Codec.encode(S7Message::data(pdu.clone()), &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0x03, 0x00, 0x00, 25]);

        let msg = Codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(msg.pdu(), Some(&pdu));
    }

    #[test]
    fn waits_for_complete_frame() {
        let mut full = BytesMut::new();
        Codec
            .encode(
                S7Message::control(Cotp::Cr(ConnectionParams::request(0x100, 0x102, 0x0A))),
                &mut full,
            )
            .unwrap();
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(Codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 1..]);
        let msg = Codec.decode(&mut partial).unwrap().unwrap();
        assert!(matches!(msg.cotp, Cotp::Cr(_)));
        assert!(msg.app.is_none());
    }

    #[test]
    fn rejects_garbage() {
        let mut buf = BytesMut::from(&[0x04, 0x00, 0x00, 0x10][..]);
        assert!(Codec.decode(&mut buf).is_err());
    }
}
