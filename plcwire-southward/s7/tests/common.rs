#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use plcwire_driver_s7::{
    protocol::{
        codec::Codec,
        frame::{
            ConnectionParams, Cotp, CpuFunctionGroup, CpuFunctionType, DataItem,
            DataTransportSize, HeaderError, S7Message, S7Pdu, S7PduType, SetupCommunication,
            UserDataParam,
        },
    },
    ControllerType, MemoryTransportFactory, S7ConnectionConfig, TsapConfig,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, Once,
};
use tokio::{io::DuplexStream, select, sync::mpsc};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::Level;

pub const PRIMARY: &str = "plc-a:102";
pub const SECONDARY: &str = "plc-b:102";

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .without_time()
            .with_test_writer()
            .try_init();
    });
}

/// Config pointing at the in-memory peers with short supervision timings.
pub fn config(controller: ControllerType) -> S7ConnectionConfig {
    S7ConnectionConfig {
        primary: PRIMARY.into(),
        tsap: TsapConfig::Tsap {
            local: 0x0100,
            remote: 0x0102,
        },
        controller_type: controller,
        supervision_tick_ms: 100,
        retry_interval_ms: 400,
        ..Default::default()
    }
}

/// Builds the reply to a ReadVar/WriteVar job.
pub type Responder = Arc<dyn Fn(&S7Pdu) -> S7Pdu + Send + Sync>;

#[derive(Clone)]
pub struct Profile {
    pub amq: u16,
    pub pdu_len: u16,
    /// MLFB reported through SZL 0x0011
    pub article: Option<String>,
    /// Answer the connection request with a disconnect request
    pub refuse: bool,
    /// Jobs go to [`MockPlc::requests`] when unset
    pub responder: Option<Responder>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            amq: 3,
            pdu_len: 480,
            article: Some("6ES7 315-2EH14-0AB0".into()),
            refuse: false,
            responder: None,
        }
    }
}

impl Profile {
    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&S7Pdu) -> S7Pdu + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(f));
        self
    }
}

/// A ReadVar/WriteVar job held for the test to answer.
pub struct Request {
    pub pdu: S7Pdu,
    reply: mpsc::UnboundedSender<S7Message>,
}

impl Request {
    pub fn respond(&self, pdu: S7Pdu) {
        let _ = self.reply.send(S7Message::data(pdu));
    }
}

#[derive(Default)]
struct Stats {
    connections: AtomicUsize,
    setups: AtomicUsize,
    user_data: AtomicUsize,
}

type Peers = Arc<Mutex<Vec<(CancellationToken, mpsc::UnboundedSender<S7Message>)>>>;

/// Scripted S7 CPU listening on one in-memory address.
pub struct MockPlc {
    pub requests: mpsc::UnboundedReceiver<Request>,
    stats: Arc<Stats>,
    peers: Peers,
}

impl MockPlc {
    pub fn listen(factory: &MemoryTransportFactory, address: &str, profile: Profile) -> Self {
        let mut incoming = factory.listen(address);
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let stats = Arc::new(Stats::default());
        let peers: Peers = Arc::default();
        let profile = Arc::new(profile);
        {
            let stats = Arc::clone(&stats);
            let peers = Arc::clone(&peers);
            tokio::spawn(async move {
                while let Some(io) = incoming.recv().await {
                    stats.connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        io,
                        Arc::clone(&profile),
                        Arc::clone(&stats),
                        Arc::clone(&peers),
                        requests_tx.clone(),
                    ));
                }
            });
        }
        Self {
            requests,
            stats,
            peers,
        }
    }

    /// Close every open connection, as a CPU reset would.
    pub fn drop_connections(&self) {
        for (cancel, _) in self.peers.lock().unwrap().drain(..) {
            cancel.cancel();
        }
    }

    /// Send an unsolicited PDU on every open connection.
    pub fn push(&self, pdu: S7Pdu) {
        for (_, tx) in self.peers.lock().unwrap().iter() {
            let _ = tx.send(S7Message::data(pdu.clone()));
        }
    }

    pub fn connections(&self) -> usize {
        self.stats.connections.load(Ordering::SeqCst)
    }

    /// Setup-communication requests answered so far.
    pub fn setups(&self) -> usize {
        self.stats.setups.load(Ordering::SeqCst)
    }

    /// User-data requests other than SZL reads.
    pub fn user_data_requests(&self) -> usize {
        self.stats.user_data.load(Ordering::SeqCst)
    }
}

async fn serve(
    io: DuplexStream,
    profile: Arc<Profile>,
    stats: Arc<Stats>,
    peers: Peers,
    requests: mpsc::UnboundedSender<Request>,
) {
    let (mut sink, mut stream) = Framed::new(io, Codec).split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    peers.lock().unwrap().push((cancel.clone(), tx.clone()));
    loop {
        select! {
            _ = cancel.cancelled() => break,
            out = rx.recv() => match out {
                Some(msg) => {
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(msg)) => handle(msg, &profile, &stats, &tx, &requests),
                _ => break,
            },
        }
    }
}

fn handle(
    msg: S7Message,
    profile: &Profile,
    stats: &Stats,
    tx: &mpsc::UnboundedSender<S7Message>,
    requests: &mpsc::UnboundedSender<Request>,
) {
    let reply = |pdu: S7Pdu| {
        let _ = tx.send(S7Message::data(pdu));
    };
    if let Cotp::Cr(cr) = &msg.cotp {
        let answer = if profile.refuse {
            Cotp::Dr {
                dst_ref: cr.src_ref,
                src_ref: 0x0001,
                reason: 0x80,
            }
        } else {
            Cotp::Cc(ConnectionParams {
                dst_ref: cr.src_ref,
                src_ref: 0x0001,
                class: 0x00,
                tpdu_size: Some(0x0A),
                calling_tsap: cr.calling_tsap,
                called_tsap: cr.called_tsap,
            })
        };
        let _ = tx.send(S7Message::control(answer));
        return;
    }
    let Some(pdu) = msg.into_pdu() else {
        return;
    };
    match pdu.header.pdu_type {
        S7PduType::Job if pdu.param.first() == Some(&0xF0) => {
            stats.setups.fetch_add(1, Ordering::SeqCst);
            let agreed = SetupCommunication {
                amq_caller: profile.amq,
                amq_callee: profile.amq,
                pdu_len: profile.pdu_len,
            };
            reply(S7Pdu::ack_data(pdu.pdu_ref(), agreed.encode(), Bytes::new()));
        }
        S7PduType::Job => match &profile.responder {
            Some(responder) => reply(responder(&pdu)),
            None => {
                let _ = requests.send(Request {
                    pdu,
                    reply: tx.clone(),
                });
            }
        },
        S7PduType::UserData => {
            let Ok(param) = UserDataParam::parse(&pdu.param) else {
                return;
            };
            let group = param.group;
            let body = if group == CpuFunctionGroup::CpuFunctions as u8 && param.subfunction == 0x01 {
                szl_module_id(profile.article.as_deref())
            } else {
                stats.user_data.fetch_add(1, Ordering::SeqCst);
                vec![0x02]
            };
            let sequence = if group == CpuFunctionGroup::CyclicServices as u8 {
                0x07
            } else {
                param.sequence
            };
            reply(user_data_reply(&pdu, param, sequence, &body));
        }
        _ => {}
    }
}

fn user_data_reply(req: &S7Pdu, param: UserDataParam, sequence: u8, body: &[u8]) -> S7Pdu {
    let param = UserDataParam {
        method: 0x12,
        kind: CpuFunctionType::Response,
        sequence,
        error_code: 0,
        ..param
    };
    let mut d = BytesMut::new();
    DataItem::ok(DataTransportSize::OctetString, Bytes::copy_from_slice(body))
        .encode_to(&mut d, true);
    S7Pdu::user_data(req.pdu_ref(), param.encode(), d.freeze())
}

/// SZL 0x0011 body with the CPU record when `article` is set.
fn szl_module_id(article: Option<&str>) -> Vec<u8> {
    let mut b = BytesMut::new();
    b.put_u16(0x0011);
    b.put_u16(0x0000);
    b.put_u16(28);
    b.put_u16(u16::from(article.is_some()));
    if let Some(mlfb) = article {
        b.put_u16(0x0001);
        let mut name = [b' '; 20];
        name[..mlfb.len()].copy_from_slice(mlfb.as_bytes());
        b.put_slice(&name);
        b.put_slice(&[0x00, 0x00, 0x00, 0x01, 0x00, 0x01]);
    }
    b.to_vec()
}

/// Number of items a ReadVar/WriteVar job carries.
pub fn item_count(req: &S7Pdu) -> usize {
    req.param.get(1).copied().unwrap_or(0) as usize
}

pub fn byte_item(data: &[u8]) -> DataItem {
    DataItem::ok(
        DataTransportSize::ByteWordDWord,
        Bytes::copy_from_slice(data),
    )
}

pub fn read_reply(req: &S7Pdu, items: &[DataItem]) -> S7Pdu {
    let mut d = BytesMut::new();
    for (idx, item) in items.iter().enumerate() {
        item.encode_to(&mut d, idx + 1 == items.len());
    }
    S7Pdu::ack_data(
        req.pdu_ref(),
        Bytes::copy_from_slice(&[0x04, items.len() as u8]),
        d.freeze(),
    )
}

pub fn write_reply(req: &S7Pdu, codes: &[u8]) -> S7Pdu {
    S7Pdu::ack_data(
        req.pdu_ref(),
        Bytes::copy_from_slice(&[0x05, codes.len() as u8]),
        Bytes::copy_from_slice(codes),
    )
}

pub fn error_reply(req: &S7Pdu, class: u8, code: u8) -> S7Pdu {
    let mut pdu = S7Pdu::ack_data(req.pdu_ref(), Bytes::copy_from_slice(&req.param[..1]), Bytes::new());
    pdu.header.error = Some(HeaderError { class, code });
    pdu
}

/// Unsolicited mode-transition push (CPU now in RUN).
pub fn mode_run_push() -> S7Pdu {
    let param = UserDataParam {
        method: 0x12,
        kind: CpuFunctionType::Push,
        group: CpuFunctionGroup::ModeTransition as u8,
        subfunction: 0x02,
        sequence: 0,
        error_code: 0,
    };
    S7Pdu::user_data(0, param.encode(), Bytes::new())
}
