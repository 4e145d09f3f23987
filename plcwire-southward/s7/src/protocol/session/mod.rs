//! S7 session: handshake state machine plus request/response correlation.
//!
//! One I/O loop task owns the inflight table. Callers take a slot from the
//! [`AdmissionGate`], hand the request to the loop and await a oneshot. The
//! loop matches responses by PDU reference, expires deadlines, and passes
//! pushed user data to the [`EventPipeline`] without waiting on it.
//!
//! Handshake exchanges bypass the gate. Until a handshake completes the gate
//! is suspended and the loop is held, so no application request reaches a
//! link before setup communication has been agreed on it.
mod handshake;
mod identify;
mod state;

pub use state::{
    ItemStatus, Lifecycle, ReadResult, SessionEvent, SessionParams, SessionState, Subscription,
    SubscriptionRequest,
};

use super::{
    events::{is_push, EventPipeline, PipelineCapacity},
    frame::{
        decode_tag_value, encode_tag_value,
        message::{
            cyclic_subscribe_payload, cyclic_unsubscribe_payload, message_service_payload,
            parse_data_items, parse_var_response_param, parse_write_response, read_var_param,
            write_var_request,
        },
        parse_tag,
        types::subfunction,
        Cotp, CpuFunctionGroup, DataItem, S7AppBody, S7DataValue, S7Message, S7Pdu, S7PduType,
        S7ReturnCode, S7Tag, UserDataParam,
    },
    mux::{ChannelEvent, LinkMultiplexer, MuxConfig, TransportFactory},
    planner::{plan_read, plan_write, PlannerConfig},
    transaction::{AdmissionGate, Ticket},
};
use crate::types::{ControllerType, EventCategory, S7ConnectionConfig};
use arc_swap::ArcSwap;
use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use plcwire_sdk::{DriverError, DriverResult, WireDecode};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, PoisonError, Weak,
    },
    time::Duration,
};
use tokio::{
    select,
    sync::{broadcast, mpsc, oneshot, Mutex},
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;

/// Parks the deadline timer when nothing is pending.
const FAR_FUTURE: Duration = Duration::from_secs(3600);
const ALARM_BIT: u8 = 0x80;

/// Work for the I/O loop.
#[derive(Debug)]
enum LoopCommand {
    /// Correlated request; the PDU already carries the ticket's reference
    Transaction {
        pdu: S7Pdu,
        ticket: Ticket,
        timeout: Duration,
        reply: oneshot::Sender<DriverResult<S7Pdu>>,
    },
    /// Control TPDU answered by the next non-data TPDU (COTP CR/CC)
    Control {
        msg: S7Message,
        timeout: Duration,
        reply: oneshot::Sender<DriverResult<S7Message>>,
    },
    /// A new link took over: strand what the old one owes and refuse
    /// metered requests until `Release`
    Hold { done: oneshot::Sender<()> },
    Release,
}

/// Entry stored for each inflight request.
///
/// Holding the ticket keeps both the admission slot and the PDU reference
/// reserved; dropping the entry on any outcome releases them.
#[derive(Debug)]
struct InflightEntry {
    tx: oneshot::Sender<DriverResult<S7Pdu>>,
    deadline: Instant,
    timeout: Duration,
    _ticket: Ticket,
}

#[derive(Debug)]
struct PendingControl {
    tx: oneshot::Sender<DriverResult<S7Message>>,
    deadline: Instant,
    timeout: Duration,
}

#[derive(Debug, Default)]
struct SubscriptionSet {
    /// Message-service bits currently requested from the CPU
    mask: u8,
    cyclic_jobs: Vec<u8>,
}

/// One logical S7 connection.
pub struct Session {
    config: Arc<S7ConnectionConfig>,
    gate: AdmissionGate,
    commands: mpsc::Sender<LoopCommand>,
    lifecycle: Lifecycle,
    params: ArcSwap<SessionParams>,
    pipeline: Arc<EventPipeline>,
    mux: LinkMultiplexer,
    /// Serializes subscription changes; the mask is read-modify-write
    subscriptions: Mutex<SubscriptionSet>,
    /// Whether `Connected`/`Reconnected` was announced without a matching `Disconnected`
    link_up: AtomicBool,
    closed: AtomicBool,
    last_error: StdMutex<Option<DriverError>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.lifecycle.state())
            .field("params", &**self.params.load())
            .field("gate", &self.gate)
            .finish()
    }
}

impl Session {
    /// Open the logical channel and run the handshake on it.
    ///
    /// A failed handshake closes every link and is returned as-is; nothing
    /// is retried here.
    pub async fn connect(
        config: Arc<S7ConnectionConfig>,
        factory: Arc<dyn TransportFactory>,
        lifecycle: Lifecycle,
    ) -> DriverResult<Arc<Self>> {
        config.validate()?;
        let tsap = config.tsap_pair()?;
        lifecycle.set_state(SessionState::Handshaking);

        let mux_config = MuxConfig {
            primary: config.primary.clone(),
            secondary: config.secondary.clone(),
            tick: config.supervision_tick(),
            retry_interval: config.retry_interval(),
            watchdog: config.watchdog(),
            keep_alive: config.keep_alive_interval(),
            link_retry: config.link_retry,
        };
        let (mux, inbound) = match LinkMultiplexer::open(mux_config, factory).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "no link could be opened");
                lifecycle.set_state(SessionState::Disconnected);
                return Err(e);
            }
        };
        let channel_events = mux.subscribe();

        let pipeline = Arc::new(EventPipeline::start(PipelineCapacity {
            raw: config.event_queue_capacity,
            dispatch: config.dispatch_queue_capacity,
            lane: config.subscriber_queue_capacity,
        }));
        let (commands_tx, commands_rx) = mpsc::channel(256);
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        // Nothing may run concurrently before negotiation.
        let gate = AdmissionGate::new(1);
        gate.suspend();

        let io = IoLoop {
            commands: commands_rx,
            inbound,
            outbound: mux.sender(),
            pipeline: Arc::clone(&pipeline),
            fatal: fatal_tx,
            inflight: HashMap::with_capacity(16),
            stranded: HashMap::new(),
            timeouts: BTreeMap::new(),
            held: true,
            control: None,
            reasm: None,
        };
        tokio::spawn(io.run(cancel.child_token()));

        let params = SessionParams {
            local_tsap: tsap.local,
            remote_tsap: tsap.remote,
            tpdu_size: config.tpdu_size,
            pdu_size: config.pdu_size,
            amq_caller: config.max_amq_caller,
            amq_callee: config.max_amq_callee,
            controller_type: config.controller_type,
            article_number: None,
        };
        let session = Arc::new(Self {
            config,
            gate,
            commands: commands_tx,
            lifecycle,
            params: ArcSwap::from_pointee(params),
            pipeline,
            mux,
            subscriptions: Mutex::default(),
            link_up: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_error: StdMutex::new(None),
            cancel,
        });

        if let Err(e) = session.establish().await {
            tracing::error!(error = %e, "connect failed");
            session.teardown(Some(e.clone())).await;
            return Err(e);
        }
        session.mark_up(SessionEvent::Connected);
        tokio::spawn(run_supervision(
            Arc::downgrade(&session),
            channel_events,
            fatal_rx,
            session.cancel.clone(),
        ));
        Ok(session)
    }

    /// Handshake (nothing at all in passive mode), then open admissions.
    ///
    /// Expects the gate suspended and the I/O loop held.
    async fn establish(&self) -> DriverResult<()> {
        let capacity = if self.config.passive {
            tracing::debug!("passive mode, skipping handshake");
            self.config.max_amq_caller
        } else {
            self.handshake().await?
        };
        self.commands
            .send(LoopCommand::Release)
            .await
            .map_err(|_| DriverError::NotConnected)?;
        self.gate.set_capacity(capacity as usize);
        Ok(())
    }

    /// COTP connect, setup communication and, for `Any`, identification.
    /// Returns the granted caller AMQ.
    async fn handshake(&self) -> DriverResult<u16> {
        self.lifecycle.set_state(SessionState::Handshaking);
        let cc = handshake::iso_connect(self).await?;

        self.lifecycle.set_state(SessionState::Negotiating);
        let agreed = handshake::negotiate(self).await?;

        let mut params = SessionParams::clone(&self.params.load());
        params.tpdu_size = cc.tpdu_size_bytes().unwrap_or(params.tpdu_size);
        params.pdu_size = agreed.pdu_len;
        params.amq_caller = agreed.amq_caller;
        params.amq_callee = agreed.amq_callee;
        self.params.store(Arc::new(params.clone()));

        if params.controller_type == ControllerType::Any {
            self.lifecycle.set_state(SessionState::Identifying);
            if let Some(id) = identify::identify(self).await? {
                params.controller_type = id.controller.unwrap_or(ControllerType::Any);
                params.article_number = Some(id.article_number);
                self.params.store(Arc::new(params));
            }
        }
        Ok(agreed.amq_caller)
    }

    /// Park admissions and strand requests still owed by the previous link.
    async fn hold(&self) {
        self.gate.suspend();
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(LoopCommand::Hold { done: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    fn mark_up(&self, event: SessionEvent) {
        self.link_up.store(true, Ordering::Release);
        self.lifecycle.set_state(SessionState::Connected);
        let params = self.params.load();
        tracing::info!(
            controller = %params.controller_type,
            pdu_size = params.pdu_size,
            amq = params.amq_caller,
            ?event,
            "session connected"
        );
        self.lifecycle.emit(event);
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::Acquire) {
            SessionState::Disconnected
        } else {
            self.lifecycle.state()
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn params(&self) -> SessionParams {
        SessionParams::clone(&self.params.load())
    }

    #[inline]
    pub fn controller_type(&self) -> ControllerType {
        self.params.load().controller_type
    }

    pub fn pipeline(&self) -> &Arc<EventPipeline> {
        &self.pipeline
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Error that ended or last degraded this session. Falls back to a
    /// subscriber lane overflow, which loses events without ending anything.
    pub fn last_error(&self) -> Option<DriverError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .or_else(|| self.pipeline.lane_overflow())
    }

    fn record_error(&self, e: DriverError) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(e);
    }

    fn ensure_connected(&self) -> DriverResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DriverError::NotConnected)
        }
    }

    /// Admit, send and await one correlated request.
    ///
    /// Waiting for a slot is unbounded; `timeout` starts once the request is
    /// handed to the I/O loop.
    async fn transact<F>(&self, timeout: Duration, build: F) -> DriverResult<S7Pdu>
    where
        F: FnOnce(u16) -> S7Pdu,
    {
        let ticket = self.gate.acquire().await?;
        self.dispatch(ticket, timeout, build).await
    }

    /// Correlated handshake request. Takes no admission slot.
    async fn exchange<F>(&self, timeout: Duration, build: F) -> DriverResult<S7Pdu>
    where
        F: FnOnce(u16) -> S7Pdu,
    {
        let ticket = self.gate.unmetered()?;
        self.dispatch(ticket, timeout, build).await
    }

    async fn dispatch<F>(&self, ticket: Ticket, timeout: Duration, build: F) -> DriverResult<S7Pdu>
    where
        F: FnOnce(u16) -> S7Pdu,
    {
        let pdu = build(ticket.pdu_ref());
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(LoopCommand::Transaction {
                pdu,
                ticket,
                timeout,
                reply: tx,
            })
            .await
            .map_err(|_| DriverError::NotConnected)?;
        rx.await.map_err(|_| DriverError::NotConnected)?
    }

    async fn control(&self, msg: S7Message, timeout: Duration) -> DriverResult<S7Message> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(LoopCommand::Control {
                msg,
                timeout,
                reply: tx,
            })
            .await
            .map_err(|_| DriverError::NotConnected)?;
        rx.await.map_err(|_| DriverError::NotConnected)?
    }

    fn planner(&self) -> PlannerConfig {
        PlannerConfig::new(self.params.load().pdu_size)
    }

    /// Read `tags`; results come back in request order.
    pub async fn read(&self, tags: &[S7Tag]) -> DriverResult<Vec<ReadResult>> {
        self.ensure_connected()?;
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let batches = plan_read(&self.planner(), tags)?;
        let parts = try_join_all(batches.into_iter().map(|r| self.read_batch(&tags[r]))).await?;
        Ok(parts.into_iter().flatten().collect())
    }

    async fn read_batch(&self, tags: &[S7Tag]) -> DriverResult<Vec<ReadResult>> {
        let param = read_var_param(tags);
        let resp = self
            .transact(self.config.request_timeout(), |pdu_ref| {
                S7Pdu::job(pdu_ref, param, Bytes::new())
            })
            .await?;

        let err = resp.header_error();
        if err.is_access_denied() {
            tracing::warn!("CPU refused PUT/GET access");
            return Ok(tags
                .iter()
                .map(|tag| ReadResult {
                    tag: tag.clone(),
                    status: ItemStatus::AccessDenied,
                    value: None,
                })
                .collect());
        }
        if !err.is_ok() {
            return Err(DriverError::Device {
                class: err.class,
                code: err.code,
            });
        }
        let (_, count) = parse_var_response_param(&resp.param)?;
        check_count("read", tags.len(), count as usize)?;
        let items = parse_data_items(&resp.payload)?;
        check_count("read", tags.len(), items.len())?;

        Ok(tags
            .iter()
            .zip(items)
            .map(|(tag, item)| {
                let (status, value) = match ItemStatus::from(item.return_code) {
                    ItemStatus::Ok => match decode_tag_value(tag, &item.data) {
                        Ok(v) => (ItemStatus::Ok, Some(v)),
                        Err(e) => {
                            tracing::warn!(%tag, error = %e, "item did not decode");
                            (ItemStatus::InternalError, None)
                        }
                    },
                    other => (other, None),
                };
                ReadResult {
                    tag: tag.clone(),
                    status,
                    value,
                }
            })
            .collect())
    }

    /// Write values; one status per item in request order.
    ///
    /// Every value is encoded before anything is sent, so a codec error
    /// never leaves a partial write behind.
    pub async fn write(&self, items: &[(S7Tag, S7DataValue)]) -> DriverResult<Vec<ItemStatus>> {
        self.ensure_connected()?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let encoded = items
            .iter()
            .map(|(tag, value)| encode_tag_value(tag, value).map(|data| (tag, data)))
            .collect::<Result<Vec<_>, _>>()?;
        let batches = plan_write(&self.planner(), &encoded)?;
        let parts =
            try_join_all(batches.into_iter().map(|r| self.write_batch(&encoded[r]))).await?;
        Ok(parts.into_iter().flatten().collect())
    }

    async fn write_batch(&self, items: &[(&S7Tag, Bytes)]) -> DriverResult<Vec<ItemStatus>> {
        let (param, data) = write_var_request(items);
        let resp = self
            .transact(self.config.request_timeout(), |pdu_ref| {
                S7Pdu::job(pdu_ref, param, data)
            })
            .await?;

        let err = resp.header_error();
        if err.is_access_denied() {
            tracing::warn!("CPU refused PUT/GET access");
            return Ok(vec![ItemStatus::AccessDenied; items.len()]);
        }
        if !err.is_ok() {
            return Err(DriverError::Device {
                class: err.class,
                code: err.code,
            });
        }
        let (_, count) = parse_var_response_param(&resp.param)?;
        check_count("write", items.len(), count as usize)?;
        let codes = parse_write_response(&resp.payload);
        check_count("write", items.len(), codes.len())?;
        Ok(codes.into_iter().map(ItemStatus::from).collect())
    }

    /// Subscribe to event categories and cyclic data.
    ///
    /// Every request is checked against the controller's capability table
    /// before anything is sent.
    pub async fn subscribe(
        &self,
        requests: &[SubscriptionRequest],
    ) -> DriverResult<Vec<Subscription>> {
        self.ensure_connected()?;
        let controller = self.controller_type();
        for req in requests {
            match req {
                SubscriptionRequest::Event(EventCategory::Cyclic) => {
                    return Err(DriverError::UnsupportedOperation(
                        "cyclic data is subscribed with a tag list".into(),
                    ));
                }
                SubscriptionRequest::Cyclic { tags, .. } if tags.is_empty() => {
                    return Err(DriverError::InvalidAddress(
                        "cyclic subscription without tags".into(),
                    ));
                }
                _ => {}
            }
            let category = request_category(req);
            if !controller.supports(category) {
                return Err(DriverError::UnsupportedOperation(format!(
                    "{} events are not supported by {controller}",
                    category.short_name()
                )));
            }
        }

        let mut set = self.subscriptions.lock().await;
        let added = requests
            .iter()
            .filter_map(|r| match r {
                SubscriptionRequest::Event(c) => c.message_service_bit(),
                SubscriptionRequest::Cyclic { .. } => None,
            })
            .fold(0u8, |mask, bit| mask | bit);
        if set.mask | added != set.mask {
            let mask = set.mask | added;
            self.set_message_mask(mask).await?;
            set.mask = mask;
        }

        let mut out = Vec::with_capacity(requests.len());
        for req in requests {
            match req {
                SubscriptionRequest::Event(category) => out.push(Subscription::Event(*category)),
                SubscriptionRequest::Cyclic { tags, period } => {
                    let job_id = self.cyclic_subscribe(tags, *period).await?;
                    set.cyclic_jobs.push(job_id);
                    out.push(Subscription::Cyclic {
                        job_id,
                        tags: tags.clone(),
                    });
                }
            }
        }
        Ok(out)
    }

    pub async fn unsubscribe(&self, subscriptions: &[Subscription]) -> DriverResult<()> {
        self.ensure_connected()?;
        let mut set = self.subscriptions.lock().await;
        let removed = subscriptions
            .iter()
            .filter_map(|s| match s {
                Subscription::Event(c) => c.message_service_bit(),
                Subscription::Cyclic { .. } => None,
            })
            .fold(0u8, |mask, bit| mask | bit);
        if set.mask & removed != 0 {
            let mask = set.mask & !removed;
            self.set_message_mask(mask).await?;
            set.mask = mask;
        }
        for sub in subscriptions {
            if let Subscription::Cyclic { job_id, .. } = sub {
                self.cyclic_unsubscribe(*job_id).await?;
                set.cyclic_jobs.retain(|j| j != job_id);
            }
        }
        Ok(())
    }

    /// Replace the message-service mask; zero cancels the service.
    async fn set_message_mask(&self, mask: u8) -> DriverResult<()> {
        let param = UserDataParam::request(
            CpuFunctionGroup::CpuFunctions,
            subfunction::MESSAGE_SERVICE,
            0,
        )
        .encode();
        let payload = message_service_payload(mask, mask & ALARM_BIT != 0);
        let resp = self
            .transact(self.config.request_timeout(), |pdu_ref| {
                S7Pdu::user_data(pdu_ref, param, payload)
            })
            .await?;
        check_user_data(&resp)?;
        tracing::debug!(mask = format_args!("{mask:#04x}"), "message service updated");
        Ok(())
    }

    async fn cyclic_subscribe(&self, tags: &[S7Tag], period: Duration) -> DriverResult<u8> {
        let (time_base, factor) = cyclic_timing(period);
        let param = UserDataParam::request(
            CpuFunctionGroup::CyclicServices,
            subfunction::CYCLIC_TRANSFER,
            0,
        )
        .encode();
        let payload = cyclic_subscribe_payload(time_base, factor, tags);
        let resp = self
            .transact(self.config.request_timeout(), |pdu_ref| {
                S7Pdu::user_data(pdu_ref, param, payload)
            })
            .await?;
        let (param, _) = check_user_data(&resp)?;
        let job_id = param.sequence;
        self.pipeline.bind_cyclic_job(job_id, tags.to_vec());
        tracing::debug!(job_id, items = tags.len(), ?period, "cyclic job started");
        Ok(job_id)
    }

    async fn cyclic_unsubscribe(&self, job_id: u8) -> DriverResult<()> {
        let param = UserDataParam::request(
            CpuFunctionGroup::CyclicServices,
            subfunction::CYCLIC_UNSUBSCRIBE,
            0,
        )
        .encode();
        let payload = cyclic_unsubscribe_payload(job_id);
        let resp = self
            .transact(self.config.request_timeout(), |pdu_ref| {
                S7Pdu::user_data(pdu_ref, param, payload)
            })
            .await?;
        check_user_data(&resp)?;
        self.pipeline.unbind_cyclic_job(job_id);
        tracing::debug!(job_id, "cyclic job stopped");
        Ok(())
    }

    /// Read the configured ping tag; returns the round-trip time.
    pub async fn ping(&self) -> DriverResult<Duration> {
        self.ensure_connected()?;
        let tag = parse_tag(&self.config.ping_tag)?;
        let param = read_var_param(std::slice::from_ref(&tag));
        let started = Instant::now();
        self.transact(self.config.ping_timeout(), |pdu_ref| {
            S7Pdu::job(pdu_ref, param, Bytes::new())
        })
        .await?;
        Ok(started.elapsed())
    }

    pub async fn disconnect(&self) {
        self.teardown(None).await;
    }

    /// Close the gate, fail every inflight request, stop the pipeline and the links.
    async fn teardown(&self, error: Option<DriverError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(e) = error {
            self.record_error(e);
        }
        self.lifecycle.set_state(SessionState::Disconnecting);
        self.gate.close();
        self.cancel.cancel();
        self.pipeline.stop();
        if self.link_up.swap(false, Ordering::AcqRel) {
            tracing::info!("session disconnected");
            self.lifecycle.emit(SessionEvent::Disconnected);
        }
        self.mux.close().await;
        self.lifecycle.set_state(SessionState::Disconnected);
    }

    async fn on_channel_event(&self, event: ChannelEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match event {
            ChannelEvent::Reconnected { role } => {
                tracing::info!(%role, "channel switched link, re-running handshake");
                self.lifecycle.set_state(SessionState::Handshaking);
                self.hold().await;
                match self.establish().await {
                    Ok(()) => {
                        self.restore_subscriptions().await;
                        self.mark_up(SessionEvent::Reconnected { role });
                    }
                    Err(e) => {
                        tracing::warn!(%role, error = %e, "handshake on new link failed");
                        self.record_error(e);
                        self.lifecycle.set_state(SessionState::Disconnected);
                        self.mux.drop_active("handshake failed").await;
                    }
                }
            }
            ChannelEvent::Disconnected => {
                self.lifecycle.set_state(SessionState::Disconnected);
                if self.link_up.swap(false, Ordering::AcqRel) {
                    tracing::warn!("logical channel lost");
                    self.lifecycle.emit(SessionEvent::Disconnected);
                }
            }
            ChannelEvent::KeepAliveDue => {
                if !self.is_connected() {
                    return;
                }
                match self.ping().await {
                    Ok(rtt) => tracing::trace!(?rtt, "keep-alive answered"),
                    Err(e) => tracing::warn!(error = %e, "keep-alive probe failed"),
                }
            }
        }
    }

    /// The CPU forgets subscriptions with the connection: re-send the mask,
    /// drop cyclic jobs.
    async fn restore_subscriptions(&self) {
        let mut set = self.subscriptions.lock().await;
        for job in set.cyclic_jobs.drain(..) {
            tracing::warn!(job_id = job, "cyclic job lost with the previous link");
            self.pipeline.unbind_cyclic_job(job);
        }
        if set.mask != 0 {
            if let Err(e) = self.set_message_mask(set.mask).await {
                tracing::warn!(error = %e, "could not restore message service");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.gate.close();
        self.cancel.cancel();
        self.pipeline.stop();
    }
}

fn request_category(req: &SubscriptionRequest) -> EventCategory {
    match req {
        SubscriptionRequest::Event(c) => *c,
        SubscriptionRequest::Cyclic { .. } => EventCategory::Cyclic,
    }
}

/// Responses do not echo addresses; the item count is the only tie back to the request.
fn check_count(op: &str, requested: usize, returned: usize) -> DriverResult<()> {
    if requested == returned {
        Ok(())
    } else {
        Err(DriverError::ProtocolConsistency(format!(
            "{op}: {requested} items requested, {returned} returned"
        )))
    }
}

/// Validate a user-data response and split it into parameter and data items.
fn check_user_data(resp: &S7Pdu) -> DriverResult<(UserDataParam, Vec<DataItem>)> {
    let param = UserDataParam::parse(&resp.param)?;
    if param.error_code != 0 {
        let [class, code] = param.error_code.to_be_bytes();
        return Err(DriverError::Device { class, code });
    }
    let items = parse_data_items(&resp.payload)?;
    if let Some(item) = items.first() {
        if item.return_code != S7ReturnCode::Success {
            return Err(DriverError::Device {
                class: 0,
                code: item.return_code.into(),
            });
        }
    }
    Ok((param, items))
}

/// Cyclic time base and factor: 100 ms steps up to 25.5 s, then seconds, then tens of seconds.
fn cyclic_timing(period: Duration) -> (u8, u8) {
    let ms = period.as_millis().max(100);
    if ms <= 25_500 {
        (0x00, (ms / 100) as u8)
    } else if ms <= 255_000 {
        (0x01, (ms / 1_000) as u8)
    } else {
        (0x02, (ms / 10_000).min(255) as u8)
    }
}

struct IoLoop {
    commands: mpsc::Receiver<LoopCommand>,
    inbound: mpsc::Receiver<S7Message>,
    outbound: mpsc::Sender<S7Message>,
    pipeline: Arc<EventPipeline>,
    fatal: mpsc::Sender<DriverError>,
    inflight: HashMap<u16, InflightEntry>,
    /// Sent on a link that has since been replaced. Nothing will answer
    /// them; they only wait out their deadline.
    stranded: HashMap<u16, InflightEntry>,
    timeouts: BTreeMap<Instant, Vec<u16>>,
    /// Set while a link is being (re)established; metered requests are refused
    held: bool,
    control: Option<PendingControl>,
    /// Fragments of a PDU split over several data TPDUs
    reasm: Option<BytesMut>,
}

impl IoLoop {
    async fn run(mut self, cancel: CancellationToken) {
        // Reusable sleep reset to the nearest deadline each turn
        let deadline = sleep(FAR_FUTURE);
        tokio::pin!(deadline);
        loop {
            deadline.as_mut().reset(self.next_deadline());
            select! {
                _ = cancel.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.submit(cmd).await,
                    None => break,
                },
                msg = self.inbound.recv() => match msg {
                    Some(msg) => self.on_frame(msg),
                    None => {
                        tracing::debug!("logical channel closed");
                        break;
                    }
                },
                _ = &mut deadline => self.expire(Instant::now()),
            }
        }
        self.fail_all();
        tracing::debug!("session I/O loop stopped");
    }

    fn next_deadline(&self) -> Instant {
        let inflight = self.timeouts.keys().next().copied();
        let control = self.control.as_ref().map(|c| c.deadline);
        match (inflight, control) {
            (Some(a), Some(b)) => a.min(b),
            (Some(d), None) | (None, Some(d)) => d,
            (None, None) => Instant::now() + FAR_FUTURE,
        }
    }

    async fn submit(&mut self, cmd: LoopCommand) {
        match cmd {
            LoopCommand::Transaction {
                pdu,
                ticket,
                timeout,
                reply,
            } => {
                if self.held && ticket.is_metered() {
                    // Admitted just before the gate was suspended.
                    let _ = reply.send(Err(DriverError::Transport(
                        "link is being re-established".into(),
                    )));
                    return;
                }
                let pdu_ref = ticket.pdu_ref();
                let deadline = Instant::now() + timeout;
                // Registered before sending so a fast answer always finds its entry.
                self.inflight.insert(
                    pdu_ref,
                    InflightEntry {
                        tx: reply,
                        deadline,
                        timeout,
                        _ticket: ticket,
                    },
                );
                self.timeouts.entry(deadline).or_default().push(pdu_ref);
                tracing::trace!(pdu_ref, "request sent");
                if self.outbound.send(S7Message::data(pdu)).await.is_err() {
                    if let Some(entry) = self.inflight.remove(&pdu_ref) {
                        let _ = entry.tx.send(Err(DriverError::NotConnected));
                    }
                }
            }
            LoopCommand::Control {
                msg,
                timeout,
                reply,
            } => {
                if let Some(prev) = self.control.take() {
                    let _ = prev.tx.send(Err(DriverError::ProtocolConsistency(
                        "control exchange superseded".into(),
                    )));
                }
                self.control = Some(PendingControl {
                    tx: reply,
                    deadline: Instant::now() + timeout,
                    timeout,
                });
                if self.outbound.send(msg).await.is_err() {
                    if let Some(pending) = self.control.take() {
                        let _ = pending.tx.send(Err(DriverError::NotConnected));
                    }
                }
            }
            LoopCommand::Hold { done } => {
                self.held = true;
                if !self.inflight.is_empty() {
                    tracing::debug!(
                        count = self.inflight.len(),
                        "requests stranded on the previous link"
                    );
                    self.stranded.extend(self.inflight.drain());
                }
                self.reasm = None;
                if let Some(pending) = self.control.take() {
                    let _ = pending
                        .tx
                        .send(Err(DriverError::Transport("link replaced".into())));
                }
                let _ = done.send(());
            }
            LoopCommand::Release => self.held = false,
        }
    }

    fn on_frame(&mut self, msg: S7Message) {
        if !msg.cotp.is_data() {
            match self.control.take() {
                Some(pending) => {
                    let _ = pending.tx.send(Ok(msg));
                }
                None => tracing::debug!(cotp = ?msg.cotp, "unsolicited control TPDU ignored"),
            }
            return;
        }
        let eot = matches!(msg.cotp, Cotp::D { eot: true, .. });
        let pdu = match msg.app {
            Some(S7AppBody::Parsed(pdu)) => pdu,
            Some(S7AppBody::Segmented(chunk)) => {
                let mut buf = self.reasm.take().unwrap_or_default();
                buf.extend_from_slice(&chunk);
                if !eot {
                    self.reasm = Some(buf);
                    return;
                }
                let all = buf.freeze();
                match S7Pdu::parse(&all, &all, &()) {
                    Ok((_, pdu)) => pdu,
                    Err(e) => {
                        tracing::warn!(error = %e, len = all.len(), "reassembled PDU dropped");
                        return;
                    }
                }
            }
            None => return,
        };

        if pdu.header.pdu_type == S7PduType::UserData && is_push(&pdu) {
            if let Err(e) = self.pipeline.ingest(pdu) {
                tracing::error!(error = %e, "event queue overflow");
                let _ = self.fatal.try_send(e);
            }
            return;
        }
        let pdu_ref = pdu.pdu_ref();
        match self.inflight.remove(&pdu_ref) {
            Some(entry) => {
                tracing::trace!(pdu_ref, "response matched");
                let _ = entry.tx.send(Ok(pdu));
            }
            None => tracing::debug!(pdu_ref, "response without a pending request discarded"),
        }
    }

    /// Fail every entry whose deadline has passed. Stale wheel slots left by
    /// answered requests are skipped by comparing the entry's own deadline.
    fn expire(&mut self, now: Instant) {
        let due: Vec<Instant> = self.timeouts.range(..=now).map(|(d, _)| *d).collect();
        for d in due {
            for pdu_ref in self.timeouts.remove(&d).unwrap_or_default() {
                let table = if self.inflight.contains_key(&pdu_ref) {
                    &mut self.inflight
                } else {
                    &mut self.stranded
                };
                if !table.get(&pdu_ref).is_some_and(|e| e.deadline <= now) {
                    continue;
                }
                if let Some(entry) = table.remove(&pdu_ref) {
                    tracing::debug!(pdu_ref, timeout = ?entry.timeout, "request timed out");
                    let _ = entry
                        .tx
                        .send(Err(DriverError::TransactionTimeout(entry.timeout)));
                }
            }
        }
        if self.control.as_ref().is_some_and(|c| c.deadline <= now) {
            if let Some(pending) = self.control.take() {
                let _ = pending
                    .tx
                    .send(Err(DriverError::TransactionTimeout(pending.timeout)));
            }
        }
    }

    fn fail_all(&mut self) {
        let n = self.inflight.len() + self.stranded.len();
        for (_, entry) in self.inflight.drain().chain(self.stranded.drain()) {
            let _ = entry.tx.send(Err(DriverError::NotConnected));
        }
        if let Some(pending) = self.control.take() {
            let _ = pending.tx.send(Err(DriverError::NotConnected));
        }
        self.timeouts.clear();
        if n > 0 {
            tracing::debug!(failed = n, "inflight requests failed on shutdown");
        }
    }
}

/// Reacts to channel changes and fatal loop errors. Holds the session weakly
/// so dropping the last handle ends it.
async fn run_supervision(
    session: Weak<Session>,
    mut channel: broadcast::Receiver<ChannelEvent>,
    mut fatal: mpsc::Receiver<DriverError>,
    cancel: CancellationToken,
) {
    loop {
        let next = select! {
            _ = cancel.cancelled() => break,
            err = fatal.recv() => match err {
                Some(e) => Err(e),
                None => break,
            },
            ev = channel.recv() => Ok(ev),
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        match next {
            Err(e) => {
                tracing::error!(error = %e, "fatal session error, tearing down");
                session.teardown(Some(e)).await;
                break;
            }
            Ok(Ok(ev)) => session.on_channel_event(ev).await,
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                tracing::warn!(skipped = n, "channel events lagged");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => break,
        }
    }
    tracing::debug!("session supervision stopped");
}

#[cfg(test)]
mod tests {
    use super::super::frame::CpuFunctionType;
    use super::*;

    #[test]
    fn cyclic_timing_picks_the_finest_base() {
        assert_eq!(cyclic_timing(Duration::from_millis(500)), (0x00, 5));
        assert_eq!(cyclic_timing(Duration::from_millis(10)), (0x00, 1));
        assert_eq!(cyclic_timing(Duration::from_secs(60)), (0x01, 60));
        assert_eq!(cyclic_timing(Duration::from_secs(600)), (0x02, 60));
        assert_eq!(cyclic_timing(Duration::from_secs(100_000)), (0x02, 255));
    }

    #[test]
    fn item_count_mismatch_is_a_consistency_error() {
        assert!(check_count("read", 2, 2).is_ok());
        let err = check_count("read", 2, 1).unwrap_err();
        assert!(matches!(err, DriverError::ProtocolConsistency(ref m) if m.contains("2 items requested, 1 returned")));
    }

    #[test]
    fn user_data_error_code_maps_to_device_error() {
        let mut param = UserDataParam::request(CpuFunctionGroup::CpuFunctions, subfunction::READ_SZL, 0);
        param.method = 0x12;
        param.kind = CpuFunctionType::Response;
        param.error_code = 0xD602;
        let pdu = S7Pdu::user_data(1, param.encode(), Bytes::new());
        let err = check_user_data(&pdu).unwrap_err();
        assert!(matches!(err, DriverError::Device { class: 0xD6, code: 0x02 }));
    }
}
