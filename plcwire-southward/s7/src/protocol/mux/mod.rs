//! Logical channel over one or two physical links.
//!
//! A router task moves frames between the session and whichever link is
//! active. A supervisor task re-evaluates the channel on a fixed tick. Both
//! take the channel lock before changing the active role or installing a
//! link, so failover and supervision never race on the same role.
mod link;
mod state;
mod transport;

pub use link::LinkRole;
pub use state::ChannelSnapshot;
pub use transport::{BoxedIo, LinkIo, MemoryTransportFactory, TcpTransportFactory, TransportFactory};

use super::frame::S7Message;
use arc_swap::ArcSwapOption;
use futures::future::join_all;
use link::{LinkEvent, PhysicalLink};
use plcwire_sdk::{DriverError, DriverResult, RetryPolicy};
use state::{LogicalChannelState, OpenPlan, Slot};
use std::{io, sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Channel-level notifications for upper layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Traffic now flows over `role` after a failover or a link recovery.
    Reconnected { role: LinkRole },
    /// No link is alive.
    Disconnected,
    /// The active link has been idle for the keep-alive interval.
    KeepAliveDue,
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub primary: String,
    pub secondary: Option<String>,
    /// Supervision tick
    pub tick: Duration,
    /// Period of reopen attempts for links that exist but are dead
    pub retry_interval: Duration,
    /// Read inactivity limit on the active link
    pub watchdog: Option<Duration>,
    pub keep_alive: Option<Duration>,
    /// Pacing of opens for links that were never established
    pub link_retry: RetryPolicy,
}

impl MuxConfig {
    pub fn single(address: impl Into<String>) -> Self {
        Self {
            primary: address.into(),
            secondary: None,
            tick: Duration::from_secs(1),
            retry_interval: Duration::from_secs(4),
            watchdog: None,
            keep_alive: None,
            link_retry: RetryPolicy::default(),
        }
    }
}

struct Shared {
    config: MuxConfig,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<LogicalChannelState>,
    snapshot_tx: watch::Sender<ChannelSnapshot>,
    events_tx: broadcast::Sender<ChannelEvent>,
    /// Outbound queue of the active link; swapped on every role change
    active_tx: ArcSwapOption<mpsc::Sender<S7Message>>,
    link_events_tx: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
}

/// Presents the configured links as one self-healing channel.
pub struct LinkMultiplexer {
    shared: Arc<Shared>,
    outbound_tx: mpsc::Sender<S7Message>,
    snapshot_rx: watch::Receiver<ChannelSnapshot>,
}

impl std::fmt::Debug for LinkMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkMultiplexer")
            .field("snapshot", &*self.snapshot_rx.borrow())
            .finish()
    }
}

impl LinkMultiplexer {
    /// Open every configured link and start routing.
    ///
    /// Fails only when no link can be opened. Returns the single inbound
    /// stream of frames from whichever link is active.
    pub async fn open(
        config: MuxConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> DriverResult<(Self, mpsc::Receiver<S7Message>)> {
        let (link_events_tx, link_events_rx) = mpsc::channel(256);
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let state = LogicalChannelState::new(
            config.primary.clone(),
            config.secondary.clone(),
            config.link_retry,
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot());
        let (events_tx, _) = broadcast::channel(64);

        let shared = Arc::new(Shared {
            config,
            factory,
            state: Mutex::new(state),
            snapshot_tx,
            events_tx,
            active_tx: ArcSwapOption::empty(),
            link_events_tx,
            cancel: CancellationToken::new(),
        });

        {
            let plan = shared.state.lock().await.open_plan(|_| true);
            let opened = shared.open_links(plan).await;
            let mut st = shared.state.lock().await;
            let mut errors = Vec::new();
            for (role, result) in opened {
                match result {
                    Ok(link) => *st.slot(role) = Some(link),
                    Err(e) => {
                        tracing::warn!(%role, error = %e, "initial link open failed");
                        st.pacing(role).record_failure(Instant::now());
                        errors.push(format!("{role}: {e}"));
                    }
                }
            }
            let role = st.roles().iter().copied().find(|r| st.is_alive(*r));
            let Some(role) = role else {
                return Err(DriverError::Transport(format!(
                    "no link could be opened ({})",
                    errors.join("; ")
                )));
            };
            st.connected = true;
            shared.activate(&mut st, role);
            tracing::info!(%role, "logical channel connected");
        }

        tokio::spawn(run_router(
            Arc::clone(&shared),
            outbound_rx,
            link_events_rx,
            inbound_tx,
        ));
        tokio::spawn(run_supervisor(Arc::clone(&shared)));

        Ok((
            Self {
                shared,
                outbound_tx,
                snapshot_rx,
            },
            inbound_rx,
        ))
    }

    /// Queue a frame for the active link. Frames sent while no link is
    /// active are dropped; the caller's transaction then times out.
    pub async fn send(&self, msg: S7Message) -> DriverResult<()> {
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| DriverError::NotConnected)
    }

    /// Outbound handle for tasks that feed frames without borrowing the multiplexer.
    pub fn sender(&self) -> mpsc::Sender<S7Message> {
        self.outbound_tx.clone()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.snapshot_rx.borrow().connected
    }

    #[inline]
    pub fn snapshot(&self) -> ChannelSnapshot {
        *self.snapshot_rx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ChannelSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Drop the active link as if its TCP connection had failed.
    pub async fn drop_active(&self, reason: &str) {
        let st = self.shared.state.lock().await;
        if let Some(link) = st.active() {
            tracing::warn!(role = %link.role, reason, "dropping active link");
            link.close();
        }
    }

    /// Whether the link in `role` exists and is alive.
    pub async fn link_alive(&self, role: LinkRole) -> bool {
        self.shared.state.lock().await.is_alive(role)
    }

    /// Stop supervision and close every link. No `Disconnected` event is raised.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        let mut st = self.shared.state.lock().await;
        st.closed = true;
        st.connected = false;
        st.primary = None;
        st.secondary = None;
        self.shared.active_tx.store(None);
        self.shared.publish(&st);
        tracing::debug!("logical channel closed");
    }
}

impl Drop for LinkMultiplexer {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    fn publish(&self, st: &LogicalChannelState) {
        let _ = self.snapshot_tx.send(st.snapshot());
    }

    fn emit(&self, ev: ChannelEvent) {
        let _ = self.events_tx.send(ev);
    }

    /// Open the planned links concurrently. Runs without the channel lock.
    async fn open_links(&self, plan: Vec<OpenPlan>) -> Vec<(LinkRole, io::Result<PhysicalLink>)> {
        let attempts = plan.into_iter().map(|p| async move {
            let res = self.factory.open(&p.address).await.map(|io| {
                tracing::info!(role = %p.role, address = %p.address, generation = p.generation, "link opened");
                PhysicalLink::spawn(
                    io,
                    p.role,
                    p.generation,
                    p.address,
                    self.link_events_tx.clone(),
                    self.config.watchdog,
                )
            });
            (p.role, res)
        });
        join_all(attempts).await
    }

    /// Route traffic over `role`. Caller holds the lock.
    fn activate(&self, st: &mut LogicalChannelState, role: LinkRole) {
        if let Some(old) = st.link(role.other()) {
            old.disarm();
        }
        st.active_role = role;
        match st.link(role) {
            Some(link) => {
                link.arm();
                self.active_tx.store(Some(Arc::new(link.sender())));
            }
            None => self.active_tx.store(None),
        }
        self.publish(st);
    }

    /// The active link is gone: move to the standby or declare the channel down.
    fn fail_over(&self, st: &mut LogicalChannelState) {
        let standby = st.active_role.other();
        if st.is_alive(standby) {
            tracing::info!(from = %st.active_role, to = %standby, "failing over");
            self.activate(st, standby);
            self.emit(ChannelEvent::Reconnected { role: standby });
        } else if st.connected {
            st.connected = false;
            self.active_tx.store(None);
            self.publish(st);
            tracing::warn!("no link alive, logical channel disconnected");
            self.emit(ChannelEvent::Disconnected);
        }
    }

    fn on_link_closed(&self, st: &mut LogicalChannelState, role: LinkRole, generation: u64, reason: &str) {
        match st.link(role) {
            Some(link) if link.generation == generation => {}
            // A replaced link; its successor is already installed.
            _ => return,
        }
        tracing::warn!(%role, generation, reason, "link lost");
        if st.closed {
            return;
        }
        if role == st.active_role && st.connected {
            self.fail_over(st);
        }
    }

    /// One supervision pass.
    async fn supervise(&self) {
        let now = Instant::now();
        let plan = {
            let mut st = self.state.lock().await;
            if st.closed {
                return;
            }
            // Active dead while the standby is alive.
            if st.connected && !st.is_alive(st.active_role) {
                self.fail_over(&mut st);
            }
            // Missing links are paced by backoff, dead links by the retry interval.
            let full_retry = now.duration_since(st.last_full_retry) >= self.config.retry_interval;
            if full_retry {
                st.last_full_retry = now;
            }
            st.open_plan(|slot| match slot {
                Slot::Missing(pacing) => pacing.due(now),
                Slot::Present(link) => !link.is_alive() && full_retry,
            })
        };

        let opened = if plan.is_empty() {
            Vec::new()
        } else {
            self.open_links(plan).await
        };

        let mut st = self.state.lock().await;
        if st.closed {
            return;
        }
        for (role, result) in opened {
            match result {
                Ok(link) => {
                    st.pacing(role).reset();
                    *st.slot(role) = Some(link);
                    if role == st.active_role && st.connected {
                        // The link this channel was using got replaced before its
                        // close was routed; the peer sees a fresh connection.
                        self.activate(&mut st, role);
                        self.emit(ChannelEvent::Reconnected { role });
                    }
                }
                Err(e) => {
                    let pacing = st.pacing(role);
                    pacing.record_failure(now);
                    tracing::debug!(%role, error = %e, failures = pacing.failures, "link open failed");
                }
            }
        }

        // A link came back after the channel went down.
        if !st.connected {
            let back = st.roles().iter().copied().find(|r| st.is_alive(*r));
            if let Some(role) = back {
                st.connected = true;
                self.activate(&mut st, role);
                tracing::info!(%role, "logical channel reconnected");
                self.emit(ChannelEvent::Reconnected { role });
            }
        }

        if let (true, Some(iv)) = (st.connected, self.config.keep_alive) {
            let idle = st
                .active()
                .is_some_and(|l| l.last_activity().elapsed() >= iv);
            drop(st);
            if idle {
                tracing::trace!("keep-alive due");
                self.emit(ChannelEvent::KeepAliveDue);
            }
        }
    }
}

async fn run_router(
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::Receiver<S7Message>,
    mut link_events_rx: mpsc::Receiver<LinkEvent>,
    inbound_tx: mpsc::Sender<S7Message>,
) {
    let mut snapshot_rx = shared.snapshot_tx.subscribe();
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            out = outbound_rx.recv() => {
                let Some(msg) = out else { break };
                match shared.active_tx.load_full() {
                    Some(tx) => {
                        if tx.send(msg).await.is_err() {
                            tracing::debug!("active link closed under write, frame dropped");
                        }
                    }
                    None => tracing::debug!("no active link, frame dropped"),
                }
            }
            ev = link_events_rx.recv() => {
                let Some(ev) = ev else { break };
                match ev {
                    LinkEvent::Frame { role, generation, msg } => {
                        let snap = *snapshot_rx.borrow_and_update();
                        if snap.connected && snap.active_role == role && snap.active_generation == generation {
                            if inbound_tx.send(msg).await.is_err() {
                                break;
                            }
                        } else {
                            tracing::trace!(%role, generation, "frame from inactive link discarded");
                        }
                    }
                    LinkEvent::Closed { role, generation, reason } => {
                        let mut st = shared.state.lock().await;
                        shared.on_link_closed(&mut st, role, generation, &reason);
                    }
                }
            }
        }
    }
    tracing::debug!("channel router stopped");
}

async fn run_supervisor(shared: Arc<Shared>) {
    let mut ticker = interval(shared.config.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => shared.supervise().await,
        }
    }
    tracing::debug!("channel supervisor stopped");
}
