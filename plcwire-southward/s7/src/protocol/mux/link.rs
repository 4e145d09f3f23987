use super::{
    super::{codec::Codec, frame::S7Message},
    transport::BoxedIo,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Notify},
    time::{sleep_until, Instant},
};
use tokio_util::{codec::Framed, sync::CancellationToken};

/// Far enough away to mean "no deadline".
const IDLE_PARK: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkRole {
    Primary,
    Secondary,
}

impl LinkRole {
    #[inline]
    pub fn other(self) -> Self {
        match self {
            LinkRole::Primary => LinkRole::Secondary,
            LinkRole::Secondary => LinkRole::Primary,
        }
    }
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkRole::Primary => "primary",
            LinkRole::Secondary => "secondary",
        })
    }
}

/// What a link's I/O task reports to the router.
#[derive(Debug)]
pub(super) enum LinkEvent {
    Frame {
        role: LinkRole,
        generation: u64,
        msg: S7Message,
    },
    Closed {
        role: LinkRole,
        generation: u64,
        reason: String,
    },
}

/// One TCP connection owned by the multiplexer.
///
/// `generation` distinguishes successive links in the same role so late
/// events from a replaced link are recognised and ignored.
pub(super) struct PhysicalLink {
    pub role: LinkRole,
    pub generation: u64,
    pub address: String,
    outbound: mpsc::Sender<S7Message>,
    alive: Arc<AtomicBool>,
    armed: Arc<AtomicBool>,
    rearm: Arc<Notify>,
    last_activity: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
}

impl fmt::Debug for PhysicalLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalLink")
            .field("role", &self.role)
            .field("generation", &self.generation)
            .field("address", &self.address)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl PhysicalLink {
    /// Start the I/O task for an already connected stream.
    pub fn spawn(
        io: BoxedIo,
        role: LinkRole,
        generation: u64,
        address: String,
        events: mpsc::Sender<LinkEvent>,
        watchdog: Option<Duration>,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(256);
        let link = Self {
            role,
            generation,
            address,
            outbound,
            alive: Arc::new(AtomicBool::new(true)),
            armed: Arc::new(AtomicBool::new(false)),
            rearm: Arc::new(Notify::new()),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            cancel: CancellationToken::new(),
        };
        let io_task = LinkIoTask {
            role,
            generation,
            alive: Arc::clone(&link.alive),
            armed: Arc::clone(&link.armed),
            rearm: Arc::clone(&link.rearm),
            last_activity: Arc::clone(&link.last_activity),
            cancel: link.cancel.clone(),
            watchdog,
        };
        tokio::spawn(io_task.run(io, outbound_rx, events));
        link
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    #[inline]
    pub fn sender(&self) -> mpsc::Sender<S7Message> {
        self.outbound.clone()
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Make this the traffic-carrying link: the read watchdog starts counting now.
    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
        self.rearm.notify_one();
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
        self.rearm.notify_one();
    }

    /// Tear the connection down; the I/O task reports `Closed` as for any other loss.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PhysicalLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct LinkIoTask {
    role: LinkRole,
    generation: u64,
    alive: Arc<AtomicBool>,
    armed: Arc<AtomicBool>,
    rearm: Arc<Notify>,
    last_activity: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
    watchdog: Option<Duration>,
}

impl LinkIoTask {
    fn touch(&self, now: Instant) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = now;
    }

    fn watchdog_deadline(&self, last_read: Instant) -> Instant {
        match self.watchdog {
            Some(wd) if self.armed.load(Ordering::Acquire) => last_read + wd,
            _ => Instant::now() + IDLE_PARK,
        }
    }

    async fn run(
        self,
        io: BoxedIo,
        mut outbound: mpsc::Receiver<S7Message>,
        events: mpsc::Sender<LinkEvent>,
    ) {
        let (mut sink, mut stream) = Framed::new(io, Codec).split();
        let mut last_read = Instant::now();
        let watchdog = sleep_until(self.watchdog_deadline(last_read));
        tokio::pin!(watchdog);

        let reason = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break "closed locally".to_string(),
                _ = self.rearm.notified() => {
                    // Re-arming restarts the inactivity window.
                    last_read = Instant::now();
                    watchdog.as_mut().reset(self.watchdog_deadline(last_read));
                }
                out = outbound.recv() => {
                    let Some(msg) = out else { break "outbound closed".to_string() };
                    if let Err(e) = sink.send(msg).await {
                        break format!("write failed: {e}");
                    }
                    self.touch(Instant::now());
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(msg)) => {
                        last_read = Instant::now();
                        self.touch(last_read);
                        watchdog.as_mut().reset(self.watchdog_deadline(last_read));
                        tracing::trace!(role = %self.role, cotp = ?msg.cotp, "frame received");
                        let ev = LinkEvent::Frame {
                            role: self.role,
                            generation: self.generation,
                            msg,
                        };
                        if events.send(ev).await.is_err() {
                            break "router gone".to_string();
                        }
                    }
                    Some(Err(e)) => break format!("read failed: {e}"),
                    None => break "peer closed".to_string(),
                },
                _ = &mut watchdog => {
                    let armed = self.armed.load(Ordering::Acquire);
                    if armed && Instant::now() >= self.watchdog_deadline(last_read) {
                        break "watchdog expired".to_string();
                    }
                    watchdog.as_mut().reset(self.watchdog_deadline(last_read));
                }
            }
        };

        self.alive.store(false, Ordering::Release);
        tracing::debug!(
            role = %self.role,
            generation = self.generation,
            %reason,
            "link I/O stopped"
        );
        let _ = events
            .send(LinkEvent::Closed {
                role: self.role,
                generation: self.generation,
                reason,
            })
            .await;
    }
}
