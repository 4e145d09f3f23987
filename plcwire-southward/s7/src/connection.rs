use crate::{
    protocol::{
        events::{EventHandle, S7Event},
        frame::{S7DataValue, S7Tag},
        mux::{TcpTransportFactory, TransportFactory},
        session::{
            ItemStatus, Lifecycle, ReadResult, Session, SessionEvent, SessionParams,
            SessionState, Subscription, SubscriptionRequest,
        },
    },
    types::{ControllerType, EventCategory, S7ConnectionConfig},
};
use arc_swap::ArcSwapOption;
use plcwire_sdk::{DriverError, DriverResult};
use std::{
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::instrument;

/// Public entry point: one logical S7 connection over one or two links.
///
/// The facade outlives individual sessions. Lifecycle events and the state
/// watch stay valid across `disconnect`/`connect` cycles; event callbacks
/// belong to the session they were registered on.
pub struct S7Connection {
    config: Arc<S7ConnectionConfig>,
    factory: Arc<dyn TransportFactory>,
    lifecycle: Lifecycle,
    session: ArcSwapOption<Session>,
    /// Serializes connect and disconnect
    op_lock: Mutex<()>,
    last_error: StdMutex<Option<DriverError>>,
}

impl std::fmt::Debug for S7Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S7Connection")
            .field("primary", &self.config.primary)
            .field("secondary", &self.config.secondary)
            .field("state", &self.state())
            .finish()
    }
}

impl S7Connection {
    /// Connection over plain TCP.
    pub fn new(config: S7ConnectionConfig) -> DriverResult<Self> {
        let factory = Arc::new(TcpTransportFactory::new(config.connect_timeout()));
        Self::with_factory(config, factory)
    }

    /// Connection over a caller-supplied transport.
    pub fn with_factory(
        config: S7ConnectionConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> DriverResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            factory,
            lifecycle: Lifecycle::new(),
            session: ArcSwapOption::empty(),
            op_lock: Mutex::new(()),
            last_error: StdMutex::new(None),
        })
    }

    #[inline]
    pub fn config(&self) -> &S7ConnectionConfig {
        &self.config
    }

    /// Establish the session. A no-op when already connected.
    #[instrument(level = "info", skip_all, fields(primary = %self.config.primary))]
    pub async fn connect(&self) -> DriverResult<()> {
        let _guard = self.op_lock.lock().await;
        if let Some(current) = self.session.load_full() {
            if current.state() != SessionState::Disconnected {
                return Ok(());
            }
            self.retire(&current).await;
        }
        match Session::connect(
            Arc::clone(&self.config),
            Arc::clone(&self.factory),
            self.lifecycle.clone(),
        )
        .await
        {
            Ok(session) => {
                self.session.store(Some(session));
                Ok(())
            }
            Err(e) => {
                self.set_last_error(e.clone());
                Err(e)
            }
        }
    }

    /// Tear the session down. Outstanding requests fail with `NotConnected`.
    #[instrument(level = "info", skip_all)]
    pub async fn disconnect(&self) {
        let _guard = self.op_lock.lock().await;
        if let Some(session) = self.session.swap(None) {
            self.retire(&session).await;
        }
    }

    async fn retire(&self, session: &Session) {
        session.disconnect().await;
        if let Some(e) = session.last_error() {
            self.set_last_error(e);
        }
    }

    fn set_last_error(&self, e: DriverError) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(e);
    }

    fn active(&self) -> DriverResult<Arc<Session>> {
        self.session.load_full().ok_or(DriverError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .load_full()
            .is_some_and(|s| s.is_connected())
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.lifecycle.watch()
    }

    /// Connected / Reconnected / Disconnected notifications.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.lifecycle.subscribe()
    }

    /// Values negotiated by the current session.
    pub fn session_params(&self) -> Option<SessionParams> {
        self.session.load_full().map(|s| s.params())
    }

    /// Identified controller family, or the configured one before connect.
    pub fn controller_type(&self) -> ControllerType {
        self.session
            .load_full()
            .map_or(self.config.controller_type, |s| s.controller_type())
    }

    pub fn last_error(&self) -> Option<DriverError> {
        self.session
            .load_full()
            .and_then(|s| s.last_error())
            .or_else(|| {
                self.last_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
    }

    /// Events lost to full subscriber lanes on the current session.
    pub fn dropped_events(&self) -> u64 {
        self.session
            .load_full()
            .map_or(0, |s| s.pipeline().dropped_events())
    }

    pub async fn read(&self, tags: &[S7Tag]) -> DriverResult<Vec<ReadResult>> {
        self.active()?.read(tags).await
    }

    pub async fn write(&self, items: &[(S7Tag, S7DataValue)]) -> DriverResult<Vec<ItemStatus>> {
        self.active()?.write(items).await
    }

    pub async fn subscribe(
        &self,
        requests: &[SubscriptionRequest],
    ) -> DriverResult<Vec<Subscription>> {
        self.active()?.subscribe(requests).await
    }

    pub async fn unsubscribe(&self, subscriptions: &[Subscription]) -> DriverResult<()> {
        self.active()?.unsubscribe(subscriptions).await
    }

    /// Register an event callback on the current session.
    pub fn register<F>(&self, category: EventCategory, callback: F) -> DriverResult<EventHandle>
    where
        F: Fn(&S7Event) + Send + Sync + 'static,
    {
        Ok(self.active()?.pipeline().register(category, callback))
    }

    pub fn unregister(&self, handle: EventHandle) -> DriverResult<bool> {
        Ok(self.active()?.pipeline().unregister(handle))
    }

    /// Round trip of a read of the configured ping tag.
    pub async fn ping(&self) -> DriverResult<Duration> {
        self.active()?.ping().await
    }
}
