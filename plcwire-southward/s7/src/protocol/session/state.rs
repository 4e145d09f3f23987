use super::super::{
    frame::{S7DataValue, S7ReturnCode, S7Tag},
    mux::LinkRole,
};
use crate::types::{ControllerType, EventCategory};
use serde::Serialize;
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::{broadcast, watch};

/// Session lifecycle as seen by API consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Disconnected,
    /// COTP connection request sent, waiting for confirm
    Handshaking,
    /// Setup communication in flight
    Negotiating,
    /// Reading the CPU identification (controller type `Any`)
    Identifying,
    Connected,
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Connection-level notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SessionEvent {
    Connected,
    /// The logical channel moved to `role` and the handshake was re-run on it
    Reconnected { role: LinkRole },
    Disconnected,
}

/// Values agreed with the device during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParams {
    pub local_tsap: u16,
    pub remote_tsap: u16,
    /// COTP TPDU size in bytes
    pub tpdu_size: usize,
    pub pdu_size: u16,
    pub amq_caller: u16,
    pub amq_callee: u16,
    pub controller_type: ControllerType,
    /// MLFB reported by the CPU, when identification ran
    pub article_number: Option<String>,
}

/// Per-item outcome of a read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Ok,
    AccessDenied,
    InvalidAddress,
    InvalidDataType,
    NotFound,
    InternalError,
}

impl From<S7ReturnCode> for ItemStatus {
    fn from(code: S7ReturnCode) -> Self {
        match code {
            S7ReturnCode::Success => ItemStatus::Ok,
            S7ReturnCode::AccessDenied => ItemStatus::AccessDenied,
            S7ReturnCode::AddressOutOfRange => ItemStatus::InvalidAddress,
            S7ReturnCode::DataTypeNotSupported | S7ReturnCode::DataTypeInconsistent => {
                ItemStatus::InvalidDataType
            }
            S7ReturnCode::ObjectDoesNotExist => ItemStatus::NotFound,
            _ => ItemStatus::InternalError,
        }
    }
}

/// One item of a read, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub tag: S7Tag,
    pub status: ItemStatus,
    /// Present only when `status` is `Ok`
    pub value: Option<S7DataValue>,
}

/// What to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionRequest {
    /// A message-service category (mode, diagnostics, alarms)
    Event(EventCategory),
    /// Cyclic transfer of `tags` every `period`
    Cyclic { tags: Vec<S7Tag>, period: Duration },
}

/// An active subscription; pass back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    Event(EventCategory),
    Cyclic { job_id: u8, tags: Vec<S7Tag> },
}

impl Subscription {
    pub fn category(&self) -> EventCategory {
        match self {
            Subscription::Event(c) => *c,
            Subscription::Cyclic { .. } => EventCategory::Cyclic,
        }
    }
}

/// State watch plus event broadcast, shared between the facade and the session.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state_tx: Arc<watch::Sender<SessionState>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (events_tx, _) = broadcast::channel(64);
        Self {
            state_tx: Arc::new(state_tx),
            events_tx,
        }
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn set_state(&self, state: SessionState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            tracing::debug!(from = %prev, to = %state, "session state");
        }
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}
