pub mod connection;
pub mod protocol;
pub mod types;

pub use connection::S7Connection;
pub use protocol::{
    events::{EventDetails, EventHandle, S7Event},
    frame::{parse_tag, S7DataType, S7DataValue, S7Tag},
    mux::{
        BoxedIo, ChannelEvent, LinkRole, MemoryTransportFactory, TcpTransportFactory,
        TransportFactory,
    },
    session::{
        ItemStatus, ReadResult, SessionEvent, SessionParams, SessionState, Subscription,
        SubscriptionRequest,
    },
};
pub use plcwire_sdk::{DriverError, DriverResult, ErrorKind, RetryPolicy};
pub use types::{ControllerType, EventCategory, S7ConnectionConfig, TsapConfig};
