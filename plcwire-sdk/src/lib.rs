pub mod error;
pub mod retry;
pub mod wire;

pub use error::{DriverError, DriverResult, ErrorKind};
pub use retry::{build_exponential_backoff, RetryPolicy};
pub use wire::{WireDecode, WireEncode};
