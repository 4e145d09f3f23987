pub mod codec;
pub mod error;
pub mod events;
pub mod frame;
pub mod mux;
pub mod planner;
pub mod session;
pub mod transaction;

pub use error::{Error, Result};
