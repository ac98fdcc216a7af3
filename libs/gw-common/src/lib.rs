pub mod error;
pub mod model;
pub mod ports;

pub use error::{BusError, DecodeError, GatewayError, Result};
