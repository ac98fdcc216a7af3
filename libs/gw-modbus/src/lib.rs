pub mod bus;
pub mod decoder;
pub mod frame;
pub mod pdu;

pub use bus::{BusDriver, RtuBusDriver, TcpBusDriver};
pub use decoder::decode_register;
