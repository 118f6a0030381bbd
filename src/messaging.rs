pub mod channel;
pub mod envelope;
pub mod message;
pub mod registry;
pub mod transport;
