//! Network subsystem for UDP audio ingress

pub mod packet;
pub mod receiver;
pub mod udp;

pub use receiver::{NetworkReceiver, ReceiverStats};
pub use udp::create_socket;
