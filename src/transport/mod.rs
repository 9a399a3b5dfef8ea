//! Data-plane transports: the TCP accept loop for signaling, unicast UDP
//! socket pairs, and shared multicast senders.

pub mod multicast;
pub mod tcp;
pub mod udp;
