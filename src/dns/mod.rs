//! DNS-level handling: blocked answers and upstream forwarding.

pub mod resolver;
pub mod sinkhole;

pub use resolver::{UdpUpstream, UpstreamResolver};
pub use sinkhole::{Sinkhole, SinkholeAddress};
