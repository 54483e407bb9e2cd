//! Tunnel-side networking: the device abstraction and the IPv4/UDP codec.

mod buffer;
pub mod device;
pub mod packet;

pub use buffer::{BufferPool, ResponsePacket};
pub use device::{SocketProtector, TunDevice, TunProvider, TunnelDevice, TunnelParams, TunnelProvider};
pub use packet::{DnsQueryPacket, PacketBuilder, parse_query};
