//! Tunnel device abstraction.
//!
//! The session loop only needs to read and write raw IP packets and to
//! exempt its own sockets from being routed back into the tunnel. These
//! traits let tests swap the OS interface for an in-memory one.

use std::future::Future;
use std::io;
use std::net::Ipv4Addr;

use tokio::net::UdpSocket;
use tracing::{debug, info};
use tun_rs::{AsyncDevice, DeviceBuilder};

/// Parameters used to bring up the tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelParams {
    pub name: Option<String>,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    /// Resolver address clients must use for their queries to be filtered.
    /// Lives inside the tunnel block.
    pub dns_server: Ipv4Addr,
    pub mtu: u16,
    /// Physical interface protected sockets are pinned to.
    pub bypass_interface: Option<String>,
}

impl TunnelParams {
    /// Network address and prefix of the block routed through the tunnel.
    pub fn route(&self) -> (Ipv4Addr, u8) {
        let network = u32::from(self.address) & self.netmask();
        (Ipv4Addr::from(network), self.prefix_len)
    }

    /// Whether `addr` falls inside the tunnel block.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = self.netmask();
        u32::from(addr) & mask == u32::from(self.address) & mask
    }

    fn netmask(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            len => u32::MAX << (32 - u32::from(len.min(32))),
        }
    }
}

/// Exempts a socket from being routed back into the tunnel.
pub trait SocketProtector: Send + Sync + 'static {
    fn protect(&self, socket: &UdpSocket) -> io::Result<()>;
}

/// A live tunnel interface.
///
/// `recv` is only ever called from the session loop; `send` and `protect`
/// are called concurrently from workers.
pub trait TunnelDevice: SocketProtector {
    /// Read one outbound IP packet. Returns the number of bytes read.
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Inject one IP packet back towards the client.
    fn send(&self, packet: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

/// Brings tunnel devices up.
pub trait TunnelProvider: Send + Sync + 'static {
    type Device: TunnelDevice;

    fn establish(
        &self,
        params: &TunnelParams,
    ) -> impl Future<Output = io::Result<Self::Device>> + Send;
}

/// Provider backed by an OS TUN interface.
///
/// Assigning the address and prefix installs the connected route for the
/// tunnel block. The DNS server is not pushed to the host: its resolver
/// configuration must point at [`TunnelParams::dns_server`] for queries to
/// enter the tunnel.
#[derive(Debug, Clone, Copy, Default)]
pub struct TunProvider;

/// A TUN interface plus the interface its protected sockets bind to.
pub struct TunDevice {
    device: AsyncDevice,
    bypass_interface: Option<String>,
}

impl TunnelProvider for TunProvider {
    type Device = TunDevice;

    async fn establish(&self, params: &TunnelParams) -> io::Result<TunDevice> {
        let mut builder = DeviceBuilder::new()
            .ipv4(params.address, params.prefix_len, None)
            .mtu(params.mtu);
        if let Some(name) = &params.name {
            builder = builder.name(name.as_str());
        }
        let device = builder.build_async()?;

        let (network, prefix_len) = params.route();
        let route = format!("{network}/{prefix_len}");
        info!(
            address = %params.address,
            route = %route,
            dns_server = %params.dns_server,
            mtu = params.mtu,
            "tunnel interface up"
        );

        Ok(TunDevice {
            device,
            bypass_interface: params.bypass_interface.clone(),
        })
    }
}

impl SocketProtector for TunDevice {
    fn protect(&self, socket: &UdpSocket) -> io::Result<()> {
        let Some(interface) = self.bypass_interface.as_deref() else {
            return Ok(());
        };
        bind_to_interface(socket, interface)?;
        debug!(interface, "socket pinned outside the tunnel");
        Ok(())
    }
}

impl TunnelDevice for TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.recv(buf).await
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        self.device.send(packet).await
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
fn bind_to_interface(socket: &UdpSocket, interface: &str) -> io::Result<()> {
    socket2::SockRef::from(socket).bind_device(Some(interface.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
fn bind_to_interface(_socket: &UdpSocket, interface: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("binding to {interface} is not supported on this platform"),
    ))
}
