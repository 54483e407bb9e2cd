//! dnsgate - DNS filtering at a tunnel endpoint.
//!
//! dnsgate sits behind a virtual network interface, intercepts the DNS
//! queries leaving the device and asks a remote policy service about every
//! queried domain. Allowed queries are forwarded untouched to a real
//! resolver; blocked ones get a synthesized answer pointing at a sinkhole.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`network`]: Tunnel device abstraction and the IPv4/UDP packet codec
//! - [`policy`]: Client for the remote allow/deny service
//! - [`dns`]: Blocked answers and upstream forwarding
//! - [`handler`]: The per-query pipeline run by workers
//! - [`session`]: Session loop, dispatch pool and reconnect backoff
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Error types
//!
//! # Testing
//!
//! The tunnel, the policy service and the upstream resolver all sit behind
//! traits, so the whole pipeline can run against in-memory devices:
//!
//! ```rust
//! use dnsgate::dns::{Sinkhole, SinkholeAddress};
//! use std::net::Ipv4Addr;
//!
//! let sinkhole = Sinkhole::new(SinkholeAddress::Loopback, 10);
//! assert_eq!(sinkhole.address.ip(), Ipv4Addr::LOCALHOST);
//! ```

pub mod config;
pub mod dns;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod network;
pub mod policy;
pub mod session;

pub use config::Config;
pub use error::{Error, Result};
pub use session::{SessionHandle, SessionState, TunnelSession};
