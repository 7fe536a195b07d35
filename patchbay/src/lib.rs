//! A broker for layer-2 virtual circuits.
//!
//! `patchbay` manages the lifecycle of multipoint VLAN-like services across
//! programmable switches. Clients connect over a framed, multiplexed JSON
//! transport, describe a service's endpoints (terminal + label + bandwidth),
//! and the broker commits the service onto hardware through a desired-state
//! fabric manager that drives the switch's REST API and an OpenFlow
//! controller.
//!
//! The crate is organized bottom-up:
//!
//! * [`codec`]: the length-prefixed JSON frame layer and the [`codec::Channel`]
//!   read/write pair.
//! * [`mux`]: many logical sessions over one base channel.
//! * [`client`]: the typed caller side, with reference-counted service
//!   proxies.
//! * [`fault`]: the wire error taxonomy.
//! * [`iface`]: interface descriptors and canonical circuit resolution.
//! * [`model`]: segments, traffic flows, terminals.
//! * [`service`]: the per-service state machine.
//! * [`fabric`]: bridge reconciliation against the switch, including crash
//!   recovery, plus the REST clients it drives.
//! * [`network`]: the per-network registry tying services to the fabric.
//! * [`server`]: the handshake and RPC dispatcher.
//! * [`config`]: broker and agent configuration.

pub mod client;
pub mod codec;
pub mod config;
pub mod fabric;
pub mod fault;
pub mod iface;
pub mod model;
pub mod mux;
pub mod network;
pub mod server;
pub mod service;

mod error;

pub use fault::{Fault, FaultKind};
pub use network::{Broker, Network, NetworkKind};
pub use service::{Service, ServiceStatus};

pub(crate) use error::Error;
