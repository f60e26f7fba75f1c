#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Listening-socket discovery.
//!
//! A [`Fleet`] probes every node concurrently through an [`Executor`],
//! parses the node's socket tables, attributes sockets to workloads and
//! merges the results into a canonical [`FlowMatrix`].

pub mod exec;
pub mod fleet;
pub mod loopback;
pub mod probe;
pub mod resolve;
pub mod ss;

pub use self::{
    exec::{Executor, Inventory, Node},
    fleet::{Discovery, Fleet},
    loopback::LoopbackFilter,
    probe::{NodeProbe, Prober},
    resolve::{Attribution, ContainerResolver, ResolveError},
    ss::{SocketEntry, SocketTable},
};
pub use port_audit_core::{FlowMatrix, FlowRecord, Protocol};
