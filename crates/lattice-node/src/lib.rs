//! Node service orchestration for the lattice overlay network.
//!
//! This crate joins a process to virtual Ethernet networks: it drives the
//! opaque overlay protocol engine, binds and rebinds UDP sockets as
//! interfaces churn, bridges decrypted frames into virtual tap devices,
//! persists engine state under a home directory, and fans state changes
//! out to an external event consumer.
//!
//! Hosts embed the service by supplying its collaborators as trait
//! objects (see [`ServiceDeps`]) and driving [`supervisor::run_supervised`]
//! or a single [`NodeService`] on a tokio runtime. The `lattice-node`
//! binary does exactly that for stand-alone runs.

pub mod binder;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod logging;
pub mod networks;
pub mod paths;
pub mod peers;
pub mod ports;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod testing;
pub mod wire;

pub use config::ServiceConfig;
pub use error::ServiceError;
pub use events::{Event, EventCode, EventPayload, EventSink};
pub use service::{NodeService, ServiceDeps, ServiceHandle, Termination};
