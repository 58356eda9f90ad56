//! Dataplane reflector for the ITO network test protocol.
//!
//! Test instruments send UDP probes carrying one of a handful of 7-byte
//! ASCII signatures; this crate recognizes those probes on-wire, swaps
//! their layer-2/3/4 addressing, and retransmits them out the same
//! interface at the lowest achievable latency.
//!
//! The crate exposes one entry point, [`ReflectorCtx`], whose lifecycle is
//! `init` -> `start` -> `stop` -> `cleanup`. Everything else — CLI
//! parsing, a configuration loader, dashboards, IPC with a control plane —
//! is an external collaborator and out of this crate's scope.

pub mod backend;
pub mod config;
pub mod error;
pub mod packet;
pub mod stats;
pub mod worker;

mod device;
mod sleepyinstant;
mod supervisor;

pub use config::{BackendKind, Config, ReflectionMode, SignatureFilter, SignatureKind};
pub use error::{ConfigError, InitError, StartError};
pub use stats::AggregateStats;
pub use supervisor::ReflectorCtx;
