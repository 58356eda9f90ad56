//! Error taxonomy for the reflector's API boundary.
//!
//! Per-packet rejects and transmit drops never surface here — they are
//! counted in [`crate::stats`]. Only `init`/`start`/`set_config` return
//! these.

use std::io;
use thiserror::Error;

/// Failures that can occur while bringing a backend (or the whole
/// reflector) up.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("interface {0:?} not found")]
    InterfaceNotFound(String),
    #[error("could not obtain a MAC address for the interface")]
    MacUnavailable,
    #[error("insufficient privileges to open the requested backend")]
    InsufficientPrivileges,
    #[error("failed to allocate the {frame_count}x{frame_size} byte buffer pool")]
    PoolAllocationFailed {
        frame_count: usize,
        frame_size: usize,
    },
    #[error("failed to create the backend's rings: {0}")]
    RingCreationFailed(String),
    #[error("failed to attach the kernel-side filter program: {0}")]
    FilterLoadFailed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures returned synchronously by `set_config`.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("interface name must be 1..{limit} bytes, got {len}")]
    InvalidInterfaceName { len: usize, limit: usize },
    #[error("source OUI filter requires a non-zero 3-byte OUI")]
    InvalidOui,
    #[error("set_config is only legal while the reflector is not running")]
    AlreadyRunning,
    #[error("invalid value for {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Failures returned synchronously by `start`.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("the reflector is already running")]
    AlreadyRunning,
    #[error("every backend failed to initialize on worker 0: {0}")]
    AllBackendsFailed(InitError),
    #[error("failed to drop privileges after backend init: {0}")]
    PrivilegeDropFailed(String),
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
}
