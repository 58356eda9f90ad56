//! The reflector's state machine: `Uninitialized -> Ready -> Running ->
//! Ready -> Destroyed`. Owns the worker threads, their
//! shared stop flag, and the per-worker stats blocks; the only type in
//! the crate that mutates shared state outside the hot path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::backend::{self, BackendKind};
use crate::config::Config;
use crate::device::dev_lock::Lock;
use crate::device::drop_privileges;
use crate::error::{ConfigError, InitError, StartError};
use crate::stats::{AggregateStats, WorkerStats};
use crate::worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Ready,
    Running,
    Destroyed,
}

struct RunningWorkers {
    stop_flag: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    backend_kind: BackendKind,
}

/// The reflector instance. `init`/`start`/`stop`/`cleanup` mirror the
/// lifecycle of the state machine above; everything else is only legal
/// in the state its doc comment names.
pub struct ReflectorCtx {
    state: State,
    config: Lock<Config>,
    stats: Vec<Arc<WorkerStats>>,
    running: Option<RunningWorkers>,
}

impl ReflectorCtx {
    /// `Uninitialized` instance; call [`ReflectorCtx::init`] before
    /// anything else.
    pub fn new() -> Self {
        ReflectorCtx {
            state: State::Uninitialized,
            config: Lock::new(Config::new("", [0; 6])),
            stats: Vec::new(),
            running: None,
        }
    }

    /// `Uninitialized -> Ready`. Resolves the interface's MAC address and
    /// validates the resulting default config. Also legal to call again
    /// after [`ReflectorCtx::cleanup`] to re-resolve a fresh instance; this
    /// implementation treats re-init as replacing the config wholesale
    /// (the same effect `set_config` has while `Ready`).
    pub fn init(&mut self, ifname: &str) -> Result<(), InitError> {
        let mac = resolve_mac(ifname)?;
        let cfg = Config::new(ifname, mac);
        cfg.validate()
            .map_err(|e| InitError::RingCreationFailed(e.to_string()))?;

        self.config = Lock::new(cfg);
        self.stats = Vec::new();
        self.state = State::Ready;
        Ok(())
    }

    /// `Ready`-only. Replaces the live config wholesale after validating
    /// it.
    pub fn set_config(&mut self, new_cfg: Config) -> Result<(), ConfigError> {
        if self.state != State::Ready {
            return Err(ConfigError::AlreadyRunning);
        }
        new_cfg.validate()?;
        self.config = Lock::new(new_cfg);
        Ok(())
    }

    pub fn get_config(&self) -> Config {
        self.config.read().clone()
    }

    /// `Ready -> Running`. Spawns `worker_count` pinned threads. Worker 0
    /// picks the backend by precedence; every other worker is forced to
    /// the same kind so a deployment never runs a mixed fleet. If any
    /// worker after the first fails to open that same backend kind,
    /// every already-spawned worker is stopped again before returning the
    /// error — start is all-or-nothing.
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.state == State::Running {
            return Err(StartError::AlreadyRunning);
        }
        if self.state != State::Ready {
            return Err(StartError::Config(ConfigError::InvalidField {
                field: "state",
                reason: "start requires the reflector to be in the Ready state",
            }));
        }

        let cfg = Arc::new(self.config.read().clone());
        cfg.validate().map_err(StartError::Config)?;

        let first_backend = backend::init_with_fallback(&cfg, 0)
            .map_err(|errs| {
                let (_, last_err) = errs.into_iter().last().expect("fallback tried >=1 backend");
                StartError::AllBackendsFailed(last_err)
            })?;
        let kind = first_backend.kind();

        self.stats = (0..cfg.worker_count).map(|_| Arc::new(WorkerStats::default())).collect();
        let stop_flag = Arc::new(AtomicBool::new(false));

        let mut backends: Vec<Box<dyn backend::Backend>> = vec![first_backend];
        for worker_index in 1..cfg.worker_count {
            match backend::init_backend(kind, &cfg, worker_index) {
                Ok(b) => backends.push(b),
                Err(e) => {
                    // Roll back: nothing has been spawned yet, only
                    // opened, so dropping `backends` tears everything
                    // down via each backend's `Drop`.
                    return Err(StartError::AllBackendsFailed(e));
                }
            }
        }

        if cfg.drop_privileges {
            if let Err(e) = drop_privileges::drop_privileges() {
                return Err(StartError::PrivilegeDropFailed(e));
            }
        }

        let mut handles = Vec::with_capacity(cfg.worker_count);
        for (worker_index, b) in backends.into_iter().enumerate() {
            let worker_cfg = Arc::clone(&cfg);
            let stats = Arc::clone(&self.stats[worker_index]);
            let worker_stop_flag = Arc::clone(&stop_flag);
            let spawned = std::thread::Builder::new()
                .name(format!("ito-reflect-{worker_index}"))
                .spawn(move || worker::run(worker_index, worker_cfg, b, stats, worker_stop_flag));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Roll back: already-spawned workers are stopped and
                    // joined before returning, so `start` stays all-or-nothing.
                    stop_flag.store(true, Ordering::Release);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(StartError::AllBackendsFailed(InitError::Io(e)));
                }
            }
        }

        self.running = Some(RunningWorkers {
            stop_flag,
            handles,
            backend_kind: kind,
        });
        self.state = State::Running;
        Ok(())
    }

    /// `Running -> Ready`. Idempotent: calling it while already `Ready`
    /// is a no-op rather than an error.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.stop_flag.store(true, Ordering::Release);
        for handle in running.handles {
            let _ = handle.join();
        }
        self.state = State::Ready;
    }

    /// `Ready -> Destroyed`. Releases the last backend-independent state.
    /// `start` after `cleanup` requires a fresh `init`.
    pub fn cleanup(&mut self) {
        self.stop();
        self.stats.clear();
        self.state = State::Destroyed;
    }

    pub fn get_stats(&self) -> AggregateStats {
        AggregateStats::collect(self.stats.iter().map(|s| s.as_ref()))
    }

    /// Legal in both `Ready` and `Running` since it only zeroes counters,
    /// never touches backend state.
    pub fn reset_stats(&self) {
        for w in &self.stats {
            w.reset();
        }
    }

    pub fn active_backend(&self) -> Option<BackendKind> {
        self.running.as_ref().map(|r| r.backend_kind)
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Running
    }
}

impl Default for ReflectorCtx {
    fn default() -> Self {
        Self::new()
    }
}

/// Looks up the interface's hardware address via `SIOCGIFHWADDR`.
fn resolve_mac(ifname: &str) -> Result<[u8; 6], InitError> {
    if ifname.is_empty() || ifname.len() >= crate::config::IFNAMSIZ {
        return Err(InitError::InterfaceNotFound(ifname.to_string()));
    }

    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(InitError::Io(std::io::Error::last_os_error()));
    }

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (i, b) in ifname.bytes().enumerate() {
        ifr.ifr_name[i] = b as libc::c_char;
    }

    let ret = unsafe { libc::ioctl(sock, libc::SIOCGIFHWADDR, &mut ifr) };
    unsafe { libc::close(sock) };
    if ret != 0 {
        return Err(InitError::InterfaceNotFound(ifname.to_string()));
    }

    let mut mac = [0u8; 6];
    // `ifr_hwaddr` is a `sockaddr`; `sa_data` holds the raw MAC bytes.
    let sa_data = unsafe { ifr.ifr_ifru.ifru_hwaddr.sa_data };
    for (i, m) in mac.iter_mut().enumerate() {
        *m = sa_data[i] as u8;
    }
    if mac == [0; 6] {
        return Err(InitError::MacUnavailable);
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ctx_starts_uninitialized() {
        let ctx = ReflectorCtx::new();
        assert!(!ctx.is_running());
        assert_eq!(ctx.active_backend(), None);
    }

    #[test]
    fn set_config_rejects_invalid_field() {
        let mut ctx = ReflectorCtx::new();
        ctx.state = State::Ready;
        let mut bad = Config::new("eth0", [1, 2, 3, 4, 5, 6]);
        bad.frame_size = 300; // not a power of two
        assert!(ctx.set_config(bad).is_err());
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let mut ctx = ReflectorCtx::new();
        ctx.stop();
        assert!(!ctx.is_running());
    }
}
