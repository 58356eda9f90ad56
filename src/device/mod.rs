//! Small Unix primitives: the upgradable read/write lock used for the
//! live [`crate::config::Config`] handle, and the privilege-drop routine
//! the supervisor runs after every worker's backend is open.

pub(crate) mod dev_lock;
pub(crate) mod drop_privileges;
