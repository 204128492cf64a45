//! Block-level copy-on-write snapshot engine.
//!
//! `snapcore` maintains many concurrent, read-only snapshots of an origin
//! block device by recording only the chunks each snapshot has diverged on
//! (an "exception") in a private B-tree, rather than copying the whole
//! device per snapshot. See the module list below for the on-disk and
//! in-memory pieces; [`server::SnapServer`] is the struct that owns all of
//! them and is the crate's main entry point.

pub mod alloc;
pub mod block;
pub mod cache;
pub mod config;
pub mod copyout;
pub mod device;
pub mod dispatch;
pub mod errors;
pub mod journal;
pub mod readlock;
pub mod server;
pub mod snapshot;
pub mod superblock;
pub mod tree;

#[cfg(feature = "init_env_logger")]
pub fn init_logging() {
    let _ = env_logger::try_init();
}

pub use config::Config;
pub use errors::{Error, ErrorKind, Result};
pub use server::SnapServer;
