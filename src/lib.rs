//! bosun keeps auxiliary boot partitions ("helpers") in sync with the
//! canonical boot artifacts on their host volumes: the kernel extension
//! cache, the booters, the boot configuration, and the disk labels.

pub mod bootcaches;
pub mod builder;
pub mod cli;
pub mod engine;
pub mod locks;
pub mod server;
pub mod watch;

pub const BOSUN_VERSION: &str = env!("CARGO_PKG_VERSION");
