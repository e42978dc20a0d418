//! Invocation of the external cache builder.
//!
//! The daemon never builds an mkext itself; it launches `kextcache` and
//! consumes the result. Synchronous builds are waited on (the one-shot
//! update path needs the verdict before touching helpers); notification-
//! driven builds are double-forked so the grandchild is reaped by init
//! and the control thread never blocks.

use std::process::Command;

use anyhow::{bail, Context, Error};
use log::{debug, info};
use nix::{
    sys::wait::waitpid,
    unistd::{fork, setsid, ForkResult},
};

use bosun_api::constants::{CACHE_BUILDER, EX_TEMPFAIL};

use crate::bootcaches::BootCaches;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Built,

    /// The builder needs a follow-up invocation; not an error.
    TempFail,
}

/// Assembles the mkext build invocation:
/// `kextcache -a <arch>... -l -m <mkext> <extensions-dir>`, with the
/// child's TMPDIR on the target volume so its rename-into-place stays
/// atomic.
fn mkext_command(caches: &BootCaches) -> Option<Command> {
    let mkext = caches.mkext()?;
    let exts = caches.exts_dir()?;

    let mut cmd = Command::new(CACHE_BUILDER);
    for arch in caches.archs() {
        cmd.arg("-a").arg(arch);
    }
    cmd.arg("-l")
        .arg("-m")
        .arg(caches.root().join(&mkext.rpath))
        .arg(exts)
        .env("TMPDIR", caches.bootstamp_dir());
    Some(cmd)
}

/// Builds the mkext and waits for the verdict.
pub fn build_mkext_sync(caches: &BootCaches) -> Result<BuildOutcome, Error> {
    let Some(mut cmd) = mkext_command(caches) else {
        return Ok(BuildOutcome::Built);
    };
    info!("{}: building mkext", caches.devname());
    debug!("running: {:?}", cmd);
    let status = cmd
        .status()
        .with_context(|| format!("Failed to launch {CACHE_BUILDER}"))?;
    match status.code() {
        Some(0) => Ok(BuildOutcome::Built),
        Some(code) if code == EX_TEMPFAIL => Ok(BuildOutcome::TempFail),
        _ => bail!("{CACHE_BUILDER} failed: {status}"),
    }
}

/// Launches an mkext rebuild without waiting; the freshly-written mkext
/// announces itself through the filesystem notification it causes.
pub fn spawn_mkext_rebuild(caches: &BootCaches) -> Result<(), Error> {
    let Some(cmd) = mkext_command(caches) else {
        return Ok(());
    };
    info!("{}: launching mkext build", caches.devname());
    double_fork(cmd)
}

/// fork → setsid → fork → exec: the intermediate child exits at once and
/// is reaped here; the grandchild belongs to init.
fn double_fork(mut cmd: Command) -> Result<(), Error> {
    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { child } => {
            waitpid(child, None).context("Failed to reap the intermediate child")?;
            Ok(())
        }
        ForkResult::Child => {
            let _ = setsid();
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    use std::os::unix::process::CommandExt;
                    let _ = cmd.exec();
                    // Only reached when exec itself failed.
                    unsafe { libc::_exit(127) }
                }
                Ok(ForkResult::Parent { .. }) | Err(_) => unsafe { libc::_exit(0) },
            }
        }
    }
}
