use std::{path::Path, process::ExitCode, thread};

use anyhow::{Context, Error};
use clap::Parser;
use log::{error, info, warn};

use bosun::{
    builder::{self, BuildOutcome},
    cli::{Cli, Commands},
    engine, server,
    watch::{self, ControlReply, ControlRequest, Controller},
    BOSUN_VERSION,
};
use bosun_api::constants::EX_TEMPFAIL;
use bosun::bootcaches::BootCaches;

fn main() -> ExitCode {
    let args = Cli::parse();
    env_logger::Builder::new()
        .filter_level(args.verbosity)
        .init();

    if !nix::unistd::geteuid().is_root() {
        error!("bosun must run as root");
        return ExitCode::FAILURE;
    }
    info!("bosun version {BOSUN_VERSION}");

    let result = match args.command {
        Commands::Daemon { socket } => run_daemon(socket),
        Commands::Update {
            volume,
            force,
            socket,
        } => return run_update(&volume, force, &socket),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_daemon(socket: std::path::PathBuf) -> Result<(), Error> {
    let mut controller = Controller::new();
    controller
        .start_fs_watcher()
        .context("Failed to start the filesystem watcher")?;
    server::spawn(socket, controller.sender()).context("Failed to start the control socket")?;

    let monitor_tx = controller.sender();
    thread::spawn(move || {
        if let Err(e) = watch::run_udev_monitor(monitor_tx) {
            warn!("udev monitor stopped: {e:#}");
        }
    });

    controller.initial_scan();
    controller.run();
    Ok(())
}

/// The one-shot path: lock the volume through a running daemon when there
/// is one, rebuild the mkext if needed, update every helper, and report
/// through the lock's exit status.
fn run_update(volume: &Path, force: bool, socket: &Path) -> ExitCode {
    let mut caches = match BootCaches::for_volume(volume) {
        Ok(Some(caches)) => caches,
        Ok(None) => {
            info!("'{}' has no boot caches to update", volume.display());
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let mut client = server::ControlClient::connect(socket);
    if let Some(client) = client.as_mut() {
        let reply = client.request(&ControlRequest::LockVolume {
            bsdname: caches.devname().to_string(),
        });
        match reply {
            Ok(ControlReply::Ok) => {}
            Ok(ControlReply::Busy { device }) => {
                error!(
                    "'{}' is busy{}",
                    volume.display(),
                    device.map(|d| format!(" ({d})")).unwrap_or_default()
                );
                return ExitCode::from(EX_TEMPFAIL as u8);
            }
            Ok(other) => {
                error!("daemon refused the lock: {other:?}");
                return ExitCode::FAILURE;
            }
            Err(e) => {
                error!("daemon lock failed: {e:#}");
                return ExitCode::FAILURE;
            }
        }
    }

    let status = run_update_locked(&mut caches, force);
    let code = match &status {
        Ok(code) => *code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };

    if let Some(client) = client.as_mut() {
        let _ = client.request(&ControlRequest::UnlockVolume {
            bsdname: caches.devname().to_string(),
            status: code,
        });
    }
    ExitCode::from(code as u8)
}

fn run_update_locked(caches: &mut BootCaches, force: bool) -> Result<i32, Error> {
    // The mkext must be current before it can be mirrored.
    if caches
        .mkext_needs_rebuild()
        .context("Failed to assess the mkext")?
    {
        match builder::build_mkext_sync(caches)? {
            BuildOutcome::Built => {}
            BuildOutcome::TempFail => {
                info!("builder deferred; try again");
                return Ok(EX_TEMPFAIL);
            }
        }
    }

    let helpers =
        watch::discover_helpers(caches.devname()).context("Failed to find helper partitions")?;
    engine::update_volume(caches, &helpers, force)?;
    Ok(0)
}
