//! The volume controller: discovers BootRoot volumes, watches their
//! cached paths, coalesces change bursts behind a settle timer, and
//! dispatches rebuilds.
//!
//! One control thread owns everything here — the volume map, the lock
//! arbiter, and every settle timer. Event sources (the filesystem
//! watcher, the udev monitor, control-socket connections) only ever feed
//! the channel.

use std::{
    collections::BTreeMap,
    io::BufRead,
    path::{Path, PathBuf},
    sync::mpsc::{Receiver, RecvTimeoutError, Sender},
    time::{Duration, Instant},
};

use anyhow::{Context, Error};
use log::{debug, info, trace, warn};
use notify::Watcher;
use serde::{Deserialize, Serialize};

use bosun_api::constants::{HELPER_PARTTYPE_GUID, MAX_ERRCOUNT, SETTLE_DELAY_SECS};
use volutils::{lsblk, mount};

use crate::{
    bootcaches::BootCaches,
    engine::{self, HelperPartition},
    locks::{EndpointId, ExitDisposition, LockArbiter, LockOutcome, UnlockOutcome},
};

/// Block-device lifecycle, as reported by udev.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskEvent {
    Appeared { devname: String },
    Changed { devname: String },
    Disappeared { devname: String },
}

/// One request on the control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    LockVolume { bsdname: String },
    UnlockVolume { bsdname: String, status: i32 },
    LockReboot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum ControlReply {
    Ok,
    Busy { device: Option<String> },
    NotFound,
    NotPermitted,
}

impl From<LockOutcome> for ControlReply {
    fn from(outcome: LockOutcome) -> Self {
        match outcome {
            LockOutcome::Granted => ControlReply::Ok,
            LockOutcome::Busy { device } => ControlReply::Busy { device },
            LockOutcome::NotFound => ControlReply::NotFound,
        }
    }
}

/// Everything the control thread reacts to.
#[derive(Debug)]
pub enum Event {
    Disk(DiskEvent),
    Fs(PathBuf),
    Control {
        endpoint: EndpointId,
        request: ControlRequest,
        reply: Sender<ControlReply>,
    },
    EndpointDead(EndpointId),
    Shutdown,
}

/// One volume under watch.
pub(crate) struct WatchedVol {
    pub(crate) caches: BootCaches,
    pub(crate) helpers: Vec<HelperPartition>,

    /// Non-`None` means a rebuild is pending.
    pub(crate) settle_due: Option<Instant>,

    /// Consecutive failed rebuild attempts.
    pub(crate) errcount: u32,

    /// Mount options to restore once ownership no longer needs forcing.
    pub(crate) saved_mount_options: Option<String>,

    /// Absolute paths whose changes concern this volume.
    pub(crate) watched_paths: Vec<PathBuf>,

    /// What was actually handed to the notifier, for unwatching.
    watch_targets: Vec<PathBuf>,
}

impl WatchedVol {
    pub(crate) fn new(caches: BootCaches, helpers: Vec<HelperPartition>) -> Self {
        let watched_paths = caches.watched_paths();
        WatchedVol {
            caches,
            helpers,
            settle_due: None,
            errcount: 0,
            saved_mount_options: None,
            watched_paths,
            watch_targets: Vec::new(),
        }
    }
}

pub struct Controller {
    vols: BTreeMap<String, WatchedVol>,
    arbiter: LockArbiter,
    watcher: Option<notify::RecommendedWatcher>,
    tx: Sender<Event>,
    rx: Receiver<Event>,

    #[cfg(test)]
    pub(crate) mkext_builds: Vec<String>,
}

impl Controller {
    pub fn new() -> Self {
        let (tx, rx) = std::sync::mpsc::channel();
        Controller {
            vols: BTreeMap::new(),
            arbiter: LockArbiter::new(),
            watcher: None,
            tx,
            rx,
            #[cfg(test)]
            mkext_builds: Vec::new(),
        }
    }

    /// A handle event sources feed.
    pub fn sender(&self) -> Sender<Event> {
        self.tx.clone()
    }

    /// Brings up the filesystem notifier. Events land on the channel like
    /// everything else.
    pub fn start_fs_watcher(&mut self) -> Result<(), Error> {
        let tx = self.tx.clone();
        let watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    for path in event.paths {
                        let _ = tx.send(Event::Fs(path));
                    }
                }
                Err(e) => warn!("filesystem notifier error: {e}"),
            },
        )
        .context("Failed to create the filesystem notifier")?;
        self.watcher = Some(watcher);
        Ok(())
    }

    /// Seeds the volume map from the block devices already mounted.
    pub fn initial_scan(&mut self) {
        let devices = match lsblk::list() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("initial scan failed: {e:#}");
                return;
            }
        };
        let mut names = Vec::new();
        fn collect(devs: &[lsblk::BlockDevice], names: &mut Vec<String>) {
            for dev in devs {
                if dev.mountpoint.is_some() {
                    names.push(dev.name.clone());
                }
                collect(&dev.children, names);
            }
        }
        collect(&devices, &mut names);
        for name in names {
            self.disk_appeared(&name);
        }
    }

    /// The event loop. Returns when `Shutdown` arrives or every sender is
    /// gone.
    pub fn run(&mut self) {
        loop {
            let event = match self.next_deadline() {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match self.rx.recv_timeout(wait) {
                        Ok(event) => Some(event),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.rx.recv() {
                    Ok(event) => Some(event),
                    Err(_) => break,
                },
            };
            match event {
                Some(Event::Shutdown) => break,
                Some(event) => self.handle(event),
                None => {}
            }
            self.fire_due(Instant::now());
        }
        info!("controller stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.vols.values().filter_map(|vol| vol.settle_due).min()
    }

    pub(crate) fn handle(&mut self, event: Event) {
        match event {
            Event::Disk(DiskEvent::Appeared { devname }) => self.disk_appeared(&devname),
            Event::Disk(DiskEvent::Changed { devname }) => {
                // A changed mount point reads as gone-then-back.
                if self.vols.contains_key(&devname) {
                    self.disk_disappeared(&devname);
                }
                self.disk_appeared(&devname);
            }
            Event::Disk(DiskEvent::Disappeared { devname }) => self.disk_disappeared(&devname),
            Event::Fs(path) => self.fs_event(&path),
            Event::Control {
                endpoint,
                request,
                reply,
            } => {
                let response = self.control(endpoint, request);
                let _ = reply.send(response);
            }
            Event::EndpointDead(endpoint) => self.endpoint_dead(endpoint),
            Event::Shutdown => {}
        }
    }

    /// A mountable volume showed up (or re-announced itself).
    fn disk_appeared(&mut self, devname: &str) {
        let devices = match lsblk::list() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("{devname}: discovery failed: {e:#}");
                return;
            }
        };
        let Some(dev) = lsblk::find_by_name(&devices, devname) else {
            return;
        };
        if dev.ro || lsblk::is_network_backed(dev) {
            return;
        }
        let Some(mount_point) = dev.mountpoint.clone() else {
            return;
        };

        // BootRoot volumes are GPT partitions flanked by helper
        // partitions; anything else is silently ignored.
        let Some(disk) = lsblk::parent_disk(&devices, devname) else {
            return;
        };
        if disk.pttype.as_deref() != Some("gpt") {
            return;
        }
        let helpers = helpers_from(&devices, devname);
        if helpers.is_empty() {
            return;
        }

        if self.vols.contains_key(devname) {
            self.disk_disappeared(devname);
        }

        // Volumes often mount with ownership masked; honor real ownership
        // while the descriptor is examined, then put things back.
        let saved = match mount::enable_ownership(&mount_point) {
            Ok(saved) => saved,
            Err(e) => {
                debug!("{devname}: ownership toggle unavailable: {e:#}");
                None
            }
        };
        let parsed = BootCaches::for_volume(&mount_point);
        if let Some(options) = &saved {
            if let Err(e) = mount::restore_options(&mount_point, options) {
                warn!("{devname}: failed to restore mount options: {e:#}");
            }
        }

        match parsed {
            Ok(Some(caches)) => {
                info!(
                    "{devname}: watching '{}' ({} helpers)",
                    caches.label(),
                    helpers.len()
                );
                self.adopt_volume(devname, WatchedVol::new(caches, helpers));
            }
            Ok(None) => {}
            Err(e) => info!("{devname}: descriptor rejected: {e:#}"),
        }
    }

    /// Inserts a volume and registers its path notifications.
    pub(crate) fn adopt_volume(&mut self, devname: &str, mut vol: WatchedVol) {
        if self.vols.contains_key(devname) {
            self.disk_disappeared(devname);
        }
        if let Some(watcher) = &mut self.watcher {
            for path in vol.watched_paths.clone() {
                // Files are watched through their parent so replace-by-
                // rename is seen; directories are watched whole.
                let (target, mode) = if path.is_dir() {
                    (path.clone(), notify::RecursiveMode::Recursive)
                } else {
                    let parent = path
                        .parent()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| path.clone());
                    (parent, notify::RecursiveMode::NonRecursive)
                };
                if !target.exists() {
                    trace!("not watching absent '{}'", target.display());
                    continue;
                }
                match watcher.watch(&target, mode) {
                    Ok(()) => {
                        if !vol.watch_targets.contains(&target) {
                            vol.watch_targets.push(target.clone());
                        }
                        if !vol.watched_paths.contains(&target) {
                            vol.watched_paths.push(target);
                        }
                    }
                    Err(e) => warn!("failed to watch '{}': {e}", target.display()),
                }
            }
        }
        self.vols.insert(devname.to_string(), vol);
    }

    fn disk_disappeared(&mut self, devname: &str) {
        let Some(vol) = self.vols.remove(devname) else {
            return;
        };
        // Pending timer dies with the record; notifications are
        // unregistered; a held lock is discarded.
        if let Some(watcher) = &mut self.watcher {
            for target in &vol.watch_targets {
                let _ = watcher.unwatch(target);
            }
        }
        self.arbiter.forget_volume(devname);
        info!("{devname}: no longer watched");
    }

    /// A path notification: recover the owning volume and (re)arm its
    /// settle timer.
    fn fs_event(&mut self, path: &Path) {
        let now = Instant::now();
        for (devname, vol) in &mut self.vols {
            if vol.watched_paths.iter().any(|w| path.starts_with(w)) {
                trace!("{devname}: change at '{}'", path.display());
                vol.settle_due = Some(now + Duration::from_secs(SETTLE_DELAY_SECS));
            }
        }
    }

    pub(crate) fn fire_due(&mut self, now: Instant) {
        let due: Vec<String> = self
            .vols
            .iter()
            .filter(|(_, vol)| vol.settle_due.is_some_and(|d| d <= now))
            .map(|(devname, _)| devname.clone())
            .collect();
        for devname in due {
            if let Some(vol) = self.vols.get_mut(&devname) {
                vol.settle_due = None;
            }
            self.check_rebuild(&devname);
        }
    }

    /// The settle timer fired: decide between the external mkext builder
    /// and the helper updater.
    pub(crate) fn check_rebuild(&mut self, devname: &str) {
        if let Some(holder) = self.arbiter.holder(devname) {
            debug!("{devname}: locked by endpoint {holder}; deferring");
            return;
        }
        let Some(vol) = self.vols.get_mut(devname) else {
            return;
        };

        match vol.caches.mkext_needs_rebuild() {
            Ok(true) => {
                // The rebuilt mkext will trip a fresh notification, and
                // that pass takes care of the helpers.
                info!("{devname}: mkext out of date; invoking the builder");
                #[cfg(test)]
                {
                    self.mkext_builds.push(devname.to_string());
                }
                #[cfg(not(test))]
                {
                    if let Err(e) = crate::builder::spawn_mkext_rebuild(&vol.caches) {
                        warn!("{devname}: failed to launch the builder: {e:#}");
                        vol.errcount += 1;
                    }
                }
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("{devname}: mkext check failed: {e:#}");
                vol.errcount += 1;
                return;
            }
        }

        match engine::update_volume(&mut vol.caches, &vol.helpers, false) {
            Ok(did_work) => {
                if did_work {
                    info!("{devname}: helpers updated");
                }
                vol.errcount = 0;
            }
            Err(e) => {
                vol.errcount += 1;
                warn!(
                    "{devname}: rebuild failed ({} consecutive): {e:#}",
                    vol.errcount
                );
            }
        }
    }

    /// Whether an unmount of the volume should be refused, and why.
    pub(crate) fn unmount_dissent(&mut self, devname: &str) -> Option<String> {
        if self.arbiter.holder(devname).is_some() {
            return Some(format!("{devname} is locked for an update"));
        }
        let vol = self.vols.get_mut(devname)?;
        let pending = vol.caches.mkext_needs_rebuild().unwrap_or(false)
            || vol.caches.check_staleness().map(|s| s.any).unwrap_or(false);
        pending.then(|| format!("{devname} has caches to update"))
    }

    fn control(&mut self, endpoint: EndpointId, request: ControlRequest) -> ControlReply {
        match request {
            ControlRequest::LockVolume { bsdname } => {
                let known = self.vols.contains_key(&bsdname);
                let outcome = self.arbiter.lock_volume(&bsdname, known, endpoint);
                if outcome == LockOutcome::Granted {
                    self.force_ownership(&bsdname);
                }
                outcome.into()
            }
            ControlRequest::UnlockVolume { bsdname, status } => {
                match self.arbiter.unlock_volume(&bsdname, endpoint, status) {
                    UnlockOutcome::Released { disposition } => {
                        self.restore_ownership(&bsdname);
                        if let Some(vol) = self.vols.get_mut(&bsdname) {
                            match disposition {
                                ExitDisposition::Success => vol.errcount = 0,
                                ExitDisposition::Failure => vol.errcount += 1,
                                ExitDisposition::TempFail => {}
                            }
                        }
                        ControlReply::Ok
                    }
                    UnlockOutcome::NotHeld => ControlReply::Ok,
                }
            }
            ControlRequest::LockReboot => {
                let busy = self.reboot_busy_device();
                self.arbiter.lock_reboot(endpoint, busy).into()
            }
        }
    }

    /// The first volume whose caches still need work, skipping volumes so
    /// broken they must not hold up a reboot forever.
    fn reboot_busy_device(&mut self) -> Option<String> {
        for (devname, vol) in &mut self.vols {
            if vol.errcount >= MAX_ERRCOUNT {
                debug!("{devname}: {} failures; not blocking reboot", vol.errcount);
                continue;
            }
            let pending = vol.caches.mkext_needs_rebuild().unwrap_or(false)
                || vol.caches.check_staleness().map(|s| s.any).unwrap_or(false);
            if pending {
                return Some(devname.clone());
            }
        }
        None
    }

    fn endpoint_dead(&mut self, endpoint: EndpointId) {
        let dead = self.arbiter.endpoint_died(endpoint);
        for devname in dead.volumes {
            self.restore_ownership(&devname);
            if let Some(vol) = self.vols.get_mut(&devname) {
                vol.errcount += 1;
            }
        }
    }

    fn force_ownership(&mut self, devname: &str) {
        let Some(vol) = self.vols.get_mut(devname) else {
            return;
        };
        if vol.saved_mount_options.is_some() {
            return;
        }
        match mount::enable_ownership(vol.caches.root()) {
            Ok(saved) => vol.saved_mount_options = saved,
            Err(e) => debug!("{devname}: ownership toggle unavailable: {e:#}"),
        }
    }

    fn restore_ownership(&mut self, devname: &str) {
        let Some(vol) = self.vols.get_mut(devname) else {
            return;
        };
        if let Some(options) = vol.saved_mount_options.take() {
            if let Err(e) = mount::restore_options(vol.caches.root(), &options) {
                warn!("{devname}: failed to restore mount options: {e:#}");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn vol(&self, devname: &str) -> &WatchedVol {
        &self.vols[devname]
    }

    #[cfg(test)]
    pub(crate) fn vol_mut(&mut self, devname: &str) -> &mut WatchedVol {
        self.vols.get_mut(devname).unwrap()
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper partitions flanking `devname` on its disk.
fn helpers_from(devices: &[lsblk::BlockDevice], devname: &str) -> Vec<HelperPartition> {
    lsblk::sibling_partitions_of_type(devices, devname, HELPER_PARTTYPE_GUID)
        .into_iter()
        .map(|part| HelperPartition {
            devname: part.name.clone(),
            dev_path: PathBuf::from(format!("/dev/{}", part.name)),
            size: part.size,
        })
        .collect()
}

/// Helper partitions for a host volume, freshly discovered; the one-shot
/// update path uses this.
pub fn discover_helpers(devname: &str) -> Result<Vec<HelperPartition>, Error> {
    let devices = lsblk::list()?;
    Ok(helpers_from(&devices, devname))
}

/// Forwards block-device lifecycle events from `udevadm monitor` onto the
/// controller's channel. Runs until the monitor exits.
pub fn run_udev_monitor(tx: Sender<Event>) -> Result<(), Error> {
    let mut child = std::process::Command::new("udevadm")
        .args(["monitor", "--udev", "--subsystem-match=block"])
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("Failed to start udevadm monitor")?;
    let stdout = child.stdout.take().context("No monitor output")?;

    for line in std::io::BufReader::new(stdout).lines() {
        let line = line.context("Monitor stream failed")?;
        let Some(event) = parse_udev_line(&line) else {
            continue;
        };
        if tx.send(Event::Disk(event)).is_err() {
            break;
        }
    }
    let _ = child.kill();
    let _ = child.wait();
    Ok(())
}

/// `UDEV [ts] add /devices/.../block/sdb/sdb1 (block)` → an event.
fn parse_udev_line(line: &str) -> Option<DiskEvent> {
    let mut fields = line.split_whitespace();
    if fields.next() != Some("UDEV") {
        return None;
    }
    let _timestamp = fields.next()?;
    let action = fields.next()?;
    let devpath = fields.next()?;
    let devname = devpath.rsplit('/').next()?.to_string();
    match action {
        "add" => Some(DiskEvent::Appeared { devname }),
        "change" | "move" => Some(DiskEvent::Changed { devname }),
        "remove" => Some(DiskEvent::Disappeared { devname }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::TempDir;

    use crate::bootcaches::testutil::{caches_for, full_descriptor, plant};

    const MKEXT_RPATH: &str = "System/Library/Extensions.mkext";

    fn controller_with_vol(host: &TempDir) -> Controller {
        let caches = caches_for(host.path(), &full_descriptor(), "HD");
        let mut controller = Controller::new();
        controller.adopt_volume("sdz2", WatchedVol::new(caches, Vec::new()));
        controller
    }

    fn bump_mtime(path: &Path, sec: i64) {
        let file = fs::File::open(path).unwrap();
        volutils::scoped::set_times_ns(&file, (sec, 0), (sec, 0), path).unwrap();
    }

    #[test]
    fn test_settle_burst_coalesces_to_one_rebuild() {
        let host = TempDir::new().unwrap();
        let mut controller = controller_with_vol(&host);
        // Stale content plus zero helpers makes every attempt fail, so
        // the error counter counts rebuild attempts exactly.
        plant(host.path(), MKEXT_RPATH, b"mkext");

        let watched = host.path().join(MKEXT_RPATH);
        for _ in 0..5 {
            controller.handle(Event::Fs(watched.clone()));
        }
        let due = controller.vol("sdz2").settle_due.expect("timer armed");

        // Before the deadline nothing fires.
        controller.fire_due(due - Duration::from_secs(1));
        assert_eq!(controller.vol("sdz2").errcount, 0);

        // At the deadline exactly one rebuild attempt happens.
        controller.fire_due(due);
        assert_eq!(controller.vol("sdz2").errcount, 1);
        assert!(controller.vol("sdz2").settle_due.is_none());

        // And nothing further without a fresh notification.
        controller.fire_due(due + Duration::from_secs(60));
        assert_eq!(controller.vol("sdz2").errcount, 1);
    }

    #[test]
    fn test_unrelated_path_does_not_arm_timer() {
        let host = TempDir::new().unwrap();
        let mut controller = controller_with_vol(&host);
        controller.handle(Event::Fs(PathBuf::from("/somewhere/else")));
        assert!(controller.vol("sdz2").settle_due.is_none());
    }

    #[test]
    fn test_mkext_staleness_defers_to_builder_first() {
        let host = TempDir::new().unwrap();
        let mut controller = controller_with_vol(&host);

        // An extensions directory newer than a missing mkext.
        let exts = host.path().join("System/Library/Extensions");
        fs::create_dir_all(&exts).unwrap();
        bump_mtime(&exts, 1_700_000_000);

        controller.check_rebuild("sdz2");
        assert_eq!(controller.mkext_builds, vec!["sdz2".to_string()]);
        // No helper-update attempt happened on this pass.
        assert_eq!(controller.vol("sdz2").errcount, 0);

        // The builder "finishes": mkext lands with the convention mtime,
        // and the follow-up notification triggers the helper pass.
        let mkext = plant(host.path(), MKEXT_RPATH, b"fresh mkext");
        bump_mtime(&mkext, 1_700_000_001);
        bump_mtime(&exts, 1_700_000_000);

        controller.check_rebuild("sdz2");
        assert_eq!(controller.mkext_builds.len(), 1, "builder not re-invoked");
        // The helper update ran (and failed for want of helpers).
        assert_eq!(controller.vol("sdz2").errcount, 1);
    }

    #[test]
    fn test_disappearance_cancels_timer_and_lock() {
        let host = TempDir::new().unwrap();
        let mut controller = controller_with_vol(&host);
        plant(host.path(), MKEXT_RPATH, b"mkext");

        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        controller.handle(Event::Control {
            endpoint: 9,
            request: ControlRequest::LockVolume {
                bsdname: "sdz2".into(),
            },
            reply: reply_tx,
        });
        assert_eq!(reply_rx.recv().unwrap(), ControlReply::Ok);

        controller.handle(Event::Fs(host.path().join(MKEXT_RPATH)));
        controller.handle(Event::Disk(DiskEvent::Disappeared {
            devname: "sdz2".into(),
        }));

        // Gone for good: a fresh lock request reports not-found.
        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        controller.handle(Event::Control {
            endpoint: 10,
            request: ControlRequest::LockVolume {
                bsdname: "sdz2".into(),
            },
            reply: reply_tx,
        });
        assert_eq!(reply_rx.recv().unwrap(), ControlReply::NotFound);
    }

    #[test]
    fn test_locked_volume_defers_rebuild() {
        let host = TempDir::new().unwrap();
        let mut controller = controller_with_vol(&host);
        plant(host.path(), MKEXT_RPATH, b"mkext");

        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        controller.handle(Event::Control {
            endpoint: 3,
            request: ControlRequest::LockVolume {
                bsdname: "sdz2".into(),
            },
            reply: reply_tx,
        });
        assert_eq!(reply_rx.recv().unwrap(), ControlReply::Ok);

        // A settle firing while locked does nothing.
        controller.check_rebuild("sdz2");
        assert_eq!(controller.vol("sdz2").errcount, 0);
    }

    #[test]
    fn test_client_crash_releases_lock_and_counts_error() {
        let host = TempDir::new().unwrap();
        let mut controller = controller_with_vol(&host);

        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        controller.handle(Event::Control {
            endpoint: 42,
            request: ControlRequest::LockVolume {
                bsdname: "sdz2".into(),
            },
            reply: reply_tx,
        });
        assert_eq!(reply_rx.recv().unwrap(), ControlReply::Ok);

        controller.handle(Event::EndpointDead(42));
        assert_eq!(controller.vol("sdz2").errcount, 1);

        // The lock is free again.
        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        controller.handle(Event::Control {
            endpoint: 43,
            request: ControlRequest::LockVolume {
                bsdname: "sdz2".into(),
            },
            reply: reply_tx,
        });
        assert_eq!(reply_rx.recv().unwrap(), ControlReply::Ok);
    }

    #[test]
    fn test_unlock_status_drives_errcount() {
        let host = TempDir::new().unwrap();
        let mut controller = controller_with_vol(&host);
        controller.vol_mut("sdz2").errcount = 3;

        let lock = |controller: &mut Controller, endpoint| {
            let (tx, rx) = std::sync::mpsc::channel();
            controller.handle(Event::Control {
                endpoint,
                request: ControlRequest::LockVolume {
                    bsdname: "sdz2".into(),
                },
                reply: tx,
            });
            rx.recv().unwrap()
        };
        let unlock = |controller: &mut Controller, endpoint, status| {
            let (tx, rx) = std::sync::mpsc::channel();
            controller.handle(Event::Control {
                endpoint,
                request: ControlRequest::UnlockVolume {
                    bsdname: "sdz2".into(),
                    status,
                },
                reply: tx,
            });
            rx.recv().unwrap()
        };

        // Temp-fail: not done yet, no error recorded.
        assert_eq!(lock(&mut controller, 1), ControlReply::Ok);
        unlock(&mut controller, 1, bosun_api::constants::EX_TEMPFAIL);
        assert_eq!(controller.vol("sdz2").errcount, 3);

        // Real failure advances the counter.
        assert_eq!(lock(&mut controller, 1), ControlReply::Ok);
        unlock(&mut controller, 1, 2);
        assert_eq!(controller.vol("sdz2").errcount, 4);

        // Success resets it.
        assert_eq!(lock(&mut controller, 1), ControlReply::Ok);
        unlock(&mut controller, 1, 0);
        assert_eq!(controller.vol("sdz2").errcount, 0);
    }

    #[test]
    fn test_reboot_skips_persistently_failing_volume() {
        let host_bad = TempDir::new().unwrap();
        let host_good = TempDir::new().unwrap();
        let mut controller = Controller::new();

        // A broken volume with pending work and five straight failures.
        let caches_bad = caches_for(host_bad.path(), &full_descriptor(), "Bad");
        plant(host_bad.path(), MKEXT_RPATH, b"stale");
        let mut vol = WatchedVol::new(caches_bad, Vec::new());
        vol.errcount = MAX_ERRCOUNT;
        controller.adopt_volume("sdx2", vol);

        // A healthy, current volume.
        let caches_good = caches_for(host_good.path(), &full_descriptor(), "Good");
        controller.adopt_volume("sdy2", WatchedVol::new(caches_good, Vec::new()));

        let (tx, rx) = std::sync::mpsc::channel();
        controller.handle(Event::Control {
            endpoint: 5,
            request: ControlRequest::LockReboot,
            reply: tx,
        });
        assert_eq!(rx.recv().unwrap(), ControlReply::Ok);

        // With the reboot lock held, volume locks are refused.
        let (tx, rx) = std::sync::mpsc::channel();
        controller.handle(Event::Control {
            endpoint: 6,
            request: ControlRequest::LockVolume {
                bsdname: "sdy2".into(),
            },
            reply: tx,
        });
        assert_eq!(rx.recv().unwrap(), ControlReply::Busy { device: None });
    }

    #[test]
    fn test_reboot_blocked_by_healthy_pending_volume() {
        let host = TempDir::new().unwrap();
        let mut controller = controller_with_vol(&host);
        plant(host.path(), MKEXT_RPATH, b"stale");

        let (tx, rx) = std::sync::mpsc::channel();
        controller.handle(Event::Control {
            endpoint: 5,
            request: ControlRequest::LockReboot,
            reply: tx,
        });
        assert_eq!(
            rx.recv().unwrap(),
            ControlReply::Busy {
                device: Some("sdz2".into())
            }
        );
    }

    #[test]
    fn test_unmount_dissent() {
        let host = TempDir::new().unwrap();
        let mut controller = controller_with_vol(&host);

        // Clean volume: no objection.
        assert!(controller.unmount_dissent("sdz2").is_none());

        // Pending work dissents.
        plant(host.path(), MKEXT_RPATH, b"stale");
        assert!(controller.unmount_dissent("sdz2").is_some());

        // So does a held lock, even on a clean volume.
        let host2 = TempDir::new().unwrap();
        let mut controller = controller_with_vol(&host2);
        let (tx, rx) = std::sync::mpsc::channel();
        controller.handle(Event::Control {
            endpoint: 1,
            request: ControlRequest::LockVolume {
                bsdname: "sdz2".into(),
            },
            reply: tx,
        });
        assert_eq!(rx.recv().unwrap(), ControlReply::Ok);
        assert!(controller.unmount_dissent("sdz2").is_some());
    }

    #[test]
    fn test_parse_udev_lines() {
        assert_eq!(
            parse_udev_line(
                "UDEV  [8723.123456] add      /devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sdb/sdb1 (block)"
            ),
            Some(DiskEvent::Appeared {
                devname: "sdb1".into()
            })
        );
        assert_eq!(
            parse_udev_line("UDEV  [8730.0] remove   /devices/virtual/block/loop3 (block)"),
            Some(DiskEvent::Disappeared {
                devname: "loop3".into()
            })
        );
        assert_eq!(
            parse_udev_line("KERNEL[8723.1] add /devices/virtual/block/loop3 (block)"),
            None,
            "kernel-stage events are ignored in favor of the udev stage"
        );
        assert_eq!(parse_udev_line("monitor will print the received events for:"), None);
    }

    #[test]
    fn test_control_request_wire_format() {
        let request: ControlRequest =
            serde_json::from_str(r#"{"op":"lock_volume","bsdname":"sda2"}"#).unwrap();
        assert_eq!(
            request,
            ControlRequest::LockVolume {
                bsdname: "sda2".into()
            }
        );

        let reply = ControlReply::Busy {
            device: Some("sda2".into()),
        };
        assert_eq!(
            serde_json::to_string(&reply).unwrap(),
            r#"{"result":"busy","device":"sda2"}"#
        );
    }
}
