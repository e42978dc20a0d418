//! The helper-partition update engine.
//!
//! Given a host volume with stale content, every helper partition is
//! brought to a state that boots, or left in its prior bootable state.
//! Staging always lands in inactive names (`.new` siblings, a free RPS
//! slot, `.old` set-asides) and becomes live through renames and one
//! atomic bless commit, so a crash at any point leaves a helper the
//! firmware can still boot.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Error};
use log::{debug, info, warn};
use nix::{errno::Errno, fcntl::OFlag, sys::stat::Mode};

use bosun_api::{
    config::{Activation, ContentPolicy, MissingPolicy, BOOTER_POLICY, MISC_POLICY, RPS_POLICY},
    constants::{
        CACHE_DIR_MODE, CONTENT_DETAILS_SUFFIX, DOT_NEW_SUFFIX, DOT_OLD_SUFFIX, FINDER_INFO_FILE,
        HELPER_MOUNT_PARENT, MIN_HELPER_BYTES, ROOT_UUID_KEY,
    },
    error::UpdateError,
};
use volutils::{
    attrs::{self, BOOTER_TYPE_CREATOR, LABEL_TYPE_CREATOR},
    mount::{self, MountFsType, MountGuard},
    scoped::{self, Scope},
};

use crate::bootcaches::{BootCaches, CachedPath, Staleness};

pub mod rollback;
pub mod rps;

use rollback::ChangeState;
use rps::RpsPlan;

/// One helper partition of a host volume, as discovered on its disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperPartition {
    pub devname: String,
    pub dev_path: PathBuf,
    pub size: u64,
}

/// Transient state of a single helper-partition update.
pub(crate) struct UpdatingVol<'a> {
    pub(crate) caches: &'a BootCaches,
    pub(crate) stale: Staleness,
    pub(crate) helper_root: PathBuf,
    pub(crate) scope: Scope,
    pub(crate) ordinal: usize,
    pub(crate) helper_count: usize,
    pub(crate) plan: RpsPlan,
    pub(crate) state: ChangeState,
    committed: bool,
}

/// Brings every helper of the host volume up to date. Returns whether any
/// work was performed; bootstamps are written only when every helper
/// succeeded, so a partial failure leaves the volume detectably stale.
pub fn update_volume(
    caches: &mut BootCaches,
    helpers: &[HelperPartition],
    force: bool,
) -> Result<bool, Error> {
    let mut stale = caches
        .check_staleness()
        .context("Failed to assess staleness")?;
    if force {
        stale = Staleness::forced();
    }
    if !stale.any {
        debug!("{}: helpers already current", caches.devname());
        return Ok(false);
    }
    if helpers.is_empty() {
        bail!("{}: no helper partitions found", caches.devname());
    }

    let mut failures = 0;
    for (ordinal, helper) in helpers.iter().enumerate() {
        if let Err(e) = update_one_helper(caches, stale, helper, ordinal, helpers.len()) {
            warn!("{}: helper {} failed: {:#}", caches.devname(), helper.devname, e);
            failures += 1;
        }
    }
    if failures > 0 {
        bail!(
            "{}: {failures} of {} helpers failed; bootstamps withheld",
            caches.devname(),
            helpers.len()
        );
    }

    caches.write_bootstamps()?;
    info!("{}: {} helper(s) updated", caches.devname(), helpers.len());
    Ok(true)
}

fn update_one_helper(
    caches: &BootCaches,
    stale: Staleness,
    helper: &HelperPartition,
    ordinal: usize,
    helper_count: usize,
) -> Result<(), Error> {
    if helper.size < MIN_HELPER_BYTES {
        bail!(UpdateError::HelperTooSmall { size: helper.size });
    }

    fs::create_dir_all(HELPER_MOUNT_PARENT)
        .with_context(|| format!("Failed to create '{HELPER_MOUNT_PARENT}'"))?;
    let mount_dir = tempfile::Builder::new()
        .prefix("helper.")
        .tempdir_in(HELPER_MOUNT_PARENT)
        .context("Failed to create a private mount point")?;

    mount::mount(
        &helper.dev_path,
        mount_dir.path(),
        MountFsType::Auto,
        &["rw".into()],
    )?;
    let _guard = MountGuard {
        mount_dir: mount_dir.path(),
    };

    // The host volume must still be the one the descriptor was opened on.
    caches.verify_unchanged()?;

    update_helper_tree(caches, stale, mount_dir.path(), ordinal, helper_count)
}

/// The per-helper algorithm, run against an already-mounted helper root.
pub(crate) fn update_helper_tree(
    caches: &BootCaches,
    stale: Staleness,
    helper_root: &Path,
    ordinal: usize,
    helper_count: usize,
) -> Result<(), Error> {
    let scope = Scope::open(helper_root)
        .with_context(|| format!("Failed to open scope on '{}'", helper_root.display()))?;
    let plan = RpsPlan::select(present_slots(helper_root));
    if plan.degenerate {
        warn!(
            "{}: helper {} carries all three RPS directories",
            caches.devname(),
            helper_root.display()
        );
    }

    let mut up = UpdatingVol {
        caches,
        stale,
        helper_root: helper_root.to_path_buf(),
        scope,
        ordinal,
        helper_count,
        plan,
        state: ChangeState::Nothing,
        committed: false,
    };

    match run_forward(&mut up) {
        Ok(()) => Ok(()),
        Err(e) if up.committed => {
            // Activation is already live; undoing now would be worse than
            // leaving the leftovers for the next rotation to reap.
            warn!(
                "{}: cleanup on helper {} incomplete: {:#}",
                caches.devname(),
                helper_root.display(),
                e
            );
            Err(e)
        }
        Err(e) => {
            rollback::revert(&mut up);
            Err(e.context(UpdateError::RolledBack {
                helper: helper_root.display().to_string(),
            }))
        }
    }
}

fn run_forward(up: &mut UpdatingVol) -> Result<(), Error> {
    if up.stale.rps {
        stage_rps(up)?;
    }
    if up.stale.misc {
        stage_misc(up);
    }
    nuke_labels(up)?;
    if up.stale.booters {
        stage_booters(up)?;
        activate(up, &BOOTER_POLICY)?;
    }
    if up.stale.rps {
        activate(up, &RPS_POLICY)?;
    }
    activate(up, &MISC_POLICY)?;

    up.committed = true;
    clean_fallbacks(up)
}

/// Dispatches a content class to its activation mechanism.
fn activate(up: &mut UpdatingVol, policy: &ContentPolicy) -> Result<(), Error> {
    match policy.activation {
        Activation::BlessRename => activate_booters(up),
        Activation::RpsPivot => activate_rps(up),
        Activation::DotNewRename => activate_misc(up),
    }
}

impl UpdatingVol<'_> {
    pub(crate) fn booters(&self) -> impl Iterator<Item = &CachedPath> {
        self.caches
            .ofbooter()
            .into_iter()
            .chain(self.caches.efibooter())
    }

    pub(crate) fn efibooter_path(&self) -> Option<PathBuf> {
        self.caches
            .efibooter()
            .map(|cp| self.helper_root.join(&cp.rpath))
    }
}

fn present_slots(helper_root: &Path) -> [bool; 3] {
    use strum::IntoEnumIterator;

    let mut present = [false; 3];
    for (i, slot) in rps::RpsSlot::iter().enumerate() {
        present[i] = helper_root.join(slot.dir_name()).is_dir();
    }
    present
}

pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Step 2: stage the atomic generation set into the free rotation slot.
fn stage_rps(up: &UpdatingVol) -> Result<(), Error> {
    let next_abs = up.helper_root.join(up.plan.staged.dir_name());
    scoped::sdeepunlink_if_present(&up.scope, &next_abs)
        .with_context(|| format!("Failed to clear '{}'", next_abs.display()))?;
    scoped::smkdir(
        &up.scope,
        &next_abs,
        Mode::from_bits_truncate(CACHE_DIR_MODE),
    )
    .with_context(|| format!("Failed to create '{}'", next_abs.display()))?;

    let is_bootconfig =
        |cp: &CachedPath| up.caches.bootconfig().is_some_and(|bc| bc.rpath == cp.rpath);

    for cp in up.caches.rps_paths() {
        let src = up.caches.root().join(&cp.rpath);
        let dst = next_abs.join(&cp.rpath);
        let meta = match fs::metadata(&src) {
            Ok(meta) => meta,
            // The generation set is all-or-nothing.
            Err(_) if RPS_POLICY.on_missing == MissingPolicy::Fail => {
                bail!(UpdateError::StaleRead {
                    rpath: cp.rpath.clone(),
                });
            }
            Err(_) => continue,
        };
        if meta.len() == 0 {
            bail!(UpdateError::ZeroLengthSource {
                rpath: cp.rpath.clone(),
            });
        }

        if is_bootconfig(cp) {
            stage_boot_config(up, &src, &dst)
                .with_context(|| format!("Failed to stage boot config '{}'", cp.rpath.display()))?;
        } else {
            scoped::scopy(&up.scope, &src, &dst)
                .with_context(|| format!("Failed to stage '{}'", cp.rpath.display()))?;
        }
    }
    debug!(
        "{}: staged {} RPS paths into {}",
        up.caches.devname(),
        up.caches.rps_paths().len(),
        up.plan.staged
    );
    Ok(())
}

/// The boot configuration is not byte-copied: the staged copy carries the
/// host volume's UUID so the booter can identify its root filesystem.
fn stage_boot_config(up: &UpdatingVol, src: &Path, dst: &Path) -> Result<(), Error> {
    let value = plist::Value::from_file(src)
        .with_context(|| format!("Failed to read '{}'", src.display()))?;
    let mut dict = value
        .into_dictionary()
        .with_context(|| format!("'{}' is not a dictionary", src.display()))?;
    dict.insert(
        ROOT_UUID_KEY.to_string(),
        plist::Value::String(up.caches.uuid().to_string()),
    );

    let mut bytes = Vec::new();
    plist::to_writer_xml(&mut bytes, &plist::Value::Dictionary(dict))
        .context("Failed to serialize boot config")?;

    if let Some(parent) = dst.parent() {
        scoped::sdeepmkdir(&up.scope, parent, Mode::from_bits_truncate(CACHE_DIR_MODE))?;
    }
    scoped::sunlink_if_present(&up.scope, dst)?;
    let mut out = scoped::sopen(
        &up.scope,
        dst,
        OFlag::O_WRONLY | OFlag::O_CREAT,
        Mode::from_bits_truncate(0o644),
    )?;
    std::io::Write::write_all(&mut out, &bytes)
        .with_context(|| format!("Failed to write '{}'", dst.display()))?;
    Ok(())
}

/// Step 3: advisory content goes to `.new` siblings. Missing sources are
/// skipped and failures only logged.
fn stage_misc(up: &UpdatingVol) {
    for cp in up.caches.misc_paths() {
        let src = up.caches.root().join(&cp.rpath);
        if !src.exists() {
            if MISC_POLICY.on_missing == MissingPolicy::Warn {
                warn!("{}: '{}' has no source", up.caches.devname(), cp.rpath.display());
            }
            continue;
        }
        let dst = with_suffix(&up.helper_root.join(&cp.rpath), DOT_NEW_SUFFIX);
        if let Err(e) = scoped::scopy(&up.scope, &src, &dst) {
            // Advisory content never fails the helper.
            debug_assert!(!MISC_POLICY.mandatory);
            warn!(
                "{}: staging misc '{}' failed: {}",
                up.caches.devname(),
                cp.rpath.display(),
                e
            );
        }
    }
}

/// Step 4: labels are removed unconditionally; fresh ones are generated
/// during activation.
fn nuke_labels(up: &mut UpdatingVol) -> Result<(), Error> {
    if let Some(label) = up.caches.disk_label() {
        let dst = up.helper_root.join(&label.rpath);
        scoped::sunlink_if_present(&up.scope, &dst)?;
        scoped::sunlink_if_present(&up.scope, &with_suffix(&dst, CONTENT_DETAILS_SUFFIX))?;
    }
    up.state = ChangeState::LabelsNuked;
    Ok(())
}

/// Step 5: set the live booters aside as `.old` and copy in new ones.
fn stage_booters(up: &mut UpdatingVol) -> Result<(), Error> {
    let pairs = [
        (ChangeState::CopyingOf, up.caches.ofbooter()),
        (ChangeState::CopyingEfi, up.caches.efibooter()),
    ];
    for (state, cp) in pairs {
        let Some(cp) = cp else { continue };
        let src = up.caches.root().join(&cp.rpath);
        if !src.exists() {
            if BOOTER_POLICY.on_missing == MissingPolicy::Warn {
                warn!(
                    "{}: booter source '{}' missing; leaving helper copy alone",
                    up.caches.devname(),
                    cp.rpath.display()
                );
            }
            continue;
        }
        up.state = state;
        let dst = up.helper_root.join(&cp.rpath);
        scoped::srename_if_present(&up.scope, &dst, &with_suffix(&dst, DOT_OLD_SUFFIX))
            .with_context(|| format!("Failed to set aside '{}'", cp.rpath.display()))?;
        scoped::scopy(&up.scope, &src, &dst)
            .with_context(|| format!("Failed to stage booter '{}'", cp.rpath.display()))?;
    }
    up.state = ChangeState::CopiedBooters;
    Ok(())
}

/// Pushes one staged booter to stable storage and types it. A missing
/// path is skipped (the host may define only one kind of booter).
fn activate_one_booter(up: &UpdatingVol, path: &Path) -> Result<(), Error> {
    let file = match scoped::sopen(&up.scope, path, OFlag::O_RDWR, Mode::empty()) {
        Ok(file) => file,
        Err(e) if e.errno() == Some(Errno::ENOENT) => return Ok(()),
        Err(e) => {
            return Err(e).context(format!("Failed to open booter '{}'", path.display()));
        }
    };
    scoped::full_sync(&file, path)
        .with_context(|| format!("Failed to sync booter '{}'", path.display()))?;
    match attrs::set_type_creator(&file, &BOOTER_TYPE_CREATOR) {
        Ok(()) => {}
        // FAT-class helpers may not carry xattrs; the bless still works.
        Err(Errno::ENOTSUP) => debug!("no xattr support on '{}'", path.display()),
        Err(e) => {
            return Err(e).context(format!("Failed to type booter '{}'", path.display()));
        }
    }
    Ok(())
}

/// Writes the blessed inode pair through an exclusive-create + rename
/// pivot: the one operation that makes new booters effective.
fn bless_inodes(up: &UpdatingVol, efi: &Path) -> Result<(), Error> {
    use std::os::unix::fs::MetadataExt;

    let dir_ino = efi
        .parent()
        .and_then(|p| fs::metadata(p).ok())
        .map(|m| m.ino())
        .context("Booter parent directory is missing")?;
    let file_ino = fs::metadata(efi)
        .with_context(|| format!("Booter '{}' is missing", efi.display()))?
        .ino();

    let mut record = [0u8; 32];
    record[0..8].copy_from_slice(&dir_ino.to_be_bytes());
    record[8..16].copy_from_slice(&file_ino.to_be_bytes());

    let finder = up.helper_root.join(FINDER_INFO_FILE);
    let staging = with_suffix(&finder, DOT_NEW_SUFFIX);
    scoped::sunlink_if_present(&up.scope, &staging)?;
    let mut out = scoped::sopen(
        &up.scope,
        &staging,
        OFlag::O_WRONLY | OFlag::O_CREAT,
        Mode::from_bits_truncate(0o600),
    )
    .map_err(|e| Error::from(e).context(UpdateError::BlessFailed))?;
    std::io::Write::write_all(&mut out, &record).context(UpdateError::BlessFailed)?;
    scoped::full_sync(&out, &staging).context(UpdateError::BlessFailed)?;
    drop(out);
    scoped::srename(&up.scope, &staging, &finder).context(UpdateError::BlessFailed)?;
    debug!(
        "{}: blessed dir {} / booter {}",
        up.caches.devname(),
        dir_ino,
        file_ino
    );
    Ok(())
}

/// Reads a helper's blessed inode pair, if one has been committed.
pub fn read_finder_info(helper_root: &Path) -> Result<Option<(u64, u64)>, Error> {
    let path = helper_root.join(FINDER_INFO_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context(format!("Failed to read '{}'", path.display())),
    };
    if bytes.len() < 16 {
        bail!("'{}' is truncated", path.display());
    }
    let dir_ino = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
    let file_ino = u64::from_be_bytes(bytes[8..16].try_into().unwrap());
    Ok(Some((dir_ino, file_ino)))
}

/// Rollback entry point: re-run sync/typing over arbitrary booter paths
/// and re-commit the bless against them.
pub(crate) fn activate_booter_files(
    up: &UpdatingVol,
    paths: &[PathBuf],
    efi: Option<&Path>,
) -> Result<(), Error> {
    for path in paths {
        activate_one_booter(up, path)?;
    }
    if let Some(efi) = efi {
        if efi.exists() {
            bless_inodes(up, efi)?;
        }
    }
    Ok(())
}

/// Step 6: sync, type, and bless the staged booters.
fn activate_booters(up: &mut UpdatingVol) -> Result<(), Error> {
    if let Some(cp) = up.caches.ofbooter() {
        up.state = ChangeState::ActivatingOf;
        activate_one_booter(up, &up.helper_root.join(&cp.rpath))?;
    }
    if let Some(cp) = up.caches.efibooter() {
        up.state = ChangeState::ActivatingEfi;
        activate_one_booter(up, &up.helper_root.join(&cp.rpath))?;
    }
    up.state = ChangeState::ActivatedBooters;

    if let Some(efi) = up.efibooter_path() {
        if efi.exists() {
            bless_inodes(up, &efi)?;
        }
    }
    Ok(())
}

/// Step 7: rotate the old generation out of the selection's way, then
/// make every staged byte durable before the reap commits the new one.
fn activate_rps(up: &UpdatingVol) -> Result<(), Error> {
    if up.plan.needs_rotation() {
        let prev_abs = up.helper_root.join(up.plan.previous.dir_name());
        scoped::sdeepunlink_if_present(&up.scope, &prev_abs)?;
        scoped::srename(
            &up.scope,
            &up.helper_root.join(up.plan.current.dir_name()),
            &prev_abs,
        )
        .context("Failed to rotate the active RPS directory")?;
    }
    scoped::full_sync(&up.scope, &up.helper_root)
        .context("Failed to sync the helper before commit")?;
    Ok(())
}

/// Step 8: flip `.new` advisory files live and regenerate labels.
fn activate_misc(up: &UpdatingVol) -> Result<(), Error> {
    for cp in up.caches.misc_paths() {
        let dst = up.helper_root.join(&cp.rpath);
        let new = with_suffix(&dst, DOT_NEW_SUFFIX);
        if !new.exists() {
            continue;
        }
        if let Err(e) = scoped::srename(&up.scope, &new, &dst) {
            warn!(
                "{}: activating misc '{}' failed: {}",
                up.caches.devname(),
                cp.rpath.display(),
                e
            );
        }
    }
    write_labels(up)
}

/// Generates the helper's label: the volume name, qualified with the
/// helper's ordinal when the volume has several helpers.
pub(crate) fn write_labels(up: &UpdatingVol) -> Result<(), Error> {
    let Some(label_cp) = up.caches.disk_label() else {
        return Ok(());
    };
    let text = if up.helper_count > 1 {
        format!("{} {}", up.caches.label(), up.ordinal + 1)
    } else {
        up.caches.label().to_string()
    };

    let dst = up.helper_root.join(&label_cp.rpath);
    if let Some(parent) = dst.parent() {
        scoped::sdeepmkdir(&up.scope, parent, Mode::from_bits_truncate(CACHE_DIR_MODE))?;
    }

    scoped::sunlink_if_present(&up.scope, &dst)?;
    let mut label = scoped::sopen(
        &up.scope,
        &dst,
        OFlag::O_WRONLY | OFlag::O_CREAT,
        Mode::from_bits_truncate(0o644),
    )?;
    std::io::Write::write_all(&mut label, text.as_bytes())
        .with_context(|| format!("Failed to write label '{}'", dst.display()))?;
    match attrs::set_type_creator(&label, &LABEL_TYPE_CREATOR) {
        Ok(()) | Err(Errno::ENOTSUP) => {}
        Err(e) => return Err(e).context("Failed to type the label"),
    }

    let details = with_suffix(&dst, CONTENT_DETAILS_SUFFIX);
    scoped::sunlink_if_present(&up.scope, &details)?;
    let mut details_file = scoped::sopen(
        &up.scope,
        &details,
        OFlag::O_WRONLY | OFlag::O_CREAT,
        Mode::from_bits_truncate(0o644),
    )?;
    std::io::Write::write_all(&mut details_file, text.as_bytes())
        .with_context(|| format!("Failed to write '{}'", details.display()))?;
    Ok(())
}

/// Step 9: drop booter fallbacks and reap the spent rotation slot.
fn clean_fallbacks(up: &UpdatingVol) -> Result<(), Error> {
    for cp in up.booters() {
        let old = with_suffix(&up.helper_root.join(&cp.rpath), DOT_OLD_SUFFIX);
        scoped::sunlink_if_present(&up.scope, &old)?;
    }
    scoped::sdeepunlink_if_present(&up.scope, &up.helper_root.join(up.plan.previous.dir_name()))?;
    Ok(())
}
