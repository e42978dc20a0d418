//! Per-volume boot cache descriptors, bootstamps, and staleness.
//!
//! A `BootCaches` is built from a volume's `bootcaches.plist` and holds an
//! open descriptor on that file for its whole lifetime. That descriptor
//! doubles as the volume's [`Scope`]: every mutation made on behalf of the
//! volume is device-checked against it, and it pins the volume's identity
//! so a remount cannot be confused for the original filesystem.

use std::{
    fs,
    io::Read,
    os::fd::OwnedFd,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Error};
use log::{debug, info};
use nix::{fcntl::OFlag, sys::stat::Mode};

use bosun_api::{
    config::BootCachesPlist,
    constants::{BOOTCACHES_RELATIVE_PATH, BOOTSTAMPS_RELATIVE_PATH, CACHE_DIR_MODE, UID_DISRESPECTED},
    error::DescriptorError,
};
use volutils::scoped::{self, Scope};

/// Timestamps of a live source, captured when staleness was assessed and
/// replayed onto the bootstamp once every helper has been updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub atime: (i64, i64),
    pub mtime: (i64, i64),
}

/// One canonical artifact mirrored onto helper partitions.
#[derive(Debug)]
pub struct CachedPath {
    /// Location relative to the volume root.
    pub rpath: PathBuf,

    /// The artifact's bootstamp, relative to the volume root: lives in the
    /// per-UUID stamp directory under a name derived from `rpath` with
    /// slashes rewritten to colons.
    pub tspath: PathBuf,

    /// Source times captured by the most recent staleness check; `None`
    /// until a check has seen the source exist.
    pub tstamps: Option<Timestamps>,
}

impl CachedPath {
    fn new(uuid: &str, rpath: &str) -> Result<Self, DescriptorError> {
        let flattened = rpath.replace('/', ":");
        let tspath = Path::new(BOOTSTAMPS_RELATIVE_PATH)
            .join(uuid)
            .join(flattened);
        if rpath.len() >= libc::PATH_MAX as usize
            || tspath.as_os_str().len() >= libc::PATH_MAX as usize
        {
            return Err(DescriptorError::PathTooLong {
                rpath: PathBuf::from(rpath),
            });
        }
        Ok(CachedPath {
            rpath: PathBuf::from(rpath),
            tspath,
            tstamps: None,
        })
    }
}

/// Which content classes are out of date on a volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Staleness {
    pub any: bool,
    pub rps: bool,
    pub booters: bool,
    pub misc: bool,
}

impl Staleness {
    /// Everything stale; the `-f` path.
    pub fn forced() -> Self {
        Staleness {
            any: true,
            rps: true,
            booters: true,
            misc: true,
        }
    }
}

#[derive(Debug)]
pub struct BootCaches {
    root: PathBuf,
    uuid: String,
    label: String,
    devname: String,
    scope: Scope,
    descriptor: BootCachesPlist,

    /// Kernel extension repository, relative to the root.
    exts: Option<PathBuf>,
    archs: Vec<String>,

    /// The atomically-updated generation set.
    rps: Vec<CachedPath>,

    /// Advisory files: labels and friends.
    misc: Vec<CachedPath>,

    efibooter: Option<CachedPath>,
    ofbooter: Option<CachedPath>,

    mkext_idx: Option<usize>,
    bootconfig_idx: Option<usize>,
    label_idx: Option<usize>,
}

impl BootCaches {
    /// Builds the `BootCaches` for the volume mounted at `root`, resolving
    /// its identity through lsblk. Returns `None` when the volume carries
    /// no descriptor or asked to be ignored.
    pub fn for_volume(root: &Path) -> Result<Option<BootCaches>, Error> {
        let Some((scope, bytes, dev)) = open_descriptor(root)? else {
            return Ok(None);
        };

        let devices = volutils::lsblk::list()?;
        let device = volutils::lsblk::find_by_devno(&devices, dev)
            .with_context(|| format!("No block device backs '{}'", root.display()))?;
        let uuid = device
            .uuid
            .clone()
            .with_context(|| format!("Volume at '{}' has no filesystem UUID", root.display()))?;
        let label = device.label.clone().unwrap_or_else(|| device.name.clone());
        let devname = device.name.clone();

        Self::from_parts(root, scope, &bytes, uuid, label, devname).map(Some)
    }

    /// Assembles a `BootCaches` from an already-opened descriptor and a
    /// known volume identity.
    pub(crate) fn from_parts(
        root: &Path,
        scope: Scope,
        descriptor_bytes: &[u8],
        uuid: String,
        label: String,
        devname: String,
    ) -> Result<BootCaches, Error> {
        let descriptor = BootCachesPlist::from_bytes(descriptor_bytes)
            .with_context(|| format!("Bad descriptor on '{}'", root.display()))?;

        let mut rps = Vec::new();
        let mut misc = Vec::new();
        let mut efibooter = None;
        let mut ofbooter = None;
        let mut exts = None;
        let mut archs = Vec::new();
        let mut mkext_idx = None;
        let mut bootconfig_idx = None;
        let mut label_idx = None;

        if let Some(pre) = &descriptor.pre_boot_paths {
            if let Some(disk_label) = &pre.disk_label {
                label_idx = Some(misc.len());
                misc.push(CachedPath::new(&uuid, disk_label)?);
            }
            for extra in pre.additional_paths.iter().flatten() {
                misc.push(CachedPath::new(&uuid, extra)?);
            }
        }

        if let Some(booters) = &descriptor.booter_paths {
            if let Some(efi) = &booters.efi_booter {
                efibooter = Some(CachedPath::new(&uuid, efi)?);
            }
            if let Some(of) = &booters.of_booter {
                ofbooter = Some(CachedPath::new(&uuid, of)?);
            }
        }

        if let Some(post) = &descriptor.post_boot_paths {
            if let Some(config) = &post.boot_config {
                bootconfig_idx = Some(rps.len());
                rps.push(CachedPath::new(&uuid, config)?);
            }
            if let Some(mkext) = &post.mkext {
                mkext_idx = Some(rps.len());
                rps.push(CachedPath::new(&uuid, &mkext.path)?);
                exts = Some(PathBuf::from(&mkext.extensions_dir));
                archs = mkext.archs.clone();
            }
            for extra in post.additional_paths.iter().flatten() {
                rps.push(CachedPath::new(&uuid, extra)?);
            }
        }

        let caches = BootCaches {
            root: root.to_path_buf(),
            uuid,
            label,
            devname,
            scope,
            descriptor,
            exts,
            archs,
            rps,
            misc,
            efibooter,
            ofbooter,
            mkext_idx,
            bootconfig_idx,
            label_idx,
        };

        // The per-UUID stamp directory must exist before anything can be
        // certified.
        let stampdir = caches.bootstamp_dir();
        scoped::sdeepmkdir(
            &caches.scope,
            &stampdir,
            Mode::from_bits_truncate(CACHE_DIR_MODE),
        )
        .with_context(|| format!("Failed to create '{}'", stampdir.display()))?;

        debug!(
            "{}: {} RPS, {} misc, efi {}, of {}",
            caches.devname,
            caches.rps.len(),
            caches.misc.len(),
            caches.efibooter.is_some(),
            caches.ofbooter.is_some(),
        );
        Ok(caches)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn devname(&self) -> &str {
        &self.devname
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn descriptor(&self) -> &BootCachesPlist {
        &self.descriptor
    }

    pub fn archs(&self) -> &[String] {
        &self.archs
    }

    pub fn rps_paths(&self) -> &[CachedPath] {
        &self.rps
    }

    pub fn misc_paths(&self) -> &[CachedPath] {
        &self.misc
    }

    pub fn efibooter(&self) -> Option<&CachedPath> {
        self.efibooter.as_ref()
    }

    pub fn ofbooter(&self) -> Option<&CachedPath> {
        self.ofbooter.as_ref()
    }

    pub fn mkext(&self) -> Option<&CachedPath> {
        self.mkext_idx.map(|i| &self.rps[i])
    }

    pub fn bootconfig(&self) -> Option<&CachedPath> {
        self.bootconfig_idx.map(|i| &self.rps[i])
    }

    pub fn disk_label(&self) -> Option<&CachedPath> {
        self.label_idx.map(|i| &self.misc[i])
    }

    /// Absolute path of the extensions repository, if the descriptor
    /// names one.
    pub fn exts_dir(&self) -> Option<PathBuf> {
        self.exts.as_ref().map(|e| self.root.join(e))
    }

    pub fn bootstamp_dir(&self) -> PathBuf {
        self.root.join(BOOTSTAMPS_RELATIVE_PATH).join(&self.uuid)
    }

    /// Every path the controller should watch for changes, absolute.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(exts) = self.exts_dir() {
            paths.push(exts);
        }
        for cp in self.all_paths() {
            paths.push(self.root.join(&cp.rpath));
        }
        paths
    }

    fn all_paths(&self) -> impl Iterator<Item = &CachedPath> {
        self.rps
            .iter()
            .chain(self.efibooter.iter())
            .chain(self.ofbooter.iter())
            .chain(self.misc.iter())
    }

    /// Confirms the descriptor at the canonical path is still the very
    /// file the scope was opened on; a swapped-out host volume fails.
    pub fn verify_unchanged(&self) -> Result<(), Error> {
        let held = self.scope.stat().context("Failed to stat the held descriptor")?;
        let live = fs::metadata(self.root.join(BOOTCACHES_RELATIVE_PATH))
            .with_context(|| format!("Descriptor vanished from '{}'", self.root.display()))?;
        if live.dev() != held.st_dev as u64 || live.ino() != held.st_ino as u64 {
            bail!(bosun_api::error::UpdateError::HostVolumeChanged);
        }
        Ok(())
    }

    /// The staleness oracle. Visits every cached path even after finding
    /// stale content, because the visit captures the source timestamps the
    /// eventual bootstamp commit replays.
    pub fn check_staleness(&mut self) -> Result<Staleness, Error> {
        let root = self.root.clone();
        let mut out = Staleness::default();

        for cp in &mut self.rps {
            out.rps |= check_one(&root, cp)?;
        }
        for cp in self.efibooter.iter_mut().chain(self.ofbooter.iter_mut()) {
            out.booters |= check_one(&root, cp)?;
        }
        for cp in &mut self.misc {
            out.misc |= check_one(&root, cp)?;
        }
        out.any = out.rps || out.booters || out.misc;
        Ok(out)
    }

    /// Whether the mkext must be rebuilt before helpers are refreshed.
    /// The builder leaves the mkext's mtime at exactly one second past the
    /// extension repository's, so anything else means out of date.
    pub fn mkext_needs_rebuild(&self) -> Result<bool, Error> {
        let (Some(mkext), Some(exts)) = (self.mkext(), self.exts_dir()) else {
            return Ok(false);
        };
        let exts_meta = match fs::metadata(&exts) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).context(format!("Failed to stat '{}'", exts.display()));
            }
        };
        let mkext_abs = self.root.join(&mkext.rpath);
        let mkext_meta = match fs::metadata(&mkext_abs) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => {
                return Err(e).context(format!("Failed to stat '{}'", mkext_abs.display()));
            }
        };
        Ok(mkext_meta.mtime() != exts_meta.mtime() + 1)
    }

    /// Certifies the just-updated helpers: writes a zero-byte stamp per
    /// cached path whose times mirror the source as it was when staleness
    /// was assessed. Called only after every helper succeeded.
    pub fn write_bootstamps(&self) -> Result<(), Error> {
        for cp in self.all_paths() {
            let Some(stamps) = cp.tstamps else {
                continue;
            };
            let abs = self.root.join(&cp.tspath);
            scoped::sunlink_if_present(&self.scope, &abs)
                .with_context(|| format!("Failed to clear stamp '{}'", abs.display()))?;
            let stamp = scoped::sopen(
                &self.scope,
                &abs,
                OFlag::O_WRONLY | OFlag::O_CREAT,
                Mode::from_bits_truncate(0o644),
            )
            .with_context(|| format!("Failed to create stamp '{}'", abs.display()))?;
            scoped::set_times_ns(&stamp, stamps.atime, stamps.mtime, &abs)
                .with_context(|| format!("Failed to stamp '{}'", abs.display()))?;
        }
        info!("{}: bootstamps written", self.devname);
        Ok(())
    }
}

fn check_one(root: &Path, cp: &mut CachedPath) -> Result<bool, Error> {
    let src = root.join(&cp.rpath);
    let src_meta = match fs::metadata(&src) {
        Ok(meta) => meta,
        // A missing source is neither stale nor an error.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            cp.tstamps = None;
            return Ok(false);
        }
        Err(e) => return Err(e).context(format!("Failed to stat '{}'", src.display())),
    };
    cp.tstamps = Some(Timestamps {
        atime: (src_meta.atime(), src_meta.atime_nsec()),
        mtime: (src_meta.mtime(), src_meta.mtime_nsec()),
    });

    let stamp = root.join(&cp.tspath);
    match fs::metadata(&stamp) {
        Ok(meta) => Ok(meta.mtime() != src_meta.mtime() || meta.mtime_nsec() != src_meta.mtime_nsec()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e).context(format!("Failed to stat '{}'", stamp.display())),
    }
}

/// Opens and polices the descriptor. `None` means the volume is silently
/// skipped: no descriptor, or one owned by the please-ignore-me UID.
fn open_descriptor(root: &Path) -> Result<Option<(Scope, Vec<u8>, u64)>, Error> {
    let path = root.join(BOOTCACHES_RELATIVE_PATH);
    let mut file = match fs::File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context(format!("Failed to open '{}'", path.display())),
    };

    let meta = file
        .metadata()
        .with_context(|| format!("Failed to stat '{}'", path.display()))?;
    if meta.uid() == UID_DISRESPECTED {
        info!("'{}' asked to be ignored", root.display());
        return Ok(None);
    }
    if meta.uid() != 0 {
        bail!(DescriptorError::WrongOwnership { uid: meta.uid() });
    }
    let mode = meta.mode() & 0o7777;
    if mode & 0o022 != 0 {
        bail!(DescriptorError::WritableByGroupOrOther { mode });
    }

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .with_context(|| format!("Failed to read '{}'", path.display()))?;
    let dev = meta.dev();
    Ok(Some((Scope::from_fd(OwnedFd::from(file)), bytes, dev)))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    use bosun_api::config::{BooterPaths, MkextDict, PostBootPaths, PreBootPaths};

    pub const TEST_UUID: &str = "4d865fc0-9b33-3b59-a1b4-f60b0bf2cef7";

    /// A descriptor with one of everything, matching the layout the engine
    /// tests build on disk.
    pub fn full_descriptor() -> BootCachesPlist {
        BootCachesPlist {
            pre_boot_paths: Some(PreBootPaths {
                disk_label: Some("System/Library/CoreServices/.disk_label".into()),
                additional_paths: None,
            }),
            booter_paths: Some(BooterPaths {
                efi_booter: Some("System/Library/CoreServices/boot.efi".into()),
                of_booter: None,
            }),
            post_boot_paths: Some(PostBootPaths {
                boot_config: Some(
                    "Library/Preferences/SystemConfiguration/com.apple.Boot.plist".into(),
                ),
                mkext: Some(MkextDict {
                    path: "System/Library/Extensions.mkext".into(),
                    extensions_dir: "System/Library/Extensions".into(),
                    archs: vec!["x86_64".into()],
                }),
                additional_paths: None,
            }),
        }
    }

    /// Writes `descriptor` onto a volume root and assembles a BootCaches
    /// with a fixed identity, bypassing lsblk.
    pub fn caches_for(root: &Path, descriptor: &BootCachesPlist, label: &str) -> BootCaches {
        let desc_path = root.join(BOOTCACHES_RELATIVE_PATH);
        fs::create_dir_all(desc_path.parent().unwrap()).unwrap();
        fs::write(&desc_path, descriptor.to_xml().unwrap()).unwrap();

        let file = fs::File::open(&desc_path).unwrap();
        BootCaches::from_parts(
            root,
            Scope::from_fd(OwnedFd::from(file)),
            &descriptor.to_xml().unwrap(),
            TEST_UUID.to_string(),
            label.to_string(),
            "sdz2".to_string(),
        )
        .unwrap()
    }

    /// Creates a source file under the volume root.
    pub fn plant(root: &Path, rpath: &str, contents: &[u8]) -> PathBuf {
        let abs = root.join(rpath);
        fs::create_dir_all(abs.parent().unwrap()).unwrap();
        fs::write(&abs, contents).unwrap();
        abs
    }

    /// Writes a minimal boot config plist source file.
    pub fn plant_boot_config(root: &Path) -> PathBuf {
        let mut dict = plist::Dictionary::new();
        dict.insert(
            "Kernel Flags".to_string(),
            plist::Value::String(String::new()),
        );
        let abs = root.join("Library/Preferences/SystemConfiguration/com.apple.Boot.plist");
        fs::create_dir_all(abs.parent().unwrap()).unwrap();
        let mut out = Vec::new();
        plist::to_writer_xml(&mut out, &plist::Value::Dictionary(dict)).unwrap();
        fs::write(&abs, out).unwrap();
        abs
    }
}
