use const_format::concatcp;

/// Per-volume descriptor of the boot artifacts that must be mirrored onto
/// the volume's helper partitions, relative to the volume root.
pub const BOOTCACHES_RELATIVE_PATH: &str = "usr/standalone/bootcaches.plist";

/// Parent of the bootstamp tree, relative to the volume root.
pub const CACHES_RELATIVE_PATH: &str = "System/Library/Caches";

/// The bootstamp tree: one subdirectory per volume UUID, one zero-byte
/// stamp file per mirrored artifact.
pub const BOOTSTAMPS_RELATIVE_PATH: &str = concatcp!(CACHES_RELATIVE_PATH, "/com.apple.bootstamps");

/// Mode of the per-UUID bootstamp directory and of staged RPS directories.
pub const CACHE_DIR_MODE: u32 = 0o755;

/// The three-slot rotation of atomically-switched boot content directories
/// at the root of every helper partition.
pub const RPS_DIR_PREFIX: &str = "com.apple.boot.";
pub const RPS_DIR_R: &str = concatcp!(RPS_DIR_PREFIX, "R");
pub const RPS_DIR_P: &str = concatcp!(RPS_DIR_PREFIX, "P");
pub const RPS_DIR_S: &str = concatcp!(RPS_DIR_PREFIX, "S");

/// Key inserted into the staged boot configuration so the booter can find
/// the host volume without consulting on-disk partition numbering.
pub const ROOT_UUID_KEY: &str = "Root UUID";

/// Suffix of the plain-text sibling written next to each disk label.
pub const CONTENT_DETAILS_SUFFIX: &str = ".contentDetails";

/// Suffix of not-yet-activated misc staging copies.
pub const DOT_NEW_SUFFIX: &str = ".new";

/// Suffix of booter fallback copies kept until an update commits.
pub const DOT_OLD_SUFFIX: &str = ".old";

/// Record at a helper's root naming the blessed (directory, booter) inode
/// pair. Rewritten whole via an exclusive-create + rename pivot, so the
/// commit is a single atomic operation.
pub const FINDER_INFO_FILE: &str = ".finderinfo";

/// Helpers below this size cannot hold a full artifact set and are refused.
pub const MIN_HELPER_BYTES: u64 = 128 * 1024 * 1024;

/// Quiet period after the last filesystem notification before a volume is
/// re-examined. Bursts within the window coalesce into one rebuild.
pub const SETTLE_DELAY_SECS: u64 = 5;

/// Volumes that fail this many consecutive rebuilds stop blocking reboot.
pub const MAX_ERRCOUNT: u32 = 5;

/// sysexits(3) EX_TEMPFAIL: the builder is not done but did not fail.
pub const EX_TEMPFAIL: i32 = 75;

/// The external kernel-extension cache builder.
pub const CACHE_BUILDER: &str = "kextcache";

/// Volumes whose descriptor is owned by this UID asked to be left alone.
pub const UID_DISRESPECTED: u32 = 99;

/// GPT partition type of helper partitions, as reported by lsblk.
pub const HELPER_PARTTYPE_GUID: &str = "426f6f74-0000-11aa-aa11-00306543ecac";

/// Default control socket of the daemon.
pub const CONTROL_SOCKET_PATH: &str = "/run/bosun/bosun.sock";

/// Directory under which helper partitions are privately mounted.
pub const HELPER_MOUNT_PARENT: &str = "/run/bosun";
