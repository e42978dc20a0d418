//! Error taxonomy of the daemon, split by failure domain. Ad-hoc
//! propagation elsewhere uses `anyhow` with context; these types exist
//! where a caller needs to branch on the kind of failure.

use std::path::PathBuf;

/// The per-volume descriptor could not be honored. A volume with a bad
/// descriptor is ignored and the rejection logged once. Unknown keys
/// surface as `Malformed`: the descriptor must be entirely understood.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("descriptor is not a valid property list: {detail}")]
    Malformed { detail: String },

    #[error("descriptor owned by uid {uid}, expected root")]
    WrongOwnership { uid: u32 },

    #[error("descriptor is writable by group or other (mode {mode:o})")]
    WritableByGroupOrOther { mode: u32 },

    #[error("cached path '{rpath}' exceeds the maximum path length")]
    PathTooLong { rpath: PathBuf },
}

/// A helper-partition update failed. Each helper rolls back
/// independently; any helper failure withholds the bootstamp commit.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("helper partition is {size} bytes, below the minimum")]
    HelperTooSmall { size: u64 },

    #[error("host volume changed identity mid-update")]
    HostVolumeChanged,

    #[error("source '{rpath}' is zero length")]
    ZeroLengthSource { rpath: PathBuf },

    #[error("source '{rpath}' disappeared or became unreadable")]
    StaleRead { rpath: PathBuf },

    #[error("could not commit the blessed inode pair")]
    BlessFailed,

    #[error("helper '{helper}' was rolled back")]
    RolledBack { helper: String },
}
