//! Volume-level plumbing shared by the daemon: scope-confined filesystem
//! primitives, helper-partition mounting, block-device discovery, process
//! output checking, and finder-info extended attributes.

pub mod attrs;
pub mod exe;
pub mod lsblk;
pub mod mount;
pub mod scoped;

mod crate_private {
    /// Prevents downstream impls of the output-checking extension traits.
    pub trait Sealed {}
}
