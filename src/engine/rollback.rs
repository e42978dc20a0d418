//! The update cursor and its unwinding.
//!
//! The per-helper update advances a linear cursor; on failure the cursor
//! value alone decides which reverse actions restore the helper to its
//! prior bootable state. Unwinding never relies on stack state: everything
//! it needs lives in the [`UpdatingVol`].

use anyhow::{Context, Error};
use log::{debug, warn};
use strum_macros::Display;

use bosun_api::constants::DOT_OLD_SUFFIX;
use volutils::scoped;

use super::{with_suffix, UpdatingVol};

/// How far the forward pass got. Ordering matters: each value implies all
/// earlier mutations have happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[strum(serialize_all = "camelCase")]
pub enum ChangeState {
    Nothing,
    LabelsNuked,
    CopyingOf,
    CopyingEfi,
    CopiedBooters,
    ActivatingOf,
    ActivatingEfi,
    ActivatedBooters,
}

/// Best-effort unwind. A failure during unwinding is logged and swallowed;
/// the helper stays marked failed and the next scan retries from scratch.
pub(super) fn revert(up: &mut UpdatingVol) {
    debug!(
        "{} helper {}: reverting from state {}",
        up.caches.devname(),
        up.helper_root.display(),
        up.state
    );
    let result = match up.state {
        ChangeState::Nothing => Ok(()),
        ChangeState::LabelsNuked => rewrite_labels(up),
        ChangeState::CopyingOf
        | ChangeState::CopyingEfi
        | ChangeState::CopiedBooters
        | ChangeState::ActivatingOf
        | ChangeState::ActivatingEfi => {
            restore_booter_copies(up).and_then(|()| rewrite_labels(up))
        }
        ChangeState::ActivatedBooters => rebless_old(up).and_then(|()| rewrite_labels(up)),
    };
    if let Err(e) = result {
        warn!(
            "{} helper {}: rollback incomplete: {:#}",
            up.caches.devname(),
            up.helper_root.display(),
            e
        );
    }
}

/// Booters were copied but the blessed inode pair never changed: the
/// `.old` files still carry the blessed inodes, so renaming them back over
/// the destinations restores the exact pre-update state. A destination
/// with no `.old` sibling never existed before and is removed.
fn restore_booter_copies(up: &UpdatingVol) -> Result<(), Error> {
    for cp in up.booters() {
        let dst = up.helper_root.join(&cp.rpath);
        let old = with_suffix(&dst, DOT_OLD_SUFFIX);
        let renamed = scoped::srename_if_present(&up.scope, &old, &dst)
            .with_context(|| format!("Failed to restore '{}'", dst.display()))?;
        if !renamed {
            scoped::sunlink_if_present(&up.scope, &dst)
                .with_context(|| format!("Failed to drop partial '{}'", dst.display()))?;
        }
    }
    Ok(())
}

/// The new booters were already consecrated; point the blessed pair back
/// at the set-aside copies by re-running activation against the `.old`
/// paths.
fn rebless_old(up: &UpdatingVol) -> Result<(), Error> {
    let old_paths: Vec<_> = up
        .booters()
        .map(|cp| with_suffix(&up.helper_root.join(&cp.rpath), DOT_OLD_SUFFIX))
        .collect();
    let efi_old = up
        .efibooter_path()
        .map(|dst| with_suffix(&dst, DOT_OLD_SUFFIX));
    super::activate_booter_files(up, &old_paths, efi_old.as_deref())
}

fn rewrite_labels(up: &UpdatingVol) -> Result<(), Error> {
    super::write_labels(up)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_is_totally_ordered() {
        let states = [
            ChangeState::Nothing,
            ChangeState::LabelsNuked,
            ChangeState::CopyingOf,
            ChangeState::CopyingEfi,
            ChangeState::CopiedBooters,
            ChangeState::ActivatingOf,
            ChangeState::ActivatingEfi,
            ChangeState::ActivatedBooters,
        ];
        for pair in states.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_cursor_names() {
        assert_eq!(ChangeState::LabelsNuked.to_string(), "labelsNuked");
        assert_eq!(ChangeState::ActivatedBooters.to_string(), "activatedBooters");
    }
}
