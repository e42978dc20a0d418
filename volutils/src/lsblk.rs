use std::path::PathBuf;

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

use crate::exe::RunAndCheck;

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct LsBlkOutput {
    pub blockdevices: Vec<BlockDevice>,
}

/// One block device as reported by `lsblk --json --output-all --bytes`.
/// Only the columns the daemon consults are modeled; the rest are ignored.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct BlockDevice {
    /// Device name, e.g. `sda2`.
    pub name: String,

    /// Device number as `major:minor`.
    #[serde(rename = "maj:min")]
    pub maj_min: Option<String>,

    /// Filesystem type, e.g. `hfsplus`.
    pub fstype: Option<String>,

    /// Filesystem label.
    pub label: Option<String>,

    /// Filesystem identifier; FAT volumes report a short serial here, so
    /// this stays a free-form string.
    pub uuid: Option<String>,

    /// GPT partition type GUID.
    pub parttype: Option<String>,

    /// Partition table type of this device (`gpt`, `dos`).
    pub pttype: Option<String>,

    /// Size in bytes.
    #[serde(default)]
    pub size: u64,

    /// Removable device.
    #[serde(default)]
    pub rm: bool,

    /// Read-only device.
    #[serde(default)]
    pub ro: bool,

    /// Transport, e.g. `sata`, `usb`, `nvme`; network-backed devices
    /// report `nbd` or `iscsi`.
    pub tran: Option<String>,

    #[serde(default, rename = "type")]
    pub devtype: Option<String>,

    #[serde(default)]
    pub mountpoint: Option<PathBuf>,

    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

impl BlockDevice {
    /// Depth-first search of this device and its children by name.
    pub fn find<'a>(&'a self, name: &str) -> Option<&'a BlockDevice> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(name))
    }
}

/// Lists all block devices on the system.
pub fn list() -> Result<Vec<BlockDevice>, Error> {
    let raw = std::process::Command::new("lsblk")
        .arg("--json")
        .arg("--output-all")
        .arg("--bytes")
        .output_and_check()
        .context("Failed to execute lsblk")?;
    parse_output(&raw)
}

pub fn parse_output(raw: &str) -> Result<Vec<BlockDevice>, Error> {
    let parsed: LsBlkOutput = serde_json::from_str(raw).context("Failed to parse lsblk output")?;
    Ok(parsed.blockdevices)
}

/// Finds the device with the given name anywhere in the tree.
pub fn find_by_name<'a>(devices: &'a [BlockDevice], name: &str) -> Option<&'a BlockDevice> {
    devices.iter().find_map(|dev| dev.find(name))
}

/// Finds the device whose device number matches `dev`, as obtained from a
/// stat of any file on the volume.
pub fn find_by_devno(devices: &[BlockDevice], dev: u64) -> Option<&BlockDevice> {
    let wanted = devno_string(dev);
    fn walk<'a>(devs: &'a [BlockDevice], wanted: &str) -> Option<&'a BlockDevice> {
        for dev in devs {
            if dev.maj_min.as_deref() == Some(wanted) {
                return Some(dev);
            }
            if let Some(hit) = walk(&dev.children, wanted) {
                return Some(hit);
            }
        }
        None
    }
    walk(devices, &wanted)
}

/// Returns the top-level device that `name` belongs to, if any.
pub fn parent_disk<'a>(devices: &'a [BlockDevice], name: &str) -> Option<&'a BlockDevice> {
    devices.iter().find(|disk| disk.find(name).is_some())
}

/// Sibling partitions of `name` on the same disk whose partition type GUID
/// matches `parttype` (case-insensitive).
pub fn sibling_partitions_of_type<'a>(
    devices: &'a [BlockDevice],
    name: &str,
    parttype: &str,
) -> Vec<&'a BlockDevice> {
    let Some(disk) = parent_disk(devices, name) else {
        return Vec::new();
    };
    disk.children
        .iter()
        .filter(|part| part.name != name)
        .filter(|part| {
            part.parttype
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case(parttype))
        })
        .collect()
}

/// Whether a device is backed by the network rather than local media.
pub fn is_network_backed(dev: &BlockDevice) -> bool {
    // Network block transports; filesystem-level network mounts never
    // appear in lsblk at all.
    matches!(dev.tran.as_deref(), Some("nbd") | Some("iscsi") | Some("nvme-tcp"))
        || dev.name.starts_with("nbd")
}

/// Renders a stat `st_dev` as lsblk's `major:minor` column.
pub fn devno_string(dev: u64) -> String {
    format!(
        "{}:{}",
        nix::sys::stat::major(dev),
        nix::sys::stat::minor(dev)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    const SAMPLE: &str = r#"{
        "blockdevices": [
            {
                "name": "sda",
                "maj:min": "8:0",
                "size": 256060514304,
                "pttype": "gpt",
                "type": "disk",
                "tran": "sata",
                "children": [
                    {
                        "name": "sda1",
                        "maj:min": "8:1",
                        "size": 209715200,
                        "fstype": "hfsplus",
                        "parttype": "426f6f74-0000-11aa-aa11-00306543ecac",
                        "type": "part"
                    },
                    {
                        "name": "sda2",
                        "maj:min": "8:2",
                        "size": 255646433280,
                        "fstype": "hfsplus",
                        "label": "Macintosh HD",
                        "uuid": "4d865fc0-9b33-3b59-a1b4-f60b0bf2cef7",
                        "parttype": "48465300-0000-11aa-aa11-00306543ecac",
                        "type": "part",
                        "mountpoint": "/mnt/machd"
                    }
                ]
            },
            {
                "name": "nbd0",
                "maj:min": "43:0",
                "size": 1073741824,
                "type": "disk"
            }
        ]
    }"#;

    #[test]
    fn test_parse_sample() {
        let devices = parse_output(SAMPLE).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].children.len(), 2);
        assert_eq!(devices[0].pttype.as_deref(), Some("gpt"));

        let host = find_by_name(&devices, "sda2").unwrap();
        assert_eq!(host.label.as_deref(), Some("Macintosh HD"));
        assert_eq!(host.mountpoint.as_deref(), Some(Path::new("/mnt/machd")));
    }

    #[test]
    fn test_find_by_devno() {
        let devices = parse_output(SAMPLE).unwrap();
        let dev = nix::sys::stat::makedev(8, 2);
        assert_eq!(find_by_devno(&devices, dev).unwrap().name, "sda2");
        assert!(find_by_devno(&devices, nix::sys::stat::makedev(8, 9)).is_none());
    }

    #[test]
    fn test_helper_siblings() {
        let devices = parse_output(SAMPLE).unwrap();
        let helpers = sibling_partitions_of_type(
            &devices,
            "sda2",
            "426F6F74-0000-11AA-AA11-00306543ECAC",
        );
        assert_eq!(helpers.len(), 1);
        assert_eq!(helpers[0].name, "sda1");

        // The host partition itself never counts as its own helper.
        let none = sibling_partitions_of_type(
            &devices,
            "sda1",
            "48465300-0000-11aa-aa11-00306543ecac",
        );
        assert_eq!(none.len(), 1, "the data partition is sda1's sibling");
    }

    #[test]
    fn test_network_backed() {
        let devices = parse_output(SAMPLE).unwrap();
        assert!(is_network_backed(find_by_name(&devices, "nbd0").unwrap()));
        assert!(!is_network_backed(find_by_name(&devices, "sda").unwrap()));
    }
}
