//! Typed model of the per-volume `bootcaches.plist` descriptor.
//!
//! The descriptor is an XML property list owned by root. Trust is
//! conservative: every key must be understood, so all structs reject
//! unknown fields and a descriptor with any unrecognized key fails to
//! parse rather than being partially honored.

use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::error::DescriptorError;

/// Top-level descriptor dictionary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootCachesPlist {
    /// Content the booter needs before the kernel is up: disk labels and
    /// other advisory files.
    #[serde(rename = "PreBootPaths", default, skip_serializing_if = "Option::is_none")]
    pub pre_boot_paths: Option<PreBootPaths>,

    /// The booter binaries themselves.
    #[serde(rename = "BooterPaths", default, skip_serializing_if = "Option::is_none")]
    pub booter_paths: Option<BooterPaths>,

    /// Content read after the booter hands off: the kernel extension cache
    /// and the boot configuration, updated as one atomic generation.
    #[serde(rename = "PostBootPaths", default, skip_serializing_if = "Option::is_none")]
    pub post_boot_paths: Option<PostBootPaths>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreBootPaths {
    #[serde(rename = "DiskLabel", default, skip_serializing_if = "Option::is_none")]
    pub disk_label: Option<String>,

    #[serde(rename = "AdditionalPaths", default, skip_serializing_if = "Option::is_none")]
    pub additional_paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BooterPaths {
    #[serde(rename = "EFIBooter", default, skip_serializing_if = "Option::is_none")]
    pub efi_booter: Option<String>,

    #[serde(rename = "OFBooter", default, skip_serializing_if = "Option::is_none")]
    pub of_booter: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostBootPaths {
    #[serde(rename = "BootConfig", default, skip_serializing_if = "Option::is_none")]
    pub boot_config: Option<String>,

    #[serde(rename = "MKext", default, skip_serializing_if = "Option::is_none")]
    pub mkext: Option<MkextDict>,

    #[serde(rename = "AdditionalPaths", default, skip_serializing_if = "Option::is_none")]
    pub additional_paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MkextDict {
    /// Location of the mkext, relative to the volume root.
    #[serde(rename = "Path")]
    pub path: String,

    /// The kernel extension repository the mkext is built from.
    #[serde(rename = "ExtensionsDir")]
    pub extensions_dir: String,

    /// Architectures the builder is asked to include.
    #[serde(rename = "Archs")]
    pub archs: Vec<String>,
}

impl BootCachesPlist {
    /// Parses the XML descriptor, rejecting any unrecognized key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DescriptorError> {
        plist::from_reader(Cursor::new(bytes)).map_err(|source| DescriptorError::Malformed {
            detail: source.to_string(),
        })
    }

    /// Serializes back to XML; used by tests to prove parse/serialize
    /// round-trips and by tooling that rewrites descriptors.
    pub fn to_xml(&self) -> Result<Vec<u8>, DescriptorError> {
        let mut out = Vec::new();
        plist::to_writer_xml(&mut out, self).map_err(|source| DescriptorError::Malformed {
            detail: source.to_string(),
        })?;
        Ok(out)
    }
}

/// How the updater treats one class of helper content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentPolicy {
    /// Whether a staging failure fails the whole helper.
    pub mandatory: bool,

    /// How staged content becomes live.
    pub activation: Activation,

    /// What a missing source file means.
    pub on_missing: MissingPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Staged into an inactive rotation slot, committed by directory
    /// rename and slot reaping.
    RpsPivot,

    /// Staged as a `.new` sibling, committed by rename over the original.
    DotNewRename,

    /// Old copy set aside as `.old`, committed by rewriting the blessed
    /// inode pair.
    BlessRename,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingPolicy {
    Fail,
    Skip,
    Warn,
}

pub const RPS_POLICY: ContentPolicy = ContentPolicy {
    mandatory: true,
    activation: Activation::RpsPivot,
    on_missing: MissingPolicy::Fail,
};

pub const MISC_POLICY: ContentPolicy = ContentPolicy {
    mandatory: false,
    activation: Activation::DotNewRename,
    on_missing: MissingPolicy::Skip,
};

pub const BOOTER_POLICY: ContentPolicy = ContentPolicy {
    mandatory: true,
    activation: Activation::BlessRename,
    on_missing: MissingPolicy::Warn,
};

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    const GOLDEN: &str = indoc! {r#"
        <?xml version="1.0" encoding="UTF-8"?>
        <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
        <plist version="1.0">
        <dict>
            <key>PreBootPaths</key>
            <dict>
                <key>DiskLabel</key>
                <string>System/Library/CoreServices/.disk_label</string>
            </dict>
            <key>BooterPaths</key>
            <dict>
                <key>EFIBooter</key>
                <string>System/Library/CoreServices/boot.efi</string>
            </dict>
            <key>PostBootPaths</key>
            <dict>
                <key>BootConfig</key>
                <string>Library/Preferences/SystemConfiguration/com.apple.Boot.plist</string>
                <key>MKext</key>
                <dict>
                    <key>Path</key>
                    <string>System/Library/Extensions.mkext</string>
                    <key>ExtensionsDir</key>
                    <string>System/Library/Extensions</string>
                    <key>Archs</key>
                    <array>
                        <string>i386</string>
                        <string>x86_64</string>
                    </array>
                </dict>
                <key>AdditionalPaths</key>
                <array>
                    <string>System/Library/Caches/com.apple.kext.caches/Startup/kernelcache</string>
                </array>
            </dict>
        </dict>
        </plist>
    "#};

    #[test]
    fn test_parse_golden() {
        let parsed = BootCachesPlist::from_bytes(GOLDEN.as_bytes()).unwrap();

        let pre = parsed.pre_boot_paths.as_ref().unwrap();
        assert_eq!(
            pre.disk_label.as_deref(),
            Some("System/Library/CoreServices/.disk_label")
        );
        assert!(pre.additional_paths.is_none());

        let booters = parsed.booter_paths.as_ref().unwrap();
        assert_eq!(
            booters.efi_booter.as_deref(),
            Some("System/Library/CoreServices/boot.efi")
        );
        assert!(booters.of_booter.is_none());

        let post = parsed.post_boot_paths.as_ref().unwrap();
        assert_eq!(
            post.boot_config.as_deref(),
            Some("Library/Preferences/SystemConfiguration/com.apple.Boot.plist")
        );
        let mkext = post.mkext.as_ref().unwrap();
        assert_eq!(mkext.path, "System/Library/Extensions.mkext");
        assert_eq!(mkext.extensions_dir, "System/Library/Extensions");
        assert_eq!(mkext.archs, vec!["i386", "x86_64"]);
        assert_eq!(
            post.additional_paths.as_ref().unwrap(),
            &vec!["System/Library/Caches/com.apple.kext.caches/Startup/kernelcache".to_string()]
        );
    }

    #[test]
    fn test_round_trip() {
        let parsed = BootCachesPlist::from_bytes(GOLDEN.as_bytes()).unwrap();
        let rewritten = parsed.to_xml().unwrap();
        let reparsed = BootCachesPlist::from_bytes(&rewritten).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let doc = indoc! {r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
            <plist version="1.0">
            <dict>
                <key>SurpriseKey</key>
                <string>nope</string>
            </dict>
            </plist>
        "#};
        assert!(BootCachesPlist::from_bytes(doc.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_nested_key_rejected() {
        let doc = indoc! {r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
            <plist version="1.0">
            <dict>
                <key>PostBootPaths</key>
                <dict>
                    <key>MKext</key>
                    <dict>
                        <key>Path</key>
                        <string>System/Library/Extensions.mkext</string>
                        <key>ExtensionsDir</key>
                        <string>System/Library/Extensions</string>
                        <key>Archs</key>
                        <array><string>x86_64</string></array>
                        <key>Compression</key>
                        <string>lzss</string>
                    </dict>
                </dict>
            </dict>
            </plist>
        "#};
        assert!(BootCachesPlist::from_bytes(doc.as_bytes()).is_err());
    }

    #[test]
    fn test_non_dictionary_root_rejected() {
        let doc = indoc! {r#"
            <?xml version="1.0" encoding="UTF-8"?>
            <!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
            <plist version="1.0">
            <array><string>not a dict</string></array>
            </plist>
        "#};
        assert!(BootCachesPlist::from_bytes(doc.as_bytes()).is_err());
    }
}
