use std::collections::HashMap;

use serde::{
    Deserialize,
    Serialize,
};

use crate::errors::BlkError;

/// Scan/commit configuration. All filter state lives here, owned by the
/// tree that was built from it, so independent trees never share state.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Disks the tree may operate on. Empty means all disks.
    #[serde(default, alias = "exclusive-disks", alias = "only_disks")]
    pub exclusive_disks: Vec<String>,

    /// Disks the tree must never touch or even track.
    #[serde(default, alias = "ignored-disks", alias = "ignore_disks")]
    pub ignored_disks: Vec<String>,

    /// Device specs (names, `UUID=`, `LABEL=`, `/dev/...` paths) that are
    /// never auto-removed, on top of whatever backs the running system.
    #[serde(default, alias = "protected-devices")]
    pub protected: Vec<String>,

    /// Passphrases tried in order against every locked LUKS format.
    #[serde(default, alias = "luks-passphrases")]
    pub passphrases: Vec<String>,

    /// Per-UUID passphrase overrides, tried before the global list.
    #[serde(default, alias = "luks-passphrase-overrides")]
    pub luks_passphrases: HashMap<String, String>,

    /// Disk image name to backing file path. Each entry becomes a
    /// file-backed loop device during populate.
    #[serde(default, alias = "disk-images")]
    pub disk_images: HashMap<String, String>,

    #[serde(default)]
    pub mode: Mode,
}

/// How much the tree is allowed to assume about the machine it runs on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Full scan against live hardware, all tool wrappers enabled.
    #[default]
    Normal,

    /// Scanning disk image files rather than the machine's own disks.
    ImageInstall,

    /// Only tearing down leftover stacks; LUKS mappings are synthesized
    /// without passphrases since their content is about to be destroyed.
    CleanupOnly,

    /// No external tools at all: every query is answered from record
    /// properties. Used by the test suite.
    Testing,
}

impl Mode {
    /// Modes in which a LUKS mapping may be synthesized without a
    /// successful passphrase attempt.
    pub fn allows_dummy_luks(&self) -> bool {
        matches!(self, Mode::CleanupOnly | Mode::Testing)
    }

    /// Modes in which external tools must not be invoked.
    pub fn offline(&self) -> bool {
        matches!(self, Mode::Testing)
    }
}

impl Config {
    #[inline]
    pub fn from_yaml(config_yaml: &str) -> Result<Self, BlkError> {
        serde_yaml::from_str(config_yaml)
            .map_err(|err| BlkError::BadConfig(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
exclusive_disks: [sda, sdb]
ignored-disks: [sdz]
protected:
  - "UUID=1111-2222"
  - sda1
passphrases: [hunter2]
luks_passphrases:
  629e6cc0-8e8a-4ad9-b0ec-ed57f338d0b8: swordfish
mode: testing
"#;

        let config = Config::from_yaml(yaml).expect("valid config rejected");

        assert_eq!(config.exclusive_disks, vec!["sda", "sdb"]);
        assert_eq!(config.ignored_disks, vec!["sdz"]);
        assert_eq!(config.protected.len(), 2);
        assert_eq!(config.passphrases, vec!["hunter2"]);
        assert_eq!(
            config
                .luks_passphrases
                .get("629e6cc0-8e8a-4ad9-b0ec-ed57f338d0b8")
                .map(String::as_str),
            Some("swordfish"),
        );
        assert_eq!(config.mode, Mode::Testing);
        assert!(config.mode.allows_dummy_luks());
        assert!(config.mode.offline());
    }

    #[test]
    fn test_default_config() {
        let config = Config::from_yaml("{}").expect("empty config rejected");

        assert_eq!(config, Config::default());
        assert_eq!(config.mode, Mode::Normal);
        assert!(!config.mode.allows_dummy_luks());
    }

    #[test]
    fn test_bad_config() {
        let result = Config::from_yaml("mode: [not, a, mode]");

        assert!(matches!(result, Err(BlkError::BadConfig(_))));
    }
}
