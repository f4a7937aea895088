use std::collections::HashMap;

use serde::{
    Deserialize,
    Serialize,
};

use crate::errors::BlkError;
use crate::utils::shell;

// For parsing Linux blkid output
#[derive(Serialize, Deserialize)]
struct EntryBlkid {
    #[serde(rename = "UUID")]
    uuid: Option<String>,

    #[serde(rename = "TYPE")]
    dev_type: Option<String>,

    #[serde(rename = "LABEL")]
    label: Option<String>,

    #[serde(rename = "PARTUUID")]
    part_uuid: Option<String>,
}

/// Executes `blkid` with no arguments and returns per-device format tags
/// keyed by device path. Tag keys follow udev naming (`ID_FS_TYPE`,
/// `ID_FS_UUID`, `ID_FS_LABEL`) so they merge directly into records.
pub fn probe_all() -> Result<HashMap<String, HashMap<String, String>>, BlkError> {
    let output = shell::exec_capture("blkid", &[])?;

    parse_blkid(&output)
}

pub fn parse_blkid(
    output_blkid: &str,
) -> Result<HashMap<String, HashMap<String, String>>, BlkError> {
    let mut tags = HashMap::new();

    for line in output_blkid.lines() {
        if line.is_empty() {
            continue;
        }

        let Some((dev_name, dev_data)) = line.split_once(':') else {
            continue;
        };

        // Make dev_data look like TOML
        // KEY1="VAL1"
        // KEY2="VAL2"

        let dev_entry: Vec<&str> = dev_data.split_whitespace().collect();
        let dev_entry = dev_entry.join("\n");

        let dev_entry: EntryBlkid =
            toml::from_str(&dev_entry).map_err(|err| {
                BlkError::Bug(format!("failed to unmarshal blkid output: {err}"))
            })?;

        let mut dev_tags = HashMap::new();
        if let Some(fs_type) = dev_entry.dev_type {
            dev_tags.insert("ID_FS_TYPE".to_string(), fs_type);
        }
        if let Some(uuid) = dev_entry.uuid {
            dev_tags.insert("ID_FS_UUID".to_string(), uuid);
        }
        if let Some(label) = dev_entry.label {
            dev_tags.insert("ID_FS_LABEL".to_string(), label);
        }

        tags.insert(dev_name.to_string(), dev_tags);
    }

    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_blkid() {
        let output = concat!(
            "/dev/sda1: UUID=\"6c81-08c9\" TYPE=\"vfat\" PARTUUID=\"0a15\"\n",
            "/dev/sda2: UUID=\"a3a4-11\" LABEL=\"root\" TYPE=\"ext4\"\n",
            "/dev/sdb1: PARTUUID=\"77aa\"\n",
        );

        let tags = parse_blkid(output).expect("valid blkid output rejected");

        assert_eq!(tags.len(), 3);
        assert_eq!(
            tags["/dev/sda2"].get("ID_FS_TYPE").map(String::as_str),
            Some("ext4"),
        );
        assert_eq!(
            tags["/dev/sda2"].get("ID_FS_LABEL").map(String::as_str),
            Some("root"),
        );
        // Formatless partition probes to an empty tag set, not an error.
        assert!(tags["/dev/sdb1"].get("ID_FS_TYPE").is_none());
    }
}
