use tracing::{
    debug,
    info,
};

use crate::entity::device::{
    Device,
    DeviceId,
    DeviceKind,
};
use crate::entity::format::FormatKind;
use crate::errors::BlkError;
use crate::linux;
use crate::tree::populate::PopulateCtx;
use crate::tree::{
    DeviceTree,
    LookupOpts,
};

/// LUKS reconciliation: compute the expected mapped-device name from the
/// format UUID and, if no such mapping exists yet, try to unlock it.
/// A LUKS device that stays locked is a normal outcome, not an error;
/// the user gets asked interactively elsewhere.
pub(crate) fn handle(
    tree: &mut DeviceTree,
    ctx: &mut PopulateCtx,
    device_id: DeviceId,
) -> Result<(), BlkError> {
    let device = tree.device(device_id)?;
    let device_name = device.name.clone();

    let Some(uuid) = device.format.uuid.clone() else {
        debug!(device = %device_name, "luks format without uuid, leaving locked");
        return Ok(());
    };

    let map_name = format!("{}{uuid}", crate::constants::LUKS_MAP_PREFIX);
    let path = tree.device_path(device_id)?;

    if let FormatKind::Luks { map_name: slot } =
        &mut tree.device_mut(device_id)?.format.kind
    {
        *slot = Some(map_name.clone());
    }

    if tree
        .get_device_by_name(&map_name, LookupOpts::any())
        .is_some()
    {
        return Ok(());
    }

    // An already-unlocked mapping under any name shows up in the
    // enumeration itself and will attach as this device's child.
    let live_mapping = ctx.records.values().any(|r| {
        r.is_dm_luks() && r.slaves.iter().any(|s| *s == device_name)
    });

    if live_mapping {
        return Ok(());
    }

    let unlocked = if tree.config.mode.allows_dummy_luks() {
        // Cleanup/testing: the mapping's content is irrelevant, no
        // passphrase needed.
        true
    } else {
        try_passphrases(tree, &uuid, &path, &map_name)
    };

    if !unlocked {
        info!(device = %path, "no passphrase for luks device, leaving locked");
        return Ok(());
    }

    let size = tree.device(device_id)?.size;

    let id = tree.alloc_device_id();
    let mut mapping = Device::new(id, &map_name, DeviceKind::LuksMapping);
    mapping.exists = true;
    mapping.size = size;
    mapping.parents = vec![device_id];

    tree.add_device(mapping)?;

    Ok(())
}

/// Tries the per-UUID override first, then the global cache, in order.
/// A failed attempt is just a wrong passphrase.
fn try_passphrases(tree: &DeviceTree, uuid: &str, path: &str, map_name: &str) -> bool {
    let mut candidates: Vec<&str> = Vec::new();

    if let Some(override_pass) = tree.config.luks_passphrases.get(uuid) {
        candidates.push(override_pass);
    }

    candidates.extend(tree.config.passphrases.iter().map(String::as_str));

    for passphrase in candidates {
        match linux::luks::open(path, Some(passphrase), map_name) {
            Ok(()) => return true,
            Err(err) => {
                debug!(device = %path, %err, "passphrase attempt failed");
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use crate::config::{
        Config,
        Mode,
    };
    use crate::entity::record::keys;
    use crate::tree::populate::record_support::*;
    use crate::tree::{
        DeviceTree,
        LookupOpts,
    };

    fn luks_records() -> Vec<crate::entity::record::DeviceRecord> {
        let mut part = partition_record("sda1", "sda");
        part.props.insert(
            keys::ID_FS_TYPE.to_string(),
            "crypto_LUKS".to_string(),
        );
        part.props.insert(
            keys::ID_FS_UUID.to_string(),
            "629e6cc0-8e8a".to_string(),
        );

        vec![disk_record("sda"), part]
    }

    #[test]
    fn test_locked_luks_without_passphrase() {
        // Normal mode with an empty passphrase cache: the device keeps
        // its luks format, no mapped child appears, nothing raises.
        let mut tree = DeviceTree::new(Config::default());

        tree.populate(&luks_records()).expect("populate failed");

        let part = tree
            .get_device_by_name("sda1", LookupOpts::default())
            .expect("sda1 not discovered");

        assert_eq!(part.format.type_name(), Some("luks"));
        assert!(tree.is_leaf(part.id));
        assert!(tree
            .get_device_by_name("luks-629e6cc0-8e8a", LookupOpts::any())
            .is_none());
    }

    #[test]
    fn test_cleanup_mode_synthesizes_mapping() {
        let mut tree = DeviceTree::new(Config {
            mode: Mode::CleanupOnly,
            ..Default::default()
        });

        tree.populate(&luks_records()).expect("populate failed");

        let mapping = tree
            .get_device_by_name("luks-629e6cc0-8e8a", LookupOpts::default())
            .expect("no mapping synthesized");

        let part = tree
            .get_device_by_name("sda1", LookupOpts::default())
            .expect("sda1 not discovered");

        assert_eq!(mapping.parents, vec![part.id]);
        assert!(!tree.is_leaf(part.id));
    }

    #[test]
    fn test_testing_mode_synthesizes_mapping() {
        let mut tree = DeviceTree::new(Config {
            mode: Mode::Testing,
            ..Default::default()
        });

        tree.populate(&luks_records()).expect("populate failed");

        assert!(tree
            .get_device_by_name("luks-629e6cc0-8e8a", LookupOpts::default())
            .is_some());
    }
}
