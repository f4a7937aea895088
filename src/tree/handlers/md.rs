use tracing::debug;

use crate::entity::device::{
    Device,
    DeviceId,
    DeviceKind,
    MdInfo,
};
use crate::entity::record::{
    keys,
    DeviceRecord,
};
use crate::errors::BlkError;
use crate::tree::populate::PopulateCtx;
use crate::tree::DeviceTree;

/// Software-RAID member reconciliation: find or create the owning array
/// by its metadata UUID, incomplete arrays included.
pub(crate) fn handle(
    tree: &mut DeviceTree,
    ctx: &mut PopulateCtx,
    device_id: DeviceId,
    record: &DeviceRecord,
) -> Result<(), BlkError> {
    let Some(array_uuid) = record.prop(keys::MD_UUID).map(str::to_string) else {
        debug!(member = %record.name, "raid member without array uuid");
        return Ok(());
    };

    let existing = tree
        .devices()
        .find(|d| {
            matches!(d.kind, DeviceKind::MdArray(_))
                && d.uuid.as_deref() == Some(array_uuid.as_str())
        })
        .map(|d| d.id);

    if let Some(array_id) = existing {
        let array = tree.device_mut(array_id)?;

        if !array.parents.contains(&device_id) {
            array.parents.push(device_id);
        }

        return Ok(());
    }

    let level = record.prop(keys::MD_LEVEL).map(str::to_string);

    // Prefer an array already visible in the live enumeration with the
    // same UUID and level, to recover its human-assigned name and
    // metadata version.
    let live = ctx.records.values().find(|r| {
        r.name != record.name
            && r.is_md()
            && r.prop(keys::MD_UUID) == Some(array_uuid.as_str())
            && (level.is_none() || r.prop(keys::MD_LEVEL) == level.as_deref())
    });

    let (name, metadata_version) = match live {
        Some(live) => (
            live.prop(keys::MD_DEVNAME)
                .unwrap_or(&live.name)
                .to_string(),
            live.prop(keys::MD_METADATA).map(str::to_string),
        ),
        // No live array to recover a name from; synthesize one from the
        // member's path.
        None => (
            format!("md_{}", record.name),
            record.prop(keys::MD_METADATA).map(str::to_string),
        ),
    };

    let id = tree.alloc_device_id();
    let mut array = Device::new(
        id,
        &name,
        DeviceKind::MdArray(MdInfo {
            level,
            metadata_version,
            member_count: record.prop_u64(keys::MD_DEVICES).map(|n| n as u32),
        }),
    );
    array.exists = true;
    array.uuid = Some(array_uuid);
    array.parents = vec![device_id];

    tree.add_device(array)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Config,
        Mode,
    };
    use crate::tree::populate::record_support::*;

    fn member_record(name: &str, disk: &str, uuid: &str) -> DeviceRecord {
        let mut record = partition_record(name, disk);

        record.props.insert(
            keys::ID_FS_TYPE.to_string(),
            "linux_raid_member".to_string(),
        );
        record
            .props
            .insert(keys::MD_UUID.to_string(), uuid.to_string());
        record
            .props
            .insert(keys::MD_LEVEL.to_string(), "raid1".to_string());
        record
            .props
            .insert(keys::MD_DEVICES.to_string(), "2".to_string());

        record
    }

    fn testing_tree() -> DeviceTree {
        DeviceTree::new(Config {
            mode: Mode::Testing,
            ..Default::default()
        })
    }

    #[test]
    fn test_members_share_one_array() {
        let mut tree = testing_tree();

        let records = vec![
            disk_record("sda"),
            disk_record("sdb"),
            member_record("sda1", "sda", "22cd5de4:fb51f43c"),
            member_record("sdb1", "sdb", "22cd5de4:fb51f43c"),
        ];

        tree.populate(&records).expect("populate failed");

        let arrays = tree.get_devices_by_type("mdarray");
        assert_eq!(arrays.len(), 1);

        let array = arrays[0];
        assert_eq!(array.parents.len(), 2);
        assert!(array.is_complete());
        assert_eq!(array.uuid.as_deref(), Some("22cd5de4:fb51f43c"));
    }

    #[test]
    fn test_name_recovered_from_live_array() {
        let mut tree = testing_tree();

        let mut live = DeviceRecord::new("md127");
        live.props
            .insert(keys::DEVTYPE.to_string(), "disk".to_string());
        live.props
            .insert(keys::MD_LEVEL.to_string(), "raid1".to_string());
        live.props
            .insert(keys::MD_UUID.to_string(), "aa:bb:cc".to_string());
        live.props
            .insert(keys::MD_DEVNAME.to_string(), "home".to_string());
        live.props
            .insert(keys::MD_METADATA.to_string(), "1.2".to_string());
        live.slaves = vec!["sda1".to_string()];

        let records = vec![
            disk_record("sda"),
            member_record("sda1", "sda", "aa:bb:cc"),
            live,
        ];

        tree.populate(&records).expect("populate failed");

        let arrays = tree.get_devices_by_type("mdarray");
        assert_eq!(arrays.len(), 1);
        assert_eq!(arrays[0].name, "home");

        let DeviceKind::MdArray(info) = &arrays[0].kind else {
            panic!("not an md array");
        };

        assert_eq!(info.metadata_version.as_deref(), Some("1.2"));
    }

    #[test]
    fn test_synthesized_name_without_live_array() {
        let mut tree = testing_tree();

        let records = vec![
            disk_record("sda"),
            member_record("sda1", "sda", "dd:ee:ff"),
        ];

        tree.populate(&records).expect("populate failed");

        let arrays = tree.get_devices_by_type("mdarray");
        assert_eq!(arrays.len(), 1);
        assert_eq!(arrays[0].name, "md_sda1");
        // One of two claimed members discovered.
        assert!(!arrays[0].is_complete());
    }
}
