pub mod btrfs;
pub mod dmraid;
pub mod luks;
pub mod lvm;
pub mod md;

use tracing::debug;

use crate::entity::device::{
    DeviceId,
    DeviceKind,
};
use crate::entity::format::{
    DiskLabelType,
    Format,
    FormatArgs,
    FormatKind,
};
use crate::entity::record::{
    keys,
    DeviceRecord,
};
use crate::errors::BlkError;

use super::populate::PopulateCtx;
use super::DeviceTree;

/// Format detection and dispatch for one freshly discovered device.
/// Unreadable or unrecognized content is a routine condition: the device
/// keeps an empty format and discovery moves on.
pub(crate) fn handle_format(
    tree: &mut DeviceTree,
    ctx: &mut PopulateCtx,
    record: &DeviceRecord,
    device_id: DeviceId,
) -> Result<(), BlkError> {
    // A partition table wins over any content hint, and a device with a
    // disklabel receives no further generic format detection.
    if let Some(table_type) = record.prop(keys::ID_PART_TABLE_TYPE) {
        attach_disklabel(tree, device_id, table_type)?;
        return Ok(());
    }

    let Some(fmt_type) = record.fmt_type() else {
        return Ok(());
    };

    let args = FormatArgs {
        uuid: record.fmt_uuid().map(str::to_string),
        label: record.fmt_label().map(str::to_string),
        device: Some(tree.device_path(device_id)?),
        exists: true,
        map_name: record
            .fmt_uuid()
            .map(|u| format!("{}{u}", crate::constants::LUKS_MAP_PREFIX)),
        vol_uuid: record.fmt_uuid().map(str::to_string),
        vg_name: record.prop(keys::LVM2_VG_NAME).map(str::to_string),
        vg_uuid: record.prop(keys::LVM2_VG_UUID).map(str::to_string),
        array_uuid: record.prop(keys::MD_UUID).map(str::to_string),
        md_level: record.prop(keys::MD_LEVEL).map(str::to_string),
        set_name: record.prop(keys::DMRAID_SET_NAME).map(str::to_string),
        ..Default::default()
    };

    let format = match Format::from_type(fmt_type, args) {
        Ok(format) => format,
        Err(err) => {
            // Freshly zeroed disks and foreign content land here.
            debug!(record = %record.name, %err, "unreadable format, using none");
            Format::none()
        }
    };

    let kind = format.kind.clone();
    tree.device_mut(device_id)?.format = format;

    match kind {
        FormatKind::Luks { .. } => luks::handle(tree, ctx, device_id)?,
        FormatKind::LvmPv(_) => lvm::handle(tree, ctx, device_id, record)?,
        FormatKind::MdMember(_) => md::handle(tree, ctx, device_id, record)?,
        FormatKind::DmRaidMember(_) => dmraid::handle(tree, ctx, device_id, record)?,
        FormatKind::Btrfs { .. } => btrfs::handle(tree, ctx, device_id, record)?,
        _ => {}
    }

    Ok(())
}

fn attach_disklabel(
    tree: &mut DeviceTree,
    device_id: DeviceId,
    table_type: &str,
) -> Result<(), BlkError> {
    let label_type = match table_type {
        "gpt" => Some(DiskLabelType::Gpt),
        "dos" | "msdos" | "mbr" => Some(DiskLabelType::Msdos),
        _ => None,
    };

    let device = tree.device_mut(device_id)?;

    let partitionable = matches!(
        device.kind,
        DeviceKind::Disk(_)
            | DeviceKind::Multipath(_)
            | DeviceKind::DmRaidArray(_)
            | DeviceKind::MdArray(_)
            | DeviceKind::Loop(_)
    );

    let Some(label_type) = label_type else {
        debug!(
            device = %device.name,
            table_type,
            "unsupported disklabel, recording as unusable"
        );
        device.format = Format::disklabel(DiskLabelType::Msdos, true, true);

        return Ok(());
    };

    // A disklabel on a non-partitionable device is recorded but never
    // processed.
    let mut format = Format::disklabel(label_type, !partitionable, true);
    format.device = Some(device.path());

    device.format = format;

    Ok(())
}
