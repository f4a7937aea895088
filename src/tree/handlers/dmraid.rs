use tracing::{
    debug,
    info,
};

use crate::entity::device::{
    Device,
    DeviceId,
    DeviceKind,
    DmRaidInfo,
};
use crate::entity::record::{
    keys,
    DeviceRecord,
};
use crate::errors::BlkError;
use crate::linux;
use crate::tree::populate::PopulateCtx;
use crate::tree::{
    DeviceTree,
    LookupOpts,
};

use super::handle_format;

/// Firmware/BIOS RAID member reconciliation: locate or create the
/// backing raid set and its array device. On first creation the set is
/// activated and the array's own disklabel is detected ahead of any
/// partition scan, so partitions of the array cannot be discovered
/// before the array itself.
pub(crate) fn handle(
    tree: &mut DeviceTree,
    ctx: &mut PopulateCtx,
    device_id: DeviceId,
    record: &DeviceRecord,
) -> Result<(), BlkError> {
    let set_name = match record.prop(keys::DMRAID_SET_NAME) {
        Some(name) => Some(name.to_string()),
        None if !tree.config.mode.offline() => {
            linux::dmraid::set_for_member(&record.path())?
        }
        None => None,
    };

    let Some(set_name) = set_name else {
        info!(member = %record.name, "no raid set for biosraid member");
        return Ok(());
    };

    if let Some(array) = tree.get_device_by_name(&set_name, LookupOpts::any()) {
        let array_id = array.id;
        let array = tree.device_mut(array_id)?;

        if !array.parents.contains(&device_id) {
            array.parents.push(device_id);
        }

        return Ok(());
    }

    debug!(set = %set_name, "creating dmraid array");

    let size = tree.device(device_id)?.size;

    let id = tree.alloc_device_id();
    let mut array = Device::new(
        id,
        &set_name,
        DeviceKind::DmRaidArray(DmRaidInfo {
            raid_set: set_name.clone(),
        }),
    );
    array.exists = true;
    array.size = size;
    array.parents = vec![device_id];

    let array_id = tree.add_device(array)?;

    if !tree.config.mode.offline() {
        linux::dmraid::activate(&set_name)?;
        linux::udev::settle()?;
    }

    // Disklabel detection on the freshly created array, ahead of the
    // partition scan.
    if let Some(array_record) = ctx.records.get(&set_name).cloned() {
        ctx.seen.insert(set_name);
        handle_format(tree, ctx, &array_record, array_id)?;
    }

    Ok(())
}
