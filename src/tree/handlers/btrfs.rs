use std::collections::HashMap;

use tracing::debug;

use crate::entity::device::{
    BtrfsSubvolInfo,
    BtrfsVolInfo,
    Device,
    DeviceId,
    DeviceKind,
};
use crate::entity::record::{
    keys,
    DeviceRecord,
};
use crate::errors::BlkError;
use crate::linux;
use crate::linux::btrfs::Subvol;
use crate::tree::populate::PopulateCtx;
use crate::tree::{
    DeviceTree,
    LookupOpts,
};

/// The volume-internal id of the top-level subvolume.
const TOP_LEVEL_ID: u64 = 5;

/// BTRFS reconciliation: find or create the owning volume by UUID, then
/// discover its subvolumes once.
pub(crate) fn handle(
    tree: &mut DeviceTree,
    _ctx: &mut PopulateCtx,
    device_id: DeviceId,
    record: &DeviceRecord,
) -> Result<(), BlkError> {
    let Some(vol_uuid) = record.fmt_uuid().map(str::to_string) else {
        debug!(member = %record.name, "btrfs member without volume uuid");
        return Ok(());
    };

    // A member's format carries the volume UUID too, so this searches
    // volume devices specifically rather than any UUID match.
    let existing = tree
        .devices()
        .find(|d| {
            matches!(d.kind, DeviceKind::BtrfsVolume(_))
                && d.uuid.as_deref() == Some(vol_uuid.as_str())
        })
        .map(|d| d.id);

    let vol_id = match existing {
        Some(vol_id) => {
            let vol = tree.device_mut(vol_id)?;

            if !vol.parents.contains(&device_id) {
                vol.parents.push(device_id);
            }

            vol_id
        }
        None => {
            let name = record
                .fmt_label()
                .map(str::to_string)
                .unwrap_or_else(|| format!("btrfs.{vol_uuid}"));

            let size = tree.device(device_id)?.size;

            let id = tree.alloc_device_id();
            let mut vol = Device::new(
                id,
                &name,
                DeviceKind::BtrfsVolume(BtrfsVolInfo::default()),
            );
            vol.exists = true;
            vol.uuid = Some(vol_uuid);
            vol.size = size;
            vol.parents = vec![device_id];

            tree.add_device(vol)?
        }
    };

    let listed = match &tree.device(vol_id)?.kind {
        DeviceKind::BtrfsVolume(info) => info.subvols_listed,
        _ => true,
    };

    if !listed {
        let subvols = list_subvolumes(tree, record, vol_id)?;
        add_subvolumes(tree, vol_id, &subvols)?;

        if let DeviceKind::BtrfsVolume(info) = &mut tree.device_mut(vol_id)?.kind {
            info.subvols_listed = true;
        }
    }

    Ok(())
}

/// Offline modes answer the subvolume-listing query from the record;
/// otherwise it goes to the btrfs tool.
fn list_subvolumes(
    tree: &DeviceTree,
    record: &DeviceRecord,
    vol_id: DeviceId,
) -> Result<Vec<Subvol>, BlkError> {
    if tree.config.mode.offline() {
        return Ok(record
            .prop(keys::BTRFS_SUBVOLUMES)
            .map(parse_subvol_prop)
            .unwrap_or_default());
    }

    let path = tree.device_path(vol_id)?;

    linux::btrfs::subvolumes(&path)
}

/// `id parent path` triples separated by `;`.
fn parse_subvol_prop(s: &str) -> Vec<Subvol> {
    s.split(';')
        .filter_map(|triple| {
            let cols: Vec<&str> = triple.split_whitespace().collect();

            Some(Subvol {
                id: cols.first()?.parse().ok()?,
                parent_id: cols.get(1)?.parse().ok()?,
                path: (*cols.get(2)?).to_string(),
            })
        })
        .collect()
}

/// Builds subvolume devices under the volume, resolving each declared
/// parent among the volume itself and already-materialized subvolumes.
/// An unresolvable parent is corrupt metadata, not something to skip.
fn add_subvolumes(
    tree: &mut DeviceTree,
    vol_id: DeviceId,
    subvols: &[Subvol],
) -> Result<(), BlkError> {
    let vol_name = tree.device(vol_id)?.name.clone();

    // id -> device, filled as subvolumes materialize.
    let mut by_internal_id: HashMap<u64, DeviceId> = HashMap::new();
    by_internal_id.insert(TOP_LEVEL_ID, vol_id);

    let mut pending: Vec<&Subvol> = subvols.iter().collect();

    while !pending.is_empty() {
        let before = pending.len();

        pending.retain(|subvol| {
            let Some(parent) = by_internal_id.get(&subvol.parent_id).copied() else {
                return true;
            };

            let name = format!("{vol_name}/{}", subvol.path);

            if let Some(existing) = tree.get_device_by_name(&name, LookupOpts::any())
            {
                by_internal_id.insert(subvol.id, existing.id);
                return false;
            }

            let id = tree.alloc_device_id();
            let mut device = Device::new(
                id,
                &name,
                DeviceKind::BtrfsSubvolume(BtrfsSubvolInfo {
                    vol_id: subvol.id,
                    parent_id: subvol.parent_id,
                    subvol_path: subvol.path.clone(),
                }),
            );
            device.exists = true;
            device.parents = vec![parent];

            match tree.add_device(device) {
                Ok(added) => {
                    by_internal_id.insert(subvol.id, added);
                    false
                }
                Err(_) => true,
            }
        });

        if pending.len() == before {
            let orphans: Vec<&str> =
                pending.iter().map(|s| s.path.as_str()).collect();

            return Err(BlkError::DeviceTree(format!(
                "btrfs volume {vol_name} has subvolumes with unresolvable \
                 parents: {orphans:?}",
            )));
        }
    }

    Ok(())
}
