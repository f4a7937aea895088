use std::collections::HashSet;

use tracing::{
    debug,
    warn,
};

use crate::entity::device::{
    lv_dm_name,
    Device,
    DeviceId,
    DeviceKind,
    LvEntry,
    LvInfo,
    ThinLvInfo,
    VgInfo,
};
use crate::entity::record::{
    keys,
    DeviceRecord,
};
use crate::errors::BlkError;
use crate::tree::populate::PopulateCtx;
use crate::tree::{
    DeviceTree,
    LookupOpts,
};

use super::handle_format;

/// LVM PV reconciliation: find or create the owning VG (incomplete VGs
/// included), fold this PV's knowledge of the VG's logical volumes into
/// the VG's running lists, then materialize what can be materialized.
pub(crate) fn handle(
    tree: &mut DeviceTree,
    ctx: &mut PopulateCtx,
    device_id: DeviceId,
    record: &DeviceRecord,
) -> Result<(), BlkError> {
    let Some(vg_name) = record.prop(keys::LVM2_VG_NAME).map(str::to_string) else {
        // An orphan PV belongs to no VG yet.
        return Ok(());
    };

    let vg_uuid = record.prop(keys::LVM2_VG_UUID).map(str::to_string);

    let vg_id = find_vg(tree, &vg_name, vg_uuid.as_deref());

    let vg_id = match vg_id {
        Some(vg_id) => {
            let vg = tree.device_mut(vg_id)?;

            if !vg.parents.contains(&device_id) {
                vg.parents.push(device_id);
            }

            vg_id
        }
        None => {
            let id = tree.alloc_device_id();
            let mut vg = Device::new(id, &vg_name, DeviceKind::LvmVolumeGroup(
                VgInfo::default(),
            ));
            vg.exists = true;
            vg.uuid = vg_uuid;
            vg.parents = vec![device_id];

            tree.add_device(vg)?
        }
    };

    merge_lv_knowledge(tree, vg_id, record)?;
    materialize_lvs(tree, ctx, vg_id)?;

    Ok(())
}

fn find_vg(tree: &DeviceTree, name: &str, uuid: Option<&str>) -> Option<DeviceId> {
    if let Some(uuid) = uuid {
        let by_uuid = tree
            .devices()
            .find(|d| {
                matches!(d.kind, DeviceKind::LvmVolumeGroup(_))
                    && d.uuid.as_deref() == Some(uuid)
            })
            .map(|d| d.id);

        if by_uuid.is_some() {
            return by_uuid;
        }
    }

    tree.get_device_by_name(name, LookupOpts::any())
        .filter(|d| matches!(d.kind, DeviceKind::LvmVolumeGroup(_)))
        .map(|d| d.id)
}

/// Builds an LV device from a live device-mapper record, for active LVs
/// that show up in the enumeration itself. The VG's accumulated entry,
/// when present, supplies uuid/size/segment data the record lacks.
pub(crate) fn add_lv_from_record(
    tree: &mut DeviceTree,
    vg_id: DeviceId,
    vg_name: &str,
    lv_name: &str,
    record: &DeviceRecord,
) -> Result<DeviceId, BlkError> {
    let entry = {
        let vg = tree.device(vg_id)?;

        match &vg.kind {
            DeviceKind::LvmVolumeGroup(info) => {
                info.lv_info.iter().find(|e| e.name == lv_name).cloned()
            }
            _ => None,
        }
    };

    let entry = entry.unwrap_or_else(|| LvEntry {
        name: lv_name.to_string(),
        size: record.size,
        ..Default::default()
    });

    let mut parent_id = vg_id;

    if let Some(pool_name) = &entry.pool {
        if let Some(pool) = tree
            .get_device_by_name(&format!("{vg_name}-{pool_name}"), LookupOpts::any())
        {
            parent_id = pool.id;
        }
    }

    let kind = match entry.seg_type.as_str() {
        "thin-pool" => DeviceKind::LvmThinPool(LvInfo {
            vg_name: vg_name.to_string(),
            lv_name: lv_name.to_string(),
            attr: entry.attr.clone(),
            seg_type: entry.seg_type.clone(),
            ..Default::default()
        }),
        "thin" => DeviceKind::LvmThinLogicalVolume(ThinLvInfo {
            vg_name: vg_name.to_string(),
            lv_name: lv_name.to_string(),
            pool_name: entry.pool.clone().unwrap_or_default(),
            attr: entry.attr.clone(),
        }),
        _ => DeviceKind::LvmLogicalVolume(LvInfo {
            vg_name: vg_name.to_string(),
            lv_name: lv_name.to_string(),
            attr: entry.attr.clone(),
            seg_type: entry.seg_type.clone(),
            ..Default::default()
        }),
    };

    let id = tree.alloc_device_id();
    let mut lv = Device::new(id, &format!("{vg_name}-{lv_name}"), kind);
    lv.exists = true;
    lv.uuid = entry.uuid.clone();
    lv.size = if record.size > 0 { record.size } else { entry.size };
    lv.sysfs_path = record.sysfs_path.clone();
    lv.major_minor = record.major_minor;
    lv.parents = vec![parent_id];

    tree.add_device(lv)
}

/// Creates a VG shell for an LV whose PVs were not enumerated.
pub(crate) fn create_incomplete_vg(
    tree: &mut DeviceTree,
    vg_name: &str,
) -> Result<DeviceId, BlkError> {
    warn!(vg = %vg_name, "volume group with no discovered PVs");

    let id = tree.alloc_device_id();
    let mut vg = Device::new(id, vg_name, DeviceKind::LvmVolumeGroup(VgInfo::default()));
    vg.exists = true;

    tree.add_device(vg)
}

/// Accumulates this PV's view of the VG's LVs into the VG's running
/// lists, deduplicated by LV name. The per-column lists are index
/// aligned; `-` marks an absent origin/pool.
fn merge_lv_knowledge(
    tree: &mut DeviceTree,
    vg_id: DeviceId,
    record: &DeviceRecord,
) -> Result<(), BlkError> {
    let names = record.prop_list(keys::LVM2_LV_NAMES);

    if names.is_empty() {
        return Ok(());
    }

    let uuids = record.prop_list(keys::LVM2_LV_UUIDS);
    let sizes = record.prop_list(keys::LVM2_LV_SIZES);
    let attrs = record.prop_list(keys::LVM2_LV_ATTRS);
    let types = record.prop_list(keys::LVM2_LV_TYPES);
    let origins = record.prop_list(keys::LVM2_LV_ORIGINS);
    let pools = record.prop_list(keys::LVM2_LV_POOLS);

    let pv_count = record.prop_u64(keys::LVM2_PV_COUNT).map(|n| n as u32);
    let pe_size = record.prop_u64(keys::LVM2_PE_SIZE);

    let vg = tree.device_mut(vg_id)?;

    let DeviceKind::LvmVolumeGroup(info) = &mut vg.kind else {
        return Err(BlkError::Bug(format!(
            "lv knowledge merge into non-vg device {}",
            vg.name,
        )));
    };

    if info.pv_count.is_none() {
        info.pv_count = pv_count;
    }
    if info.pe_size.is_none() {
        info.pe_size = pe_size;
    }

    let col = |list: &[String], i: usize| -> Option<String> {
        list.get(i)
            .filter(|v| !v.is_empty() && *v != "-")
            .cloned()
    };

    for (i, name) in names.iter().enumerate() {
        if info.lv_info.iter().any(|e| &e.name == name) {
            continue;
        }

        info.lv_info.push(LvEntry {
            name: name.clone(),
            uuid: col(&uuids, i),
            size: col(&sizes, i)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            attr: col(&attrs, i).unwrap_or_default(),
            seg_type: col(&types, i).unwrap_or_else(|| "linear".to_string()),
            origin: col(&origins, i),
            pool: col(&pools, i),
        });
    }

    Ok(())
}

/// Materializes the VG's accumulated LV list: mirror images first,
/// snapshots last, internal LVs skipped or folded into their parent,
/// snapshot origins and thin pools pulled in on demand.
pub(crate) fn materialize_lvs(
    tree: &mut DeviceTree,
    ctx: &mut PopulateCtx,
    vg_id: DeviceId,
) -> Result<(), BlkError> {
    let (vg_name, mut entries) = {
        let vg = tree.device(vg_id)?;

        let DeviceKind::LvmVolumeGroup(info) = &vg.kind else {
            return Err(BlkError::Bug(format!(
                "lv materialization on non-vg device {}",
                vg.name,
            )));
        };

        (vg.name.clone(), info.lv_info.clone())
    };

    entries.sort_by_key(materialize_rank);

    // Component LVs (mirror images/logs, thin metadata) are counted
    // here, then stamped onto their parent LV when it materializes.
    let components = fold_components(&entries);

    let mut visited = HashSet::new();

    for entry in &entries {
        materialize_lv(
            tree,
            ctx,
            vg_id,
            &vg_name,
            entry,
            &entries,
            &components,
            &mut visited,
        )?;
    }

    Ok(())
}

/// Mirror-image LVs first, snapshot LVs last (attribute-code-driven).
fn materialize_rank(entry: &LvEntry) -> u8 {
    match entry.attr.chars().next() {
        Some('i') | Some('I') => 0,
        Some('s') | Some('S') => 2,
        _ if entry.origin.is_some() => 2,
        _ => 1,
    }
}

#[allow(clippy::too_many_arguments)]
fn materialize_lv(
    tree: &mut DeviceTree,
    ctx: &mut PopulateCtx,
    vg_id: DeviceId,
    vg_name: &str,
    entry: &LvEntry,
    entries: &[LvEntry],
    components: &ComponentCounters,
    visited: &mut HashSet<String>,
) -> Result<Option<DeviceId>, BlkError> {
    if !visited.insert(entry.name.clone()) {
        // Already processed, or a cycle in malformed metadata; either
        // way the name lookup below is the answer.
        return Ok(tree
            .get_device_by_name(&format!("{vg_name}-{}", entry.name), LookupOpts::any())
            .map(|d| d.id));
    }

    // Internal component LVs were folded into the counters, not
    // materialized.
    if internal_component_parent(&entry.name).is_some() {
        debug!(lv = %entry.name, "skipping component lv");
        return Ok(None);
    }

    if entry.name.starts_with('[') || entry.name.ends_with("_pmspare") {
        debug!(lv = %entry.name, "skipping internal lv");
        return Ok(None);
    }

    // Virtual snapshot origins have no device of their own.
    if entry.attr.starts_with('v') {
        debug!(lv = %entry.name, "skipping vorigin lv");
        return Ok(None);
    }

    let full_name = format!("{vg_name}-{}", entry.name);

    if let Some(existing) = tree.get_device_by_name(&full_name, LookupOpts::any()) {
        return Ok(Some(existing.id));
    }

    // Thin LVs need their pool first; snapshots need their origin.
    let mut parent_id = vg_id;

    if let Some(pool_name) = &entry.pool {
        let pool_entry = entries.iter().find(|e| &e.name == pool_name);

        let pool_id = match pool_entry {
            Some(pool_entry) => materialize_lv(
                tree, ctx, vg_id, vg_name, pool_entry, entries, components, visited,
            )?,
            None => tree
                .get_device_by_name(&format!("{vg_name}-{pool_name}"), LookupOpts::any())
                .map(|d| d.id),
        };

        parent_id = pool_id.ok_or_else(|| {
            BlkError::DeviceTree(format!(
                "thin lv {} has unresolvable pool {pool_name}",
                entry.name,
            ))
        })?;
    }

    if let Some(origin_name) = &entry.origin {
        let origin_entry = entries.iter().find(|e| &e.name == origin_name);

        let origin_id = match origin_entry {
            Some(origin_entry) => materialize_lv(
                tree, ctx, vg_id, vg_name, origin_entry, entries, components, visited,
            )?,
            None => tree
                .get_device_by_name(
                    &format!("{vg_name}-{origin_name}"),
                    LookupOpts::any(),
                )
                .map(|d| d.id),
        };

        if origin_id.is_none() {
            return Err(BlkError::DeviceTree(format!(
                "snapshot lv {} has unresolvable origin {origin_name}",
                entry.name,
            )));
        }
    }

    let counters = components.get(entry.name.as_str());

    let kind = match entry.seg_type.as_str() {
        "thin-pool" => DeviceKind::LvmThinPool(LvInfo {
            vg_name: vg_name.to_string(),
            lv_name: entry.name.clone(),
            attr: entry.attr.clone(),
            seg_type: entry.seg_type.clone(),
            metadata_size: counters.map(|c| c.metadata_size).unwrap_or(0),
            ..Default::default()
        }),
        "thin" => DeviceKind::LvmThinLogicalVolume(ThinLvInfo {
            vg_name: vg_name.to_string(),
            lv_name: entry.name.clone(),
            pool_name: entry.pool.clone().unwrap_or_default(),
            attr: entry.attr.clone(),
        }),
        _ => DeviceKind::LvmLogicalVolume(LvInfo {
            vg_name: vg_name.to_string(),
            lv_name: entry.name.clone(),
            attr: entry.attr.clone(),
            seg_type: entry.seg_type.clone(),
            copies: counters.map(|c| c.copies).unwrap_or(0),
            log_size: counters.map(|c| c.log_size).unwrap_or(0),
            metadata_size: counters.map(|c| c.metadata_size).unwrap_or(0),
        }),
    };

    let id = tree.alloc_device_id();
    let mut lv = Device::new(id, &full_name, kind);
    lv.exists = true;
    lv.uuid = entry.uuid.clone();
    lv.size = entry.size;
    lv.parents = vec![parent_id];

    let lv_id = tree.add_device(lv)?;

    // An accessible LV can itself hold a recognizable format (nested
    // filesystem, nested LUKS). This is the one place discovery recurses
    // into itself with a synthesized record.
    let dm_name = lv_dm_name(vg_name, &entry.name);
    if let Some(nested) = ctx.records.get(&dm_name).cloned() {
        ctx.seen.insert(dm_name);
        handle_format(tree, ctx, &nested, lv_id)?;
    }

    Ok(Some(lv_id))
}

/// Mirror log/image and thin metadata/data components name their parent:
/// `root_mimage_0` belongs to `root`.
fn internal_component_parent(name: &str) -> Option<&str> {
    for marker in ["_mimage_", "_mlog", "_tmeta", "_tdata", "_rimage_", "_rmeta_"] {
        if let Some(pos) = name.find(marker) {
            return Some(&name[..pos]);
        }
    }

    None
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    copies: u32,
    log_size: u64,
    metadata_size: u64,
}

type ComponentCounters = std::collections::HashMap<String, Counters>;

/// Folds component LVs into per-parent counters before materialization,
/// since components sort ahead of the LVs they belong to.
fn fold_components(entries: &[LvEntry]) -> ComponentCounters {
    let mut map = ComponentCounters::new();

    for entry in entries {
        let Some(parent) = internal_component_parent(&entry.name) else {
            continue;
        };

        let counters = map.entry(parent.to_string()).or_default();

        if entry.name.contains("_mimage_") || entry.name.contains("_rimage_") {
            counters.copies += 1;
        } else if entry.name.contains("_mlog") {
            counters.log_size = entry.size;
        } else if entry.name.contains("_tmeta") || entry.name.contains("_rmeta_") {
            counters.metadata_size = entry.size;
        }
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Config,
        Mode,
    };
    use crate::tree::populate::record_support::*;

    fn pv_record(name: &str, disk: &str, vg: &str, lvs: &[(&str, &str, &str)]) -> DeviceRecord {
        // lvs: (name, attr, segtype)
        let mut record = partition_record(name, disk);

        record
            .props
            .insert(keys::ID_FS_TYPE.to_string(), "LVM2_member".to_string());
        record.props.insert(
            keys::ID_FS_UUID.to_string(),
            format!("pv-uuid-{name}"),
        );
        record
            .props
            .insert(keys::LVM2_VG_NAME.to_string(), vg.to_string());
        record
            .props
            .insert(keys::LVM2_VG_UUID.to_string(), format!("vg-uuid-{vg}"));
        record
            .props
            .insert(keys::LVM2_PV_COUNT.to_string(), "2".to_string());

        if !lvs.is_empty() {
            let join = |f: for<'a> fn(&'a (&'a str, &'a str, &'a str)) -> &'a str| {
                lvs.iter().map(f).collect::<Vec<_>>().join(",")
            };

            record.props.insert(
                keys::LVM2_LV_NAMES.to_string(),
                join(|l| l.0),
            );
            record.props.insert(
                keys::LVM2_LV_ATTRS.to_string(),
                join(|l| l.1),
            );
            record.props.insert(
                keys::LVM2_LV_TYPES.to_string(),
                join(|l| l.2),
            );
            record.props.insert(
                keys::LVM2_LV_SIZES.to_string(),
                lvs.iter()
                    .map(|_| "1073741824")
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }

        record
    }

    fn testing_tree() -> DeviceTree {
        DeviceTree::new(Config {
            mode: Mode::Testing,
            ..Default::default()
        })
    }

    #[test]
    fn test_two_pvs_one_vg() {
        let mut tree = testing_tree();

        let records = vec![
            disk_record("sda"),
            disk_record("sdb"),
            pv_record("sda1", "sda", "vg00", &[("root", "-wi-ao----", "linear")]),
            pv_record("sdb1", "sdb", "vg00", &[("root", "-wi-ao----", "linear")]),
        ];

        tree.populate(&records).expect("populate failed");

        let vgs = tree.get_devices_by_type("lvmvg");
        assert_eq!(vgs.len(), 1, "expected exactly one VG");

        let vg = vgs[0];
        assert_eq!(vg.name, "vg00");
        assert_eq!(vg.parents.len(), 2);
        assert!(vg.is_complete());

        // The LV materialized once, stacked on the VG.
        let lv = tree
            .get_device_by_name("vg00-root", LookupOpts::default())
            .expect("lv not materialized");
        assert_eq!(lv.parents, vec![vg.id]);
        assert_eq!(lv.type_name(), "lvmlv");
    }

    #[test]
    fn test_incomplete_vg() {
        let mut tree = testing_tree();

        let records = vec![
            disk_record("sda"),
            pv_record("sda1", "sda", "vg00", &[]),
        ];

        tree.populate(&records).expect("populate failed");

        let vg = tree
            .get_device_by_name("vg00", LookupOpts::any())
            .expect("vg not created");

        // Two PVs claimed, one discovered.
        assert!(!vg.is_complete());
        assert!(tree
            .get_device_by_name("vg00", LookupOpts::default())
            .is_none());
    }

    #[test]
    fn test_thin_pool_materialized_before_thin_lv() {
        let mut tree = testing_tree();

        let mut pv = pv_record(
            "sda1",
            "sda",
            "vg00",
            &[
                ("thin1", "Vwi-a-tz--", "thin"),
                ("pool0", "twi-aotz--", "thin-pool"),
            ],
        );
        pv.props.insert(
            keys::LVM2_LV_POOLS.to_string(),
            "pool0,-".to_string(),
        );
        pv.props
            .insert(keys::LVM2_PV_COUNT.to_string(), "1".to_string());

        let records = vec![disk_record("sda"), pv];

        tree.populate(&records).expect("populate failed");

        let pool = tree
            .get_device_by_name("vg00-pool0", LookupOpts::default())
            .expect("pool not materialized");
        let thin = tree
            .get_device_by_name("vg00-thin1", LookupOpts::default())
            .expect("thin lv not materialized");

        assert_eq!(pool.type_name(), "lvmthinpool");
        assert_eq!(thin.type_name(), "lvmthinlv");
        assert_eq!(thin.parents, vec![pool.id]);
    }

    #[test]
    fn test_snapshot_requires_origin() {
        let mut tree = testing_tree();

        let mut pv = pv_record(
            "sda1",
            "sda",
            "vg00",
            &[
                ("snap0", "swi-a-s---", "linear"),
                ("root", "-wi-ao----", "linear"),
            ],
        );
        pv.props.insert(
            keys::LVM2_LV_ORIGINS.to_string(),
            "root,-".to_string(),
        );
        pv.props
            .insert(keys::LVM2_PV_COUNT.to_string(), "1".to_string());

        let records = vec![disk_record("sda"), pv];

        tree.populate(&records).expect("populate failed");

        assert!(tree
            .get_device_by_name("vg00-root", LookupOpts::default())
            .is_some());
        assert!(tree
            .get_device_by_name("vg00-snap0", LookupOpts::default())
            .is_some());
    }

    #[test]
    fn test_internal_lvs_folded() {
        let mut tree = testing_tree();

        let mut pv = pv_record(
            "sda1",
            "sda",
            "vg00",
            &[
                ("root_mimage_0", "iwi-ao----", "linear"),
                ("root_mimage_1", "iwi-ao----", "linear"),
                ("root", "mwi-ao----", "mirror"),
                ("root_mlog", "lwi-ao----", "linear"),
            ],
        );
        pv.props
            .insert(keys::LVM2_PV_COUNT.to_string(), "1".to_string());

        let records = vec![disk_record("sda"), pv];

        tree.populate(&records).expect("populate failed");

        assert!(tree
            .get_device_by_name("vg00-root_mimage_0", LookupOpts::any())
            .is_none());

        let root = tree
            .get_device_by_name("vg00-root", LookupOpts::default())
            .expect("mirror lv not materialized");

        let DeviceKind::LvmLogicalVolume(info) = &root.kind else {
            panic!("root is not a plain lv");
        };

        assert_eq!(info.copies, 2);
        assert!(info.log_size > 0);
    }

    #[test]
    fn test_nested_format_on_materialized_lv() {
        let mut tree = testing_tree();

        let mut nested = DeviceRecord::new("vg00-root");
        nested
            .props
            .insert(keys::ID_FS_TYPE.to_string(), "ext4".to_string());
        nested
            .props
            .insert(keys::ID_FS_UUID.to_string(), "cccc-0001".to_string());

        let records = vec![
            disk_record("sda"),
            pv_record("sda1", "sda", "vg00", &[("root", "-wi-ao----", "linear")]),
            nested,
        ];

        tree.populate(&records).expect("populate failed");

        let lv = tree
            .get_device_by_name("vg00-root", LookupOpts::default())
            .expect("lv not materialized");

        assert_eq!(lv.format.type_name(), Some("ext4"));
    }
}
