use serde_json::json;

use crate::config::Config;
use crate::entity::record::{
    keys,
    DeviceRecord,
};
use crate::errors::BlkError;
use crate::linux;
use crate::tree::DeviceTree;

pub fn run(config: Config) -> Result<(), BlkError> {
    let mut tree = DeviceTree::new(config);

    let records = collect_records(&tree)?;
    tree.populate(&records)?;

    println!("{}", report(&tree));

    Ok(())
}

/// Assembles the enumeration records the tree consumes: lsblk topology,
/// blkid format tags, and LVM report data merged into each PV's record.
pub fn collect_records(tree: &DeviceTree) -> Result<Vec<DeviceRecord>, BlkError> {
    if tree.config.mode.offline() {
        return Ok(Vec::new());
    }

    linux::udev::settle()?;

    let mut records = linux::lsblk::scan()?;

    let blkid_tags = linux::blkid::probe_all()?;
    for record in records.iter_mut() {
        if let Some(tags) = blkid_tags.get(&record.path()) {
            for (key, val) in tags {
                record
                    .props
                    .entry(key.clone())
                    .or_insert_with(|| val.clone());
            }
        }
    }

    merge_lvm_reports(&mut records)?;

    Ok(records)
}

/// Each PV record learns its VG identity and the VG's LV roster, so the
/// tree's LVM reconciliation reads records only.
fn merge_lvm_reports(records: &mut [DeviceRecord]) -> Result<(), BlkError> {
    let pv_reports = linux::lvm::pvs_report()?;

    let mut vg_names: Vec<String> = pv_reports
        .iter()
        .map(|pv| pv.vg_name.clone())
        .collect();
    vg_names.sort();
    vg_names.dedup();

    for vg_name in vg_names {
        let lvs = linux::lvm::lvs_report(&vg_name)?;

        let column = |f: &dyn Fn(&linux::lvm::LvReport) -> String| {
            lvs.iter().map(f).collect::<Vec<_>>().join(",")
        };

        let names = column(&|lv| lv.lv_name.clone());
        let uuids = column(&|lv| lv.lv_uuid.clone());
        let sizes = column(&|lv| lv.size.to_string());
        let attrs = column(&|lv| lv.attr.clone());
        let types = column(&|lv| lv.seg_type.clone());
        let origins =
            column(&|lv| lv.origin.clone().unwrap_or_else(|| "-".to_string()));
        let pools = column(&|lv| lv.pool.clone().unwrap_or_else(|| "-".to_string()));

        for pv in pv_reports.iter().filter(|pv| pv.vg_name == vg_name) {
            let pv_name = pv.pv_name.trim_start_matches("/dev/");

            let Some(record) = records.iter_mut().find(|r| r.name == pv_name)
            else {
                continue;
            };

            let mut set = |key: &str, val: String| {
                record.props.insert(key.to_string(), val);
            };

            set(keys::LVM2_VG_NAME, pv.vg_name.clone());
            set(keys::LVM2_VG_UUID, pv.vg_uuid.clone());
            set(keys::LVM2_PV_COUNT, pv.pv_count.to_string());
            set(keys::LVM2_PE_SIZE, pv.pe_size.to_string());

            if !lvs.is_empty() {
                set(keys::LVM2_LV_NAMES, names.clone());
                set(keys::LVM2_LV_UUIDS, uuids.clone());
                set(keys::LVM2_LV_SIZES, sizes.clone());
                set(keys::LVM2_LV_ATTRS, attrs.clone());
                set(keys::LVM2_LV_TYPES, types.clone());
                set(keys::LVM2_LV_ORIGINS, origins.clone());
                set(keys::LVM2_LV_POOLS, pools.clone());
            }
        }
    }

    Ok(())
}

pub fn report(tree: &DeviceTree) -> String {
    let devices: Vec<serde_json::Value> = tree
        .devices()
        .map(|d| {
            let parents: Vec<String> = d
                .parents
                .iter()
                .filter_map(|p| tree.get_device(*p))
                .map(|p| p.name.clone())
                .collect();

            json!({
                "name": d.name,
                "type": d.type_name(),
                "size": d.size,
                "exists": d.exists,
                "protected": d.protected,
                "format": d.format.type_name(),
                "uuid": d.uuid,
                "parents": parents,
            })
        })
        .collect();

    let leaves: Vec<String> = tree
        .leaves()
        .into_iter()
        .filter_map(|id| tree.get_device(id))
        .map(|d| d.name.clone())
        .collect();

    json!({
        "devices": devices,
        "leaves": leaves,
        "ignoredDisks": tree.ignored_disks(),
    })
    .to_string()
}
