use colored::Colorize;
use serde_json::json;

use crate::config::Config;
use crate::entity::action::Action;
use crate::entity::device::{
    Device,
    DeviceKind,
    PartType,
    PartitionInfo,
};
use crate::entity::format::{
    Format,
    FormatArgs,
    FormatKind,
};
use crate::entity::plan::{
    Plan,
    PlanOp,
};
use crate::entity::parse_human_bytes;
use crate::errors::BlkError;
use crate::linux;
use crate::tree::{
    DeviceTree,
    LookupOpts,
};
use crate::utils::shell;
use crate::{
    constants,
    utils,
};

use super::scan::collect_records;

pub fn run(plan_path: &str, config: Config, dry_run: bool) -> Result<(), BlkError> {
    let plan_yaml = utils::fs::read_file(plan_path)?;
    let plan = Plan::from_yaml(&plan_yaml)?;

    if !dry_run {
        check_required_commands()?;
        linux::user::require_root("committing a plan")?;
    } else if !linux::user::is_root() {
        println!("{}", "WARN: running as non-root user".yellow());
    }

    let mut tree = DeviceTree::new(config);

    let records = collect_records(&tree)?;
    tree.populate(&records)?;

    for op in &plan.ops {
        register_op(&mut tree, op)?;
    }

    tree.process_actions(dry_run)?;

    println!("{}", action_report(&tree, dry_run));

    Ok(())
}

fn check_required_commands() -> Result<(), BlkError> {
    for cmd in constants::REQUIRED_COMMANDS {
        if !shell::in_path(cmd) {
            return Err(BlkError::BadConfig(format!(
                "required command {cmd} not in PATH"
            )));
        }
    }

    Ok(())
}

/// Translates one plan request into registered actions.
fn register_op(tree: &mut DeviceTree, op: &PlanOp) -> Result<(), BlkError> {
    match op {
        PlanOp::Wipe { device } => {
            let id = resolve(tree, device)?;
            tree.register_action(Action::destroy_format(id))?;
        }

        PlanOp::Destroy { device } => {
            let id = resolve(tree, device)?;
            tree.register_action(Action::destroy_device(id))?;
        }

        PlanOp::CreatePartition {
            disk,
            size,
            fs,
            label,
        } => {
            let disk_id = resolve(tree, disk)?;

            let disk_device = tree.device(disk_id)?;
            if !disk_device.format.is_disklabel() {
                return Err(BlkError::BadPlan(format!(
                    "disk {disk} has no disklabel to create partitions in"
                )));
            }

            let number = next_partition_number(tree, disk_id);
            let name = linux::partition_name(&tree.device(disk_id)?.name, number);
            let size = parse_human_bytes(size)?;

            let id = tree.alloc_device_id();
            let mut partition = Device::new(
                id,
                &name,
                DeviceKind::Partition(PartitionInfo {
                    number,
                    part_type: PartType::Primary,
                    disk: disk_id,
                }),
            );
            partition.parents = vec![disk_id];
            partition.size = size;

            tree.register_action(Action::create_device(partition))?;

            if let Some(fs) = fs {
                let format = Format::from_type(
                    fs,
                    FormatArgs {
                        label: label.clone(),
                        ..Default::default()
                    },
                )?;

                tree.register_action(Action::create_format(id, format))?;
            }
        }

        PlanOp::CreateFormat { device, fs, label } => {
            let id = resolve(tree, device)?;

            let format = Format::from_type(
                fs,
                FormatArgs {
                    label: label.clone(),
                    ..Default::default()
                },
            )?;

            tree.register_action(Action::create_format(id, format))?;
        }

        PlanOp::Resize { device, size } => {
            let id = resolve(tree, device)?;
            let new_size = parse_human_bytes(size)?;

            tree.register_action(Action::resize_device(id, new_size))?;

            let resizable = matches!(
                tree.device(id)?.format.kind,
                FormatKind::Filesystem { .. } | FormatKind::Btrfs { .. },
            );

            if resizable {
                tree.register_action(Action::resize_format(id, new_size))?;
            }
        }
    }

    Ok(())
}

fn resolve(tree: &DeviceTree, spec: &str) -> Result<u64, BlkError> {
    tree.resolve_device_spec(spec, None, LookupOpts::default())
        .map(|d| d.id)
        .ok_or_else(|| BlkError::NoSuchDevice(spec.to_string()))
}

fn next_partition_number(tree: &DeviceTree, disk: u64) -> u32 {
    tree.devices()
        .filter_map(|d| match &d.kind {
            DeviceKind::Partition(info) if info.disk == disk => Some(info.number),
            _ => None,
        })
        .max()
        .map(|n| n + 1)
        .unwrap_or(1)
}

fn action_report(tree: &DeviceTree, dry_run: bool) -> String {
    let describe = |a: &Action| {
        json!({
            "id": a.id,
            "verb": a.verb(),
            "object": a.object(),
            "device": a.device,
        })
    };

    let queued: Vec<serde_json::Value> = tree.actions().iter().map(describe).collect();
    let completed: Vec<serde_json::Value> =
        tree.completed_actions().iter().map(describe).collect();

    json!({
        "dryRun": dry_run,
        "queued": queued,
        "completed": completed,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::tree::populate::record_support::*;

    fn planned_tree() -> DeviceTree {
        let mut tree = DeviceTree::new(Config {
            mode: Mode::Testing,
            ..Default::default()
        });

        let mut disk = disk_record("sda");
        disk.props.insert(
            crate::entity::record::keys::ID_PART_TABLE_TYPE.to_string(),
            "gpt".to_string(),
        );

        let records = vec![
            disk,
            with_fs(partition_record("sda1", "sda"), "ext4", "aaaa-0001"),
        ];

        tree.populate(&records).expect("populate failed");

        tree
    }

    #[test]
    fn test_register_create_partition_op() {
        let mut tree = planned_tree();

        register_op(
            &mut tree,
            &PlanOp::CreatePartition {
                disk: "sda".to_string(),
                size: "8G".to_string(),
                fs: Some("xfs".to_string()),
                label: Some("scratch".to_string()),
            },
        )
        .expect("register op failed");

        assert_eq!(tree.actions().len(), 2);

        let part = tree
            .get_device_by_name("sda2", LookupOpts::default())
            .expect("planned partition missing");

        assert!(!part.exists);
        assert_eq!(part.size, 8_000_000_000);
        assert_eq!(part.format.type_name(), Some("xfs"));
        assert_eq!(part.format.label.as_deref(), Some("scratch"));
    }

    #[test]
    fn test_register_wipe_and_destroy_ops() {
        let mut tree = planned_tree();

        register_op(
            &mut tree,
            &PlanOp::Wipe {
                device: "sda1".to_string(),
            },
        )
        .expect("wipe op failed");

        register_op(
            &mut tree,
            &PlanOp::Destroy {
                device: "sda1".to_string(),
            },
        )
        .expect("destroy op failed");

        assert_eq!(tree.actions().len(), 2);
        assert!(tree
            .get_device_by_name("sda1", LookupOpts::default())
            .is_none());
    }

    #[test]
    fn test_create_partition_requires_disklabel() {
        let mut tree = DeviceTree::new(Config {
            mode: Mode::Testing,
            ..Default::default()
        });

        tree.populate(&[disk_record("sdb")]).expect("populate failed");

        let result = register_op(
            &mut tree,
            &PlanOp::CreatePartition {
                disk: "sdb".to_string(),
                size: "1G".to_string(),
                fs: None,
                label: None,
            },
        );

        assert!(matches!(result, Err(BlkError::BadPlan(_))));
    }

    #[test]
    fn test_unknown_device_in_plan() {
        let mut tree = planned_tree();

        let result = register_op(
            &mut tree,
            &PlanOp::Destroy {
                device: "sdx9".to_string(),
            },
        );

        assert!(matches!(result, Err(BlkError::NoSuchDevice(_))));
    }
}
