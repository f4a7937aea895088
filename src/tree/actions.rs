use std::collections::HashMap;

use tracing::{
    debug,
    info,
    warn,
};

use crate::entity::action::{
    Action,
    ActionId,
    ActionKind,
    Obsoletes,
};
use crate::entity::device::{
    Device,
    DeviceId,
    DeviceKind,
    PartType,
    PartitionInfo,
};
use crate::entity::format::FormatKind;
use crate::errors::BlkError;
use crate::linux;

use super::DeviceTree;

/// Filters for [`DeviceTree::find_actions`]; unset fields match
/// everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct ActionFilter<'a> {
    pub device: Option<DeviceId>,
    pub verb: Option<&'a str>,
    pub object: Option<&'a str>,
    pub path: Option<&'a str>,
    pub id: Option<ActionId>,
}

impl DeviceTree {
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn completed_actions(&self) -> &[Action] {
        &self.completed
    }

    /// Registers an action: validates it, applies its immediate
    /// structural effect to the in-memory tree (so lookups reflect the
    /// pending state before anything touches physical storage), and
    /// appends it to the queue.
    pub fn register_action(&mut self, mut action: Action) -> Result<ActionId, BlkError> {
        // At most one live action of a given (verb, object) per device.
        let duplicate = self.actions.iter().any(|a| {
            a.device == action.device
                && a.verb() == action.verb()
                && a.object() == action.object()
        });

        if duplicate {
            return Err(BlkError::DeviceTree(format!(
                "duplicate {} {} action for device id {}",
                action.verb(),
                action.object(),
                action.device,
            )));
        }

        let in_tree = self.devices.contains_key(&action.device);

        match &mut action.kind {
            ActionKind::CreateDevice { staged } => {
                if in_tree {
                    return Err(BlkError::DeviceTree(format!(
                        "create action for device id {} already in tree",
                        action.device,
                    )));
                }

                let device = staged.take().ok_or_else(|| {
                    BlkError::Bug("create action with no staged device".to_string())
                })?;

                if device.exists {
                    return Err(BlkError::DeviceTree(format!(
                        "create action for device {} that already exists",
                        device.name,
                    )));
                }

                self.add_device(*device)?;
            }

            ActionKind::DestroyDevice { removed } => {
                if !in_tree {
                    return Err(BlkError::DeviceTree(format!(
                        "destroy action for device id {} not in tree",
                        action.device,
                    )));
                }

                // Leaf-only and protection rules enforced by removal.
                let device = self.remove_device(action.device, false)?;
                *removed = Some(Box::new(device));
            }

            ActionKind::CreateFormat { format, prev } => {
                if !in_tree {
                    return Err(BlkError::DeviceTree(format!(
                        "format action for device id {} not in tree",
                        action.device,
                    )));
                }

                self.reject_non_leaf(action.device, "create format")?;

                if format.exists {
                    return Err(BlkError::Bug(format!(
                        "planned format for device id {} flagged as existing",
                        action.device,
                    )));
                }

                format.device = Some(self.device_path(action.device)?);

                let device = self.device_mut(action.device)?;
                *prev = Some(std::mem::replace(&mut device.format, format.clone()));
            }

            ActionKind::DestroyFormat { orig } => {
                if !in_tree {
                    return Err(BlkError::DeviceTree(format!(
                        "format action for device id {} not in tree",
                        action.device,
                    )));
                }

                self.reject_non_leaf(action.device, "destroy format")?;

                let device = self.device_mut(action.device)?;
                *orig = Some(std::mem::take(&mut device.format));
            }

            ActionKind::ResizeDevice {
                new_size,
                orig_size,
            } => {
                if !in_tree {
                    return Err(BlkError::DeviceTree(format!(
                        "resize action for device id {} not in tree",
                        action.device,
                    )));
                }

                let new_size = *new_size;
                let device = self.device_mut(action.device)?;
                *orig_size = Some(device.size);
                device.size = new_size;
            }

            ActionKind::ResizeFormat {
                orig_size,
                ..
            } => {
                if !in_tree {
                    return Err(BlkError::DeviceTree(format!(
                        "resize action for device id {} not in tree",
                        action.device,
                    )));
                }

                // The format's size baseline is the device size before
                // any pending device resize, so grow/shrink ordering
                // compares against the on-disk state.
                let queued_orig = self.actions.iter().find_map(|a| match &a.kind {
                    ActionKind::ResizeDevice {
                        orig_size: Some(orig),
                        ..
                    } if a.device == action.device => Some(*orig),
                    _ => None,
                });

                let device = self.device(action.device)?;
                *orig_size = Some(queued_orig.unwrap_or(device.size));
            }
        }

        let id = self.alloc_action_id();
        action.id = id;

        debug!(
            action = id,
            verb = action.verb(),
            object = action.object(),
            device = action.device,
            "registered action"
        );

        self.actions.push(action);

        Ok(id)
    }

    fn reject_non_leaf(&self, device: DeviceId, what: &str) -> Result<(), BlkError> {
        if !self.is_leaf(device) {
            let name = self.device(device)?.name.clone();

            return Err(BlkError::DeviceTree(format!(
                "{what} on non-leaf device {name}",
            )));
        }

        Ok(())
    }

    /// Cancels a queued action, reversing its structural effect. Calling
    /// this on an already-executed action is a programmer error.
    pub fn cancel_action(&mut self, id: ActionId) -> Result<(), BlkError> {
        if self.completed.iter().any(|a| a.id == id) {
            return Err(BlkError::Bug(format!(
                "cancel of already-executed action {id}",
            )));
        }

        let index = self
            .actions
            .iter()
            .position(|a| a.id == id)
            .ok_or_else(|| BlkError::Bug(format!("cancel of unknown action {id}")))?;

        let action = self.actions.remove(index);

        match action.kind {
            ActionKind::CreateDevice { .. } => {
                self.remove_device(action.device, false)?;
            }

            ActionKind::DestroyDevice { removed } => {
                let device = removed.ok_or_else(|| {
                    BlkError::Bug("destroy action with no removed device".to_string())
                })?;

                self.add_device(*device)?;
            }

            ActionKind::CreateFormat { prev, .. } => {
                let prev = prev.ok_or_else(|| {
                    BlkError::Bug("create-format action with no prev".to_string())
                })?;

                self.device_mut(action.device)?.format = prev;
            }

            ActionKind::DestroyFormat { orig } => {
                let orig = orig.ok_or_else(|| {
                    BlkError::Bug("destroy-format action with no orig".to_string())
                })?;

                self.device_mut(action.device)?.format = orig;
            }

            ActionKind::ResizeDevice { orig_size, .. } => {
                let orig_size = orig_size.ok_or_else(|| {
                    BlkError::Bug("resize action with no orig size".to_string())
                })?;

                self.device_mut(action.device)?.size = orig_size;
            }

            ActionKind::ResizeFormat { .. } => {}
        }

        debug!(action = id, "canceled action");

        Ok(())
    }

    /// Cancels the whole queue, newest first so structural effects
    /// unwind cleanly.
    pub fn cancel_all_actions(&mut self) {
        while let Some(action) = self.actions.last() {
            let id = action.id;

            if let Err(err) = self.cancel_action(id) {
                warn!(action = id, %err, "failed to cancel action");
                // Drop it rather than loop forever on a corrupt entry.
                self.actions.retain(|a| a.id != id);
            }
        }
    }

    /// Pure query over the queued actions; every set filter must match.
    pub fn find_actions(&self, filter: ActionFilter) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| filter.device.map(|d| a.device == d).unwrap_or(true))
            .filter(|a| filter.verb.map(|v| a.verb() == v).unwrap_or(true))
            .filter(|a| filter.object.map(|o| a.object() == o).unwrap_or(true))
            .filter(|a| filter.id.map(|i| a.id == i).unwrap_or(true))
            .filter(|a| {
                filter
                    .path
                    .map(|p| {
                        self.action_device(a)
                            .map(|d| d.path() == p)
                            .unwrap_or(false)
                    })
                    .unwrap_or(true)
            })
            .collect()
    }

    /// The action's target, whether still in the tree or held by a
    /// destroy action.
    fn action_device<'a>(&'a self, action: &'a Action) -> Option<&'a Device> {
        if let ActionKind::DestroyDevice {
            removed: Some(device),
        } = &action.kind
        {
            return Some(device);
        }

        self.devices.get(&action.device)
    }

    /// Removes queued actions rendered unnecessary by later ones. Runs
    /// to a fixed point, restarting the scan after each removal so
    /// entries disappearing mid-scan are never touched again.
    pub fn prune_actions(&mut self) {
        loop {
            let mut remove: Option<(ActionId, Option<ActionId>)> = None;

            'scan: for later in &self.actions {
                for earlier in &self.actions {
                    if later.id <= earlier.id {
                        continue;
                    }

                    match later.obsoletes(earlier) {
                        Obsoletes::No => {}
                        Obsoletes::Other => {
                            remove = Some((earlier.id, None));
                            break 'scan;
                        }
                        Obsoletes::Both => {
                            remove = Some((earlier.id, Some(later.id)));
                            break 'scan;
                        }
                    }
                }
            }

            let Some((first, second)) = remove else {
                return;
            };

            debug!(obsolete = first, by = ?second, "pruned action");

            self.actions.retain(|a| a.id != first && Some(a.id) != second);
        }
    }

    /// Parent links for every action target, including devices already
    /// removed from the tree by pending destroys.
    fn action_parent_map(&self) -> HashMap<DeviceId, Vec<DeviceId>> {
        let mut map: HashMap<DeviceId, Vec<DeviceId>> = self
            .devices
            .values()
            .map(|d| (d.id, d.parents.clone()))
            .collect();

        for action in &self.actions {
            if let ActionKind::DestroyDevice {
                removed: Some(device),
            } = &action.kind
            {
                map.insert(device.id, device.parents.clone());
            }
        }

        map
    }

    fn map_depends_on(
        map: &HashMap<DeviceId, Vec<DeviceId>>,
        id: DeviceId,
        other: DeviceId,
    ) -> bool {
        if id == other {
            return true;
        }

        map.get(&id)
            .map(|parents| {
                parents.iter().any(|p| Self::map_depends_on(map, *p, other))
            })
            .unwrap_or(false)
    }

    /// Whether `a` must execute before `b`. The coarse phase ordinal
    /// decides across phases; device-level prerequisites only ever order
    /// actions within one phase, which keeps the graph acyclic by
    /// construction (cycles would still be caught below).
    fn must_precede(
        map: &HashMap<DeviceId, Vec<DeviceId>>,
        a: &Action,
        b: &Action,
    ) -> bool {
        if a.ordinal() != b.ordinal() {
            return a.ordinal() > b.ordinal();
        }

        match (&a.kind, &b.kind) {
            // Parents are created before the devices stacked on them,
            // and a device before its own format.
            (ActionKind::CreateDevice { .. }, ActionKind::CreateDevice { .. })
            | (ActionKind::CreateDevice { .. }, ActionKind::CreateFormat { .. })
            | (ActionKind::CreateFormat { .. }, ActionKind::CreateFormat { .. }) => {
                Self::map_depends_on(map, b.device, a.device)
            }

            // A parent's format (an LVM PV, an md member) is written
            // before any device stacked on it is created.
            (ActionKind::CreateFormat { .. }, ActionKind::CreateDevice { .. }) => {
                a.device != b.device && Self::map_depends_on(map, b.device, a.device)
            }

            // A child's format goes before the child device itself, and
            // everything stacked on a device goes before that device.
            (ActionKind::DestroyFormat { .. }, ActionKind::DestroyDevice { .. }) => {
                a.device == b.device || Self::map_depends_on(map, a.device, b.device)
            }
            (ActionKind::DestroyFormat { .. }, ActionKind::DestroyFormat { .. })
            | (ActionKind::DestroyDevice { .. }, ActionKind::DestroyDevice { .. }) => {
                a.device != b.device && Self::map_depends_on(map, a.device, b.device)
            }
            (ActionKind::DestroyDevice { .. }, ActionKind::DestroyFormat { .. }) => {
                a.device != b.device && Self::map_depends_on(map, a.device, b.device)
            }

            // Growing: the device grows before its format. Shrinking:
            // the format shrinks before its device.
            (
                ActionKind::ResizeDevice {
                    new_size,
                    orig_size,
                },
                ActionKind::ResizeFormat { .. },
            ) => a.device == b.device && Some(*new_size) > *orig_size,
            (
                ActionKind::ResizeFormat {
                    new_size,
                    orig_size,
                },
                ActionKind::ResizeDevice { .. },
            ) => a.device == b.device && Some(*new_size) < *orig_size,

            _ => false,
        }
    }

    /// Deterministic topological sort of the queue, ties broken by
    /// registration order. A cycle is a logic defect in registration and
    /// aborts the whole commit.
    pub fn sort_actions(&mut self) -> Result<(), BlkError> {
        let map = self.action_parent_map();
        let n = self.actions.len();

        let mut indegree = vec![0usize; n];
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];

        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }

                if Self::must_precede(&map, &self.actions[i], &self.actions[j]) {
                    edges[i].push(j);
                    indegree[j] += 1;
                }
            }
        }

        let mut done = vec![false; n];
        let mut order = Vec::with_capacity(n);

        while order.len() < n {
            // Smallest registration id among the ready actions.
            let next = (0..n)
                .filter(|i| !done[*i] && indegree[*i] == 0)
                .min_by_key(|i| self.actions[*i].id);

            let Some(next) = next else {
                return Err(BlkError::Bug(
                    "circular dependency in action queue".to_string(),
                ));
            };

            done[next] = true;
            order.push(next);

            for &j in &edges[next] {
                indegree[j] -= 1;
            }
        }

        let mut sorted = Vec::with_capacity(n);
        let mut drained: Vec<Option<Action>> =
            self.actions.drain(..).map(Some).collect();

        for i in order {
            if let Some(action) = drained[i].take() {
                sorted.push(action);
            }
        }

        self.actions = sorted;

        Ok(())
    }

    /// Commits the queue against real storage: final fixups, implicit
    /// extended-partition synthesis, prune, sort, then one action at a
    /// time with partition numbering re-synchronized after each. A
    /// `DiskLabelCommit` failure triggers one teardown-all pass and a
    /// single retry; everything else aborts the remaining queue with
    /// already-executed actions left applied.
    pub fn process_actions(&mut self, dry_run: bool) -> Result<(), BlkError> {
        if !self.config.mode.offline() && !dry_run {
            linux::udev::settle()?;
        }

        self.pre_commit_fixups();
        self.synthesize_extended_partitions()?;

        self.prune_actions();
        self.sort_actions()?;

        if dry_run {
            info!(queued = self.actions.len(), "dry run, not committing");
            return Ok(());
        }

        while !self.actions.is_empty() {
            let action = self.actions.remove(0);

            info!(
                action = action.id,
                verb = action.verb(),
                object = action.object(),
                "executing action"
            );

            if let Err(err) = self.execute_action(&action) {
                if !err.is_disklabel_commit() {
                    return Err(err);
                }

                // A destroyed format re-activated a stack under us; tear
                // everything down and retry this one action once.
                warn!(action = action.id, %err, "retrying after teardown");
                self.teardown_all();
                self.execute_action(&action)?;
            }

            self.finalize_executed(&action)?;
            self.completed.push(action);
        }

        Ok(())
    }

    /// Final adjustments before commit: partition names are recomputed
    /// from their disk and number, since pending sibling actions can
    /// have shifted the numbering.
    fn pre_commit_fixups(&mut self) {
        let renames: Vec<(DeviceId, String)> = self
            .devices
            .values()
            .filter_map(|d| match &d.kind {
                DeviceKind::Partition(info) => {
                    let disk = self.devices.get(&info.disk)?;
                    let name = linux::partition_name(&disk.name, info.number);

                    (name != d.name).then_some((d.id, name))
                }
                _ => None,
            })
            .collect();

        for (id, name) in renames {
            if let Some(device) = self.devices.get_mut(&id) {
                debug!(from = %device.name, to = %name, "renaming partition");
                self.names.remove(&device.name);
                device.name = name.clone();
                self.names.insert(name);
            }
        }
    }

    /// Creating a logical partition needs an extended container; queue
    /// one implicitly when the caller did not.
    fn synthesize_extended_partitions(&mut self) -> Result<(), BlkError> {
        let mut needed: Vec<DeviceId> = Vec::new();

        for action in &self.actions {
            let ActionKind::CreateDevice { .. } = &action.kind else {
                continue;
            };

            let Some(device) = self.devices.get(&action.device) else {
                continue;
            };

            let DeviceKind::Partition(info) = &device.kind else {
                continue;
            };

            if info.part_type != PartType::Logical {
                continue;
            }

            let has_extended = self.devices.values().any(|d| match &d.kind {
                DeviceKind::Partition(p) => {
                    p.disk == info.disk && p.part_type == PartType::Extended
                }
                _ => false,
            });

            if !has_extended && !needed.contains(&info.disk) {
                needed.push(info.disk);
            }
        }

        for disk_id in needed {
            let disk = self.device(disk_id)?;
            let number = self.next_partition_number(disk_id);
            let name = linux::partition_name(&disk.name, number);
            let size = disk.size;

            info!(disk = %disk.name, %name, "synthesizing extended partition");

            let id = self.alloc_device_id();
            let mut extended = Device::new(
                id,
                &name,
                DeviceKind::Partition(PartitionInfo {
                    number,
                    part_type: PartType::Extended,
                    disk: disk_id,
                }),
            );
            extended.parents = vec![disk_id];
            extended.size = size;

            self.register_action(Action::create_device(extended))?;
        }

        Ok(())
    }

    fn next_partition_number(&self, disk: DeviceId) -> u32 {
        self.devices
            .values()
            .filter_map(|d| match &d.kind {
                DeviceKind::Partition(info) if info.disk == disk => Some(info.number),
                _ => None,
            })
            .max()
            .map(|n| n + 1)
            .unwrap_or(1)
    }

    fn execute_action(&mut self, action: &Action) -> Result<(), BlkError> {
        if self.config.mode.offline() {
            return self.apply_offline_effects(action);
        }

        match &action.kind {
            ActionKind::CreateDevice { .. } => {
                let device = self.device(action.device)?;

                match &device.kind {
                    DeviceKind::Partition(info) => {
                        let disk_path = self.device_path(info.disk)?;
                        let type_code = match info.part_type {
                            PartType::Extended => Some("5"),
                            _ => None,
                        };

                        linux::sfdisk::append_partition(
                            &disk_path,
                            device.size,
                            type_code,
                        )
                        .map_err(disklabel_commit_err)?;
                    }
                    DeviceKind::LvmVolumeGroup(_) => {
                        let pvs: Vec<String> = device
                            .parents
                            .iter()
                            .filter_map(|p| self.device_path(*p).ok())
                            .collect();

                        linux::lvm::create_vg(&device.name, &pvs)?;
                    }
                    DeviceKind::LvmLogicalVolume(info) => {
                        linux::lvm::create_lv(
                            &info.vg_name,
                            &info.lv_name,
                            device.size,
                        )?;
                    }
                    _ => {
                        return Err(BlkError::Device(format!(
                            "create is not supported for {} {}",
                            device.type_name(),
                            device.name,
                        )));
                    }
                }

                linux::udev::settle()?;
            }

            ActionKind::DestroyDevice { removed } => {
                let device = removed.as_deref().ok_or_else(|| {
                    BlkError::Bug("destroy action with no removed device".to_string())
                })?;

                match &device.kind {
                    DeviceKind::Partition(info) => {
                        let disk_path = self.device_path(info.disk)?;

                        linux::sfdisk::delete_partition(&disk_path, info.number)
                            .map_err(disklabel_commit_err)?;
                    }
                    DeviceKind::LvmLogicalVolume(info) => {
                        linux::lvm::remove_lv(&info.vg_name, &info.lv_name)?;
                    }
                    DeviceKind::LvmVolumeGroup(_) => {
                        linux::lvm::remove_vg(&device.name)?;
                    }
                    DeviceKind::MdArray(_) => {
                        linux::mdadm::stop(&device.path())?;
                    }
                    DeviceKind::LuksMapping => {
                        linux::luks::close(&device.name)?;
                    }
                    _ => {
                        return Err(BlkError::Device(format!(
                            "destroy is not supported for {} {}",
                            device.type_name(),
                            device.name,
                        )));
                    }
                }

                linux::udev::settle()?;
            }

            ActionKind::CreateFormat { .. } => {
                let mut format = self.device(action.device)?.format.clone();
                format.create(false)?;
                self.device_mut(action.device)?.format = format;
            }

            ActionKind::DestroyFormat { orig } => {
                let orig = orig.as_ref().ok_or_else(|| {
                    BlkError::Bug("destroy-format action with no orig".to_string())
                })?;

                // A format that never reached the disk needs no wiping.
                if orig.exists {
                    let mut format = orig.clone();
                    format.destroy().map_err(|err| match err {
                        BlkError::CmdFailed { context, .. } => {
                            BlkError::DiskLabelCommit(context)
                        }
                        err => err,
                    })?;
                }
            }

            ActionKind::ResizeDevice { new_size, .. } => {
                let device = self.device(action.device)?;

                match &device.kind {
                    DeviceKind::Partition(info) => {
                        let disk_path = self.device_path(info.disk)?;

                        linux::sfdisk::resize_partition(
                            &disk_path,
                            info.number,
                            *new_size,
                        )
                        .map_err(disklabel_commit_err)?;
                    }
                    DeviceKind::LvmLogicalVolume(info) => {
                        linux::lvm::resize_lv(
                            &info.vg_name,
                            &info.lv_name,
                            *new_size,
                        )?;
                    }
                    _ => {
                        return Err(BlkError::Device(format!(
                            "resize is not supported for {} {}",
                            device.type_name(),
                            device.name,
                        )));
                    }
                }
            }

            ActionKind::ResizeFormat { new_size, .. } => {
                let device = self.device(action.device)?;
                let path = self.device_path(action.device)?;

                match &device.format.kind {
                    FormatKind::Filesystem { fs_type } => {
                        linux::mkfs::resize_fs(&path, fs_type, *new_size)?;
                    }
                    FormatKind::Btrfs { .. } => {
                        linux::mkfs::resize_fs(&path, "btrfs", *new_size)?;
                    }
                    _ => {
                        return Err(BlkError::Format(format!(
                            "resize is not supported for format {:?}",
                            device.format.type_name(),
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Offline commit: flip the model's own flags without touching any
    /// tool, so tests exercise the full queue lifecycle.
    fn apply_offline_effects(&mut self, action: &Action) -> Result<(), BlkError> {
        match &action.kind {
            ActionKind::CreateDevice { .. } => {
                self.device_mut(action.device)?.exists = true;
            }
            ActionKind::CreateFormat { .. } => {
                self.device_mut(action.device)?.format.exists = true;
            }
            _ => {}
        }

        Ok(())
    }

    /// Post-execution bookkeeping: flip existence flags and re-read the
    /// partition table of any disk whose layout just changed, since
    /// executing on real hardware can renumber sibling partitions out
    /// from under the model.
    fn finalize_executed(&mut self, action: &Action) -> Result<(), BlkError> {
        let mut resync_disk = None;

        match &action.kind {
            ActionKind::CreateDevice { .. } => {
                let device = self.device_mut(action.device)?;
                device.exists = true;

                if let DeviceKind::Partition(info) = &device.kind {
                    resync_disk = Some(info.disk);
                }
            }
            ActionKind::DestroyDevice { removed } => {
                if let Some(device) = removed.as_deref() {
                    if let DeviceKind::Partition(info) = &device.kind {
                        resync_disk = Some(info.disk);
                    }
                }
            }
            ActionKind::CreateFormat { .. } => {
                let device = self.device_mut(action.device)?;
                device.format.exists = true;
                device.original_format = device.format.clone();
            }
            ActionKind::DestroyFormat { .. } => {
                if let Ok(device) = self.device_mut(action.device) {
                    device.original_format = device.format.clone();
                }
            }
            _ => {}
        }

        if let Some(disk) = resync_disk {
            self.resync_partition_numbers(disk)?;
        }

        Ok(())
    }

    /// Reconciles in-memory partition names/numbers with the freshly
    /// committed on-disk table.
    fn resync_partition_numbers(&mut self, disk: DeviceId) -> Result<(), BlkError> {
        if self.config.mode.offline() {
            return Ok(());
        }

        let disk_path = self.device_path(disk)?;
        let table = linux::sfdisk::read_table(&disk_path)?;

        let mut part_ids: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|d| match &d.kind {
                DeviceKind::Partition(info) => info.disk == disk && d.exists,
                _ => false,
            })
            .map(|d| d.id)
            .collect();

        part_ids.sort_by_key(|id| match &self.devices[id].kind {
            DeviceKind::Partition(info) => info.number,
            _ => 0,
        });

        if part_ids.len() != table.len() {
            warn!(
                disk = %disk_path,
                in_tree = part_ids.len(),
                on_disk = table.len(),
                "partition count mismatch after commit"
            );
        }

        for (id, (node, _size)) in part_ids.into_iter().zip(table) {
            let name = node.trim_start_matches("/dev/").to_string();
            let number = name
                .chars()
                .rev()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .chars()
                .rev()
                .collect::<String>()
                .parse()
                .unwrap_or(0);

            let Some(device) = self.devices.get_mut(&id) else {
                continue;
            };

            if device.name != name {
                debug!(from = %device.name, to = %name, "resynced partition name");
                self.names.remove(&device.name);
                device.name = name.clone();
                self.names.insert(name);
            }

            if let DeviceKind::Partition(info) = &mut device.kind {
                info.number = number;
            }
        }

        Ok(())
    }
}

fn disklabel_commit_err(err: BlkError) -> BlkError {
    match err {
        BlkError::CmdFailed { context, .. } => BlkError::DiskLabelCommit(context),
        err => err,
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::entity::format::{
        Format,
        FormatArgs,
    };

    fn planned_partition(
        tree: &mut DeviceTree,
        disk: DeviceId,
        name: &str,
        number: u32,
    ) -> Device {
        let id = tree.alloc_device_id();
        let mut device = Device::new(
            id,
            name,
            DeviceKind::Partition(PartitionInfo {
                number,
                part_type: PartType::Primary,
                disk,
            }),
        );
        device.parents = vec![disk];
        device.size = 1 << 30;

        device
    }

    #[test]
    fn test_register_and_cancel_restores_tree() {
        let mut tree = testing_tree();
        let disk = add_disk(&mut tree, "sda");

        let names_before: Vec<String> =
            tree.devices().map(|d| d.name.clone()).collect();

        let part = planned_partition(&mut tree, disk, "sda1", 1);
        let part_id = part.id;

        let action_id = tree
            .register_action(Action::create_device(part))
            .expect("register failed");

        // The tree reflects the pending state immediately.
        assert!(tree.get_device(part_id).is_some());
        assert!(!tree.get_device(part_id).unwrap().exists);

        tree.cancel_action(action_id).expect("cancel failed");

        let names_after: Vec<String> =
            tree.devices().map(|d| d.name.clone()).collect();

        assert_eq!(names_before, names_after);
        assert!(tree.actions().is_empty());
    }

    #[test]
    fn test_create_device_must_not_be_in_tree() {
        let mut tree = testing_tree();
        let disk = add_disk(&mut tree, "sda");

        let device = tree.get_device(disk).expect("no disk").clone();
        let result = tree.register_action(Action::create_device(device));

        assert!(matches!(result, Err(BlkError::DeviceTree(_))));
    }

    #[test]
    fn test_actions_on_non_leaf_rejected_except_resize() {
        let mut tree = testing_tree();
        let disk = add_disk(&mut tree, "sda");
        add_child(
            &mut tree,
            disk,
            "sda1",
            DeviceKind::Partition(PartitionInfo {
                number: 1,
                part_type: PartType::Primary,
                disk,
            }),
        );

        let destroy = tree.register_action(Action::destroy_format(disk));
        assert!(matches!(destroy, Err(BlkError::DeviceTree(_))));

        let destroy_dev = tree.register_action(Action::destroy_device(disk));
        assert!(matches!(destroy_dev, Err(BlkError::Device(_))));

        let resize = tree.register_action(Action::resize_device(disk, 2 << 30));
        assert!(resize.is_ok());
    }

    #[test]
    fn test_duplicate_action_rejected() {
        let mut tree = testing_tree();
        let disk = add_disk(&mut tree, "sda");

        tree.register_action(Action::resize_device(disk, 2 << 30))
            .expect("first register failed");

        let result = tree.register_action(Action::resize_device(disk, 3 << 30));

        assert!(matches!(result, Err(BlkError::DeviceTree(_))));
    }

    #[test]
    fn test_create_then_destroy_cancels_out() {
        let mut tree = testing_tree();
        let disk = add_disk(&mut tree, "sda");

        let part = planned_partition(&mut tree, disk, "sda1", 1);
        let part_id = part.id;

        tree.register_action(Action::create_device(part))
            .expect("create register failed");
        tree.register_action(Action::destroy_device(part_id))
            .expect("destroy register failed");

        tree.prune_actions();

        assert!(tree.actions().is_empty());
        assert!(tree.get_device(part_id).is_none());
    }

    #[test]
    fn test_destroy_device_obsoletes_format_actions() {
        let mut tree = testing_tree();
        let disk = add_disk(&mut tree, "sdb");

        let format = Format::from_type("ext4", FormatArgs::default())
            .expect("format rejected");

        tree.register_action(Action::create_format(disk, format))
            .expect("format register failed");
        tree.register_action(Action::destroy_device(disk))
            .expect("destroy register failed");

        tree.prune_actions();

        let remaining = tree.actions();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].verb(), "destroy");
        assert_eq!(remaining[0].object(), "device");
    }

    #[test]
    fn test_prune_is_idempotent() {
        let mut tree = testing_tree();
        let disk_a = add_disk(&mut tree, "sda");
        let disk_b = add_disk(&mut tree, "sdb");

        let format = Format::from_type("xfs", FormatArgs::default())
            .expect("format rejected");

        tree.register_action(Action::create_format(disk_a, format))
            .expect("register failed");
        tree.register_action(Action::destroy_device(disk_b))
            .expect("register failed");

        tree.prune_actions();
        let after_first: Vec<ActionId> =
            tree.actions().iter().map(|a| a.id).collect();

        tree.prune_actions();
        let after_second: Vec<ActionId> =
            tree.actions().iter().map(|a| a.id).collect();

        assert_eq!(after_first, after_second);
    }

    #[test]
    fn test_find_actions_filters() {
        let mut tree = testing_tree();
        let disk_a = add_disk(&mut tree, "sda");
        let disk_b = add_disk(&mut tree, "sdb");

        let part = planned_partition(&mut tree, disk_a, "sda1", 1);

        tree.register_action(Action::create_device(part))
            .expect("register failed");
        tree.register_action(Action::destroy_device(disk_b))
            .expect("register failed");

        let destroys = tree.find_actions(ActionFilter {
            verb: Some("destroy"),
            object: Some("device"),
            ..Default::default()
        });

        assert_eq!(destroys.len(), 1);
        assert_eq!(destroys[0].device, disk_b);

        let all = tree.find_actions(ActionFilter::default());
        assert_eq!(all.len(), 2);

        let by_path = tree.find_actions(ActionFilter {
            path: Some("/dev/sdb"),
            ..Default::default()
        });
        assert_eq!(by_path.len(), 1);
    }

    #[test]
    fn test_sort_destroy_before_create_before_resize() {
        let mut tree = testing_tree();
        let disk_a = add_disk(&mut tree, "sda");
        let disk_b = add_disk(&mut tree, "sdb");
        let disk_c = add_disk(&mut tree, "sdc");

        let part = planned_partition(&mut tree, disk_a, "sda1", 1);

        // Registered out of phase order on purpose.
        tree.register_action(Action::resize_device(disk_c, 2 << 30))
            .expect("register failed");
        tree.register_action(Action::create_device(part))
            .expect("register failed");
        tree.register_action(Action::destroy_device(disk_b))
            .expect("register failed");

        tree.sort_actions().expect("sort failed");

        let verbs: Vec<&str> = tree.actions().iter().map(|a| a.verb()).collect();

        assert_eq!(verbs, vec!["destroy", "create", "resize"]);
    }

    #[test]
    fn test_sort_parent_create_before_child_create() {
        let mut tree = testing_tree();
        let disk = add_disk(&mut tree, "sda");

        let part = planned_partition(&mut tree, disk, "sda1", 1);
        let part_id = part.id;

        tree.register_action(Action::create_device(part))
            .expect("register failed");

        let luks_id = tree.alloc_device_id();
        let mut luks = Device::new(luks_id, "luks-99", DeviceKind::LuksMapping);
        luks.parents = vec![part_id];

        tree.register_action(Action::create_device(luks))
            .expect("register failed");

        let format = Format::from_type("ext4", FormatArgs::default())
            .expect("format rejected");
        tree.register_action(Action::create_format(luks_id, format))
            .expect("register failed");

        // Scramble the queue so registration order alone is wrong.
        tree.actions.reverse();

        tree.sort_actions().expect("sort failed");

        let order: Vec<(&str, &str, DeviceId)> = tree
            .actions()
            .iter()
            .map(|a| (a.verb(), a.object(), a.device))
            .collect();

        assert_eq!(
            order,
            vec![
                ("create", "device", part_id),
                ("create", "device", luks_id),
                ("create", "format", luks_id),
            ],
        );
    }

    #[test]
    fn test_sort_destroy_format_before_destroy_device() {
        let mut tree = testing_tree();
        let disk = add_disk(&mut tree, "sda");

        {
            let device = tree.get_device_mut(disk).expect("no disk");
            device.format = Format::from_type(
                "ext4",
                FormatArgs {
                    exists: true,
                    device: Some("/dev/sda".to_string()),
                    ..Default::default()
                },
            )
            .expect("format rejected");
        }

        // Destroy the device first, then its format, so registration
        // order alone would execute them wrongly.
        tree.register_action(Action::destroy_format(disk))
            .expect("register failed");
        tree.register_action(Action::destroy_device(disk))
            .expect("register failed");

        tree.sort_actions().expect("sort failed");

        let order: Vec<&str> = tree.actions().iter().map(|a| a.object()).collect();

        assert_eq!(order, vec!["format", "device"]);
    }

    #[test]
    fn test_resize_grow_orders_device_before_format() {
        let mut tree = testing_tree();
        let disk = add_disk(&mut tree, "sda");

        {
            let device = tree.get_device_mut(disk).expect("no disk");
            device.size = 1 << 30;
        }

        tree.register_action(Action::resize_format(disk, 2 << 30))
            .expect("register failed");
        tree.register_action(Action::resize_device(disk, 2 << 30))
            .expect("register failed");

        tree.sort_actions().expect("sort failed");

        let order: Vec<&str> = tree.actions().iter().map(|a| a.object()).collect();

        assert_eq!(order, vec!["device", "format"]);
    }

    #[test]
    fn test_resize_shrink_orders_format_before_device() {
        let mut tree = testing_tree();
        let disk = add_disk(&mut tree, "sda");

        {
            let device = tree.get_device_mut(disk).expect("no disk");
            device.size = 4 << 30;
        }

        tree.register_action(Action::resize_device(disk, 1 << 30))
            .expect("register failed");
        tree.register_action(Action::resize_format(disk, 1 << 30))
            .expect("register failed");

        tree.sort_actions().expect("sort failed");

        let order: Vec<&str> = tree.actions().iter().map(|a| a.object()).collect();

        assert_eq!(order, vec!["format", "device"]);
    }

    #[test]
    fn test_process_actions_offline_commit() {
        let mut tree = testing_tree();
        let disk = add_disk(&mut tree, "sda");

        let part = planned_partition(&mut tree, disk, "sda1", 1);
        let part_id = part.id;

        tree.register_action(Action::create_device(part))
            .expect("register failed");

        let format = Format::from_type("ext4", FormatArgs::default())
            .expect("format rejected");
        tree.register_action(Action::create_format(part_id, format))
            .expect("register failed");

        tree.process_actions(false).expect("process failed");

        assert!(tree.actions().is_empty());
        assert_eq!(tree.completed_actions().len(), 2);

        let part = tree.get_device(part_id).expect("partition lost");
        assert!(part.exists);
        assert!(part.format.exists);
        assert_eq!(part.format.type_name(), Some("ext4"));
    }

    #[test]
    fn test_synthesized_extended_partition() {
        let mut tree = testing_tree();
        let disk = add_disk(&mut tree, "sda");

        let id = tree.alloc_device_id();
        let mut logical = Device::new(
            id,
            "sda5",
            DeviceKind::Partition(PartitionInfo {
                number: 5,
                part_type: PartType::Logical,
                disk,
            }),
        );
        logical.parents = vec![disk];
        logical.size = 1 << 30;

        tree.register_action(Action::create_device(logical))
            .expect("register failed");

        tree.process_actions(false).expect("process failed");

        let extended = tree.devices().find(|d| match &d.kind {
            DeviceKind::Partition(info) => info.part_type == PartType::Extended,
            _ => false,
        });

        assert!(extended.is_some(), "no extended partition synthesized");
    }
}
