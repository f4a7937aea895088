use serde::{
    Deserialize,
    Serialize,
};

use super::device::{
    Device,
    DeviceId,
};
use super::format::Format;

pub type ActionId = u64;

/// A queued, not-yet-executed intent to create/destroy/resize a device
/// or its format. Registration applies the action's immediate structural
/// effect to the in-memory tree; execution applies it to real storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Monotonic queue identity, assigned at registration. Doubles as
    /// the tie-break for the topological sort.
    pub id: ActionId,

    pub device: DeviceId,

    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionKind {
    /// `staged` holds the planned device until registration moves it
    /// into the tree.
    CreateDevice { staged: Option<Box<Device>> },

    /// `removed` holds the device registration takes out of the tree,
    /// so cancellation can put it back and execution can destroy it.
    DestroyDevice { removed: Option<Box<Device>> },

    /// `prev` is the format displaced at registration, restored on
    /// cancellation.
    CreateFormat { format: Format, prev: Option<Format> },

    /// `orig` is the format blanked out at registration.
    DestroyFormat { orig: Option<Format> },

    ResizeDevice { new_size: u64, orig_size: Option<u64> },

    ResizeFormat { new_size: u64, orig_size: Option<u64> },
}

/// Outcome of the pairwise obsolescence check: remove just the earlier
/// action, or both (the pair cancels out entirely).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Obsoletes {
    No,
    Other,
    Both,
}

impl Action {
    pub fn create_device(device: Device) -> Self {
        Action {
            id: 0,
            device: device.id,
            kind: ActionKind::CreateDevice {
                staged: Some(Box::new(device)),
            },
        }
    }

    pub fn destroy_device(device: DeviceId) -> Self {
        Action {
            id: 0,
            device,
            kind: ActionKind::DestroyDevice { removed: None },
        }
    }

    pub fn create_format(device: DeviceId, format: Format) -> Self {
        Action {
            id: 0,
            device,
            kind: ActionKind::CreateFormat {
                format,
                prev: None,
            },
        }
    }

    pub fn destroy_format(device: DeviceId) -> Self {
        Action {
            id: 0,
            device,
            kind: ActionKind::DestroyFormat { orig: None },
        }
    }

    pub fn resize_device(device: DeviceId, new_size: u64) -> Self {
        Action {
            id: 0,
            device,
            kind: ActionKind::ResizeDevice {
                new_size,
                orig_size: None,
            },
        }
    }

    pub fn resize_format(device: DeviceId, new_size: u64) -> Self {
        Action {
            id: 0,
            device,
            kind: ActionKind::ResizeFormat {
                new_size,
                orig_size: None,
            },
        }
    }

    /// Coarse phase ordering: destroys run before creates, creates
    /// before resizes. Fine-grained prerequisites only ever order
    /// actions within one phase.
    pub fn ordinal(&self) -> u8 {
        match self.kind {
            ActionKind::DestroyDevice { .. } | ActionKind::DestroyFormat { .. } => 3,
            ActionKind::CreateDevice { .. } | ActionKind::CreateFormat { .. } => 2,
            ActionKind::ResizeDevice { .. } | ActionKind::ResizeFormat { .. } => 1,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self.kind {
            ActionKind::CreateDevice { .. } | ActionKind::CreateFormat { .. } => {
                "create"
            }
            ActionKind::DestroyDevice { .. } | ActionKind::DestroyFormat { .. } => {
                "destroy"
            }
            ActionKind::ResizeDevice { .. } | ActionKind::ResizeFormat { .. } => {
                "resize"
            }
        }
    }

    pub fn object(&self) -> &'static str {
        match self.kind {
            ActionKind::CreateDevice { .. }
            | ActionKind::DestroyDevice { .. }
            | ActionKind::ResizeDevice { .. } => "device",
            ActionKind::CreateFormat { .. }
            | ActionKind::DestroyFormat { .. }
            | ActionKind::ResizeFormat { .. } => "format",
        }
    }

    pub fn is_device_action(&self) -> bool {
        self.object() == "device"
    }

    /// Whether `self`, registered later, renders the earlier `other`
    /// unnecessary or contradictory. Callers guarantee
    /// `self.id > other.id`.
    pub fn obsoletes(&self, other: &Action) -> Obsoletes {
        if self.device != other.device {
            return Obsoletes::No;
        }

        match (&self.kind, &other.kind) {
            // Destroying a never-committed device cancels its creation
            // and the destruction itself.
            (ActionKind::DestroyDevice { .. }, ActionKind::CreateDevice { .. }) => {
                Obsoletes::Both
            }

            // A device destruction swallows every other pending action
            // on that device.
            (ActionKind::DestroyDevice { .. }, _) => Obsoletes::Other,

            // Destroying a format cancels the pending creation of one;
            // the pair cancels out.
            (
                ActionKind::DestroyFormat { .. },
                ActionKind::CreateFormat { .. },
            ) => Obsoletes::Both,

            (
                ActionKind::DestroyFormat { .. },
                ActionKind::ResizeFormat { .. },
            ) => Obsoletes::Other,

            // Only the latest planned format matters.
            (
                ActionKind::CreateFormat { .. },
                ActionKind::CreateFormat { .. },
            ) => Obsoletes::Other,

            // Later resize of the same object supersedes the earlier.
            (
                ActionKind::ResizeDevice { .. },
                ActionKind::ResizeDevice { .. },
            ) => Obsoletes::Other,
            (
                ActionKind::ResizeFormat { .. },
                ActionKind::ResizeFormat { .. },
            ) => Obsoletes::Other,

            _ => Obsoletes::No,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::device::DeviceKind;

    fn dummy_device(id: DeviceId) -> Device {
        Device::new(id, "sdx1", DeviceKind::NoDevice)
    }

    #[test]
    fn test_phase_ordering() {
        let destroy = Action::destroy_device(1);
        let create = Action::create_device(dummy_device(2));
        let resize = Action::resize_device(3, 1 << 30);

        assert!(destroy.ordinal() > create.ordinal());
        assert!(create.ordinal() > resize.ordinal());
    }

    #[test]
    fn test_verb_and_object() {
        let action = Action::destroy_format(7);

        assert_eq!(action.verb(), "destroy");
        assert_eq!(action.object(), "format");
        assert!(!action.is_device_action());
    }

    #[test]
    fn test_obsoletes() {
        struct Test {
            later: Action,
            earlier: Action,
            expected: Obsoletes,
        }

        let tests = vec![
            Test {
                later: Action::destroy_device(1),
                earlier: Action::create_device(dummy_device(1)),
                expected: Obsoletes::Both,
            },
            Test {
                later: Action::destroy_device(1),
                earlier: Action::create_format(1, Format::none()),
                expected: Obsoletes::Other,
            },
            Test {
                later: Action::destroy_format(1),
                earlier: Action::create_format(1, Format::none()),
                expected: Obsoletes::Both,
            },
            Test {
                later: Action::resize_device(1, 2 << 30),
                earlier: Action::resize_device(1, 1 << 30),
                expected: Obsoletes::Other,
            },
            // Different devices never interact.
            Test {
                later: Action::destroy_device(2),
                earlier: Action::create_format(1, Format::none()),
                expected: Obsoletes::No,
            },
            // A format action does not obsolete a device action.
            Test {
                later: Action::destroy_format(1),
                earlier: Action::create_device(dummy_device(1)),
                expected: Obsoletes::No,
            },
        ];

        for test in tests {
            assert_eq!(
                test.later.obsoletes(&test.earlier),
                test.expected,
                "{} {} vs {} {}",
                test.later.verb(),
                test.later.object(),
                test.earlier.verb(),
                test.earlier.object(),
            );
        }
    }
}
