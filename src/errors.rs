use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlkError {
    /// Bad arguments to a public tree/device method: removing a non-leaf
    /// without force, adding a device whose parent is missing, operating
    /// on a protected device. Never retried.
    #[error("device error")]
    Device(String),

    /// Tree-consistency violation: duplicate UUID among visible devices,
    /// unresolvable subvolume parent, unresolvable snapshot origin or
    /// thin pool. Discovery of the offending record aborts; the caller
    /// decides whether the scan continues.
    #[error("device tree error")]
    DeviceTree(String),

    /// A format could not be constructed, set up, or torn down.
    #[error("format error")]
    Format(String),

    /// A disklabel could not be read or written.
    #[error("invalid disklabel")]
    InvalidDiskLabel(String),

    /// Destroying a format re-activated an LVM/RAID stack that now blocks
    /// the current action. Caught once per occurrence during commit,
    /// fatal the second time.
    #[error("disklabel commit error")]
    DiskLabelCommit(String),

    #[error("shell command failed")]
    CmdFailed {
        error: Option<std::io::Error>,
        context: String,
    },

    #[error("no such file")]
    NoSuchFile(std::io::Error, String),

    #[error("no such device")]
    NoSuchDevice(String),

    #[error("bad config")]
    BadConfig(String),

    #[error("bad plan")]
    BadPlan(String),

    #[error("bad cli arguments")]
    BadArgs(String),

    #[error("blktree bug")]
    Bug(String),
}

impl BlkError {
    /// True only for the one commit failure that warrants a
    /// teardown-all-and-retry pass.
    pub fn is_disklabel_commit(&self) -> bool {
        matches!(self, Self::DiskLabelCommit(_))
    }
}
