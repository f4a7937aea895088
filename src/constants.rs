pub const ENV_BLKTREE_CONFIG: &str = "BLKTREE_CONFIG";

// Use programs instead of bindings to avoid API dependencies
pub const REQUIRED_COMMANDS: [&str; 16] = [
    "lsblk",
    "blkid",
    "sfdisk",
    "wipefs",
    "mkswap",
    "pvs",
    "vgs",
    "lvs",
    "pvcreate",
    "vgcreate",
    "lvcreate",
    "cryptsetup",
    "mdadm",
    "btrfs",
    "udevadm",
    "multipath",
];

/// Prefix of device-mapper names given to LUKS mappings unlocked during
/// discovery, followed by the LUKS format UUID.
pub const LUKS_MAP_PREFIX: &str = "luks-";
