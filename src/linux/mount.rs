use std::collections::HashSet;
use std::fs;

/// Device names that back the running system, gathered once at the start
/// of a population pass: mounted block devices, active swaps, and the
/// root= device from the kernel command line. These are marked protected
/// and excluded from any automatic teardown.
pub fn live_device_names() -> HashSet<String> {
    let mut names = HashSet::new();

    if let Ok(mounts) = fs::read_to_string("/proc/mounts") {
        names.extend(mounted_device_names(&mounts));
    }

    if let Ok(swaps) = fs::read_to_string("/proc/swaps") {
        names.extend(swap_device_names(&swaps));
    }

    if let Ok(cmdline) = fs::read_to_string("/proc/cmdline") {
        names.extend(cmdline_root_device(&cmdline));
    }

    names
}

pub fn mounted_device_names(proc_mounts: &str) -> HashSet<String> {
    proc_mounts
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(strip_dev)
        .collect()
}

pub fn swap_device_names(proc_swaps: &str) -> HashSet<String> {
    proc_swaps
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(strip_dev)
        .collect()
}

pub fn cmdline_root_device(cmdline: &str) -> Option<String> {
    cmdline
        .split_whitespace()
        .find_map(|tok| tok.strip_prefix("root="))
        .and_then(|root| strip_dev(root))
}

fn strip_dev(path: &str) -> Option<String> {
    path.strip_prefix("/dev/").map(|name| {
        // Mapper nodes resolve to their dm name.
        name.strip_prefix("mapper/").unwrap_or(name).to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mounted_device_names() {
        let mounts = concat!(
            "/dev/sda2 / ext4 rw,relatime 0 0\n",
            "proc /proc proc rw 0 0\n",
            "/dev/mapper/vg00-home /home ext4 rw 0 0\n",
            "tmpfs /tmp tmpfs rw 0 0\n",
        );

        let names = mounted_device_names(mounts);

        assert_eq!(
            names,
            HashSet::from(["sda2".to_string(), "vg00-home".to_string()]),
        );
    }

    #[test]
    fn test_swap_device_names() {
        let swaps = concat!(
            "Filename\t\t\tType\t\tSize\tUsed\tPriority\n",
            "/dev/sda3    partition\t8388604\t0\t-2\n",
        );

        assert_eq!(swap_device_names(swaps), HashSet::from(["sda3".to_string()]));
    }

    #[test]
    fn test_cmdline_root_device() {
        let cmdline = "BOOT_IMAGE=/vmlinuz root=/dev/mapper/vg00-root rw quiet\n";

        assert_eq!(cmdline_root_device(cmdline), Some("vg00-root".to_string()));
        assert_eq!(cmdline_root_device("root=UUID=abcd rw"), None);
    }
}
