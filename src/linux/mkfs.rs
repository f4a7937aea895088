use crate::errors::BlkError;
use crate::utils::shell;

/// Executes:
/// ```shell
/// mkfs.{fs_type} [-L {label}] {device}
/// ```
pub fn create_fs(
    device: &str,
    fs_type: &str,
    label: Option<&str>,
) -> Result<(), BlkError> {
    let cmd_mkfs = match label {
        Some(label) => format!("mkfs.{fs_type} -L {label} {device}"),
        None => format!("mkfs.{fs_type} {device}"),
    };

    shell::sh_c(&cmd_mkfs)
}

/// Executes:
/// ```shell
/// mkswap [-L {label}] {device}
/// ```
pub fn make_swap(device: &str, label: Option<&str>) -> Result<(), BlkError> {
    match label {
        Some(label) => shell::exec("mkswap", &["-L", label, device]),
        None => shell::exec("mkswap", &[device]),
    }
}

/// Grows or shrinks a filesystem to `size_bytes` with the fs-specific
/// tool. Filesystems without a resize tool here are rejected upstream.
pub fn resize_fs(device: &str, fs_type: &str, size_bytes: u64) -> Result<(), BlkError> {
    match fs_type {
        "ext2" | "ext3" | "ext4" => {
            let kib = size_bytes / 1024;

            shell::exec("resize2fs", &[device, &format!("{kib}K")])
        }
        "btrfs" => shell::exec(
            "btrfs",
            &["filesystem", "resize", &size_bytes.to_string(), device],
        ),
        "xfs" => {
            // xfs only grows, and only to the containing device's size.
            shell::exec("xfs_growfs", &[device])
        }
        _ => Err(BlkError::Format(format!(
            "no resize tool for filesystem type {fs_type}"
        ))),
    }
}

pub fn swap_on(device: &str) -> Result<(), BlkError> {
    shell::exec("swapon", &[device])
}

pub fn swap_off(device: &str) -> Result<(), BlkError> {
    shell::exec("swapoff", &[device])
}
