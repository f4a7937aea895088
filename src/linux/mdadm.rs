use std::collections::HashMap;

use crate::errors::BlkError;
use crate::utils::shell;

/// Executes:
/// ```shell
/// mdadm --examine --export {device}
/// ```
/// Output is KEY=VAL per line, udev-compatible (MD_UUID, MD_LEVEL, ...).
pub fn examine(device: &str) -> Result<HashMap<String, String>, BlkError> {
    let output = shell::exec_capture("mdadm", &["--examine", "--export", device])?;

    Ok(parse_export(&output))
}

pub fn parse_export(output: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();

    for line in output.lines() {
        if let Some((key, val)) = line.split_once('=') {
            props.insert(key.trim().to_string(), val.trim().to_string());
        }
    }

    props
}

/// Executes:
/// ```shell
/// mdadm --assemble /dev/md/{name} --uuid={uuid} --run
/// ```
pub fn assemble(name: &str, uuid: &str) -> Result<(), BlkError> {
    shell::exec(
        "mdadm",
        &[
            "--assemble",
            &format!("/dev/md/{name}"),
            &format!("--uuid={uuid}"),
            "--run",
        ],
    )
}

/// Executes:
/// ```shell
/// mdadm --stop {device}
/// ```
pub fn stop(device: &str) -> Result<(), BlkError> {
    shell::exec("mdadm", &["--stop", device])
}

/// Executes:
/// ```shell
/// mdadm --zero-superblock {device}
/// ```
pub fn zero_superblock(device: &str) -> Result<(), BlkError> {
    shell::exec("mdadm", &["--zero-superblock", device])
}
