use std::collections::HashMap;
use std::fs;

use crate::errors::BlkError;
use crate::utils::shell;

/// Executes:
/// ```shell
/// udevadm settle
/// ```
/// Blocks until the kernel's device-event queue drains.
pub fn settle() -> Result<(), BlkError> {
    shell::exec("udevadm", &["settle"])
}

/// Executes:
/// ```shell
/// udevadm info --query=property --name={name}
/// ```
pub fn props(name: &str) -> Result<HashMap<String, String>, BlkError> {
    let output = shell::exec_capture(
        "udevadm",
        &["info", "--query=property", &format!("--name={name}")],
    )?;

    Ok(parse_props(&output))
}

pub fn parse_props(output: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();

    for line in output.lines() {
        if let Some((key, val)) = line.split_once('=') {
            props.insert(key.trim().to_string(), val.to_string());
        }
    }

    props
}

/// Names under `/sys/class/block/{name}/slaves`, empty for devices with
/// no slave links.
pub fn slaves(name: &str) -> Vec<String> {
    let dir = format!("/sys/class/block/{name}/slaves");

    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect()
}
