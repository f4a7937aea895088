use serde::Deserialize;

use crate::entity::format::DiskLabelType;
use crate::errors::BlkError;
use crate::utils::shell;

/// Executes:
/// ```shell
/// echo 'label: {gpt|dos}' | sfdisk {device}
/// ```
pub fn create_table(device: &str, table: DiskLabelType) -> Result<(), BlkError> {
    let label = match table {
        DiskLabelType::Gpt => "gpt",
        DiskLabelType::Msdos => "dos",
    };

    shell::sh_c(&format!("echo 'label: {label}' | sfdisk {device}"))
}

/// Executes:
/// ```shell
/// echo ',{size_sectors},{type}' | sfdisk --append {device}
/// ```
///
/// Size is in bytes and rounded down to 512-byte sectors by sfdisk
/// conventions here.
pub fn append_partition(
    device: &str,
    size_bytes: u64,
    type_code: Option<&str>,
) -> Result<(), BlkError> {
    let sectors = size_bytes / 512;
    let type_code = type_code.unwrap_or("L");

    shell::sh_c(&format!(
        "echo ',{sectors},{type_code}' | sfdisk --append {device}"
    ))
}

/// Executes:
/// ```shell
/// sfdisk --delete {device} {number}
/// ```
pub fn delete_partition(device: &str, number: u32) -> Result<(), BlkError> {
    shell::exec("sfdisk", &["--delete", device, &number.to_string()])
}

/// Executes:
/// ```shell
/// echo ',{size_sectors}' | sfdisk -N {number} {device}
/// ```
pub fn resize_partition(
    device: &str,
    number: u32,
    size_bytes: u64,
) -> Result<(), BlkError> {
    let sectors = size_bytes / 512;

    shell::sh_c(&format!(
        "echo ',{sectors}' | sfdisk -N {number} {device}"
    ))
}

/// Executes:
/// ```shell
/// wipefs -a {device}
/// ```
pub fn wipe(device: &str) -> Result<(), BlkError> {
    shell::exec("wipefs", &["-a", device])
}

#[derive(Debug, Deserialize)]
struct SfdiskPartition {
    node: String,

    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct SfdiskTable {
    #[serde(default)]
    partitions: Vec<SfdiskPartition>,
}

#[derive(Debug, Deserialize)]
struct SfdiskOutput {
    partitiontable: SfdiskTable,
}

/// On-disk partition nodes in table order, freshly read with
/// `sfdisk --json {device}`. Used to re-synchronize in-memory partition
/// numbering after each executed action.
pub fn read_table(device: &str) -> Result<Vec<(String, u64)>, BlkError> {
    let output = shell::exec_capture("sfdisk", &["--json", device])?;

    parse_table(&output)
}

pub fn parse_table(output_json: &str) -> Result<Vec<(String, u64)>, BlkError> {
    let parsed: SfdiskOutput = serde_json::from_str(output_json)
        .map_err(|err| BlkError::InvalidDiskLabel(format!("bad sfdisk json: {err}")))?;

    Ok(parsed
        .partitiontable
        .partitions
        .into_iter()
        .map(|p| (p.node, p.size))
        .collect())
}
