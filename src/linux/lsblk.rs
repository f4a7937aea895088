use serde::Deserialize;

use crate::entity::record::{
    keys,
    DeviceRecord,
};
use crate::errors::BlkError;
use crate::utils::shell;

use super::udev;

/// One entry of `lsblk --json` output; children are flattened into the
/// record list.
#[derive(Debug, Deserialize)]
struct LsblkEntry {
    name: String,

    #[serde(rename = "maj:min")]
    maj_min: Option<String>,

    #[serde(default)]
    size: Option<u64>,

    #[serde(default)]
    ro: bool,

    #[serde(default)]
    rm: bool,

    #[serde(rename = "type")]
    dev_type: Option<String>,

    serial: Option<String>,

    tran: Option<String>,

    #[serde(default)]
    children: Vec<LsblkEntry>,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkEntry>,
}

/// Executes:
/// ```shell
/// lsblk --json --bytes -o NAME,MAJ:MIN,SIZE,RO,RM,TYPE,SERIAL,TRAN
/// ```
/// and merges each device's udev properties into its record.
pub fn scan() -> Result<Vec<DeviceRecord>, BlkError> {
    let output = shell::exec_capture(
        "lsblk",
        &[
            "--json",
            "--bytes",
            "-o",
            "NAME,MAJ:MIN,SIZE,RO,RM,TYPE,SERIAL,TRAN",
        ],
    )?;

    let mut records = parse_lsblk(&output)?;

    for record in records.iter_mut() {
        let props = udev::props(&record.name)?;
        record.props.extend(props);
        record.slaves = udev::slaves(&record.name);

        if record.sysfs_path.is_none() {
            record.sysfs_path = Some(format!("/sys/class/block/{}", record.name));
        }
    }

    Ok(records)
}

pub fn parse_lsblk(output_json: &str) -> Result<Vec<DeviceRecord>, BlkError> {
    let parsed: LsblkOutput = serde_json::from_str(output_json)
        .map_err(|err| BlkError::Bug(format!("bad lsblk json: {err}")))?;

    let mut records = Vec::new();
    for entry in parsed.blockdevices {
        flatten(entry, &mut records);
    }

    Ok(records)
}

fn flatten(entry: LsblkEntry, out: &mut Vec<DeviceRecord>) {
    let mut record = DeviceRecord::new(&entry.name);

    record.major_minor = entry.maj_min.as_deref().and_then(parse_maj_min);
    record.size = entry.size.unwrap_or(0);
    record.read_only = entry.ro;
    record.removable = entry.rm;
    record.serial = entry.serial.clone();
    record.bus = entry.tran.clone();

    // lsblk "type" maps onto the udev DEVTYPE the predicates read.
    if let Some(dev_type) = entry.dev_type.as_deref() {
        let devtype = match dev_type {
            "part" => "partition",
            _ => "disk",
        };

        record
            .props
            .insert(keys::DEVTYPE.to_string(), devtype.to_string());
    }

    out.push(record);

    for child in entry.children {
        flatten(child, out);
    }
}

fn parse_maj_min(s: &str) -> Option<(u32, u32)> {
    let (major, minor) = s.trim().split_once(':')?;

    Some((major.parse().ok()?, minor.parse().ok()?))
}
