use crate::errors::BlkError;
use crate::utils::shell;

/// One row of `pvs` report output for a physical volume.
#[derive(Debug, Clone, PartialEq)]
pub struct PvReport {
    pub pv_name: String,
    pub vg_name: String,
    pub vg_uuid: String,
    pub pv_count: u32,
    pub pe_size: u64,
}

/// One row of `lvs` report output for a logical volume.
#[derive(Debug, Clone, PartialEq)]
pub struct LvReport {
    pub lv_name: String,
    pub lv_uuid: String,
    pub size: u64,
    pub attr: String,
    pub seg_type: String,
    pub origin: Option<String>,
    pub pool: Option<String>,
}

/// Executes:
/// ```shell
/// pvs --noheadings --units b --nosuffix --separator=| \
///     -o pv_name,vg_name,vg_uuid,pv_count,vg_extent_size
/// ```
pub fn pvs_report() -> Result<Vec<PvReport>, BlkError> {
    let output = shell::exec_capture(
        "pvs",
        &[
            "--noheadings",
            "--units",
            "b",
            "--nosuffix",
            "--separator=|",
            "-o",
            "pv_name,vg_name,vg_uuid,pv_count,vg_extent_size",
        ],
    )?;

    Ok(parse_pvs(&output))
}

pub fn parse_pvs(output: &str) -> Vec<PvReport> {
    let mut reports = Vec::new();

    for line in output.lines() {
        let cols: Vec<&str> = line.trim().split('|').collect();

        if cols.len() < 5 {
            continue;
        }

        // A PV outside any VG has empty vg columns; nothing to merge.
        if cols[1].is_empty() {
            continue;
        }

        reports.push(PvReport {
            pv_name: cols[0].to_string(),
            vg_name: cols[1].to_string(),
            vg_uuid: cols[2].to_string(),
            pv_count: cols[3].parse().unwrap_or(0),
            pe_size: cols[4].parse().unwrap_or(0),
        });
    }

    reports
}

/// Executes:
/// ```shell
/// lvs --noheadings --units b --nosuffix --separator=| \
///     -o lv_name,lv_uuid,lv_size,lv_attr,segtype,origin,pool_lv {vg_name}
/// ```
pub fn lvs_report(vg_name: &str) -> Result<Vec<LvReport>, BlkError> {
    let output = shell::exec_capture(
        "lvs",
        &[
            "--noheadings",
            "--units",
            "b",
            "--nosuffix",
            "--separator=|",
            "-o",
            "lv_name,lv_uuid,lv_size,lv_attr,segtype,origin,pool_lv",
            vg_name,
        ],
    )?;

    Ok(parse_lvs(&output))
}

pub fn parse_lvs(output: &str) -> Vec<LvReport> {
    let mut reports = Vec::new();

    for line in output.lines() {
        let cols: Vec<&str> = line.trim().split('|').collect();

        if cols.len() < 7 {
            continue;
        }

        let optional = |s: &str| (!s.is_empty()).then(|| s.to_string());

        reports.push(LvReport {
            lv_name: cols[0].to_string(),
            lv_uuid: cols[1].to_string(),
            size: cols[2].parse().unwrap_or(0),
            attr: cols[3].to_string(),
            seg_type: cols[4].to_string(),
            origin: optional(cols[5]),
            pool: optional(cols[6]),
        });
    }

    reports
}

/// Executes:
/// ```shell
/// pvcreate {pv}
/// ```
pub fn create_pv(pv: &str) -> Result<(), BlkError> {
    shell::exec("pvcreate", &[pv])
}

/// Executes:
/// ```shell
/// vgcreate {vg} {pvs}
/// ```
pub fn create_vg(vg: &str, pvs: &[String]) -> Result<(), BlkError> {
    let mut arg = vec![vg];
    arg.extend(pvs.iter().map(String::as_str));

    shell::exec("vgcreate", &arg)
}

/// Executes:
/// ```shell
/// lvcreate -L {size}b {vg} -n {lv}
/// ```
pub fn create_lv(vg: &str, lv: &str, size_bytes: u64) -> Result<(), BlkError> {
    shell::exec(
        "lvcreate",
        &["-L", &format!("{size_bytes}b"), vg, "-n", lv],
    )
}

/// Executes:
/// ```shell
/// lvresize -f -L {size}b {vg}/{lv}
/// ```
pub fn resize_lv(vg: &str, lv: &str, size_bytes: u64) -> Result<(), BlkError> {
    shell::exec(
        "lvresize",
        &["-f", "-L", &format!("{size_bytes}b"), &format!("{vg}/{lv}")],
    )
}

/// Executes:
/// ```shell
/// lvremove -f {vg}/{lv}
/// ```
pub fn remove_lv(vg: &str, lv: &str) -> Result<(), BlkError> {
    shell::exec("lvremove", &["-f", &format!("{vg}/{lv}")])
}

/// Executes:
/// ```shell
/// vgremove -f {vg}
/// ```
pub fn remove_vg(vg: &str) -> Result<(), BlkError> {
    shell::exec("vgremove", &["-f", vg])
}

/// Executes:
/// ```shell
/// pvremove -f {pv}
/// ```
pub fn remove_pv(pv: &str) -> Result<(), BlkError> {
    shell::exec("pvremove", &["-f", pv])
}

/// Executes:
/// ```shell
/// vgchange -ay {vg}
/// ```
pub fn activate_vg(vg: &str) -> Result<(), BlkError> {
    shell::exec("vgchange", &["-ay", vg])
}

/// Executes:
/// ```shell
/// vgchange -an {vg}
/// ```
pub fn deactivate_vg(vg: &str) -> Result<(), BlkError> {
    shell::exec("vgchange", &["-an", vg])
}
