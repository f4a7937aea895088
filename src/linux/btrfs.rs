use crate::errors::BlkError;
use crate::utils::shell;

/// One subvolume as reported by the btrfs tool: volume-internal id,
/// parent subvolume id, and path relative to the volume root.
#[derive(Debug, Clone, PartialEq)]
pub struct Subvol {
    pub id: u64,
    pub parent_id: u64,
    pub path: String,
}

/// Executes:
/// ```shell
/// btrfs subvolume list -p {mountpoint}
/// ```
pub fn subvolumes(mountpoint: &str) -> Result<Vec<Subvol>, BlkError> {
    let output =
        shell::exec_capture("btrfs", &["subvolume", "list", "-p", mountpoint])?;

    Ok(parse_subvol_list(&output))
}

/// Parses lines of the form:
/// ```text
/// ID 258 gen 12 parent 5 top level 5 path home
/// ```
pub fn parse_subvol_list(output: &str) -> Vec<Subvol> {
    let mut subvols = Vec::new();

    for line in output.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();

        let id = field_after(&cols, "ID");
        let parent_id = field_after(&cols, "parent");
        let path = cols
            .iter()
            .position(|c| *c == "path")
            .and_then(|i| cols.get(i + 1));

        if let (Some(id), Some(parent_id), Some(path)) = (id, parent_id, path) {
            subvols.push(Subvol {
                id,
                parent_id,
                path: path.to_string(),
            });
        }
    }

    subvols
}

fn field_after(cols: &[&str], key: &str) -> Option<u64> {
    let i = cols.iter().position(|c| *c == key)?;

    cols.get(i + 1)?.parse().ok()
}

/// Executes:
/// ```shell
/// btrfs subvolume create {path}
/// ```
pub fn create_subvolume(path: &str) -> Result<(), BlkError> {
    shell::exec("btrfs", &["subvolume", "create", path])
}

/// Executes:
/// ```shell
/// btrfs subvolume delete {path}
/// ```
pub fn delete_subvolume(path: &str) -> Result<(), BlkError> {
    shell::exec("btrfs", &["subvolume", "delete", path])
}
