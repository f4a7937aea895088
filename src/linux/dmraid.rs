use crate::errors::BlkError;
use crate::utils::shell;

/// Executes:
/// ```shell
/// dmraid -r -c -c {device}
/// ```
/// and returns the raid-set name the member belongs to, `None` if the
/// tool does not recognize the device.
pub fn set_for_member(device: &str) -> Result<Option<String>, BlkError> {
    let output = match shell::exec_capture("dmraid", &["-r", "-c", "-c", device]) {
        Ok(output) => output,
        // dmraid exits non-zero for non-members.
        Err(BlkError::CmdFailed { .. }) => return Ok(None),
        Err(err) => return Err(err),
    };

    Ok(parse_member_line(&output))
}

pub fn parse_member_line(output: &str) -> Option<String> {
    // Format: {device}:{set_name}:{format}:...
    let line = output.lines().next()?;
    let set_name = line.split(':').nth(1)?;

    if set_name.is_empty() {
        return None;
    }

    Some(set_name.to_string())
}

/// Executes:
/// ```shell
/// dmraid -ay {set_name}
/// ```
pub fn activate(set_name: &str) -> Result<(), BlkError> {
    shell::exec("dmraid", &["-ay", set_name])
}

/// Executes:
/// ```shell
/// dmraid -an {set_name}
/// ```
pub fn deactivate(set_name: &str) -> Result<(), BlkError> {
    shell::exec("dmraid", &["-an", set_name])
}
