use crate::errors::BlkError;
use crate::utils::shell;

/// Executes:
/// ```shell
/// multipath -c {device}
/// ```
/// Exit status is the membership answer.
pub fn is_member(device: &str) -> bool {
    shell::exec("multipath", &["-c", device]).is_ok()
}

/// Executes:
/// ```shell
/// multipath -f {name}
/// ```
pub fn flush(name: &str) -> Result<(), BlkError> {
    shell::exec("multipath", &["-f", name])
}
