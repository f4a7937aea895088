use crate::errors::BlkError;
use crate::utils::shell;

// libcryptsetup bindings: https://github.com/stratis-storage/libcryptsetup-rs/

pub fn format(device: &str, key: Option<&str>) -> Result<(), BlkError> {
    let mut format_cmd = format!("cryptsetup luksFormat {device}");

    if let Some(passphrase) = key {
        check_passphrase(passphrase)?;

        format_cmd = format!("echo '{passphrase}' | {format_cmd}");
    }

    shell::sh_c(&format_cmd)
}

/// Attempts to unlock `device` as `name`. A non-zero exit simply means
/// the passphrase did not match; callers iterate their passphrase list.
pub fn open(device: &str, key: Option<&str>, name: &str) -> Result<(), BlkError> {
    let mut open_cmd = format!("cryptsetup luksOpen {device} {name}");

    if let Some(passphrase) = key {
        check_passphrase(passphrase)?;

        open_cmd = format!("echo '{passphrase}' | {open_cmd}")
    }

    shell::sh_c(&open_cmd)
}

pub fn close(name: &str) -> Result<(), BlkError> {
    let close_cmd = format!("cryptsetup luksClose {name}");

    shell::sh_c(&close_cmd)
}

fn check_passphrase(pass: &str) -> Result<(), BlkError> {
    match pass {
        "" => Err(BlkError::BadConfig("empty luks passphrase".to_string())),
        _ => Ok(()),
    }
}
