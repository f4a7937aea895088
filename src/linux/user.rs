use nix::unistd::Uid;

use crate::errors::BlkError;

/// Returns whether the current user is privileged
pub fn is_root() -> bool {
    Uid::effective().is_root()
}

pub fn require_root(doing: &str) -> Result<(), BlkError> {
    if is_root() {
        return Ok(());
    }

    Err(BlkError::BadArgs(format!("{doing} requires root")))
}
