use std::env;
use std::fs;
use std::process::Command;

use crate::errors::BlkError;

pub fn exec(cmd: &str, args: &[&str]) -> Result<(), BlkError> {
    match Command::new(cmd).args(args).spawn() {
        Ok(mut result) => match result.wait() {
            // Spawned but may still fail
            Ok(r) => match r.code() {
                Some(code) => {
                    if code != 0 {
                        return Err(BlkError::CmdFailed {
                            error: None,
                            context: format!(
                                "command {cmd} exited with non-zero status {code}"
                            ),
                        });
                    }

                    Ok(())
                }
                None => Err(BlkError::CmdFailed {
                    error: None,
                    context: format!("command {cmd} terminated by signal"),
                }),
            },
            Err(err) => Err(BlkError::CmdFailed {
                error: Some(err),
                context: format!("command {cmd} failed to run"),
            }),
        },

        // Failed to spawn
        Err(err) => Err(BlkError::CmdFailed {
            error: Some(err),
            context: format!("command {cmd} failed to spawn"),
        }),
    }
}

/// Like [`exec`], but collects stdout. Stderr is inherited so tool
/// diagnostics still reach the terminal.
pub fn exec_capture(cmd: &str, args: &[&str]) -> Result<String, BlkError> {
    let output =
        Command::new(cmd)
            .args(args)
            .output()
            .map_err(|err| BlkError::CmdFailed {
                error: Some(err),
                context: format!("command {cmd} failed to spawn"),
            })?;

    if !output.status.success() {
        return Err(BlkError::CmdFailed {
            error: None,
            context: format!(
                "command {cmd} exited with status {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none (signal)".to_string()),
            ),
        });
    }

    String::from_utf8(output.stdout).map_err(|err| {
        BlkError::Bug(format!("command {cmd} output not utf-8: {err}"))
    })
}

/// Surrounds `cmd_str` with single quotes to execute:
/// ```shell
/// sh -c '{cmd_str}'
/// ```
///
/// cmd_str MUST NOT be surrounded beforehand
pub fn sh_c(cmd_str: &str) -> Result<(), BlkError> {
    exec("sh", &["-c", &format!("'{cmd_str}'")])
}

pub fn in_path(program: &str) -> bool {
    if let Ok(path) = env::var("PATH") {
        for p in path.split(':') {
            let p_str = format!("{}/{}", p, program);
            if fs::metadata(p_str).is_ok() {
                return true;
            }
        }
    }

    false
}
