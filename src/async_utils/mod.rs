//! Asynchronous utilities for use with Tokio, and for running external tools.

use crate::prelude::*;

pub mod io;

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. Standard error may optionally be checked line by line
/// with `is_error_line`, to catch tools which exit successfully after printing
/// errors.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    is_error_line: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );

    if output.status.success() {
        if !stderr.trim().is_empty() {
            debug!(
                command_name = command_name,
                output = %stderr,
                "Standard error from command",
            );
        }
        if let Some(is_error_line) = is_error_line
            && stderr.lines().any(is_error_line)
        {
            return Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr,
            ));
        }
        Ok(())
    } else {
        error!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
        if let Some(exit_code) = output.status.code() {
            Err(anyhow!(
                "{} failed with exit code {} and error output:\n{}",
                command_name,
                exit_code,
                stderr,
            ))
        } else {
            Err(anyhow!(
                "{} failed with error output:\n{}",
                command_name,
                stderr,
            ))
        }
    }
}
