//! Command execution utilities

use crate::utils::error::{ImageError, Result};
use std::io::Write;
use std::process::{Command, Output, Stdio};
use tracing::{debug, warn};

fn spawn_error(program: &str, e: std::io::Error) -> ImageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ImageError::CommandNotFound(program.to_string())
    } else {
        ImageError::Io(e)
    }
}

fn check_status(program: &str, args: &[&str], output: Output) -> Result<Output> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        warn!(
            "Command failed: {} {}\n  stderr: {}",
            program,
            args.join(" "),
            stderr.trim()
        );
        return Err(ImageError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            stderr,
        });
    }
    Ok(output)
}

/// Execute a command and return the output
pub fn run_command(program: &str, args: &[&str]) -> Result<Output> {
    debug!("Running: {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| spawn_error(program, e))?;

    check_status(program, args, output)
}

/// Execute a command, feeding `input` on its stdin
pub fn run_command_with_input(program: &str, args: &[&str], input: &str) -> Result<Output> {
    debug!("Running: {} {} (with {} bytes on stdin)", program, args.join(" "), input.len());

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error(program, e))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes())?;
    }

    let output = child.wait_with_output()?;
    check_status(program, args, output)
}

/// Check if a command exists in PATH
pub fn command_exists(program: &str) -> bool {
    Command::new("which")
        .arg(program)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Log a command that would be run (for dry-run mode)
pub fn log_dry_run(program: &str, args: &[&str]) {
    println!("  [dry-run] {} {}", program, args.join(" "));
}

/// Wrapper for command execution that respects dry-run mode
#[derive(Debug, Clone)]
pub struct CommandRunner {
    dry_run: bool,
}

impl CommandRunner {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn run(&self, program: &str, args: &[&str]) -> Result<Option<Output>> {
        if crate::utils::signal::is_interrupted() {
            return Err(ImageError::Interrupted);
        }
        if self.dry_run {
            log_dry_run(program, args);
            Ok(None)
        } else {
            run_command(program, args).map(Some)
        }
    }

    pub fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> Result<Option<Output>> {
        if crate::utils::signal::is_interrupted() {
            return Err(ImageError::Interrupted);
        }
        if self.dry_run {
            log_dry_run(program, args);
            for line in input.lines() {
                println!("    {}", line);
            }
            Ok(None)
        } else {
            run_command_with_input(program, args, input).map(Some)
        }
    }

    /// Run a command regardless of interrupt state.
    /// Used for cleanup operations that must execute even after a signal.
    pub fn force_run(&self, program: &str, args: &[&str]) -> Result<Option<Output>> {
        if self.dry_run {
            log_dry_run(program, args);
            Ok(None)
        } else {
            run_command(program, args).map(Some)
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}
