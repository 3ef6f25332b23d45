//! Per-address loopback aliasing.
//!
//! On macOS the loopback interface only answers for 127.0.0.1, so every
//! pool address needs an explicit interface alias before anything can bind
//! to it. Linux routes the whole 127.0.0.0/8 out of the box, so there the
//! operations are no-ops.

#![allow(dead_code)]

#[cfg(target_os = "macos")]
use std::process::Command;

use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("'{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

/// Brings up an alias for `ip` on the loopback interface.
#[cfg(target_os = "macos")]
pub fn alias_up(ip: Ipv4Addr) -> Result<(), PlatformError> {
    run_ifconfig(&["lo0", "alias", &ip.to_string(), "up"])
}

/// Removes the loopback alias for `ip`.
#[cfg(target_os = "macos")]
pub fn alias_down(ip: Ipv4Addr) -> Result<(), PlatformError> {
    run_ifconfig(&["lo0", "-alias", &ip.to_string()])
}

#[cfg(target_os = "macos")]
fn run_ifconfig(args: &[&str]) -> Result<(), PlatformError> {
    let command = format!("ifconfig {}", args.join(" "));

    let output = Command::new("ifconfig")
        .args(args)
        .output()
        .map_err(|source| PlatformError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(PlatformError::CommandFailed {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

/// The loopback interface routes the whole range here; nothing to plumb.
#[cfg(not(target_os = "macos"))]
pub fn alias_up(_ip: Ipv4Addr) -> Result<(), PlatformError> {
    Ok(())
}

#[cfg(not(target_os = "macos"))]
pub fn alias_down(_ip: Ipv4Addr) -> Result<(), PlatformError> {
    Ok(())
}
