//! Host-file alias management.
//!
//! Tunnel hostnames are written to the system host file inside a single
//! managed block delimited by marker comments. Everything outside the block
//! is preserved byte-for-byte, and a flush with no entries removes the
//! block entirely, so a clean shutdown leaves the file as it was found.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;

const BEGIN_MARKER: &str = "# BEGIN svctun";
const END_MARKER: &str = "# END svctun";

#[derive(Debug, Error)]
pub enum HostsError {
    #[error("failed to read hosts file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write hosts file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("hostname '{0}' is already bound")]
    DuplicateHostname(String),
}

struct HostsEntry {
    ip: Ipv4Addr,
    hostnames: Vec<String>,
}

/// Manages the controller-owned block of the host file.
pub struct HostsFile {
    path: PathBuf,
    entries: Vec<HostsEntry>,
}

impl HostsFile {
    /// Platform host-file location.
    pub fn default_path() -> PathBuf {
        if cfg!(windows) {
            PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
        } else {
            PathBuf::from("/etc/hosts")
        }
    }

    /// Opens the host file for management, starting with no entries.
    ///
    /// Reads the file once so permission problems surface at startup
    /// rather than on the first tunnel. A managed block left behind by a
    /// crashed run is discarded on the first flush.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HostsError> {
        let path = path.into();
        read_or_empty(&path)?;
        Ok(Self {
            path,
            entries: Vec::new(),
        })
    }

    /// Binds `hostnames` to `ip`. Fails if any hostname is already bound,
    /// so removal by hostname stays unambiguous.
    pub fn add(&mut self, ip: Ipv4Addr, hostnames: &[String]) -> Result<(), HostsError> {
        let bound: HashSet<&str> = self
            .entries
            .iter()
            .flat_map(|e| e.hostnames.iter().map(String::as_str))
            .collect();
        if let Some(dup) = hostnames.iter().find(|h| bound.contains(h.as_str())) {
            return Err(HostsError::DuplicateHostname(dup.clone()));
        }

        self.entries.push(HostsEntry {
            ip,
            hostnames: hostnames.to_vec(),
        });
        Ok(())
    }

    /// Unbinds the given hostnames, wherever they point.
    pub fn remove(&mut self, hostnames: &[String]) {
        for entry in &mut self.entries {
            entry.hostnames.retain(|h| !hostnames.contains(h));
        }
        self.entries.retain(|e| !e.hostnames.is_empty());
    }

    /// Rewrites the managed block in the host file.
    pub fn flush(&self) -> Result<(), HostsError> {
        let content = read_or_empty(&self.path)?;
        let mut rewritten = strip_block(&content);

        if !self.entries.is_empty() {
            rewritten.push_str(BEGIN_MARKER);
            rewritten.push('\n');
            for entry in &self.entries {
                rewritten.push_str(&format!("{} {}\n", entry.ip, entry.hostnames.join(" ")));
            }
            rewritten.push_str(END_MARKER);
            rewritten.push('\n');
        }

        fs::write(&self.path, rewritten).map_err(|source| HostsError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

fn read_or_empty(path: &Path) -> Result<String, HostsError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(source) => Err(HostsError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Returns `content` with the managed block removed.
fn strip_block(content: &str) -> String {
    let mut result = String::new();
    let mut in_block = false;

    for line in content.lines() {
        if line.trim() == BEGIN_MARKER {
            in_block = true;
            continue;
        }
        if line.trim() == END_MARKER {
            in_block = false;
            continue;
        }
        if !in_block {
            result.push_str(line);
            result.push('\n');
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hosts_fixture(initial: &str) -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        fs::write(&path, initial).unwrap();
        (dir, path)
    }

    #[test]
    fn test_add_and_flush() {
        let (_dir, path) = hosts_fixture("127.0.0.1 localhost\n");
        let mut hosts = HostsFile::open(&path).unwrap();

        hosts
            .add(
                Ipv4Addr::new(127, 0, 0, 2),
                &["web.local".to_string(), "web.default".to_string()],
            )
            .unwrap();
        hosts.flush().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("127.0.0.1 localhost"));
        assert!(content.contains("127.0.0.2 web.local web.default"));
        assert!(content.contains(BEGIN_MARKER));
        assert!(content.contains(END_MARKER));
    }

    #[test]
    fn test_remove_by_hostname() {
        let (_dir, path) = hosts_fixture("");
        let mut hosts = HostsFile::open(&path).unwrap();

        hosts
            .add(Ipv4Addr::new(127, 0, 0, 2), &["web.local".to_string()])
            .unwrap();
        hosts
            .add(Ipv4Addr::new(127, 0, 0, 3), &["db.local".to_string()])
            .unwrap();
        hosts.flush().unwrap();

        hosts.remove(&["web.local".to_string()]);
        hosts.flush().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains("web.local"));
        assert!(content.contains("db.local"));
    }

    #[test]
    fn test_empty_flush_removes_block() {
        let (_dir, path) = hosts_fixture("::1 ip6-localhost\n");
        let mut hosts = HostsFile::open(&path).unwrap();

        hosts
            .add(Ipv4Addr::new(127, 0, 0, 2), &["web.local".to_string()])
            .unwrap();
        hosts.flush().unwrap();
        hosts.remove(&["web.local".to_string()]);
        hosts.flush().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "::1 ip6-localhost\n");
    }

    #[test]
    fn test_duplicate_hostname_rejected() {
        let (_dir, path) = hosts_fixture("");
        let mut hosts = HostsFile::open(&path).unwrap();

        hosts
            .add(Ipv4Addr::new(127, 0, 0, 2), &["web.local".to_string()])
            .unwrap();
        let err = hosts
            .add(Ipv4Addr::new(127, 0, 0, 3), &["web.local".to_string()])
            .unwrap_err();

        assert!(matches!(err, HostsError::DuplicateHostname(h) if h == "web.local"));
    }

    #[test]
    fn test_stale_block_discarded() {
        let (_dir, path) = hosts_fixture(
            "127.0.0.1 localhost\n# BEGIN svctun\n127.0.0.9 stale.local\n# END svctun\n",
        );
        let mut hosts = HostsFile::open(&path).unwrap();

        hosts
            .add(Ipv4Addr::new(127, 0, 0, 2), &["web.local".to_string()])
            .unwrap();
        hosts.flush().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains("stale.local"));
        assert!(content.contains("web.local"));
        assert!(content.contains("localhost"));
    }

    #[test]
    fn test_missing_file_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        let mut hosts = HostsFile::open(&path).unwrap();

        hosts
            .add(Ipv4Addr::new(127, 0, 0, 2), &["web.local".to_string()])
            .unwrap();
        hosts.flush().unwrap();

        assert!(fs::read_to_string(&path).unwrap().contains("web.local"));
    }

    #[test]
    fn test_strip_block() {
        let content = "a\n# BEGIN svctun\nb\n# END svctun\nc\n";
        assert_eq!(strip_block(content), "a\nc\n");
    }
}
