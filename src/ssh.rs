use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::McpvmError;
use crate::paths;
use crate::poll::poll_until;

/// Key files tried in order of preference.
const KEY_CANDIDATES: &[&str] = &["id_ed25519.pub", "id_rsa.pub"];

/// Resolve the operator's SSH public key for injection into the guest.
///
/// Prefers an ed25519 key, falls back to RSA, and validates that whatever
/// is found actually parses as an OpenSSH public key before it ends up in
/// the provisioning payload.
pub fn resolve_public_key() -> Result<String, McpvmError> {
    let ssh_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".ssh");
    resolve_public_key_in(&ssh_dir)
}

fn resolve_public_key_in(ssh_dir: &Path) -> Result<String, McpvmError> {
    for candidate in KEY_CANDIDATES {
        let path = ssh_dir.join(candidate);
        if !path.exists() {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| McpvmError::io(format!("reading {}", path.display()), e))?;
        let key = content.trim();
        ssh_key::PublicKey::from_openssh(key).map_err(|e| McpvmError::Validation {
            message: format!("{} is not a valid OpenSSH public key: {e}", path.display()),
        })?;
        tracing::info!(path = %path.display(), "using SSH public key");
        return Ok(key.to_string());
    }

    Err(McpvmError::SshKeyMissing {
        searched: KEY_CANDIDATES
            .iter()
            .map(|c| ssh_dir.join(c).display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Poll until the VM accepts TCP connections on port 22.
pub async fn wait_for_ssh(ip: Ipv4Addr, max_attempts: u32, interval: Duration) -> bool {
    poll_until(max_attempts, interval, move || async move {
        let connect = tokio::net::TcpStream::connect((ip, 22));
        match tokio::time::timeout(Duration::from_secs(3), connect).await {
            Ok(Ok(_)) => Some(()),
            _ => None,
        }
    })
    .await
    .is_some()
}

/// Poll until `<hostname>` resolves via the system resolver (mDNS for
/// `.local` names once avahi is up in the guest).
pub async fn wait_for_hostname(hostname: &str, max_attempts: u32, interval: Duration) -> bool {
    poll_until(max_attempts, interval, move || async move {
        match tokio::net::lookup_host((hostname, 22)).await {
            Ok(mut addrs) => addrs.next().map(|_| ()),
            Err(_) => None,
        }
    })
    .await
    .is_some()
}

/// Scan the VM's host keys and register them in `known_hosts` under the
/// VM's hostname rather than its IP, so later `ssh <name>.local` sessions
/// skip the host-key prompt even though the lease may change.
pub async fn register_host_keys(hostname: &str, ip: Ipv4Addr) -> Result<(), McpvmError> {
    let known_hosts = paths::known_hosts_path();

    // Drop any stale keys from a previous VM that used this name.
    let _ = tokio::process::Command::new("ssh-keygen")
        .args(["-R", hostname, "-f"])
        .arg(&known_hosts)
        .output()
        .await;

    let output = tokio::process::Command::new("ssh-keyscan")
        .args(["-T", "5", &ip.to_string()])
        .output()
        .await
        .map_err(|e| McpvmError::io("running ssh-keyscan", e))?;

    let scanned = String::from_utf8_lossy(&output.stdout);
    let entries = rewrite_keyscan_hosts(&scanned, hostname);
    if entries.is_empty() {
        tracing::warn!(%ip, "ssh-keyscan returned no host keys");
        return Ok(());
    }

    append_known_hosts(&known_hosts, &entries)?;
    tracing::info!(hostname, "registered host keys");
    Ok(())
}

/// Replace the host field of each keyscan line with the VM's hostname.
fn rewrite_keyscan_hosts(scanned: &str, hostname: &str) -> String {
    let mut out = String::new();
    for line in scanned.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((_, rest)) = line.split_once(' ') else {
            continue;
        };
        out.push_str(hostname);
        out.push(' ');
        out.push_str(rest);
        out.push('\n');
    }
    out
}

fn append_known_hosts(path: &Path, entries: &str) -> Result<(), McpvmError> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| McpvmError::io(format!("creating {}", parent.display()), e))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| McpvmError::io(format!("opening {}", path.display()), e))?;
    file.write_all(entries.as_bytes())
        .map_err(|e| McpvmError::io(format!("appending to {}", path.display()), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Example key from the ssh-key crate documentation.
    const ED25519_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAILM+rvN+ot98qgEN796jTiQfZfG1KaT0PtFDJ/XFSqti user@example.com";

    #[test]
    fn prefers_ed25519_over_rsa() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("id_ed25519.pub"), format!("{ED25519_KEY}\n")).unwrap();
        std::fs::write(dir.path().join("id_rsa.pub"), "ssh-rsa notakey\n").unwrap();

        let key = resolve_public_key_in(dir.path()).unwrap();
        assert_eq!(key, ED25519_KEY);
    }

    #[test]
    fn missing_keys_is_fatal_with_searched_paths() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_public_key_in(dir.path()).unwrap_err();
        assert!(err.to_string().contains("no usable SSH public key"));
    }

    #[test]
    fn invalid_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("id_ed25519.pub"), "garbage\n").unwrap();
        let err = resolve_public_key_in(dir.path()).unwrap_err();
        assert!(err.to_string().contains("not a valid OpenSSH public key"));
    }

    #[test]
    fn keyscan_lines_are_rekeyed_to_hostname() {
        let scanned = "\
# 192.168.124.7:22 SSH-2.0-OpenSSH_9.6
192.168.124.7 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHostKey
192.168.124.7 ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABgQRsaKey
";
        let out = rewrite_keyscan_hosts(scanned, "mcpvm-swift-otter.local");
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            assert!(line.starts_with("mcpvm-swift-otter.local "));
            assert!(!line.contains("192.168.124.7"));
        }
    }

    #[test]
    fn empty_scan_yields_no_entries() {
        assert!(rewrite_keyscan_hosts("", "host").is_empty());
        assert!(rewrite_keyscan_hosts("# comment only\n", "host").is_empty());
    }

    #[test]
    fn append_creates_file_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".ssh").join("known_hosts");
        append_known_hosts(&path, "a ssh-ed25519 key1\n").unwrap();
        append_known_hosts(&path, "b ssh-ed25519 key2\n").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "a ssh-ed25519 key1\nb ssh-ed25519 key2\n");
    }
}
