use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use console::style;
use indicatif::ProgressBar;

use crate::backend::{Backend, CreateRequest};
use crate::cloudinit::{self, SeedConfig};
use crate::error::McpvmError;
use crate::{config, names, paths, playbook, ssh, util};

/// Guest sizing. Test VMs are uniform by design; there is no per-VM tuning.
const CPUS: u32 = 2;
const MEMORY_MIB: u64 = 2048;

// Bounded waits, fixed intervals. Timeouts here degrade to warnings: a VM
// that is slow to lease an address is still created.
const IP_ATTEMPTS: u32 = 30;
const IP_INTERVAL: Duration = Duration::from_secs(2);
const SSH_ATTEMPTS: u32 = 30;
const SSH_INTERVAL: Duration = Duration::from_secs(2);
const MDNS_ATTEMPTS: u32 = 12;
const MDNS_INTERVAL: Duration = Duration::from_secs(5);

pub struct SetupRequest {
    /// OS version, `X.Y`.
    pub version: String,
    /// Explicit VM name; generated when absent.
    pub name: Option<String>,
    /// Playbook to run against the VM once reachable.
    pub playbook: Option<PathBuf>,
}

/// Create and provision a new VM: absent → creating → running.
pub async fn setup<B: Backend>(backend: &B, req: SetupRequest) -> Result<(), McpvmError> {
    validate_version(&req.version)?;
    if let Some(name) = &req.name {
        validate_name(name)?;
    }

    backend.check_prerequisites().await?;

    let config = config::load_config(&paths::config_path())?;
    let ssh_key = ssh::resolve_public_key()?;
    let base_image = backend.validate_base_image(&req.version).await?;

    let name = resolve_name(backend, req.name).await?;
    let hostname = format!("{name}.local");

    println!("Building provisioning payload...");
    let seed_iso = paths::seed_path(&name);
    cloudinit::generate_seed_iso(
        &seed_iso,
        &SeedConfig {
            hostname: &name,
            user: config.guest_user(),
            ssh_key: &ssh_key,
            org: &config.org,
            activation_key: &config.activation_key,
        },
    )
    .await?;

    println!("Creating VM '{name}' ({} backend)...", backend.label());
    let create = CreateRequest {
        name: name.clone(),
        version: req.version.clone(),
        base_image,
        seed_iso,
        mac: util::random_mac(&mut rand::thread_rng()),
        cpus: CPUS,
        memory_mib: MEMORY_MIB,
    };
    backend.create_vm(&create).await?;

    let ip = wait_for_ip(backend, &name).await?;

    let mut reachable = None;
    if let Some(ip) = ip {
        println!("VM '{name}' has address {ip}");
        reachable = wait_for_guest(&name, &hostname, ip).await;
    } else {
        tracing::warn!(
            %name,
            "no IP within {}s; the VM was created but is not reachable yet",
            IP_ATTEMPTS as u64 * IP_INTERVAL.as_secs()
        );
    }

    if let Some(playbook_path) = &req.playbook {
        match &reachable {
            Some(target) => {
                println!("Running playbook {}...", playbook_path.display());
                playbook::run(playbook_path, target, config.guest_user()).await?;
            }
            None => {
                tracing::warn!(
                    %name,
                    playbook = %playbook_path.display(),
                    "skipping playbook: VM is not reachable"
                );
            }
        }
    }

    println!();
    println!("{} VM '{}' is ready", style("✓").green(), style(&name).bold());
    match &reachable {
        Some(target) => println!("  ssh {}@{target}", config.guest_user()),
        None => println!("  (no address yet; try `mcpvm list` later)"),
    }
    Ok(())
}

/// List known VMs. Read-only.
pub async fn list<B: Backend>(backend: &B, name_only: bool) -> Result<(), McpvmError> {
    let vms = backend.list_vms().await?;
    if vms.is_empty() {
        if !name_only {
            println!("No VMs.");
        }
        return Ok(());
    }
    for vm in &vms {
        if name_only {
            println!("{}", vm.name);
        } else {
            println!("{:<32} {}", vm.name, vm.status);
        }
    }
    Ok(())
}

pub async fn start<B: Backend>(backend: &B, name: &str) -> Result<(), McpvmError> {
    backend.start_vm(name).await
}

pub async fn stop<B: Backend>(backend: &B, name: &str) -> Result<(), McpvmError> {
    backend.stop_vm(name).await
}

pub async fn delete<B: Backend>(backend: &B, name: &str) -> Result<(), McpvmError> {
    backend.delete_vm(name).await
}

/// Versions are `X.Y` (e.g. `9.5`, `10.0`).
fn validate_version(version: &str) -> Result<(), McpvmError> {
    let valid = match version.split_once('.') {
        Some((major, minor)) => {
            !major.is_empty()
                && !minor.is_empty()
                && major.chars().all(|c| c.is_ascii_digit())
                && minor.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(McpvmError::Validation {
            message: format!("invalid version '{version}' (expected <major>.<minor>, e.g. 9.5)"),
        })
    }
}

fn validate_name(name: &str) -> Result<(), McpvmError> {
    if names::is_valid_name(name) {
        Ok(())
    } else {
        Err(McpvmError::Validation {
            message: format!(
                "invalid name '{name}': must start with '{}-' and contain only lowercase \
                 letters, digits, and dashes (it becomes the VM's hostname)",
                names::NAME_PREFIX
            ),
        })
    }
}

/// Pick the VM name: an explicit name must be free; otherwise generate one
/// that collides with no VM the backend currently knows.
async fn resolve_name<B: Backend>(
    backend: &B,
    requested: Option<String>,
) -> Result<String, McpvmError> {
    if let Some(name) = requested {
        if backend.vm_exists(&name).await? {
            return Err(McpvmError::DuplicateVm { name });
        }
        return Ok(name);
    }

    let taken: std::collections::HashSet<String> = backend
        .list_vms()
        .await?
        .into_iter()
        .map(|vm| vm.name)
        .collect();
    names::generate_name(&mut rand::thread_rng(), |candidate| {
        taken.contains(candidate)
    })
}

async fn wait_for_ip<B: Backend>(
    backend: &B,
    name: &str,
) -> Result<Option<Ipv4Addr>, McpvmError> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!("Waiting for VM '{name}' to acquire an address..."));
    spinner.enable_steady_tick(Duration::from_millis(120));
    let ip = backend.vm_ip(name, IP_ATTEMPTS, IP_INTERVAL).await;
    spinner.finish_and_clear();
    ip
}

/// Wait for SSH, register host keys under the hostname, and wait for mDNS.
/// Returns the address to reach the guest at (hostname when mDNS resolves,
/// the raw IP otherwise), or `None` when SSH never came up.
async fn wait_for_guest(name: &str, hostname: &str, ip: Ipv4Addr) -> Option<String> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!("Waiting for SSH on {ip}..."));
    spinner.enable_steady_tick(Duration::from_millis(120));
    let ssh_up = ssh::wait_for_ssh(ip, SSH_ATTEMPTS, SSH_INTERVAL).await;
    spinner.finish_and_clear();

    if !ssh_up {
        tracing::warn!(
            name,
            %ip,
            "SSH not reachable within {}s; skipping host key registration",
            SSH_ATTEMPTS as u64 * SSH_INTERVAL.as_secs()
        );
        return None;
    }

    // Keys are registered under the hostname, not the IP: leases change,
    // names do not.
    if let Err(e) = ssh::register_host_keys(hostname, ip).await {
        tracing::warn!(name, error = %e, "host key registration failed");
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!("Waiting for {hostname} to resolve..."));
    spinner.enable_steady_tick(Duration::from_millis(120));
    let mdns_up = ssh::wait_for_hostname(hostname, MDNS_ATTEMPTS, MDNS_INTERVAL).await;
    spinner.finish_and_clear();

    if mdns_up {
        Some(hostname.to_string())
    } else {
        tracing::warn!(name, hostname, "hostname did not resolve; using the IP instead");
        Some(ip.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{VmInfo, VmStatus};
    use std::path::PathBuf;

    /// In-memory driver: a fixed set of existing VM names.
    struct StubBackend {
        existing: Vec<&'static str>,
    }

    impl Backend for StubBackend {
        fn label(&self) -> &'static str {
            "stub"
        }

        async fn check_prerequisites(&self) -> Result<(), McpvmError> {
            Ok(())
        }

        fn base_image_path(&self, version: &str) -> PathBuf {
            PathBuf::from(format!("/images/rhel-{version}.qcow2"))
        }

        async fn validate_base_image(&self, version: &str) -> Result<PathBuf, McpvmError> {
            Ok(self.base_image_path(version))
        }

        async fn vm_exists(&self, name: &str) -> Result<bool, McpvmError> {
            Ok(self.existing.contains(&name))
        }

        async fn create_vm(&self, _req: &CreateRequest) -> Result<(), McpvmError> {
            Ok(())
        }

        async fn vm_ip(
            &self,
            _name: &str,
            _max_attempts: u32,
            _interval: Duration,
        ) -> Result<Option<Ipv4Addr>, McpvmError> {
            Ok(None)
        }

        async fn list_vms(&self) -> Result<Vec<VmInfo>, McpvmError> {
            Ok(self
                .existing
                .iter()
                .map(|name| VmInfo {
                    name: name.to_string(),
                    status: VmStatus::Running,
                })
                .collect())
        }

        async fn start_vm(&self, _name: &str) -> Result<(), McpvmError> {
            Ok(())
        }

        async fn stop_vm(&self, _name: &str) -> Result<(), McpvmError> {
            Ok(())
        }

        async fn delete_vm(&self, _name: &str) -> Result<(), McpvmError> {
            Ok(())
        }
    }

    #[test]
    fn version_format() {
        assert!(validate_version("9.5").is_ok());
        assert!(validate_version("10.0").is_ok());
        assert!(validate_version("9").is_err());
        assert!(validate_version("9.").is_err());
        assert!(validate_version(".5").is_err());
        assert!(validate_version("banana").is_err());
        assert!(validate_version("9.x").is_err());
        assert!(validate_version("").is_err());
    }

    #[tokio::test]
    async fn explicit_duplicate_name_is_rejected() {
        let backend = StubBackend {
            existing: vec!["mcpvm-swift-otter"],
        };
        let err = resolve_name(&backend, Some("mcpvm-swift-otter".into()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn explicit_free_name_is_kept() {
        let backend = StubBackend { existing: vec![] };
        let name = resolve_name(&backend, Some("mcpvm-ci-7".into()))
            .await
            .unwrap();
        assert_eq!(name, "mcpvm-ci-7");
    }

    #[tokio::test]
    async fn generated_name_avoids_known_vms() {
        let backend = StubBackend {
            existing: vec!["mcpvm-swift-otter", "mcpvm-calm-finch"],
        };
        for _ in 0..20 {
            let name = resolve_name(&backend, None).await.unwrap();
            assert!(names::is_valid_name(&name));
            assert_ne!(name, "mcpvm-swift-otter");
            assert_ne!(name, "mcpvm-calm-finch");
        }
    }
}
