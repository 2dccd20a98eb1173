#[cfg(target_os = "linux")]
pub mod libvirt;
#[cfg(target_os = "linux")]
mod domain_xml;

#[cfg(target_os = "macos")]
pub mod utm;
#[cfg(target_os = "macos")]
pub mod vfkit;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::McpvmError;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
compile_error!("mcpvm supports Linux (libvirt) and macOS (UTM/vfkit) hosts only");

/// Normalized VM state reported by every driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    Running,
    Stopped,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmStatus::Running => f.write_str("running"),
            VmStatus::Stopped => f.write_str("stopped"),
        }
    }
}

/// One row of `list` output.
#[derive(Debug, Clone)]
pub struct VmInfo {
    pub name: String,
    pub status: VmStatus,
}

/// Everything a driver needs to bring a new VM up.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub version: String,
    pub base_image: PathBuf,
    pub seed_iso: PathBuf,
    pub mac: String,
    pub cpus: u32,
    pub memory_mib: u64,
}

/// The capability set every virtualization backend implements with
/// identical external semantics. The orchestrator only ever talks to this
/// trait; all mechanism detail (libvirt calls, AppleScript, raw process
/// management) stays inside the driver.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Backend {
    /// Short driver name used in messages and VM records.
    fn label(&self) -> &'static str;

    /// Fatal when required tooling or the hypervisor daemon is missing.
    async fn check_prerequisites(&self) -> Result<(), McpvmError>;

    /// Expected base-image location for this driver and host architecture.
    fn base_image_path(&self, version: &str) -> PathBuf;

    /// Resolve and verify the base image; the error names the expected
    /// path and where to obtain the image.
    async fn validate_base_image(&self, version: &str) -> Result<PathBuf, McpvmError>;

    /// Pure query, no side effects.
    async fn vm_exists(&self, name: &str) -> Result<bool, McpvmError>;

    /// Create the CoW disk, register the VM with the backend, and start it.
    /// The disk is created before any registration; a registration failure
    /// removes the disk again so no half-made VM survives.
    async fn create_vm(&self, req: &CreateRequest) -> Result<(), McpvmError>;

    /// Poll the driver's IP-discovery mechanism. Bounded: returns `None`
    /// after `max_attempts` probes spaced `interval` apart.
    async fn vm_ip(
        &self,
        name: &str,
        max_attempts: u32,
        interval: Duration,
    ) -> Result<Option<Ipv4Addr>, McpvmError>;

    /// All VMs matching the naming convention, with normalized state.
    async fn list_vms(&self) -> Result<Vec<VmInfo>, McpvmError>;

    /// Idempotent; starting a running VM is an informational no-op.
    async fn start_vm(&self, name: &str) -> Result<(), McpvmError>;

    /// Idempotent; graceful shutdown first, force-stop after the grace
    /// period expires.
    async fn stop_vm(&self, name: &str) -> Result<(), McpvmError>;

    /// Stop if running, then remove registration, disk, and seed ISO.
    async fn delete_vm(&self, name: &str) -> Result<(), McpvmError>;
}

/// The driver for this platform, chosen once at startup.
pub enum PlatformBackend {
    #[cfg(target_os = "linux")]
    Libvirt(libvirt::LibvirtBackend),
    #[cfg(target_os = "macos")]
    Utm(utm::UtmBackend),
    #[cfg(target_os = "macos")]
    Vfkit(vfkit::VfkitBackend),
}

/// Select the backend driver for the running platform.
///
/// Linux always uses libvirt. On macOS, `MCPVM_BACKEND=utm|vfkit`
/// overrides; otherwise UTM is preferred when installed, vfkit is the
/// fallback.
pub fn create_backend() -> Result<PlatformBackend, McpvmError> {
    #[cfg(target_os = "linux")]
    {
        Ok(PlatformBackend::Libvirt(libvirt::LibvirtBackend))
    }

    #[cfg(target_os = "macos")]
    {
        match std::env::var("MCPVM_BACKEND").as_deref() {
            Ok("utm") => Ok(PlatformBackend::Utm(utm::UtmBackend)),
            Ok("vfkit") => Ok(PlatformBackend::Vfkit(vfkit::VfkitBackend)),
            Ok(other) => Err(McpvmError::Validation {
                message: format!("unknown MCPVM_BACKEND '{other}' (expected 'utm' or 'vfkit')"),
            }),
            Err(_) => {
                if std::path::Path::new("/Applications/UTM.app").exists() {
                    Ok(PlatformBackend::Utm(utm::UtmBackend))
                } else {
                    Ok(PlatformBackend::Vfkit(vfkit::VfkitBackend))
                }
            }
        }
    }
}

impl Backend for PlatformBackend {
    fn label(&self) -> &'static str {
        match self {
            #[cfg(target_os = "linux")]
            PlatformBackend::Libvirt(b) => b.label(),
            #[cfg(target_os = "macos")]
            PlatformBackend::Utm(b) => b.label(),
            #[cfg(target_os = "macos")]
            PlatformBackend::Vfkit(b) => b.label(),
        }
    }

    async fn check_prerequisites(&self) -> Result<(), McpvmError> {
        match self {
            #[cfg(target_os = "linux")]
            PlatformBackend::Libvirt(b) => b.check_prerequisites().await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Utm(b) => b.check_prerequisites().await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Vfkit(b) => b.check_prerequisites().await,
        }
    }

    fn base_image_path(&self, version: &str) -> PathBuf {
        match self {
            #[cfg(target_os = "linux")]
            PlatformBackend::Libvirt(b) => b.base_image_path(version),
            #[cfg(target_os = "macos")]
            PlatformBackend::Utm(b) => b.base_image_path(version),
            #[cfg(target_os = "macos")]
            PlatformBackend::Vfkit(b) => b.base_image_path(version),
        }
    }

    async fn validate_base_image(&self, version: &str) -> Result<PathBuf, McpvmError> {
        match self {
            #[cfg(target_os = "linux")]
            PlatformBackend::Libvirt(b) => b.validate_base_image(version).await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Utm(b) => b.validate_base_image(version).await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Vfkit(b) => b.validate_base_image(version).await,
        }
    }

    async fn vm_exists(&self, name: &str) -> Result<bool, McpvmError> {
        match self {
            #[cfg(target_os = "linux")]
            PlatformBackend::Libvirt(b) => b.vm_exists(name).await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Utm(b) => b.vm_exists(name).await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Vfkit(b) => b.vm_exists(name).await,
        }
    }

    async fn create_vm(&self, req: &CreateRequest) -> Result<(), McpvmError> {
        match self {
            #[cfg(target_os = "linux")]
            PlatformBackend::Libvirt(b) => b.create_vm(req).await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Utm(b) => b.create_vm(req).await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Vfkit(b) => b.create_vm(req).await,
        }
    }

    async fn vm_ip(
        &self,
        name: &str,
        max_attempts: u32,
        interval: Duration,
    ) -> Result<Option<Ipv4Addr>, McpvmError> {
        match self {
            #[cfg(target_os = "linux")]
            PlatformBackend::Libvirt(b) => b.vm_ip(name, max_attempts, interval).await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Utm(b) => b.vm_ip(name, max_attempts, interval).await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Vfkit(b) => b.vm_ip(name, max_attempts, interval).await,
        }
    }

    async fn list_vms(&self) -> Result<Vec<VmInfo>, McpvmError> {
        match self {
            #[cfg(target_os = "linux")]
            PlatformBackend::Libvirt(b) => b.list_vms().await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Utm(b) => b.list_vms().await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Vfkit(b) => b.list_vms().await,
        }
    }

    async fn start_vm(&self, name: &str) -> Result<(), McpvmError> {
        match self {
            #[cfg(target_os = "linux")]
            PlatformBackend::Libvirt(b) => b.start_vm(name).await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Utm(b) => b.start_vm(name).await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Vfkit(b) => b.start_vm(name).await,
        }
    }

    async fn stop_vm(&self, name: &str) -> Result<(), McpvmError> {
        match self {
            #[cfg(target_os = "linux")]
            PlatformBackend::Libvirt(b) => b.stop_vm(name).await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Utm(b) => b.stop_vm(name).await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Vfkit(b) => b.stop_vm(name).await,
        }
    }

    async fn delete_vm(&self, name: &str) -> Result<(), McpvmError> {
        match self {
            #[cfg(target_os = "linux")]
            PlatformBackend::Libvirt(b) => b.delete_vm(name).await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Utm(b) => b.delete_vm(name).await,
            #[cfg(target_os = "macos")]
            PlatformBackend::Vfkit(b) => b.delete_vm(name).await,
        }
    }
}
