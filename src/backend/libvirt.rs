use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use indicatif::ProgressBar;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error as virt_error;

use crate::backend::{Backend, CreateRequest, VmInfo, VmStatus};
use crate::error::McpvmError;
use crate::poll::poll_until;
use crate::{names, paths, state, util};

const LIBVIRT_URI: &str = "qemu:///system";

// Grace period for ACPI shutdown before the domain is destroyed.
const STOP_GRACE_ATTEMPTS: u32 = 30;
const STOP_GRACE_INTERVAL: Duration = Duration::from_secs(1);

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

pub struct LibvirtBackend;

fn connect() -> Result<ConnGuard, McpvmError> {
    // Suppress libvirt's default error handler so failures surface only
    // through Result values, not on stderr.
    virt_error::clear_error_callback();

    Connect::open(Some(LIBVIRT_URI))
        .map(ConnGuard)
        .map_err(|e| McpvmError::Backend {
            backend: "libvirt",
            message: format!("failed to connect to libvirt: {e}"),
            hint: format!("ensure libvirtd is running and you have access to {LIBVIRT_URI}"),
        })
}

fn is_running(dom: &Domain) -> bool {
    dom.is_active().unwrap_or(false)
}

/// First valid IPv4 address in the domain's DHCP leases. The query is
/// scoped to the domain, so no MAC correlation is needed here.
fn lease_ipv4(dom: &Domain) -> Option<Ipv4Addr> {
    let ifaces = dom
        .interface_addresses(virt::sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
        .ok()?;
    ifaces
        .iter()
        .flat_map(|iface| iface.addrs.iter())
        .find_map(|addr| util::parse_ipv4(&addr.addr))
}

async fn remove_vm_dir(name: &str) -> Result<(), McpvmError> {
    let dir = paths::vm_dir(name);
    if dir.exists() {
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|e| McpvmError::io(format!("removing {}", dir.display()), e))?;
    }
    Ok(())
}

impl Backend for LibvirtBackend {
    fn label(&self) -> &'static str {
        "libvirt"
    }

    async fn check_prerequisites(&self) -> Result<(), McpvmError> {
        let output = tokio::process::Command::new("qemu-img")
            .arg("--version")
            .output()
            .await
            .map_err(|_| McpvmError::MissingTool {
                tool: "qemu-img".into(),
                hint: "install qemu-img (package qemu-img or qemu-utils)".into(),
            })?;
        if !output.status.success() {
            return Err(McpvmError::MissingTool {
                tool: "qemu-img".into(),
                hint: "qemu-img is present but not functional; reinstall qemu-img/qemu-utils"
                    .into(),
            });
        }

        // Opening a connection verifies both that libvirtd is up and that
        // the invoking user may talk to it.
        connect().map(|_| ())
    }

    fn base_image_path(&self, version: &str) -> PathBuf {
        paths::images_dir().join(format!("rhel-{version}-{}.qcow2", util::host_arch()))
    }

    async fn validate_base_image(&self, version: &str) -> Result<PathBuf, McpvmError> {
        let path = self.base_image_path(version);
        if path.exists() {
            Ok(path)
        } else {
            Err(McpvmError::MissingBaseImage {
                version: version.to_string(),
                path: path.display().to_string(),
                url: "https://access.redhat.com/downloads/content/rhel".into(),
            })
        }
    }

    async fn vm_exists(&self, name: &str) -> Result<bool, McpvmError> {
        let conn = connect()?;
        Ok(Domain::lookup_by_name(&conn, name).is_ok())
    }

    async fn create_vm(&self, req: &CreateRequest) -> Result<(), McpvmError> {
        let disk = paths::disk_path(&req.name, "qcow2");
        if let Some(parent) = disk.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| McpvmError::io(format!("creating {}", parent.display()), e))?;
        }

        // 1. CoW overlay of the base image. Nothing is registered with
        // libvirt yet, so a failure here leaves no trace.
        let output = tokio::process::Command::new("qemu-img")
            .args(["create", "-f", "qcow2", "-b"])
            .arg(&req.base_image)
            .args(["-F", "qcow2"])
            .arg(&disk)
            .output()
            .await
            .map_err(|e| McpvmError::io("running qemu-img", e))?;
        if !output.status.success() {
            return Err(McpvmError::ExternalCommand {
                command: "qemu-img".into(),
                message: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        tracing::info!(path = %disk.display(), "created qcow2 overlay");

        // 2. Define the domain; roll the overlay back if libvirt refuses it.
        let xml = super::domain_xml::generate(req, &disk, &req.seed_iso);
        let conn = connect()?;
        let dom = match Domain::define_xml(&conn, &xml) {
            Ok(dom) => dom,
            Err(e) => {
                let _ = tokio::fs::remove_file(&disk).await;
                return Err(McpvmError::Backend {
                    backend: "libvirt",
                    message: format!("failed to define domain: {e}"),
                    hint: "check the generated domain XML for errors".into(),
                });
            }
        };
        tracing::info!(name = %req.name, "domain defined");

        state::save(&state::VmRecord {
            name: req.name.clone(),
            version: req.version.clone(),
            backend: "libvirt".into(),
            mac: req.mac.clone(),
            disk: disk.display().to_string(),
            seed_iso: req.seed_iso.display().to_string(),
            cpus: req.cpus,
            memory_mib: req.memory_mib,
            pid: None,
        })?;

        // 3. Start it.
        dom.create().map_err(|e| McpvmError::Backend {
            backend: "libvirt",
            message: format!("failed to start domain: {e}"),
            hint: format!("check `virsh -c {LIBVIRT_URI} start {}` for details", req.name),
        })?;
        tracing::info!(name = %req.name, "VM started");

        Ok(())
    }

    async fn vm_ip(
        &self,
        name: &str,
        max_attempts: u32,
        interval: Duration,
    ) -> Result<Option<Ipv4Addr>, McpvmError> {
        let conn = connect()?;
        let dom = Domain::lookup_by_name(&conn, name)
            .map_err(|_| McpvmError::VmNotFound { name: name.into() })?;

        let dom_ref = &dom;
        Ok(poll_until(max_attempts, interval, move || async move {
            lease_ipv4(dom_ref)
        })
        .await)
    }

    async fn list_vms(&self) -> Result<Vec<VmInfo>, McpvmError> {
        let conn = connect()?;
        let domains = conn.list_all_domains(0).map_err(|e| McpvmError::Backend {
            backend: "libvirt",
            message: format!("failed to list domains: {e}"),
            hint: "check libvirt permissions".into(),
        })?;

        let mut vms = Vec::new();
        for dom in &domains {
            let Ok(name) = dom.get_name() else { continue };
            if !names::is_valid_name(&name) {
                continue;
            }
            let status = if is_running(dom) {
                VmStatus::Running
            } else {
                VmStatus::Stopped
            };
            vms.push(VmInfo { name, status });
        }
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vms)
    }

    async fn start_vm(&self, name: &str) -> Result<(), McpvmError> {
        let conn = connect()?;
        let dom = Domain::lookup_by_name(&conn, name)
            .map_err(|_| McpvmError::VmNotFound { name: name.into() })?;

        if is_running(&dom) {
            println!("VM '{name}' is already running.");
            return Ok(());
        }

        dom.create().map_err(|e| McpvmError::Backend {
            backend: "libvirt",
            message: format!("failed to start domain: {e}"),
            hint: "check `virsh start` for details".into(),
        })?;
        println!("VM '{name}' started.");
        Ok(())
    }

    async fn stop_vm(&self, name: &str) -> Result<(), McpvmError> {
        let conn = connect()?;
        let dom = Domain::lookup_by_name(&conn, name)
            .map_err(|_| McpvmError::VmNotFound { name: name.into() })?;

        if !is_running(&dom) {
            println!("VM '{name}' is not running.");
            return Ok(());
        }

        tracing::info!(name, "sending ACPI shutdown");
        dom.shutdown().map_err(|e| McpvmError::Backend {
            backend: "libvirt",
            message: format!("shutdown failed: {e}"),
            hint: "VM may not have ACPI support".into(),
        })?;

        let spinner = ProgressBar::new_spinner();
        spinner.set_message(format!("Waiting for VM '{name}' to shut down..."));
        spinner.enable_steady_tick(Duration::from_millis(120));
        let dom_ref = &dom;
        let stopped = poll_until(STOP_GRACE_ATTEMPTS, STOP_GRACE_INTERVAL, move || async move {
            (!is_running(dom_ref)).then_some(())
        })
        .await;
        spinner.finish_and_clear();

        if stopped.is_some() {
            println!("VM '{name}' stopped.");
            return Ok(());
        }

        tracing::warn!(name, "ACPI shutdown timed out, force stopping");
        dom.destroy().map_err(|e| McpvmError::Backend {
            backend: "libvirt",
            message: format!("force stop failed: {e}"),
            hint: "check libvirt permissions".into(),
        })?;
        println!("VM '{name}' force stopped.");
        Ok(())
    }

    async fn delete_vm(&self, name: &str) -> Result<(), McpvmError> {
        let conn = connect()?;
        let dom = Domain::lookup_by_name(&conn, name)
            .map_err(|_| McpvmError::VmNotFound { name: name.into() })?;

        if is_running(&dom) {
            tracing::info!(name, "stopping VM before delete");
            let _ = dom.destroy();
        }
        dom.undefine().map_err(|e| McpvmError::Backend {
            backend: "libvirt",
            message: format!("failed to undefine domain: {e}"),
            hint: "check libvirt permissions".into(),
        })?;
        tracing::info!(name, "domain undefined");

        remove_vm_dir(name).await?;
        state::remove(name)?;

        println!("VM '{name}' deleted.");
        Ok(())
    }
}
