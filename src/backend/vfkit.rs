use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use indicatif::ProgressBar;

use crate::backend::{Backend, CreateRequest, VmInfo, VmStatus};
use crate::error::McpvmError;
use crate::poll::poll_until;
use crate::{leases, paths, state, util};

/// The vmnet DHCP daemon's lease table.
const DHCPD_LEASES: &str = "/var/db/dhcpd_leases";

const STOP_GRACE_ATTEMPTS: u32 = 30;
const STOP_GRACE_INTERVAL: Duration = Duration::from_secs(1);

/// Runs each VM as a detached `vfkit` process (Virtualization.framework).
/// There is no hypervisor-side registry, so the VM record *is* the
/// registration: the persisted PID is probed with signal 0 for liveness and
/// signalled for termination.
pub struct VfkitBackend;

fn is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn send_signal(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

fn record_status(record: &state::VmRecord) -> VmStatus {
    match record.pid {
        Some(pid) if is_alive(pid) => VmStatus::Running,
        _ => VmStatus::Stopped,
    }
}

fn load_record(name: &str) -> Result<state::VmRecord, McpvmError> {
    state::load(name)?
        .filter(|r| r.backend == "vfkit")
        .ok_or_else(|| McpvmError::VmNotFound { name: name.into() })
}

/// Launch vfkit detached and return its PID. The child handle is dropped
/// without killing: the VM outlives this invocation.
fn spawn_vfkit(record: &state::VmRecord) -> Result<u32, McpvmError> {
    let efi_store = paths::vm_dir(&record.name).join("efi-variable-store");

    let child = std::process::Command::new("vfkit")
        .arg("--cpus")
        .arg(record.cpus.to_string())
        .arg("--memory")
        .arg(record.memory_mib.to_string())
        .arg("--bootloader")
        .arg(format!("efi,variable-store={},create", efi_store.display()))
        .arg("--device")
        .arg(format!("virtio-blk,path={}", record.disk))
        .arg("--device")
        .arg(format!("virtio-blk,path={}", record.seed_iso))
        .arg("--device")
        .arg(format!("virtio-net,nat,mac={}", record.mac))
        .arg("--device")
        .arg("virtio-rng")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| McpvmError::io("spawning vfkit", e))?;

    let pid = child.id();
    tracing::info!(name = %record.name, pid, "vfkit started");
    Ok(pid)
}

/// Signal-then-wait stop used by stop and delete. Returns once the process
/// is gone; escalates to SIGKILL after the grace period.
async fn terminate(name: &str, pid: u32) {
    tracing::info!(name, pid, "sending SIGTERM");
    send_signal(pid, libc::SIGTERM);

    let stopped = poll_until(STOP_GRACE_ATTEMPTS, STOP_GRACE_INTERVAL, move || async move {
        (!is_alive(pid)).then_some(())
    })
    .await;

    if stopped.is_none() {
        tracing::warn!(name, pid, "graceful stop timed out, sending SIGKILL");
        send_signal(pid, libc::SIGKILL);
    }
}

async fn clone_base_image(base: &Path, disk: &Path) -> Result<(), McpvmError> {
    // APFS copy-on-write clone: instant, shares blocks with the base image.
    let output = tokio::process::Command::new("cp")
        .arg("-c")
        .arg(base)
        .arg(disk)
        .output()
        .await
        .map_err(|e| McpvmError::io("running cp -c", e))?;
    if !output.status.success() {
        return Err(McpvmError::ExternalCommand {
            command: "cp -c".into(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    tracing::info!(path = %disk.display(), "cloned base image");
    Ok(())
}

impl Backend for VfkitBackend {
    fn label(&self) -> &'static str {
        "vfkit"
    }

    async fn check_prerequisites(&self) -> Result<(), McpvmError> {
        let output = tokio::process::Command::new("vfkit")
            .arg("--version")
            .output()
            .await
            .map_err(|_| McpvmError::MissingTool {
                tool: "vfkit".into(),
                hint: "install vfkit (`brew install vfkit`)".into(),
            })?;
        if !output.status.success() {
            return Err(McpvmError::MissingTool {
                tool: "vfkit".into(),
                hint: "vfkit is present but not functional; reinstall it (`brew reinstall vfkit`)"
                    .into(),
            });
        }
        Ok(())
    }

    fn base_image_path(&self, version: &str) -> PathBuf {
        // Virtualization.framework boots raw images, not qcow2.
        paths::images_dir().join(format!("rhel-{version}-{}.raw", util::host_arch()))
    }

    async fn validate_base_image(&self, version: &str) -> Result<PathBuf, McpvmError> {
        let path = self.base_image_path(version);
        if path.exists() {
            Ok(path)
        } else {
            Err(McpvmError::MissingBaseImage {
                version: version.to_string(),
                path: path.display().to_string(),
                url: "https://access.redhat.com/downloads/content/rhel (convert with `qemu-img convert -O raw`)".into(),
            })
        }
    }

    async fn vm_exists(&self, name: &str) -> Result<bool, McpvmError> {
        Ok(state::load(name)?.is_some_and(|r| r.backend == "vfkit"))
    }

    async fn create_vm(&self, req: &CreateRequest) -> Result<(), McpvmError> {
        let disk = paths::disk_path(&req.name, "raw");
        if let Some(parent) = disk.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| McpvmError::io(format!("creating {}", parent.display()), e))?;
        }

        // 1. CoW clone of the base image; nothing else exists yet.
        clone_base_image(&req.base_image, &disk).await?;

        let mut record = state::VmRecord {
            name: req.name.clone(),
            version: req.version.clone(),
            backend: "vfkit".into(),
            mac: req.mac.clone(),
            disk: disk.display().to_string(),
            seed_iso: req.seed_iso.display().to_string(),
            cpus: req.cpus,
            memory_mib: req.memory_mib,
            pid: None,
        };

        // 2. Launch. A spawn failure removes the clone so no half-made VM
        // survives; the record is only written once the process exists.
        let pid = match spawn_vfkit(&record) {
            Ok(pid) => pid,
            Err(e) => {
                let _ = tokio::fs::remove_file(&disk).await;
                return Err(e);
            }
        };
        record.pid = Some(pid);
        state::save(&record)?;

        Ok(())
    }

    async fn vm_ip(
        &self,
        name: &str,
        max_attempts: u32,
        interval: Duration,
    ) -> Result<Option<Ipv4Addr>, McpvmError> {
        let record = load_record(name)?;
        let mac = record.mac.as_str();

        Ok(poll_until(max_attempts, interval, move || async move {
            let contents = tokio::fs::read_to_string(DHCPD_LEASES).await.ok()?;
            leases::lease_ip_for_mac(&contents, mac)
        })
        .await)
    }

    async fn list_vms(&self) -> Result<Vec<VmInfo>, McpvmError> {
        let mut vms = Vec::new();
        for record in state::list()? {
            if record.backend != "vfkit" {
                continue;
            }
            vms.push(VmInfo {
                status: record_status(&record),
                name: record.name,
            });
        }
        Ok(vms)
    }

    async fn start_vm(&self, name: &str) -> Result<(), McpvmError> {
        let mut record = load_record(name)?;
        if record_status(&record) == VmStatus::Running {
            println!("VM '{name}' is already running.");
            return Ok(());
        }

        let pid = spawn_vfkit(&record)?;
        record.pid = Some(pid);
        state::save(&record)?;
        println!("VM '{name}' started.");
        Ok(())
    }

    async fn stop_vm(&self, name: &str) -> Result<(), McpvmError> {
        let mut record = load_record(name)?;
        let Some(pid) = record.pid.filter(|&p| is_alive(p)) else {
            println!("VM '{name}' is not running.");
            return Ok(());
        };

        let spinner = ProgressBar::new_spinner();
        spinner.set_message(format!("Waiting for VM '{name}' to shut down..."));
        spinner.enable_steady_tick(Duration::from_millis(120));
        terminate(name, pid).await;
        spinner.finish_and_clear();

        record.pid = None;
        state::save(&record)?;
        println!("VM '{name}' stopped.");
        Ok(())
    }

    async fn delete_vm(&self, name: &str) -> Result<(), McpvmError> {
        let record = load_record(name)?;

        if let Some(pid) = record.pid.filter(|&p| is_alive(p)) {
            tracing::info!(name, "stopping VM before delete");
            terminate(name, pid).await;
        }

        let dir = paths::vm_dir(name);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| McpvmError::io(format!("removing {}", dir.display()), e))?;
        }
        state::remove(name)?;

        println!("VM '{name}' deleted.");
        Ok(())
    }
}
