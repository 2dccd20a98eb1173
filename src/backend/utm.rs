use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use indicatif::ProgressBar;

use crate::backend::{Backend, CreateRequest, VmInfo, VmStatus};
use crate::error::McpvmError;
use crate::poll::poll_until;
use crate::{names, paths, state, util};

const UTM_APP: &str = "/Applications/UTM.app";

const STOP_GRACE_ATTEMPTS: u32 = 30;
const STOP_GRACE_INTERVAL: Duration = Duration::from_secs(1);

/// Drives UTM through its AppleScript interface via `osascript`. UTM keeps
/// the VM registration; this driver keeps the disk, seed ISO, and record.
pub struct UtmBackend;

async fn osascript(script: &str) -> Result<String, McpvmError> {
    let output = tokio::process::Command::new("osascript")
        .arg("-e")
        .arg(script)
        .output()
        .await
        .map_err(|e| McpvmError::io("running osascript", e))?;

    if !output.status.success() {
        return Err(McpvmError::Backend {
            backend: "UTM",
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            hint: "check that UTM is installed and automation is allowed for your terminal"
                .into(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn vm_status(name: &str) -> Result<VmStatus, McpvmError> {
    let status = osascript(&format!(
        r#"tell application "UTM" to get status of virtual machine named "{name}""#
    ))
    .await?;
    // UTM reports started/starting/pausing/paused/resuming/stopping/stopped;
    // everything that is not fully stopped counts as running here.
    Ok(if status == "stopped" {
        VmStatus::Stopped
    } else {
        VmStatus::Running
    })
}

/// Parse AppleScript's comma-separated list output into VM names.
fn parse_name_list(output: &str) -> Vec<String> {
    output
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
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

impl Backend for UtmBackend {
    fn label(&self) -> &'static str {
        "utm"
    }

    async fn check_prerequisites(&self) -> Result<(), McpvmError> {
        if !std::path::Path::new(UTM_APP).exists() {
            return Err(McpvmError::MissingTool {
                tool: "UTM".into(),
                hint: "install UTM from https://mac.getutm.app/ (or `brew install --cask utm`)"
                    .into(),
            });
        }

        let output = tokio::process::Command::new("qemu-img")
            .arg("--version")
            .output()
            .await
            .map_err(|_| McpvmError::MissingTool {
                tool: "qemu-img".into(),
                hint: "install qemu (`brew install qemu`) for disk overlay creation".into(),
            })?;
        if !output.status.success() {
            return Err(McpvmError::MissingTool {
                tool: "qemu-img".into(),
                hint: "qemu-img is present but not functional; reinstall qemu".into(),
            });
        }
        Ok(())
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
        let answer = osascript(&format!(
            r#"tell application "UTM" to exists virtual machine named "{name}""#
        ))
        .await?;
        Ok(answer == "true")
    }

    async fn create_vm(&self, req: &CreateRequest) -> Result<(), McpvmError> {
        let disk = paths::disk_path(&req.name, "qcow2");
        if let Some(parent) = disk.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| McpvmError::io(format!("creating {}", parent.display()), e))?;
        }

        // 1. CoW overlay first; nothing is registered with UTM yet.
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

        // 2. Register with UTM and start. On refusal, remove the overlay so
        // no half-made VM survives.
        let name = &req.name;
        let arch = util::host_arch();
        let memory = req.memory_mib;
        let cpus = req.cpus;
        let disk_str = disk.display();
        let seed_str = req.seed_iso.display();
        let mac = &req.mac;
        let script = format!(
            r#"tell application "UTM"
	set vmConfig to {{name:"{name}", architecture:"{arch}", memory:{memory}, cpu cores:{cpus}, drives:{{{{source:POSIX file "{disk_str}"}}, {{source:POSIX file "{seed_str}", removable:true}}}}, network interfaces:{{{{address:"{mac}"}}}}}}
	set vm to make new virtual machine with properties {{backend:qemu, configuration:vmConfig}}
	start vm
end tell"#
        );
        if let Err(e) = osascript(&script).await {
            let _ = tokio::fs::remove_file(&disk).await;
            return Err(e);
        }
        tracing::info!(name = %req.name, "VM registered with UTM and started");

        state::save(&state::VmRecord {
            name: req.name.clone(),
            version: req.version.clone(),
            backend: "utm".into(),
            mac: req.mac.clone(),
            disk: disk.display().to_string(),
            seed_iso: req.seed_iso.display().to_string(),
            cpus: req.cpus,
            memory_mib: req.memory_mib,
            pid: None,
        })?;

        Ok(())
    }

    async fn vm_ip(
        &self,
        name: &str,
        max_attempts: u32,
        interval: Duration,
    ) -> Result<Option<Ipv4Addr>, McpvmError> {
        let script = format!(
            r#"tell application "UTM" to get query ip of virtual machine named "{name}""#
        );
        let script = script.as_str();
        Ok(poll_until(max_attempts, interval, move || async move {
            let output = osascript(script).await.ok()?;
            util::first_ipv4(&output)
        })
        .await)
    }

    async fn list_vms(&self) -> Result<Vec<VmInfo>, McpvmError> {
        let output =
            osascript(r#"tell application "UTM" to get name of virtual machines"#).await?;

        let mut vms = Vec::new();
        for name in parse_name_list(&output) {
            if !names::is_valid_name(&name) {
                continue;
            }
            let status = vm_status(&name).await?;
            vms.push(VmInfo { name, status });
        }
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vms)
    }

    async fn start_vm(&self, name: &str) -> Result<(), McpvmError> {
        if !self.vm_exists(name).await? {
            return Err(McpvmError::VmNotFound { name: name.into() });
        }
        if vm_status(name).await? == VmStatus::Running {
            println!("VM '{name}' is already running.");
            return Ok(());
        }
        osascript(&format!(
            r#"tell application "UTM" to start virtual machine named "{name}""#
        ))
        .await?;
        println!("VM '{name}' started.");
        Ok(())
    }

    async fn stop_vm(&self, name: &str) -> Result<(), McpvmError> {
        if !self.vm_exists(name).await? {
            return Err(McpvmError::VmNotFound { name: name.into() });
        }
        if vm_status(name).await? == VmStatus::Stopped {
            println!("VM '{name}' is not running.");
            return Ok(());
        }

        tracing::info!(name, "requesting guest shutdown");
        osascript(&format!(
            r#"tell application "UTM" to stop virtual machine named "{name}" by request"#
        ))
        .await?;

        let spinner = ProgressBar::new_spinner();
        spinner.set_message(format!("Waiting for VM '{name}' to shut down..."));
        spinner.enable_steady_tick(Duration::from_millis(120));
        let stopped = poll_until(STOP_GRACE_ATTEMPTS, STOP_GRACE_INTERVAL, move || async move {
            match vm_status(name).await {
                Ok(VmStatus::Stopped) => Some(()),
                _ => None,
            }
        })
        .await;
        spinner.finish_and_clear();

        if stopped.is_some() {
            println!("VM '{name}' stopped.");
            return Ok(());
        }

        tracing::warn!(name, "guest shutdown timed out, force stopping");
        osascript(&format!(
            r#"tell application "UTM" to stop virtual machine named "{name}" by force"#
        ))
        .await?;
        println!("VM '{name}' force stopped.");
        Ok(())
    }

    async fn delete_vm(&self, name: &str) -> Result<(), McpvmError> {
        if !self.vm_exists(name).await? {
            return Err(McpvmError::VmNotFound { name: name.into() });
        }

        if vm_status(name).await? == VmStatus::Running {
            tracing::info!(name, "stopping VM before delete");
            osascript(&format!(
                r#"tell application "UTM" to stop virtual machine named "{name}" by force"#
            ))
            .await?;
        }

        osascript(&format!(
            r#"tell application "UTM" to delete virtual machine named "{name}""#
        ))
        .await?;
        tracing::info!(name, "VM removed from UTM");

        remove_vm_dir(name).await?;
        state::remove(name)?;

        println!("VM '{name}' deleted.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_list_parsing() {
        assert_eq!(
            parse_name_list("mcpvm-swift-otter, mcpvm-calm-finch"),
            ["mcpvm-swift-otter", "mcpvm-calm-finch"]
        );
        assert_eq!(parse_name_list(""), Vec::<String>::new());
        assert_eq!(parse_name_list("single-vm"), ["single-vm"]);
    }
}
