use std::path::Path;
use std::process::Stdio;

use crate::error::McpvmError;

/// Run an Ansible playbook against a freshly provisioned VM, streaming its
/// output to the terminal. The single-host inventory is passed inline
/// (the trailing comma makes ansible treat it as a host list, not a file).
pub async fn run(playbook: &Path, host: &str, user: &str) -> Result<(), McpvmError> {
    if !playbook.exists() {
        return Err(McpvmError::Validation {
            message: format!("playbook not found: {}", playbook.display()),
        });
    }

    let inventory = format!("{host},");
    let status = tokio::process::Command::new("ansible-playbook")
        .arg("-i")
        .arg(&inventory)
        .arg("-u")
        .arg(user)
        .arg("--ssh-extra-args")
        .arg("-o StrictHostKeyChecking=accept-new")
        .arg(playbook)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|_| McpvmError::MissingTool {
            tool: "ansible-playbook".into(),
            hint: "install ansible (`pip install ansible` or your distro package)".into(),
        })?;

    if !status.success() {
        return Err(McpvmError::ExternalCommand {
            command: "ansible-playbook".into(),
            message: format!("exited with {status}"),
        });
    }

    tracing::info!(playbook = %playbook.display(), host, "playbook completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_playbook_is_rejected_before_running_anything() {
        let err = run(Path::new("/nonexistent/site.yml"), "mcpvm-x.local", "alice")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("playbook not found"));
    }
}
