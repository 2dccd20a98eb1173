use std::path::PathBuf;

/// Credentials file: `~/.config/mcpvm/config.toml`
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("mcpvm")
        .join("config.toml")
}

/// Base image directory: `~/.local/share/mcpvm/images/`
pub fn images_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("mcpvm")
        .join("images")
}

/// VM record directory: `~/.local/share/mcpvm/vms/`
pub fn state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("mcpvm")
        .join("vms")
}

/// Per-VM artifact directory (disk, seed ISO): `~/.local/share/mcpvm/vms/<name>/`
pub fn vm_dir(name: &str) -> PathBuf {
    state_dir().join(name)
}

/// VM disk, a copy-on-write derivative of the base image.
pub fn disk_path(name: &str, format: &str) -> PathBuf {
    vm_dir(name).join(format!("disk.{format}"))
}

/// Cloud-init seed ISO for a VM.
pub fn seed_path(name: &str) -> PathBuf {
    vm_dir(name).join("seed.iso")
}

/// The user's known_hosts file.
pub fn known_hosts_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".ssh")
        .join("known_hosts")
}
