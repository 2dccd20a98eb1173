use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::McpvmError;
use crate::names;
use crate::paths;

/// Persisted per-VM bookkeeping. One JSON file per VM under the state
/// directory; a record exists iff the VM is known to this tool. Records are
/// written by the owning backend driver on create and removed on delete.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct VmRecord {
    pub name: String,
    /// OS version the VM was created from, e.g. "9.5".
    pub version: String,
    /// Driver that owns this record ("libvirt", "utm", "vfkit").
    pub backend: String,
    /// Stable key for DHCP lease correlation.
    pub mac: String,
    /// Copy-on-write VM disk.
    pub disk: String,
    /// Provisioning ISO, deleted together with the VM.
    pub seed_iso: String,
    pub cpus: u32,
    pub memory_mib: u64,
    /// Detached hypervisor process, for process-based backends only.
    #[facet(default)]
    pub pid: Option<u32>,
}

/// Write (or overwrite) a VM record.
pub fn save(record: &VmRecord) -> Result<(), McpvmError> {
    save_in(&paths::state_dir(), record)
}

/// Load a record by name; `None` means the VM does not exist.
pub fn load(name: &str) -> Result<Option<VmRecord>, McpvmError> {
    load_in(&paths::state_dir(), name)
}

/// Remove a record. Missing records are ignored; delete flows call this
/// after the backend registration is already gone.
pub fn remove(name: &str) -> Result<(), McpvmError> {
    remove_in(&paths::state_dir(), name)
}

/// All records in the state directory whose names match the naming
/// convention, sorted by name.
pub fn list() -> Result<Vec<VmRecord>, McpvmError> {
    list_in(&paths::state_dir())
}

fn record_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

fn save_in(dir: &Path, record: &VmRecord) -> Result<(), McpvmError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| McpvmError::io(format!("creating state directory {}", dir.display()), e))?;
    let path = record_file(dir, &record.name);
    let json = facet_json::to_string(record).expect("JSON serialization");
    std::fs::write(&path, json)
        .map_err(|e| McpvmError::io(format!("writing VM record {}", path.display()), e))?;
    Ok(())
}

fn load_in(dir: &Path, name: &str) -> Result<Option<VmRecord>, McpvmError> {
    let path = record_file(dir, name);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(McpvmError::io(
                format!("reading VM record {}", path.display()),
                e,
            ));
        }
    };
    let record: VmRecord = facet_json::from_str(&content).map_err(|e| McpvmError::Validation {
        message: format!("corrupt VM record {}: {e}", path.display()),
    })?;
    Ok(Some(record))
}

fn remove_in(dir: &Path, name: &str) -> Result<(), McpvmError> {
    let path = record_file(dir, name);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(McpvmError::io(
            format!("removing VM record {}", path.display()),
            e,
        )),
    }
}

fn list_in(dir: &Path) -> Result<Vec<VmRecord>, McpvmError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir)
        .map_err(|e| McpvmError::io(format!("reading state directory {}", dir.display()), e))?;

    let mut records = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !names::is_valid_name(stem) {
            continue;
        }
        if let Some(record) = load_in(dir, stem)? {
            records.push(record);
        }
    }
    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(name: &str) -> VmRecord {
        VmRecord {
            name: name.into(),
            version: "9.5".into(),
            backend: "libvirt".into(),
            mac: "52:54:00:12:34:56".into(),
            disk: format!("/tmp/{name}/disk.qcow2"),
            seed_iso: format!("/tmp/{name}/seed.iso"),
            cpus: 2,
            memory_mib: 2048,
            pid: None,
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let record = sample_record("mcpvm-swift-otter");
        save_in(dir.path(), &record).unwrap();

        let loaded = load_in(dir.path(), "mcpvm-swift-otter").unwrap().unwrap();
        assert_eq!(loaded.name, record.name);
        assert_eq!(loaded.version, "9.5");
        assert_eq!(loaded.mac, record.mac);
        assert_eq!(loaded.disk, record.disk);
        assert_eq!(loaded.pid, None);
    }

    #[test]
    fn pid_survives_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = sample_record("mcpvm-calm-finch");
        record.backend = "vfkit".into();
        record.pid = Some(4242);
        save_in(dir.path(), &record).unwrap();

        let loaded = load_in(dir.path(), "mcpvm-calm-finch").unwrap().unwrap();
        assert_eq!(loaded.pid, Some(4242));
        assert_eq!(loaded.backend, "vfkit");
    }

    #[test]
    fn absent_record_means_unknown_vm() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_in(dir.path(), "mcpvm-never-made").unwrap().is_none());
    }

    #[test]
    fn remove_makes_vm_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let record = sample_record("mcpvm-bold-wren");
        save_in(dir.path(), &record).unwrap();
        remove_in(dir.path(), "mcpvm-bold-wren").unwrap();
        assert!(load_in(dir.path(), "mcpvm-bold-wren").unwrap().is_none());
        // Removing again is not an error.
        remove_in(dir.path(), "mcpvm-bold-wren").unwrap();
    }

    #[test]
    fn list_filters_by_naming_convention() {
        let dir = tempfile::tempdir().unwrap();
        save_in(dir.path(), &sample_record("mcpvm-swift-otter")).unwrap();
        save_in(dir.path(), &sample_record("mcpvm-calm-finch")).unwrap();
        // A stray file that does not follow the convention is ignored.
        std::fs::write(dir.path().join("other-vm.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();

        let records = list_in(dir.path()).unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["mcpvm-calm-finch", "mcpvm-swift-otter"]);
    }

    #[test]
    fn list_of_empty_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_in(dir.path()).unwrap().is_empty());
        assert!(list_in(&dir.path().join("missing")).unwrap().is_empty());
    }
}
