use std::path::Path;

use facet_value::{VArray, Value, value};

use crate::error::McpvmError;
use crate::iso9660::{self, IsoFile};

/// Cloud-init NoCloud volume label. Fixed contract: every backend mounts
/// the seed by this label, and the guest's first-boot agent looks it up the
/// same way.
pub const VOLUME_LABEL: &str = "CIDATA";

/// Inputs substituted into the provisioning payload.
pub struct SeedConfig<'a> {
    /// VM name; doubles as hostname and instance-id.
    pub hostname: &'a str,
    /// Guest account to create.
    pub user: &'a str,
    /// OpenSSH public key authorized for the guest account.
    pub ssh_key: &'a str,
    /// Subscription organization id.
    pub org: &'a str,
    /// Subscription activation key.
    pub activation_key: &'a str,
}

/// Instance metadata descriptor: identity and hostname, nothing more.
pub fn build_meta_data(config: &SeedConfig) -> String {
    let hostname = config.hostname;
    format!("instance-id: {hostname}\nlocal-hostname: {hostname}\n")
}

/// Declarative `#cloud-config` descriptor: guest account with the supplied
/// key, subscription registration, and avahi so the VM answers on
/// `<name>.local`.
pub fn build_user_data(config: &SeedConfig) -> String {
    let fqdn = format!("{}.local", config.hostname);

    let mut user = value!({
        "name": (config.user),
        "groups": "wheel",
        "shell": "/bin/bash",
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
        "lock_passwd": true,
    });
    let keys = VArray::from_iter([Value::from(config.ssh_key)]);
    if let Some(obj) = user.as_object_mut() {
        obj.insert("ssh_authorized_keys", Value::from(keys));
    }

    let subscription = value!({
        "org": (config.org),
        "activation-key": (config.activation_key),
        "auto-attach": true,
    });

    let mut runcmd = VArray::new();
    runcmd.push(value!(["systemctl", "enable", "--now", "avahi-daemon.service"]));

    let doc = value!({
        "hostname": (config.hostname),
        "fqdn": (fqdn.as_str()),
        "ssh_pwauth": false,
        "users": [user],
        "rh_subscription": (subscription),
        "packages": ["avahi", "nss-mdns"],
        "runcmd": (Value::from(runcmd)),
    });

    let yaml = facet_yaml::to_string(&doc).expect("valid YAML serialization");
    // cloud-init wants #cloud-config as the very first line; drop the
    // document separator the serializer emits.
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    format!("#cloud-config\n{yaml}")
}

/// Build the provisioning ISO and write it to `seed_path`.
pub async fn generate_seed_iso(
    seed_path: &Path,
    config: &SeedConfig<'_>,
) -> Result<(), McpvmError> {
    if let Some(parent) = seed_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| McpvmError::io(format!("creating directory {}", parent.display()), e))?;
    }

    let meta_data = build_meta_data(config);
    let user_data = build_user_data(config);

    let iso = iso9660::build_iso(
        VOLUME_LABEL,
        &[
            IsoFile {
                name: "meta-data",
                data: meta_data.as_bytes(),
            },
            IsoFile {
                name: "user-data",
                data: user_data.as_bytes(),
            },
        ],
    );

    tokio::fs::write(seed_path, &iso)
        .await
        .map_err(|e| McpvmError::io(format!("writing seed ISO to {}", seed_path.display()), e))?;

    tracing::info!(path = %seed_path.display(), "generated cloud-init seed ISO");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> SeedConfig<'static> {
        SeedConfig {
            hostname: "mcpvm-x",
            user: "alice",
            ssh_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAITestKeyData test@host",
            org: "1234567",
            activation_key: "test-activation",
        }
    }

    #[test]
    fn meta_data_carries_identity() {
        let md = build_meta_data(&sample_config());
        assert_eq!(md, "instance-id: mcpvm-x\nlocal-hostname: mcpvm-x\n");
    }

    #[test]
    fn user_data_is_cloud_config() {
        let ud = build_user_data(&sample_config());
        assert!(ud.starts_with("#cloud-config\n"));
    }

    #[test]
    fn user_data_substitutes_every_input() {
        let ud = build_user_data(&sample_config());
        assert!(ud.contains("mcpvm-x"));
        assert!(ud.contains("name: alice"));
        assert!(ud.contains("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAITestKeyData"));
        assert!(ud.contains("org: 1234567") || ud.contains("org: \"1234567\""));
        assert!(ud.contains("test-activation"));
    }

    #[test]
    fn user_data_has_no_template_tokens() {
        let ud = build_user_data(&sample_config());
        assert!(!ud.contains("{{"));
        assert!(!ud.contains("}}"));
        assert!(!ud.contains("$"));
    }

    #[test]
    fn user_data_configures_account_and_discovery() {
        let ud = build_user_data(&sample_config());
        assert!(ud.contains("wheel"));
        assert!(ud.contains("NOPASSWD:ALL"));
        assert!(ud.contains("ssh_authorized_keys"));
        assert!(ud.contains("avahi"));
        assert!(ud.contains("avahi-daemon.service"));
        assert!(ud.contains("fqdn: mcpvm-x.local"));
    }

    #[test]
    fn user_data_registers_subscription() {
        let ud = build_user_data(&sample_config());
        assert!(ud.contains("rh_subscription"));
        assert!(ud.contains("activation-key"));
    }

    // Round trip from inputs to a mountable image: every input appears in
    // the image bytes, no template tokens remain, and the volume label is
    // the fixed cloud-init one.
    #[tokio::test]
    async fn seed_iso_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let seed = dir.path().join("seed.iso");
        let config = sample_config();
        generate_seed_iso(&seed, &config).await.unwrap();

        let iso = std::fs::read(&seed).unwrap();
        let contains = |needle: &[u8]| iso.windows(needle.len()).any(|w| w == needle);

        assert!(contains(b"CIDATA"));
        assert!(contains(b"instance-id: mcpvm-x"));
        assert!(contains(b"name: alice"));
        assert!(contains(b"ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAITestKeyData"));
        assert!(contains(b"1234567"));
        assert!(contains(b"test-activation"));
        assert!(!contains(b"{{"));
    }
}
