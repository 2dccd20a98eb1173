use std::path::Path;

use facet::Facet;

use crate::error::McpvmError;

/// Subscription credentials and guest account settings, loaded from
/// `~/.config/mcpvm/config.toml`.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    /// Subscription organization id.
    pub org: String,
    /// Subscription activation key.
    pub activation_key: String,
    /// Guest account name created by cloud-init.
    #[facet(default)]
    pub user: String,
}

impl Config {
    /// Guest account name, defaulting to the image's stock cloud user.
    pub fn guest_user(&self) -> &str {
        if self.user.is_empty() {
            "cloud-user"
        } else {
            &self.user
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config, McpvmError> {
    let content = std::fs::read_to_string(path).map_err(|e| McpvmError::ConfigLoad {
        path: path.display().to_string(),
        source: e,
    })?;

    let config: Config = facet_toml::from_str(&content).map_err(|e| McpvmError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    validate(&config, path)?;
    Ok(config)
}

fn validate(config: &Config, path: &Path) -> Result<(), McpvmError> {
    if config.org.trim().is_empty() {
        return Err(McpvmError::Validation {
            message: format!("`org` must be set in {}", path.display()),
        });
    }
    if config.activation_key.trim().is_empty() {
        return Err(McpvmError::Validation {
            message: format!("`activation_key` must be set in {}", path.display()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn parses_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "org = \"1234567\"\nactivation_key = \"test-key\"\n");
        let config = load_config(&path).unwrap();
        assert_eq!(config.org, "1234567");
        assert_eq!(config.activation_key, "test-key");
        assert_eq!(config.guest_user(), "cloud-user");
    }

    #[test]
    fn custom_guest_user() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "org = \"1234567\"\nactivation_key = \"test-key\"\nuser = \"alice\"\n",
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.guest_user(), "alice");
    }

    #[test]
    fn rejects_missing_org() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "activation_key = \"test-key\"\n");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("org"));
    }

    #[test]
    fn rejects_missing_activation_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "org = \"1234567\"\n");
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("activation_key"));
    }

    #[test]
    fn missing_file_is_load_error() {
        let err = load_config(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to load config"));
    }
}
