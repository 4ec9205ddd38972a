//! Vault configuration.
//!
//! Every vault keeps its settings under a `.quill` directory at its root:
//!
//! ```text
//! vault/
//! ├── .quill/
//! │   ├── config.yaml   # VaultConfig
//! │   └── identity.txt  # optional age identity
//! └── Notes.md/         # a notebook directory
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use quill_core::InterpreterSettings;
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

/// Name of the per-vault settings directory.
pub const CONFIG_DIR: &str = ".quill";

/// Settings file inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "config.yaml";

/// How blocks in this vault are encrypted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMethod {
    #[default]
    Password,
    #[serde(alias = "identityfile")]
    IdentityFile,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultInfo {
    pub name: String,
    /// RFC 3339 creation timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub method: EncryptionMethod,
    /// Identity file for `identity_file` mode; relative paths are resolved
    /// against the vault root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

/// Contents of `.quill/config.yaml`. Every section is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub version: u32,
    pub vault: VaultInfo,
    pub encryption: EncryptionConfig,
    pub interpreters: InterpreterSettings,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            version: 1,
            vault: VaultInfo::default(),
            encryption: EncryptionConfig::default(),
            interpreters: InterpreterSettings::default(),
        }
    }
}

impl VaultConfig {
    /// Location of the config file for a vault root.
    pub fn path(vault_root: &Path) -> PathBuf {
        vault_root.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Load a vault's configuration. A missing file yields the defaults.
    pub fn load(vault_root: &Path) -> VaultResult<Self> {
        let path = Self::path(vault_root);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(VaultError::io(&path, e)),
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&text)
            .map_err(|e| VaultError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn save(&self, vault_root: &Path) -> VaultResult<()> {
        let path = Self::path(vault_root);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| VaultError::io(dir, e))?;
        }
        let text = serde_yaml::to_string(self).map_err(|e| VaultError::Config(e.to_string()))?;
        fs::write(&path, text).map_err(|e| VaultError::io(&path, e))
    }

    /// Identity file configured for `identity_file` mode, resolved against the vault root.
    pub fn identity_path(&self, vault_root: &Path) -> Option<PathBuf> {
        if self.encryption.method != EncryptionMethod::IdentityFile {
            return None;
        }
        self.encryption.identity_file.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                vault_root.join(p)
            }
        })
    }
}

/// Create a vault at `root`, or load it if one already exists there.
pub fn init_vault(root: &Path, name: Option<&str>) -> VaultResult<VaultConfig> {
    if VaultConfig::path(root).exists() {
        return VaultConfig::load(root);
    }
    fs::create_dir_all(root).map_err(|e| VaultError::io(root, e))?;

    let name = name.map(str::to_string).unwrap_or_else(|| {
        root.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "Vault".to_string())
    });
    let config = VaultConfig {
        vault: VaultInfo {
            name,
            created: Some(chrono::Utc::now().to_rfc3339()),
        },
        ..Default::default()
    };
    config.save(root)?;
    tracing::info!("Initialized vault at {}", root.display());
    Ok(config)
}

/// Nearest ancestor of `start` (inclusive) that contains a `.quill` directory.
pub fn find_vault_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(CONFIG_DIR).is_dir())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_is_default() {
        let temp = TempDir::new().unwrap();
        let config = VaultConfig::load(temp.path()).unwrap();
        assert_eq!(config, VaultConfig::default());
        assert_eq!(config.version, 1);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join(CONFIG_DIR)).unwrap();
        fs::write(
            VaultConfig::path(temp.path()),
            "encryption:\n  enabled: true\n  method: identityfile\n  identity_file: keys/me.txt\ninterpreters:\n  python: /opt/py/bin/python3\n",
        )
        .unwrap();

        let config = VaultConfig::load(temp.path()).unwrap();
        assert!(config.encryption.enabled);
        assert_eq!(config.encryption.method, EncryptionMethod::IdentityFile);
        assert_eq!(
            config.identity_path(temp.path()),
            Some(temp.path().join("keys/me.txt"))
        );
        assert_eq!(
            config.interpreters.python.as_deref(),
            Some("/opt/py/bin/python3")
        );
        assert_eq!(config.interpreters.shell, None);
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join(CONFIG_DIR)).unwrap();
        fs::write(VaultConfig::path(temp.path()), "version: [nope").unwrap();
        assert!(matches!(
            VaultConfig::load(temp.path()),
            Err(VaultError::Config(_))
        ));
    }

    #[test]
    fn test_init_vault_and_find_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("Notes");
        let config = init_vault(&root, None).unwrap();
        assert_eq!(config.vault.name, "Notes");
        assert!(config.vault.created.is_some());

        // Idempotent: the existing config is returned unchanged.
        let again = init_vault(&root, Some("Other")).unwrap();
        assert_eq!(again, config);

        let nested = root.join("Project.md");
        fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_vault_root(&nested), Some(root));
    }
}
