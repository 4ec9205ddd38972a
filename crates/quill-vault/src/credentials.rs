//! Where stored credentials come from when the session auto-unlocks.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::VaultConfig;
use crate::error::{VaultError, VaultResult};

pub const PASSPHRASE_ENV: &str = "QUILL_PASSPHRASE";
pub const IDENTITY_ENV: &str = "QUILL_IDENTITY";

/// A credential the age session can encrypt and decrypt with.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    IdentityFile(PathBuf),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::IdentityFile(path) => f.debug_tuple("IdentityFile").field(path).finish(),
        }
    }
}

/// A place stored credentials may be found.
pub trait CredentialSource: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` when this source has nothing to offer.
    fn load(&self) -> VaultResult<Option<Credential>>;
}

/// `QUILL_PASSPHRASE` / `QUILL_IDENTITY`.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    passphrase_var: String,
    identity_var: String,
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::with_vars(PASSPHRASE_ENV, IDENTITY_ENV)
    }
}

impl EnvCredentials {
    pub fn with_vars(passphrase_var: &str, identity_var: &str) -> Self {
        Self {
            passphrase_var: passphrase_var.to_string(),
            identity_var: identity_var.to_string(),
        }
    }
}

impl CredentialSource for EnvCredentials {
    fn name(&self) -> &str {
        "environment"
    }

    fn load(&self) -> VaultResult<Option<Credential>> {
        let non_empty = |var: &str| std::env::var(var).ok().filter(|v| !v.is_empty());
        if let Some(pass) = non_empty(&self.passphrase_var) {
            return Ok(Some(Credential::Password(pass)));
        }
        Ok(non_empty(&self.identity_var).map(|p| Credential::IdentityFile(PathBuf::from(p))))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CredentialsFileContents {
    passphrase: Option<String>,
    identity_file: Option<PathBuf>,
}

/// YAML file with `passphrase:` or `identity_file:`, by default
/// `<config dir>/quill/credentials.yaml`.
#[derive(Debug, Clone)]
pub struct CredentialsFile {
    path: PathBuf,
}

impl CredentialsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The per-user credentials file, if the platform has a config directory.
    pub fn user_default() -> Option<Self> {
        dirs::config_dir().map(|dir| Self::new(dir.join("quill").join("credentials.yaml")))
    }
}

impl CredentialSource for CredentialsFile {
    fn name(&self) -> &str {
        "credentials file"
    }

    fn load(&self) -> VaultResult<Option<Credential>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VaultError::io(&self.path, e)),
        };
        if text.trim().is_empty() {
            return Ok(None);
        }
        let contents: CredentialsFileContents = serde_yaml::from_str(&text)
            .map_err(|e| VaultError::Config(format!("{}: {}", self.path.display(), e)))?;

        if let Some(pass) = contents.passphrase.filter(|p| !p.is_empty()) {
            return Ok(Some(Credential::Password(pass)));
        }
        Ok(contents.identity_file.map(Credential::IdentityFile))
    }
}

/// The identity file named in the vault configuration.
#[derive(Debug, Clone)]
pub struct VaultIdentity {
    path: Option<PathBuf>,
}

impl VaultIdentity {
    pub fn from_config(vault_root: &Path, config: &VaultConfig) -> Self {
        Self {
            path: config.identity_path(vault_root),
        }
    }
}

impl CredentialSource for VaultIdentity {
    fn name(&self) -> &str {
        "vault identity"
    }

    fn load(&self) -> VaultResult<Option<Credential>> {
        match &self.path {
            Some(path) if !path.exists() => Err(VaultError::IdentityFileNotFound(path.clone())),
            Some(path) => Ok(Some(Credential::IdentityFile(path.clone()))),
            None => Ok(None),
        }
    }
}

/// Environment, then the user credentials file, then the vault identity.
pub fn default_sources(vault_root: &Path, config: &VaultConfig) -> Vec<Box<dyn CredentialSource>> {
    let mut sources: Vec<Box<dyn CredentialSource>> = vec![Box::new(EnvCredentials::default())];
    if let Some(file) = CredentialsFile::user_default() {
        sources.push(Box::new(file));
    }
    sources.push(Box::new(VaultIdentity::from_config(vault_root, config)));
    sources
}
