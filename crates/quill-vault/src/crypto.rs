//! age encryption for block content.
//!
//! Supports two kinds of session credential:
//! - a password (scrypt recipient)
//! - an X25519 identity file (encrypts to the identity's own public key)
//!
//! Ciphertext is stored ASCII-armored so it can live in a text file:
//!
//! ```text
//! -----BEGIN AGE ENCRYPTED FILE-----
//! <base64, 64 columns>
//! -----END AGE ENCRYPTED FILE-----
//! ```

use std::io::{Read, Write};
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use age::secrecy::{ExposeSecret, Secret};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quill_core::{EncryptionService, UnlockError};
use tracing::{debug, info, warn};

use crate::config::VaultConfig;
use crate::credentials::{Credential, CredentialSource, default_sources};
use crate::error::{VaultError, VaultResult};

pub const ARMOR_BEGIN: &str = "-----BEGIN AGE ENCRYPTED FILE-----";
pub const ARMOR_END: &str = "-----END AGE ENCRYPTED FILE-----";
const ARMOR_COLUMNS: usize = 64;

/// Whether text is armored age ciphertext.
pub fn is_armored(text: &str) -> bool {
    text.trim_start().starts_with(ARMOR_BEGIN)
}

pub fn armor(bytes: &[u8]) -> String {
    let encoded = STANDARD.encode(bytes);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / ARMOR_COLUMNS + 80);
    out.push_str(ARMOR_BEGIN);
    out.push('\n');
    for chunk in encoded.as_bytes().chunks(ARMOR_COLUMNS) {
        // base64 output is ASCII
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(ARMOR_END);
    out
}

pub fn dearmor(text: &str) -> VaultResult<Vec<u8>> {
    if !is_armored(text) {
        return Err(VaultError::DecryptionFailed(
            "content is not armored age ciphertext".to_string(),
        ));
    }
    let body: String = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    STANDARD
        .decode(body)
        .map_err(|e| VaultError::DecryptionFailed(format!("invalid armor: {}", e)))
}

/// Load the X25519 identity from the first `AGE-SECRET-KEY-` line of a file.
pub fn load_identity(path: &Path) -> VaultResult<age::x25519::Identity> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(VaultError::IdentityFileNotFound(path.to_path_buf()));
        }
        Err(e) => return Err(VaultError::io(path, e)),
    };

    contents
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("AGE-SECRET-KEY-"))
        .ok_or_else(|| {
            VaultError::InvalidIdentityFile(format!(
                "no AGE-SECRET-KEY line in {}",
                path.display()
            ))
        })?
        .parse::<age::x25519::Identity>()
        .map_err(|e| VaultError::InvalidIdentityFile(e.to_string()))
}

/// Public key of an identity file.
pub fn public_key(path: &Path) -> VaultResult<String> {
    Ok(load_identity(path)?.to_public().to_string())
}

/// Write a new X25519 identity to `path` and return its public key.
///
/// The file is readable by its owner only on unix.
pub fn generate_identity(path: &Path) -> VaultResult<String> {
    if path.exists() {
        return Err(VaultError::AlreadyExists(path.to_path_buf()));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| VaultError::io(parent, e))?;
    }

    let identity = age::x25519::Identity::generate();
    let public = identity.to_public();
    let contents = format!(
        "# created: {}\n# public key: {}\n{}\n",
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
        public,
        identity.to_string().expose_secret()
    );
    std::fs::write(path, contents).map_err(|e| VaultError::io(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| VaultError::io(path, e))?;
    }

    info!("Generated identity {}", path.display());
    Ok(public.to_string())
}

fn write_all(encryptor: age::Encryptor, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
    let fail = |e: std::io::Error| VaultError::EncryptionFailed(e.to_string());
    let mut out = Vec::new();
    let mut writer = encryptor
        .wrap_output(&mut out)
        .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;
    writer.write_all(plaintext).map_err(fail)?;
    writer.finish().map_err(fail)?;
    Ok(out)
}

/// Encrypt raw bytes with a credential. CPU-bound.
pub fn encrypt_bytes(credential: &Credential, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
    let encryptor = match credential {
        Credential::Password(password) => {
            age::Encryptor::with_user_passphrase(Secret::new(password.clone()))
        }
        Credential::IdentityFile(path) => {
            let recipient = load_identity(path)?.to_public();
            age::Encryptor::with_recipients(vec![Box::new(recipient)]).ok_or_else(|| {
                VaultError::EncryptionFailed("no recipients configured".to_string())
            })?
        }
    };
    write_all(encryptor, plaintext)
}

/// Decrypt raw bytes with a credential. CPU-bound.
pub fn decrypt_bytes(credential: &Credential, ciphertext: &[u8]) -> VaultResult<Vec<u8>> {
    let decryptor = age::Decryptor::new(ciphertext)
        .map_err(|e| VaultError::DecryptionFailed(e.to_string()))?;

    let mut reader = match (decryptor, credential) {
        (age::Decryptor::Passphrase(d), Credential::Password(password)) => d
            .decrypt(&Secret::new(password.clone()), None)
            .map_err(|_| VaultError::InvalidPassword)?,
        (age::Decryptor::Recipients(d), Credential::IdentityFile(path)) => {
            let identity = load_identity(path)?;
            d.decrypt(std::iter::once(&identity as &dyn age::Identity))
                .map_err(|_| VaultError::NoMatchingKey)?
        }
        (_, Credential::IdentityFile(_)) => {
            return Err(VaultError::DecryptionFailed(
                "content is password-encrypted; unlock with a password".to_string(),
            ));
        }
        (_, Credential::Password(_)) => {
            return Err(VaultError::DecryptionFailed(
                "content is key-encrypted; unlock with an identity file".to_string(),
            ));
        }
    };

    let mut plaintext = Vec::new();
    reader
        .read_to_end(&mut plaintext)
        .map_err(|e| VaultError::DecryptionFailed(e.to_string()))?;
    Ok(plaintext)
}

/// `EncryptionService` backed by age.
///
/// The session starts locked. `try_auto_unlock` consults the credential
/// sources in order; a password supplied interactively is kept until `lock`
/// or until it fails to decrypt something.
pub struct AgeEncryptionService {
    credential: RwLock<Option<Credential>>,
    sources: Vec<Box<dyn CredentialSource>>,
}

impl Default for AgeEncryptionService {
    fn default() -> Self {
        Self::new()
    }
}

impl AgeEncryptionService {
    /// A session with no stored-credential sources.
    pub fn new() -> Self {
        Self::with_sources(Vec::new())
    }

    pub fn with_sources(sources: Vec<Box<dyn CredentialSource>>) -> Self {
        Self {
            credential: RwLock::new(None),
            sources,
        }
    }

    /// A session using the default sources for a vault.
    pub fn for_vault(vault_root: &Path) -> VaultResult<Self> {
        let config = VaultConfig::load(vault_root)?;
        Ok(Self::with_sources(default_sources(vault_root, &config)))
    }

    /// Install a credential after checking it is usable.
    pub fn unlock(&self, credential: Credential) -> VaultResult<()> {
        match &credential {
            Credential::Password(password) if password.is_empty() => {
                return Err(VaultError::InvalidPassword);
            }
            Credential::Password(_) => {}
            Credential::IdentityFile(path) => {
                load_identity(path)?;
            }
        }
        *self.write() = Some(credential);
        Ok(())
    }

    fn credential(&self) -> VaultResult<Credential> {
        self.read().clone().ok_or(VaultError::SessionLocked)
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Credential>> {
        self.credential.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Credential>> {
        self.credential
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EncryptionService for AgeEncryptionService {
    fn is_content_encrypted(&self, content: &str) -> bool {
        is_armored(content)
    }

    fn is_unlocked(&self) -> bool {
        self.read().is_some()
    }

    async fn try_auto_unlock(&self) -> Result<(), UnlockError> {
        if self.is_unlocked() {
            return Ok(());
        }
        for source in &self.sources {
            let found = source
                .load()
                .map_err(|e| UnlockError::Failed(format!("{}: {}", source.name(), e)))?;
            if let Some(credential) = found {
                self.unlock(credential)
                    .map_err(|e| UnlockError::Failed(format!("{}: {}", source.name(), e)))?;
                info!("Encryption unlocked from {}", source.name());
                return Ok(());
            }
        }
        debug!("No stored credentials found");
        Err(UnlockError::NeedsPassword)
    }

    async fn unlock_with_password(&self, password: &str) -> quill_core::Result<()> {
        Ok(self.unlock(Credential::Password(password.to_string()))?)
    }

    async fn lock(&self) {
        *self.write() = None;
        debug!("Encryption session locked");
    }

    async fn encrypt(&self, plaintext: &str) -> quill_core::Result<String> {
        let credential = self.credential()?;
        let plaintext = plaintext.as_bytes().to_vec();
        let ciphertext = tokio::task::spawn_blocking(move || encrypt_bytes(&credential, &plaintext))
            .await
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))??;
        Ok(armor(&ciphertext))
    }

    async fn decrypt(&self, ciphertext: &str) -> quill_core::Result<String> {
        let credential = self.credential()?;
        let bytes = dearmor(ciphertext)?;
        let result = tokio::task::spawn_blocking(move || decrypt_bytes(&credential, &bytes))
            .await
            .map_err(|e| VaultError::DecryptionFailed(e.to_string()))?;

        let plaintext = match result {
            Ok(plaintext) => plaintext,
            Err(VaultError::InvalidPassword) => {
                warn!("Password rejected; locking encryption session");
                *self.write() = None;
                return Err(VaultError::InvalidPassword.into());
            }
            Err(e) => return Err(e.into()),
        };
        String::from_utf8(plaintext).map_err(|_| {
            VaultError::DecryptionFailed("plaintext is not valid UTF-8".to_string()).into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialsFile;
    use tempfile::TempDir;

    fn identity(temp: &TempDir) -> std::path::PathBuf {
        let path = temp.path().join("keys").join("id.txt");
        generate_identity(&path).unwrap();
        path
    }

    #[test]
    fn test_armor_layout() {
        let text = armor(&[7u8; 100]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.first(), Some(&ARMOR_BEGIN));
        assert_eq!(lines.last(), Some(&ARMOR_END));
        assert!(lines[1..lines.len() - 1].iter().all(|l| l.len() <= 64));
        assert_eq!(dearmor(&text).unwrap(), vec![7u8; 100]);

        assert!(dearmor("hello").is_err());
    }

    #[test]
    fn test_generate_identity() {
        let temp = TempDir::new().unwrap();
        let path = identity(&temp);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# created: "));
        assert!(public_key(&path).unwrap().starts_with("age1"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert!(matches!(
            generate_identity(&path),
            Err(VaultError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_byte_level_encryption_per_credential() {
        let temp = TempDir::new().unwrap();
        let password = Credential::Password("pa55".to_string());
        let key = Credential::IdentityFile(identity(&temp));

        let by_password = encrypt_bytes(&password, b"notes").unwrap();
        assert_eq!(decrypt_bytes(&password, &by_password).unwrap(), b"notes");
        let by_key = encrypt_bytes(&key, b"notes").unwrap();
        assert_eq!(decrypt_bytes(&key, &by_key).unwrap(), b"notes");

        assert!(matches!(
            decrypt_bytes(&key, &by_password),
            Err(VaultError::DecryptionFailed(_))
        ));
        assert!(matches!(
            decrypt_bytes(&Credential::Password("nope".to_string()), &by_password),
            Err(VaultError::InvalidPassword)
        ));
    }

    #[tokio::test]
    async fn test_identity_session_round_trip() {
        let temp = TempDir::new().unwrap();
        let svc = AgeEncryptionService::new();
        assert!(svc.encrypt("x").await.unwrap_err().needs_password());

        svc.unlock(Credential::IdentityFile(identity(&temp))).unwrap();
        let sealed = svc.encrypt("secret plan\n").await.unwrap();
        assert!(svc.is_content_encrypted(&sealed));
        assert!(!sealed.contains("secret plan"));
        assert_eq!(svc.decrypt(&sealed).await.unwrap(), "secret plan\n");

        // A different identity cannot open it.
        let other = TempDir::new().unwrap();
        svc.unlock(Credential::IdentityFile(identity(&other))).unwrap();
        let err = svc.decrypt(&sealed).await.unwrap_err();
        assert!(matches!(err, quill_core::Error::Encryption(_)));
        assert!(svc.is_unlocked());
    }

    #[tokio::test]
    async fn test_wrong_password_locks_session() {
        let svc = AgeEncryptionService::new();
        svc.unlock_with_password("right").await.unwrap();
        let sealed = svc.encrypt("hello").await.unwrap();
        assert_eq!(svc.decrypt(&sealed).await.unwrap(), "hello");

        svc.lock().await;
        svc.unlock_with_password("wrong").await.unwrap();
        let err = svc.decrypt(&sealed).await.unwrap_err();
        assert!(err.needs_password());
        assert!(!svc.is_unlocked());

        assert!(svc.unlock_with_password("").await.is_err());
    }

    #[tokio::test]
    async fn test_auto_unlock_from_sources() {
        let temp = TempDir::new().unwrap();
        let id = identity(&temp);

        let svc = AgeEncryptionService::new();
        assert_eq!(svc.try_auto_unlock().await, Err(UnlockError::NeedsPassword));

        let creds = temp.path().join("credentials.yaml");
        std::fs::write(&creds, format!("identity_file: {}\n", id.display())).unwrap();
        let svc = AgeEncryptionService::with_sources(vec![Box::new(CredentialsFile::new(&creds))]);
        svc.try_auto_unlock().await.unwrap();
        assert!(svc.is_unlocked());

        std::fs::write(&creds, "identity_file: /nonexistent/id.txt\n").unwrap();
        let svc = AgeEncryptionService::with_sources(vec![Box::new(CredentialsFile::new(&creds))]);
        assert!(matches!(
            svc.try_auto_unlock().await,
            Err(UnlockError::Failed(_))
        ));
    }
}
