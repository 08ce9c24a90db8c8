use crate::cert::ParsedX509Certificate;
use crate::crypto::asymmetric::KeyPair;
use crate::crypto::provider::{CryptoProvider, RSA_KEY_BITS};
use crate::protocol::RegistrationInfo;
use anyhow::{Context, bail};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const ACCOUNT_KEY_FILE: &str = "acme_account.pem";
pub const PRIVATE_KEY_FILE: &str = "remote_private.pem";
pub const FULLCHAIN_FILE: &str = "remote_fullchain.pem";
pub const REGISTRATION_FILE: &str = "acme_reg.json";

/// Durable key material and the issued chain, all below one storage directory.
///
/// Every method does blocking file I/O and, when creating keys, CPU heavy work.
/// Async callers go through [`crate::executor::BlockingExecutor`].
#[derive(Debug, Clone)]
pub struct KeyStore {
    storage: PathBuf,
    crypto: Arc<dyn CryptoProvider>,
}

impl KeyStore {
    pub fn new(storage: PathBuf, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self { storage, crypto }
    }

    pub fn storage(&self) -> &Path {
        &self.storage
    }

    pub fn account_key_path(&self) -> PathBuf {
        self.storage.join(ACCOUNT_KEY_FILE)
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.storage.join(PRIVATE_KEY_FILE)
    }

    pub fn fullchain_path(&self) -> PathBuf {
        self.storage.join(FULLCHAIN_FILE)
    }

    pub fn registration_path(&self) -> PathBuf {
        self.storage.join(REGISTRATION_FILE)
    }

    pub fn load_or_create_account_key(&self) -> anyhow::Result<KeyPair> {
        let (key, _) = self.load_or_create_key(&self.account_key_path(), "account key")?;
        Ok(key)
    }

    pub fn load_or_create_private_key_pem(&self) -> anyhow::Result<String> {
        let (_, pem) = self.load_or_create_key(&self.private_key_path(), "certificate private key")?;
        Ok(pem)
    }

    /// Returns the stored key, or generates and stores a new one if there is none.
    ///
    /// A key file that does not hold a usable key is left over from an interrupted write. It is moved aside to
    /// `<name>.corrupt`, never overwritten, before a replacement is generated.
    fn load_or_create_key(&self, path: &Path, description: &str) -> anyhow::Result<(KeyPair, String)> {
        match std::fs::read(path) {
            Ok(contents) => {
                let parsed = String::from_utf8(contents)
                    .map_err(anyhow::Error::from)
                    .and_then(|pem| KeyPair::from_pem(&pem).map(|key| (key, pem)));
                match parsed {
                    Ok(key) => return Ok(key),
                    Err(e) => {
                        warn!("Stored {description} at {} is unusable, generating a new one: {e:#}", path.display());
                        set_aside(path)?;
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).context(format!("Reading {description} from {}", path.display())),
        }
        info!("Generating new {description}");
        let key = self.crypto.generate_rsa_key(RSA_KEY_BITS)?;
        let pem = key.to_pem()?.to_string();
        create_atomically(path, pem.as_bytes()).context(format!("Saving {description} to {}", path.display()))?;
        Ok((key, pem))
    }

    pub fn read_registration(&self) -> anyhow::Result<Option<RegistrationInfo>> {
        let path = self.registration_path();
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context(format!("Reading registration from {}", path.display())),
        };
        let registration = serde_json::from_slice(&contents)
            .context(format!("Parsing registration from {}", path.display()))?;
        Ok(Some(registration))
    }

    /// Persists the registration. Only called once the server has confirmed it.
    pub fn write_registration(&self, registration: &RegistrationInfo) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(registration)?;
        write_atomically(&self.registration_path(), json.as_bytes()).context("Saving ACME registration")
    }

    pub fn has_account_key(&self) -> bool {
        self.account_key_path().exists()
    }

    pub fn has_registration(&self) -> bool {
        self.registration_path().exists()
    }

    /// Returns the leaf of the stored chain, or `None` if nothing has been issued yet.
    pub fn read_certificate(&self) -> anyhow::Result<Option<ParsedX509Certificate>> {
        let path = self.fullchain_path();
        let pem = match std::fs::read(&path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context(format!("Reading certificate from {}", path.display())),
        };
        let certificate = self
            .crypto
            .parse_certificate(&pem)
            .context(format!("Parsing certificate from {}", path.display()))?;
        Ok(Some(certificate))
    }

    pub fn has_certificate(&self) -> bool {
        self.fullchain_path().exists()
    }

    /// Replaces the stored chain. A reader sees either the old or the new file, never a mix.
    pub fn write_certificate(&self, fullchain_pem: &[u8]) -> anyhow::Result<()> {
        write_atomically(&self.fullchain_path(), fullchain_pem).context("Saving certificate chain")
    }

    pub fn delete_certificate(&self) -> anyhow::Result<()> {
        remove_if_present(&self.fullchain_path())
    }

    pub fn delete_private_key(&self) -> anyhow::Result<()> {
        remove_if_present(&self.private_key_path())
    }

    /// Removes the registration and the account key together. One is useless without the other.
    pub fn delete_account_artifacts(&self) -> anyhow::Result<()> {
        remove_if_present(&self.registration_path())?;
        remove_if_present(&self.account_key_path())
    }
}

fn secret_file_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

/// Creates a new owner-only file. Fails instead of overwriting.
fn create_secret_file(path: &Path) -> std::io::Result<File> {
    secret_file_options().create_new(true).open(path)
}

/// Writes `contents` to an owner-only `<name>.tmp` sibling of `path` and syncs it.
fn write_temp_sibling(path: &Path, contents: &[u8]) -> anyhow::Result<PathBuf> {
    let Some(parent) = path.parent() else {
        bail!("{} has no parent directory", path.display());
    };
    std::fs::create_dir_all(parent)?;
    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path = parent.join(temp_name);
    // Leftover from a crash
    remove_if_present(&temp_path)?;
    let mut file = create_secret_file(&temp_path).context(format!("Creating {}", temp_path.display()))?;
    let written = file.write_all(contents).and_then(|()| file.sync_all());
    drop(file);
    if let Err(e) = written {
        std::fs::remove_file(&temp_path).ok();
        return Err(e).context(format!("Writing {}", temp_path.display()));
    }
    Ok(temp_path)
}

/// Replaces `path` with `contents`. Readers see the old or the new file, never a mix.
fn write_atomically(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let temp_path = write_temp_sibling(path, contents)?;
    std::fs::rename(&temp_path, path).context(format!("Moving {} into place", path.display()))?;
    debug!("Wrote {}", path.display());
    Ok(())
}

/// Creates `path` with `contents`, failing if it already exists. The file appears complete or not at all.
fn create_atomically(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let temp_path = write_temp_sibling(path, contents)?;
    // Unlike rename, hard_link refuses to replace an existing target
    let linked = std::fs::hard_link(&temp_path, path);
    remove_if_present(&temp_path)?;
    linked.context(format!("Moving {} into place", path.display()))?;
    debug!("Created {}", path.display());
    Ok(())
}

fn set_aside(path: &Path) -> anyhow::Result<()> {
    let mut corrupt_name = path.file_name().unwrap_or_default().to_os_string();
    corrupt_name.push(".corrupt");
    let corrupt_path = path.with_file_name(corrupt_name);
    std::fs::rename(path, &corrupt_path)
        .context(format!("Moving {} aside to {}", path.display(), corrupt_path.display()))
}

fn remove_if_present(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context(format!("Removing {}", path.display())),
    }
}
