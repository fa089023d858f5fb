use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Storage key (and file name) of the persisted bearer token.
pub const TOKEN_KEY: &str = "token";

const APP_DIR: &str = "agent-chat";

/// Persistence for the bearer token between runs.
pub trait TokenStore: Send + Sync {
    fn load_token(&self) -> Result<Option<String>>;
    fn persist_token(&self, token: &str) -> Result<()>;
    fn clear_token(&self) -> Result<()>;
}

/// Token kept as a single file inside a directory.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<config dir>/agent-chat`, when the platform has a config dir.
    pub fn default_location() -> Option<Self> {
        dirs::config_dir().map(|dir| Self::new(dir.join(APP_DIR)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(TOKEN_KEY)
    }
}

impl TokenStore for FileTokenStore {
    fn load_token(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path()) {
            Ok(contents) => Ok(non_empty(&contents)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn persist_token(&self, token: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path();
        let mut file = owner_only_file(&path)?;
        file.write_all(token.trim().as_bytes())?;
        file.sync_all()?;
        debug!(path = %path.display(), "token persisted");
        Ok(())
    }

    fn clear_token(&self) -> Result<()> {
        match std::fs::remove_file(self.path()) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

/// Open `path` for writing; on unix the file is created owner-only and an
/// existing file is narrowed to 0600 before it is truncated.
#[cfg(unix)]
fn owner_only_file(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)?;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.set_len(0)?;
    Ok(file)
}

#[cfg(not(unix))]
fn owner_only_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// Process-local token store.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: &str) -> Self {
        Self {
            token: Mutex::new(non_empty(token)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load_token(&self) -> Result<Option<String>> {
        Ok(self
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn persist_token(&self, token: &str) -> Result<()> {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = non_empty(token);
        Ok(())
    }

    fn clear_token(&self) -> Result<()> {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
