use std::{fs, io, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    session::User,
    tokens::{AccessToken, RefreshToken},
};

/// Session material persisted across restarts.
///
/// The volatile handshake state (pending session id) is deliberately not
/// part of this; it lives in memory only.
///
/// Debug output stays safe: every credential-bearing field redacts itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedSession {
    pub user: User,
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
}

/// File-backed storage for the authenticated session.
///
/// The web client keeps this in browser local storage; the headless client
/// keeps a small TOML file instead. Treat the file like a secret: it grants
/// access to the account.
#[derive(Clone, Debug)]
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    /// Upper bound on the session file size.
    ///
    /// Prevents an out-of-memory condition when pointed at the wrong file.
    const MAX_FILE_SIZE: u64 = 64 * 1024;

    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Loads the persisted session, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> io::Result<Option<PersistedSession>> {
        let attributes = match fs::metadata(&self.path) {
            Ok(attributes) => attributes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        if attributes.len() > Self::MAX_FILE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is too large", self.path.display()),
            ));
        }

        let contents = fs::read_to_string(&self.path)?;
        let session = toml::from_str(&contents).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} format is invalid: {e}", self.path.display()),
            )
        })?;

        Ok(Some(session))
    }

    /// Writes the session, replacing any previous contents.
    ///
    /// On Unix the file is created owner-readable only; it holds
    /// credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, session: &PersistedSession) -> io::Result<()> {
        let contents = toml::to_string(session)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.write_private(&contents)
    }

    #[cfg(unix)]
    fn write_private(&self, contents: &str) -> io::Result<()> {
        use std::{io::Write, os::unix::fs::OpenOptionsExt};

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)?;
        file.write_all(contents.as_bytes())
    }

    #[cfg(not(unix))]
    fn write_private(&self, contents: &str) -> io::Result<()> {
        fs::write(&self.path, contents)
    }

    /// Removes any persisted session material.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
