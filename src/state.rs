//! On-disk persistence of the server map.
//!
//! The file holds a 32 character hex digest followed by the bincode encoded [`ServerMap`]. The
//! digest covers the payload, so a torn or tampered file is detected on load and discarded.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::Error;
use crate::server_map::ServerMap;

const DIGEST_LEN: usize = 32;
const DIGEST_SALT: &str = "(^_^)";

/// Reads and writes the persisted [`ServerMap`] of one cluster.
#[derive(Clone, Debug)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// A store backed by the file at `path`. Nothing is touched until the first load or store.
    pub fn new<P: Into<PathBuf>>(path: P) -> StateStore {
        StateStore { path: path.into() }
    }

    /// Location of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted map.
    ///
    /// A missing file and a file that fails the integrity check both yield `None`; the latter is
    /// logged. Other read failures are returned.
    pub fn load(&self) -> Result<Option<ServerMap>, Error> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };

        match decode(&data) {
            Ok(map) => {
                debug!(path = %self.path.display(), "loaded persisted server map");
                Ok(Some(map))
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "discarding persisted server map");
                Ok(None)
            }
        }
    }

    /// Replaces the persisted map with `map`.
    ///
    /// Missing parent directories are created owner-only. The file is rewritten in place under an
    /// exclusive advisory lock.
    pub fn store(&self, map: &ServerMap) -> Result<(), Error> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                create_state_dir(dir)?;
            }
        }

        let payload = bincode::serialize(map)
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        let digest = digest(&payload);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        file.lock_exclusive()?;

        let written = write_locked(&mut file, digest.as_bytes(), &payload);
        let unlocked = FileExt::unlock(&file);
        written?;
        unlocked?;

        debug!(path = %self.path.display(), bytes = DIGEST_LEN + payload.len(), "persisted server map");
        Ok(())
    }
}

/// Persistence consulted whenever the server map is recomputed.
pub(crate) trait MapStore {
    fn load(&self) -> Result<Option<ServerMap>, Error>;
    fn store(&self, map: &ServerMap) -> Result<(), Error>;
}

impl MapStore for StateStore {
    fn load(&self) -> Result<Option<ServerMap>, Error> {
        StateStore::load(self)
    }

    fn store(&self, map: &ServerMap) -> Result<(), Error> {
        StateStore::store(self, map)
    }
}

fn write_locked(file: &mut File, digest: &[u8], payload: &[u8]) -> io::Result<()> {
    file.set_len(0)?;
    file.write_all(digest)?;
    file.write_all(payload)?;
    file.sync_data()
}

#[cfg(unix)]
fn create_state_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_state_dir(dir: &Path) -> io::Result<()> {
    fs::DirBuilder::new().recursive(true).create(dir)
}

fn digest(payload: &[u8]) -> String {
    let inner = format!("{:x}", md5::compute(payload));
    format!("{:x}", md5::compute(format!("{}{}", inner, DIGEST_SALT)))
}

fn decode(data: &[u8]) -> Result<ServerMap, Error> {
    if data.len() < DIGEST_LEN {
        return Err(Error::CorruptState(format!(
            "file too short ({} bytes)",
            data.len()
        )));
    }

    let (expected, payload) = data.split_at(DIGEST_LEN);
    if digest(payload).as_bytes() != expected {
        return Err(Error::CorruptState("digest mismatch".to_string()));
    }

    let map: ServerMap = bincode::deserialize(payload)
        .map_err(|e| Error::CorruptState(format!("undecodable payload: {}", e)))?;
    if !map.is_consistent() {
        return Err(Error::CorruptState("inconsistent server map".to_string()));
    }

    Ok(map)
}
