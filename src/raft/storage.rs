use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::state::HardState;
use super::RaftError;

const STATE_FILE: &str = "state.bin";

/// Durable home of `currentTerm` and `votedFor`.
pub struct HardStateStore {
    path: PathBuf,
}

impl HardStateStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, RaftError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(STATE_FILE),
        })
    }

    /// Reads the stored state, or the zero state if nothing was ever saved.
    pub fn load(&self) -> Result<HardState, RaftError> {
        if !self.path.exists() {
            return Ok(HardState::default());
        }

        let mut buffer = Vec::new();
        File::open(&self.path)?.read_to_end(&mut buffer)?;

        let (state, _): (HardState, usize) =
            bincode::serde::decode_from_slice(&buffer, bincode::config::standard())
                .map_err(|e| RaftError::Corrupt(format!("{}: {e}", self.path.display())))?;

        Ok(state)
    }

    /// Replaces the stored state. The new contents are synced before the rename,
    /// so a crash leaves either the old or the new state on disk.
    pub fn save(&self, state: &HardState) -> Result<(), RaftError> {
        let encoded = bincode::serde::encode_to_vec(state, bincode::config::standard())
            .map_err(|e| RaftError::SerializationError(e.to_string()))?;

        let tmp = self.path.with_extension("bin.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        Ok(())
    }
}
