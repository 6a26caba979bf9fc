use crate::raft::types::{NodeId, Term};
use crate::util::errors::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

/// Persistent state that must survive crashes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    /// Latest term server has seen (initialized to 0)
    pub current_term: Term,
    /// Candidate that received vote in current term (or None)
    pub voted_for: Option<NodeId>,
}

/// Trait for persistent term/vote storage
pub trait StateStorage: Send {
    fn save_state(&mut self, state: &PersistentState) -> Result<()>;
    fn load_state(&self) -> Result<PersistentState>;
}

/// File-based state storage implementation
pub struct FileStateStorage {
    data_dir: PathBuf,
    state: PersistentState,
}

impl FileStateStorage {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        fs::create_dir_all(&data_dir)?;

        let mut storage = Self {
            data_dir,
            state: PersistentState::default(),
        };

        storage.state = storage.load_from_disk()?;

        Ok(storage)
    }

    fn state_file_path(&self) -> PathBuf {
        self.data_dir.join("raft_state.bin")
    }

    fn load_from_disk(&self) -> Result<PersistentState> {
        let state_path = self.state_file_path();

        if !state_path.exists() {
            return Ok(PersistentState::default());
        }

        let mut file = File::open(&state_path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        if buffer.is_empty() {
            return Ok(PersistentState::default());
        }

        let state: PersistentState = bincode::deserialize(&buffer)?;

        tracing::info!(
            "Loaded persistent state: term={}, voted_for={:?}",
            state.current_term,
            state.voted_for
        );

        Ok(state)
    }

    fn save_to_disk(&self) -> Result<()> {
        let state_path = self.state_file_path();
        let encoded = bincode::serialize(&self.state)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&state_path)?;

        file.write_all(&encoded)?;
        file.sync_all()?;

        Ok(())
    }
}

impl StateStorage for FileStateStorage {
    fn save_state(&mut self, state: &PersistentState) -> Result<()> {
        if &self.state == state {
            return Ok(());
        }
        self.state = state.clone();
        self.save_to_disk()
    }

    fn load_state(&self) -> Result<PersistentState> {
        Ok(self.state.clone())
    }
}

/// Volatile term/vote storage for tests and throwaway clusters
#[derive(Debug, Default)]
pub struct MemStateStorage {
    state: PersistentState,
}

impl MemStateStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStorage for MemStateStorage {
    fn save_state(&mut self, state: &PersistentState) -> Result<()> {
        self.state = state.clone();
        Ok(())
    }

    fn load_state(&self) -> Result<PersistentState> {
        Ok(self.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_state() {
        let temp_dir = TempDir::new().unwrap();
        let mut storage = FileStateStorage::new(temp_dir.path().to_path_buf()).unwrap();

        let state = PersistentState {
            current_term: 5,
            voted_for: Some(2),
        };
        storage.save_state(&state).unwrap();
        assert_eq!(storage.load_state().unwrap(), state);
    }

    #[test]
    fn test_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().to_path_buf();

        {
            let mut storage = FileStateStorage::new(path.clone()).unwrap();
            storage
                .save_state(&PersistentState {
                    current_term: 10,
                    voted_for: Some(2),
                })
                .unwrap();
        }

        // Reload from disk
        let storage = FileStateStorage::new(path).unwrap();
        let state = storage.load_state().unwrap();
        assert_eq!(state.current_term, 10);
        assert_eq!(state.voted_for, Some(2));
    }

    #[test]
    fn test_fresh_node_has_not_voted() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStateStorage::new(temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(storage.load_state().unwrap(), PersistentState::default());
    }
}
