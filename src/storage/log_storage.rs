use crate::raft::types::{LogEntry, LogIndex};
use crate::util::errors::{RaftError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

/// Trait for persistent log storage. Indices are 1-based.
pub trait LogStorage: Send {
    /// Append entries after the current last index
    fn append(&mut self, entries: &[LogEntry]) -> Result<()>;
    /// Remove the entry at `from_index` and everything after it
    fn truncate(&mut self, from_index: LogIndex) -> Result<()>;
    /// Every stored entry, in order
    fn entries(&self) -> Result<Vec<LogEntry>>;
    fn last_index(&self) -> LogIndex;
}

/// File-based log storage implementation using bincode
pub struct FileLogStorage {
    data_dir: PathBuf,
    logs: Vec<LogEntry>,
}

impl FileLogStorage {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        fs::create_dir_all(&data_dir)?;

        let mut storage = Self {
            data_dir,
            logs: Vec::new(),
        };

        storage.load_from_disk()?;

        Ok(storage)
    }

    fn log_file_path(&self) -> PathBuf {
        self.data_dir.join("raft_logs.bin")
    }

    fn load_from_disk(&mut self) -> Result<()> {
        let log_path = self.log_file_path();

        if !log_path.exists() {
            return Ok(());
        }

        let mut file = File::open(&log_path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        if buffer.is_empty() {
            return Ok(());
        }

        // Refuse to start on an undecodable log
        self.logs = bincode::deserialize(&buffer).map_err(|e| {
            RaftError::StorageError(format!("{} is corrupt: {}", log_path.display(), e))
        })?;
        tracing::info!("Loaded {} log entries from disk", self.logs.len());

        Ok(())
    }

    fn save_to_disk(&self) -> Result<()> {
        let log_path = self.log_file_path();
        let encoded = bincode::serialize(&self.logs)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&log_path)?;

        file.write_all(&encoded)?;
        file.sync_all()?;

        Ok(())
    }
}

impl LogStorage for FileLogStorage {
    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        self.logs.extend_from_slice(entries);
        self.save_to_disk()
    }

    fn truncate(&mut self, from_index: LogIndex) -> Result<()> {
        if from_index == 0 {
            return Ok(());
        }

        let truncate_pos = (from_index - 1) as usize;

        if truncate_pos < self.logs.len() {
            self.logs.truncate(truncate_pos);
            self.save_to_disk()?;
        }

        Ok(())
    }

    fn entries(&self) -> Result<Vec<LogEntry>> {
        Ok(self.logs.clone())
    }

    fn last_index(&self) -> LogIndex {
        self.logs.len() as LogIndex
    }
}

/// Volatile log storage for tests and throwaway clusters
#[derive(Debug, Default)]
pub struct MemLogStorage {
    logs: Vec<LogEntry>,
}

impl MemLogStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStorage for MemLogStorage {
    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.logs.extend_from_slice(entries);
        Ok(())
    }

    fn truncate(&mut self, from_index: LogIndex) -> Result<()> {
        if from_index > 0 {
            self.logs.truncate((from_index - 1) as usize);
        }
        Ok(())
    }

    fn entries(&self) -> Result<Vec<LogEntry>> {
        Ok(self.logs.clone())
    }

    fn last_index(&self) -> LogIndex {
        self.logs.len() as LogIndex
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_truncate() {
        let temp_dir = TempDir::new().unwrap();
        let mut storage = FileLogStorage::new(temp_dir.path().to_path_buf()).unwrap();

        let entries = vec![
            LogEntry::new(1, vec![1, 2, 3]),
            LogEntry::new(1, vec![4, 5, 6]),
            LogEntry::new(2, vec![7]),
        ];

        storage.append(&entries).unwrap();
        assert_eq!(storage.last_index(), 3);

        storage.truncate(2).unwrap();
        assert_eq!(storage.entries().unwrap(), entries[..1].to_vec());
    }

    #[test]
    fn test_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().to_path_buf();

        {
            let mut storage = FileLogStorage::new(path.clone()).unwrap();
            storage.append(&[LogEntry::new(1, b"x".to_vec())]).unwrap();
        }

        // Reload from disk
        let storage = FileLogStorage::new(path).unwrap();
        assert_eq!(storage.last_index(), 1);
        assert_eq!(storage.entries().unwrap()[0].data, b"x".to_vec());
    }

    #[test]
    fn test_corrupt_log_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("raft_logs.bin"), [0xff, 0xff, 0xff]).unwrap();

        assert!(FileLogStorage::new(temp_dir.path().to_path_buf()).is_err());
    }
}
