//! Shared rendezvous board
//!
//! Two monotonic arrival counters (discovery and completion), a port slot
//! per worker ordinal, and a word used to hand the monitor's listen port
//! to whoever launched it. Increments happen under an exclusive lock;
//! counter reads used for polling are not locked.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use nix::fcntl::{Flock, FlockArg};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Rendezvous phase, indexes the arrival counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Discovery = 0,
    Completion = 1,
}

/// Storage shared by every worker of one cluster
pub trait Board: Send + Sync {
    /// Number of port slots (the cluster size)
    fn capacity(&self) -> usize;

    /// Count this worker as arrived, optionally publishing `(ordinal, port)`
    ///
    /// Returns the counter value after the increment.
    fn arrive(&self, phase: Phase, slot: Option<(usize, u16)>) -> Result<u64>;

    /// Current arrival count, read without the lock
    fn arrivals(&self, phase: Phase) -> Result<u64>;

    /// Every slot in ordinal order; zero means not yet published
    fn ports(&self) -> Result<Vec<u16>>;

    fn publish_monitor_port(&self, port: u16) -> Result<()>;

    fn monitor_port(&self) -> Result<Option<u16>>;
}

fn check_slot(capacity: usize, ordinal: usize) -> Result<()> {
    if ordinal >= capacity {
        return Err(Error::config_field_invalid(
            "ordinal",
            format!("ordinal {} out of range for {} workers", ordinal, capacity),
        ));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// In-Memory Board
// ─────────────────────────────────────────────────────────────────

/// Board for workers running as tasks in one process
pub struct MemoryBoard {
    lock: Mutex<()>,
    counters: [AtomicU64; 2],
    monitor_port: AtomicU64,
    slots: Vec<AtomicU64>,
}

impl MemoryBoard {
    pub fn new(capacity: usize) -> Self {
        Self {
            lock: Mutex::new(()),
            counters: [AtomicU64::new(0), AtomicU64::new(0)],
            monitor_port: AtomicU64::new(0),
            slots: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

impl Board for MemoryBoard {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn arrive(&self, phase: Phase, slot: Option<(usize, u16)>) -> Result<u64> {
        let _guard = self.lock.lock();
        if let Some((ordinal, port)) = slot {
            check_slot(self.slots.len(), ordinal)?;
            self.slots[ordinal].store(port as u64, Ordering::Release);
        }
        Ok(self.counters[phase as usize].fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn arrivals(&self, phase: Phase) -> Result<u64> {
        Ok(self.counters[phase as usize].load(Ordering::Acquire))
    }

    fn ports(&self) -> Result<Vec<u16>> {
        Ok(self
            .slots
            .iter()
            .map(|s| s.load(Ordering::Acquire) as u16)
            .collect())
    }

    fn publish_monitor_port(&self, port: u16) -> Result<()> {
        self.monitor_port.store(port as u64, Ordering::Release);
        Ok(())
    }

    fn monitor_port(&self) -> Result<Option<u16>> {
        Ok(match self.monitor_port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port as u16),
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// File-Backed Board
// ─────────────────────────────────────────────────────────────────

const WORD: u64 = 8;
const MONITOR_PORT_OFFSET: u64 = 2 * WORD;
const SLOTS_OFFSET: u64 = 3 * WORD;

/// Board shared between processes through a fixed-layout file
///
/// Layout: `[discovery u64][completion u64][monitor_port u64][slot u64 × N]`,
/// little-endian. Read-modify-write sections hold an exclusive `flock`.
pub struct FileBoard {
    path: PathBuf,
    file: File,
    capacity: usize,
}

impl FileBoard {
    /// Size in bytes of a board for `capacity` workers
    pub fn file_len(capacity: usize) -> u64 {
        SLOTS_OFFSET + WORD * capacity as u64
    }

    /// Create (or reset) a zeroed board file
    pub fn create(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| Error::IoWrite {
                path: path.clone(),
                source,
            })?;
        let zeros = vec![0u8; Self::file_len(capacity) as usize];
        file.write_all_at(&zeros, 0)
            .map_err(|source| Error::IoWrite {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            file,
            capacity,
        })
    }

    /// Open an existing board, checking it matches the cluster size
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| Error::IoRead {
                path: path.clone(),
                source,
            })?;
        let len = file
            .metadata()
            .map_err(|source| Error::IoRead {
                path: path.clone(),
                source,
            })?
            .len();
        if len != Self::file_len(capacity) {
            return Err(Error::config_field_invalid(
                "board",
                format!(
                    "{} is {} bytes, expected {} for {} workers",
                    path.display(),
                    len,
                    Self::file_len(capacity),
                    capacity
                ),
            ));
        }
        Ok(Self {
            path,
            file,
            capacity,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_word(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.file
            .read_exact_at(&mut buf, offset)
            .map_err(|source| Error::IoRead {
                path: self.path.clone(),
                source,
            })?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_word(&self, offset: u64, value: u64) -> Result<()> {
        self.file
            .write_all_at(&value.to_le_bytes(), offset)
            .map_err(|source| Error::IoWrite {
                path: self.path.clone(),
                source,
            })
    }

    /// Run `f` while holding an exclusive lock on the file
    fn locked<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let handle = self.file.try_clone()?;
        let lock = Flock::lock(handle, FlockArg::LockExclusive)
            .map_err(|(_, errno)| Error::Io(std::io::Error::from(errno)))?;
        let result = f();
        drop(lock);
        result
    }
}

impl Board for FileBoard {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn arrive(&self, phase: Phase, slot: Option<(usize, u16)>) -> Result<u64> {
        self.locked(|| {
            if let Some((ordinal, port)) = slot {
                check_slot(self.capacity, ordinal)?;
                self.write_word(SLOTS_OFFSET + WORD * ordinal as u64, port as u64)?;
            }
            let offset = WORD * phase as u64;
            let count = self.read_word(offset)? + 1;
            self.write_word(offset, count)?;
            Ok(count)
        })
    }

    fn arrivals(&self, phase: Phase) -> Result<u64> {
        self.read_word(WORD * phase as u64)
    }

    fn ports(&self) -> Result<Vec<u16>> {
        (0..self.capacity)
            .map(|i| self.read_word(SLOTS_OFFSET + WORD * i as u64).map(|p| p as u16))
            .collect()
    }

    fn publish_monitor_port(&self, port: u16) -> Result<()> {
        self.locked(|| self.write_word(MONITOR_PORT_OFFSET, port as u64))
    }

    fn monitor_port(&self) -> Result<Option<u16>> {
        Ok(match self.read_word(MONITOR_PORT_OFFSET)? {
            0 => None,
            port => Some(port as u16),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn exercise(board: &dyn Board) {
        assert_eq!(board.arrivals(Phase::Discovery).unwrap(), 0);
        assert_eq!(board.arrive(Phase::Discovery, Some((0, 4000))).unwrap(), 1);
        assert_eq!(board.arrive(Phase::Discovery, Some((2, 4002))).unwrap(), 2);
        assert_eq!(board.arrivals(Phase::Discovery).unwrap(), 2);
        assert_eq!(board.arrivals(Phase::Completion).unwrap(), 0);
        assert_eq!(board.ports().unwrap(), vec![4000, 0, 4002]);

        assert_eq!(board.arrive(Phase::Completion, None).unwrap(), 1);
        assert_eq!(board.ports().unwrap(), vec![4000, 0, 4002]);

        assert!(board.arrive(Phase::Discovery, Some((3, 1))).is_err());

        assert_eq!(board.monitor_port().unwrap(), None);
        board.publish_monitor_port(5555).unwrap();
        assert_eq!(board.monitor_port().unwrap(), Some(5555));
    }

    #[test]
    fn test_memory_board() {
        exercise(&MemoryBoard::new(3));
    }

    #[test]
    fn test_file_board() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.board");
        let board = FileBoard::create(&path, 3).unwrap();
        exercise(&board);

        // a second handle sees the same state
        let other = FileBoard::open(&path, 3).unwrap();
        assert_eq!(other.arrivals(Phase::Discovery).unwrap(), 2);
        assert_eq!(other.monitor_port().unwrap(), Some(5555));
    }

    #[test]
    fn test_file_board_rejects_wrong_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.board");
        FileBoard::create(&path, 2).unwrap();
        assert!(FileBoard::open(&path, 4).is_err());
    }

    #[test]
    fn test_concurrent_arrivals_are_counted_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.board");
        FileBoard::create(&path, 8).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let board = FileBoard::open(&path, 8).unwrap();
                    board.arrive(Phase::Discovery, Some((i, 5000 + i as u16))).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let board: Arc<dyn Board> = Arc::new(FileBoard::open(&path, 8).unwrap());
        assert_eq!(board.arrivals(Phase::Discovery).unwrap(), 8);
        let ports = board.ports().unwrap();
        assert_eq!(ports, (0..8).map(|i| 5000 + i as u16).collect::<Vec<_>>());
    }
}
