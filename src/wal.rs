use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode one commit (a group of events that must become durable together)
/// to `[len][bincode][crc32]` format.
fn encode_commit(writer: &mut impl Write, events: &[Event]) -> io::Result<()> {
    let payload =
        bincode::serialize(events).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Vec<Event>][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - One entry holds one commit, so a multi-event operation (an escalation
///   preempting, shifting and inserting) survives a crash whole or not at
///   all: a truncated last entry is discarded via length-prefix + CRC check.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append a single commit and fsync. Used by tests only — production
    /// code uses `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, events: &[Event]) -> io::Result<()> {
        self.append_buffered(events)?;
        self.flush_sync()
    }

    /// Append one commit to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit everything
    /// buffered.
    pub fn append_buffered(&mut self, events: &[Event]) -> io::Result<()> {
        encode_commit(&mut self.writer, events)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted events to a temp file and fsync.
    /// This is the slow I/O phase — call OUTSIDE the WAL lock.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        // One commit per event keeps compact entries small and individually
        // recoverable.
        for event in events {
            encode_commit(&mut writer, std::slice::from_ref(event))?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    /// This is fast — call while holding the WAL lock.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replace the WAL with a minimal set of events that recreates the
    /// current state. Convenience method that does both phases. Used by tests.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all events of all valid commits
    /// in append order. Truncated/corrupt trailing entries are discarded
    /// whole — no commit is ever half-replayed.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();

        loop {
            // Read length prefix
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            // Read payload
            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            // Read CRC
            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            let stored_crc = u32::from_le_bytes(crc_buf);
            let computed_crc = crc32fast::hash(&payload);

            if stored_crc != computed_crc {
                // Corrupt entry — stop replaying
                break;
            }

            match bincode::deserialize::<Vec<Event>>(&payload) {
                Ok(commit) => events.extend(commit),
                Err(_) => break, // corrupt payload
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingStatus, CaseInfo, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("theatron_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(theater_id: Ulid, start: i64, end: i64) -> Event {
        Event::BookingCreated {
            id: Ulid::new(),
            theater_id,
            span: Span::new(start, end),
            status: BookingStatus::Scheduled,
            case: CaseInfo::default(),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let tid = Ulid::new();

        let events = vec![
            Event::TheaterCreated { id: tid, name: Some("OR-1".into()) },
            created(tid, 1000, 2000),
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(std::slice::from_ref(e)).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn multi_event_commit_replays_in_order() {
        let path = tmp_path("multi_event_commit.wal");
        let tid = Ulid::new();

        let commit = vec![
            created(tid, 0, 1000),
            created(tid, 1000, 2000),
            created(tid, 2000, 3000),
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&commit).unwrap();
            assert_eq!(wal.appends_since_compact(), 1); // one commit, one entry
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, commit);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let tid = Ulid::new();
        let event = Event::TheaterCreated { id: tid, name: None };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(std::slice::from_ref(&event)).unwrap();
        }

        // Append garbage to simulate a truncated second entry
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap(); // partial length + some bytes
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![event]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn torn_commit_discarded_whole() {
        let path = tmp_path("torn_commit.wal");
        let tid = Ulid::new();
        let first = vec![Event::TheaterCreated { id: tid, name: None }];
        let torn = vec![created(tid, 0, 1000), created(tid, 1000, 2000)];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
            wal.append(&torn).unwrap();
        }

        // Chop bytes off the tail so the second commit is incomplete.
        let full_len = fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(full_len - 5).unwrap();

        // Neither event of the torn commit may surface.
        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, first);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let events = vec![Event::TheaterDeleted { id: Ulid::new() }];

        // Manually write an entry with bad CRC
        {
            let payload = bincode::serialize(&events).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_reduces_wal() {
        let path = tmp_path("compact_reduce.wal");
        let tid = Ulid::new();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&[Event::TheaterCreated { id: tid, name: Some("OR-3".into()) }])
                .unwrap();
            // churn: create and cancel bookings
            for _ in 0..10 {
                let e = created(tid, 0, 500);
                let id = match &e {
                    Event::BookingCreated { id, .. } => *id,
                    _ => unreachable!(),
                };
                wal.append(&[e]).unwrap();
                wal.append(&[Event::BookingStatusChanged {
                    id,
                    theater_id: tid,
                    status: BookingStatus::Canceled,
                }])
                .unwrap();
            }
        }

        let before = fs::metadata(&path).unwrap().len();
        assert!(before > 0);

        // Compact: final state is just the theater (no bookings)
        let compacted = vec![Event::TheaterCreated { id: tid, name: Some("OR-3".into()) }];

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&compacted).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, compacted);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let tid = Ulid::new();
        let compacted = vec![Event::TheaterCreated { id: tid, name: None }];
        let new_event = created(tid, 1000, 2000);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&compacted).unwrap();
            wal.compact(&compacted).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(std::slice::from_ref(&new_event)).unwrap();
            assert_eq!(wal.appends_since_compact(), 1);
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0], compacted[0]);
        assert_eq!(replayed[1], new_event);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");

        let commits: Vec<Vec<Event>> = (0..5)
            .map(|_| vec![Event::TheaterCreated { id: Ulid::new(), name: None }])
            .collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for c in &commits {
                wal.append_buffered(c).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        let flat: Vec<Event> = commits.into_iter().flatten().collect();
        assert_eq!(replayed, flat);

        let _ = fs::remove_file(&path);
    }
}
