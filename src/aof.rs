//! # Append-Only File
//!
//! The persistence collaborator. The engine hands it one event per granted
//! lock with an expiry and one per successful unlock; a writer thread
//! appends them to the log as framed records. At boot the log is read back
//! and the surviving grants are replayed into the engine as synthesized
//! LOCK commands carrying `is_aof`, clamped to the seconds they still have
//! left.
//!
//! A record is a 12-byte prefix of crc64 checksum and body length, followed
//! by the bincode-encoded event. The file starts with an 8-byte magic. A
//! corrupt tail ends the read with a warning; everything before it is used.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use crc64::crc64;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::base::{LockId, LockKey, RequestId, WardenResult};
use crate::engine::ResultSink;
use crate::wire::{CommandKind, LockCommand, LockResult};

/// Magic number at the start of the log, as a first check for file
/// validation.
pub const AOF_MAGICNUM: &[u8; 8] = b"WARDNAOF";

const AOF_RECORD_PREFIX_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AofEventKind {
    Grant,
    Release,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AofEvent {
    pub kind: AofEventKind,
    pub db_id: u8,
    pub lock_key: LockKey,
    pub lock_id: LockId,
    pub count: u16,
    pub rcount: u8,
    /// Absolute expiry second for grants; unused for releases.
    pub expried_time: i64,
}

impl AofEvent {
    pub fn grant(db_id: u8, command: &LockCommand, expried_time: i64) -> Self {
        Self {
            kind: AofEventKind::Grant,
            db_id,
            lock_key: command.lock_key,
            lock_id: command.lock_id,
            count: command.count,
            rcount: command.rcount,
            expried_time,
        }
    }

    pub fn release(db_id: u8, command: &LockCommand) -> Self {
        Self {
            kind: AofEventKind::Release,
            db_id,
            lock_key: command.lock_key,
            lock_id: command.lock_id,
            count: command.count,
            rcount: command.rcount,
            expried_time: 0,
        }
    }
}

fn encode_record(event: &AofEvent) -> WardenResult<Vec<u8>> {
    let body = bincode::serialize(event)?;
    let mut buf = Vec::with_capacity(AOF_RECORD_PREFIX_SIZE + body.len());
    buf.extend_from_slice(&crc64(0, &body).to_le_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

fn read_events(path: &Path) -> WardenResult<Vec<AofEvent>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    if data.len() < AOF_MAGICNUM.len() {
        warn!(?path, "append-only file too short, ignoring");
        return Ok(Vec::new());
    }
    if &data[..AOF_MAGICNUM.len()] != AOF_MAGICNUM {
        warn!(?path, "append-only file has a bad magic number, ignoring");
        return Ok(Vec::new());
    }

    let mut events = Vec::new();
    let mut at = AOF_MAGICNUM.len();
    while at + AOF_RECORD_PREFIX_SIZE <= data.len() {
        let checksum = u64::from_le_bytes(data[at..at + 8].try_into().expect("eight bytes"));
        let len = u32::from_le_bytes(data[at + 8..at + 12].try_into().expect("four bytes")) as usize;
        at += AOF_RECORD_PREFIX_SIZE;
        if at + len > data.len() {
            warn!(?path, "append-only file ends mid-record, using records before it");
            break;
        }
        let body = &data[at..at + len];
        if crc64(0, body) != checksum {
            warn!(?path, "append-only file record checksum mismatch, using records before it");
            break;
        }
        match bincode::deserialize::<AofEvent>(body) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(?path, "could not decode append-only record: {}", e);
                break;
            }
        }
        at += len;
    }
    Ok(events)
}

/// Folds a grant/release history down to the grants still in force at
/// `now`, synthesized as replayable LOCK commands.
pub fn replay_commands(events: Vec<AofEvent>, now: i64) -> Vec<LockCommand> {
    let mut live: HashMap<(u8, LockKey, LockId), AofEvent> = HashMap::new();
    for event in events {
        let key = (event.db_id, event.lock_key, event.lock_id);
        match event.kind {
            AofEventKind::Grant => {
                live.insert(key, event);
            }
            AofEventKind::Release => {
                live.remove(&key);
            }
        }
    }

    let mut commands: Vec<LockCommand> = live
        .into_values()
        .filter(|event| event.expried_time > now)
        .map(|event| LockCommand {
            kind: CommandKind::Lock,
            request_id: RequestId::default(),
            flag: 0,
            db_id: event.db_id,
            lock_id: event.lock_id,
            lock_key: event.lock_key,
            timeout: 0,
            timeout_flag: 0,
            expried: (event.expried_time - now).min(u16::MAX as i64) as u16,
            expried_flag: 0,
            count: event.count,
            rcount: event.rcount,
            is_aof: true,
        })
        .collect();
    // stable replay order, mostly for tests
    commands.sort_by_key(|command| (command.db_id, command.lock_key.0, command.lock_id.0));
    commands
}

/// The collaborator handle the engine pushes events into.
pub struct Aof {
    tx: Mutex<Option<mpsc::Sender<AofEvent>>>,
    writer: Mutex<Option<thread::JoinHandle<()>>>,
    path: PathBuf,
}

impl Aof {
    /// Opens (or creates) the log, returning the handle and the events
    /// already on disk.
    pub fn open(path: impl Into<PathBuf>) -> WardenResult<(Arc<Self>, Vec<AofEvent>)> {
        let path = path.into();
        let events = read_events(&path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let needs_magic = file.metadata()?.len() == 0;
        let mut out = BufWriter::new(file);
        if needs_magic {
            out.write_all(AOF_MAGICNUM)?;
            out.flush()?;
        }

        let (tx, rx) = mpsc::channel::<AofEvent>();
        let writer_path = path.clone();
        let writer = thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                let record = match encode_record(&event) {
                    Ok(record) => record,
                    Err(e) => {
                        error!(path = ?writer_path, "could not encode append-only record: {}", e);
                        continue;
                    }
                };
                if let Err(e) = out.write_all(&record).and_then(|_| out.flush()) {
                    error!(path = ?writer_path, "could not append to append-only file: {}", e);
                }
            }
        });

        info!(?path, replayable = events.len(), "append-only file opened");
        Ok((
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
                writer: Mutex::new(Some(writer)),
                path,
            }),
            events,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hands an event to the writer thread. Never blocks the engine.
    pub fn push(&self, event: AofEvent) {
        if let Some(tx) = &*self.tx.lock() {
            if tx.send(event).is_err() {
                warn!("append-only writer is gone, dropping event");
            }
        }
    }

    /// Closes the channel and waits for the writer to drain.
    pub fn close(&self) {
        drop(self.tx.lock().take());
        if let Some(writer) = self.writer.lock().take() {
            let _ = writer.join();
        }
    }
}

/// Sink for replayed commands: results of a replay go nowhere.
pub struct DiscardSink;

impl ResultSink for DiscardSink {
    fn deliver(&self, _result: LockResult, _reused_from_caller: bool) {}

    fn peer(&self) -> String {
        "aof-replay".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> LockKey {
        LockKey([byte; 16])
    }

    fn id(byte: u8) -> LockId {
        LockId([byte; 16])
    }

    fn grant(db_id: u8, k: u8, l: u8, expried_time: i64) -> AofEvent {
        AofEvent {
            kind: AofEventKind::Grant,
            db_id,
            lock_key: key(k),
            lock_id: id(l),
            count: 0,
            rcount: 0,
            expried_time,
        }
    }

    fn release(db_id: u8, k: u8, l: u8) -> AofEvent {
        AofEvent {
            kind: AofEventKind::Release,
            db_id,
            lock_key: key(k),
            lock_id: id(l),
            count: 0,
            rcount: 0,
            expried_time: 0,
        }
    }

    #[test]
    fn test_append_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.aof");

        let (aof, events) = Aof::open(&path).unwrap();
        assert!(events.is_empty());
        aof.push(grant(0, 0x01, 0x11, 1000));
        aof.push(grant(0, 0x02, 0x22, 2000));
        aof.push(release(0, 0x01, 0x11));
        aof.close();

        let (_aof, events) = Aof::open(&path).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, AofEventKind::Grant);
        assert_eq!(events[2].kind, AofEventKind::Release);
    }

    #[test]
    fn test_corrupt_tail_keeps_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.aof");

        let (aof, _) = Aof::open(&path).unwrap();
        aof.push(grant(0, 0x01, 0x11, 1000));
        aof.close();

        // half a record prefix at the tail
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xde, 0xad, 0xbe]).unwrap();
        drop(file);

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_replay_folds_and_clamps() {
        let now = 100;
        let commands = replay_commands(
            vec![
                grant(0, 0x01, 0x11, now + 50), // survives
                grant(0, 0x02, 0x22, now + 50), // released below
                release(0, 0x02, 0x22),
                grant(1, 0x03, 0x33, now - 1), // already expired
            ],
            now,
        );
        assert_eq!(commands.len(), 1);
        let command = &commands[0];
        assert!(command.is_aof);
        assert_eq!(command.lock_key, key(0x01));
        assert_eq!(command.expried, 50);
        assert_eq!(command.timeout, 0);
    }
}
