use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::base::{LockId, LockKey};
use crate::config::DbConfig;
use crate::wire::{
    CommandKind, LOCK_FLAG_SHOW_WHEN_LOCKED, LOCK_FLAG_UPDATE_WHEN_LOCKED, LockCommand,
    LockResult, ResultCode, UNLOCK_FLAG_UNLOCK_CURRENT,
};

use super::{LockDb, ResultSink};

struct MockSink {
    results: Mutex<Vec<LockResult>>,
}

impl MockSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(Vec::new()),
        })
    }

    fn results(&self) -> Vec<LockResult> {
        self.results.lock().clone()
    }

    fn wait_results(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.results.lock().len() >= n {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }
}

impl ResultSink for MockSink {
    fn deliver(&self, result: LockResult, _reused_from_caller: bool) {
        self.results.lock().push(result);
    }

    fn peer(&self) -> String {
        "mock".to_string()
    }
}

fn test_db() -> Arc<LockDb> {
    LockDb::new(0, DbConfig::for_testing(), None)
}

fn key(byte: u8) -> LockKey {
    LockKey([byte; 16])
}

fn id(byte: u8) -> LockId {
    LockId([byte; 16])
}

/// A key whose fast-index word is exactly `word`, so tests can steer two
/// keys into the same slot.
fn key_with_word(discriminator: u8, word: u64) -> LockKey {
    let mut bytes = [discriminator; 16];
    bytes[8..16].copy_from_slice(&word.to_le_bytes());
    LockKey(bytes)
}

fn lock_command(
    lock_key: LockKey,
    lock_id: LockId,
    timeout: u16,
    expried: u16,
    count: u16,
    rcount: u8,
) -> LockCommand {
    LockCommand {
        kind: CommandKind::Lock,
        request_id: crate::base::RequestId([0xee; 16]),
        flag: 0,
        db_id: 0,
        lock_id,
        lock_key,
        timeout,
        timeout_flag: 0,
        expried,
        expried_flag: 0,
        count,
        rcount,
        is_aof: false,
    }
}

fn unlock_command(lock_key: LockKey, lock_id: LockId, rcount: u8) -> LockCommand {
    let mut command = lock_command(lock_key, lock_id, 0, 0, 0, rcount);
    command.kind = CommandKind::Unlock;
    command
}

/// Quiescent invariants: per-manager holder sums, and the key counter
/// matching the number of live managers.
fn check_quiescent_invariants(db: &LockDb) {
    let mut live = 0u32;
    for shard_mutex in &db.shards {
        let shard = shard_mutex.lock();
        for state in shard.live_managers() {
            let sum: u16 = state
                .holders
                .iter()
                .map(|&slot| shard.lock(slot).locked as u16)
                .sum();
            assert_eq!(state.locked, sum, "holder sum mismatch for {:?}", state.lock_key);
            live += 1;
        }
    }
    assert_eq!(
        db.counters.key_count.load(Ordering::Relaxed),
        live,
        "key count does not match live managers"
    );
}

#[test]
fn test_basic_lock_unlock() {
    let db = test_db();
    let sink = MockSink::new();

    db.lock(sink.clone(), lock_command(key(0x01), id(0x11), 5, 5, 0, 0));
    let results = sink.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result, ResultCode::Succeed);
    assert_eq!(results[0].lcount, 1);

    db.unlock(sink.clone(), unlock_command(key(0x01), id(0x11), 0));
    let results = sink.results();
    assert_eq!(results.len(), 2);
    assert_eq!(results[1].result, ResultCode::Succeed);
    assert_eq!(results[1].lcount, 0);

    let state = db.state();
    assert_eq!(state.lock_count, 1);
    assert_eq!(state.unlock_count, 1);
    assert_eq!(state.locked_count, 0);

    // the record drains out of the expiry wheel, then the key goes
    thread::sleep(Duration::from_secs(4));
    assert_eq!(db.state().key_count, 0);
    for shard in &db.shards {
        assert_eq!(shard.lock().live_locks(), 0, "no record may outlive its wheel entries");
    }
    check_quiescent_invariants(&db);
    db.stop();
}

#[test]
fn test_reentry_depth_and_release() {
    let db = test_db();
    let sink = MockSink::new();
    let k = key(0x02);

    db.lock(sink.clone(), lock_command(k, id(0x11), 5, 5, 0, 2));
    db.lock(sink.clone(), lock_command(k, id(0x11), 5, 5, 0, 2));
    let results = sink.results();
    assert_eq!(results[0].lcount, 1);
    assert_eq!(results[1].result, ResultCode::Succeed);
    assert_eq!(results[1].lcount, 2);

    db.unlock(sink.clone(), unlock_command(k, id(0x11), 1));
    db.unlock(sink.clone(), unlock_command(k, id(0x11), 0));
    let results = sink.results();
    assert_eq!(results[2].lcount, 1);
    assert_eq!(results[3].lcount, 0);
    assert_eq!(db.state().locked_count, 0);
    db.stop();
}

#[test]
fn test_reentry_rejected_past_rcount() {
    let db = test_db();
    let sink = MockSink::new();
    let k = key(0x03);

    db.lock(sink.clone(), lock_command(k, id(0x11), 5, 5, 0, 0));
    db.lock(sink.clone(), lock_command(k, id(0x11), 0, 5, 0, 0));
    let results = sink.results();
    assert_eq!(results[0].result, ResultCode::Succeed);
    // depth 1 already exceeds rcount 0
    assert_eq!(results[1].result, ResultCode::LockedError);
    db.stop();
}

#[test]
fn test_shared_holders_via_count() {
    let db = test_db();
    let sink = MockSink::new();
    let k = key(0x04);

    db.lock(sink.clone(), lock_command(k, id(0x11), 5, 5, 1, 0));
    db.lock(sink.clone(), lock_command(k, id(0x22), 5, 5, 1, 0));
    db.lock(sink.clone(), lock_command(k, id(0x33), 0, 5, 1, 0));
    let results = sink.results();
    assert_eq!(results[0].result, ResultCode::Succeed);
    assert_eq!(results[1].result, ResultCode::Succeed);
    assert_eq!(results[1].lcount, 2);
    assert_eq!(results[2].result, ResultCode::Timeout);
    db.stop();
}

#[test]
fn test_wait_then_wake_on_unlock() {
    let db = test_db();
    let holder = MockSink::new();
    let waiter = MockSink::new();
    let k = key(0x05);

    db.lock(holder.clone(), lock_command(k, id(0x11), 5, 10, 0, 0));
    db.lock(waiter.clone(), lock_command(k, id(0x22), 30, 10, 0, 0));
    thread::sleep(Duration::from_millis(100));
    assert!(waiter.results().is_empty(), "waiter must not be answered yet");
    assert_eq!(db.state().wait_count, 1);

    db.unlock(holder.clone(), unlock_command(k, id(0x11), 0));
    // the wake cascade answers the waiter before unlock returns
    let results = waiter.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result, ResultCode::Succeed);
    assert_eq!(results[0].lcount, 1);
    assert_eq!(db.state().wait_count, 0);
    db.stop();
}

#[test]
fn test_waiter_times_out() {
    let db = test_db();
    let holder = MockSink::new();
    let waiter = MockSink::new();
    let k = key(0x06);

    db.lock(holder.clone(), lock_command(k, id(0x11), 5, 100, 0, 0));
    db.lock(waiter.clone(), lock_command(k, id(0x22), 1, 10, 0, 0));

    assert!(waiter.wait_results(1, Duration::from_secs(4)));
    let results = waiter.results();
    assert_eq!(results[0].result, ResultCode::Timeout);
    assert_eq!(db.state().timeouted_count, 1);
    // the holder is untouched
    assert_eq!(db.state().locked_count, 1);
    db.stop();
}

#[test]
fn test_holder_expires_and_wakes_waiter() {
    let db = test_db();
    let holder = MockSink::new();
    let waiter = MockSink::new();
    let k = key(0x07);

    db.lock(holder.clone(), lock_command(k, id(0x11), 5, 1, 0, 0));
    db.lock(waiter.clone(), lock_command(k, id(0x22), 30, 10, 0, 0));

    assert!(holder.wait_results(2, Duration::from_secs(4)));
    let results = holder.results();
    assert_eq!(results[1].result, ResultCode::Expried);
    let results = waiter.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result, ResultCode::Succeed);
    assert_eq!(db.state().expried_count, 1);
    db.stop();
}

#[test]
fn test_fire_and_forget_never_raises_locked_count() {
    let db = test_db();
    let sink = MockSink::new();

    db.lock(sink.clone(), lock_command(key(0x08), id(0x11), 0, 0, 0, 0));
    let results = sink.results();
    assert_eq!(results[0].result, ResultCode::Succeed);
    assert_eq!(db.state().locked_count, 0);
    assert_eq!(db.state().lock_count, 1);
    // nothing was held, so the key is reclaimed on the spot
    assert_eq!(db.state().key_count, 0);
    db.stop();
}

#[test]
fn test_show_current_holder() {
    let db = test_db();
    let sink = MockSink::new();
    let k = key(0x09);

    db.lock(sink.clone(), lock_command(k, id(0x11), 5, 10, 3, 2));
    let mut query = lock_command(k, id(0x22), 5, 5, 0, 0);
    query.flag = LOCK_FLAG_SHOW_WHEN_LOCKED;
    db.lock(sink.clone(), query);

    let results = sink.results();
    assert_eq!(results[1].result, ResultCode::UnownError);
    // the reply names the actual holder
    assert_eq!(results[1].lock_id, id(0x11));
    assert_eq!(results[1].count, 3);
    assert_eq!(results[1].rcount, 2);
    db.stop();
}

#[test]
fn test_refresh_is_idempotent() {
    let db = test_db();
    let sink = MockSink::new();
    let k = key(0x0a);

    db.lock(sink.clone(), lock_command(k, id(0x11), 5, 10, 0, 0));
    for _ in 0..2 {
        let mut refresh = lock_command(k, id(0x11), 5, 10, 0, 0);
        refresh.flag = LOCK_FLAG_UPDATE_WHEN_LOCKED;
        db.lock(sink.clone(), refresh);
    }
    let results = sink.results();
    assert_eq!(results[1].result, ResultCode::Succeed);
    assert_eq!(results[2].result, ResultCode::Succeed);
    assert_eq!(results[1].lcount, results[2].lcount);
    assert_eq!(db.state().locked_count, 1);
    assert_eq!(db.state().lock_count, 1, "refresh is not a grant");
    db.stop();
}

#[test]
fn test_unlock_errors() {
    let db = test_db();
    let sink = MockSink::new();

    // nothing under this key at all
    db.unlock(sink.clone(), unlock_command(key(0x0b), id(0x11), 0));
    // held, but by someone else
    db.lock(sink.clone(), lock_command(key(0x0c), id(0x11), 5, 10, 0, 0));
    db.unlock(sink.clone(), unlock_command(key(0x0c), id(0x22), 0));

    let results = sink.results();
    assert_eq!(results[0].result, ResultCode::UnlockError);
    assert_eq!(results[2].result, ResultCode::UnownError);
    assert_eq!(db.state().unlock_error_count, 2);
    db.stop();
}

#[test]
fn test_unlock_current_flag_adopts_holder() {
    let db = test_db();
    let sink = MockSink::new();
    let k = key(0x0d);

    db.lock(sink.clone(), lock_command(k, id(0x11), 5, 10, 0, 0));
    let mut unlock = unlock_command(k, id(0x99), 0);
    unlock.flag = UNLOCK_FLAG_UNLOCK_CURRENT;
    db.unlock(sink.clone(), unlock);

    let results = sink.results();
    assert_eq!(results[1].result, ResultCode::Succeed);
    assert_eq!(results[1].lock_id, id(0x11));
    assert_eq!(db.state().locked_count, 0);
    db.stop();
}

#[test]
fn test_lock_then_unlock_restores_manager_state() {
    let db = test_db();
    let sink = MockSink::new();
    let k = key(0x0e);

    db.lock(sink.clone(), lock_command(k, id(0x11), 5, 5, 0, 0));
    db.unlock(sink.clone(), unlock_command(k, id(0x11), 0));
    db.lock(sink.clone(), lock_command(k, id(0x22), 5, 5, 0, 0));
    db.unlock(sink.clone(), unlock_command(k, id(0x22), 0));

    for result in sink.results() {
        assert_eq!(result.result, ResultCode::Succeed);
    }
    assert_eq!(db.state().locked_count, 0);
    check_quiescent_invariants(&db);
    db.stop();
}

#[test]
fn test_colliding_keys_stay_distinct() {
    let db = test_db();
    let sink = MockSink::new();
    // same fast-index slot under the 64-slot test capacity
    let k1 = key_with_word(0xa1, 7);
    let k2 = key_with_word(0xa2, 7 + 64);

    db.lock(sink.clone(), lock_command(k1, id(0x11), 5, 10, 0, 0));
    db.lock(sink.clone(), lock_command(k2, id(0x22), 5, 10, 0, 0));
    let results = sink.results();
    // distinct keys must not contend
    assert_eq!(results[0].result, ResultCode::Succeed);
    assert_eq!(results[1].result, ResultCode::Succeed);
    assert_eq!(results[1].lcount, 1);
    assert_eq!(db.index.lock().overflow_len(), 2);

    db.unlock(sink.clone(), unlock_command(k1, id(0x11), 0));
    db.unlock(sink.clone(), unlock_command(k2, id(0x22), 0));
    let results = sink.results();
    assert_eq!(results[2].result, ResultCode::Succeed);
    assert_eq!(results[3].result, ResultCode::Succeed);

    thread::sleep(Duration::from_secs(4));
    assert_eq!(db.state().key_count, 0);
    assert_eq!(db.index.lock().overflow_len(), 0);
    db.stop();
}

#[test]
fn test_resize_keeps_held_keys_reachable() {
    let db = test_db();
    let sink = MockSink::new();

    // spread over both future segments, including collider pairs
    let keys: Vec<LockKey> = (0u64..48)
        .map(|word| key_with_word(0xb0, word))
        .chain((0u64..48).map(|word| key_with_word(0xb1, word + 64)))
        .collect();
    for (i, k) in keys.iter().enumerate() {
        db.lock(sink.clone(), lock_command(*k, id(i as u8), 5, 30, 0, 0));
    }
    assert!(sink.results().iter().all(|r| r.result == ResultCode::Succeed));

    let capacity_before = db.index.lock().capacity();
    db.resize_index();
    assert_eq!(db.index.lock().capacity(), capacity_before * 2);

    for (i, k) in keys.iter().enumerate() {
        db.unlock(sink.clone(), unlock_command(*k, id(i as u8), 0));
    }
    let results = sink.results();
    assert!(
        results[keys.len()..]
            .iter()
            .all(|r| r.result == ResultCode::Succeed),
        "every key must stay reachable across the resize"
    );
    db.stop();
}

#[test]
fn test_resize_during_concurrent_traffic() {
    let db = test_db();

    let writer_db = db.clone();
    let writer = thread::spawn(move || {
        let sink = MockSink::new();
        for round in 0u64..200 {
            let k = key_with_word(0xc0, round % 96);
            let l = id((round % 250) as u8);
            writer_db.lock(sink.clone(), lock_command(k, l, 1, 1, 0, 0));
            writer_db.unlock(sink.clone(), unlock_command(k, l, 0));
        }
        sink.results()
    });
    let resizer_db = db.clone();
    let resizer = thread::spawn(move || {
        for _ in 0..2 {
            resizer_db.resize_index();
            thread::sleep(Duration::from_millis(50));
        }
    });

    let results = writer.join().unwrap();
    resizer.join().unwrap();
    // a lock and its unlock pair must never miss the manager
    for pair in results.chunks(2) {
        assert_eq!(pair[0].result, ResultCode::Succeed);
        assert_eq!(pair[1].result, ResultCode::Succeed);
    }

    thread::sleep(Duration::from_secs(4));
    check_quiescent_invariants(&db);
    db.stop();
}

#[test]
fn test_persistence_hook_records_grants_and_releases() {
    use crate::aof::{Aof, AofEventKind, replay_commands};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("warden.aof");

    let (aof, _) = Aof::open(&path).unwrap();
    let db = LockDb::new(0, DbConfig::for_testing(), Some(aof.clone()));
    let sink = MockSink::new();
    db.lock(sink.clone(), lock_command(key(0x21), id(0x11), 5, 10, 0, 0));
    db.unlock(sink.clone(), unlock_command(key(0x21), id(0x11), 0));
    db.stop();
    aof.close();

    let (_aof, events) = Aof::open(&path).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, AofEventKind::Grant);
    assert_eq!(events[1].kind, AofEventKind::Release);
    // a granted and released pair replays to nothing
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    assert!(replay_commands(events, now).is_empty());
}

#[test]
fn test_concurrent_churn_settles_clean() {
    use rand::Rng;

    let db = test_db();

    let mut workers = Vec::new();
    for worker in 0u8..8 {
        let db = db.clone();
        workers.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            let sink = MockSink::new();
            for _ in 0..50 {
                let k = key(rng.gen_range(1u8..=8));
                let l = LockId([worker + 1; 16]);
                let count = rng.gen_range(0u16..3);
                db.lock(sink.clone(), lock_command(k, l, 1, 1, count, 0));
                if rng.gen_bool(0.8) {
                    db.unlock(sink.clone(), unlock_command(k, l, 0));
                }
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    // everything outstanding either unlocked, timed out or expired
    thread::sleep(Duration::from_secs(5));
    let state = db.state();
    assert_eq!(state.locked_count, 0);
    assert_eq!(state.wait_count, 0);
    check_quiescent_invariants(&db);
    db.stop();
}
