use crate::base::{LockId, LockKey, RequestId};

use super::{CommandKind, FRAME_SIZE, LockCommand, MAGIC, ResultCode, StateCommand, VERSION};

/// Result of a LOCK or UNLOCK. `lcount` is the key's holder count after the
/// operation; the remaining fields echo the request (possibly rewritten, for
/// example when flag 0x01 adopts the current holder's lock id).
#[derive(Debug, Clone, Copy)]
pub struct LockResult {
    pub kind: CommandKind,
    pub request_id: RequestId,
    pub result: ResultCode,
    pub flag: u8,
    pub db_id: u8,
    pub lock_id: LockId,
    pub lock_key: LockKey,
    pub lcount: u16,
    pub count: u16,
    pub rcount: u8,
}

impl LockResult {
    pub fn of(command: &LockCommand, result: ResultCode, lcount: u16) -> Self {
        Self {
            kind: command.kind,
            request_id: command.request_id,
            result,
            flag: 0,
            db_id: command.db_id,
            lock_id: command.lock_id,
            lock_key: command.lock_key,
            lcount,
            count: command.count,
            rcount: command.rcount,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = MAGIC;
        buf[1] = VERSION;
        buf[2] = self.kind.into();
        buf[3..19].copy_from_slice(&self.request_id.0);
        buf[19] = self.result.into();
        buf[20] = self.flag;
        buf[21] = self.db_id;
        buf[22..38].copy_from_slice(&self.lock_id.0);
        buf[38..54].copy_from_slice(&self.lock_key.0);
        buf[54..56].copy_from_slice(&self.lcount.to_le_bytes());
        buf[56..58].copy_from_slice(&self.count.to_le_bytes());
        buf[58] = self.rcount;
        buf
    }

    /// Used by tests and by clients of the crate; the server never reads
    /// result frames.
    pub fn decode(buf: &[u8; FRAME_SIZE]) -> Option<Self> {
        Some(Self {
            kind: CommandKind::try_from(buf[2]).ok()?,
            request_id: RequestId(buf[3..19].try_into().expect("sixteen bytes")),
            result: ResultCode::try_from(buf[19]).ok()?,
            flag: buf[20],
            db_id: buf[21],
            lock_id: LockId(buf[22..38].try_into().expect("sixteen bytes")),
            lock_key: LockKey(buf[38..54].try_into().expect("sixteen bytes")),
            lcount: u16::from_le_bytes([buf[54], buf[55]]),
            count: u16::from_le_bytes([buf[56], buf[57]]),
            rcount: buf[58],
        })
    }
}

/// Result of an INIT. `init_type` is 1 when the client id was already
/// registered (a reconnect), else 0.
#[derive(Debug, Clone, Copy)]
pub struct InitResult {
    pub request_id: RequestId,
    pub result: ResultCode,
    pub init_type: u8,
}

impl InitResult {
    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = MAGIC;
        buf[1] = VERSION;
        buf[2] = CommandKind::Init.into();
        buf[3..19].copy_from_slice(&self.request_id.0);
        buf[19] = self.result.into();
        buf[20] = self.init_type;
        buf
    }
}

/// The per-database counter block, as carried by state results and reported
/// by the admin channel. All counters are cumulative except `locked_count`,
/// `wait_count` and `key_count`, which track live state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbState {
    pub lock_count: u64,
    pub unlock_count: u64,
    pub locked_count: u32,
    pub wait_count: u32,
    pub timeouted_count: u32,
    pub expried_count: u32,
    pub unlock_error_count: u32,
    pub key_count: u32,
}

/// Result of a STATE. `db_state` is 1 when the database exists.
#[derive(Debug, Clone, Copy)]
pub struct StateResult {
    pub request_id: RequestId,
    pub result: ResultCode,
    pub flag: u8,
    pub db_state: u8,
    pub db_id: u8,
    pub state: DbState,
}

impl StateResult {
    pub fn of(command: &StateCommand, db_state: u8, state: DbState) -> Self {
        Self {
            request_id: command.request_id,
            result: ResultCode::Succeed,
            flag: 0,
            db_state,
            db_id: command.db_id,
            state,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = MAGIC;
        buf[1] = VERSION;
        buf[2] = CommandKind::State.into();
        buf[3..19].copy_from_slice(&self.request_id.0);
        buf[19] = self.result.into();
        buf[20] = self.flag;
        buf[21] = self.db_state;
        buf[22] = self.db_id;
        buf[23..31].copy_from_slice(&self.state.lock_count.to_le_bytes());
        buf[31..39].copy_from_slice(&self.state.unlock_count.to_le_bytes());
        buf[39..43].copy_from_slice(&self.state.locked_count.to_le_bytes());
        buf[43..47].copy_from_slice(&self.state.wait_count.to_le_bytes());
        buf[47..51].copy_from_slice(&self.state.timeouted_count.to_le_bytes());
        buf[51..55].copy_from_slice(&self.state.expried_count.to_le_bytes());
        buf[55..59].copy_from_slice(&self.state.unlock_error_count.to_le_bytes());
        buf[59..63].copy_from_slice(&self.state.key_count.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; FRAME_SIZE]) -> Option<Self> {
        Some(Self {
            request_id: RequestId(buf[3..19].try_into().expect("sixteen bytes")),
            result: ResultCode::try_from(buf[19]).ok()?,
            flag: buf[20],
            db_state: buf[21],
            db_id: buf[22],
            state: DbState {
                lock_count: u64::from_le_bytes(buf[23..31].try_into().expect("eight bytes")),
                unlock_count: u64::from_le_bytes(buf[31..39].try_into().expect("eight bytes")),
                locked_count: u32::from_le_bytes(buf[39..43].try_into().expect("four bytes")),
                wait_count: u32::from_le_bytes(buf[43..47].try_into().expect("four bytes")),
                timeouted_count: u32::from_le_bytes(buf[47..51].try_into().expect("four bytes")),
                expried_count: u32::from_le_bytes(buf[51..55].try_into().expect("four bytes")),
                unlock_error_count: u32::from_le_bytes(buf[55..59].try_into().expect("four bytes")),
                key_count: u32::from_le_bytes(buf[59..63].try_into().expect("four bytes")),
            },
        })
    }
}

/// A bare result frame: request id plus a result code. Used for ADMIN
/// results and for rejecting frames with a bad magic, version or kind.
#[derive(Debug, Clone, Copy)]
pub struct ResultFrame {
    pub kind: u8,
    pub request_id: RequestId,
    pub result: ResultCode,
}

impl ResultFrame {
    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = MAGIC;
        buf[1] = VERSION;
        buf[2] = self.kind;
        buf[3..19].copy_from_slice(&self.request_id.0);
        buf[19] = self.result.into();
        buf
    }
}
