use crate::base::{LockId, LockKey, RequestId, WardenError, WardenResult};

use super::{CommandKind, FRAME_SIZE, MAGIC, VERSION};

/// On a LOCK, report the current holder instead of acquiring. Never grants.
pub const LOCK_FLAG_SHOW_WHEN_LOCKED: u8 = 0x01;
/// On a LOCK, refresh timing and counters of the already held lock id.
pub const LOCK_FLAG_UPDATE_WHEN_LOCKED: u8 = 0x02;
/// On an UNLOCK, release the current holder regardless of the lock id sent.
pub const UNLOCK_FLAG_UNLOCK_CURRENT: u8 = 0x01;

/// A lock or unlock request. `count` is the maximum number of distinct
/// holders permitted on the key; `rcount` the maximum re-lock depth for a
/// single lock id (or, on an UNLOCK, how many reentries to release).
#[derive(Debug, Clone, Copy)]
pub struct LockCommand {
    pub kind: CommandKind,
    pub request_id: RequestId,
    pub flag: u8,
    pub db_id: u8,
    pub lock_id: LockId,
    pub lock_key: LockKey,
    pub timeout: u16,
    pub timeout_flag: u16,
    pub expried: u16,
    pub expried_flag: u16,
    pub count: u16,
    pub rcount: u8,
    /// Set when the command was synthesized by the append-only-file replay.
    pub is_aof: bool,
}

impl LockCommand {
    pub(super) fn decode(kind: CommandKind, buf: &[u8; FRAME_SIZE]) -> Self {
        Self {
            kind,
            request_id: RequestId(buf[3..19].try_into().expect("sixteen bytes")),
            flag: buf[19],
            db_id: buf[20],
            lock_id: LockId(buf[21..37].try_into().expect("sixteen bytes")),
            lock_key: LockKey(buf[37..53].try_into().expect("sixteen bytes")),
            timeout: u16::from_le_bytes([buf[53], buf[54]]),
            timeout_flag: u16::from_le_bytes([buf[55], buf[56]]),
            expried: u16::from_le_bytes([buf[57], buf[58]]),
            expried_flag: u16::from_le_bytes([buf[59], buf[60]]),
            count: u16::from_le_bytes([buf[61], buf[62]]),
            rcount: buf[63],
            is_aof: false,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = MAGIC;
        buf[1] = VERSION;
        buf[2] = self.kind.into();
        buf[3..19].copy_from_slice(&self.request_id.0);
        buf[19] = self.flag;
        buf[20] = self.db_id;
        buf[21..37].copy_from_slice(&self.lock_id.0);
        buf[37..53].copy_from_slice(&self.lock_key.0);
        buf[53..55].copy_from_slice(&self.timeout.to_le_bytes());
        buf[55..57].copy_from_slice(&self.timeout_flag.to_le_bytes());
        buf[57..59].copy_from_slice(&self.expried.to_le_bytes());
        buf[59..61].copy_from_slice(&self.expried_flag.to_le_bytes());
        buf[61..63].copy_from_slice(&self.count.to_le_bytes());
        buf[63] = self.rcount;
        buf
    }
}

/// Assigns the connection a 16-byte client id; results for a dropped
/// connection are rerouted to whichever connection re-registers the id.
#[derive(Debug, Clone, Copy)]
pub struct InitCommand {
    pub request_id: RequestId,
    pub client_id: [u8; 16],
}

impl InitCommand {
    pub(super) fn decode(buf: &[u8; FRAME_SIZE]) -> Self {
        Self {
            request_id: RequestId(buf[3..19].try_into().expect("sixteen bytes")),
            client_id: buf[19..35].try_into().expect("sixteen bytes"),
        }
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = MAGIC;
        buf[1] = VERSION;
        buf[2] = CommandKind::Init.into();
        buf[3..19].copy_from_slice(&self.request_id.0);
        buf[19..35].copy_from_slice(&self.client_id);
        buf
    }
}

/// Asks for the counter block of one database.
#[derive(Debug, Clone, Copy)]
pub struct StateCommand {
    pub request_id: RequestId,
    pub flag: u8,
    pub db_id: u8,
}

impl StateCommand {
    pub(super) fn decode(buf: &[u8; FRAME_SIZE]) -> Self {
        Self {
            request_id: RequestId(buf[3..19].try_into().expect("sixteen bytes")),
            flag: buf[19],
            db_id: buf[20],
        }
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = MAGIC;
        buf[1] = VERSION;
        buf[2] = CommandKind::State.into();
        buf[3..19].copy_from_slice(&self.request_id.0);
        buf[19] = self.flag;
        buf[20] = self.db_id;
        buf
    }
}

/// Upgrades the connection to the text protocol.
#[derive(Debug, Clone, Copy)]
pub struct AdminCommand {
    pub request_id: RequestId,
    pub admin_type: u8,
}

impl AdminCommand {
    pub(super) fn decode(buf: &[u8; FRAME_SIZE]) -> Self {
        Self {
            request_id: RequestId(buf[3..19].try_into().expect("sixteen bytes")),
            admin_type: buf[19],
        }
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = MAGIC;
        buf[1] = VERSION;
        buf[2] = CommandKind::Admin.into();
        buf[3..19].copy_from_slice(&self.request_id.0);
        buf[19] = self.admin_type;
        buf
    }
}

/// A decoded request frame.
#[derive(Debug, Clone, Copy)]
pub enum Frame {
    Init(InitCommand),
    Lock(LockCommand),
    Unlock(LockCommand),
    State(StateCommand),
    Admin(AdminCommand),
}

/// The request id of a raw frame, for echoing into error results when the
/// frame itself cannot be decoded.
pub fn request_id_of(buf: &[u8; FRAME_SIZE]) -> RequestId {
    RequestId(buf[3..19].try_into().expect("sixteen bytes"))
}

/// Decodes one frame, validating magic, version and command kind.
pub fn decode_frame(buf: &[u8; FRAME_SIZE]) -> WardenResult<Frame> {
    if buf[0] != MAGIC {
        return Err(WardenError::UnknownMagic(buf[0]));
    }
    if buf[1] != VERSION {
        return Err(WardenError::UnknownVersion(buf[1]));
    }
    let kind = CommandKind::try_from(buf[2]).map_err(|_| WardenError::UnknownCommand(buf[2]))?;
    Ok(match kind {
        CommandKind::Init => Frame::Init(InitCommand::decode(buf)),
        CommandKind::Lock => Frame::Lock(LockCommand::decode(kind, buf)),
        CommandKind::Unlock => Frame::Unlock(LockCommand::decode(kind, buf)),
        CommandKind::State => Frame::State(StateCommand::decode(buf)),
        CommandKind::Admin => Frame::Admin(AdminCommand::decode(buf)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_frame() -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = MAGIC;
        buf[1] = VERSION;
        buf[2] = CommandKind::Lock as u8;
        buf[3..19].copy_from_slice(&[0xaa; 16]);
        buf[19] = 0x02; // flag
        buf[20] = 7; // db id
        buf[21..37].copy_from_slice(&[0x11; 16]);
        buf[37..53].copy_from_slice(&[0x01; 16]);
        buf[53..55].copy_from_slice(&5u16.to_le_bytes());
        buf[57..59].copy_from_slice(&60u16.to_le_bytes());
        buf[61..63].copy_from_slice(&3u16.to_le_bytes());
        buf[63] = 2;
        buf
    }

    #[test]
    fn test_decode_lock_command_offsets() {
        let frame = lock_frame();
        let Frame::Lock(command) = decode_frame(&frame).unwrap() else {
            panic!("expected a lock frame");
        };
        assert_eq!(command.request_id, RequestId([0xaa; 16]));
        assert_eq!(command.flag, 0x02);
        assert_eq!(command.db_id, 7);
        assert_eq!(command.lock_id, LockId([0x11; 16]));
        assert_eq!(command.lock_key, LockKey([0x01; 16]));
        assert_eq!(command.timeout, 5);
        assert_eq!(command.timeout_flag, 0);
        assert_eq!(command.expried, 60);
        assert_eq!(command.expried_flag, 0);
        assert_eq!(command.count, 3);
        assert_eq!(command.rcount, 2);
        assert!(!command.is_aof);
    }

    #[test]
    fn test_lock_command_round_trip() {
        let frame = lock_frame();
        let Frame::Lock(command) = decode_frame(&frame).unwrap() else {
            panic!("expected a lock frame");
        };
        assert_eq!(command.encode(), frame);
    }

    #[test]
    fn test_decode_init_and_state() {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = MAGIC;
        buf[1] = VERSION;
        buf[2] = CommandKind::Init as u8;
        buf[19..35].copy_from_slice(&[0x42; 16]);
        let Frame::Init(init) = decode_frame(&buf).unwrap() else {
            panic!("expected an init frame");
        };
        assert_eq!(init.client_id, [0x42; 16]);

        buf[2] = CommandKind::State as u8;
        buf[19] = 0;
        buf[20] = 9;
        let Frame::State(state) = decode_frame(&buf).unwrap() else {
            panic!("expected a state frame");
        };
        assert_eq!(state.db_id, 9);
    }

    #[test]
    fn test_rejects_bad_magic_version_and_kind() {
        let mut buf = lock_frame();
        buf[0] = 0x00;
        assert!(matches!(
            decode_frame(&buf),
            Err(WardenError::UnknownMagic(0x00))
        ));

        let mut buf = lock_frame();
        buf[1] = 0x7f;
        assert!(matches!(
            decode_frame(&buf),
            Err(WardenError::UnknownVersion(0x7f))
        ));

        let mut buf = lock_frame();
        buf[2] = 0xee;
        assert!(matches!(
            decode_frame(&buf),
            Err(WardenError::UnknownCommand(0xee))
        ));
    }
}
