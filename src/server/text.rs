//! # Text Protocol
//!
//! The RESP-style admin channel a connection switches into after an ADMIN
//! frame. Commands arrive as `*N\r\n$len\r\narg\r\n...` arrays; replies are
//! status lines, errors, bulk strings or arrays of bulk strings. LOCK and
//! UNLOCK are bridged onto the engine through a per-request waiter, so a
//! text client can block on a lock like a binary one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::oneshot;

use crate::base::utils::HexBytes;
use crate::base::{LockId, LockKey, RequestId, WardenError, WardenResult};
use crate::engine::{ResultSink, Warden};
use crate::wire::{CommandKind, LockCommand, LockResult, ResultCode};

use super::conn::BinaryBinding;
use super::{Registry, admin};

const TEXT_READ_CHUNK: usize = 4096;

// -- reply builders --------------------------------------------------------

pub(crate) fn build_status(message: &str) -> Bytes {
    Bytes::from(format!("+{}\r\n", message))
}

pub(crate) fn build_error(message: &str) -> Bytes {
    Bytes::from(format!("-ERR {}\r\n", message))
}

pub(crate) fn build_bulk(value: &str) -> Bytes {
    Bytes::from(format!("${}\r\n{}\r\n", value.len(), value))
}

pub(crate) fn build_array(items: &[String]) -> Bytes {
    if items.len() == 1 {
        return build_bulk(&items[0]);
    }
    let mut out = format!("*{}\r\n", items.len());
    for item in items {
        out.push_str(&format!("${}\r\n{}\r\n", item.len(), item));
    }
    Bytes::from(out)
}

// -- incremental parser ----------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseStage {
    ArrayMark,
    ArrayLen,
    BulkMark,
    BulkLen,
    BulkBody,
}

/// Stage machine over a fed byte stream. Arguments accumulate across reads;
/// a command is complete when the announced count has been collected.
pub(crate) struct TextParser {
    stage: ParseStage,
    args: Vec<String>,
    args_count: usize,
    carg: Vec<u8>,
    carg_len: usize,
}

impl TextParser {
    pub(crate) fn new() -> Self {
        Self {
            stage: ParseStage::ArrayMark,
            args: Vec::new(),
            args_count: 0,
            carg: Vec::new(),
            carg_len: 0,
        }
    }

    fn parse_count(&mut self) -> WardenResult<usize> {
        let text = std::str::from_utf8(&self.carg)
            .map_err(|_| WardenError::Other("command count is not a number"))?;
        let count = text
            .trim_end_matches('\r')
            .parse::<usize>()
            .map_err(|_| WardenError::Other("command count is not a number"))?;
        self.carg.clear();
        Ok(count)
    }

    /// Consumes `buf`, returning each completed command as it forms.
    pub(crate) fn feed(&mut self, buf: &[u8]) -> WardenResult<Vec<Vec<String>>> {
        let mut commands = Vec::new();
        let mut at = 0;
        while at < buf.len() {
            let byte = buf[at];
            match self.stage {
                ParseStage::ArrayMark => {
                    if byte != b'*' {
                        return Err(WardenError::Other("command must start with *"));
                    }
                    at += 1;
                    self.stage = ParseStage::ArrayLen;
                }
                ParseStage::ArrayLen => {
                    at += 1;
                    if byte == b'\n' {
                        self.args_count = self.parse_count()?;
                        self.stage = ParseStage::BulkMark;
                    } else if byte != b'\r' {
                        self.carg.push(byte);
                    }
                }
                ParseStage::BulkMark => {
                    if byte != b'$' {
                        return Err(WardenError::Other("argument must start with $"));
                    }
                    at += 1;
                    self.stage = ParseStage::BulkLen;
                }
                ParseStage::BulkLen => {
                    at += 1;
                    if byte == b'\n' {
                        self.carg_len = self.parse_count()?;
                        self.stage = ParseStage::BulkBody;
                    } else if byte != b'\r' {
                        self.carg.push(byte);
                    }
                }
                ParseStage::BulkBody => {
                    let missing = self.carg_len - self.carg.len();
                    if missing > 0 {
                        let take = missing.min(buf.len() - at);
                        self.carg.extend_from_slice(&buf[at..at + take]);
                        at += take;
                        continue;
                    }
                    at += 1;
                    if byte == b'\n' {
                        self.args
                            .push(String::from_utf8_lossy(&self.carg).into_owned());
                        self.carg.clear();
                        self.carg_len = 0;
                        if self.args.len() < self.args_count {
                            self.stage = ParseStage::BulkMark;
                        } else {
                            self.stage = ParseStage::ArrayMark;
                            self.args_count = 0;
                            commands.push(std::mem::take(&mut self.args));
                        }
                    }
                }
            }
        }
        Ok(commands)
    }
}

// -- argument conversion ---------------------------------------------------

fn decode_hex_16(text: &str) -> Option<[u8; 16]> {
    if text.len() != 32 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out[i] = (hi * 16 + lo) as u8;
    }
    Some(out)
}

/// 16 bytes from a text argument: raw when exactly 16, hex-decoded when 32
/// hex digits, left-padded with zeros when shorter, truncated otherwise.
fn parse_id_arg(arg: &str) -> [u8; 16] {
    let bytes = arg.as_bytes();
    if bytes.len() == 16 {
        return bytes.try_into().expect("sixteen bytes");
    }
    if let Some(decoded) = decode_hex_16(arg) {
        return decoded;
    }
    let mut out = [0u8; 16];
    if bytes.len() < 16 {
        out[16 - bytes.len()..].copy_from_slice(bytes);
    } else {
        out.copy_from_slice(&bytes[..16]);
    }
    out
}

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_request_id() -> RequestId {
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut id = [0u8; 16];
    id[..8].copy_from_slice(&now.to_le_bytes());
    id[8..].copy_from_slice(&seq.to_le_bytes());
    RequestId(id)
}

fn parse_lock_args(
    args: &[String],
    kind: CommandKind,
    db_id: u8,
    default_lock_id: &LockId,
) -> Result<LockCommand, &'static str> {
    if args.len() < 2 || args.len() % 2 != 0 {
        return Err("wrong number of arguments");
    }
    let request_id = next_request_id();
    let mut command = LockCommand {
        kind,
        request_id,
        flag: 0,
        db_id,
        lock_id: LockId::default(),
        lock_key: LockKey(parse_id_arg(&args[1])),
        timeout: 3,
        timeout_flag: 0,
        expried: 60,
        expried_flag: 0,
        count: 0,
        rcount: 0,
        is_aof: false,
    };

    let mut has_lock_id = false;
    for pair in args[2..].chunks(2) {
        let value = &pair[1];
        match pair[0].to_uppercase().as_str() {
            "LOCK_ID" => {
                command.lock_id = LockId(parse_id_arg(value));
                has_lock_id = true;
            }
            "FLAG" => {
                command.flag = value.parse().map_err(|_| "FLAG is not a number")?;
            }
            "TIMEOUT" => {
                let timeout: u32 = value.parse().map_err(|_| "TIMEOUT is not a number")?;
                command.timeout = (timeout & 0xffff) as u16;
                command.timeout_flag = (timeout >> 16) as u16;
            }
            "EXPRIED" => {
                let expried: u32 = value.parse().map_err(|_| "EXPRIED is not a number")?;
                command.expried = (expried & 0xffff) as u16;
                command.expried_flag = (expried >> 16) as u16;
            }
            "COUNT" => {
                command.count = value.parse().map_err(|_| "COUNT is not a number")?;
            }
            "RCOUNT" => {
                command.rcount = value.parse().map_err(|_| "RCOUNT is not a number")?;
            }
            _ => return Err("unknown argument"),
        }
    }

    if !has_lock_id {
        command.lock_id = match kind {
            CommandKind::Lock => LockId(command.request_id.0),
            _ => *default_lock_id,
        };
    }
    Ok(command)
}

fn lock_reply(result: &LockResult) -> Vec<String> {
    vec![
        format!("{}", u8::from(result.result)),
        result.result.message().to_string(),
        "LOCK_ID".to_string(),
        format!("{}", HexBytes(&result.lock_id.0)),
        "LCOUNT".to_string(),
        format!("{}", result.lcount),
        "COUNT".to_string(),
        format!("{}", result.count),
        "RCOUNT".to_string(),
        format!("{}", result.rcount),
    ]
}

/// Funnels the engine's one result for a text LOCK/UNLOCK back into the
/// handler awaiting it.
struct TextSink {
    tx: Mutex<Option<oneshot::Sender<LockResult>>>,
    peer: SocketAddr,
}

impl ResultSink for TextSink {
    fn deliver(&self, result: LockResult, _reused_from_caller: bool) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(result);
        }
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

pub(crate) struct TextProtocol {
    warden: Arc<Warden>,
    registry: Arc<Registry>,
    binding: Arc<BinaryBinding>,
    parser: TextParser,
    db_id: u8,
    /// Lock id of the last successful text LOCK, the UNLOCK default.
    lock_id: LockId,
    closed: bool,
}

impl TextProtocol {
    pub(crate) fn new(
        warden: Arc<Warden>,
        registry: Arc<Registry>,
        binding: Arc<BinaryBinding>,
    ) -> Self {
        Self {
            warden,
            registry,
            binding,
            parser: TextParser::new(),
            db_id: 0,
            lock_id: LockId::default(),
            closed: false,
        }
    }

    fn reply(&self, data: Bytes) {
        if !self.binding.send_bytes(data) {
            debug!("text reply dropped, writer is gone");
        }
    }

    pub(crate) async fn run(&mut self, reader: &mut OwnedReadHalf) -> WardenResult<()> {
        let mut chunk = [0u8; TEXT_READ_CHUNK];
        while !self.closed {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            let commands = match self.parser.feed(&chunk[..n]) {
                Ok(commands) => commands,
                Err(e) => {
                    self.reply(build_error(&e.to_string()));
                    return Err(e);
                }
            };
            for args in commands {
                self.dispatch(args).await;
                if self.closed {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, args: Vec<String>) {
        if args.is_empty() {
            self.reply(build_error("empty command"));
            return;
        }
        match args[0].to_uppercase().as_str() {
            "SELECT" => self.handle_select(&args),
            "LOCK" => self.handle_lock(&args).await,
            "UNLOCK" => self.handle_unlock(&args).await,
            "PING" => self.reply(build_status("PONG")),
            "ECHO" => {
                if args.len() == 2 {
                    self.reply(build_bulk(&args[1]));
                } else {
                    self.reply(build_error("wrong number of arguments"));
                }
            }
            "INFO" => {
                let info = admin::info(&self.warden, &self.registry);
                self.reply(build_bulk(&info));
            }
            "SHOW" => match admin::show(&self.warden, &args) {
                Ok(fields) => self.reply(build_array(&fields)),
                Err(message) => self.reply(build_error(&message)),
            },
            "FLUSHDB" => match admin::flush_db(&self.warden, &args) {
                Ok(()) => self.reply(build_status("OK")),
                Err(message) => self.reply(build_error(&message)),
            },
            "QUIT" => {
                self.reply(build_status("OK"));
                self.closed = true;
            }
            _ => self.reply(build_error("unknown command")),
        }
    }

    fn handle_select(&mut self, args: &[String]) {
        if args.len() != 2 {
            self.reply(build_error("wrong number of arguments"));
            return;
        }
        match args[1].parse::<u8>() {
            Ok(db_id) => {
                self.db_id = db_id;
                self.reply(build_status("OK"));
            }
            Err(_) => self.reply(build_error("DB_ID is not a number")),
        }
    }

    async fn handle_lock(&mut self, args: &[String]) {
        let command = match parse_lock_args(args, CommandKind::Lock, self.db_id, &self.lock_id) {
            Ok(command) => command,
            Err(message) => {
                self.reply(build_error(message));
                return;
            }
        };
        let (tx, rx) = oneshot::channel();
        let sink: Arc<dyn ResultSink> = Arc::new(TextSink {
            tx: Mutex::new(Some(tx)),
            peer: self.binding.peer_addr(),
        });
        self.warden.get_or_new_db(command.db_id).lock(sink, command);
        match rx.await {
            Ok(result) => {
                if result.result == ResultCode::Succeed {
                    self.lock_id = result.lock_id;
                }
                self.reply(build_array(&lock_reply(&result)));
            }
            Err(_) => self.reply(build_error("lock failed")),
        }
    }

    async fn handle_unlock(&mut self, args: &[String]) {
        let command = match parse_lock_args(args, CommandKind::Unlock, self.db_id, &self.lock_id) {
            Ok(command) => command,
            Err(message) => {
                self.reply(build_error(message));
                return;
            }
        };
        let Some(db) = self.warden.db(command.db_id) else {
            self.reply(build_error("unknown db"));
            return;
        };
        let (tx, rx) = oneshot::channel();
        let sink: Arc<dyn ResultSink> = Arc::new(TextSink {
            tx: Mutex::new(Some(tx)),
            peer: self.binding.peer_addr(),
        });
        db.unlock(sink, command);
        match rx.await {
            Ok(result) => {
                if result.result == ResultCode::Succeed {
                    self.lock_id = LockId::default();
                }
                self.reply(build_array(&lock_reply(&result)));
            }
            Err(_) => self.reply(build_error("unlock failed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_single_command() {
        let mut parser = TextParser::new();
        let commands = parser
            .feed(b"*2\r\n$4\r\nPING\r\n$3\r\nfoo\r\n")
            .unwrap();
        assert_eq!(commands, vec![vec!["PING".to_string(), "foo".to_string()]]);
    }

    #[test]
    fn test_parser_split_across_reads() {
        let mut parser = TextParser::new();
        assert!(parser.feed(b"*2\r\n$4\r\nLO").unwrap().is_empty());
        assert!(parser.feed(b"CK\r\n$5\r\nhel").unwrap().is_empty());
        let commands = parser.feed(b"lo\r\n").unwrap();
        assert_eq!(commands, vec![vec!["LOCK".to_string(), "hello".to_string()]]);
    }

    #[test]
    fn test_parser_rejects_garbage() {
        let mut parser = TextParser::new();
        assert!(parser.feed(b"PING\r\n").is_err());
    }

    #[test]
    fn test_parse_id_arg_forms() {
        assert_eq!(parse_id_arg("0123456789abcdef"), *b"0123456789abcdef");
        assert_eq!(
            parse_id_arg("11111111111111111111111111111111"),
            [0x11; 16]
        );
        let padded = parse_id_arg("abc");
        assert_eq!(&padded[..13], &[0u8; 13]);
        assert_eq!(&padded[13..], b"abc");
        assert_eq!(
            parse_id_arg("this-name-is-longer-than-sixteen"),
            // 32 chars but not hex: first sixteen bytes
            *b"this-name-is-lon"
        );
    }

    #[test]
    fn test_parse_lock_args_defaults() {
        let args: Vec<String> = ["LOCK", "mykey", "TIMEOUT", "5", "EXPRIED", "10"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let command =
            parse_lock_args(&args, CommandKind::Lock, 3, &LockId::default()).unwrap();
        assert_eq!(command.db_id, 3);
        assert_eq!(command.timeout, 5);
        assert_eq!(command.expried, 10);
        assert_eq!(command.lock_id.0, command.request_id.0);
    }
}
