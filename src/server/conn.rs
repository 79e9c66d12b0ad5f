//! Binary connection driver: reads requests in 64-byte quanta, hands them
//! to the engine, and owns the writer task its results flow through.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;

use crate::base::{WardenError, WardenResult};
use crate::engine::{ResultSink, Warden};
use crate::wire::{
    CommandKind, DbState, FRAME_SIZE, Frame, InitResult, LockResult, ResultCode, ResultFrame,
    StateResult, decode_frame, request_id_of,
};

use super::Registry;
use super::text::TextProtocol;

/// The engine-facing side of one binary connection. Results are encoded
/// and pushed onto the writer channel; the engine never waits on the
/// socket. After the connection closes, results for an INIT-bound client
/// id chase the connection that re-registered the id; anything else is
/// dropped.
pub(crate) struct BinaryBinding {
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Bytes>,
    closed: AtomicBool,
    client_id: Mutex<Option<[u8; 16]>>,
    registry: Arc<Registry>,
}

impl BinaryBinding {
    pub(crate) fn send_frame(&self, frame: [u8; FRAME_SIZE]) -> bool {
        self.tx.send(Bytes::copy_from_slice(&frame)).is_ok()
    }

    pub(crate) fn send_bytes(&self, data: Bytes) -> bool {
        self.tx.send(data).is_ok()
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl ResultSink for BinaryBinding {
    fn deliver(&self, result: LockResult, _reused_from_caller: bool) {
        let frame = result.encode();
        if self.closed.load(Ordering::Acquire) {
            let successor = (*self.client_id.lock()).and_then(|id| self.registry.get(&id));
            if let Some(next) = successor {
                if next.send_frame(frame) {
                    return;
                }
            }
            debug!(peer = %self.peer, "dropping result for closed connection");
            return;
        }
        if !self.send_frame(frame) {
            debug!(peer = %self.peer, "dropping result, writer is gone");
        }
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

/// Runs one connection to completion.
pub(crate) async fn drive(
    warden: Arc<Warden>,
    registry: Arc<Registry>,
    socket: TcpStream,
    peer: SocketAddr,
) -> WardenResult<()> {
    let (mut reader, mut writer) = socket.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    tokio::spawn(async move {
        // an empty buffer is the shutdown marker; everything queued before
        // it still goes out
        while let Some(buf) = rx.recv().await {
            if buf.is_empty() || writer.write_all(&buf).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let binding = Arc::new(BinaryBinding {
        peer,
        tx,
        closed: AtomicBool::new(false),
        client_id: Mutex::new(None),
        registry: registry.clone(),
    });
    registry.opened();

    let result = run_frames(&warden, &registry, &binding, &mut reader).await;

    binding.closed.store(true, Ordering::Release);
    if let Some(client_id) = *binding.client_id.lock() {
        registry.deregister(&client_id, &binding);
    }
    registry.closed();
    // the engine may still hold this binding for queued waiters, which
    // keeps the channel alive; the shutdown marker cuts the writer loose
    // once everything already queued has gone out
    let _ = binding.tx.send(Bytes::new());
    result
}

async fn run_frames(
    warden: &Arc<Warden>,
    registry: &Arc<Registry>,
    binding: &Arc<BinaryBinding>,
    reader: &mut OwnedReadHalf,
) -> WardenResult<()> {
    let mut buf = [0u8; FRAME_SIZE];
    loop {
        match reader.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        match decode_frame(&buf) {
            Ok(Frame::Lock(command)) => {
                let sink: Arc<dyn ResultSink> = binding.clone();
                warden.get_or_new_db(command.db_id).lock(sink, command);
            }
            Ok(Frame::Unlock(command)) => match warden.db(command.db_id) {
                Some(db) => {
                    let sink: Arc<dyn ResultSink> = binding.clone();
                    db.unlock(sink, command);
                }
                None => {
                    binding.deliver(LockResult::of(&command, ResultCode::UnknownDb, 0), true);
                }
            },
            Ok(Frame::Init(init)) => {
                let already = registry.register(init.client_id, binding.clone());
                *binding.client_id.lock() = Some(init.client_id);
                binding.send_frame(
                    InitResult {
                        request_id: init.request_id,
                        result: ResultCode::Succeed,
                        init_type: already as u8,
                    }
                    .encode(),
                );
            }
            Ok(Frame::State(state)) => {
                let (db_state, counters) = match warden.db(state.db_id) {
                    Some(db) => (1, db.state()),
                    None => (0, DbState::default()),
                };
                binding.send_frame(StateResult::of(&state, db_state, counters).encode());
            }
            Ok(Frame::Admin(command)) => {
                binding.send_frame(
                    ResultFrame {
                        kind: CommandKind::Admin.into(),
                        request_id: command.request_id,
                        result: ResultCode::Succeed,
                    }
                    .encode(),
                );
                let mut text =
                    TextProtocol::new(warden.clone(), registry.clone(), binding.clone());
                return text.run(reader).await;
            }
            Err(e) => {
                let code = match &e {
                    WardenError::UnknownMagic(_) => ResultCode::UnknownMagic,
                    WardenError::UnknownVersion(_) => ResultCode::UnknownVersion,
                    WardenError::UnknownCommand(_) => ResultCode::UnknownCommand,
                    _ => ResultCode::Error,
                };
                binding.send_frame(
                    ResultFrame {
                        kind: buf[2],
                        request_id: request_id_of(&buf),
                        result: code,
                    }
                    .encode(),
                );
                if matches!(code, ResultCode::UnknownCommand) {
                    // a well-framed but unknown kind is answered and skipped
                    continue;
                }
                return Err(e);
            }
        }
    }
}
