//! # Server
//!
//! The tokio transport around the engine: a TCP accept loop, one driver
//! task per connection reading 64-byte frames, and one writer task per
//! connection draining a result channel. An ADMIN frame hands the
//! connection over to the text protocol in [`text`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::base::WardenResult;
use crate::engine::Warden;

mod admin;
mod conn;
mod text;

pub(crate) use conn::BinaryBinding;

/// Connection bookkeeping shared across the accept loop: the client-id
/// bindings established by INIT, plus the client counters the admin INFO
/// section reports.
#[derive(Default)]
pub(crate) struct Registry {
    bindings: Mutex<HashMap<[u8; 16], Arc<BinaryBinding>>>,
    total_accepted: AtomicU64,
    open: AtomicI64,
}

impl Registry {
    /// Binds `client_id` to `binding`, returning true when the id was
    /// already registered (a reconnect taking the id over).
    pub(crate) fn register(&self, client_id: [u8; 16], binding: Arc<BinaryBinding>) -> bool {
        self.bindings.lock().insert(client_id, binding).is_some()
    }

    pub(crate) fn get(&self, client_id: &[u8; 16]) -> Option<Arc<BinaryBinding>> {
        self.bindings.lock().get(client_id).cloned()
    }

    /// Unbinds `client_id` unless another connection has taken it over.
    pub(crate) fn deregister(&self, client_id: &[u8; 16], binding: &Arc<BinaryBinding>) {
        let mut bindings = self.bindings.lock();
        if let Some(bound) = bindings.get(client_id) {
            if Arc::ptr_eq(bound, binding) {
                bindings.remove(client_id);
            }
        }
    }

    pub(crate) fn opened(&self) {
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        self.open.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn closed(&self) {
        self.open.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }

    pub(crate) fn open_connections(&self) -> i64 {
        self.open.load(Ordering::Relaxed)
    }
}

/// Accepts connections until the listener fails, spawning one driver task
/// per connection.
pub async fn serve(warden: Arc<Warden>, listener: TcpListener) -> WardenResult<()> {
    let registry = Arc::new(Registry::default());
    loop {
        let (socket, peer) = listener.accept().await?;
        let _ = socket.set_nodelay(true);
        let warden = warden.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            debug!(%peer, "connection opened");
            if let Err(e) = conn::drive(warden, registry, socket, peer).await {
                debug!(%peer, "connection ended: {}", e);
            } else {
                debug!(%peer, "connection closed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use crate::base::{LockId, LockKey, RequestId};
    use crate::config::{DbConfig, ServerConfig};
    use crate::wire::{
        AdminCommand, CommandKind, FRAME_SIZE, LockCommand, LockResult, ResultCode, StateCommand,
        StateResult,
    };

    use super::*;

    async fn start_server() -> (Arc<Warden>, SocketAddr) {
        let config = ServerConfig {
            db: DbConfig::for_testing(),
            ..ServerConfig::default()
        };
        let warden = Warden::new(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = warden.clone();
        tokio::spawn(async move {
            let _ = serve(served, listener).await;
        });
        (warden, addr)
    }

    fn lock_command(kind: CommandKind, timeout: u16, expried: u16) -> LockCommand {
        LockCommand {
            kind,
            request_id: RequestId([0xaa; 16]),
            flag: 0,
            db_id: 0,
            lock_id: LockId([0x11; 16]),
            lock_key: LockKey([0x01; 16]),
            timeout,
            timeout_flag: 0,
            expried,
            expried_flag: 0,
            count: 0,
            rcount: 0,
            is_aof: false,
        }
    }

    async fn round_trip(stream: &mut TcpStream, frame: [u8; FRAME_SIZE]) -> [u8; FRAME_SIZE] {
        stream.write_all(&frame).await.unwrap();
        let mut buf = [0u8; FRAME_SIZE];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_lock_unlock_and_state_over_socket() {
        let (warden, addr) = start_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let reply = round_trip(&mut stream, lock_command(CommandKind::Lock, 5, 5).encode()).await;
        let result = LockResult::decode(&reply).unwrap();
        assert_eq!(result.result, ResultCode::Succeed);
        assert_eq!(result.lcount, 1);
        assert_eq!(result.request_id, RequestId([0xaa; 16]));

        let reply =
            round_trip(&mut stream, lock_command(CommandKind::Unlock, 0, 0).encode()).await;
        let result = LockResult::decode(&reply).unwrap();
        assert_eq!(result.result, ResultCode::Succeed);
        assert_eq!(result.lcount, 0);

        let state_command = StateCommand {
            request_id: RequestId([0xbb; 16]),
            flag: 0,
            db_id: 0,
        };
        let reply = round_trip(&mut stream, state_command.encode()).await;
        let state = StateResult::decode(&reply).unwrap();
        assert_eq!(state.db_state, 1);
        assert_eq!(state.state.lock_count, 1);
        assert_eq!(state.state.unlock_count, 1);

        warden.close();
    }

    #[tokio::test]
    async fn test_bad_magic_closes_connection() {
        let (warden, addr) = start_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let mut frame = lock_command(CommandKind::Lock, 5, 5).encode();
        frame[0] = 0x00;
        let reply = round_trip(&mut stream, frame).await;
        assert_eq!(reply[19], u8::from(ResultCode::UnknownMagic));

        // the server hangs up after rejecting the frame
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap_or(0), 0);
        warden.close();
    }

    #[tokio::test]
    async fn test_text_protocol_ping_and_lock() {
        let (warden, addr) = start_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let admin = AdminCommand {
            request_id: RequestId([0xcc; 16]),
            admin_type: 0,
        };
        let reply = round_trip(&mut stream, admin.encode()).await;
        assert_eq!(reply[19], u8::from(ResultCode::Succeed));

        stream.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let mut buf = [0u8; 512];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+PONG\r\n");

        stream
            .write_all(b"*2\r\n$4\r\nLOCK\r\n$5\r\nmykey\r\n")
            .await
            .unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        let reply = String::from_utf8_lossy(&buf[..n]);
        assert!(reply.starts_with("*10\r\n"), "unexpected reply: {}", reply);
        assert!(reply.contains("OK"), "unexpected reply: {}", reply);

        // the unlock defaults to the lock id remembered from the LOCK above
        stream
            .write_all(b"*2\r\n$6\r\nUNLOCK\r\n$5\r\nmykey\r\n")
            .await
            .unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        let reply = String::from_utf8_lossy(&buf[..n]);
        assert!(reply.starts_with("*10\r\n"), "unexpected reply: {}", reply);
        assert!(reply.contains("OK"), "unexpected reply: {}", reply);
        assert!(reply.contains("LCOUNT"), "unexpected reply: {}", reply);

        stream.write_all(b"*1\r\n$4\r\nQUIT\r\n").await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+OK\r\n");
        warden.close();
    }
}
