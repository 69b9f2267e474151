//! Multiplexed RPC connection.
//!
//! One [`RpcClient`] owns one socket. Any number of calls may be in flight at
//! once; each gets a 16-bit sequence number and responses are matched back by
//! that number only, so the server may answer in any order.
//!
//! Background tasks belong to a connection: the read loop, the write loop,
//! the heartbeat task and one waiter per [`RpcClient::go`] call.
//! [`RpcClient::close`] waits for all of them.
//!
//! Only the write loop touches the write half. Callers hand it whole frames,
//! so a caller that gives up never leaves half a frame on the socket.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use prpc_common::{Codec, Message, PrpcError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Connection configuration.
///
/// # Default Configuration
///
/// - `connect_timeout`: 5 seconds
/// - `read_idle_timeout`: 5 seconds
/// - `reader_buffer_size`: 64 KiB
/// - `heartbeat_interval`: `None` (no heartbeats are sent)
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum time to establish the TCP connection
    pub connect_timeout: Duration,
    /// How long the read loop waits on an idle socket before re-checking
    /// for shutdown. Expiry is not an error.
    pub read_idle_timeout: Duration,
    pub reader_buffer_size: usize,
    /// Period of outbound heartbeat frames
    pub heartbeat_interval: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_idle_timeout: Duration::from_secs(5),
            reader_buffer_size: 64 * 1024,
            heartbeat_interval: None,
        }
    }
}

struct PendingCall {
    service_method: String,
    tx: oneshot::Sender<Result<Message>>,
}

#[derive(Default)]
struct CallTable {
    seq: u16,
    pending: HashMap<u16, PendingCall>,
    /// Owner called `close`
    closing: bool,
    /// Read loop has exited
    shutdown: bool,
}

impl CallTable {
    /// Next free sequence number; wraps and never yields 0.
    fn next_seq(&mut self) -> Option<u16> {
        if self.pending.len() >= u16::MAX as usize {
            return None;
        }
        loop {
            self.seq = self.seq.wrapping_add(1);
            if self.seq != 0 && !self.pending.contains_key(&self.seq) {
                return Some(self.seq);
            }
        }
    }
}

/// Frames queued for the write loop before senders wait.
const WRITE_QUEUE_CAPACITY: usize = 256;

struct Inner {
    addr: String,
    codec: Codec,
    calls: Mutex<CallTable>,
    frames: mpsc::Sender<Vec<u8>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

fn lock(calls: &Mutex<CallTable>) -> MutexGuard<'_, CallTable> {
    calls.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a registered call from the pending table unless it completed.
///
/// Dropping a call future before its response arrives goes through here, so
/// a late response finds no entry and is discarded by the read loop.
struct PendingGuard<'a> {
    inner: &'a Inner,
    seq: u16,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if lock(&self.inner.calls).pending.remove(&self.seq).is_some() {
                tracing::debug!(addr = %self.inner.addr, seq = self.seq, "call abandoned");
            }
        }
    }
}

impl Inner {
    fn register(&self, service_method: &str) -> Result<(u16, oneshot::Receiver<Result<Message>>)> {
        let mut table = lock(&self.calls);
        if table.closing || table.shutdown {
            return Err(PrpcError::Shutdown);
        }
        let seq = table
            .next_seq()
            .ok_or_else(|| PrpcError::Connection("too many pending calls".to_string()))?;
        let (tx, rx) = oneshot::channel();
        table.pending.insert(
            seq,
            PendingCall {
                service_method: service_method.to_string(),
                tx,
            },
        );
        Ok((seq, rx))
    }

    /// Queues a complete frame for the write loop.
    async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        self.frames.send(frame).await.map_err(|_| PrpcError::Shutdown)
    }

    async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let (seq, rx) = self.register(service_method)?;
        let guard = PendingGuard {
            inner: self,
            seq,
            armed: true,
        };

        let data = Message::pack(seq, service_method, args, self.codec)?;
        tracing::debug!(addr = %self.addr, seq, method = service_method, "send request");
        self.send_frame(data).await?;

        // A write failure reaches this call through `terminate`.
        // Whatever comes back, the entry has already left the pending table.
        let reply = rx.await;
        guard.disarm();
        // The read loop resolves every registered call before it exits, so a
        // closed channel only means the connection is gone.
        reply.map_err(|_| PrpcError::Shutdown)??.unpack(self.codec)
    }

    /// Routes one inbound frame to its pending call.
    fn dispatch(&self, msg: Message) {
        if msg.is_heartbeat() {
            tracing::trace!(addr = %self.addr, "heartbeat received");
            return;
        }

        let seq = msg.seqno();
        let call = lock(&self.calls).pending.remove(&seq);
        let Some(call) = call else {
            tracing::warn!(
                addr = %self.addr,
                seq,
                method = msg.service_method(),
                "response for unknown call, dropped"
            );
            return;
        };

        let result = if msg.service_method() != call.service_method {
            Err(PrpcError::MethodMismatch {
                got: msg.service_method().to_string(),
                expected: call.service_method,
            })
        } else if let Some(err) = msg.remote_error() {
            Err(PrpcError::Remote(err.to_string()))
        } else {
            Ok(msg)
        };
        // The caller may have given up in the meantime.
        let _ = call.tx.send(result);
    }

    /// Fails every pending call once the connection broke with `err`.
    ///
    /// Only the first caller does anything.
    fn terminate(&self, err: PrpcError) {
        let (pending, closing) = {
            let mut table = lock(&self.calls);
            if table.shutdown {
                return;
            }
            table.shutdown = true;
            (std::mem::take(&mut table.pending), table.closing)
        };
        self.shutdown.cancel();

        let closed_by_peer = is_peer_close(&err);
        if closing {
            tracing::debug!(addr = %self.addr, "connection closed");
        } else if closed_by_peer {
            tracing::info!(addr = %self.addr, "connection closed by peer");
        } else {
            tracing::error!(addr = %self.addr, error = %err, "connection failed");
        }

        for (_, call) in pending {
            let err = if closing {
                PrpcError::Shutdown
            } else if closed_by_peer {
                PrpcError::ClosedByPeer
            } else {
                PrpcError::Connection(err.to_string())
            };
            let _ = call.tx.send(Err(err));
        }
    }
}

fn is_peer_close(err: &PrpcError) -> bool {
    match err {
        PrpcError::ClosedByPeer => true,
        PrpcError::Io(err) => matches!(
            err.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}

async fn read_loop<R>(inner: Arc<Inner>, reader: R, config: ConnectionConfig)
where
    R: AsyncRead + Send + Unpin,
{
    let mut reader = BufReader::with_capacity(config.reader_buffer_size, reader);

    let err = loop {
        // Only wait for the first byte under the idle timeout: `fill_buf` is
        // cancel safe, reading a partial frame is not.
        let ready = tokio::select! {
            _ = inner.shutdown.cancelled() => break PrpcError::Shutdown,
            ready = tokio::time::timeout(config.read_idle_timeout, reader.fill_buf()) => ready,
        };
        match ready {
            Err(_idle) => continue,
            Ok(Err(err)) => break err.into(),
            Ok(Ok([])) => break PrpcError::ClosedByPeer,
            Ok(Ok(_)) => {}
        }

        let msg = tokio::select! {
            _ = inner.shutdown.cancelled() => break PrpcError::Shutdown,
            msg = Message::read_from(&mut reader) => msg,
        };
        match msg {
            Ok(msg) => inner.dispatch(msg),
            Err(err) => break err,
        }
    };

    inner.terminate(err);
}

async fn write_loop<W>(inner: Arc<Inner>, mut writer: W, mut frames: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // A frame cut short here is never followed by another one.
        let written = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            written = write_frame(&mut writer, &frame) => written,
        };
        if let Err(err) = written {
            inner.terminate(err);
            break;
        }
    }

    frames.close();
    if let Err(err) = writer.shutdown().await {
        tracing::debug!(addr = %inner.addr, error = %err, "shutdown write half failed");
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn heartbeat_loop(inner: Arc<Inner>, interval: Option<Duration>) {
    let Some(period) = interval else {
        inner.shutdown.cancelled().await;
        return;
    };

    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let sent = match Message::pack_heartbeat(0) {
                    Ok(frame) => inner.send_frame(frame).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = sent {
                    tracing::debug!(addr = %inner.addr, error = %err, "send heartbeat failed");
                    break;
                }
            }
        }
    }
}

/// A single multiplexed RPC connection.
///
/// # Example
///
/// ```no_run
/// use prpc_client::{ConnectionConfig, RpcClient};
/// use prpc_common::Codec;
///
/// # async fn example() -> prpc_common::Result<()> {
/// let config = ConnectionConfig::default();
/// let client = RpcClient::dial("127.0.0.1:9000", Codec::MsgPack, config).await?;
/// let product: i64 = client.call("Arith.Multiply", &(2, 3)).await?;
/// assert_eq!(product, 6);
/// client.close().await;
/// # Ok(())
/// # }
/// ```
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    /// Connects to `addr` and starts the connection's background tasks.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the connect timeout expires, `Io` if the
    /// connection is refused.
    pub async fn dial(addr: &str, codec: Codec, config: ConnectionConfig) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PrpcError::Connection(format!("connect to {} timed out", addr)))??;
        stream.set_nodelay(true)?;
        tracing::info!(addr, "connected");
        Ok(Self::from_stream(stream, addr, codec, config))
    }

    /// Runs the protocol over an already established stream.
    ///
    /// Must be called within a tokio runtime.
    pub fn from_stream<S>(stream: S, addr: &str, codec: Codec, config: ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (frames, queued) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let inner = Arc::new(Inner {
            addr: addr.to_string(),
            codec,
            calls: Mutex::new(CallTable::default()),
            frames,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        inner.tracker.spawn(write_loop(inner.clone(), writer, queued));
        inner
            .tracker
            .spawn(heartbeat_loop(inner.clone(), config.heartbeat_interval));
        inner.tracker.spawn(read_loop(inner.clone(), reader, config));

        Self { inner }
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn codec(&self) -> Codec {
        self.inner.codec
    }

    /// Whether the connection can no longer carry calls.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.calls).pending.len()
    }

    /// Calls `service_method` and waits for the reply.
    ///
    /// Dropping the returned future abandons the call: its sequence number is
    /// released and a late response is discarded.
    ///
    /// # Errors
    ///
    /// - `Shutdown` if the connection is closed or closing
    /// - `ClosedByPeer` / `Connection` if the connection fails while waiting
    /// - `MethodMismatch` if the response names another method
    /// - `Remote` if the server handler failed
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.inner.call(service_method, args).await
    }

    /// Like [`call`](Self::call), failing with `Timeout` after `timeout`.
    pub async fn call_with_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        tokio::time::timeout(timeout, self.inner.call(service_method, args))
            .await
            .map_err(|_| PrpcError::Timeout(timeout.as_millis() as u64))?
    }

    /// Like [`call`](Self::call), failing with `Canceled` once `cancel` fires.
    pub async fn call_with_cancel<A, R>(
        &self,
        service_method: &str,
        args: &A,
        cancel: &CancellationToken,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        tokio::select! {
            _ = cancel.cancelled() => Err(PrpcError::Canceled),
            result = self.inner.call(service_method, args) => result,
        }
    }

    /// Issues the call in the background and hands `args` and the result to
    /// `callback`, exactly once, when it completes.
    pub fn go<A, R, F>(&self, service_method: &str, args: A, callback: F)
    where
        A: Serialize + Send + Sync + 'static,
        R: DeserializeOwned + Send + 'static,
        F: FnOnce(A, Result<R>) + Send + 'static,
    {
        let inner = self.inner.clone();
        let service_method = service_method.to_string();
        self.inner.tracker.spawn(async move {
            let result = inner.call(&service_method, &args).await;
            callback(args, result);
        });
    }

    /// Closes the connection.
    ///
    /// Pending calls fail with `Shutdown`, including one whose frame is still
    /// being written. Returns once the read and write loops, the heartbeat
    /// task and every `go` waiter have finished. Safe to call more than once.
    pub async fn close(&self) {
        let first = {
            let mut table = lock(&self.inner.calls);
            !std::mem::replace(&mut table.closing, true)
        };
        if first {
            tracing::debug!(addr = %self.inner.addr, "closing connection");
            self.inner.shutdown.cancel();
            self.inner.tracker.close();
        }
        self.inner.tracker.wait().await;
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        lock(&self.inner.calls).closing = true;
        self.inner.shutdown.cancel();
    }
}
