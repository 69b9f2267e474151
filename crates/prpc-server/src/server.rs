//! TCP server speaking the prpc wire protocol.
//!
//! The accept loop spawns one task per connection. A connection reads frames
//! in order and runs every request on its own task, so a slow handler never
//! holds up the requests behind it; responses share the write half behind a
//! lock and go out in completion order, tagged with the request's sequence
//! number.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use prpc_common::{Codec, Message, PrpcError, Result};
use prpc_registry::{NodeOptions, Registry, DEFAULT_GROUP};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::router::Router;

/// Server configuration.
///
/// # Default Configuration
///
/// - `group`: `default`
/// - `index`: 1
/// - `node`: [`NodeOptions::default`]
/// - `reader_buffer_size`: 64 KiB
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Group the services are published under
    pub group: String,
    /// Node index within the group, unique per service and group
    pub index: u32,
    /// Weight, payload serialization and version advertised to clients
    pub node: NodeOptions,
    pub reader_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP.to_string(),
            index: 1,
            node: NodeOptions::default(),
            reader_buffer_size: 64 * 1024,
        }
    }
}

struct Running {
    registry: Arc<Registry>,
    services: Vec<String>,
    local_addr: SocketAddr,
}

pub struct Server {
    config: ServerConfig,
    codec: Codec,
    router: Arc<Router>,
    running: Mutex<Option<Running>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    /// # Errors
    ///
    /// - `InvalidOption` if the node options do not validate
    /// - `UnsupportedSerializer` for [`SerializeType::None`](prpc_common::SerializeType::None)
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.node.validate()?;
        let codec = Codec::for_type(config.node.serialize_type)?;
        Ok(Self {
            config,
            codec,
            router: Arc::new(Router::new()),
            running: Mutex::new(None),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Registers a handler for `service.method`.
    ///
    /// Handlers added after [`serve`](Self::serve) are callable, but a service
    /// name first seen then is not published to the registry.
    pub fn handle<A, R, F, Fut>(&self, service: &str, method: &str, handler: F) -> Result<()>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, String>> + Send + 'static,
    {
        self.router.add(service, method, handler)
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds `addr`, publishes every service to `registry` and starts accepting.
    ///
    /// Returns the bound address, which is also the address published.
    ///
    /// # Errors
    ///
    /// - `Shutdown` if the server was shut down or is already serving
    /// - `Io` if binding fails
    /// - `Registry` if a service cannot be registered; services registered
    ///   before the failure are withdrawn again
    pub async fn serve(&self, addr: &str, registry: Arc<Registry>) -> Result<SocketAddr> {
        if self.shutdown.is_cancelled() || self.running().is_some() {
            return Err(PrpcError::Shutdown);
        }

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let published = local_addr.to_string();
        let group = &self.config.group;
        let index = self.config.index;

        let mut services: Vec<String> = Vec::new();
        for service in self.router.services() {
            let registered = registry
                .register(&service, group, index, &published, self.config.node.clone())
                .await;
            if let Err(err) = registered {
                for done in &services {
                    if let Err(e) = registry.unregister(done.as_str(), group, index).await {
                        tracing::warn!(service = %done, error = %e, "unregister failed");
                    }
                }
                return Err(err.into());
            }
            services.push(service);
        }

        tracing::info!(
            addr = %local_addr,
            group = %group,
            index,
            services = ?services,
            "server listening"
        );
        *self.running() = Some(Running {
            registry,
            services,
            local_addr,
        });

        let conn = ConnContext {
            router: self.router.clone(),
            codec: self.codec,
            reader_buffer_size: self.config.reader_buffer_size,
            shutdown: self.shutdown.clone(),
            tracker: self.tracker.clone(),
        };
        self.tracker.spawn(accept_loop(listener, conn));
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running().as_ref().map(|running| running.local_addr)
    }

    /// Dispatched calls per `"Service.Method"`.
    pub fn method_calls(&self) -> HashMap<String, u64> {
        self.router.method_calls()
    }

    /// Withdraws the services from the registry, stops accepting, closes
    /// every connection and waits for in-flight handlers.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let running = self.running().take();
        if let Some(running) = &running {
            for service in &running.services {
                let unregistered = running
                    .registry
                    .unregister(service, &self.config.group, self.config.index)
                    .await;
                if let Err(err) = unregistered {
                    tracing::warn!(service = %service, error = %err, "unregister failed");
                }
            }
        }

        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Clone)]
struct ConnContext {
    router: Arc<Router>,
    codec: Codec,
    reader_buffer_size: usize,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

async fn accept_loop(listener: TcpListener, ctx: ConnContext) {
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "accepted connection");
                    ctx.tracker.spawn(serve_conn(stream, peer, ctx.clone()));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                }
            }
        }
    }
}

async fn serve_conn(stream: TcpStream, peer: SocketAddr, ctx: ConnContext) {
    let (read, write) = stream.into_split();
    let mut reader = BufReader::with_capacity(ctx.reader_buffer_size, read);
    let writer = Arc::new(tokio::sync::Mutex::new(write));

    loop {
        let msg = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            msg = Message::read_from(&mut reader) => msg,
        };

        let msg = match msg {
            Ok(msg) => msg,
            Err(PrpcError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!(peer = %peer, "connection closed by client");
                break;
            }
            Err(err) => {
                tracing::warn!(peer = %peer, error = %err, "read failed, closing connection");
                break;
            }
        };

        if msg.is_heartbeat() {
            match Message::pack_heartbeat(msg.seqno()) {
                Ok(frame) => {
                    if write_frame(&writer, &frame).await.is_err() {
                        break;
                    }
                }
                Err(err) => tracing::warn!(error = %err, "pack heartbeat failed"),
            }
            continue;
        }

        let router = ctx.router.clone();
        let writer = writer.clone();
        let codec = ctx.codec;
        ctx.tracker.spawn(async move {
            let seq = msg.seqno();
            match router.dispatch(msg, codec).await {
                Ok(frame) => {
                    if let Err(err) = write_frame(&writer, &frame).await {
                        tracing::debug!(peer = %peer, seq, error = %err, "write response failed");
                    }
                }
                Err(err) => {
                    tracing::error!(peer = %peer, seq, error = %err, "cannot frame response");
                }
            }
        });
    }

    let _ = writer.lock().await.shutdown().await;
}

async fn write_frame(writer: &tokio::sync::Mutex<OwnedWriteHalf>, frame: &[u8]) -> Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(frame).await?;
    Ok(())
}
