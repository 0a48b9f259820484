//! Scheduler transport endpoint.
//!
//! One task per connection reads frames; every request is handled in its
//! own task so sessions multiplexed over one connection never wait on each
//! other, and replies go back through a single writer task. Sessions
//! opened on a connection are abandoned when it drops.

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use split_scheduler::Scheduler;
use split_types::endpoint::parse_endpoint;
use split_types::wire::ErrorReply;
use split_types::{Envelope, ErrorKind, MessageBody};

use crate::codec::FrameCodec;
use crate::error::{NetError, Result};
use crate::CHANNEL_CAPACITY;

pub struct Server {
    listener: TcpListener,
    scheduler: Arc<Scheduler>,
    codec: FrameCodec,
}

impl Server {
    /// Bind `tcp://host:port` (scheme optional).
    pub async fn bind(endpoint: &str, scheduler: Arc<Scheduler>, codec: FrameCodec) -> Result<Self> {
        let addr = parse_endpoint(endpoint).map_err(NetError::Endpoint)?;
        let listener = TcpListener::bind(&addr).await?;
        info!(endpoint = %addr, local = ?listener.local_addr().ok(), "scheduler listening");
        Ok(Self { listener, scheduler, codec })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let scheduler = Arc::clone(&self.scheduler);
                        let codec = self.codec;
                        tokio::spawn(async move {
                            serve_connection(stream, peer, scheduler, codec).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = &mut shutdown => {
                    info!("scheduler transport shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Run in a background task until the handle is aborted.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(std::future::pending()))
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, scheduler: Arc<Scheduler>, codec: FrameCodec) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "set_nodelay failed");
    }
    info!(%peer, "connection opened");

    let (mut reader, mut writer) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);

    let writer_task = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            if let Err(e) = codec.write_envelope(&mut writer, &reply).await {
                warn!(%peer, error = %e, "reply write failed");
                break;
            }
        }
    });

    let opened: Arc<Mutex<HashSet<String>>> = Arc::default();

    loop {
        let request = match codec.read_envelope(&mut reader).await {
            Ok(Some(env)) => env,
            Ok(None) => break,
            Err(NetError::Decode(detail)) => {
                warn!(%peer, %detail, "undecodable frame");
                let reply = Envelope::new(
                    "",
                    0,
                    MessageBody::Error(ErrorReply {
                        kind: ErrorKind::ProtocolViolation,
                        message: format!("undecodable frame: {detail}"),
                    }),
                );
                if reply_tx.send(reply).await.is_err() {
                    break;
                }
                continue;
            }
            Err(e) => {
                warn!(%peer, error = %e, "connection read failed");
                break;
            }
        };

        debug!(%peer, session_id = %request.session_id, seq = request.seq, kind = request.body.kind_name(), "request");
        if matches!(request.body, MessageBody::SessionEnd { .. }) {
            lock(&opened).remove(&request.session_id);
        }

        let scheduler = Arc::clone(&scheduler);
        let reply_tx = reply_tx.clone();
        let opened = Arc::clone(&opened);
        tokio::spawn(async move {
            let reply = scheduler.handle(request).await;
            if matches!(reply.body, MessageBody::SessionAccepted(_)) {
                lock(&opened).insert(reply.session_id.clone());
            }
            if reply_tx.send(reply).await.is_err() {
                debug!("reply dropped: connection gone");
            }
        });
    }

    drop(reply_tx);
    let abandoned: Vec<String> = lock(&opened).drain().collect();
    if !abandoned.is_empty() {
        info!(%peer, sessions = abandoned.len(), "abandoning sessions of closed connection");
        scheduler.abandon(&abandoned, "connection closed").await;
    }
    if let Err(e) = writer_task.await {
        error!(%peer, error = %e, "writer task failed");
    }
    info!(%peer, "connection closed");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
