//! Orchestrator side of the transport.
//!
//! A reader task demultiplexes replies to the pending request with the same
//! `(session_id, seq)`; a writer task owns the write half. Any number of
//! sessions can share one [`SchedulerClient`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use split_types::endpoint::parse_endpoint;
use split_types::wire::StatusReport;
use split_types::{Envelope, MessageBody};

use crate::codec::FrameCodec;
use crate::error::{NetError, Result};
use crate::CHANNEL_CAPACITY;

type Pending = Arc<Mutex<HashMap<(String, u64), oneshot::Sender<Envelope>>>>;

pub struct SchedulerClient {
    writer_tx: mpsc::Sender<Envelope>,
    pending: Pending,
    reader: JoinHandle<()>,
    status_seq: AtomicU64,
}

impl SchedulerClient {
    pub async fn connect(endpoint: &str, connect_timeout: Duration, codec: FrameCodec) -> Result<Self> {
        let addr = parse_endpoint(endpoint).map_err(NetError::Endpoint)?;
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| NetError::Timeout(connect_timeout))??;
        stream.set_nodelay(true)?;
        debug!(endpoint = %addr, "connected to scheduler");

        let (mut read_half, mut write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Envelope>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(env) = writer_rx.recv().await {
                if let Err(e) = codec.write_envelope(&mut write_half, &env).await {
                    warn!(error = %e, "request write failed");
                    break;
                }
            }
        });

        let pending: Pending = Arc::default();
        let demux = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            loop {
                match codec.read_envelope(&mut read_half).await {
                    Ok(Some(reply)) => {
                        let key = (reply.session_id.clone(), reply.seq);
                        match lock(&demux).remove(&key) {
                            Some(waiter) => {
                                let _ = waiter.send(reply);
                            }
                            None => debug!(session_id = %key.0, seq = key.1, "reply with no waiter dropped"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "reply read failed");
                        break;
                    }
                }
            }
            // Wake every waiter with `Closed`.
            lock(&demux).clear();
        });

        Ok(Self { writer_tx, pending, reader, status_seq: AtomicU64::new(1) })
    }

    /// Send `request` and wait up to `timeout` for the reply carrying the
    /// same `(session_id, seq)`.
    pub async fn request(&self, request: Envelope, timeout: Duration) -> Result<Envelope> {
        if !self.is_connected() {
            return Err(NetError::Closed);
        }
        let key = (request.session_id.clone(), request.seq);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(key.clone(), tx);

        if self.writer_tx.send(request).await.is_err() {
            lock(&self.pending).remove(&key);
            return Err(NetError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(NetError::Closed),
            Err(_) => {
                lock(&self.pending).remove(&key);
                Err(NetError::Timeout(timeout))
            }
        }
    }

    pub async fn status(&self, timeout: Duration) -> Result<StatusReport> {
        // Status queries carry no session; a private counter keeps
        // concurrent queries apart.
        let seq = self.status_seq.fetch_add(1, Ordering::Relaxed);
        let reply = self.request(Envelope::new("", seq, MessageBody::StatusQuery), timeout).await?;
        match reply.body {
            MessageBody::Status(report) => Ok(report),
            MessageBody::Error(e) => Err(NetError::Remote(e)),
            other => Err(NetError::Unexpected(other.kind_name())),
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished()
    }
}

impl Drop for SchedulerClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
