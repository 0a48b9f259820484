//! `split-net`: TCP transport between orchestrators and the scheduler.
//!
//! Every frame is `[u32 big-endian length][bincode Envelope]`. Replies echo
//! the request's `(session_id, seq)`, so one connection carries any number
//! of interleaved sessions.

// ── Module declarations ───────────────────────────────────────────────────────

pub mod client;
pub mod codec;
pub mod error;
pub mod server;

// ── Public re-exports ─────────────────────────────────────────────────────────

pub use client::SchedulerClient;
pub use codec::{decode_envelope, encode_envelope, FrameCodec};
pub use error::{NetError, Result};
pub use server::Server;

/// Buffer for the per-connection reply and request channels.
pub(crate) const CHANNEL_CAPACITY: usize = 256;

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use split_scheduler::{DeviceRegistry, PlacementPolicy, ReferenceProvider, Scheduler};
    use split_types::config::SchedulerConfig;
    use split_types::wire::{SessionStart, StepRequest};
    use split_types::{Envelope, ErrorKind, MessageBody, SessionPhase, TensorPayload};

    const WAIT: Duration = Duration::from_secs(5);

    fn scheduler() -> Arc<Scheduler> {
        let mut cfg = SchedulerConfig::for_model(4, 2);
        cfg.validate().unwrap();
        let registry = Arc::new(DeviceRegistry::probe(&cfg, &ReferenceProvider).unwrap());
        let policy = PlacementPolicy::from_config(&cfg);
        Arc::new(Scheduler::new(cfg, registry, policy))
    }

    async fn serve(scheduler: Arc<Scheduler>) -> (String, tokio::task::JoinHandle<Result<()>>) {
        let server = Server::bind("tcp://127.0.0.1:0", scheduler, FrameCodec::default()).await.unwrap();
        let endpoint = format!("tcp://{}", server.local_addr().unwrap());
        (endpoint, server.spawn())
    }

    async fn connect(endpoint: &str) -> SchedulerClient {
        SchedulerClient::connect(endpoint, WAIT, FrameCodec::default()).await.unwrap()
    }

    fn start(id: &str) -> Envelope {
        Envelope::new(id, 0, MessageBody::SessionStart(SessionStart { num_layers: 4, max_passes: 1 }))
    }

    fn step(id: &str, seq: u64, layer: u32) -> Envelope {
        Envelope::new(
            id,
            seq,
            MessageBody::Step(StepRequest {
                layer,
                experts: vec![],
                hidden: TensorPayload::from_f32(vec![1, 2], &[0.0, 0.0]),
                deadline_ms: None,
            }),
        )
    }

    #[tokio::test]
    async fn status_over_loopback() {
        let (endpoint, server) = serve(scheduler()).await;
        let client = connect(&endpoint).await;
        let report = client.status(WAIT).await.unwrap();
        assert_eq!(report.active_sessions, 0);
        assert_eq!(report.devices.len(), 1);
        server.abort();
    }

    #[tokio::test]
    async fn full_session_over_loopback() {
        let (endpoint, server) = serve(scheduler()).await;
        let client = connect(&endpoint).await;

        let reply = client.request(start("s1"), WAIT).await.unwrap();
        assert!(matches!(reply.body, MessageBody::SessionAccepted(_)));

        for layer in 0..4 {
            let seq = u64::from(layer) + 1;
            let reply = client.request(step("s1", seq, layer), WAIT).await.unwrap();
            assert_eq!((reply.session_id.as_str(), reply.seq), ("s1", seq));
            match reply.body {
                MessageBody::StepResult(r) => assert_eq!(r.layer, layer),
                other => panic!("unexpected reply {}", other.kind_name()),
            }
        }

        let reply = client
            .request(Envelope::new("s1", 5, MessageBody::SessionEnd { reason: None }), WAIT)
            .await
            .unwrap();
        match reply.body {
            MessageBody::SessionClosed(summary) => {
                assert_eq!(summary.final_phase, Some(SessionPhase::Completed));
                assert_eq!(summary.steps, 4);
            }
            other => panic!("unexpected reply {}", other.kind_name()),
        }
        server.abort();
    }

    #[tokio::test]
    async fn sessions_interleave_on_one_connection() {
        let (endpoint, server) = serve(scheduler()).await;
        let client = Arc::new(connect(&endpoint).await);

        let runs = (0..4).map(|i| {
            let client = Arc::clone(&client);
            async move {
                let id = format!("s{i}");
                client.request(start(&id), WAIT).await.unwrap();
                for layer in 0..4 {
                    let reply = client.request(step(&id, u64::from(layer) + 1, layer), WAIT).await.unwrap();
                    assert!(matches!(reply.body, MessageBody::StepResult(_)), "session {id}");
                }
            }
        });
        futures::future::join_all(runs).await;

        assert_eq!(client.status(WAIT).await.unwrap().total_sessions, 4);
        server.abort();
    }

    #[tokio::test]
    async fn errors_come_back_as_replies() {
        let (endpoint, server) = serve(scheduler()).await;
        let client = connect(&endpoint).await;
        let reply = client.request(step("ghost", 1, 0), WAIT).await.unwrap();
        match reply.body {
            MessageBody::Error(e) => assert_eq!(e.kind, ErrorKind::SessionNotFound),
            other => panic!("unexpected reply {}", other.kind_name()),
        }
        server.abort();
    }

    #[tokio::test]
    async fn dropped_connection_abandons_its_sessions() {
        let sched = scheduler();
        let (endpoint, server) = serve(Arc::clone(&sched)).await;

        let client = connect(&endpoint).await;
        client.request(start("orphan"), WAIT).await.unwrap();
        assert_eq!(sched.active_sessions(), 1);
        drop(client);

        let deadline = tokio::time::Instant::now() + WAIT;
        while sched.active_sessions() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "session was not abandoned");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        server.abort();
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", listener.local_addr().unwrap());
        let hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let client = connect(&endpoint).await;
        let err = client.request(start("s1"), Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportTimeout);
        assert!(matches!(err, NetError::Timeout(_)));
        hold.abort();
    }

    #[tokio::test]
    async fn bad_endpoint_is_rejected() {
        let err = SchedulerClient::connect("udp://127.0.0.1:1", WAIT, FrameCodec::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }
}
