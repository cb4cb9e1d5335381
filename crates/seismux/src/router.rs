//! Result router - demultiplexes inbound fragments and failures to sessions.
//!
//! One task reads the inbound source and is the only writer to session
//! channels. It tracks which sequence numbers each job has delivered and
//! releases the session once all `m` are in, which closes the channels the
//! assembler is draining.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{
    CorrelationId, Envelope, FailureNotice, Fragment, Message, Multipart, RoutingToken,
};
use crate::bridge::transport::MessageSource;
use crate::session::{Delivery, SessionTable};

/// How often trackers for sessions released elsewhere are dropped.
const PRUNE_INTERVAL: Duration = Duration::from_secs(5);

/// Router counters. Monotonic for the life of the router.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    fragments_routed: AtomicU64,
    duplicate_fragments: AtomicU64,
    unknown_session: AtomicU64,
    misrouted: AtomicU64,
    malformed_envelopes: AtomicU64,
    failures_routed: AtomicU64,
    jobs_completed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterMetricsSnapshot {
    pub fragments_routed: u64,
    pub duplicate_fragments: u64,
    pub unknown_session: u64,
    pub misrouted: u64,
    pub malformed_envelopes: u64,
    pub failures_routed: u64,
    pub jobs_completed: u64,
}

impl RouterMetrics {
    pub fn snapshot(&self) -> RouterMetricsSnapshot {
        RouterMetricsSnapshot {
            fragments_routed: self.fragments_routed.load(Ordering::Relaxed),
            duplicate_fragments: self.duplicate_fragments.load(Ordering::Relaxed),
            unknown_session: self.unknown_session.load(Ordering::Relaxed),
            misrouted: self.misrouted.load(Ordering::Relaxed),
            malformed_envelopes: self.malformed_envelopes.load(Ordering::Relaxed),
            failures_routed: self.failures_routed.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Handle to the running router task.
pub struct ResultRouter {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    metrics: Arc<RouterMetrics>,
}

impl ResultRouter {
    /// Spawn the routing loop over `source`.
    pub fn start<S>(source: S, sessions: Arc<SessionTable>) -> Self
    where
        S: MessageSource + 'static,
    {
        let cancel = CancellationToken::new();
        let metrics = Arc::new(RouterMetrics::default());
        let routing = RoutingLoop {
            sessions,
            metrics: Arc::clone(&metrics),
            trackers: HashMap::new(),
        };
        let task = tokio::spawn(routing.run(source, cancel.clone()));
        tracing::info!(target: "seismux::router", "Result router started");

        Self {
            cancel,
            task: Some(task),
            metrics,
        }
    }

    pub fn metrics(&self) -> RouterMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn metrics_handle(&self) -> Arc<RouterMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::error!(target: "seismux::router", error = %e, "Result router task failed");
        }
    }
}

impl Drop for ResultRouter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Per-job sequence bookkeeping. Lives only in the router.
struct FragmentTracker {
    seen: Vec<bool>,
    received: usize,
}

enum Rejection {
    Duplicate,
    CountMismatch { expected: usize },
}

impl FragmentTracker {
    fn new(count: u32) -> Self {
        Self {
            seen: vec![false; count as usize],
            received: 0,
        }
    }

    fn check(&self, fragment: &Fragment) -> Result<(), Rejection> {
        if fragment.count as usize != self.seen.len() {
            return Err(Rejection::CountMismatch {
                expected: self.seen.len(),
            });
        }
        if self.seen[fragment.index as usize] {
            return Err(Rejection::Duplicate);
        }
        Ok(())
    }

    /// Record a delivered index. Returns true once every index is in.
    fn mark(&mut self, index: u32) -> bool {
        if let Some(seen) = self.seen.get_mut(index as usize)
            && !*seen
        {
            *seen = true;
            self.received += 1;
        }
        self.received == self.seen.len()
    }
}

struct RoutingLoop {
    sessions: Arc<SessionTable>,
    metrics: Arc<RouterMetrics>,
    trackers: HashMap<CorrelationId, FragmentTracker>,
}

impl RoutingLoop {
    async fn run<S: MessageSource>(mut self, mut source: S, cancel: CancellationToken) {
        let mut prune = tokio::time::interval(PRUNE_INTERVAL);
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::info!(target: "seismux::router", "Result router stopping");
                    break;
                }

                inbound = source.recv() => match inbound {
                    Some(Ok(message)) => self.handle(message),
                    Some(Err(e)) => {
                        bump(&self.metrics.malformed_envelopes);
                        tracing::warn!(target: "seismux::router", error = %e, "Inbound transport error");
                    }
                    None => {
                        tracing::warn!(target: "seismux::router", "Inbound source closed");
                        break;
                    }
                },

                _ = prune.tick() => self.prune(),
            }
        }

        tracing::info!(
            target: "seismux::router",
            pending = self.trackers.len(),
            "Result router exiting"
        );
    }

    fn handle(&mut self, message: Multipart) {
        let envelope = match Envelope::try_from(message) {
            Ok(envelope) => envelope,
            Err(e) => {
                bump(&self.metrics.malformed_envelopes);
                tracing::warn!(target: "seismux::router", error = %e, "Dropping malformed envelope");
                return;
            }
        };

        let Envelope {
            routing_token,
            correlation_id,
            message,
        } = envelope;

        match message {
            Message::Fragment(fragment) => {
                self.on_fragment(correlation_id, &routing_token, fragment)
            }
            Message::Failure(notice) => self.on_failure(correlation_id, &routing_token, notice),
            Message::Job { .. } => {
                bump(&self.metrics.malformed_envelopes);
                tracing::warn!(
                    target: "seismux::router",
                    %correlation_id,
                    "Dropping job envelope on inbound path"
                );
            }
        }
    }

    fn on_fragment(
        &mut self,
        correlation_id: CorrelationId,
        routing_token: &RoutingToken,
        fragment: Fragment,
    ) {
        let (index, count) = (fragment.index, fragment.count);

        if let Some(tracker) = self.trackers.get(&correlation_id) {
            match tracker.check(&fragment) {
                Ok(()) => {}
                Err(Rejection::Duplicate) => {
                    bump(&self.metrics.duplicate_fragments);
                    tracing::debug!(target: "seismux::router", %correlation_id, n = index, m = count, "Ignoring duplicate fragment");
                    return;
                }
                Err(Rejection::CountMismatch { expected }) => {
                    bump(&self.metrics.malformed_envelopes);
                    tracing::warn!(
                        target: "seismux::router",
                        %correlation_id,
                        n = index,
                        m = count,
                        expected,
                        "Dropping fragment with inconsistent count"
                    );
                    return;
                }
            }
        }

        match self
            .sessions
            .route_fragment(&correlation_id, routing_token, fragment)
        {
            Delivery::Delivered => {}
            Delivery::UnknownSession | Delivery::Abandoned => {
                bump(&self.metrics.unknown_session);
                self.forget(&correlation_id);
                tracing::debug!(target: "seismux::router", %correlation_id, n = index, "Dropping fragment for unknown session");
                return;
            }
            Delivery::Misrouted => {
                bump(&self.metrics.misrouted);
                tracing::warn!(target: "seismux::router", %correlation_id, %routing_token, "Dropping misrouted fragment");
                return;
            }
        }

        bump(&self.metrics.fragments_routed);
        tracing::trace!(target: "seismux::router", %correlation_id, n = index, m = count, "Fragment routed");

        let complete = self
            .trackers
            .entry(correlation_id.clone())
            .or_insert_with(|| FragmentTracker::new(count))
            .mark(index);
        if complete {
            self.forget(&correlation_id);
            bump(&self.metrics.jobs_completed);
            tracing::debug!(target: "seismux::job", %correlation_id, m = count, "All fragments routed");
        }
    }

    fn on_failure(
        &mut self,
        correlation_id: CorrelationId,
        routing_token: &RoutingToken,
        notice: FailureNotice,
    ) {
        let kind = notice.kind;
        match self
            .sessions
            .route_failure(&correlation_id, routing_token, notice)
        {
            Delivery::Delivered => {
                bump(&self.metrics.failures_routed);
                self.forget(&correlation_id);
                tracing::info!(target: "seismux::job", %correlation_id, %kind, "Job failed");
            }
            Delivery::UnknownSession | Delivery::Abandoned => {
                bump(&self.metrics.unknown_session);
                self.forget(&correlation_id);
                tracing::debug!(target: "seismux::router", %correlation_id, %kind, "Dropping failure for unknown session");
            }
            Delivery::Misrouted => {
                bump(&self.metrics.misrouted);
                tracing::warn!(target: "seismux::router", %correlation_id, %routing_token, "Dropping misrouted failure");
            }
        }
    }

    /// Drop tracking for a job and release its session, closing its channels.
    fn forget(&mut self, correlation_id: &CorrelationId) {
        self.trackers.remove(correlation_id);
        self.sessions.release(correlation_id);
    }

    fn prune(&mut self) {
        let sessions = &self.sessions;
        let before = self.trackers.len();
        self.trackers.retain(|id, _| sessions.contains(id));
        let pruned = before - self.trackers.len();
        if pruned > 0 {
            tracing::debug!(target: "seismux::router", pruned, "Pruned trackers for released sessions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler;
    use crate::bridge::protocol::FailureKind;
    use crate::bridge::transport::{self, ChannelSink, MessageSink};
    use crate::session::SessionIo;
    use tokio_util::bytes::Bytes;

    struct Harness {
        sessions: Arc<SessionTable>,
        inbound: ChannelSink,
        router: ResultRouter,
    }

    impl Harness {
        fn start() -> Self {
            let sessions = SessionTable::new();
            let (inbound, source) = transport::channel(256);
            let router = ResultRouter::start(source, Arc::clone(&sessions));
            Self {
                sessions,
                inbound,
                router,
            }
        }

        fn register(&self, id: &str) -> (SessionIo, RoutingToken) {
            let token = RoutingToken::new();
            let io = self
                .sessions
                .register(&CorrelationId::from(id), token.clone())
                .unwrap();
            (io, token)
        }

        async fn fragment(&self, token: &RoutingToken, id: &str, n: u32, m: u32) {
            let fragment = Fragment::new(n, m, Bytes::from(format!("{}:{}", id, n))).unwrap();
            let envelope = Envelope::fragment(token.clone(), CorrelationId::from(id), fragment);
            self.inbound.send(envelope.into_multipart()).await.unwrap();
        }

        async fn failure(&self, token: &RoutingToken, id: &str, kind: FailureKind) {
            let envelope = Envelope::failure(
                token.clone(),
                CorrelationId::from(id),
                FailureNotice::new(kind, "worker said no"),
            );
            self.inbound.send(envelope.into_multipart()).await.unwrap();
        }

        /// Wait until the router has consumed everything sent so far.
        ///
        /// Tests run on a current-thread runtime, so once the router has
        /// received a message it has also handled it.
        async fn settle(&self) {
            while self.inbound.pending() > 0 {
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test]
    async fn releases_session_after_all_fragments() {
        let harness = Harness::start();
        let (io, token) = harness.register("pid-1");

        for n in [2, 0, 1] {
            harness.fragment(&token, "pid-1", n, 3).await;
        }

        let assembled = assembler::assemble(io, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            assembled.fragments(),
            &[
                Bytes::from("pid-1:0"),
                Bytes::from("pid-1:1"),
                Bytes::from("pid-1:2")
            ]
        );
        assert!(harness.sessions.is_empty());
        assert_eq!(harness.router.metrics().jobs_completed, 1);
    }

    #[tokio::test]
    async fn duplicate_fragment_counted_once() {
        let harness = Harness::start();
        let (io, token) = harness.register("pid-1");

        harness.fragment(&token, "pid-1", 0, 2).await;
        harness.fragment(&token, "pid-1", 0, 2).await;
        harness.fragment(&token, "pid-1", 1, 2).await;

        let assembled = assembler::assemble(io, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(assembled.fragments().len(), 2);

        let metrics = harness.router.metrics();
        assert_eq!(metrics.duplicate_fragments, 1);
        assert_eq!(metrics.fragments_routed, 2);
    }

    #[tokio::test]
    async fn failure_releases_session() {
        let harness = Harness::start();
        let (io, token) = harness.register("pid-1");

        harness.fragment(&token, "pid-1", 0, 4).await;
        harness.failure(&token, "pid-1", FailureKind::NotFound).await;

        let err = assembler::assemble(io, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            crate::error::JobError::WorkerFailure {
                kind: FailureKind::NotFound,
                ..
            }
        ));
        assert!(harness.sessions.is_empty());
        assert_eq!(harness.router.metrics().failures_routed, 1);
    }

    #[tokio::test]
    async fn unknown_session_dropped_without_affecting_others() {
        let harness = Harness::start();
        let (io, token) = harness.register("live");

        harness.fragment(&token, "ghost", 0, 1).await;
        harness.failure(&token, "ghost", FailureKind::Internal).await;
        harness.fragment(&token, "live", 0, 1).await;

        let assembled = assembler::assemble(io, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(assembled.concat(), Bytes::from("live:0"));
        assert_eq!(harness.router.metrics().unknown_session, 2);
    }

    #[tokio::test]
    async fn mismatched_token_is_misrouted() {
        let harness = Harness::start();
        let (io, _token) = harness.register("pid-1");

        harness.fragment(&RoutingToken::new(), "pid-1", 0, 1).await;
        harness.settle().await;

        assert_eq!(harness.router.metrics().misrouted, 1);
        assert!(harness.sessions.contains(io.correlation_id()));
    }

    #[tokio::test]
    async fn inconsistent_count_dropped() {
        let harness = Harness::start();
        let (mut io, token) = harness.register("pid-1");

        harness.fragment(&token, "pid-1", 0, 3).await;
        harness.fragment(&token, "pid-1", 1, 2).await;
        harness.settle().await;

        assert_eq!(harness.router.metrics().malformed_envelopes, 1);
        assert_eq!(io.results.recv().await.unwrap().index, 0);
        assert!(io.results.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_and_inbound_jobs_dropped() {
        let harness = Harness::start();

        let garbage = Multipart::new(vec![Bytes::from_static(b"only-one-part")]);
        harness.inbound.send(garbage).await.unwrap();
        let job = Envelope::job(RoutingToken::new(), CorrelationId::new(), Bytes::new());
        harness.inbound.send(job.into_multipart()).await.unwrap();
        harness.settle().await;

        assert_eq!(harness.router.metrics().malformed_envelopes, 2);
        assert!(harness.router.is_running());
    }

    #[tokio::test]
    async fn late_fragment_after_release_is_counted() {
        let harness = Harness::start();
        let (io, token) = harness.register("pid-1");

        harness.fragment(&token, "pid-1", 0, 2).await;
        harness.settle().await;
        drop(io);

        harness.fragment(&token, "pid-1", 1, 2).await;
        harness.settle().await;

        assert_eq!(harness.router.metrics().unknown_session, 1);
        assert!(harness.sessions.is_empty());
    }

    #[tokio::test]
    async fn stop_ends_loop() {
        let harness = Harness::start();
        assert!(harness.router.is_running());
        harness.router.stop().await;
    }

    #[tokio::test]
    async fn closed_source_ends_loop() {
        let Harness {
            sessions: _sessions,
            inbound,
            router,
        } = Harness::start();
        drop(inbound);

        while router.is_running() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn routes_interleaved_fragments_for_many_jobs() {
        const JOBS: usize = 32;
        const FRAGMENTS: u32 = 5;

        let harness = Harness::start();
        let mut waiting = Vec::new();
        let mut tokens = Vec::new();
        for i in 0..JOBS {
            let id = format!("job-{}", i);
            let (io, token) = harness.register(&id);
            tokens.push((id, token));
            waiting.push(tokio::spawn(assembler::assemble(io, Duration::from_secs(10))));
        }

        // Interleave: fragment n of every job, highest n first.
        for n in (0..FRAGMENTS).rev() {
            for (id, token) in tokens.iter().rev() {
                harness.fragment(token, id, n, FRAGMENTS).await;
            }
        }

        for (i, handle) in waiting.into_iter().enumerate() {
            let assembled = handle.await.unwrap().unwrap();
            let expected: Vec<Bytes> = (0..FRAGMENTS)
                .map(|n| Bytes::from(format!("job-{}:{}", i, n)))
                .collect();
            assert_eq!(assembled.fragments(), expected.as_slice());
        }

        assert!(harness.sessions.is_empty());
        let metrics = harness.router.metrics();
        assert_eq!(metrics.jobs_completed, JOBS as u64);
        assert_eq!(metrics.fragments_routed, JOBS as u64 * FRAGMENTS as u64);
    }
}
