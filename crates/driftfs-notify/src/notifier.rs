//! Transport orchestration
//!
//! Runs the configured transports in preference order with exponential
//! reconnect backoff (1 s doubling to 60 s, ±10 % jitter, reset on a
//! healthy connection). A transport that keeps failing is set aside and the
//! next one takes over; when every transport is down the notifier reports
//! unhealthy and the delta loop polls on its fallback cadence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use driftfs_core::domain::{DriftError, TransportKind};
use driftfs_core::ports::transport::ChangeHint;

/// Reconnect backoff floor
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Reconnect backoff ceiling
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Consecutive failures before falling over to the next transport
const FAILOVER_AFTER: u32 = 5;
/// A connection that lived this long resets the backoff
const STABLE_AFTER: Duration = Duration::from_secs(60);
/// Pause before retrying the whole transport list from the top
const LIST_RETRY_PAUSE: Duration = Duration::from_secs(5 * 60);

/// A pluggable change-notification transport
///
/// `run_once` connects, marks `connected` while the transport is live, and
/// pumps hints until the connection drops or `shutdown` fires. Returning
/// `Ok` means an orderly shutdown; `Err` means the connection failed and
/// the notifier decides whether to reconnect.
#[async_trait::async_trait]
pub trait ChangeTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn run_once(
        &self,
        hints: mpsc::Sender<ChangeHint>,
        connected: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) -> Result<(), DriftError>;
}

/// Constant-time health view handed to the delta sync loop
#[derive(Clone)]
pub struct NotifierHandle {
    healthy: Arc<AtomicBool>,
}

impl NotifierHandle {
    /// Whether a push transport is currently delivering hints
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

/// Orchestrates the transports and exposes the health signal
pub struct ChangeNotifier {
    transports: Vec<Arc<dyn ChangeTransport>>,
    hints: mpsc::Sender<ChangeHint>,
    healthy: Arc<AtomicBool>,
}

impl ChangeNotifier {
    pub fn new(
        transports: Vec<Arc<dyn ChangeTransport>>,
        hints: mpsc::Sender<ChangeHint>,
    ) -> (Self, NotifierHandle) {
        let healthy = Arc::new(AtomicBool::new(false));
        let handle = NotifierHandle {
            healthy: healthy.clone(),
        };
        (
            Self {
                transports,
                hints,
                healthy,
            },
            handle,
        )
    }

    /// Runs until `shutdown` fires
    ///
    /// Each transport gets [`FAILOVER_AFTER`] consecutive attempts with
    /// backoff before the next transport takes over. When the list is
    /// exhausted the notifier waits and starts over from the preferred
    /// transport.
    pub async fn run(&self, shutdown: CancellationToken) {
        if self.transports.is_empty() {
            info!("No change transports configured, relying on polling");
            return;
        }

        'outer: loop {
            for transport in &self.transports {
                let mut consecutive_failures = 0u32;

                while consecutive_failures < FAILOVER_AFTER {
                    if shutdown.is_cancelled() {
                        break 'outer;
                    }

                    let started = Instant::now();
                    let result = transport
                        .run_once(self.hints.clone(), self.healthy.clone(), shutdown.clone())
                        .await;
                    self.healthy.store(false, Ordering::Release);

                    match result {
                        Ok(()) => break 'outer, // orderly shutdown
                        Err(e) => {
                            if started.elapsed() >= STABLE_AFTER {
                                consecutive_failures = 0;
                            }
                            consecutive_failures += 1;

                            let delay = backoff_with_jitter(consecutive_failures);
                            warn!(
                                transport = ?transport.kind(),
                                consecutive_failures,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Change transport failed, reconnecting"
                            );

                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = shutdown.cancelled() => break 'outer,
                            }
                        }
                    }
                }

                warn!(
                    transport = ?transport.kind(),
                    "Transport failing persistently, trying next transport"
                );
            }

            info!(
                pause_secs = LIST_RETRY_PAUSE.as_secs(),
                "All change transports down, falling back to pure polling"
            );
            tokio::select! {
                _ = tokio::time::sleep(LIST_RETRY_PAUSE) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        self.healthy.store(false, Ordering::Release);
        info!("Change notifier stopped");
    }
}

/// Exponential backoff with ±10 % jitter: 1 s, 2 s, 4 s, ... capped at 60 s
fn backoff_with_jitter(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    let base = BACKOFF_BASE * 2u32.pow(exp);
    let base = std::cmp::min(base, BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    Duration::from_secs_f64(base.as_secs_f64() * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingTransport {
        kind: TransportKind,
        attempts: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ChangeTransport for FailingTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn run_once(
            &self,
            _hints: mpsc::Sender<ChangeHint>,
            _connected: Arc<AtomicBool>,
            _shutdown: CancellationToken,
        ) -> Result<(), DriftError> {
            self.attempts.store(true, Ordering::SeqCst);
            Err(DriftError::Network("refused".into()))
        }
    }

    #[test]
    fn test_backoff_doubles_with_cap() {
        for attempt in 1..=10u32 {
            let delay = backoff_with_jitter(attempt);
            let expected = std::cmp::min(
                BACKOFF_BASE * 2u32.pow(attempt.saturating_sub(1).min(6)),
                BACKOFF_CAP,
            );
            let lower = expected.as_secs_f64() * 0.9;
            let upper = expected.as_secs_f64() * 1.1;
            let actual = delay.as_secs_f64();
            assert!(
                actual >= lower && actual <= upper,
                "attempt {attempt}: {actual} outside [{lower}, {upper}]"
            );
        }
    }

    #[test]
    fn test_backoff_caps_at_sixty_seconds() {
        let delay = backoff_with_jitter(30);
        assert!(delay <= Duration::from_secs_f64(60.0 * 1.1));
    }

    #[tokio::test]
    async fn test_handle_reports_unhealthy_initially() {
        let (tx, _rx) = mpsc::channel(4);
        let (_notifier, handle) = ChangeNotifier::new(Vec::new(), tx);
        assert!(!handle.healthy());
    }

    #[tokio::test]
    async fn test_empty_transport_list_returns_immediately() {
        let (tx, _rx) = mpsc::channel(4);
        let (notifier, _handle) = ChangeNotifier::new(Vec::new(), tx);
        notifier.run(CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_reconnect_loop() {
        let attempts = Arc::new(AtomicBool::new(false));
        let transport = Arc::new(FailingTransport {
            kind: TransportKind::Socket,
            attempts: attempts.clone(),
        });

        let (tx, _rx) = mpsc::channel(4);
        let (notifier, handle) = ChangeNotifier::new(vec![transport], tx);

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        notifier.run(shutdown).await;
        assert!(attempts.load(Ordering::SeqCst));
        assert!(!handle.healthy());
    }
}
