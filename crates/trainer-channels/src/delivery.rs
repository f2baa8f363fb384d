//! Bridge from the scheduler's worker thread onto the messaging event loop.
//!
//! A send is spawned on the loop through its [`Handle`] and the worker blocks
//! on a rendezvous channel for at most the configured timeout. Every outcome,
//! including "no loop to run on", comes back as a [`DeliveryOutcome`] value.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::channel::{MessageId, MessagingChannel};
use crate::error::ChannelError;

/// Shared slot holding the event loop the channel lives on.
///
/// The binary binds it once the runtime is up and clears it on shutdown.
#[derive(Clone, Default)]
pub struct LoopHandle {
    inner: Arc<RwLock<Option<Handle>>>,
}

impl LoopHandle {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn bind(&self, handle: Handle) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Bind the runtime the caller is running on. Returns `false` outside one.
    pub fn bind_current(&self) -> bool {
        match Handle::try_current() {
            Ok(handle) => {
                self.bind(handle);
                true
            }
            Err(_) => false,
        }
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_bound(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The bound handle, or the caller's own runtime if nothing is bound.
    fn resolve(&self) -> Option<Handle> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .or_else(|| Handle::try_current().ok())
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success { message_id: MessageId },
    /// No reply within the bound. The send may still complete on the loop.
    Timeout { after: Duration },
    ChannelError { detail: String },
    /// There is no running event loop to deliver on. Not retried.
    LoopUnavailable,
}

impl DeliveryOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryOutcome::Success { .. } => "success",
            DeliveryOutcome::Timeout { .. } => "timeout",
            DeliveryOutcome::ChannelError { .. } => "channel_error",
            DeliveryOutcome::LoopUnavailable => "loop_unavailable",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success { .. })
    }

    pub fn detail(&self) -> String {
        match self {
            DeliveryOutcome::Success { message_id } => format!("message {message_id}"),
            DeliveryOutcome::Timeout { after } => format!("no reply after {after:?}"),
            DeliveryOutcome::ChannelError { detail } => detail.clone(),
            DeliveryOutcome::LoopUnavailable => "no live event loop".to_string(),
        }
    }
}

enum Submit {
    Reply(Result<MessageId, ChannelError>),
    TimedOut,
    /// The task was dropped without replying: the runtime is gone.
    LoopGone,
}

pub struct DeliveryAdapter {
    loop_handle: LoopHandle,
    channel: Arc<dyn MessagingChannel>,
    timeout: Duration,
}

impl DeliveryAdapter {
    pub fn new(loop_handle: LoopHandle, channel: Arc<dyn MessagingChannel>, timeout: Duration) -> Self {
        Self {
            loop_handle,
            channel,
            timeout,
        }
    }

    pub fn channel_name(&self) -> &str {
        self.channel.name()
    }

    pub fn deliver(&self, recipient: i64, payload: &str) -> DeliveryOutcome {
        self.deliver_with_timeout(recipient, payload, self.timeout)
    }

    /// Send `payload` to `recipient`, blocking the calling thread for at most
    /// `timeout`. Must not be called from a thread of the target runtime.
    pub fn deliver_with_timeout(&self, recipient: i64, payload: &str, timeout: Duration) -> DeliveryOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();
        let outcome = self.attempt(recipient, payload, timeout);
        let elapsed_ms = clock.elapsed().as_millis() as u64;

        match &outcome {
            DeliveryOutcome::Success { message_id } => info!(
                channel = self.channel.name(),
                recipient,
                started_at = %started_at,
                elapsed_ms,
                message_id = message_id.0,
                outcome = outcome.kind(),
                "delivery attempt"
            ),
            other => warn!(
                channel = self.channel.name(),
                recipient,
                started_at = %started_at,
                elapsed_ms,
                outcome = other.kind(),
                detail = %other.detail(),
                "delivery attempt"
            ),
        }
        outcome
    }

    fn attempt(&self, recipient: i64, payload: &str, timeout: Duration) -> DeliveryOutcome {
        let Some(handle) = self.loop_handle.resolve() else {
            return DeliveryOutcome::LoopUnavailable;
        };
        let deadline = Instant::now() + timeout;

        match self.submit(&handle, recipient, payload, timeout) {
            Submit::Reply(result) => return reply_outcome(result),
            Submit::TimedOut => return DeliveryOutcome::Timeout { after: timeout },
            Submit::LoopGone => debug!("captured loop is gone, re-acquiring"),
        }

        // One more try on whatever loop is live now.
        let Some(handle) = self.loop_handle.resolve() else {
            return DeliveryOutcome::LoopUnavailable;
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.submit(&handle, recipient, payload, remaining) {
            Submit::Reply(result) => reply_outcome(result),
            Submit::TimedOut => DeliveryOutcome::Timeout { after: timeout },
            Submit::LoopGone => DeliveryOutcome::LoopUnavailable,
        }
    }

    fn submit(&self, handle: &Handle, recipient: i64, payload: &str, timeout: Duration) -> Submit {
        let (tx, rx) = mpsc::sync_channel(1);
        let channel = Arc::clone(&self.channel);
        let text = payload.to_owned();

        handle.spawn(async move {
            // Bounded on the loop too, so a send nobody waits for is dropped.
            let send = tokio::spawn(async move {
                tokio::time::timeout(timeout, channel.send(recipient, &text)).await
            });
            let reply = match send.await {
                Ok(Ok(result)) => Some(result),
                Ok(Err(_elapsed)) => None,
                Err(e) if e.is_panic() => {
                    Some(Err(ChannelError::SendFailed("send task panicked".into())))
                }
                // Cancelled: the runtime is shutting down. Dropping `tx` tells the worker.
                Err(_) => return,
            };
            // The worker may have timed out and gone; nothing to do then.
            let _ = tx.try_send(reply);
        });

        match rx.recv_timeout(timeout) {
            Ok(Some(result)) => Submit::Reply(result),
            Ok(None) | Err(RecvTimeoutError::Timeout) => Submit::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Submit::LoopGone,
        }
    }
}

fn reply_outcome(result: Result<MessageId, ChannelError>) -> DeliveryOutcome {
    match result {
        Ok(message_id) => DeliveryOutcome::Success { message_id },
        Err(e) => DeliveryOutcome::ChannelError {
            detail: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::runtime::{Builder, Runtime};

    use super::*;

    fn runtime() -> Runtime {
        Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    #[derive(Default)]
    struct Echo {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl MessagingChannel for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn send(&self, recipient: i64, _text: &str) -> Result<MessageId, ChannelError> {
            // Runs on the loop, so tokio timers are available.
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(MessageId(recipient * 10))
        }
    }

    struct Silent;

    #[async_trait]
    impl MessagingChannel for Silent {
        fn name(&self) -> &str {
            "silent"
        }

        async fn send(&self, _recipient: i64, _text: &str) -> Result<MessageId, ChannelError> {
            std::future::pending().await
        }
    }

    struct Refusing;

    #[async_trait]
    impl MessagingChannel for Refusing {
        fn name(&self) -> &str {
            "refusing"
        }

        async fn send(&self, recipient: i64, _text: &str) -> Result<MessageId, ChannelError> {
            Err(ChannelError::RecipientUnreachable(recipient))
        }
    }

    struct Exploding;

    #[async_trait]
    impl MessagingChannel for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        async fn send(&self, _recipient: i64, _text: &str) -> Result<MessageId, ChannelError> {
            panic!("client bug")
        }
    }

    #[test]
    fn delivers_through_the_bound_loop() {
        let rt = runtime();
        let handle = LoopHandle::empty();
        handle.bind(rt.handle().clone());
        let echo = Arc::new(Echo::default());
        let adapter = DeliveryAdapter::new(handle, echo.clone(), Duration::from_secs(2));

        let outcome = adapter.deliver(7, "hola");
        assert_eq!(
            outcome,
            DeliveryOutcome::Success {
                message_id: MessageId(70)
            }
        );
        assert_eq!(echo.sent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn silent_channel_times_out_within_bound() {
        let rt = runtime();
        let handle = LoopHandle::empty();
        handle.bind(rt.handle().clone());
        let adapter = DeliveryAdapter::new(handle, Arc::new(Silent), Duration::from_secs(30));

        let started = Instant::now();
        let outcome = adapter.deliver_with_timeout(7, "hola", Duration::from_millis(300));
        let elapsed = started.elapsed();

        assert_eq!(outcome.kind(), "timeout");
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    }

    /// Never answers, and records when the pending send is dropped.
    struct Hanging {
        dropped: Arc<AtomicBool>,
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MessagingChannel for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn send(&self, _recipient: i64, _text: &str) -> Result<MessageId, ChannelError> {
            let _guard = SetOnDrop(Arc::clone(&self.dropped));
            std::future::pending().await
        }
    }

    #[test]
    fn timed_out_send_does_not_linger_on_the_loop() {
        let rt = runtime();
        let handle = LoopHandle::empty();
        handle.bind(rt.handle().clone());
        let dropped = Arc::new(AtomicBool::new(false));
        let adapter = DeliveryAdapter::new(
            handle,
            Arc::new(Hanging {
                dropped: Arc::clone(&dropped),
            }),
            Duration::from_secs(30),
        );

        let outcome = adapter.deliver_with_timeout(7, "hola", Duration::from_millis(200));
        assert_eq!(outcome.kind(), "timeout");

        let deadline = Instant::now() + Duration::from_secs(3);
        while !dropped.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(dropped.load(Ordering::SeqCst), "send still pending on the loop");
    }

    #[test]
    fn channel_errors_are_returned_not_raised() {
        let rt = runtime();
        let handle = LoopHandle::empty();
        handle.bind(rt.handle().clone());
        let adapter = DeliveryAdapter::new(handle, Arc::new(Refusing), Duration::from_secs(2));

        match adapter.deliver(99, "hola") {
            DeliveryOutcome::ChannelError { detail } => assert!(detail.contains("99")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn panicking_send_is_a_channel_error() {
        let rt = runtime();
        let handle = LoopHandle::empty();
        handle.bind(rt.handle().clone());
        let adapter = DeliveryAdapter::new(handle, Arc::new(Exploding), Duration::from_secs(2));

        assert_eq!(adapter.deliver(1, "hola").kind(), "channel_error");
    }

    #[test]
    fn no_loop_is_a_configuration_failure() {
        let adapter =
            DeliveryAdapter::new(LoopHandle::empty(), Arc::new(Echo::default()), Duration::from_secs(1));
        assert_eq!(adapter.deliver(1, "hola"), DeliveryOutcome::LoopUnavailable);
    }

    #[test]
    fn dead_loop_is_detected_without_waiting_for_timeout() {
        let rt = runtime();
        let handle = LoopHandle::empty();
        handle.bind(rt.handle().clone());
        drop(rt);

        let adapter = DeliveryAdapter::new(handle, Arc::new(Echo::default()), Duration::from_secs(5));
        let started = Instant::now();
        assert_eq!(adapter.deliver(1, "hola"), DeliveryOutcome::LoopUnavailable);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn rebinding_after_restart_restores_delivery() {
        let handle = LoopHandle::empty();
        let old = runtime();
        handle.bind(old.handle().clone());
        drop(old);

        let fresh = runtime();
        handle.clear();
        assert!(!handle.is_bound());
        handle.bind(fresh.handle().clone());

        let adapter = DeliveryAdapter::new(handle, Arc::new(Echo::default()), Duration::from_secs(2));
        assert!(adapter.deliver(3, "hola").is_success());
    }

    #[test]
    fn bind_current_inside_a_runtime() {
        let rt = runtime();
        let handle = LoopHandle::empty();
        assert!(!handle.bind_current());
        let bound = rt.block_on(async {
            let h = handle.clone();
            h.bind_current()
        });
        assert!(bound);
        assert!(handle.is_bound());
    }
}
