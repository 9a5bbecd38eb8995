//! Drives a [`Source`] in a background task, applying each [`Message`] to a
//! [`Consumer`] (normally the [`crate::store::Store`]) and reconnecting with
//! capped exponential backoff and jitter on stream errors.

use crate::{message::Message, source::Source};
use futures::{future::BoxFuture, Future, FutureExt, StreamExt};
use rand::Rng;
use std::{error::Error as StdError, fmt, sync::Arc, time::Duration};
use tokio::{sync::watch, task, time::sleep};
use tracing::warn;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, thiserror::Error)]
pub enum ReadError<E>
where
    E: Clone + fmt::Debug + StdError + 'static,
{
    #[error("background task stopped before sending result")]
    TaskDropped,

    #[error(transparent)]
    Inner(#[from] E),
}

/// The state of a [`Consumer`] after consuming a message.
pub enum InitState {
    Pending,
    Done,
}

/// A handle to the background task spawned by [`Consumer::read_from`].
///
/// Dropping it leaves the task running; call [`ReaderHandle::shutdown`] to
/// actually stop it and wait for it to exit.
pub struct ReaderHandle {
    shutdown: watch::Sender<bool>,
    task: task::JoinHandle<()>,
}

impl ReaderHandle {
    /// Signals the background reader to stop at its next poll and waits for
    /// it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Reads messages from a [`Source`] and persists them.
///
/// Implemented for the [`crate::store::Store`] in production use.
pub trait Consumer<S> {
    type Error;
    type Future: Future<Output = Result<InitState, Self::Error>> + Send;

    /// Processes a single message coming from a [`Source`].
    ///
    /// Receives a shared reference only, so it stays portable and queries
    /// on stores can be made concurrently; implementations use atomic
    /// updates or an inner lock to mutate.
    fn consume(&self, msg: Message) -> Self::Future;

    /// Starts reading messages from a stream in a background task, with
    /// readiness signaling and reconnection. Returns a [`ReaderHandle`] the
    /// caller uses to stop the task later, alongside a future that resolves
    /// once the first full data set has been applied.
    ///
    /// Neither a stream error nor a clean end of stream gives up: the next
    /// attempt waits for a capped exponential backoff (doubling from 1s up
    /// to a 30s cap) with full jitter, then opens a fresh stream. The
    /// failure counter — and so the backoff — resets after any message is
    /// read successfully.
    ///
    /// When not interested in readiness, just drop the returned future.
    /// This has no bad consequences.
    fn read_from(
        self: Arc<Self>,
        source: S,
    ) -> (ReaderHandle, BoxFuture<'static, Result<(), ReadError<Self::Error>>>)
    where
        Self: Send + Sync + 'static,
        Self::Error: fmt::Debug + StdError + Clone + Sync + Send,
        S: Source + Send + 'static,
        S::Stream: Unpin + Send,
        S::Error: fmt::Display + Send,
    {
        let (init_tx, mut init_rx) =
            watch::channel::<Option<Result<(), ReadError<Self::Error>>>>(None);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = task::spawn(async move {
            let mut stream = source.stream();
            let mut failures: u32 = 0;

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                    next = stream.next() => {
                        let msg = match next {
                            Some(Ok(msg)) => msg,
                            Some(Err(error)) => {
                                warn!(%error, attempt = failures + 1, "data source stream failed, reconnecting");
                                sleep(backoff_with_jitter(failures)).await;
                                failures += 1;
                                stream = source.stream();
                                continue;
                            }
                            None => {
                                warn!(attempt = failures + 1, "data source stream ended, reconnecting");
                                sleep(backoff_with_jitter(failures)).await;
                                failures += 1;
                                stream = source.stream();
                                continue;
                            }
                        };
                        failures = 0;

                        match self.consume(msg).await {
                            Err(e) => {
                                let _ = init_tx.send(Some(Err(e.into())));
                            }
                            Ok(InitState::Done) => {
                                let _ = init_tx.send(Some(Ok(())));
                            }
                            Ok(InitState::Pending) => {}
                        };
                    }
                }
            }
        });

        let handle = ReaderHandle { shutdown: shutdown_tx, task };

        let ready = async move {
            if init_rx.borrow().is_none() {
                init_rx
                    .changed()
                    .await
                    .map_err(|_| ReadError::TaskDropped)?;
            }
            // safe to unwrap: if it's still None at this point, it's a bug
            let res = init_rx.borrow().as_ref().cloned().unwrap();
            res
        }
        .boxed();

        (handle, ready)
    }
}

/// `INITIAL_BACKOFF * 2^failures`, capped at `MAX_BACKOFF`, with full
/// jitter (a uniform random draw between zero and the capped duration) so
/// many clients reconnecting at once don't do so in lockstep.
fn backoff_with_jitter(failures: u32) -> Duration {
    let exponent = failures.min(10);
    let capped = INITIAL_BACKOFF
        .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
        .min(MAX_BACKOFF);
    let jitter_fraction: f64 = rand::thread_rng().gen_range(0.0..1.0);
    capped.mul_f64(jitter_fraction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        assert!(backoff_with_jitter(0) <= INITIAL_BACKOFF);
        assert!(backoff_with_jitter(2) <= INITIAL_BACKOFF * 4);
        assert!(backoff_with_jitter(20) <= MAX_BACKOFF);
    }

    /// A source whose first stream ends cleanly (`None`) and whose every
    /// later stream yields one message, used to prove a clean EOF
    /// reconnects rather than ending the background task.
    struct FlakySource {
        calls: Arc<AtomicUsize>,
    }

    impl crate::source::Source for FlakySource {
        type Error = std::convert::Infallible;
        type Stream = Pin<Box<dyn futures::Stream<Item = Result<Message, Self::Error>> + Send>>;

        fn stream(&self) -> Self::Stream {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Box::pin(futures::stream::empty())
            } else {
                Box::pin(futures::stream::once(async { Ok(Message::Unknown) }))
            }
        }
    }

    #[tokio::test]
    async fn eof_triggers_reconnect_rather_than_stopping_the_task() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = FlakySource { calls: calls.clone() };
        let store = Arc::new(MemoryStore::new());

        let (handle, _ready) = store.read_from(source);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        handle.shutdown().await;

        assert!(
            calls.load(Ordering::SeqCst) >= 2,
            "stream() must be re-opened after a clean end of stream"
        );
    }
}
