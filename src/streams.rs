use std::num::NonZeroUsize;
use std::time::Duration;

use futures::{stream, Stream};
use procrastinate_shutdown_signal::ShutdownSignal;
use sqlx::postgres::PgListener;
use tracing::{error, trace, warn};

use crate::connector::Connector;
use crate::errors::Result;
use crate::job::Job;
use crate::store::JobStore;

/// Channel carrying every committed defer, regardless of queue.
pub const ANY_QUEUE_CHANNEL: &str = "procrastinate_any_queue";

/// Indicates what woke a sub-worker up to look for a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamSource {
    /// Regular polling interval elapsed
    Polling,
    /// A queue NOTIFY arrived
    Notify,
    /// One-time run request draining the ready set
    RunOnce,
}

/// NOTIFY channels to watch for the given queue subset. Serving all queues
/// means one global channel; a subset means one channel per queue.
pub(crate) fn notify_channels(queues: Option<&[String]>) -> Vec<String> {
    match queues {
        Some(queues) => queues
            .iter()
            .map(|queue| format!("procrastinate_queue#{queue}"))
            .collect(),
        None => vec![ANY_QUEUE_CHANNEL.to_string()],
    }
}

const LISTEN_BACKOFF_BASE: Duration = Duration::from_millis(100);
const LISTEN_BACKOFF_MAX: Duration = Duration::from_secs(30);

struct JobSignalStreamData {
    interval: tokio::time::Interval,
    pg_listener: PgListener,
    shutdown_signal: ShutdownSignal,
    concurrency: usize,
    /// When a signal arrives, yields multiple items so every idle
    /// sub-worker gets a chance to fetch
    yield_n: Option<(NonZeroUsize, StreamSource)>,
    /// Current delay before retrying a broken LISTEN connection
    listen_backoff: Duration,
}

/// Creates a stream that yields one item per sub-worker wake-up.
///
/// Signals come from the polling interval and from queue NOTIFYs; the
/// stream ends when the shutdown signal fires. NOTIFY is advisory only:
/// a lost LISTEN connection is retried with bounded exponential backoff
/// while polling keeps the worker live, so missed notifications are
/// harmless.
pub(crate) async fn job_signal_stream(
    connector: &Connector,
    queues: Option<&[String]>,
    poll_interval: Duration,
    shutdown_signal: ShutdownSignal,
    concurrency: usize,
) -> Result<impl Stream<Item = StreamSource>> {
    let channels = notify_channels(queues);
    let pg_listener = connector.listener(&channels).await?;

    let stream_data = JobSignalStreamData {
        interval: tokio::time::interval(poll_interval),
        pg_listener,
        shutdown_signal,
        concurrency,
        yield_n: None,
        listen_backoff: LISTEN_BACKOFF_BASE,
    };

    let stream = stream::unfold(stream_data, |mut f| async {
        if let Some((n, source)) = f.yield_n.take() {
            if n.get() > 1 {
                let remaining_yields = n.get() - 1;
                f.yield_n = Some((NonZeroUsize::new(remaining_yields).unwrap(), source));
            }
            return Some((source, f));
        }

        loop {
            tokio::select! {
                biased;
                _ = &mut f.shutdown_signal => return None,
                _ = f.interval.tick() => {
                    f.yield_n = NonZeroUsize::new(f.concurrency).map(|n| (n, StreamSource::Polling));
                    return Some((StreamSource::Polling, f));
                },
                res = f.pg_listener.recv() => {
                    match res {
                        Ok(notification) => {
                            trace!(
                                channel = notification.channel(),
                                payload = notification.payload(),
                                "Received queue notification"
                            );
                            f.listen_backoff = LISTEN_BACKOFF_BASE;
                            f.yield_n = NonZeroUsize::new(f.concurrency).map(|n| (n, StreamSource::Notify));
                            return Some((StreamSource::Notify, f));
                        }
                        Err(e) => {
                            warn!(
                                error = ?e,
                                backoff = ?f.listen_backoff,
                                "Lost LISTEN connection, reconnecting"
                            );
                            tokio::select! {
                                _ = &mut f.shutdown_signal => return None,
                                _ = tokio::time::sleep(f.listen_backoff) => {}
                            }
                            f.listen_backoff = (f.listen_backoff * 2).min(LISTEN_BACKOFF_MAX);
                        }
                    }
                },
            }
        }
    });

    Ok(stream)
}

/// Creates a stream that fetches and yields ready jobs until the ready set
/// runs dry or shutdown fires. Used by `run_once`.
pub(crate) fn job_stream(
    store: JobStore,
    queues: Option<Vec<String>>,
    shutdown_signal: ShutdownSignal,
) -> impl Stream<Item = Job> {
    futures::stream::unfold((), move |()| {
        let store = store.clone();
        let queues = queues.clone();

        let job_fut = async move {
            let job = store.fetch_one(queues.as_deref()).await;

            match job {
                Ok(Some(job)) => Some((job, ())),
                Ok(None) => None,
                Err(e) => {
                    error!(error = ?e, "Error occured while trying to get job");
                    None
                }
            }
        };
        let shutdown_fut = shutdown_signal.clone();

        async move {
            tokio::select! {
                res = job_fut => res,
                _ = shutdown_fut => None
            }
        }
    })
}
