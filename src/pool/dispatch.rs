//! Stream dispatcher: fan items out across ready workers, stream results back.
//!
//! Each ready worker gets one lane thread. A lane pulls the next item from
//! the shared source only when its worker is idle, sends it, and blocks until
//! the worker's result line arrives. Results flow to the consumer through a
//! bounded channel, so the source is read no faster than workers drain it.
//! In ordered mode lanes also stop taking items that would run more than a
//! fixed window ahead of the next result the consumer is waiting for.
//!
//! The returned [`ResultStream`] owns the pool. Exhaustion, the first fatal
//! error, cancellation and drop all end in the same teardown, which runs
//! exactly once.

use super::manager::WorkerPool;
use super::proc::Channel;
use super::signals::WorkerFailure;
use crate::error::{MultirunnerError, Result};
use crate::protocol::{self, Diagnostic, Phase, TaskResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::iter::Fuse;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often a blocked consumer checks the caller's cancel flag.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a crashed worker is given to be reaped for its exit status.
const CRASH_REAP_WAIT: Duration = Duration::from_millis(200);

/// Extra time past the pool's grace period that teardown waits for lanes.
const LANE_JOIN_SLACK: Duration = Duration::from_secs(1);

/// Options for [`dispatch`].
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Yield results in input order rather than completion order.
    pub ordered: bool,
    /// Upper bound on how long a worker may take per item.
    pub response_timeout: Option<Duration>,
    /// Results buffered between lanes and the consumer (default: 2 per lane).
    pub backlog: Option<usize>,
    /// Ordered mode: how far past the oldest pending item lanes may read
    /// (default: 4 per lane).
    pub read_ahead: Option<usize>,
    /// When set to true, the stream stops and yields [`MultirunnerError::Cancelled`].
    pub cancel: Option<Arc<AtomicBool>>,
}

impl DispatchOptions {
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn backlog(mut self, backlog: usize) -> Self {
        self.backlog = Some(backlog.max(1));
        self
    }

    pub fn read_ahead(mut self, items: usize) -> Self {
        self.read_ahead = Some(items.max(1));
        self
    }

    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }
}

type ItemSource = Box<dyn Iterator<Item = Result<Value>> + Send>;

/// Shared item source with sequence numbering.
struct Feed {
    source: Fuse<ItemSource>,
    next_seq: u64,
    /// Oldest sequence number the consumer has not yielded yet.
    released: u64,
    /// Ordered mode: `next_seq` stays below `released + window`.
    window: Option<u64>,
}

impl Feed {
    fn has_room(&self) -> bool {
        self.window
            .is_none_or(|window| self.next_seq < self.released + window)
    }

    fn next(&mut self) -> Option<(u64, Result<Value>)> {
        let item = self.source.next()?;
        let seq = self.next_seq;
        self.next_seq += 1;
        Some((seq, item))
    }
}

/// The feed plus a signal for lanes waiting on the read-ahead window.
struct Gate {
    feed: Mutex<Feed>,
    advanced: Condvar,
}

impl Gate {
    fn lock(&self) -> MutexGuard<'_, Feed> {
        self.feed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next item once the window has room; `None` when exhausted or stopped.
    fn take(&self, stop: &AtomicBool) -> Option<(u64, Result<Value>)> {
        let mut feed = self.lock();
        while !feed.has_room() {
            if stop.load(Ordering::Relaxed) {
                return None;
            }
            feed = match self.advanced.wait_timeout(feed, CANCEL_POLL_INTERVAL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        feed.next()
    }

    /// Record that every item before `seq` has been yielded.
    fn release(&self, seq: u64) {
        self.lock().released = seq;
        self.advanced.notify_all();
    }
}

/// Message from a lane to the consumer.
enum LaneEvent {
    Result {
        seq: u64,
        result: TaskResult,
    },
    /// Fatal error that needs no further context.
    Failed(MultirunnerError),
    /// The worker went away mid-exchange; the consumer fills in the exit status.
    Crashed {
        worker: usize,
        context: &'static str,
        detail: Option<String>,
    },
}

struct Lane {
    worker: usize,
    channel: Channel,
    gate: Arc<Gate>,
    tx: SyncSender<LaneEvent>,
    stop: Arc<AtomicBool>,
    response_timeout: Option<Duration>,
}

impl Lane {
    fn run(mut self) {
        let mut processed = 0u64;
        while !self.stop.load(Ordering::Relaxed) {
            let event = match self.gate.take(&self.stop) {
                None => break,
                Some((_, Err(e))) => LaneEvent::Failed(e),
                Some((seq, Ok(item))) => match self.exchange(item) {
                    Ok(result) => LaneEvent::Result { seq, result },
                    Err(event) => event,
                },
            };

            let fatal = !matches!(event, LaneEvent::Result { .. });
            if self.tx.send(event).is_err() || fatal {
                break;
            }
            processed += 1;
        }

        // Dropping the channel closes the worker's stdin; it exits on EOF
        tracing::debug!(worker_id = self.worker, processed, "Lane finished");
    }

    fn exchange(&mut self, item: Value) -> std::result::Result<TaskResult, LaneEvent> {
        let line = protocol::encode_item(&item).map_err(|e| LaneEvent::Failed(e.into()))?;

        let started = Instant::now();
        self.channel
            .send_line(&line)
            .map_err(|e| self.crashed("sending an item", Some(e.to_string())))?;

        let reply = loop {
            match self.channel.recv_line(self.response_timeout) {
                Ok(Some(reply)) if reply.trim().is_empty() => continue,
                Ok(Some(reply)) => break reply,
                Ok(None) => return Err(self.crashed("awaiting a result", None)),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(LaneEvent::Failed(MultirunnerError::WorkerTimeout {
                        worker: self.worker,
                        timeout: self.response_timeout.unwrap_or_default(),
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    return Err(LaneEvent::Failed(MultirunnerError::Protocol {
                        worker: self.worker,
                        message: format!("unreadable result line: {}", e),
                    }));
                }
                Err(e) => return Err(self.crashed("awaiting a result", Some(e.to_string()))),
            }
        };

        let mut result = TaskResult::from_line(&reply).map_err(|e| {
            LaneEvent::Failed(MultirunnerError::Protocol {
                worker: self.worker,
                message: format!("malformed result line {:?}: {}", truncate(&reply, 120), e),
            })
        })?;
        // Correlation is positional within the lane
        result.data = item;

        tracing::trace!(
            worker_id = self.worker,
            exit = result.exit,
            elapsed_ms = started.elapsed().as_millis(),
            "Item processed"
        );
        Ok(result)
    }

    fn crashed(&self, context: &'static str, detail: Option<String>) -> LaneEvent {
        LaneEvent::Crashed {
            worker: self.worker,
            context,
            detail,
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Dispatch `items` across the workers of `pool`.
///
/// Every worker must have passed the handshake. A pool with any worker not
/// `Ready` is terminated and refused with
/// [`MultirunnerError::HandshakeFailed`], or [`MultirunnerError::NoReadyWorkers`]
/// if it was never handshaken.
pub fn dispatch<I>(pool: WorkerPool, items: I, options: DispatchOptions) -> Result<ResultStream>
where
    I: IntoIterator<Item = Value>,
    I::IntoIter: Send + 'static,
{
    dispatch_fallible(pool, items.into_iter().map(Ok), options)
}

/// Like [`dispatch`], for sources that can fail mid-stream.
///
/// An `Err` from the source is fatal: it is yielded once and the stream ends.
pub fn dispatch_fallible<I>(
    mut pool: WorkerPool,
    items: I,
    options: DispatchOptions,
) -> Result<ResultStream>
where
    I: IntoIterator<Item = Result<Value>>,
    I::IntoIter: Send + 'static,
{
    if !pool.all_ready() {
        let never_handshaken = pool.ready_count() == 0
            && pool.workers().iter().all(|w| w.failure().is_none());
        let error = if never_handshaken {
            MultirunnerError::NoReadyWorkers
        } else {
            MultirunnerError::HandshakeFailed(pool.diagnostics())
        };
        tracing::warn!(
            ready = pool.ready_count(),
            workers = pool.len(),
            "Refusing to dispatch to a pool that failed its handshake"
        );
        pool.terminate();
        return Err(error);
    }

    let channels: Vec<(usize, Channel)> = pool
        .workers_mut()
        .iter_mut()
        .filter_map(|w| {
            let id = w.id();
            w.proc_mut().and_then(|p| p.take_channel()).map(|c| (id, c))
        })
        .collect();

    if channels.is_empty() {
        return Err(MultirunnerError::NoReadyWorkers);
    }

    let source: ItemSource = Box::new(items.into_iter());
    let window = options
        .ordered
        .then(|| options.read_ahead.unwrap_or(channels.len() * 4) as u64);
    let gate = Arc::new(Gate {
        feed: Mutex::new(Feed {
            source: source.fuse(),
            next_seq: 0,
            released: 0,
            window,
        }),
        advanced: Condvar::new(),
    });
    let stop = Arc::new(AtomicBool::new(false));
    let backlog = options.backlog.unwrap_or(channels.len() * 2);
    let (tx, rx) = mpsc::sync_channel(backlog);

    tracing::info!(
        lanes = channels.len(),
        ordered = options.ordered,
        backlog,
        read_ahead = ?window,
        "Dispatching items"
    );

    let mut lanes = Vec::with_capacity(channels.len());
    for (worker, channel) in channels {
        let lane = Lane {
            worker,
            channel,
            gate: Arc::clone(&gate),
            tx: tx.clone(),
            stop: Arc::clone(&stop),
            response_timeout: options.response_timeout,
        };
        let spawned = thread::Builder::new()
            .name(format!("multirunner-lane-{}", worker))
            .spawn(move || lane.run());
        match spawned {
            Ok(handle) => lanes.push(handle),
            Err(e) => {
                stop.store(true, Ordering::Relaxed);
                drop(rx);
                pool.terminate();
                return Err(MultirunnerError::Io(e));
            }
        }
    }

    Ok(ResultStream {
        pool,
        rx: Some(rx),
        lanes,
        detached: 0,
        gate,
        stop,
        cancel: options.cancel,
        ordered: options.ordered,
        reorder: BTreeMap::new(),
        next_seq: 0,
        done: false,
    })
}

enum Received {
    Event(LaneEvent),
    Disconnected,
    Cancelled,
}

/// Lazy sequence of results; owns the pool and tears it down when done.
pub struct ResultStream {
    pool: WorkerPool,
    rx: Option<Receiver<LaneEvent>>,
    lanes: Vec<JoinHandle<()>>,
    /// Lanes left running at teardown because they were inside the source.
    detached: usize,
    gate: Arc<Gate>,
    stop: Arc<AtomicBool>,
    cancel: Option<Arc<AtomicBool>>,
    ordered: bool,
    /// Out-of-order results waiting for their turn.
    reorder: BTreeMap<u64, TaskResult>,
    next_seq: u64,
    done: bool,
}

impl ResultStream {
    /// Process ids of the pool's workers.
    pub fn pids(&self) -> Vec<u32> {
        self.pool.pids()
    }

    /// Number of lanes (ready workers) taking items.
    pub fn lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Lanes that teardown had to leave behind, blocked in the item source.
    pub fn detached_lanes(&self) -> usize {
        self.detached
    }

    /// Whether teardown has run.
    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Stop dispatching and tear the pool down now.
    pub fn close(&mut self) {
        self.shutdown();
    }

    fn recv(&self) -> Received {
        let Some(rx) = self.rx.as_ref() else {
            return Received::Disconnected;
        };
        let Some(cancel) = self.cancel.as_ref() else {
            return rx
                .recv()
                .map_or(Received::Disconnected, Received::Event);
        };
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Received::Cancelled;
            }
            match rx.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(event) => return Received::Event(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Received::Disconnected,
            }
        }
    }

    fn crash_error(
        &mut self,
        worker: usize,
        context: &'static str,
        detail: Option<String>,
    ) -> MultirunnerError {
        let reason = match self.pool.worker_mut(worker) {
            Some(w) => {
                let reason = w.exit_reason(CRASH_REAP_WAIT);
                w.fail(Diagnostic::reported(
                    format!("worker {} while {}", reason, context),
                    Phase::Other("processing items".to_string()),
                ));
                reason
            }
            None => super::signals::TerminationReason::Unknown,
        };

        let mut failure = WorkerFailure::new(reason).with_context(context);
        if let Some(detail) = detail {
            failure = failure.with_message(detail);
        }
        tracing::warn!(worker_id = worker, failure = %failure, "Worker crashed");
        MultirunnerError::WorkerCrash {
            worker,
            reason: failure.to_string(),
        }
    }

    fn fail(&mut self, error: MultirunnerError) -> Option<Result<TaskResult>> {
        self.reorder.clear();
        self.shutdown();
        Some(Err(error))
    }

    fn shutdown(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.stop.store(true, Ordering::Relaxed);
        self.gate.advanced.notify_all();
        // Lanes blocked handing over a result see the disconnect
        self.rx = None;
        // Lanes blocked on their worker see EOF once it dies
        self.pool.terminate();

        let deadline = Instant::now() + self.pool.options().grace + LANE_JOIN_SLACK;
        for handle in self.lanes.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::debug!("Lane thread panicked");
                }
            } else {
                // Still inside the caller's item source; it exits on its next item
                self.detached += 1;
            }
        }
        if self.detached > 0 {
            tracing::debug!(
                detached = self.detached,
                "Detached lanes blocked on the item source"
            );
        }
        tracing::debug!("Dispatch torn down");
    }
}

impl Iterator for ResultStream {
    type Item = Result<TaskResult>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.ordered {
                if let Some(result) = self.reorder.remove(&self.next_seq) {
                    self.next_seq += 1;
                    self.gate.release(self.next_seq);
                    return Some(Ok(result));
                }
                if self.done {
                    return self.reorder.pop_first().map(|(_, r)| Ok(r));
                }
            }
            if self.done {
                return None;
            }

            match self.recv() {
                Received::Event(LaneEvent::Result { seq, result }) => {
                    if !self.ordered {
                        return Some(Ok(result));
                    }
                    self.reorder.insert(seq, result);
                }
                Received::Event(LaneEvent::Failed(e)) => return self.fail(e),
                Received::Event(LaneEvent::Crashed {
                    worker,
                    context,
                    detail,
                }) => {
                    let e = self.crash_error(worker, context, detail);
                    return self.fail(e);
                }
                Received::Cancelled => {
                    tracing::info!("Dispatch cancelled");
                    return self.fail(MultirunnerError::Cancelled);
                }
                Received::Disconnected => self.shutdown(),
            }
        }
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}
