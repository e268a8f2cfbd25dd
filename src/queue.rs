//! Bounded work queue and worker pool (component D).
//!
//! A fixed-size pool of OS threads consumes a bounded FIFO; the pipeline
//! coordinator is the sole producer. `submit` blocks (retrying) while the
//! queue is full; workers poll with a short timeout so the drain/stop
//! flags are observed promptly without a blocking `join` on the channel.

use crate::error::QueueError;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How a job finished running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job completed successfully.
    Ok,
    /// The job completed but recorded a failure for its unit of work; the
    /// worker keeps processing further jobs.
    Failed,
    /// An unrecoverable tool-launch error occurred; the worker that ran
    /// this job exits. Other workers continue until drained or stopped.
    Terminated,
}

/// A unit of work the queue knows how to run.
pub trait Job: Send + 'static {
    fn run(&self) -> JobOutcome;

    /// Short human-readable description, used for log lines only.
    fn describe(&self) -> String {
        "job".to_string()
    }
}

const DEFAULT_PUT_TIMEOUT: Duration = Duration::from_secs(3600);
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Bounded FIFO feeding a fixed pool of worker threads.
pub struct WorkQueue<J: Job> {
    sender: Sender<J>,
    receiver: Receiver<J>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    no_more_jobs: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    jobs_completed: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    put_timeout: Duration,
    poll_timeout: Duration,
}

impl<J: Job> WorkQueue<J> {
    /// Build a queue with `workers` threads (0 ⇒ logical core count) and a
    /// capacity of `10 * workers`, then start the pool.
    pub fn new(workers: usize) -> Self {
        let workers = if workers == 0 { num_cpus::get().max(1) } else { workers };
        let capacity = (workers * 10).max(1);

        let (sender, receiver) = bounded(capacity);
        let queue = Self {
            sender,
            receiver,
            workers: std::sync::Mutex::new(Vec::new()),
            no_more_jobs: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            jobs_completed: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            put_timeout: DEFAULT_PUT_TIMEOUT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        };
        queue.start(workers);
        queue
    }

    /// Launch `count` worker threads.
    fn start(&self, count: usize) {
        log::info!("work queue: starting {count} worker thread(s)");

        let mut handles = self.workers.lock().unwrap();
        for _ in 0..count {
            let receiver = self.receiver.clone();
            let no_more_jobs = Arc::clone(&self.no_more_jobs);
            let stopped = Arc::clone(&self.stopped);
            let jobs_completed = Arc::clone(&self.jobs_completed);
            let in_flight = Arc::clone(&self.in_flight);
            let poll_timeout = self.poll_timeout;

            handles.push(thread::spawn(move || {
                Self::worker_loop(receiver, no_more_jobs, stopped, jobs_completed, in_flight, poll_timeout)
            }));
        }
    }

    fn worker_loop(
        receiver: Receiver<J>,
        no_more_jobs: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
        jobs_completed: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
        poll_timeout: Duration,
    ) {
        loop {
            if stopped.load(Ordering::SeqCst) {
                break;
            }

            match receiver.recv_timeout(poll_timeout) {
                Ok(job) => {
                    in_flight.fetch_add(1, Ordering::SeqCst);
                    log::debug!("work queue: starting {}", job.describe());
                    let outcome = job.run();
                    jobs_completed.fetch_add(1, Ordering::SeqCst);
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    log::debug!("work queue: completed {} -> {:?}", job.describe(), outcome);

                    if outcome == JobOutcome::Terminated {
                        log::warn!("work queue: job terminated, worker exiting");
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if no_more_jobs.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Enqueue `job`, blocking (and retrying) while the queue is full, for
    /// up to the put timeout on each attempt.
    pub fn submit(&self, mut job: J) -> Result<(), QueueError> {
        loop {
            match self.sender.send_timeout(job, self.put_timeout) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => {
                    job = returned;
                    continue;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Err(QueueError::ShutDown),
            }
        }
    }

    /// Mark "no more jobs"; workers exit once the queue empties.
    pub fn drain(&self) {
        self.no_more_jobs.store(true, Ordering::SeqCst);
    }

    /// Set the hard stop flag; workers exit after their current job.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Approximate queue depth. Does not count jobs a worker has already
    /// dequeued and is still running; see [`WorkQueue::in_flight`] for that.
    pub fn size(&self) -> usize {
        self.sender.len()
    }

    /// Number of jobs currently being run by a worker (dequeued but not yet
    /// returned from [`Job::run`]).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Poll until the queue is empty *and* no job is still running, or the
    /// hard stop flag is set. A job is removed from the channel the instant
    /// a worker dequeues it, so `size() == 0` alone does not mean the job
    /// has finished running — `in_flight()` must also be zero. Uses a
    /// sleep/poll loop rather than a blocking join so an external signal
    /// handler that calls [`WorkQueue::stop`] is observed promptly.
    pub fn wait(&self) {
        while (self.size() > 0 || self.in_flight() > 0) && !self.stopped.load(Ordering::SeqCst) {
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Total jobs completed so far across the pool's lifetime.
    pub fn jobs_completed(&self) -> usize {
        self.jobs_completed.load(Ordering::SeqCst)
    }

    /// Drain, wait for the queue to empty (including any still-running
    /// job), then join every worker thread. Idempotent: a second call finds
    /// no remaining handles and returns immediately. Takes `&self` so an
    /// owner can run this as part of its own cleanup (e.g. a pipeline
    /// coordinator's per-run barrier) without giving up the queue.
    pub fn join(&self) {
        self.drain();
        self.wait();

        let mut handles = self.workers.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }

    /// Drain, wait for the queue to empty, then join every worker thread.
    /// Consumes the queue: no further jobs can be submitted afterward.
    pub fn shutdown(self) {
        self.join();
    }
}
