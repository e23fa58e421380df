//! The storage worker pool: `nreaders` read workers, one write worker
//! and one delete worker, each a dedicated OS thread. Work is handed to a
//! specific worker over its own channel; completions from all workers
//! fan into a single channel carrying the worker's index, which the
//! dispatcher's event loop drains asynchronously.
//!
//! Storage I/O failures are fatal and abort the process: the log is
//! append-only and its only partial-write protection is truncation of
//! the final file at startup, so continuing past a mid-write error would
//! leave clients seeing inconsistent state.

use blockstore::Store;
use std::sync::Arc;

pub enum Job {
    Read { blkno: u64, req_id: u64 },
    Write { blkno: u64, nblks: u64, buf: Vec<u8>, req_id: u64 },
    Delete { blkno: u64 },
}

pub enum Outcome {
    Read {
        req_id: u64,
        /// The block contents, or None on a miss.
        data: Option<Vec<u8>>,
    },
    Write {
        req_id: u64,
    },
    Delete,
}

pub struct Completion {
    pub worker: usize,
    pub outcome: Outcome,
}

struct Worker {
    jobs: Option<flume::Sender<Job>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

pub struct WorkerPool {
    workers: Vec<Worker>,
    completions: flume::Receiver<Completion>,
    nreaders: usize,
}

impl WorkerPool {
    pub fn start(store: Arc<Store>, nreaders: usize) -> Self {
        let (done_tx, done_rx) = flume::unbounded();
        let workers = (0..nreaders + 2)
            .map(|id| {
                let (jobs_tx, jobs_rx) = flume::unbounded();
                let store = store.clone();
                let done = done_tx.clone();
                let thread = std::thread::Builder::new()
                    .name(format!("storage-worker-{id}"))
                    .spawn(move || worker_loop(id, store, jobs_rx, done))
                    .expect("spawn worker thread");
                Worker {
                    jobs: Some(jobs_tx),
                    thread: Some(thread),
                }
            })
            .collect();

        Self {
            workers,
            completions: done_rx,
            nreaders,
        }
    }

    pub fn writer_index(&self) -> usize {
        self.nreaders
    }

    pub fn deleter_index(&self) -> usize {
        self.nreaders + 1
    }

    /// Hand a job to a specific worker, which must be idle.
    pub fn assign(&self, worker: usize, job: Job) {
        self.workers[worker]
            .jobs
            .as_ref()
            .expect("pool not shut down")
            .send(job)
            .expect("worker thread alive");
    }

    /// A clone of the completion channel for use in select loops.
    pub fn completions(&self) -> flume::Receiver<Completion> {
        self.completions.clone()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            // Closing the job channel tells the thread to exit.
            worker.jobs.take();
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                thread.join().ok();
            }
        }
    }
}

fn worker_loop(
    id: usize,
    store: Arc<Store>,
    jobs: flume::Receiver<Job>,
    done: flume::Sender<Completion>,
) {
    for job in jobs.iter() {
        let outcome = match job {
            Job::Read { blkno, req_id } => {
                let mut buf = vec![0u8; store.block_len()];
                match store.read(blkno, &mut buf) {
                    Ok(true) => Outcome::Read {
                        req_id,
                        data: Some(buf),
                    },
                    Ok(false) => Outcome::Read { req_id, data: None },
                    Err(err) => {
                        tracing::error!("failure reading block {blkno:#018x}: {err}");
                        std::process::exit(1);
                    }
                }
            }
            Job::Write {
                blkno,
                nblks,
                buf,
                req_id,
            } => match store.append(blkno, nblks, &buf) {
                Ok(()) => Outcome::Write { req_id },
                Err(err) => {
                    tracing::error!("failure writing blocks at {blkno:#018x}: {err}");
                    std::process::exit(1);
                }
            },
            Job::Delete { blkno } => match store.delete(blkno) {
                Ok(()) => Outcome::Delete,
                Err(err) => {
                    tracing::error!("failure deleting blocks below {blkno:#018x}: {err}");
                    std::process::exit(1);
                }
            },
        };

        if done.send(Completion { worker: id, outcome }).is_err() {
            break;
        }
    }
}
