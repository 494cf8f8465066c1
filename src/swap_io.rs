//! Parallel swap I/O pipes.
//!
//! Raw key/value pairs travel to a small pool of worker threads, routed by
//! `crc16(rawkey)` so all I/O for one key lands on the same pipe and runs
//! in submit order. Each worker owns its shard of the backing store
//! outright; the reactor never touches it. Completions come back through a
//! mutex-guarded queue plus a poll wakeup.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use bytes::Bytes;
use crc16::{State, XMODEM};
use mio::Waker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapAction {
    Nop,
    Get,
    Put,
    Del,
}

impl SwapAction {
    pub fn name(self) -> &'static str {
        match self {
            SwapAction::Nop => "nop",
            SwapAction::Get => "get",
            SwapAction::Put => "put",
            SwapAction::Del => "del",
        }
    }

    pub fn index(self) -> usize {
        match self {
            SwapAction::Nop => 0,
            SwapAction::Get => 1,
            SwapAction::Put => 2,
            SwapAction::Del => 3,
        }
    }
}

#[derive(Debug)]
pub struct SwapJob {
    pub id: u64,
    pub action: SwapAction,
    pub rawkey: Bytes,
    pub rawval: Option<Bytes>,
}

#[derive(Debug)]
pub struct SwapCompletion {
    pub id: u64,
    pub action: SwapAction,
    pub rawkey: Bytes,
    pub rawval: Option<Bytes>,
    pub result: Result<(), String>,
}

struct PipeShared {
    jobs: Mutex<PipeJobs>,
    cond: Condvar,
}

struct PipeJobs {
    queue: VecDeque<SwapJob>,
    shutdown: bool,
}

struct Pipe {
    shared: Arc<PipeShared>,
    handle: Option<JoinHandle<()>>,
}

pub struct SwapPipes {
    pipes: Vec<Pipe>,
    completions: Arc<Mutex<Vec<SwapCompletion>>>,
}

impl SwapPipes {
    pub fn new(parallel: usize, waker: Arc<Waker>) -> Self {
        let completions: Arc<Mutex<Vec<SwapCompletion>>> = Arc::new(Mutex::new(Vec::new()));
        let pipes = (0..parallel.max(1))
            .map(|i| {
                let shared = Arc::new(PipeShared {
                    jobs: Mutex::new(PipeJobs { queue: VecDeque::new(), shutdown: false }),
                    cond: Condvar::new(),
                });
                let worker_shared = shared.clone();
                let worker_completions = completions.clone();
                let worker_waker = waker.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("swap-pipe-{}", i))
                    .spawn(move || pipe_main(worker_shared, worker_completions, worker_waker))
                    .expect("spawn swap pipe");
                Pipe { shared, handle: Some(handle) }
            })
            .collect();
        SwapPipes { pipes, completions }
    }

    pub fn parallel(&self) -> usize {
        self.pipes.len()
    }

    /// Route by CRC16 of the raw key so per-key order is the submit order.
    pub fn submit(&self, job: SwapJob) {
        let idx = State::<XMODEM>::calculate(&job.rawkey) as usize % self.pipes.len();
        let pipe = &self.pipes[idx];
        let mut jobs = pipe.shared.jobs.lock().unwrap();
        jobs.queue.push_back(job);
        pipe.shared.cond.notify_one();
    }

    /// Take everything the workers have finished so far.
    pub fn drain_completions(&self) -> Vec<SwapCompletion> {
        std::mem::take(&mut *self.completions.lock().unwrap())
    }
}

impl Drop for SwapPipes {
    fn drop(&mut self) {
        for pipe in &self.pipes {
            let mut jobs = pipe.shared.jobs.lock().unwrap();
            jobs.shutdown = true;
            pipe.shared.cond.notify_one();
        }
        for pipe in &mut self.pipes {
            if let Some(handle) = pipe.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn pipe_main(
    shared: Arc<PipeShared>,
    completions: Arc<Mutex<Vec<SwapCompletion>>>,
    waker: Arc<Waker>,
) {
    // This worker's shard of the cold store.
    let mut store: HashMap<Bytes, Bytes> = HashMap::new();
    loop {
        let job = {
            let mut jobs = shared.jobs.lock().unwrap();
            loop {
                if let Some(job) = jobs.queue.pop_front() {
                    break job;
                }
                if jobs.shutdown {
                    return;
                }
                jobs = shared.cond.wait(jobs).unwrap();
            }
        };

        let (rawval, result) = match job.action {
            SwapAction::Get => match store.get(&job.rawkey) {
                Some(v) => (Some(v.clone()), Ok(())),
                None => (None, Err("cold value missing from backing store".to_string())),
            },
            SwapAction::Put => match job.rawval.clone() {
                Some(v) => {
                    store.insert(job.rawkey.clone(), v);
                    (None, Ok(()))
                }
                None => (None, Err("put without a payload".to_string())),
            },
            SwapAction::Del => {
                store.remove(&job.rawkey);
                (None, Ok(()))
            }
            SwapAction::Nop => (None, Ok(())),
        };

        completions.lock().unwrap().push(SwapCompletion {
            id: job.id,
            action: job.action,
            rawkey: job.rawkey,
            rawval,
            result,
        });
        // Wake the reactor; failure here means it is shutting down.
        let _ = waker.wake();
    }
}
