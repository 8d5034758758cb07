#![forbid(unsafe_code)]

//! Async crypto offload.
//!
//! Every pipeline stage that touches a cipher goes through [`OffloadPool`]:
//! with zero workers the operation runs inline on the submitting task, with
//! workers it is deferred onto one of them. Both paths invoke the same
//! completion closure, which owns the buffer and whatever references the
//! submitter acquired, so the post-stage handlers behave identically in
//! either mode.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::debug;

use veil_core::PacketBuf;

use crate::context::CryptoContext;
use crate::Result;

/// Depth of each worker's submission queue.
const WORKER_QUEUE_DEPTH: usize = 256;

/// Which cipher direction a job runs.
#[derive(Debug, Clone, Copy)]
pub enum CryptoOp {
    /// Seal the payload and prepend the data-channel header carrying this
    /// opcode.
    Encrypt { opcode: u8 },
    /// Open a record whose wire header (and AEAD associated data) is
    /// `aad_len` bytes.
    Decrypt { aad_len: usize },
}

/// How a submission completed, reported so callers can exercise both paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// The operation and its completion ran on the submitting task.
    Inline,
    /// The operation was handed to a worker; the completion runs there.
    Deferred,
}

/// Completion continuation. Receives the buffer back together with the
/// operation result; the closure owns both and every reference it captured.
pub type Completion = Box<dyn FnOnce(PacketBuf, Result<()>) + Send + 'static>;

struct Job {
    ctx: Arc<CryptoContext>,
    buf: PacketBuf,
    op: CryptoOp,
    done: Completion,
}

/// Worker pool for AEAD operations.
pub struct OffloadPool {
    workers: Vec<mpsc::Sender<Job>>,
    next: AtomicUsize,
}

impl OffloadPool {
    /// Spawn `workers` tasks on the current tokio runtime. Zero workers
    /// configures inline completion and needs no runtime at all.
    pub fn new(workers: usize) -> Self {
        let mut senders = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, mut rx) = mpsc::channel::<Job>(WORKER_QUEUE_DEPTH);
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    run(job);
                }
            });
            senders.push(tx);
        }
        Self {
            workers: senders,
            next: AtomicUsize::new(0),
        }
    }

    /// Submit one operation. Never blocks: if every worker queue is full the
    /// job degrades to inline execution rather than waiting.
    pub fn submit(
        &self,
        ctx: Arc<CryptoContext>,
        buf: PacketBuf,
        op: CryptoOp,
        done: Completion,
    ) -> CompletionMode {
        let mut job = Job { ctx, buf, op, done };

        if !self.workers.is_empty() {
            let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
            match self.workers[slot].try_send(job) {
                Ok(()) => return CompletionMode::Deferred,
                Err(mpsc::error::TrySendError::Full(j))
                | Err(mpsc::error::TrySendError::Closed(j)) => {
                    debug!(worker = slot, "crypto worker unavailable, running inline");
                    job = j;
                }
            }
        }

        run(job);
        CompletionMode::Inline
    }
}

fn run(job: Job) {
    let Job {
        ctx,
        mut buf,
        op,
        done,
    } = job;
    let res = match op {
        CryptoOp::Encrypt { opcode } => ctx.encrypt(opcode, &mut buf),
        CryptoOp::Decrypt { aad_len } => ctx.decrypt(&mut buf, aad_len, Instant::now()),
    };
    done(buf, res);
}
