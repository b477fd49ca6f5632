// I/O completion queue
//
// The device signals finished writes from its own context. Completions are
// funneled through a single consumer so the roll-forward of each buffer
// runs exactly once and in arrival order.

use crate::softdep::{RollbackToken, Softdep, WriteOutcome};
use softdep_core::{BlockBuf, Ino, SoftdepError};
use std::sync::Arc;
use tokio::sync::mpsc;

/// How a write ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoStatus {
    Success,
    Failed(String),
}

/// A finished write, with the buffer that was written
#[derive(Debug)]
pub struct IoCompletion {
    pub buf: BlockBuf,
    pub token: RollbackToken,
    pub status: IoStatus,
}

#[derive(Debug)]
pub enum CompletionResult {
    Written(WriteOutcome),
    /// Inodes the failure was reported against
    Failed(Vec<Ino>),
}

/// A buffer handed back to the cache once its completion was applied
#[derive(Debug)]
pub struct CompletedWrite {
    pub buf: BlockBuf,
    pub result: Result<CompletionResult, SoftdepError>,
}

/// Producer side, cloned into every I/O path
#[derive(Clone)]
pub struct CompletionQueue {
    tx: mpsc::UnboundedSender<IoCompletion>,
}

impl CompletionQueue {
    pub fn complete(&self, event: IoCompletion) -> Result<(), SoftdepError> {
        self.tx
            .send(event)
            .map_err(|e| SoftdepError::Other(format!("completion worker gone, {} dropped", e.0.buf.id)))
    }
}

pub struct CompletionWorker {
    softdep: Arc<Softdep>,
    rx: mpsc::UnboundedReceiver<IoCompletion>,
    done: mpsc::UnboundedSender<CompletedWrite>,
}

/// Build the queue, its worker and the channel returning completed buffers
pub fn completion_channel(
    softdep: Arc<Softdep>,
) -> (CompletionQueue, CompletionWorker, mpsc::UnboundedReceiver<CompletedWrite>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (done, done_rx) = mpsc::unbounded_channel();
    (CompletionQueue { tx }, CompletionWorker { softdep, rx, done }, done_rx)
}

impl CompletionWorker {
    /// Apply one completion
    pub fn apply(&self, event: IoCompletion) -> CompletedWrite {
        let IoCompletion { mut buf, token, status } = event;
        let result = match status {
            IoStatus::Success => self
                .softdep
                .after_buffer_write(&mut buf, token)
                .map(CompletionResult::Written),
            IoStatus::Failed(message) => self
                .softdep
                .abort_buffer_write(&mut buf, token, &message)
                .map(CompletionResult::Failed),
        };
        if let Err(e) = &result {
            log::error!("softdep: completion of {} failed: {}", buf.id, e);
        }
        CompletedWrite { buf, result }
    }

    /// Consume completions until every queue handle is dropped. Returns the
    /// number applied.
    pub async fn run(mut self) -> usize {
        let mut applied = 0;
        while let Some(event) = self.rx.recv().await {
            let completed = self.apply(event);
            applied += 1;
            if self.done.send(completed).is_err() {
                log::warn!("softdep: completed buffer dropped, nobody is listening");
            }
        }
        log::debug!("softdep: completion worker stopped after {} events", applied);
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use softdep_core::{BufId, SoftdepConfig};

    #[tokio::test]
    async fn test_worker_applies_completion() {
        let softdep = Arc::new(Softdep::new(SoftdepConfig::default()).unwrap());
        softdep.on_inode_allocated(BufId(1), 50).unwrap();
        let (queue, worker, mut done) = completion_channel(softdep.clone());
        let handle = tokio::spawn(worker.run());

        let mut buf = BlockBuf::new(BufId(1), 4, 4096);
        let token = softdep.before_buffer_write(&mut buf).unwrap();
        queue
            .complete(IoCompletion { buf, token, status: IoStatus::Success })
            .unwrap();
        let completed = done.recv().await.unwrap();
        assert!(matches!(completed.result, Ok(CompletionResult::Written(_))));
        assert_eq!(softdep.count_dependencies(BufId(1)).unwrap(), 0);

        drop(queue);
        assert_eq!(handle.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_reports_inode() {
        let softdep = Arc::new(Softdep::new(SoftdepConfig::default()).unwrap());
        softdep.on_inode_allocated(BufId(1), 51).unwrap();
        let (queue, worker, mut done) = completion_channel(softdep.clone());
        tokio::spawn(worker.run());

        let mut buf = BlockBuf::new(BufId(1), 4, 4096);
        let token = softdep.before_buffer_write(&mut buf).unwrap();
        queue
            .complete(IoCompletion {
                buf,
                token,
                status: IoStatus::Failed("media error".to_string()),
            })
            .unwrap();
        let completed = done.recv().await.unwrap();
        match completed.result {
            Ok(CompletionResult::Failed(inos)) => assert_eq!(inos, vec![51]),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(completed.buf.dirty);
        assert_eq!(softdep.take_io_error(51).as_deref(), Some("media error"));
        assert_eq!(softdep.count_dependencies(BufId(1)).unwrap(), 1);
    }
}
