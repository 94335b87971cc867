//! 请求队列
//!
//! 每个 device 一个列表，所有列表共用一把锁。token 在锁内分配，
//! 所以 token 的顺序和入队的顺序严格一致。streamer 线程通过交换的方式一次取走全部请求，
//! 生产者不会被正在执行的批次阻塞。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use truvis_gfx::handles::BufferHandle;

use crate::request::{QueuedRequest, UpdateRequest};
use crate::token::{SyncToken, TokenTracker};

pub(crate) struct RequestQueue {
    queues: Mutex<Vec<Vec<QueuedRequest>>>,
    queue_cond: Condvar,
}

// new & init
impl RequestQueue {
    pub fn new(device_count: usize) -> Self {
        Self {
            queues: Mutex::new((0..device_count).map(|_| Vec::new()).collect()),
            queue_cond: Condvar::new(),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Vec<Vec<QueuedRequest>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// 生产者
impl RequestQueue {
    /// 入队并返回请求完成时满足的 token
    pub fn submit(
        &self,
        device_index: usize,
        request: UpdateRequest,
        upload_buffer: Option<BufferHandle>,
        tokens: &TokenTracker,
    ) -> SyncToken {
        let mut queues = self.lock();
        let token = tokens.issue();
        log::trace!("enqueue {} on device {} with token {}", request.kind(), device_index, token.value());
        queues[device_index].push(QueuedRequest {
            request,
            wait_index: token,
            upload_buffer,
        });
        drop(queues);

        self.queue_cond.notify_all();
        token
    }

    /// 没有 GPU 工作的请求：分配 token 并立刻 retire
    ///
    /// streamer 会被唤醒一次，把 submitted 水位推进到这个 token 上。
    pub fn issue_retired(&self, tokens: &TokenTracker) -> SyncToken {
        let queues = self.lock();
        let token = tokens.issue();
        tokens.retire_early(token);
        drop(queues);

        self.queue_cond.notify_all();
        token
    }

    /// 唤醒 streamer 线程
    pub fn wake(&self) {
        let _queues = self.lock();
        self.queue_cond.notify_all();
    }
}

// 消费者
impl RequestQueue {
    /// 取走所有 device 上的请求，同时返回此刻已经分配的最大 token
    ///
    /// 在同一把锁内完成，所以返回的 token 之前的请求一定都在这一批中
    pub fn drain_all(&self, tokens: &TokenTracker) -> (Vec<Vec<QueuedRequest>>, SyncToken) {
        let mut queues = self.lock();
        let snapshot = tokens.counter();
        let batches = queues.iter_mut().map(std::mem::take).collect();
        (batches, snapshot)
    }

    pub fn has_work(&self) -> bool {
        self.lock().iter().any(|q| !q.is_empty())
    }

    /// 没有待处理的请求、且所有 token 都已完成时挂起
    pub fn wait_for_work(&self, tokens: &TokenTracker, run: &AtomicBool) {
        let _span = tracy_client::span!("RequestQueue::wait_for_work");
        let mut queues = self.lock();
        while run.load(Ordering::Acquire) && queues.iter().all(Vec::is_empty) && tokens.all_completed() {
            queues = self.queue_cond.wait(queues).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn barrier() -> UpdateRequest {
        UpdateRequest::BufferBarrier(Vec::new())
    }

    #[test]
    fn test_drain_preserves_fifo_per_device() {
        let tokens = TokenTracker::new();
        let queue = RequestQueue::new(2);
        let a = queue.submit(0, barrier(), None, &tokens);
        let b = queue.submit(1, barrier(), None, &tokens);
        let c = queue.submit(0, barrier(), None, &tokens);
        assert!(queue.has_work());

        let (batches, snapshot) = queue.drain_all(&tokens);
        assert_eq!(snapshot, c);
        assert_eq!(batches[0].iter().map(|r| r.wait_index).collect::<Vec<_>>(), vec![a, c]);
        assert_eq!(batches[1].iter().map(|r| r.wait_index).collect::<Vec<_>>(), vec![b]);
        assert!(!queue.has_work());
    }

    #[test]
    fn test_issue_retired() {
        let tokens = TokenTracker::new();
        let queue = RequestQueue::new(1);
        let token = queue.issue_retired(&tokens);
        assert!(tokens.is_completed(token));
        assert!(!queue.has_work());
        // submitted 水位还没有推进，streamer 需要再跑一轮
        assert!(!tokens.all_completed());
    }

    #[test]
    fn test_wait_for_work_wakes_on_submit() {
        let tokens = Arc::new(TokenTracker::new());
        let queue = Arc::new(RequestQueue::new(1));
        let run = Arc::new(AtomicBool::new(true));

        let consumer = {
            let (tokens, queue, run) = (tokens.clone(), queue.clone(), run.clone());
            std::thread::spawn(move || {
                queue.wait_for_work(&tokens, &run);
                queue.drain_all(&tokens).0[0].len()
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        queue.submit(0, barrier(), None, &tokens);
        assert_eq!(consumer.join().unwrap(), 1);
    }

    #[test]
    fn test_wait_for_work_returns_when_stopped() {
        let tokens = TokenTracker::new();
        let queue = RequestQueue::new(1);
        let run = AtomicBool::new(false);
        queue.wait_for_work(&tokens, &run);
    }
}
