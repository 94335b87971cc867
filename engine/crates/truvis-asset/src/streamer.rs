//! streamer：资源加载器的控制循环
//!
//! 每一轮：
//! 1. 没有待处理的请求、且所有 token 都已完成时挂起
//! 2. ring 指针前进一格，所有 device 等待并重置这个 slot
//! 3. 这个 slot 上一次提交的 token 此时已经确定完成，发布为 completed
//! 4. 取走所有 device 的请求，按 FIFO 顺序执行
//! 5. 有工作的 device 提交 command buffer，发布 submitted
//!
//! 所以一个请求在提交之后，要等 ring 转满一圈（`buffer_count` 轮）才会被标记为完成。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use scopeguard::ScopeGuard;
use truvis_gfx::commands::SemaphoreSubmit;

use crate::copy_engine::CopyEngine;
use crate::fs::FileSystem;
use crate::handlers::{self, HandlerContext};
use crate::request::UploadFunctionResult;
use crate::request_queue::RequestQueue;
use crate::staging::StagingPath;
use crate::token::{SyncToken, TokenTracker};

/// 资源加载器的运行统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// streamer 循环执行的轮数
    pub iterations: u64,
    /// 提交到 GPU 的 command buffer 数量
    pub submissions: u64,
    pub ring_allocations: u64,
    /// staging ring 放不下、单独创建临时 buffer 的次数
    pub overflow_allocations: u64,
    pub invalid_requests: u64,
}

#[derive(Default)]
pub(crate) struct StreamerStats {
    iterations: AtomicU64,
    submissions: AtomicU64,
    ring_allocations: AtomicU64,
    overflow_allocations: AtomicU64,
    invalid_requests: AtomicU64,
}

impl StreamerStats {
    #[inline]
    pub fn record_allocation(&self, path: StagingPath) {
        match path {
            StagingPath::Ring => self.ring_allocations.fetch_add(1, Ordering::Relaxed),
            StagingPath::Overflow => self.overflow_allocations.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> LoaderStats {
        LoaderStats {
            iterations: self.iterations.load(Ordering::Relaxed),
            submissions: self.submissions.load(Ordering::Relaxed),
            ring_allocations: self.ring_allocations.load(Ordering::Relaxed),
            overflow_allocations: self.overflow_allocations.load(Ordering::Relaxed),
            invalid_requests: self.invalid_requests.load(Ordering::Relaxed),
        }
    }
}

/// 生产者线程和 streamer 之间共享的状态
pub(crate) struct StreamerShared {
    pub tokens: TokenTracker,
    pub queue: RequestQueue,
    pub run: AtomicBool,
    /// 每个 device 最近一次提交完成时 timeline semaphore 到达的值，graphics 队列可以等待它
    pub last_semaphores: Mutex<Vec<Option<SemaphoreSubmit>>>,
    pub stats: StreamerStats,
    pub fs: Arc<dyn FileSystem>,
}

impl StreamerShared {
    pub fn new(device_count: usize, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            tokens: TokenTracker::new(),
            queue: RequestQueue::new(device_count),
            run: AtomicBool::new(true),
            last_semaphores: Mutex::new(vec![None; device_count]),
            stats: StreamerStats::default(),
            fs,
        }
    }

    pub fn last_semaphore(&self, device_index: usize) -> Option<SemaphoreSubmit> {
        self.last_semaphores.lock().unwrap_or_else(PoisonError::into_inner).get(device_index).copied().flatten()
    }
}

/// GPU 接口调用失败，无法恢复
fn fatal(what: &str, error: anyhow::Error) -> ! {
    log::error!("resource streamer: {} failed: {:?}", what, error);
    panic!("resource streamer: {what} failed: {error:#}");
}

pub(crate) struct Streamer {
    shared: Arc<StreamerShared>,
    engines: Vec<CopyEngine>,
    active: usize,
    /// 每个 slot 中实际录制了 GPU 工作的请求的最大 token
    slot_tokens: Vec<SyncToken>,
}

// new & init
impl Streamer {
    pub fn new(shared: Arc<StreamerShared>, engines: Vec<CopyEngine>, buffer_count: usize) -> Self {
        Self {
            shared,
            engines,
            // 第一轮会前进到 slot 0
            active: buffer_count - 1,
            slot_tokens: vec![SyncToken::NONE; buffer_count],
        }
    }

    /// streamer 线程的入口
    pub fn run(self) {
        log::info!("resource streamer started");
        let shared = self.shared.clone();
        // panic 时放弃剩余的请求，等待者不能挂起
        let mut streamer = scopeguard::guard_on_unwind(self, Streamer::abandon);
        while shared.run.load(Ordering::Acquire) {
            shared.queue.wait_for_work(&shared.tokens, &shared.run);
            if !shared.run.load(Ordering::Acquire) {
                break;
            }
            streamer.run_once();
        }
        streamer.drain();
        ScopeGuard::into_inner(streamer).shutdown();
        log::info!("resource streamer stopped");
    }

    /// 执行剩余的请求，等待所有 GPU 工作完成，然后销毁所有 copy engine
    pub fn shutdown(mut self) {
        let _span = tracy_client::span!("Streamer::shutdown");
        self.drain();
        self.destroy_engines();
        log::info!("resource streamer drained, stats: {:?}", self.shared.stats.snapshot());
    }

    /// 执行过程中 panic 之后的清理
    ///
    /// 队列中剩余的请求不再执行，它们的上传 buffer 直接销毁；已经提交的 GPU 工作完成之后销毁 copy engine。
    /// 已经分配的 token 全部视为完成。
    pub fn abandon(mut self) {
        let _span = tracy_client::span!("Streamer::abandon");
        let shared = self.shared.clone();
        shared.run.store(false, Ordering::Release);

        let (batches, _) = shared.queue.drain_all(&shared.tokens);
        for (engine, batch) in self.engines.iter().zip(batches) {
            for upload in batch.into_iter().filter_map(|queued| queued.upload_buffer) {
                engine.device().destroy_buffer(upload);
            }
        }
        shared.tokens.retire_all();
        self.destroy_engines();
        log::error!("resource streamer abandoned, stats: {:?}", shared.stats.snapshot());
    }

    fn drain(&mut self) {
        let shared = self.shared.clone();
        while shared.queue.has_work() || !shared.tokens.all_completed() {
            self.run_once();
        }
    }

    fn destroy_engines(&mut self) {
        self.shared.last_semaphores.lock().unwrap_or_else(PoisonError::into_inner).fill(None);
        for engine in self.engines.drain(..) {
            engine.destroy();
        }
    }
}

// 控制循环
impl Streamer {
    /// 只有在有事可做时才执行一轮，单线程模式使用
    pub fn pump(&mut self) -> bool {
        let shared = &self.shared;
        if !shared.queue.has_work() && shared.tokens.all_completed() {
            return false;
        }
        self.run_once();
        true
    }

    pub fn run_once(&mut self) {
        let _span = tracy_client::span!("Streamer::run_once");
        let shared = self.shared.clone();
        shared.stats.iterations.fetch_add(1, Ordering::Relaxed);

        // 复用下一个 slot，它的 fence 完成之后，slot 中的 token 才算完成
        self.active = (self.active + 1) % self.slot_tokens.len();
        for engine in &mut self.engines {
            if let Err(e) = engine.wait_and_reset(self.active) {
                fatal("wait copy resource set", e);
            }
        }
        let completed = std::mem::take(&mut self.slot_tokens[self.active]);
        shared.tokens.publish_completed(completed);

        let (batches, snapshot) = shared.queue.drain_all(&shared.tokens);
        let mut max_token = SyncToken::NONE;
        for (engine, batch) in self.engines.iter_mut().zip(batches) {
            for queued in batch {
                let kind = queued.request.kind();
                let result = {
                    let mut ctx = HandlerContext {
                        engine: &mut *engine,
                        fs: shared.fs.as_ref(),
                        stats: &shared.stats,
                    };
                    handlers::dispatch(&mut ctx, queued.request).unwrap_or_else(|e| fatal(kind, e))
                };
                // 请求自带的上传 buffer 跟随当前 slot 一起回收
                if let Some(upload) = queued.upload_buffer {
                    engine.retire_buffer(upload);
                }

                match result {
                    UploadFunctionResult::Completed => max_token = max_token.max(queued.wait_index),
                    UploadFunctionResult::InvalidRequest => {
                        log::warn!("invalid {} request retired (token {})", kind, queued.wait_index.value());
                        shared.stats.invalid_requests.fetch_add(1, Ordering::Relaxed);
                        shared.tokens.retire_early(queued.wait_index);
                    }
                }
            }
        }

        for engine in &mut self.engines {
            if !engine.is_recording() {
                continue;
            }
            let semaphore = engine.flush().unwrap_or_else(|e| fatal("submit copy commands", e));
            shared.stats.submissions.fetch_add(1, Ordering::Relaxed);
            if let Some(slot) =
                shared.last_semaphores.lock().unwrap_or_else(PoisonError::into_inner).get_mut(engine.device_index())
            {
                *slot = Some(semaphore);
            }
        }

        self.slot_tokens[self.active] = max_token;
        shared.tokens.publish_submitted(snapshot);
    }
}
