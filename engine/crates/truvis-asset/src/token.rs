//! 同步 token
//!
//! 每一个请求在入队时都会分配一个严格递增的 token。进程内维护三个水位：
//! - counter：已经分配出去的最大 token
//! - submitted：GPU 工作已经录制并提交的最大 token
//! - completed：GPU 上已经确定执行完毕的最大 token
//!
//! 始终满足 `completed <= submitted <= counter`。
//!
//! 无效请求（例如文件不存在）不会产生 GPU 工作，会被提前 retire：
//! 它们先进入 early-retired 集合，`is_completed` 会立刻返回 true；
//! 当 completed 水位追上来时，连续的 early-retired token 会被合并进水位。

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crossbeam_utils::CachePadded;

/// 请求完成的凭证，可以用来轮询或者阻塞等待
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyncToken(u64);

impl SyncToken {
    /// 不对应任何请求，总是处于完成状态
    pub const NONE: Self = Self(0);

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }
}

pub(crate) struct TokenTracker {
    counter: CachePadded<AtomicU64>,
    submitted: CachePadded<AtomicU64>,
    completed: CachePadded<AtomicU64>,

    /// 大于 completed 水位、但已经提前 retire 的 token
    early_retired: Mutex<BTreeSet<u64>>,
    token_cond: Condvar,
}

impl Default for TokenTracker {
    fn default() -> Self {
        Self::new()
    }
}

// new & 发布
impl TokenTracker {
    pub fn new() -> Self {
        Self {
            counter: CachePadded::new(AtomicU64::new(0)),
            submitted: CachePadded::new(AtomicU64::new(0)),
            completed: CachePadded::new(AtomicU64::new(0)),
            early_retired: Mutex::new(BTreeSet::new()),
            token_cond: Condvar::new(),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, BTreeSet<u64>> {
        self.early_retired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 分配一个新的 token
    ///
    /// 需要在请求队列的锁内调用，保证 token 顺序和入队顺序一致
    #[inline]
    pub fn issue(&self) -> SyncToken {
        SyncToken(self.counter.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// 所有 `<= token` 的请求都已经录制并提交
    pub fn publish_submitted(&self, token: SyncToken) {
        debug_assert!(token.0 <= self.counter.load(Ordering::Acquire));
        let mut early = self.lock();
        self.submitted.fetch_max(token.0, Ordering::AcqRel);
        self.compact(&mut early);
        drop(early);
        self.token_cond.notify_all();
    }

    /// 所有 `<= token` 的请求都已经在 GPU 上执行完毕
    pub fn publish_completed(&self, token: SyncToken) {
        let mut early = self.lock();
        debug_assert!(token.0 <= self.submitted.load(Ordering::Acquire));
        self.completed.fetch_max(token.0, Ordering::AcqRel);
        self.compact(&mut early);
        drop(early);
        self.token_cond.notify_all();
    }

    /// 没有 GPU 工作的请求，立刻视为完成
    pub fn retire_early(&self, token: SyncToken) {
        let mut early = self.lock();
        if token.0 > self.completed.load(Ordering::Acquire) {
            early.insert(token.0);
            self.compact(&mut early);
        }
        drop(early);
        self.token_cond.notify_all();
    }

    /// streamer 不再工作之后调用：已经分配的 token 全部视为完成，唤醒所有等待者
    pub fn retire_all(&self) {
        let mut early = self.lock();
        let counter = self.counter.load(Ordering::Acquire);
        self.submitted.fetch_max(counter, Ordering::AcqRel);
        self.completed.fetch_max(counter, Ordering::AcqRel);
        early.clear();
        drop(early);
        self.token_cond.notify_all();
    }

    /// 把与 completed 水位连续的 early-retired token 合并进水位，但不会越过 submitted
    fn compact(&self, early: &mut BTreeSet<u64>) {
        let submitted = self.submitted.load(Ordering::Acquire);
        let mut completed = self.completed.load(Ordering::Acquire);

        // 已经被水位覆盖的不再需要单独记录
        while let Some(&first) = early.first() {
            if first <= completed {
                early.pop_first();
            } else if first == completed + 1 && first <= submitted {
                early.pop_first();
                completed = first;
            } else {
                break;
            }
        }
        self.completed.fetch_max(completed, Ordering::AcqRel);
    }
}

// 查询 & 等待
impl TokenTracker {
    #[inline]
    pub fn counter(&self) -> SyncToken {
        SyncToken(self.counter.load(Ordering::Acquire))
    }

    #[cfg(test)]
    pub fn last_submitted(&self) -> SyncToken {
        SyncToken(self.submitted.load(Ordering::Acquire))
    }

    #[inline]
    pub fn last_completed(&self) -> SyncToken {
        SyncToken(self.completed.load(Ordering::Acquire))
    }

    pub fn is_completed(&self, token: SyncToken) -> bool {
        // 快速路径只读一次原子变量
        if self.completed.load(Ordering::Relaxed) >= token.0 {
            return true;
        }
        self.is_completed_locked(&self.lock(), token)
    }

    fn is_completed_locked(&self, early: &BTreeSet<u64>, token: SyncToken) -> bool {
        self.completed.load(Ordering::Acquire) >= token.0 || early.contains(&token.0)
    }

    /// 所有已经分配的 token 都已完成
    #[inline]
    pub fn all_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire) >= self.counter.load(Ordering::Acquire)
    }

    /// 阻塞直到 token 完成
    pub fn wait(&self, token: SyncToken) {
        let _span = tracy_client::span!("TokenTracker::wait");
        let mut early = self.lock();
        while !self.is_completed_locked(&early, token) {
            early = self.token_cond.wait(early).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// 阻塞直到当前已经分配的所有 token 都完成
    pub fn wait_all(&self) {
        let target = self.counter();
        let mut early = self.lock();
        while self.completed.load(Ordering::Acquire) < target.0 {
            early = self.token_cond.wait(early).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_strictly_increase() {
        let tracker = TokenTracker::new();
        let tokens: Vec<_> = (0..16).map(|_| tracker.issue()).collect();
        assert!(tokens.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(tracker.counter(), *tokens.last().unwrap());
        assert!(!tracker.is_completed(tokens[0]));
        assert!(tracker.is_completed(SyncToken::NONE));
    }

    #[test]
    fn test_watermarks_are_ordered() {
        let tracker = TokenTracker::new();
        let t1 = tracker.issue();
        let t2 = tracker.issue();

        tracker.publish_submitted(t2);
        assert_eq!(tracker.last_submitted(), t2);
        assert_eq!(tracker.last_completed(), SyncToken::NONE);

        tracker.publish_completed(t1);
        assert!(tracker.is_completed(t1));
        assert!(!tracker.is_completed(t2));
        assert!(tracker.last_completed() <= tracker.last_submitted());
        assert!(tracker.last_submitted() <= tracker.counter());
    }

    #[test]
    fn test_early_retire_is_visible_immediately() {
        let tracker = TokenTracker::new();
        let t1 = tracker.issue();
        let t2 = tracker.issue();

        tracker.retire_early(t2);
        assert!(tracker.is_completed(t2));
        assert!(!tracker.is_completed(t1));
        // t1 还没完成，水位不能越过它
        assert_eq!(tracker.last_completed(), SyncToken::NONE);

        tracker.publish_submitted(t2);
        tracker.publish_completed(t1);
        assert_eq!(tracker.last_completed(), t2);
        assert!(tracker.all_completed());
    }

    #[test]
    fn test_early_retire_never_passes_submitted() {
        let tracker = TokenTracker::new();
        let t1 = tracker.issue();
        tracker.retire_early(t1);
        assert!(tracker.is_completed(t1));
        assert_eq!(tracker.last_completed(), SyncToken::NONE);
        assert!(!tracker.all_completed());

        tracker.publish_submitted(t1);
        assert_eq!(tracker.last_completed(), t1);
    }

    #[test]
    fn test_wait_wakes_up() {
        let tracker = std::sync::Arc::new(TokenTracker::new());
        let token = tracker.issue();

        let waiter = {
            let tracker = tracker.clone();
            std::thread::spawn(move || tracker.wait(token))
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        tracker.publish_submitted(token);
        tracker.publish_completed(token);
        waiter.join().unwrap();
    }

    #[test]
    fn test_retire_all_releases_waiters() {
        let tracker = std::sync::Arc::new(TokenTracker::new());
        let t1 = tracker.issue();
        let t2 = tracker.issue();
        tracker.retire_early(t2);

        let waiter = {
            let tracker = tracker.clone();
            std::thread::spawn(move || tracker.wait_all())
        };
        tracker.retire_all();
        waiter.join().unwrap();
        assert!(tracker.is_completed(t1));
        assert_eq!(tracker.last_submitted(), t2);
        assert_eq!(tracker.last_completed(), t2);

        // 之后分配的 token 照常走水位
        let t3 = tracker.issue();
        assert!(!tracker.is_completed(t3));
    }
}
