//! 同步调度执行器
//!
//! 管理一组动态变化的同步任务，每个任务按照自己的 cron 表达式独立触发。
//!
//! 核心机制：
//! 1. 单个调度循环，在最早的下次触发时间醒来（最多等待一个 tick）
//! 2. 到期任务各自 spawn 到独立的 tokio 任务，互不阻塞
//! 3. 同一任务严格串行：上一次执行未结束时，本次触发被跳过而不是排队
//! 4. `stop()` 排空在途执行；`terminate()` 向在途执行发送取消信号
//!
//! 线程安全：任务表由唯一一把 `parking_lot::RwLock` 保护，
//! 所有注册、移除与调度遍历都在该锁内完成，且从不跨越 `.await` 持有

use super::cron::CronSchedule;
use super::error::SyncError;
use super::task::{SharedTask, SyncContext};
use chrono::{DateTime, Local, NaiveDateTime};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 默认调度 tick（新注册任务最迟在一个 tick 内被发现）
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// 单次执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// 处理了数据
    Synchronized,
    /// 没有需要处理的数据
    Idle,
    /// 执行失败（已记录日志，等待下次调度）
    Failed(String),
    /// 被 `terminate()` 取消
    Cancelled,
}

/// 同步器状态快照
#[derive(Debug, Clone, Serialize)]
pub struct SynchronizerStatus {
    pub id: i64,
    pub label: String,
    pub schedule: String,
    pub active: bool,
    pub running: bool,
    pub next_fire: Option<NaiveDateTime>,
    pub last_run: Option<DateTime<Local>>,
    pub last_outcome: Option<SyncOutcome>,
}

/// 调度条目
struct ScheduleEntry {
    task: SharedTask,
    /// 表达式无效时为 None，任务暂停调度直到表达式被修正
    cron: Option<CronSchedule>,
    /// 解析 `cron` 时使用的原始表达式
    expression: String,
    next_fire: Option<NaiveDateTime>,
    running: bool,
    /// 手动触发，下一轮立即执行
    triggered: bool,
    /// 批处理模式下还有剩余工作，下一轮立即再次执行
    refire: bool,
    last_run: Option<DateTime<Local>>,
    last_outcome: Option<SyncOutcome>,
}

impl ScheduleEntry {
    fn new(task: SharedTask, cron: CronSchedule, expression: String, now: NaiveDateTime) -> Self {
        let next_fire = cron.next_after(now);
        Self {
            task,
            cron: Some(cron),
            expression,
            next_fire,
            running: false,
            triggered: false,
            refire: false,
            last_run: None,
            last_outcome: None,
        }
    }

    fn reschedule(&mut self, now: NaiveDateTime) {
        self.next_fire = self.cron.as_ref().and_then(|cron| cron.next_after(now));
    }

    /// 任务的调度表达式被修改时重新解析
    fn refresh_schedule(&mut self, id: i64, now: NaiveDateTime) {
        let current = self.task.schedule();
        if current == self.expression {
            return;
        }

        match CronSchedule::parse(&current) {
            Ok(cron) => {
                info!(
                    "同步器 {} 调度表达式变更: '{}' -> '{}'",
                    id, self.expression, current
                );
                self.cron = Some(cron);
                self.reschedule(now);
            }
            Err(e) => {
                error!("同步器 {} 的新调度表达式无效，暂停调度: {}", id, e);
                self.cron = None;
                self.next_fire = None;
            }
        }
        self.expression = current;
    }

    fn is_due(&self, now: NaiveDateTime) -> bool {
        self.next_fire.is_some_and(|next| next <= now)
    }

    fn status(&self, id: i64) -> SynchronizerStatus {
        SynchronizerStatus {
            id,
            label: self.task.label(),
            schedule: self.expression.clone(),
            active: self.task.is_active(),
            running: self.running,
            next_fire: self.next_fire,
            last_run: self.last_run,
            last_outcome: self.last_outcome.clone(),
        }
    }
}

/// 一次执行的结果，附带执行的任务实例
type Firing = (i64, SharedTask, SyncOutcome);

/// 是否为同一个任务实例（同 ID 重新注册后是不同实例）
fn same_task(a: &SharedTask, b: &SharedTask) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// 批处理进度（仅在一次批处理运行内有效）
#[derive(Default)]
struct BatchProgress {
    /// 本次批处理中已触发过的任务
    fired: HashSet<i64>,
    /// 已完成全部工作的任务
    done: HashSet<i64>,
}

/// 调度循环与公开接口共享的状态
struct Shared {
    /// 任务表，唯一的互斥点
    entries: RwLock<HashMap<i64, ScheduleEntry>>,
    running: watch::Sender<bool>,
    batch_mode: AtomicBool,
    tick_interval: Duration,
    /// 注册或手动触发后唤醒调度循环
    wakeup: Notify,
}

/// 一次运行的控制令牌
struct RunControl {
    /// 排空：调度循环停止派发，在途执行正常结束
    stop_token: CancellationToken,
    /// 强制终止：在途执行观察到取消信号
    cancel_token: CancellationToken,
}

/// 同步调度执行器
pub struct SchedulingExecutor {
    shared: Arc<Shared>,
    control: Mutex<Option<RunControl>>,
}

impl Default for SchedulingExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_INTERVAL)
    }
}

impl SchedulingExecutor {
    /// 创建执行器
    ///
    /// # 参数
    /// * `tick_interval` - 调度循环的最长等待间隔
    pub fn new(tick_interval: Duration) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                entries: RwLock::new(HashMap::new()),
                running,
                batch_mode: AtomicBool::new(false),
                tick_interval: tick_interval.max(Duration::from_millis(10)),
                wakeup: Notify::new(),
            }),
            control: Mutex::new(None),
        }
    }

    /// 注册同步器
    ///
    /// 运行中也可调用，新任务在下一轮调度时生效，不影响其他任务
    ///
    /// # 错误
    /// - `InvalidArgument`: 任务为空或 ID 已注册
    /// - `Configuration`: 调度表达式无效
    pub fn add_synchronizer(&self, task: Option<SharedTask>) -> Result<(), SyncError> {
        let task =
            task.ok_or_else(|| SyncError::InvalidArgument("同步器不能为空".to_string()))?;
        let id = task.id();
        let expression = task.schedule();
        let cron = CronSchedule::parse(&expression)
            .map_err(|source| SyncError::Configuration { id, source })?;

        let entry = ScheduleEntry::new(task, cron, expression, Local::now().naive_local());
        if entry.next_fire.is_none() {
            warn!("同步器 {} 的调度表达式 '{}' 永远不会触发", id, entry.expression);
        }

        {
            let mut entries = self.shared.entries.write();
            if entries.contains_key(&id) {
                return Err(SyncError::InvalidArgument(format!("同步器 {} 已注册", id)));
            }
            info!(
                "注册同步器 {} ({}), 下次触发: {:?}",
                id,
                entry.task.label(),
                entry.next_fire
            );
            entries.insert(id, entry);
        }

        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// 移除同步器
    ///
    /// 在途执行会正常结束，但不会再次触发
    pub fn remove_synchronizer(&self, id: i64) -> Result<(), SyncError> {
        match self.shared.entries.write().remove(&id) {
            Some(entry) => {
                info!(
                    "移除同步器 {} (执行中: {})",
                    id, entry.running
                );
                Ok(())
            }
            None => Err(SyncError::NotFound(id)),
        }
    }

    /// 手动触发同步器，下一轮调度立即执行
    pub fn trigger(&self, id: i64) -> Result<(), SyncError> {
        {
            let mut entries = self.shared.entries.write();
            let entry = entries.get_mut(&id).ok_or(SyncError::NotFound(id))?;
            entry.triggered = true;
        }
        info!("手动触发同步器 {}", id);
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// 启动执行器，已在运行时不做任何操作
    ///
    /// `stop()` 之后、在途执行排空之前调用同样被忽略，
    /// 需要先 `wait_until_stopped()` 再重新启动
    ///
    /// # 参数
    /// * `batch_mode` - `true` 时所有任务完成工作后自动停止
    pub fn start(&self, batch_mode: bool) {
        let mut control = self.control.lock();
        if self.is_running() {
            let draining = control
                .as_ref()
                .is_some_and(|control| control.stop_token.is_cancelled());
            if draining {
                warn!("执行器正在停止，忽略启动请求，请等待停止完成后重新启动");
            } else {
                debug!("执行器已在运行，忽略启动请求");
            }
            return;
        }

        self.shared.batch_mode.store(batch_mode, Ordering::SeqCst);
        self.shared.reset(Local::now().naive_local());

        let stop_token = CancellationToken::new();
        let cancel_token = CancellationToken::new();
        self.shared.running.send_replace(true);

        tokio::spawn(run_loop(
            self.shared.clone(),
            batch_mode,
            stop_token.clone(),
            cancel_token.clone(),
        ));

        *control = Some(RunControl {
            stop_token,
            cancel_token,
        });

        info!(
            "🚀 同步执行器已启动: 模式={}, 同步器数量={}",
            if batch_mode { "批处理" } else { "持续" },
            self.synchronizer_count()
        );
    }

    /// 请求停止：不再派发新的执行，在途执行正常结束后变为未运行
    pub fn stop(&self) {
        if let Some(control) = self.control.lock().as_ref() {
            if !control.stop_token.is_cancelled() {
                info!("请求停止同步执行器，等待在途同步完成");
            }
            control.stop_token.cancel();
        }
    }

    /// 强制终止：向所有在途执行发送取消信号
    pub fn terminate(&self) {
        if let Some(control) = self.control.lock().as_ref() {
            if !control.cancel_token.is_cancelled() {
                info!("终止同步执行器，取消所有在途同步");
            }
            control.cancel_token.cancel();
            control.stop_token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        *self.shared.running.borrow()
    }

    pub fn is_batch_mode_enabled(&self) -> bool {
        self.shared.batch_mode.load(Ordering::SeqCst)
    }

    /// 设置批处理模式，在下一次 `start` 时生效
    pub fn enable_batch_mode(&self, enabled: bool) {
        self.shared.batch_mode.store(enabled, Ordering::SeqCst);
    }

    /// 等待执行器进入未运行状态
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.shared.running.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }

    pub fn synchronizer_count(&self) -> usize {
        self.shared.entries.read().len()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.shared.entries.read().contains_key(&id)
    }

    /// 所有同步器的状态，按 ID 排序
    pub fn statuses(&self) -> Vec<SynchronizerStatus> {
        let entries = self.shared.entries.read();
        let mut statuses: Vec<_> = entries
            .iter()
            .map(|(id, entry)| entry.status(*id))
            .collect();
        statuses.sort_by_key(|status| status.id);
        statuses
    }

    pub fn status(&self, id: i64) -> Option<SynchronizerStatus> {
        self.shared
            .entries
            .read()
            .get(&id)
            .map(|entry| entry.status(id))
    }
}

impl Drop for SchedulingExecutor {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl Shared {
    /// 启动前重置调度状态
    fn reset(&self, now: NaiveDateTime) {
        let mut entries = self.entries.write();
        for entry in entries.values_mut() {
            entry.refire = false;
            entry.reschedule(now);
        }
    }

    /// 派发所有到期任务
    fn dispatch_due(
        &self,
        now: NaiveDateTime,
        batch_mode: bool,
        progress: &mut BatchProgress,
        cancel_token: &CancellationToken,
        in_flight: &mut JoinSet<Firing>,
    ) {
        let mut entries = self.entries.write();

        let mut due: Vec<(Option<NaiveDateTime>, i64)> = Vec::new();
        for (&id, entry) in entries.iter_mut() {
            entry.refresh_schedule(id, now);

            if !entry.task.is_active() {
                entry.triggered = false;
                entry.refire = false;
                // 停用期间推进触发时间，重新启用后不会立即补跑
                if entry.is_due(now) {
                    entry.reschedule(now);
                }
                continue;
            }

            // 批处理模式下每个可调度的任务在首轮立即执行一次，调度时间只决定顺序
            let scheduled = if batch_mode {
                entry.next_fire.is_some() && !progress.fired.contains(&id)
            } else {
                entry.is_due(now)
            };

            if entry.triggered || entry.refire || scheduled {
                due.push((entry.next_fire, id));
            }
        }

        // 批处理模式下按调度时间排序派发
        due.sort();

        for (_, id) in due {
            let Some(entry) = entries.get_mut(&id) else {
                continue;
            };

            if entry.is_due(now) {
                entry.reschedule(now);
            }
            entry.triggered = false;
            entry.refire = false;

            if entry.running {
                warn!("同步器 {} 上一次执行尚未结束，跳过本次触发", id);
                continue;
            }

            entry.running = true;
            entry.last_run = Some(Local::now());
            progress.fired.insert(id);

            debug!("派发同步器 {}, 下次触发: {:?}", id, entry.next_fire);

            let task = entry.task.clone();
            let ctx = SyncContext::new(cancel_token.child_token());
            in_flight.spawn(async move {
                let result = AssertUnwindSafe(task.synchronize(&ctx)).catch_unwind().await;
                let outcome = match result {
                    Ok(Ok(true)) => SyncOutcome::Synchronized,
                    Ok(Ok(false)) => SyncOutcome::Idle,
                    Ok(Err(SyncError::Cancelled)) => SyncOutcome::Cancelled,
                    Ok(Err(e)) => SyncOutcome::Failed(e.to_string()),
                    Err(_) => SyncOutcome::Failed("同步器执行时发生 panic".to_string()),
                };
                (id, task, outcome)
            });
        }
    }

    /// 处理一次执行的结束
    fn complete(
        &self,
        joined: Result<Firing, JoinError>,
        batch_mode: bool,
        progress: &mut BatchProgress,
    ) {
        let (id, task, outcome) = match joined {
            Ok(result) => result,
            Err(e) => {
                error!("同步执行任务异常退出: {}", e);
                return;
            }
        };

        match &outcome {
            SyncOutcome::Synchronized => debug!("同步器 {} 完成一轮同步", id),
            SyncOutcome::Idle => debug!("同步器 {} 没有需要同步的数据", id),
            SyncOutcome::Failed(message) => {
                error!("同步器 {} 执行失败，等待下次调度: {}", id, message)
            }
            SyncOutcome::Cancelled => debug!("同步器 {} 已取消", id),
        }

        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&id).filter(|entry| same_task(&entry.task, &task)) else {
            // 执行期间已被移除或替换
            return;
        };
        entry.running = false;

        if outcome == SyncOutcome::Cancelled {
            entry.next_fire = None;
        }

        if batch_mode {
            if outcome == SyncOutcome::Synchronized && entry.task.is_active() {
                entry.refire = true;
            } else {
                progress.done.insert(id);
            }
        }

        entry.last_outcome = Some(outcome);
    }

    /// 批处理是否已全部完成
    fn batch_complete(&self, progress: &BatchProgress) -> bool {
        if progress.fired.is_empty() {
            return false;
        }

        let entries = self.entries.read();
        entries.iter().all(|(id, entry)| {
            if entry.running || entry.triggered || entry.refire {
                return false;
            }
            if !entry.task.is_active() || progress.done.contains(id) {
                return true;
            }
            // 从未触发且永远不会触发的任务不阻塞批处理结束
            !progress.fired.contains(id) && entry.next_fire.is_none()
        })
    }

    /// 距离下一次需要调度的时间，最多一个 tick
    fn next_wake(&self, now: NaiveDateTime, batch_mode: bool, progress: &BatchProgress) -> Duration {
        let entries = self.entries.read();
        let mut wait = self.tick_interval;

        for (id, entry) in entries.iter() {
            if entry.running || !entry.task.is_active() {
                continue;
            }
            if entry.triggered || entry.refire {
                return Duration::ZERO;
            }
            if batch_mode && progress.fired.contains(id) {
                continue;
            }
            if let Some(next) = entry.next_fire {
                let until = (next - now).to_std().unwrap_or(Duration::ZERO);
                wait = wait.min(until);
            }
        }

        wait
    }
}

/// 调度循环
async fn run_loop(
    shared: Arc<Shared>,
    batch_mode: bool,
    stop_token: CancellationToken,
    cancel_token: CancellationToken,
) {
    let mut in_flight: JoinSet<Firing> = JoinSet::new();
    let mut progress = BatchProgress::default();

    loop {
        let now = Local::now().naive_local();
        shared.dispatch_due(now, batch_mode, &mut progress, &cancel_token, &mut in_flight);

        if batch_mode && in_flight.is_empty() && shared.batch_complete(&progress) {
            info!("批处理完成，同步执行器自动停止");
            break;
        }

        let wait = shared.next_wake(now, batch_mode, &progress);

        tokio::select! {
            _ = stop_token.cancelled() => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                shared.complete(joined, batch_mode, &mut progress);
            }
            _ = shared.wakeup.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    if !in_flight.is_empty() {
        info!("等待 {} 个在途同步结束", in_flight.len());
    }
    while let Some(joined) = in_flight.join_next().await {
        shared.complete(joined, batch_mode, &mut progress);
    }

    shared.running.send_replace(false);
    info!("同步执行器已停止");
}
