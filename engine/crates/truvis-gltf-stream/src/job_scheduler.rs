//! 按帧分配 GPU 资源创建时间的调度器
//!
//! 每种 job 有自己的预算，所有预算之和是一帧的总预算。
//! 自己的预算用完时可以向其他种类借，但上一帧被饿到的种类这一帧不能被借。
//! 每种 job 每帧至少可以执行一次，因此总耗时可能超出总预算。

use std::time::{Duration, Instant};

use crate::config::JobBudgetConfig;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum JobType {
    Texture,
    Program,
    BufferUpload,
}

impl JobType {
    pub const COUNT: usize = 3;
    pub const ALL: [JobType; Self::COUNT] = [JobType::Texture, JobType::Program, JobType::BufferUpload];

    #[inline]
    fn index(self) -> usize {
        match self {
            Self::Texture => 0,
            Self::Program => 1,
            Self::BufferUpload => 2,
        }
    }
}

/// 单个 job 种类在当前帧的预算记录
#[derive(Clone, Debug, Default)]
pub struct JobTypeBudget {
    pub total: Duration,
    pub used_this_frame: Duration,
    /// 其他种类从这里借走的时间
    pub stolen_from_me_this_frame: Duration,
    pub starved_this_frame: bool,
    pub starved_last_frame: bool,
    /// 本帧是否已经执行过至少一个 job
    pub progressed_this_frame: bool,
}

impl JobTypeBudget {
    fn new(total: Duration) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    #[inline]
    fn has_headroom(&self) -> bool {
        self.used_this_frame + self.stolen_from_me_this_frame < self.total
    }
}

type Timer = Box<dyn Fn() -> Duration + Send>;

pub struct JobScheduler {
    budgets: [JobTypeBudget; JobType::COUNT],
    total_budget: Duration,
    total_used_this_frame: Duration,
    disabled_this_frame: bool,

    /// 返回单调递增的时间，测试中可以替换
    timer: Timer,
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new(&JobBudgetConfig::default())
    }
}
// new & init
impl JobScheduler {
    pub fn new(config: &JobBudgetConfig) -> Self {
        let origin = Instant::now();
        Self::with_timer(config, Box::new(move || origin.elapsed()))
    }

    pub fn with_timer(config: &JobBudgetConfig, timer: Timer) -> Self {
        let budgets = JobType::ALL.map(|job_type| JobTypeBudget::new(config.budget(job_type)));
        let total_budget = budgets.iter().map(|budget| budget.total).sum();
        Self {
            budgets,
            total_budget,
            total_used_this_frame: Duration::ZERO,
            disabled_this_frame: false,
            timer,
        }
    }
}
// getters
impl JobScheduler {
    #[inline]
    pub fn budget(&self, job_type: JobType) -> &JobTypeBudget {
        &self.budgets[job_type.index()]
    }

    #[inline]
    pub fn total_budget(&self) -> Duration {
        self.total_budget
    }

    #[inline]
    pub fn total_used_this_frame(&self) -> Duration {
        self.total_used_this_frame
    }

    #[inline]
    pub fn is_disabled_this_frame(&self) -> bool {
        self.disabled_this_frame
    }
}
// update
impl JobScheduler {
    /// 每帧开始时调用一次
    pub fn reset_budgets(&mut self) {
        for budget in &mut self.budgets {
            budget.starved_last_frame = budget.starved_this_frame;
            budget.starved_this_frame = false;
            budget.used_this_frame = Duration::ZERO;
            budget.stolen_from_me_this_frame = Duration::ZERO;
            budget.progressed_this_frame = false;
        }
        self.total_used_this_frame = Duration::ZERO;
        self.disabled_this_frame = false;
    }

    /// 本帧剩下的 `execute` 全部拒绝，直到下一次 `reset_budgets`
    ///
    /// 正在执行的 job 不受影响：job 在 `execute` 内同步完成，调用到这里时不存在执行到一半的 job。
    pub fn disable_this_frame(&mut self) {
        self.disabled_this_frame = true;
    }

    /// 预算允许时执行 `job` 并返回 true；否则不执行，调用方下一帧重试
    pub fn execute(&mut self, job_type: JobType, job: impl FnOnce()) -> bool {
        if self.disabled_this_frame {
            return false;
        }

        let index = job_type.index();
        let own = &self.budgets[index];

        // 1. 总预算已经用完，并且这一类本帧已经执行过
        //    上一帧被饿到、且自己还有预算的种类不受总预算限制
        if self.total_used_this_frame >= self.total_budget
            && own.progressed_this_frame
            && !(own.starved_last_frame && own.has_headroom())
        {
            if own.has_headroom() {
                self.budgets[index].starved_this_frame = true;
            }
            return false;
        }

        // 2. 自己的预算用完了，向上一帧没有被饿到的种类借
        let mut lender = None;
        if !own.has_headroom() {
            lender = JobType::ALL.iter().map(|other| other.index()).find(|&other| {
                other != index && self.budgets[other].has_headroom() && !self.budgets[other].starved_last_frame
            });

            // 3. 借不到并且本帧已经执行过：拒绝；否则保证每帧至少执行一次
            if lender.is_none() && own.progressed_this_frame {
                return false;
            }
        }

        // 4. 执行并计时
        let start = (self.timer)();
        job();
        let elapsed = (self.timer)().saturating_sub(start);

        match lender {
            Some(lender) => self.budgets[lender].stolen_from_me_this_frame += elapsed,
            None => self.budgets[index].used_this_frame += elapsed,
        }
        self.budgets[index].progressed_this_frame = true;
        self.total_used_this_frame += elapsed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// 手动推进的时钟，单位毫秒
    fn manual_clock() -> (Arc<AtomicU64>, Timer) {
        let now = Arc::new(AtomicU64::new(0));
        let reader = now.clone();
        (now, Box::new(move || Duration::from_millis(reader.load(Ordering::SeqCst))))
    }

    fn budgets(texture: u64, program: u64, buffer_upload: u64) -> JobBudgetConfig {
        JobBudgetConfig {
            texture_ms: texture,
            program_ms: program,
            buffer_upload_ms: buffer_upload,
        }
    }

    /// 按 round-robin 提交 job，直到一整轮都被拒绝；返回每种 job 执行的次数
    fn run_frame(
        scheduler: &mut JobScheduler,
        clock: &Arc<AtomicU64>,
        durations: [u64; JobType::COUNT],
        first_calls: &mut Vec<bool>,
    ) -> [usize; JobType::COUNT] {
        let mut counts = [0; JobType::COUNT];
        let mut first_round = true;
        loop {
            let mut any = false;
            for job_type in JobType::ALL {
                let duration = durations[job_type.index()];
                let executed = scheduler.execute(job_type, || {
                    clock.fetch_add(duration, Ordering::SeqCst);
                });
                if first_round {
                    first_calls.push(executed);
                }
                counts[job_type.index()] += executed as usize;
                any |= executed;
            }
            first_round = false;
            if !any {
                return counts;
            }
        }
    }

    #[test]
    fn test_budget_fairness_with_equal_jobs() {
        let (clock, timer) = manual_clock();
        let mut scheduler = JobScheduler::with_timer(&budgets(10, 10, 30), timer);
        let mut first_calls = Vec::new();
        let mut starved_last = [false; JobType::COUNT];

        for _ in 0..20 {
            scheduler.reset_budgets();
            let counts = run_frame(&mut scheduler, &clock, [5, 5, 5], &mut first_calls);

            assert_eq!(counts, [4, 3, 3]);
            assert_eq!(scheduler.total_used_this_frame(), Duration::from_millis(50));
            for job_type in JobType::ALL {
                let starved = scheduler.budget(job_type).starved_this_frame;
                assert!(!(starved && starved_last[job_type.index()]), "{job_type:?} starved twice in a row");
                starved_last[job_type.index()] = starved;
            }
        }
        assert!(first_calls.iter().all(|&executed| executed));
    }

    #[test]
    fn test_slow_kind_cannot_starve_others_twice() {
        let (clock, timer) = manual_clock();
        let mut scheduler = JobScheduler::with_timer(&budgets(10, 10, 30), timer);
        let mut first_calls = Vec::new();

        // 一个 40ms 的 Program job 用光了总预算
        scheduler.reset_budgets();
        let counts = run_frame(&mut scheduler, &clock, [5, 40, 5], &mut first_calls);
        assert_eq!(counts, [1, 1, 1]);
        assert!(scheduler.budget(JobType::Texture).starved_this_frame);
        assert!(!scheduler.budget(JobType::Program).starved_this_frame);
        assert!(scheduler.budget(JobType::BufferUpload).starved_this_frame);

        // 下一帧被饿到的种类拿到完整预算，总耗时超出总预算
        scheduler.reset_budgets();
        let counts = run_frame(&mut scheduler, &clock, [5, 40, 5], &mut first_calls);
        assert_eq!(counts, [2, 1, 6]);
        assert_eq!(scheduler.total_used_this_frame(), Duration::from_millis(80));
        for job_type in JobType::ALL {
            assert!(!scheduler.budget(job_type).starved_this_frame);
        }

        assert!(first_calls.iter().all(|&executed| executed));
    }

    #[test]
    fn test_first_call_runs_with_zero_budget() {
        let (clock, timer) = manual_clock();
        let mut scheduler = JobScheduler::with_timer(&budgets(0, 0, 0), timer);

        for _ in 0..3 {
            scheduler.reset_budgets();
            for job_type in JobType::ALL {
                assert!(scheduler.execute(job_type, || {
                    clock.fetch_add(5, Ordering::SeqCst);
                }));
                assert!(!scheduler.execute(job_type, || {}));
            }
        }
    }

    #[test]
    fn test_disable_this_frame() {
        let (_clock, timer) = manual_clock();
        let mut scheduler = JobScheduler::with_timer(&budgets(10, 10, 30), timer);

        scheduler.reset_budgets();
        scheduler.disable_this_frame();
        let mut ran = false;
        assert!(!scheduler.execute(JobType::Texture, || ran = true));
        assert!(!ran);

        scheduler.reset_budgets();
        assert!(scheduler.execute(JobType::Texture, || ran = true));
        assert!(ran);
    }

    #[test]
    fn test_stolen_time_is_charged_to_lender() {
        let (clock, timer) = manual_clock();
        let mut scheduler = JobScheduler::with_timer(&budgets(4, 0, 30), timer);
        scheduler.reset_budgets();

        // Program 没有预算：先向 Texture 借，Texture 用完后向 BufferUpload 借
        for _ in 0..2 {
            assert!(scheduler.execute(JobType::Program, || {
                clock.fetch_add(4, Ordering::SeqCst);
            }));
        }

        assert_eq!(scheduler.budget(JobType::Program).used_this_frame, Duration::ZERO);
        assert_eq!(
            scheduler.budget(JobType::Texture).stolen_from_me_this_frame,
            Duration::from_millis(4)
        );
        assert_eq!(
            scheduler.budget(JobType::BufferUpload).stolen_from_me_this_frame,
            Duration::from_millis(4)
        );
        assert_eq!(scheduler.total_used_this_frame(), Duration::from_millis(8));
    }
}
