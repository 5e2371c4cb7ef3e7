use crate::job_scheduler::JobScheduler;

/// 每帧传给 `process()` 的状态
pub struct FrameState {
    /// 当前的帧序号，一直累加
    frame_id: u64,
    job_scheduler: JobScheduler,
}
// new & init
impl FrameState {
    pub fn new(job_scheduler: JobScheduler) -> Self {
        Self {
            frame_id: 0,
            job_scheduler,
        }
    }
}
// update
impl FrameState {
    /// 进入下一帧，并重置 job 预算
    #[inline]
    pub fn next_frame(&mut self) {
        self.frame_id = self.frame_id.wrapping_add(1);
        self.job_scheduler.reset_budgets();
    }
}
// getters
impl FrameState {
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    #[inline]
    pub fn job_scheduler(&self) -> &JobScheduler {
        &self.job_scheduler
    }

    #[inline]
    pub fn job_scheduler_mut(&mut self) -> &mut JobScheduler {
        &mut self.job_scheduler
    }

    #[inline]
    pub fn frame_name(&self) -> String {
        format!("[F{}]", self.frame_id)
    }
}

impl Default for FrameState {
    fn default() -> Self {
        Self::new(JobScheduler::default())
    }
}
