use crossbeam_channel::{Receiver, Sender, TryRecvError};
use crossbeam_utils::sync::WaitGroup;
use std::thread;

type IoJob = Box<dyn FnOnce() + Send + 'static>;

/// 负责管理后台 IO 任务：读取 buffer / image 字节，解码图片
///
/// ## 架构设计
/// - 内部的 `dispatch-thread` 负责调度：接收请求，分发任务到 worker
/// - rayon 提供 worker 线程池
/// - crossbeam 提供线程间通信的 channel
/// - 每个请求都有自己的结果 channel（`IoTask`），由发起请求的 loader 在 `process()` 中轮询
///
/// 丢弃 `IoTask` 即是取消：任务仍然会执行完，但结果在 send 时被丢弃。
pub struct IoDispatcher {
    mode: DispatchMode,
}

enum DispatchMode {
    Pool {
        /// 用于向 dispatch-thread 发送请求
        request_sender: Option<Sender<IoJob>>,
        /// 用于分发 IO 任务的后台线程
        dispatch_thread: Option<thread::JoinHandle<()>>,
    },
    /// 在调用线程上同步执行，测试中使用
    Inline,
}
// new & init
impl IoDispatcher {
    /// `worker_threads == 0` 时由 rayon 决定线程数
    pub fn new(worker_threads: usize) -> anyhow::Result<Self> {
        let (req_tx, req_rx) = crossbeam_channel::unbounded::<IoJob>();

        // Rayon 线程池，用于执行实际的 IO 任务
        let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|index| format!("Asset-Loader-{}", index));
        if worker_threads > 0 {
            builder = builder.num_threads(worker_threads);
        }
        let pool = builder.build()?;

        // 调度线程，负责接收请求并分发任务
        let dispatch_thread = thread::Builder::new().name("AssetDispatchThread".to_string()).spawn(move || {
            let wait_group = WaitGroup::new();

            while let Ok(job) = req_rx.recv() {
                let _span = tracy_client::span!("IoDispatcher::dispatch");

                // 当任务结束，闭包销毁，wg_task 也会被 drop
                let wg_task = wait_group.clone();
                pool.spawn(move || {
                    job();
                    drop(wg_task);
                });
            }

            // 等待所有任务完成
            wait_group.wait();
        })?;

        Ok(Self {
            mode: DispatchMode::Pool {
                request_sender: Some(req_tx),
                dispatch_thread: Some(dispatch_thread),
            },
        })
    }

    pub fn inline() -> Self {
        Self {
            mode: DispatchMode::Inline,
        }
    }
}
// tools
impl IoDispatcher {
    /// 提交一个任务，返回用于轮询结果的 `IoTask`
    pub fn spawn<T, F>(&self, job: F) -> IoTask<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (result_tx, result_rx) = crossbeam_channel::bounded::<T>(1);
        let job = move || {
            // 接收端已经被丢弃（loader 被销毁）时，结果直接丢弃
            let _ = result_tx.send(job());
        };

        match &self.mode {
            DispatchMode::Pool { request_sender, .. } => {
                if let Some(sender) = request_sender
                    && let Err(e) = sender.send(Box::new(job))
                {
                    // job 随错误一起被 drop，IoTask 会观察到 Lost
                    log::error!("Failed to send io request: {}", e);
                }
            }
            DispatchMode::Inline => job(),
        }

        IoTask { receiver: result_rx }
    }

    #[inline]
    pub fn is_inline(&self) -> bool {
        matches!(self.mode, DispatchMode::Inline)
    }
}
// destroy
impl Drop for IoDispatcher {
    fn drop(&mut self) {
        let DispatchMode::Pool {
            request_sender,
            dispatch_thread,
        } = &mut self.mode
        else {
            return;
        };

        // 必须先 drop sender，否则 recv 会一直阻塞，导致 join 死锁
        *request_sender = None;

        log::info!("IoDispatcher is being dropped, waiting for tasks to complete...");
        if let Some(thread) = dispatch_thread.take()
            && thread.join().is_err()
        {
            log::error!("Failed to join IO dispatcher thread");
        }
        log::info!("All IO tasks completed, IoDispatcher dropped.");
    }
}

pub enum IoPoll<T> {
    Pending,
    Ready(T),
    /// worker 没有发送结果就退出了
    Lost,
}

/// 单个 IO 请求的结果
pub struct IoTask<T> {
    receiver: Receiver<T>,
}

impl<T> IoTask<T> {
    pub fn poll(&self) -> IoPoll<T> {
        match self.receiver.try_recv() {
            Ok(value) => IoPoll::Ready(value),
            Err(TryRecvError::Empty) => IoPoll::Pending,
            Err(TryRecvError::Disconnected) => IoPoll::Lost,
        }
    }

    /// 阻塞等待结果，命令行工具在 flush 时使用
    pub fn wait(self) -> Option<T> {
        self.receiver.recv().ok()
    }
}
