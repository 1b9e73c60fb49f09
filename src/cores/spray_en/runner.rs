use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::baseline::Baseline;
use super::context::EngineContext;
use super::expression::ExpressionSet;
use super::pool::{Pool, PoolConfig, SprayMod};
use super::statistor::{Statistor, StatistorData};
use super::types::Shutdown;
use super::words::{RuleProgram, WordFn, Worder};
use crate::cores::http_en::ClientMode;
use crate::errors::RsprayError;

/// How the whole run ended; maps to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Finished,
    Aborted,
}

/// One target waiting for a pool, possibly resumed from a stat record.
#[derive(Debug, Clone)]
pub struct Task {
    pub base_url: String,
    pub depth: usize,
    pub origin: Option<StatistorData>,
}

impl Task {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            depth: 0,
            origin: None,
        }
    }

    pub fn from_origin(origin: StatistorData) -> Self {
        Self {
            base_url: origin.base_url.clone(),
            depth: 0,
            origin: Some(origin),
        }
    }
}

/// 多目标运行配置
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub wordlist: Arc<Vec<String>>,
    pub dict_files: Vec<String>,
    pub rule_files: Vec<String>,
    pub word_rules: Option<Arc<RuleProgram>>,
    pub append_rule: Option<Arc<RuleProgram>>,
    pub append_rule_file: Option<String>,
    pub fns: Vec<WordFn>,
    pub exprs: Arc<ExpressionSet>,
    pub headers: Vec<(String, String)>,
    pub thread: usize,
    pub pool_size: usize,
    pub timeout: Duration,
    pub client_mode: ClientMode,
    pub mode: SprayMod,
    pub rate_limit: Option<u32>,
    pub check_period: i32,
    pub err_period: i32,
    pub break_threshold: i32,
    pub crawl: bool,
    pub active: bool,
    pub bak: bool,
    pub fuzzy: bool,
    pub force: bool,
    pub max_recursion: usize,
    pub offset: i64,
    pub limit: i64,
    pub deadline: Option<Duration>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            wordlist: Arc::new(Vec::new()),
            dict_files: Vec::new(),
            rule_files: Vec::new(),
            word_rules: None,
            append_rule: None,
            append_rule_file: None,
            fns: Vec::new(),
            exprs: Arc::new(ExpressionSet::default()),
            headers: Vec::new(),
            thread: 20,
            pool_size: 5,
            timeout: Duration::from_secs(5),
            client_mode: ClientMode::Auto,
            mode: SprayMod::Path,
            rate_limit: None,
            check_period: 200,
            err_period: 10,
            break_threshold: 20,
            crawl: false,
            active: false,
            bak: false,
            fuzzy: false,
            force: false,
            max_recursion: 0,
            offset: 0,
            limit: 0,
            deadline: None,
        }
    }
}

/// The slice of runner state the output consumers need: recursion re-entry
/// goes through here back into the task queue.
pub struct RunnerShared {
    task_tx: mpsc::UnboundedSender<Task>,
    pool_names: Mutex<HashSet<String>>,
    seeded: AtomicUsize,
}

impl RunnerShared {
    pub fn add_task(&self, task: Task) -> bool {
        {
            let mut names = self.pool_names.lock().unwrap();
            if !names.insert(task.base_url.clone()) {
                info!("already added pool, skip {}", task.base_url);
                return false;
            }
        }
        self.seeded.fetch_add(1, Ordering::SeqCst);
        self.task_tx.send(task).is_ok()
    }

    /// Promotes a discovered directory-like hit into a new target.
    pub fn add_recursive(&self, bl: &Baseline) {
        let mut task = Task::new(bl.url_string.clone());
        task.depth = bl.recu_depth + 1;
        self.add_task(task);
    }
}

/// 多目标监督者: 二级池, 每个目标一个 Pool, 输出/模糊/统计三条流
pub struct Runner {
    me: Weak<Runner>,
    config: RunnerConfig,
    ctx: Arc<EngineContext>,
    shared: Arc<RunnerShared>,
    task_rx: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
    out_tx: mpsc::Sender<Baseline>,
    fuzzy_tx: mpsc::Sender<Baseline>,
    stat_tx: mpsc::UnboundedSender<StatistorData>,
    out_rx: Mutex<Option<mpsc::Receiver<Baseline>>>,
    fuzzy_rx: Mutex<Option<mpsc::Receiver<Baseline>>>,
    stat_rx: Mutex<Option<mpsc::UnboundedReceiver<StatistorData>>>,
    cancel: Arc<Shutdown>,
    progress: MultiProgress,
    finished: AtomicUsize,
}

impl Runner {
    pub fn new(config: RunnerConfig, ctx: Arc<EngineContext>) -> Arc<Self> {
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(100);
        let (fuzzy_tx, fuzzy_rx) = mpsc::channel(100);
        let (stat_tx, stat_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            ctx,
            shared: Arc::new(RunnerShared {
                task_tx,
                pool_names: Mutex::new(HashSet::new()),
                seeded: AtomicUsize::new(0),
            }),
            task_rx: Mutex::new(Some(task_rx)),
            out_tx,
            fuzzy_tx,
            stat_tx,
            out_rx: Mutex::new(Some(out_rx)),
            fuzzy_rx: Mutex::new(Some(fuzzy_rx)),
            stat_rx: Mutex::new(Some(stat_rx)),
            cancel: Arc::new(Shutdown::new()),
            progress: MultiProgress::new(),
            finished: AtomicUsize::new(0),
        })
    }

    pub fn shared(&self) -> Arc<RunnerShared> {
        self.shared.clone()
    }

    pub fn cancel_token(&self) -> Arc<Shutdown> {
        self.cancel.clone()
    }

    /// Hands the three result streams to the caller; callable once.
    #[allow(clippy::type_complexity)]
    pub fn take_outputs(
        &self,
    ) -> Result<
        (
            mpsc::Receiver<Baseline>,
            mpsc::Receiver<Baseline>,
            mpsc::UnboundedReceiver<StatistorData>,
        ),
        RsprayError,
    > {
        let out = self.out_rx.lock().unwrap().take();
        let fuzzy = self.fuzzy_rx.lock().unwrap().take();
        let stat = self.stat_rx.lock().unwrap().take();
        match (out, fuzzy, stat) {
            (Some(o), Some(f), Some(s)) => Ok((o, f, s)),
            _ => Err(RsprayError::ResultsReceiverTaken),
        }
    }

    pub fn add_tasks(&self, tasks: impl IntoIterator<Item = Task>) {
        for task in tasks {
            self.shared.add_task(task);
        }
    }

    pub async fn run(&self) -> RunOutcome {
        if self.shared.seeded.load(Ordering::SeqCst) == 0 {
            return RunOutcome::Finished;
        }

        if let Some(deadline) = self.config.deadline {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                error!("cancel with deadline");
                cancel.cancel();
            });
        }

        let mut task_rx = match self.task_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return RunOutcome::Finished,
        };
        let sem = Arc::new(Semaphore::new(self.config.pool_size.max(1)));
        let mut pools = JoinSet::new();

        loop {
            tokio::select! {
                Some(task) = task_rx.recv() => {
                    if self.cancel.is_cancelled() {
                        self.flush_skipped(task);
                        continue;
                    }
                    let Some(runner) = self.me.upgrade() else {
                        break;
                    };
                    let sem = sem.clone();
                    pools.spawn(async move {
                        let _permit = sem.acquire_owned().await;
                        runner.run_one(task).await;
                    });
                }
                Some(_) = pools.join_next(), if !pools.is_empty() => {
                    self.finished.fetch_add(1, Ordering::SeqCst);
                    if pools.is_empty() {
                        // let late recursion re-entries land before deciding
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        if task_rx.is_empty() {
                            break;
                        }
                    }
                }
                _ = self.cancel.wait() => {
                    // stats for never-started targets still get written so
                    // resume covers them
                    while let Ok(task) = task_rx.try_recv() {
                        self.flush_skipped(task);
                    }
                    break;
                }
            }
        }

        while pools.join_next().await.is_some() {}
        tokio::time::sleep(Duration::from_millis(100)).await;

        if self.cancel.is_cancelled() {
            RunOutcome::Aborted
        } else {
            RunOutcome::Finished
        }
    }

    async fn run_one(&self, task: Task) {
        if let Some(origin) = &task.origin {
            if origin.is_finished() {
                let _ = self.stat_tx.send(origin.clone());
                self.done_bar();
                return;
            }
        }

        let cfg = &self.config;
        let pool_cfg = PoolConfig {
            base_url: task.base_url.clone(),
            thread: cfg.thread,
            timeout: cfg.timeout,
            client_mode: cfg.client_mode,
            mode: cfg.mode,
            headers: cfg.headers.clone(),
            rate_limit: cfg.rate_limit,
            check_period: cfg.check_period,
            err_period: cfg.err_period,
            break_threshold: cfg.break_threshold,
            crawl: cfg.crawl,
            active: cfg.active,
            bak: cfg.bak,
            fuzzy: cfg.fuzzy,
            max_recursion: cfg.max_recursion,
            depth: task.depth,
            exprs: cfg.exprs.clone(),
            append_rule: cfg.append_rule.clone(),
        };

        let (statistor, words) = match self.prepare_target(&task) {
            Ok(pair) => pair,
            Err(e) => {
                error!("{}: {}", task.base_url, e);
                let mut data = StatistorData::default();
                data.base_url = task.base_url.clone();
                data.error = e.to_string();
                let _ = self.stat_tx.send(data);
                self.done_bar();
                return;
            }
        };

        let limit = if cfg.limit > 0 && statistor.word_total > cfg.limit {
            cfg.limit
        } else {
            statistor.word_total
        };

        let bar = self.progress.add(ProgressBar::new(
            (limit - statistor.offset).max(0) as u64,
        ));
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar.set_message(task.base_url.clone());

        // child token: the failure controller kills one target, the parent
        // token kills everything
        let child = Arc::new(Shutdown::new());
        {
            let parent = self.cancel.clone();
            let child = child.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = parent.wait() => child.cancel(),
                    _ = child.wait() => {}
                }
            });
        }

        let pool = match Pool::new(
            pool_cfg,
            self.ctx.clone(),
            statistor.clone(),
            self.out_tx.clone(),
            self.fuzzy_tx.clone(),
            child,
            bar,
        ) {
            Ok(pool) => pool,
            Err(e) => {
                error!("{}: {}", task.base_url, e);
                statistor.set_error(e.to_string());
                let _ = self.stat_tx.send(statistor.snapshot());
                self.done_bar();
                return;
            }
        };

        if let Err(e) = pool.init().await {
            statistor.set_error(e.to_string());
            if !cfg.force {
                warn!("{}", e);
                self.print_stat(&statistor);
                let _ = self.stat_tx.send(statistor.snapshot());
                self.done_bar();
                return;
            }
        }

        let worder_rx = Worder::spawn(words, cfg.fns.clone(), cfg.word_rules.clone());
        pool.run(worder_rx, statistor.offset, limit).await;

        if pool.is_failed() {
            // rewind so resume starts at the first failure of the abort window
            if let Some(number) = pool.first_failed_number() {
                statistor.rewind_end(number);
            }
        }

        self.print_stat(&statistor);
        let _ = self.stat_tx.send(statistor.snapshot());
        self.done_bar();
    }

    #[allow(clippy::type_complexity)]
    fn prepare_target(
        &self,
        task: &Task,
    ) -> Result<(Arc<Statistor>, Arc<Vec<String>>), RsprayError> {
        let cfg = &self.config;
        if let Some(origin) = &task.origin {
            let statistor = Arc::new(Statistor::from_data(origin));
            // command line wordlists win over the recorded dict files
            let words = if !cfg.wordlist.is_empty() {
                cfg.wordlist.clone()
            } else {
                let mut words = Vec::new();
                for file in &origin.dict_files {
                    words.extend(self.ctx.load_dict(Path::new(file))?.iter().cloned());
                }
                if words.is_empty() {
                    return Err(RsprayError::EmptyWordlist);
                }
                Arc::new(words)
            };
            Ok((statistor, words))
        } else {
            let mut statistor = Statistor::new(&task.base_url);
            statistor.word_total = cfg.wordlist.len() as i64;
            statistor.offset = cfg.offset;
            statistor.dict_files = cfg.dict_files.clone();
            statistor.rule_files = cfg.rule_files.clone();
            statistor.append_rule_file = cfg.append_rule_file.clone();
            Ok((Arc::new(statistor), cfg.wordlist.clone()))
        }
    }

    fn flush_skipped(&self, task: Task) {
        let data = match task.origin {
            Some(origin) => origin,
            None => {
                let mut data = StatistorData::default();
                data.base_url = task.base_url;
                data
            }
        };
        let _ = self.stat_tx.send(data);
    }

    fn print_stat(&self, statistor: &Statistor) {
        info!("{}", statistor.summary());
        if statistor.error().is_empty() {
            info!("{}", statistor.counts_summary());
            info!("{}", statistor.sources_summary());
        }
    }

    fn done_bar(&self) {
        let finished = self.finished.load(Ordering::SeqCst);
        let total = self.shared.seeded.load(Ordering::SeqCst);
        info!("total progressive: {}/{}", finished + 1, total);
    }
}
