use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{Duration, Instant};

use indicatif::ProgressBar;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, info, warn};
use url::Url;

use super::baseline::{Baseline, ExactMatch};
use super::context::EngineContext;
use super::expression::{self, Bag, ExpressionSet};
use super::statistor::Statistor;
use super::types::{
    rand_host, rand_path, safe_url_join, Pending, Reason, Shutdown, SourceType, Unit,
    BLACK_STATUS, DEFAULT_MAX_BODY_SIZE, FUZZY_STATUS, MAX_BODY_COLLECT, MAX_CRAWL, MAX_REDIRECT,
    WAF_STATUS, WHITE_STATUS,
};
use super::words::{bak_words, RuleProgram, ACTIVE_PATHS};
use crate::cores::http_en::{
    build_host_request, build_path_request, ClientMode, SprayClient, SprayClientConfig,
    SprayRequest, SprayResponse,
};
use crate::errors::RsprayError;

/// path 模式对同一主机做路径爆破, host 模式对同一地址做虚拟主机爆破
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SprayMod {
    Path,
    Host,
}

/// 单目标池配置
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub base_url: String,
    pub thread: usize,
    pub timeout: Duration,
    pub client_mode: ClientMode,
    pub mode: SprayMod,
    pub headers: Vec<(String, String)>,
    pub rate_limit: Option<u32>,
    pub check_period: i32,
    pub err_period: i32,
    pub break_threshold: i32,
    pub crawl: bool,
    pub active: bool,
    pub bak: bool,
    pub fuzzy: bool,
    pub max_recursion: usize,
    /// recursion depth of this target
    pub depth: usize,
    pub exprs: Arc<ExpressionSet>,
    pub append_rule: Option<Arc<RuleProgram>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            thread: 20,
            timeout: Duration::from_secs(5),
            client_mode: ClientMode::Auto,
            mode: SprayMod::Path,
            headers: Vec::new(),
            rate_limit: None,
            check_period: 200,
            err_period: 10,
            break_threshold: 20,
            crawl: false,
            active: false,
            bak: false,
            fuzzy: false,
            max_recursion: 0,
            depth: 0,
            exprs: Arc::new(ExpressionSet::default()),
            append_rule: None,
        }
    }
}

/// 单目标协调器: 持有 worker 池/基线表/失败控制器, 消费 word 流并产出分类结果
pub struct Pool {
    me: Weak<Pool>,
    config: PoolConfig,
    ctx: Arc<EngineContext>,
    base: RwLock<String>,
    client: SprayClient,
    pub statistor: Arc<Statistor>,
    random: OnceLock<Arc<Baseline>>,
    index: OnceLock<Arc<Baseline>>,
    baselines: Mutex<HashMap<u16, Arc<Baseline>>>,
    urls: Mutex<HashMap<String, usize>>,
    temp_tx: Mutex<Option<mpsc::Sender<Baseline>>>,
    check_tx: mpsc::Sender<()>,
    addition_tx: mpsc::UnboundedSender<Unit>,
    check_rx: Mutex<Option<mpsc::Receiver<()>>>,
    addition_rx: Mutex<Option<mpsc::UnboundedReceiver<Unit>>>,
    out_tx: mpsc::Sender<Baseline>,
    fuzzy_tx: mpsc::Sender<Baseline>,
    permits: Arc<Semaphore>,
    pending: Pending,
    cancel: Arc<Shutdown>,
    req_count: AtomicI32,
    failed_count: AtomicI32,
    is_failed: AtomicBool,
    failed_baselines: Mutex<Vec<Baseline>>,
    analyze_done: Mutex<Option<oneshot::Receiver<()>>>,
    bar: ProgressBar,
}

impl Pool {
    pub fn new(
        config: PoolConfig,
        ctx: Arc<EngineContext>,
        statistor: Arc<Statistor>,
        out_tx: mpsc::Sender<Baseline>,
        fuzzy_tx: mpsc::Sender<Baseline>,
        cancel: Arc<Shutdown>,
        bar: ProgressBar,
    ) -> Result<Arc<Self>, RsprayError> {
        if config.thread == 0 {
            return Err(RsprayError::InvalidConcurrency { value: 0 });
        }
        let client_mode = match config.client_mode {
            ClientMode::Auto => match config.mode {
                SprayMod::Path => ClientMode::Fast,
                SprayMod::Host => ClientMode::Standard,
            },
            m => m,
        };
        let client = SprayClient::new(SprayClientConfig {
            mode: client_mode,
            thread: config.thread,
            timeout: config.timeout,
            headers: config.headers.clone(),
            rate_limit: config.rate_limit,
            max_body_size: MAX_BODY_COLLECT,
        })?;

        let (temp_tx, temp_rx) = mpsc::channel(config.thread);
        let (check_tx, check_rx) = mpsc::channel(1);
        let (addition_tx, addition_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        let pool = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            base: RwLock::new(config.base_url.clone()),
            permits: Arc::new(Semaphore::new(config.thread)),
            config,
            ctx,
            client,
            statistor,
            random: OnceLock::new(),
            index: OnceLock::new(),
            baselines: Mutex::new(HashMap::new()),
            urls: Mutex::new(HashMap::new()),
            temp_tx: Mutex::new(Some(temp_tx)),
            check_tx,
            addition_tx,
            check_rx: Mutex::new(Some(check_rx)),
            addition_rx: Mutex::new(Some(addition_rx)),
            out_tx,
            fuzzy_tx,
            pending: Pending::new(),
            cancel,
            req_count: AtomicI32::new(1),
            failed_count: AtomicI32::new(1),
            is_failed: AtomicBool::new(false),
            failed_baselines: Mutex::new(Vec::new()),
            analyze_done: Mutex::new(Some(done_rx)),
            bar,
        });
        pool.spawn_classifier(temp_rx, done_tx);
        Ok(pool)
    }

    pub fn base_url(&self) -> String {
        self.base.read().unwrap().clone()
    }

    pub fn is_failed(&self) -> bool {
        self.is_failed.load(Ordering::SeqCst)
    }

    /// Sequence number of the first failure in the abort window.
    pub fn first_failed_number(&self) -> Option<i64> {
        self.failed_baselines
            .lock()
            .unwrap()
            .first()
            .map(|bl| bl.number)
    }

    fn arc(&self) -> Option<Arc<Pool>> {
        self.me.upgrade()
    }

    /// 初始化: 先后探测 index(/) 与一个随机不存在路径, 任一传输失败则 init 失败.
    /// 随机探测若发生同主机的 http -> https 跳转, base url 自动升级协议.
    pub async fn init(&self) -> Result<(), RsprayError> {
        let Some(this) = self.arc() else {
            return Ok(());
        };
        this.clone()
            .execute(Unit::new("/", SourceType::InitIndex))
            .await;
        let index = self
            .index
            .get()
            .cloned()
            .ok_or_else(|| RsprayError::InitFailed {
                url: self.base_url(),
                message: "index probe missing".to_string(),
            })?;
        if !index.err_string.is_empty() {
            return Err(RsprayError::InitFailed {
                url: self.base_url(),
                message: index.err_string.clone(),
            });
        }
        info!("[baseline.index] {}", index.brief());
        if index.status == 200 || index.status / 100 == 3 {
            let _ = self.out_tx.send((*index).clone()).await;
        }

        this.execute(Unit::new(rand_path(), SourceType::InitRandom))
            .await;
        let random = self
            .random
            .get()
            .cloned()
            .ok_or_else(|| RsprayError::InitFailed {
                url: self.base_url(),
                message: "random probe missing".to_string(),
            })?;
        if !random.err_string.is_empty() {
            return Err(RsprayError::InitFailed {
                url: self.base_url(),
                message: random.err_string.clone(),
            });
        }
        info!("[baseline.random] {}", random.brief());

        if !random.redirect_url.is_empty() {
            if let (Ok(target), Some(src)) = (Url::parse(&random.redirect_url), random.url.as_ref())
            {
                if target.host_str() == src.host_str()
                    && src.scheme() == "http"
                    && target.scheme() == "https"
                {
                    let mut base = self.base.write().unwrap();
                    info!("baseurl {} upgrade http to https", *base);
                    *base = base.replacen("http", "https", 1);
                }
            }
        }

        Ok(())
    }

    /// 主调度循环: 消费 word 流, 同时处理 check 与 addition 两条旁路管道.
    /// word 流耗尽且在途单元清零后退出.
    pub async fn run(&self, mut worder_rx: mpsc::Receiver<String>, offset: i64, limit: i64) {
        if self.config.active {
            self.spawn_active();
        }
        if self.config.bak {
            self.spawn_bak();
        }

        let mut check_rx = match self.check_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return,
        };
        let mut addition_rx = match self.addition_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return,
        };

        let mut words_done = false;
        loop {
            tokio::select! {
                w = worder_rx.recv(), if !words_done => {
                    match w {
                        Some(word) => {
                            let end = self.statistor.end.fetch_add(1, Ordering::SeqCst) + 1;
                            if end <= offset {
                                continue;
                            }
                            if limit > 0 && end > limit {
                                continue;
                            }
                            if word.is_empty() {
                                continue;
                            }
                            self.pending.add(1);
                            self.invoke(Unit::new(word, SourceType::Word).with_number(end)).await;
                        }
                        None => words_done = true,
                    }
                }
                Some(()) = check_rx.recv() => {
                    self.statistor.check_number.fetch_add(1, Ordering::SeqCst);
                    let probe = match self.config.mode {
                        SprayMod::Path => rand_path(),
                        SprayMod::Host => rand_host(),
                    };
                    self.invoke(Unit::new(probe, SourceType::Check)).await;
                }
                Some(unit) = addition_rx.recv() => {
                    self.invoke(unit).await;
                }
                _ = self.pending.wait_idle(), if words_done => break,
                _ = self.cancel.wait() => break,
            }
        }

        self.statistor.mark_end();
        self.close().await;
    }

    /// Blocks on a worker slot, then runs the unit concurrently. The slot
    /// wait gives the dispatcher the same backpressure a fixed worker pool
    /// would.
    async fn invoke(&self, unit: Unit) {
        let Some(pool) = self.arc() else {
            return;
        };
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        tokio::spawn(async move {
            pool.execute(unit).await;
            drop(permit);
        });
    }

    async fn execute(self: Arc<Self>, unit: Unit) {
        self.statistor.req_total.fetch_add(1, Ordering::SeqCst);
        let base = self.base_url();
        let req = self.gen_req(&base, &unit.path);
        let url_string = req.url.clone();
        let start = Instant::now();

        let result = tokio::select! {
            _ = self.cancel.wait() => Err(RsprayError::NetworkError("cancelled".to_string())),
            r = self.client.do_request(&req) => r,
        };

        let mut bl = match result {
            Err(e) => {
                self.failed_count.fetch_add(1, Ordering::SeqCst);
                self.statistor.failed_number.fetch_add(1, Ordering::SeqCst);
                let mut b = Baseline::failed(&url_string, e.to_string());
                b.source = unit.source;
                b.number = unit.number;
                self.failed_baselines.lock().unwrap().push(b.clone());
                b
            }
            Ok(resp) => {
                if unit.source.always_collectable() || self.config.exprs.match_expr.is_some() {
                    // init/check/crawl responses and match-expression runs
                    // always get a full baseline
                    Baseline::new(&url_string, &resp)
                } else {
                    match self.pre_compare(&resp) {
                        Ok(()) => {
                            let mut b = Baseline::new(&url_string, &resp);
                            if !b.redirect_url.is_empty() {
                                if !b.redirect_url.starts_with("http") {
                                    b.redirect_url = safe_url_join(&base, &b.redirect_url);
                                }
                                self.do_redirect(&b, unit.depth);
                            }
                            self.add_fuzzy_baseline(&mut b);
                            b
                        }
                        Err(reason) => {
                            if reason == Reason::Waf {
                                self.statistor.waf_number.fetch_add(1, Ordering::SeqCst);
                                self.failed_count.fetch_add(1, Ordering::SeqCst);
                            }
                            Baseline::invalid(&url_string, &resp, reason)
                        }
                    }
                }
            }
        };

        if bl.body_length > DEFAULT_MAX_BODY_SIZE {
            bl.exceed_length = true;
        }
        bl.source = unit.source;
        bl.req_depth = unit.depth;
        bl.recu_depth = self.config.depth;
        bl.number = unit.number;
        bl.spended = start.elapsed().as_millis() as u64;

        match unit.source {
            SourceType::InitRandom => {
                bl.collect(&self.ctx);
                self.add_fuzzy_baseline(&mut bl);
                let _ = self.random.set(Arc::new(bl));
            }
            SourceType::InitIndex => {
                bl.collect(&self.ctx);
                self.spawn_crawl(&mut bl);
                let _ = self.index.set(Arc::new(bl));
            }
            SourceType::Check => self.handle_check(bl),
            SourceType::Word => {
                self.send_temp(bl).await;
                let req_count = self.req_count.fetch_add(1, Ordering::SeqCst) + 1;
                if req_count % self.config.check_period == 0 {
                    self.req_count.fetch_add(1, Ordering::SeqCst);
                    self.do_check().await;
                } else if self.failed_count.load(Ordering::SeqCst) % self.config.err_period == 0 {
                    self.failed_count.fetch_add(1, Ordering::SeqCst);
                    self.do_check().await;
                }
                self.bar.inc(1);
            }
            SourceType::Redirect => {
                bl.front_url = unit.front_url;
                self.send_temp(bl).await;
            }
            SourceType::Crawl | SourceType::Rule | SourceType::Active | SourceType::Bak => {
                self.send_temp(bl).await;
            }
        }
    }

    fn gen_req(&self, base: &str, path: &str) -> SprayRequest {
        match self.config.mode {
            SprayMod::Path => build_path_request(base, path),
            SprayMod::Host => build_host_request(base, path),
        }
    }

    async fn send_temp(&self, bl: Baseline) {
        let tx = self.temp_tx.lock().unwrap().clone();
        match tx {
            Some(tx) => {
                if tx.send(bl).await.is_err() {
                    self.pending.done();
                }
            }
            None => self.pending.done(),
        }
    }

    /// 热路径上的廉价预过滤, 规则顺序即优先级
    fn pre_compare(&self, resp: &SprayResponse) -> Result<(), Reason> {
        let status = resp.status;
        if WHITE_STATUS.contains(&status) {
            return Ok(());
        }
        if let Some(random) = self.random.get() {
            if random.status != 200 && random.status == status {
                return Err(Reason::SameStatus);
            }
        }
        if BLACK_STATUS.contains(&status) {
            return Err(Reason::BadStatus);
        }
        if WAF_STATUS.contains(&status) {
            return Err(Reason::Waf);
        }
        if let (Some(location), Some(random)) = (resp.get_header("location"), self.random.get()) {
            if !random.redirect_url.is_empty() && location == random.redirect_url {
                return Err(Reason::Redirect);
            }
        }
        Ok(())
    }

    /// Full validity judgment when no match expression is configured.
    async fn base_compare(&self, bl: &mut Baseline) -> bool {
        if !bl.is_valid {
            return false;
        }
        let learned = {
            let baselines = self.baselines.lock().unwrap();
            baselines.get(&bl.status).cloned()
        }
        .or_else(|| {
            self.random
                .get()
                .filter(|r| r.status == bl.status)
                .cloned()
        })
        .or_else(|| self.index.get().filter(|i| i.status == bl.status).cloned());

        bl.collect(&self.ctx);

        if let Some(learned) = learned {
            if learned.compare(bl) == ExactMatch::Equal {
                if learned.fuzzy_compare(bl) {
                    self.statistor.fuzzy_number.fetch_add(1, Ordering::SeqCst);
                    bl.reason = Reason::FuzzyCompareFailed.as_str().to_string();
                    self.put_to_fuzzy(bl).await;
                } else {
                    bl.reason = Reason::CompareFailed.as_str().to_string();
                }
                return false;
            }
        }
        true
    }

    async fn put_to_fuzzy(&self, bl: &mut Baseline) {
        bl.is_fuzzy = true;
        let _ = self.fuzzy_tx.send(bl.clone()).await;
    }

    fn handle_check(&self, mut bl: Baseline) {
        if !bl.err_string.is_empty() {
            warn!(
                "[check.error] {} maybe ip had banned, break ({}/{}), error: {}",
                self.base_url(),
                self.failed_count.load(Ordering::SeqCst),
                self.config.break_threshold,
                bl.err_string
            );
            return;
        }
        let Some(random) = self.random.get() else {
            return;
        };
        bl.collect(&self.ctx);
        match random.compare(&bl) {
            ExactMatch::Equal => {
                debug!("[check.pass] {}", bl.describe());
                self.reset_failed();
            }
            _ => {
                self.failed_count.fetch_add(2, Ordering::SeqCst);
                warn!("[check.failed] maybe trigger risk control, {}", bl.describe());
                self.failed_baselines.lock().unwrap().push(bl);
            }
        }
    }

    /// Aborts the target above the failure threshold, otherwise schedules a
    /// liveness probe on the dedicated check channel (never the addition
    /// channel, to stay clear of crawl/redirect head-of-line blocking).
    async fn do_check(&self) {
        if self.failed_count.load(Ordering::SeqCst) > self.config.break_threshold {
            self.recover();
            self.is_failed.store(true, Ordering::SeqCst);
            self.cancel.cancel();
            return;
        }
        let _ = self.check_tx.try_send(());
    }

    fn reset_failed(&self) {
        self.failed_count.store(1, Ordering::SeqCst);
        self.failed_baselines.lock().unwrap().clear();
    }

    fn recover(&self) {
        error!(
            "{} failed request exceeds the threshold, task will exit. Breakpoint {}",
            self.base_url(),
            self.req_count.load(Ordering::SeqCst)
        );
        for (i, bl) in self.failed_baselines.lock().unwrap().iter().enumerate() {
            error!("[failed.{}] {}", i, bl.describe());
        }
    }

    /// 首次出现 fuzzy 状态码的响应会成为该状态码的基线, 只写一次
    fn add_fuzzy_baseline(&self, bl: &mut Baseline) {
        if !FUZZY_STATUS.contains(&bl.status) {
            return;
        }
        if self.baselines.lock().unwrap().contains_key(&bl.status) {
            return;
        }
        bl.collect(&self.ctx);
        self.spawn_crawl(bl);
        let mut baselines = self.baselines.lock().unwrap();
        if let Entry::Vacant(entry) = baselines.entry(bl.status) {
            info!("[baseline.{}] {}", bl.status, bl.brief());
            entry.insert(Arc::new(bl.clone()));
        }
    }

    fn spawn_classifier(&self, mut temp_rx: mpsc::Receiver<Baseline>, done_tx: oneshot::Sender<()>) {
        let Some(pool) = self.arc() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(mut bl) = temp_rx.recv().await {
                pool.statistor.incr_count(bl.status);
                pool.statistor.incr_source(bl.source);

                let exprs = &pool.config.exprs;
                let bag = if exprs.any() {
                    Some(pool.build_bag(&bl))
                } else {
                    None
                };

                let ok = if let Some(m) = &exprs.match_expr {
                    bag.as_ref().map(|b| expression::eval(m, b)).unwrap_or(false)
                } else {
                    pool.base_compare(&mut bl).await
                };

                if ok {
                    pool.statistor.found_number.fetch_add(1, Ordering::SeqCst);
                    if let (Some(f), Some(b)) = (&exprs.filter_expr, bag.as_ref()) {
                        if expression::eval(f, b) {
                            pool.statistor.filtered_number.fetch_add(1, Ordering::SeqCst);
                            bl.reason = Reason::CustomFilter.as_str().to_string();
                            bl.is_valid = false;
                        }
                    }
                } else {
                    bl.is_valid = false;
                }

                if bl.is_valid {
                    pool.spawn_crawl(&mut bl);
                    pool.spawn_rule(&bl);
                    if bl.recu_depth < pool.config.max_recursion {
                        if let (Some(r), Some(b)) = (&exprs.recu_expr, bag.as_ref()) {
                            if expression::eval(r, b) {
                                bl.recu = true;
                            }
                        }
                    }
                }

                let _ = pool.out_tx.send(bl).await;
                pool.pending.done();
            }
            let _ = done_tx.send(());
        });
    }

    fn build_bag(&self, bl: &Baseline) -> Bag {
        let empty = Baseline::default();
        let mut bag = Bag::default();
        bag.set(
            "index",
            self.index.get().map(|b| b.as_ref()).unwrap_or(&empty),
        );
        bag.set(
            "random",
            self.random.get().map(|b| b.as_ref()).unwrap_or(&empty),
        );
        bag.set("current", bl);
        let baselines = self.baselines.lock().unwrap();
        for status in FUZZY_STATUS {
            let name = format!("bl{}", status);
            match baselines.get(status) {
                Some(b) => bag.set(&name, b),
                None => bag.set(&name, &empty),
            }
        }
        bag
    }

    fn spawn_crawl(&self, bl: &mut Baseline) {
        if !self.config.crawl {
            return;
        }
        bl.collect_urls();
        if bl.urls.is_empty() {
            return;
        }
        let Some(pool) = self.arc() else {
            return;
        };
        let urls = bl.urls.clone();
        let src_host = bl
            .url
            .as_ref()
            .and_then(|u| u.host_str())
            .map(str::to_string);
        let depth = bl.req_depth;
        self.pending.add(1);
        tokio::spawn(async move {
            pool.do_crawl(urls, src_host, depth);
            pool.pending.done();
        });
    }

    fn do_crawl(&self, urls: Vec<String>, src_host: Option<String>, depth: usize) {
        let base = self.base_url();
        let scheme = Url::parse(&base)
            .map(|u| u.scheme().to_string())
            .unwrap_or_else(|_| "http".to_string());
        for u in urls {
            let abs = if let Some(rest) = u.strip_prefix("//") {
                format!("{}://{}", scheme, rest)
            } else if u.starts_with('/') || !u.starts_with("http") {
                safe_url_join(&base, &u)
            } else {
                u
            };

            {
                let mut seen = self.urls.lock().unwrap();
                match seen.entry(abs.clone()) {
                    Entry::Occupied(mut e) => {
                        *e.get_mut() += 1;
                        continue;
                    }
                    Entry::Vacant(e) => {
                        e.insert(1);
                    }
                }
            }

            if depth >= MAX_CRAWL {
                continue;
            }
            let Ok(parsed) = Url::parse(&abs) else {
                continue;
            };
            // scope guard: never leave the original host
            match (&src_host, parsed.host_str()) {
                (Some(src), Some(host)) if src == host => {}
                _ => continue,
            }
            self.pending.add(1);
            let _ = self.addition_tx.send(
                Unit::new(parsed.path().to_string(), SourceType::Crawl).with_depth(depth + 1),
            );
        }
    }

    fn spawn_rule(&self, bl: &Baseline) {
        let Some(rules) = self.config.append_rule.clone() else {
            return;
        };
        if bl.source == SourceType::Rule || bl.dir {
            return;
        }
        let Some(pool) = self.arc() else {
            return;
        };
        let path = bl.path.clone();
        self.pending.add(1);
        tokio::spawn(async move {
            let (dir, base_name) = split_path(&path);
            for word in rules.run(&base_name) {
                pool.pending.add(1);
                let _ = pool
                    .addition_tx
                    .send(Unit::new(format!("{}{}", dir, word), SourceType::Rule));
            }
            pool.pending.done();
        });
    }

    fn do_redirect(&self, bl: &Baseline, depth: usize) {
        if depth >= MAX_REDIRECT {
            return;
        }
        let Ok(target) = Url::parse(&bl.redirect_url) else {
            return;
        };
        let Some(index) = self.index.get() else {
            return;
        };
        let index_host = index.url.as_ref().and_then(|u| u.host_str());
        match (target.host_str(), index_host) {
            (Some(t), Some(i)) if t == i => {}
            _ => return,
        }
        self.pending.add(1);
        let _ = self.addition_tx.send(
            Unit::new(target.path().to_string(), SourceType::Redirect)
                .with_depth(depth + 1)
                .with_front_url(bl.url_string.clone()),
        );
    }

    fn spawn_active(&self) {
        let Some(pool) = self.arc() else {
            return;
        };
        self.pending.add(1);
        tokio::spawn(async move {
            for p in ACTIVE_PATHS {
                pool.pending.add(1);
                let _ = pool.addition_tx.send(Unit::new(*p, SourceType::Active));
            }
            pool.pending.done();
        });
    }

    fn spawn_bak(&self) {
        let Some(host) = Url::parse(&self.base_url())
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
        else {
            return;
        };
        let Some(pool) = self.arc() else {
            return;
        };
        self.pending.add(1);
        tokio::spawn(async move {
            for word in bak_words(&host) {
                pool.pending.add(1);
                let _ = pool
                    .addition_tx
                    .send(Unit::new(format!("/{}", word), SourceType::Bak));
            }
            pool.pending.done();
        });
    }

    /// Drops the classifier feed and waits for its completion signal; every
    /// in-flight worker keeps its own sender clone so nothing is lost.
    async fn close(&self) {
        self.temp_tx.lock().unwrap().take();
        let done = self.analyze_done.lock().unwrap().take();
        if let Some(done) = done {
            let _ = done.await;
        }
        self.bar.finish_and_clear();
    }
}

fn split_path(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(i) => (path[..=i].to_string(), path[i + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cores::spray_en::words::Worder;
    use std::sync::Mutex as StdMutex;
    use warp::http::Response;
    use warp::path::FullPath;
    use warp::Filter;

    type Paths = Arc<StdMutex<Vec<String>>>;

    fn recorded() -> (Paths, impl Fn() -> Vec<String>) {
        let paths: Paths = Arc::new(StdMutex::new(Vec::new()));
        let p = paths.clone();
        (paths, move || p.lock().unwrap().clone())
    }

    async fn serve<F>(handler: F) -> String
    where
        F: Fn(String) -> Response<String> + Clone + Send + Sync + 'static,
    {
        let route = warp::path::full().map(move |p: FullPath| handler(p.as_str().to_string()));
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        format!("http://{}", addr)
    }

    fn html(status: u16, body: &str) -> Response<String> {
        Response::builder()
            .status(status)
            .body(body.to_string())
            .unwrap()
    }

    #[allow(clippy::type_complexity)]
    fn make_pool(
        cfg: PoolConfig,
    ) -> (
        Arc<Pool>,
        mpsc::Receiver<Baseline>,
        mpsc::Receiver<Baseline>,
    ) {
        let ctx = Arc::new(EngineContext::new());
        let stat = Arc::new(Statistor::new(cfg.base_url.clone()));
        let (out_tx, out_rx) = mpsc::channel(1024);
        let (fuzzy_tx, fuzzy_rx) = mpsc::channel(1024);
        let cancel = Arc::new(Shutdown::new());
        let pool = Pool::new(cfg, ctx, stat, out_tx, fuzzy_tx, cancel, ProgressBar::hidden())
            .unwrap();
        (pool, out_rx, fuzzy_rx)
    }

    fn word_stream(words: &[&str]) -> mpsc::Receiver<String> {
        Worder::spawn(
            Arc::new(words.iter().map(|s| s.to_string()).collect()),
            vec![],
            None,
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Baseline>) -> Vec<Baseline> {
        let mut out = Vec::new();
        while let Ok(bl) = rx.try_recv() {
            out.push(bl);
        }
        out
    }

    #[tokio::test]
    async fn init_learns_index_and_random() {
        let base = serve(|p| {
            if p == "/" {
                html(200, "<html>the index page</html>")
            } else {
                html(404, "not found around here")
            }
        })
        .await;

        let cfg = PoolConfig {
            base_url: base,
            ..PoolConfig::default()
        };
        let (pool, mut out_rx, _fuzzy) = make_pool(cfg);
        pool.init().await.unwrap();

        let index = pool.index.get().unwrap();
        let random = pool.random.get().unwrap();
        assert_eq!(index.status, 200);
        assert_eq!(random.status, 404);
        assert!(!index.md5.is_empty());
        // index with status 200 is emitted on the output stream
        let emitted = out_rx.recv().await.unwrap();
        assert_eq!(emitted.status, 200);
        // 404 registered as the fuzzy baseline for its status
        assert!(pool.baselines.lock().unwrap().contains_key(&404));
    }

    #[tokio::test]
    async fn normal_404_site_yields_single_hit() {
        let base = serve(|p| match p.as_str() {
            "/" => html(200, "<html>homepage of the site</html>"),
            "/admin" => html(200, "Welcome admin, your panel awaits"),
            _ => html(404, "Not Found"),
        })
        .await;

        let cfg = PoolConfig {
            base_url: base,
            thread: 2,
            ..PoolConfig::default()
        };
        let (pool, mut out_rx, mut fuzzy_rx) = make_pool(cfg);
        pool.init().await.unwrap();
        let _ = out_rx.recv().await; // index emission

        pool.run(word_stream(&["admin", "xyzzy"]), 0, 0).await;

        let outs = drain(&mut out_rx);
        let hits: Vec<_> = outs.iter().filter(|b| b.is_valid).collect();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].url_string.ends_with("/admin"));
        assert_eq!(hits[0].status, 200);

        let rejected = outs.iter().find(|b| b.url_string.ends_with("/xyzzy")).unwrap();
        assert!(!rejected.is_valid);
        assert_eq!(rejected.reason, Reason::SameStatus.as_str());
        assert!(drain(&mut fuzzy_rx).is_empty());
    }

    #[tokio::test]
    async fn wildcard_site_routes_words_to_fuzzy_stream() {
        let base = serve(|_| html(200, "<html>identical wildcard page for all</html>")).await;

        let cfg = PoolConfig {
            base_url: base,
            thread: 2,
            fuzzy: true,
            ..PoolConfig::default()
        };
        let (pool, mut out_rx, mut fuzzy_rx) = make_pool(cfg);
        pool.init().await.unwrap();
        let _ = out_rx.recv().await;

        pool.run(word_stream(&["admin", "backup"]), 0, 0).await;

        let outs = drain(&mut out_rx);
        let word_outs: Vec<_> = outs
            .iter()
            .filter(|b| b.source == SourceType::Word)
            .collect();
        assert_eq!(word_outs.len(), 2);
        assert!(word_outs.iter().all(|b| !b.is_valid));
        assert!(word_outs
            .iter()
            .all(|b| b.reason == Reason::FuzzyCompareFailed.as_str()));

        let fuzzies = drain(&mut fuzzy_rx);
        assert_eq!(fuzzies.len(), 2);
        assert!(fuzzies.iter().all(|b| b.is_fuzzy));
    }

    #[tokio::test]
    async fn redirect_upgrade_rewrites_base_url() {
        let (paths, _snap) = recorded();
        let base = Arc::new(StdMutex::new(String::new()));
        let base2 = base.clone();
        let route = warp::path::full().map(move |p: FullPath| {
            paths.lock().unwrap().push(p.as_str().to_string());
            if p.as_str() == "/" {
                Response::builder().status(200).body("index".to_string()).unwrap()
            } else {
                let target = format!("https://{}/", base2.lock().unwrap());
                Response::builder()
                    .status(302)
                    .header("location", target)
                    .body(String::new())
                    .unwrap()
            }
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        *base.lock().unwrap() = addr.to_string();

        let cfg = PoolConfig {
            base_url: format!("http://{}", addr),
            ..PoolConfig::default()
        };
        let (pool, mut out_rx, _fuzzy) = make_pool(cfg);
        pool.init().await.unwrap();
        let _ = out_rx.recv().await;
        assert!(pool.base_url().starts_with("https://"), "{}", pool.base_url());
    }

    #[tokio::test]
    async fn crawler_respects_scope_and_dedup() {
        let (paths, snap) = recorded();
        let route = warp::path::full().map(move |p: FullPath| {
            paths.lock().unwrap().push(p.as_str().to_string());
            match p.as_str() {
                "/" => Response::builder()
                    .status(200)
                    .body(
                        r#"<a href="/local">in</a><a href="/local">again</a>
                           <a href="http://other.example/foo">out</a>"#
                            .to_string(),
                    )
                    .unwrap(),
                _ => Response::builder().status(404).body("nope".to_string()).unwrap(),
            }
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let cfg = PoolConfig {
            base_url: format!("http://{}", addr),
            crawl: true,
            thread: 2,
            ..PoolConfig::default()
        };
        let (pool, mut out_rx, _fuzzy) = make_pool(cfg);
        pool.init().await.unwrap();
        let _ = out_rx.recv().await;
        pool.run(word_stream(&[]), 0, 0).await;

        let outs = drain(&mut out_rx);
        assert!(
            outs.iter().all(|b| !b.url_string.contains("other.example")),
            "out-of-scope host must never be probed"
        );
        let seen = snap();
        assert!(seen.iter().any(|p| p == "/local"), "seen: {:?}", seen);
        assert_eq!(seen.iter().filter(|p| *p == "/local").count(), 1);
    }

    #[tokio::test]
    async fn rule_expansion_runs_exactly_once() {
        let (paths, snap) = recorded();
        let route = warp::path::full().map(move |p: FullPath| {
            paths.lock().unwrap().push(p.as_str().to_string());
            match p.as_str() {
                "/" => Response::builder().status(200).body("index here".to_string()).unwrap(),
                "/config" => Response::builder()
                    .status(200)
                    .body("secret configuration page".to_string())
                    .unwrap(),
                "/config.bak" => Response::builder()
                    .status(200)
                    .body("old backup copy of it".to_string())
                    .unwrap(),
                _ => Response::builder().status(404).body("no such page".to_string()).unwrap(),
            }
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let cfg = PoolConfig {
            base_url: format!("http://{}", addr),
            thread: 2,
            append_rule: Some(Arc::new(RuleProgram::parse("/$/.bak/").unwrap())),
            ..PoolConfig::default()
        };
        let (pool, mut out_rx, _fuzzy) = make_pool(cfg);
        pool.init().await.unwrap();
        let _ = out_rx.recv().await;
        pool.run(word_stream(&["config"]), 0, 0).await;

        let outs = drain(&mut out_rx);
        let bak = outs
            .iter()
            .find(|b| b.url_string.ends_with("/config.bak"))
            .expect("rule unit must be probed");
        assert_eq!(bak.source, SourceType::Rule);
        assert!(bak.is_valid);

        let seen = snap();
        assert_eq!(seen.iter().filter(|p| *p == "/config.bak").count(), 1);
        assert!(
            !seen.iter().any(|p| p.as_str() == "/config.bak.bak"),
            "rule hits must not re-expand"
        );
    }

    #[tokio::test]
    async fn redirect_follow_stops_at_max_depth() {
        let (paths, snap) = recorded();
        let route = warp::path::full().map(move |p: FullPath| {
            paths.lock().unwrap().push(p.as_str().to_string());
            match p.as_str() {
                "/" => Response::builder().status(200).body("index".to_string()).unwrap(),
                p if p.starts_with("/r") => {
                    let n: usize = p[2..].parse().unwrap_or(0);
                    Response::builder()
                        .status(302)
                        .header("location", format!("/r{}", n + 1))
                        .body(String::new())
                        .unwrap()
                }
                _ => Response::builder().status(404).body("gone".to_string()).unwrap(),
            }
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let cfg = PoolConfig {
            base_url: format!("http://{}", addr),
            thread: 2,
            ..PoolConfig::default()
        };
        let (pool, mut out_rx, _fuzzy) = make_pool(cfg);
        pool.init().await.unwrap();
        let _ = out_rx.recv().await;
        pool.run(word_stream(&["r1"]), 0, 0).await;

        let outs = drain(&mut out_rx);
        assert!(outs.iter().all(|b| b.req_depth <= MAX_REDIRECT));
        let seen = snap();
        assert!(seen.iter().any(|p| p == "/r4"));
        assert!(!seen.iter().any(|p| p == "/r5"), "seen: {:?}", seen);
    }

    #[tokio::test]
    async fn failure_threshold_cancels_target() {
        // bind then drop a listener so the port refuses connections
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cfg = PoolConfig {
            base_url: format!("http://{}", addr),
            thread: 1,
            timeout: Duration::from_millis(300),
            err_period: 2,
            break_threshold: 4,
            ..PoolConfig::default()
        };
        let (pool, mut out_rx, _fuzzy) = make_pool(cfg);
        // init fails against a dead port; force semantics keep going
        assert!(pool.init().await.is_err());

        let words: Vec<&str> = vec!["a", "b", "c", "d", "e", "f", "g", "h"];
        tokio::time::timeout(
            Duration::from_secs(20),
            pool.run(word_stream(&words), 0, 0),
        )
        .await
        .expect("run must terminate via the failure controller");

        assert!(pool.is_failed());
        // the failed list survives so the end cursor can rewind to its head
        let first = pool.first_failed_number().expect("failures recorded");
        pool.statistor.rewind_end(first);
        assert_eq!(pool.statistor.snapshot().end, first);

        let outs = drain(&mut out_rx);
        assert!(outs.iter().all(|b| !b.is_valid));
        assert!(outs
            .iter()
            .all(|b| b.reason == Reason::RequestFailed.as_str()));
    }

    #[tokio::test]
    async fn waf_lockout_aborts_the_target() {
        // the site turns hostile after the two init probes: every later
        // response, liveness checks included, is a 418
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let base = serve(move |p| {
            let n = hits.fetch_add(1, Ordering::SeqCst);
            if n == 0 && p == "/" {
                html(200, "friendly index page")
            } else if n == 1 {
                html(404, "not found")
            } else {
                html(418, "blocked by the teapot wall")
            }
        })
        .await;

        let cfg = PoolConfig {
            base_url: base,
            thread: 1,
            err_period: 2,
            break_threshold: 4,
            ..PoolConfig::default()
        };
        let (pool, mut out_rx, _fuzzy) = make_pool(cfg);
        pool.init().await.unwrap();
        let _ = out_rx.recv().await;

        let words: Vec<String> = (0..12).map(|i| format!("word{}", i)).collect();
        let word_refs: Vec<&str> = words.iter().map(|s| s.as_str()).collect();
        tokio::time::timeout(
            Duration::from_secs(20),
            pool.run(word_stream(&word_refs), 0, 0),
        )
        .await
        .expect("run must terminate via the failure controller");

        assert!(pool.is_failed());
        assert!(pool.statistor.snapshot().waf_number >= 1);
        let outs = drain(&mut out_rx);
        let word_outs: Vec<_> = outs
            .iter()
            .filter(|b| b.source == SourceType::Word)
            .collect();
        assert!(word_outs.iter().all(|b| !b.is_valid));
        // units cancelled mid-flight surface as request failures instead
        assert!(word_outs.iter().any(|b| b.reason == Reason::Waf.as_str()));
        assert!(word_outs.iter().all(|b| {
            b.reason == Reason::Waf.as_str() || b.reason == Reason::RequestFailed.as_str()
        }));
    }

    #[tokio::test]
    async fn precompare_order_white_before_black_and_same_before_waf() {
        let base = serve(|p| {
            if p == "/" {
                html(200, "index")
            } else {
                html(418, "teapot wall")
            }
        })
        .await;

        let cfg = PoolConfig {
            base_url: base,
            ..PoolConfig::default()
        };
        let (pool, mut out_rx, _fuzzy) = make_pool(cfg);
        pool.init().await.unwrap();
        let _ = out_rx.recv().await;

        // random learned 418: the same-status rule must fire before the waf rule
        let resp = SprayResponse {
            status: 418,
            headers: vec![],
            body: bytes::Bytes::new(),
            content_length: 0,
        };
        assert_eq!(pool.pre_compare(&resp), Err(Reason::SameStatus));

        // white status always wins
        let resp = SprayResponse {
            status: 200,
            headers: vec![],
            body: bytes::Bytes::new(),
            content_length: 0,
        };
        assert_eq!(pool.pre_compare(&resp), Ok(()));
    }

    #[tokio::test]
    async fn match_expression_overrides_base_compare() {
        let base = serve(|p| {
            if p == "/" {
                html(200, "index")
            } else if p == "/teapot" {
                html(418, "short and stout")
            } else {
                html(404, "not found")
            }
        })
        .await;

        let cfg = PoolConfig {
            base_url: base,
            thread: 2,
            exprs: Arc::new(
                ExpressionSet::new(Some("current.status == 418".to_string()), None, None).unwrap(),
            ),
            ..PoolConfig::default()
        };
        let (pool, mut out_rx, _fuzzy) = make_pool(cfg);
        pool.init().await.unwrap();
        let _ = out_rx.recv().await;
        pool.run(word_stream(&["teapot", "nothing"]), 0, 0).await;

        // with a match expression, even WAF statuses reach the classifier
        let outs = drain(&mut out_rx);
        let hit = outs.iter().find(|b| b.is_valid).expect("teapot matched");
        assert_eq!(hit.status, 418);
        assert!(outs
            .iter()
            .any(|b| b.url_string.ends_with("/nothing") && !b.is_valid));
    }

    #[test]
    fn split_path_separates_dir_and_basename() {
        assert_eq!(split_path("/a/b/config"), ("/a/b/".to_string(), "config".to_string()));
        assert_eq!(split_path("/config"), ("/".to_string(), "config".to_string()));
        assert_eq!(split_path("config"), ("/".to_string(), "config".to_string()));
    }
}
