use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::cores::http_en::ClientMode;
use crate::cores::spray_en::{
    EngineContext, ExpressionSet, RunOutcome, RunnerConfig, SprayMod, Task, WordFn,
};
use crate::errors::RsprayError;
use crate::modules::web_spray::{resume, OutputFormat, SprayJob};

// logging
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rspray", about = "concurrent HTTP content discovery", version)]
pub struct Cli {
    /// global log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// target base URL (can be provided multiple times)
    #[arg(short = 'u', long = "url")]
    pub urls: Vec<String>,

    /// file with one target per line
    #[arg(short = 'l', long)]
    pub url_file: Option<PathBuf>,

    /// wordlist file (can be provided multiple times)
    #[arg(short = 'd', long = "dict")]
    pub dicts: Vec<PathBuf>,

    /// mutation rule file applied to the whole wordlist
    #[arg(short = 'r', long = "rule")]
    pub rules: Vec<PathBuf>,

    /// rule file applied to discovered hits
    #[arg(long)]
    pub append_rule: Option<PathBuf>,

    /// match expression replacing the built-in comparator
    #[arg(long = "match")]
    pub match_expr: Option<String>,

    /// filter expression demoting matched hits
    #[arg(long = "filter")]
    pub filter_expr: Option<String>,

    /// recursion predicate over accepted hits
    #[arg(long = "recursive")]
    pub recursive_expr: Option<String>,

    /// header override, "Key: Value" (can be provided multiple times)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// worker count per target
    #[arg(short = 't', long, default_value_t = 20)]
    pub thread: usize,

    /// concurrent target pools
    #[arg(short = 'p', long, default_value_t = 5)]
    pub pool: usize,

    /// request timeout in seconds
    #[arg(long, default_value_t = 5)]
    pub timeout: u64,

    /// global requests-per-second limit
    #[arg(long)]
    pub rate_limit: Option<u32>,

    /// max recursion depth for directory hits
    #[arg(long, default_value_t = 0)]
    pub depth: usize,

    /// schedule a liveness check every N requests
    #[arg(long, default_value_t = 200)]
    pub check_period: i32,

    /// schedule a liveness check every N failures
    #[arg(long, default_value_t = 10)]
    pub error_period: i32,

    /// abort the target above this many accumulated failures
    #[arg(long, default_value_t = 20)]
    pub break_threshold: i32,

    /// spray mode: path or host
    #[arg(long = "mod", default_value = "path")]
    pub mode: String,

    /// transport flavour: auto, fast or standard
    #[arg(long, default_value = "auto")]
    pub client: String,

    /// crawl accepted responses for new paths
    #[arg(long)]
    pub crawl: bool,

    /// probe the static well-known path list
    #[arg(long)]
    pub active: bool,

    /// probe host-derived backup file names
    #[arg(long)]
    pub bak: bool,

    /// emit fuzzy template matches on the fuzzy stream
    #[arg(long)]
    pub fuzzy: bool,

    /// keep going when the init probes fail
    #[arg(long)]
    pub force: bool,

    /// skip words up to this cursor
    #[arg(long, default_value_t = 0)]
    pub offset: i64,

    /// stop at this word cursor (0 = no limit)
    #[arg(long, default_value_t = 0)]
    pub limit: i64,

    /// resume from a stat file of a previous run
    #[arg(long)]
    pub resume: Option<PathBuf>,

    /// abort the whole run after N seconds
    #[arg(long)]
    pub deadline: Option<u64>,

    /// write hits to this file instead of stdout
    #[arg(short = 'f', long = "file")]
    pub output_file: Option<PathBuf>,

    /// write fuzzy matches to this file
    #[arg(long)]
    pub fuzzy_file: Option<PathBuf>,

    /// write every classified record to this file
    #[arg(long)]
    pub dump_file: Option<PathBuf>,

    /// write per-target stat records to this file (enables resume)
    #[arg(long)]
    pub stat_file: Option<PathBuf>,

    /// output format: raw, json or csv
    #[arg(long, default_value = "raw")]
    pub format: String,

    /// lowercase every word
    #[arg(long)]
    pub lowercase: bool,

    /// uppercase every word
    #[arg(long)]
    pub uppercase: bool,

    /// prepend to every word
    #[arg(long)]
    pub prefix: Option<String>,

    /// append to every word
    #[arg(long)]
    pub suffix: Option<String>,
}

fn parse_output(fmt: &str) -> OutputFormat {
    match fmt.to_lowercase().as_str() {
        "json" => OutputFormat::Json,
        "csv" => OutputFormat::Csv,
        _ => OutputFormat::Raw,
    }
}

fn parse_mode(s: &str) -> Result<SprayMod, RsprayError> {
    match s.to_lowercase().as_str() {
        "path" => Ok(SprayMod::Path),
        "host" => Ok(SprayMod::Host),
        other => Err(RsprayError::ParseError(format!("unknown mod '{}'", other))),
    }
}

fn parse_client(s: &str) -> Result<ClientMode, RsprayError> {
    match s.to_lowercase().as_str() {
        "auto" => Ok(ClientMode::Auto),
        "fast" => Ok(ClientMode::Fast),
        "standard" => Ok(ClientMode::Standard),
        other => Err(RsprayError::ParseError(format!(
            "unknown client '{}'",
            other
        ))),
    }
}

fn parse_headers(raw: &[String]) -> Result<Vec<(String, String)>, RsprayError> {
    let mut out = Vec::new();
    for h in raw {
        let (k, v) = h
            .split_once(':')
            .ok_or_else(|| RsprayError::ParseError(format!("invalid header '{}'", h)))?;
        out.push((k.trim().to_string(), v.trim().to_string()));
    }
    Ok(out)
}

fn normalize_target(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    }
}

fn word_fns(cli: &Cli) -> Vec<WordFn> {
    let mut fns = Vec::new();
    if cli.lowercase {
        fns.push(WordFn::Lowercase);
    }
    if cli.uppercase {
        fns.push(WordFn::Uppercase);
    }
    if let Some(p) = &cli.prefix {
        fns.push(WordFn::Prefix(p.clone()));
    }
    if let Some(s) = &cli.suffix {
        fns.push(WordFn::Suffix(s.clone()));
    }
    fns
}

pub async fn run_from_args<I, T>(args: I) -> Result<RunOutcome, RsprayError>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    // initialize tracing according to log_level (ok if already initialized in tests)
    let env_filter = EnvFilter::new(cli.log_level.clone());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
    info!("Starting rspray, log_level={}", cli.log_level);

    let ctx = Arc::new(EngineContext::new());

    // targets: resume records first, then command line urls
    let mut tasks: Vec<Task> = Vec::new();
    if let Some(resume_file) = &cli.resume {
        tasks.extend(resume::load_stat_file(resume_file)?);
    }
    let mut urls = cli.urls.clone();
    if let Some(file) = &cli.url_file {
        let content = std::fs::read_to_string(file)?;
        urls.extend(content.lines().map(str::to_string));
    }
    tasks.extend(
        urls.iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
            .map(|u| Task::new(normalize_target(u))),
    );
    if tasks.is_empty() {
        return Err(RsprayError::MissingArgument {
            arg: "url or resume".to_string(),
        });
    }

    let mut wordlist = Vec::new();
    for dict in &cli.dicts {
        wordlist.extend(ctx.load_dict(dict)?.iter().cloned());
    }
    if wordlist.is_empty() && cli.resume.is_none() {
        return Err(RsprayError::MissingArgument {
            arg: "dict".to_string(),
        });
    }

    let mut word_rules = None;
    if !cli.rules.is_empty() {
        let mut merged = crate::cores::spray_en::RuleProgram::default();
        for path in &cli.rules {
            merged
                .expressions
                .extend(ctx.load_rules(path)?.expressions.iter().cloned());
        }
        word_rules = Some(Arc::new(merged));
    }
    let append_rule = match &cli.append_rule {
        Some(path) => Some(ctx.load_rules(path)?),
        None => None,
    };

    let exprs = Arc::new(ExpressionSet::new(
        cli.match_expr.clone(),
        cli.filter_expr.clone(),
        cli.recursive_expr.clone(),
    )?);

    let config = RunnerConfig {
        wordlist: Arc::new(wordlist),
        dict_files: cli
            .dicts
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
        rule_files: cli
            .rules
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
        word_rules,
        append_rule,
        append_rule_file: cli
            .append_rule
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned()),
        fns: word_fns(&cli),
        exprs,
        headers: parse_headers(&cli.headers)?,
        thread: cli.thread,
        pool_size: cli.pool,
        timeout: Duration::from_secs(cli.timeout),
        client_mode: parse_client(&cli.client)?,
        mode: parse_mode(&cli.mode)?,
        rate_limit: cli.rate_limit,
        check_period: cli.check_period.max(1),
        err_period: cli.error_period.max(1),
        break_threshold: cli.break_threshold,
        crawl: cli.crawl,
        active: cli.active,
        bak: cli.bak,
        fuzzy: cli.fuzzy,
        force: cli.force,
        max_recursion: cli.depth,
        offset: cli.offset,
        limit: cli.limit,
        deadline: cli.deadline.map(Duration::from_secs),
    };

    let job = SprayJob {
        tasks,
        config,
        format: parse_output(&cli.format),
        output_file: cli.output_file.clone(),
        fuzzy_file: cli.fuzzy_file.clone(),
        dump_file: cli.dump_file.clone(),
        stat_file: cli.stat_file.clone(),
    };
    job.run(ctx).await
}

/// Run using environment args
pub async fn run() -> Result<RunOutcome, RsprayError> {
    run_from_args(std::env::args()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use warp::Filter;

    #[test]
    fn header_parsing_splits_on_first_colon() {
        let parsed = parse_headers(&["X-Token: abc:def".to_string()]).unwrap();
        assert_eq!(parsed, vec![("X-Token".to_string(), "abc:def".to_string())]);
        assert!(parse_headers(&["no-colon".to_string()]).is_err());
    }

    #[test]
    fn target_normalization_adds_scheme() {
        assert_eq!(normalize_target("example.com"), "http://example.com");
        assert_eq!(normalize_target("https://example.com"), "https://example.com");
    }

    #[test]
    fn cli_parses_the_full_surface() {
        let cli = Cli::parse_from([
            "rspray",
            "-u",
            "http://example.com",
            "-d",
            "words.txt",
            "--mod",
            "host",
            "--match",
            "current.status == 200",
            "--thread",
            "50",
            "--crawl",
            "--bak",
            "--deadline",
            "60",
        ]);
        assert_eq!(cli.urls, vec!["http://example.com".to_string()]);
        assert_eq!(cli.thread, 50);
        assert_eq!(cli.mode, "host");
        assert!(cli.crawl);
        assert!(cli.bak);
        assert_eq!(cli.deadline, Some(60));
        assert_eq!(cli.match_expr.as_deref(), Some("current.status == 200"));
    }

    #[tokio::test]
    async fn missing_targets_is_a_config_error() {
        let err = run_from_args(["rspray", "-d", "/nonexistent/words.txt"])
            .await
            .unwrap_err();
        assert!(matches!(err, RsprayError::MissingArgument { .. }));
    }

    #[tokio::test]
    async fn cli_end_to_end_writes_output_and_stat_files() {
        let route = warp::path::full().map(|p: warp::path::FullPath| {
            if p.as_str() == "/" {
                warp::reply::with_status("the index".to_string(), warp::http::StatusCode::OK)
            } else if p.as_str() == "/admin" {
                warp::reply::with_status(
                    "welcome to the panel".to_string(),
                    warp::http::StatusCode::OK,
                )
            } else {
                warp::reply::with_status("nope".to_string(), warp::http::StatusCode::NOT_FOUND)
            }
        });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let mut dict = tempfile::NamedTempFile::new().unwrap();
        writeln!(dict, "admin\nzzzznothing").unwrap();
        let outdir = tempfile::tempdir().unwrap();
        let out_path = outdir.path().join("hits.json");
        let stat_path = outdir.path().join("stat.json");

        let outcome = run_from_args([
            "rspray",
            "-u",
            &format!("http://{}", addr),
            "-d",
            dict.path().to_str().unwrap(),
            "-f",
            out_path.to_str().unwrap(),
            "--stat-file",
            stat_path.to_str().unwrap(),
            "--format",
            "json",
        ])
        .await
        .unwrap();
        assert_eq!(outcome, RunOutcome::Finished);

        let hits = std::fs::read_to_string(&out_path).unwrap();
        assert!(hits.contains("/admin"), "hits: {}", hits);
        assert!(!hits.contains("zzzznothing"));

        let stat = std::fs::read_to_string(&stat_path).unwrap();
        let record: crate::cores::spray_en::StatistorData =
            serde_json::from_str(stat.lines().next().unwrap()).unwrap();
        assert_eq!(record.total, 2);
        assert_eq!(record.end, 2);
    }
}
