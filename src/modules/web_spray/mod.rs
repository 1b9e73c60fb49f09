pub mod resume;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::cores::spray_en::{
    Baseline, EngineContext, RunOutcome, Runner, RunnerConfig, Task,
};
use crate::errors::RsprayError;

/// 输出格式选项
#[derive(Debug, Clone)]
pub enum OutputFormat {
    Raw,
    Json,
    Csv,
}

/// 格式化单条结果 (便于 CLI 输出与文件流)
pub fn format_baseline(bl: &Baseline, fmt: &OutputFormat) -> String {
    match fmt {
        OutputFormat::Raw => bl.describe(),
        OutputFormat::Json => bl.jsonify(),
        OutputFormat::Csv => format!("{},{},{}", bl.url_string, bl.status, bl.body_length),
    }
}

/// One configured run: targets in, hit/fuzzy/stat streams out. The module
/// layer owns the stream consumers; the runner owns the pools.
pub struct SprayJob {
    pub tasks: Vec<Task>,
    pub config: RunnerConfig,
    pub format: OutputFormat,
    pub output_file: Option<PathBuf>,
    pub fuzzy_file: Option<PathBuf>,
    pub dump_file: Option<PathBuf>,
    pub stat_file: Option<PathBuf>,
}

async fn write_line(file: &mut File, line: &str) {
    if let Err(e) = file.write_all(format!("{}\n", line).as_bytes()).await {
        error!("output write failed: {}", e);
    }
}

impl SprayJob {
    pub async fn run(self, ctx: Arc<EngineContext>) -> Result<RunOutcome, RsprayError> {
        let runner = Runner::new(self.config.clone(), ctx);
        let (mut out_rx, mut fuzzy_rx, mut stat_rx) = runner.take_outputs()?;
        let shared = runner.shared();

        let mut output_file = match &self.output_file {
            Some(p) => Some(File::create(p).await?),
            None => None,
        };
        let mut dump_file = match &self.dump_file {
            Some(p) => Some(File::create(p).await?),
            None => None,
        };
        let mut fuzzy_file = match &self.fuzzy_file {
            Some(p) => Some(File::create(p).await?),
            None => None,
        };
        let mut stat_file = match &self.stat_file {
            Some(p) => Some(File::create(p).await?),
            None => None,
        };

        let fmt = self.format.clone();
        let hits = tokio::spawn(async move {
            while let Some(bl) = out_rx.recv().await {
                if let Some(f) = dump_file.as_mut() {
                    write_line(f, &bl.jsonify()).await;
                }
                if bl.is_valid {
                    if bl.recu {
                        shared.add_recursive(&bl);
                    }
                    match output_file.as_mut() {
                        Some(f) => write_line(f, &format_baseline(&bl, &fmt)).await,
                        None => println!("[+] {}", format_baseline(&bl, &fmt)),
                    }
                } else {
                    debug!("{}", bl.describe());
                }
            }
            if let Some(f) = output_file.as_mut() {
                let _ = f.flush().await;
            }
            if let Some(f) = dump_file.as_mut() {
                let _ = f.flush().await;
            }
        });

        let fuzzy_enabled = self.config.fuzzy;
        let fuzzy_fmt = self.format.clone();
        let fuzzies = tokio::spawn(async move {
            while let Some(bl) = fuzzy_rx.recv().await {
                if !fuzzy_enabled {
                    debug!("{}", bl.describe());
                    continue;
                }
                match fuzzy_file.as_mut() {
                    Some(f) => write_line(f, &bl.jsonify()).await,
                    None => println!("[fuzzy] {}", format_baseline(&bl, &fuzzy_fmt)),
                }
            }
            if let Some(f) = fuzzy_file.as_mut() {
                let _ = f.flush().await;
            }
        });

        let stats = tokio::spawn(async move {
            while let Some(data) = stat_rx.recv().await {
                if let Some(f) = stat_file.as_mut() {
                    match serde_json::to_string(&data) {
                        Ok(line) => write_line(f, &line).await,
                        Err(e) => error!("stat serialize failed: {}", e),
                    }
                }
            }
            if let Some(f) = stat_file.as_mut() {
                let _ = f.flush().await;
            }
        });

        runner.add_tasks(self.tasks);
        let outcome = runner.run().await;
        drop(runner);

        let _ = hits.await;
        let _ = fuzzies.await;
        let _ = stats.await;
        Ok(outcome)
    }
}
