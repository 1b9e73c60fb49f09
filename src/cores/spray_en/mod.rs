pub mod baseline;
pub mod context;
pub mod crawl;
pub mod expression;
pub mod fingerprint;
pub mod pool;
pub mod runner;
pub mod statistor;
pub mod types;
pub mod words;

pub use baseline::{Baseline, ExactMatch};
pub use context::EngineContext;
pub use expression::ExpressionSet;
pub use pool::{Pool, PoolConfig, SprayMod};
pub use runner::{RunOutcome, Runner, RunnerConfig, RunnerShared, Task};
pub use statistor::{Statistor, StatistorData};
pub use types::{Reason, Shutdown, SourceType, Unit};
pub use words::{RuleProgram, WordFn, Worder};
