pub mod web_spray;

// 导出模块级 API
pub use web_spray::{format_baseline, OutputFormat, SprayJob};
