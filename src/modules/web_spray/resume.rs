use std::path::Path;

use crate::cores::spray_en::{StatistorData, Task};
use crate::errors::RsprayError;

/// Reloads a stat stream written by a previous run: one JSON object per
/// line, one resumable task per target.
pub fn load_stat_file(path: &Path) -> Result<Vec<Task>, RsprayError> {
    let content = std::fs::read_to_string(path)?;
    let mut tasks = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let data: StatistorData = serde_json::from_str(line)
            .map_err(|e| RsprayError::ParseError(format!("invalid stat record: {}", e)))?;
        tasks.push(Task::from_origin(data));
    }
    Ok(tasks)
}
