use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::fingerprint::{builtin_extractors, builtin_fingers, Extractor, Finger};
use super::words::RuleProgram;
use crate::errors::RsprayError;

/// Shared engine state loaded once at startup and passed to every pool:
/// dictionary and rule caches plus the fingerprint/extractor registries.
#[derive(Debug)]
pub struct EngineContext {
    dicts: Mutex<HashMap<PathBuf, Arc<Vec<String>>>>,
    rules: Mutex<HashMap<PathBuf, Arc<RuleProgram>>>,
    pub fingers: Vec<Finger>,
    pub extractors: Vec<Extractor>,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineContext {
    pub fn new() -> Self {
        Self {
            dicts: Mutex::new(HashMap::new()),
            rules: Mutex::new(HashMap::new()),
            fingers: builtin_fingers(),
            extractors: builtin_extractors(),
        }
    }

    /// Loads a wordlist, one entry per non-empty line. Cached per path so
    /// multiple targets share one copy.
    pub fn load_dict(&self, path: &Path) -> Result<Arc<Vec<String>>, RsprayError> {
        if let Some(cached) = self.dicts.lock().unwrap().get(path) {
            return Ok(cached.clone());
        }
        let content = std::fs::read_to_string(path).map_err(|source| RsprayError::WordlistLoad {
            path: path.to_path_buf(),
            source,
        })?;
        let words: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();
        if words.is_empty() {
            return Err(RsprayError::EmptyWordlist);
        }
        let words = Arc::new(words);
        self.dicts
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), words.clone());
        Ok(words)
    }

    /// Loads and parses a mutation rule file, cached per path.
    pub fn load_rules(&self, path: &Path) -> Result<Arc<RuleProgram>, RsprayError> {
        if let Some(cached) = self.rules.lock().unwrap().get(path) {
            return Ok(cached.clone());
        }
        let content = std::fs::read_to_string(path).map_err(|source| RsprayError::WordlistLoad {
            path: path.to_path_buf(),
            source,
        })?;
        let program = Arc::new(RuleProgram::parse(&content)?);
        self.rules
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), program.clone());
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn dict_load_caches_by_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "admin\n# comment\n\nlogin").unwrap();
        let ctx = EngineContext::new();
        let first = ctx.load_dict(file.path()).unwrap();
        let second = ctx.load_dict(file.path()).unwrap();
        assert_eq!(*first, vec!["admin".to_string(), "login".to_string()]);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn empty_dict_is_an_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let ctx = EngineContext::new();
        assert!(matches!(
            ctx.load_dict(file.path()),
            Err(RsprayError::EmptyWordlist)
        ));
    }
}
