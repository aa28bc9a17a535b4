use crate::error::CronRunnerError;
use crate::state::write_atomic_text_file;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn entries(&self) -> Result<BTreeMap<String, PathBuf>, CronRunnerError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(CronRunnerError::Io(err)),
        };
        Ok(parse_registry(&content))
    }

    pub fn lookup_name(&self, name: &str) -> Result<Option<PathBuf>, CronRunnerError> {
        Ok(self.entries()?.remove(name))
    }

    pub fn lookup_path(&self, path: &Path) -> Result<Option<String>, CronRunnerError> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|(_, registered)| registered == path)
            .map(|(name, _)| name))
    }

    // Returns `true` when the file changed.
    pub fn register(&self, name: &str, path: &Path) -> Result<bool, CronRunnerError> {
        validate_name(name)?;
        let mut entries = self.entries()?;
        if entries.get(name).map(PathBuf::as_path) == Some(path) {
            return Ok(false);
        }
        entries.insert(name.to_string(), path.to_path_buf());
        let mut content = String::new();
        for (name, path) in &entries {
            content.push_str(&format!("{} {}\n", name, path.display()));
        }
        write_atomic_text_file(&self.path, &content)?;
        Ok(true)
    }
}

fn parse_registry(content: &str) -> BTreeMap<String, PathBuf> {
    let mut entries = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, path)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let path = path.trim();
        if path.is_empty() {
            continue;
        }
        // Later lines win so a hand-appended entry overrides an older one.
        entries.insert(name.to_string(), PathBuf::from(path));
    }
    entries
}

pub fn validate_name(name: &str) -> Result<(), CronRunnerError> {
    if name.is_empty() || name.contains(char::is_whitespace) || name.contains('/') {
        return Err(CronRunnerError::Config(format!(
            "invalid runner name '{name}': must be non-empty without whitespace or '/'"
        )));
    }
    Ok(())
}
