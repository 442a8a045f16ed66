use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// The file under test. Built once per run and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    path: PathBuf,
    file_name: String,
    module: String,
    text: String,
}

impl SourceUnit {
    /// Reads `path` as UTF-8. The file is only ever opened for reading.
    pub fn read(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self::new(path, text))
    }

    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        let path = path.into();

        let module = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("module")
            .to_string();

        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{module}.py"));

        Self {
            path,
            file_name,
            module,
            text: text.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base name with extension, used for the sandbox copy.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Base name without extension. Generated tests import under this name.
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}
