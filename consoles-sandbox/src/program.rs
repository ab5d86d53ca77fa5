//! Program sources and the on-disk program loader

use crate::error::{Result, SandboxError};
use std::path::{Component, Path, PathBuf};

/// Source text plus the name it is reported under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    name: String,
    source: String,
}

impl Program {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    /// Inline source typed by a user rather than read from a file.
    pub fn inline(source: impl Into<String>) -> Self {
        Self::new("stdin", source)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Resolves named programs inside one root directory.
#[derive(Debug, Clone)]
pub struct ProgramLoader {
    root: PathBuf,
    extension: String,
}

impl ProgramLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: "lua".to_string(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path for `name`, with the extension appended when missing.
    ///
    /// Absolute paths and `..` components are rejected so a program name can
    /// never escape the root.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let mut relative = PathBuf::from(name.trim());
        if relative.as_os_str().is_empty() {
            return Err(SandboxError::NotFound("empty program name".to_string()));
        }
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(SandboxError::NotFound(format!(
                "program '{}' is outside the program directory",
                name
            )));
        }

        let has_extension = relative
            .extension()
            .map(|ext| ext.to_string_lossy() == self.extension.as_str())
            .unwrap_or(false);
        if !has_extension && !self.extension.is_empty() {
            let mut file_name = relative.as_os_str().to_os_string();
            file_name.push(".");
            file_name.push(&self.extension);
            relative = PathBuf::from(file_name);
        }

        Ok(self.root.join(relative))
    }

    pub fn load(&self, name: &str) -> Result<Program> {
        let path = self.resolve(name)?;
        if !path.is_file() {
            return Err(SandboxError::NotFound(format!(
                "program '{}' does not exist",
                name
            )));
        }

        let source = std::fs::read_to_string(&path)?;
        tracing::debug!(program = name, path = %path.display(), bytes = source.len(), "Loaded program");
        Ok(Program::new(name.trim(), source))
    }

    /// Split a command line into program name and arguments.
    pub fn split_command(line: &str) -> (&str, Vec<String>) {
        let line = line.trim();
        match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (
                name,
                rest.split_whitespace().map(str::to_string).collect(),
            ),
            None => (line, Vec::new()),
        }
    }
}
