//! Capability registry: named, immutable groups of host functions

use crate::error::{Result, SandboxError};
use crate::function::HostFunction;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One function of a library, exposed to scripts under `name`.
#[derive(Debug, Clone)]
pub struct NamedFunction {
    pub name: String,
    pub function: HostFunction,
}

impl NamedFunction {
    pub fn new(name: impl Into<String>, function: HostFunction) -> Self {
        Self {
            name: name.into(),
            function,
        }
    }
}

/// A published capability library. Immutable once constructed.
#[derive(Debug)]
pub struct Library {
    name: String,
    functions: Vec<NamedFunction>,
}

impl Library {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Functions in publication order.
    pub fn functions(&self) -> &[NamedFunction] {
        &self.functions
    }
}

/// Registry of capability libraries shared by every sandbox in the process.
///
/// Publishing takes a write lock once; afterwards every lookup is a read of an
/// immutable `Arc<Library>`.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    libraries: Arc<RwLock<HashMap<String, Arc<Library>>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `functions` under `library`. Re-publishing a name is an error.
    pub fn publish(
        &self,
        library: impl Into<String>,
        functions: Vec<NamedFunction>,
    ) -> Result<Arc<Library>> {
        let name = library.into();
        if name.is_empty() {
            return Err(SandboxError::Configuration(
                "library name must not be empty".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for function in &functions {
            if !seen.insert(function.name.as_str()) {
                return Err(SandboxError::Configuration(format!(
                    "library '{}' declares '{}' twice",
                    name, function.name
                )));
            }
        }

        let mut libraries = self
            .libraries
            .write()
            .map_err(|_| SandboxError::InvalidState("capability registry poisoned".into()))?;
        if libraries.contains_key(&name) {
            return Err(SandboxError::Configuration(format!(
                "library '{}' is already published",
                name
            )));
        }

        let library = Arc::new(Library {
            name: name.clone(),
            functions,
        });
        libraries.insert(name.clone(), Arc::clone(&library));

        tracing::debug!(
            library = %name,
            functions = library.functions.len(),
            "Published capability library"
        );

        Ok(library)
    }

    pub fn get(&self, library: &str) -> Result<Arc<Library>> {
        let libraries = self
            .libraries
            .read()
            .map_err(|_| SandboxError::InvalidState("capability registry poisoned".into()))?;
        libraries
            .get(library)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(format!("library '{}' is not published", library)))
    }

    pub fn contains(&self, library: &str) -> bool {
        self.libraries
            .read()
            .map(|libraries| libraries.contains_key(library))
            .unwrap_or(false)
    }

    /// Sorted names of every published library.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .libraries
            .read()
            .map(|libraries| libraries.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
