//! # Registry of remote procedures
//!
//! Maps each procedure name a page may call to the context that implements it.
//!
//! ## Invariants
//!
//! - A name is bound to at most one target for the lifetime of the registry.
//! - A batch registers all of its names or none of them.

use std::collections::HashMap;
use std::sync::PoisonError;
use std::sync::RwLock;

/// Registration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The name is already bound to a different target.
    Conflict { name: String, existing: String, requested: String },
    /// Procedure names must be non-empty.
    EmptyName,
    /// Target context names must be non-empty.
    EmptyTarget,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Conflict { name, existing, requested } => write!(
                f,
                "procedure '{}' is already bound to '{}', cannot rebind to '{}'",
                name, existing, requested
            ),
            Error::EmptyName => write!(f, "procedure name is empty"),
            Error::EmptyTarget => write!(f, "target context name is empty"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Procedure name to target context.
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds every name in `names` to `target`.
    ///
    /// Rebinding a name to the target it already has is a no-op.
    pub fn register<I, S>(&self, target: &str, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if target.is_empty() {
            return Err(Error::EmptyTarget);
        }
        let names: Vec<String> = names.into_iter().map(|n| n.as_ref().to_owned()).collect();

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        // validate the whole batch before touching the table
        for name in &names {
            if name.is_empty() {
                return Err(Error::EmptyName);
            }
            if let Some(existing) = entries.get(name) {
                if existing != target {
                    return Err(Error::Conflict {
                        name: name.clone(),
                        existing: existing.clone(),
                        requested: target.to_owned(),
                    });
                }
            }
        }

        for name in names {
            entries.insert(name, target.to_owned());
        }
        Ok(())
    }

    /// Returns the target context bound to `name`.
    pub fn target_of(&self, name: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
