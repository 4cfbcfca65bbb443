//! Compiled units, as consumed and rewritten.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::InstrumentError;
use crate::ir::MethodBody;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitKind {
    Class,
    /// Interfaces carry no executable code and are rejected outright.
    Interface,
}

/// Method properties the rewriter cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodAccess {
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub is_native: bool,
    /// Class initializer; highest priority for the startup call.
    #[serde(default)]
    pub is_class_init: bool,
    /// Program entry point; next priority for the startup call.
    #[serde(default)]
    pub is_main: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Method {
    pub signature: String,
    #[serde(default)]
    pub access: MethodAccess,
    /// Absent for abstract and native methods, which are left untouched.
    pub body: Option<MethodBody>,
}

impl Method {
    pub fn is_executable(&self) -> bool {
        self.body.is_some() && !self.access.is_abstract && !self.access.is_native
    }
}

/// One compiled unit: a named container of methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub name: String,
    pub kind: UnitKind,
    pub methods: Vec<Method>,
}

impl Unit {
    /// Load a unit from the builder's JSON form.
    pub fn load(path: &Path) -> Result<Self, InstrumentError> {
        let raw = std::fs::read_to_string(path).map_err(|source| InstrumentError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| InstrumentError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Write the (possibly rewritten) unit back out as JSON.
    pub fn store(&self, path: &Path) -> Result<(), InstrumentError> {
        let raw = serde_json::to_string_pretty(self).map_err(|source| InstrumentError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        std::fs::write(path, raw).map_err(|source| InstrumentError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}
