//! The coverage aggregator.
//!
//! Collects one bit vector per method and serializes the lot to a `.tr`
//! trace file when the stream commits. In append mode the existing file is
//! read back and OR-merged first, so repeated runs accumulate coverage.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::info;
use tracery_wire::{InstMode, ObjectType};

use crate::listener::{EntityKind, EventListener, StreamId};
use crate::trace::{CoverageTrace, TraceFile};

pub struct CoverageListener {
    object_type: ObjectType,
    type_names: Vec<String>,
    path: PathBuf,
    append: bool,
    state: Mutex<BTreeMap<String, CoverageTrace>>,
}

impl CoverageListener {
    pub fn new(
        object_type: ObjectType,
        type_names: Vec<String>,
        path: PathBuf,
        append: bool,
    ) -> Self {
        CoverageListener {
            object_type,
            type_names,
            path,
            append,
            state: Mutex::new(BTreeMap::new()),
        }
    }

    /// The aggregated traces so far; test hook.
    pub fn snapshot(&self) -> BTreeMap<String, CoverageTrace> {
        self.state.lock().expect("coverage state").clone()
    }
}

#[async_trait]
impl EventListener for CoverageListener {
    fn name(&self) -> &'static str {
        "coverage"
    }

    fn accepts_object(&self, object_type: ObjectType) -> bool {
        object_type == self.object_type
    }

    fn accepts_mode(&self, mode: InstMode) -> bool {
        matches!(mode, InstMode::OptNormal | InstMode::Compatible)
    }

    async fn method_enter(
        &self,
        _stream: StreamId,
        signature: &str,
        object_count: u32,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("coverage state");
        state
            .entry(signature.to_owned())
            .or_insert_with(|| CoverageTrace::new(object_count));
        Ok(())
    }

    async fn entity_witnessed(
        &self,
        _stream: StreamId,
        signature: &str,
        _kind: EntityKind,
        id: u32,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("coverage state");
        let trace = state
            .get_mut(signature)
            .ok_or_else(|| anyhow!("entity event for {signature} before its method entry"))?;
        // Out-of-range ids are a protocol violation, not a soft miss.
        trace.set(id)?;
        Ok(())
    }

    async fn commit(&self, _stream: StreamId) -> Result<()> {
        let mut file = TraceFile::new(self.object_type.code(), self.type_names.clone());
        file.methods = self.state.lock().expect("coverage state").clone();
        if self.append && self.path.exists() {
            let existing = TraceFile::read(&self.path)
                .with_context(|| format!("reading {} for append", self.path.display()))?;
            let mut merged = existing;
            merged.merge(file);
            merged
                .write(&self.path)
                .with_context(|| format!("writing {}", self.path.display()))?;
        } else {
            file.write(&self.path)
                .with_context(|| format!("writing {}", self.path.display()))?;
        }
        info!("coverage committed to {}", self.path.display());
        Ok(())
    }
}
