//! The fingerprint listener.
//!
//! Hashing subjects fold their own fingerprint and print it at exit; nothing
//! arrives on the wire. This listener only exists so a hashing handshake has
//! something to validate against.

use anyhow::Result;
use async_trait::async_trait;
use tracery_wire::{InstMode, ObjectType};

use crate::listener::{EntityKind, EventListener, StreamId};

pub struct FingerprintListener;

#[async_trait]
impl EventListener for FingerprintListener {
    fn name(&self) -> &'static str {
        "fingerprint"
    }

    fn accepts_object(&self, _object_type: ObjectType) -> bool {
        true
    }

    fn accepts_mode(&self, mode: InstMode) -> bool {
        mode == InstMode::TraceHashing
    }

    async fn method_enter(&self, _: StreamId, _: &str, _: u32) -> Result<()> {
        Ok(())
    }

    async fn entity_witnessed(&self, _: StreamId, _: &str, _: EntityKind, _: u32) -> Result<()> {
        Ok(())
    }

    async fn commit(&self, _: StreamId) -> Result<()> {
        Ok(())
    }
}
