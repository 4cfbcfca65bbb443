//! The sequence writer.
//!
//! Appends one textual record per event to a file or to the relay socket,
//! bracketed by the configured pre/post fragments. Record forms:
//!
//! ```text
//! m <signature>     method entry
//! <L><id>           witnessed entity, L = the kind's selector letter
//! )r                exceptional method exit
//! )x                test boundary
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracery_wire::{InstMode, ObjectType};

use crate::listener::{EntityKind, EventListener, SequenceMarker, StreamId};

enum SequenceOut {
    File(tokio::fs::File),
    Relay(tokio::net::TcpStream),
}

impl SequenceOut {
    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            SequenceOut::File(f) => f.write_all(data).await,
            SequenceOut::Relay(s) => s.write_all(data).await,
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            SequenceOut::File(f) => f.flush().await,
            SequenceOut::Relay(s) => s.flush().await,
        }
    }
}

pub struct SequenceWriter {
    out: tokio::sync::Mutex<SequenceOut>,
    pre: Option<String>,
    post: Option<String>,
}

impl SequenceWriter {
    pub async fn to_file(
        path: &Path,
        pre: Option<String>,
        post: Option<String>,
    ) -> Result<SequenceWriter> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("opening sequence file {}", path.display()))?;
        Ok(SequenceWriter {
            out: tokio::sync::Mutex::new(SequenceOut::File(file)),
            pre,
            post,
        })
    }

    /// Connect to the relay socket instead of writing a file.
    pub async fn to_relay(port: u16, pre: Option<String>, post: Option<String>) -> Result<Self> {
        let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .with_context(|| format!("connecting to relay on port {port}"))?;
        Ok(SequenceWriter {
            out: tokio::sync::Mutex::new(SequenceOut::Relay(stream)),
            pre,
            post,
        })
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes())
            .await
            .context("sequence write")?;
        out.write_all(b"\n").await.context("sequence write")?;
        Ok(())
    }
}

#[async_trait]
impl EventListener for SequenceWriter {
    fn name(&self) -> &'static str {
        "sequence"
    }

    fn accepts_object(&self, _object_type: ObjectType) -> bool {
        true
    }

    fn accepts_mode(&self, mode: InstMode) -> bool {
        matches!(mode, InstMode::OptSequence | InstMode::Compatible)
    }

    async fn stream_started(&self, _stream: StreamId) -> Result<()> {
        if let Some(pre) = &self.pre {
            self.write_line(pre).await?;
        }
        Ok(())
    }

    async fn method_enter(
        &self,
        _stream: StreamId,
        signature: &str,
        _object_count: u32,
    ) -> Result<()> {
        self.write_line(&format!("m {signature}")).await
    }

    async fn entity_witnessed(
        &self,
        _stream: StreamId,
        _signature: &str,
        kind: EntityKind,
        id: u32,
    ) -> Result<()> {
        self.write_line(&format!("{}{id}", kind.letter())).await
    }

    async fn sequence_marker(&self, _stream: StreamId, marker: SequenceMarker) -> Result<()> {
        match marker {
            SequenceMarker::MethodExit => self.write_line(")r").await,
            SequenceMarker::TestBoundary => self.write_line(")x").await,
        }
    }

    async fn commit(&self, _stream: StreamId) -> Result<()> {
        if let Some(post) = &self.post {
            self.write_line(post).await?;
        }
        self.out.lock().await.flush().await.context("sequence flush")?;
        Ok(())
    }
}
