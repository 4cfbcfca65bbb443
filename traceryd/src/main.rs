//! The `traceryd` front-end.
//!
//! Binds the dispatch port, optionally launches the subject with the probe
//! environment set, accepts the subject's connection, and commits listener
//! results when the stream ends. All failures exit with code 1: argument
//! errors, setup errors, subject launch failures, and trace-file write
//! failures alike.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::net::TcpListener;
use tracery_wire::{BlockMask, BlockType, BranchMask, BranchType, InstMode, ObjectType};

use traceryd::config::Config;
use traceryd::dispatch::Dispatcher;
use traceryd::listener::{
    CoverageListener, FingerprintListener, ListenerSet, SequenceWriter, StreamId,
};
use traceryd::metrics::Metrics;
use traceryd::subject::{self, SubjectSpec};

#[derive(Parser, Debug)]
#[command(name = "traceryd", version, about = "Tracery event dispatcher")]
struct Args {
    /// Listen on this port for the subject's probe.
    #[arg(long)]
    port: Option<u16>,

    /// Subject classpath, exported to the subject environment.
    #[arg(long = "cp", value_name = "PATH")]
    classpath: Option<String>,

    /// Pipe stdin through to the subject.
    #[arg(short = 'i', long = "pipe-stdin")]
    pipe_stdin: bool,

    /// Kill the subject after this many wall-clock seconds.
    #[arg(long = "tl", value_name = "SECONDS")]
    time_limit: Option<u64>,

    /// Append this run to an existing trace.
    #[arg(long = "at")]
    append: bool,

    /// Base trace name, without extension.
    #[arg(long = "trname", value_name = "NAME")]
    trace_name: Option<String>,

    /// Redirect subject output to this file.
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<PathBuf>,

    /// Arguments forwarded to the subject VM, terminated by `__end`.
    #[arg(long = "ja", value_name = "ARG", num_args = 0.., value_terminator = "__end", allow_hyphen_values = true)]
    vm_args: Vec<String>,

    /// Send processed sequence data to the relay socket instead of a file.
    #[arg(long)]
    relay: bool,

    /// Literal data written before the trace records.
    #[arg(long, value_name = "STR")]
    pre: Option<String>,

    /// Literal data written after the trace records.
    #[arg(long, value_name = "STR")]
    post: Option<String>,

    /// Enabled block types: letters from B, E, X, C, R.
    #[arg(long, value_name = "LETTERS")]
    blocks: Option<String>,

    /// Enabled branch types: letters from I, S, T, C, E, O. Selecting any
    /// switches the stream to branch entities.
    #[arg(long, value_name = "LETTERS")]
    branches: Option<String>,

    /// Instrumentation mode the subject was rewritten with.
    #[arg(long, value_enum, default_value = "coverage")]
    mode: ModeArg,

    /// Subject command line.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "SUBJECT")]
    subject: Vec<String>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Compat,
    Coverage,
    Sequence,
    Hash,
}

impl From<ModeArg> for InstMode {
    fn from(mode: ModeArg) -> InstMode {
        match mode {
            ModeArg::Compat => InstMode::Compatible,
            ModeArg::Coverage => InstMode::OptNormal,
            ModeArg::Sequence => InstMode::OptSequence,
            ModeArg::Hash => InstMode::TraceHashing,
        }
    }
}

fn parse_block_mask(letters: &str) -> Result<BlockMask> {
    let mut mask = BlockMask::empty();
    for letter in letters.chars() {
        let t = BlockType::ALL
            .into_iter()
            .find(|t| t.letter() == letter.to_ascii_uppercase())
            .with_context(|| format!("unknown block type letter '{letter}'"))?;
        mask.insert(t);
    }
    Ok(mask)
}

fn parse_branch_mask(letters: &str) -> Result<BranchMask> {
    let mut mask = BranchMask::empty();
    for letter in letters.chars() {
        let t = BranchType::ALL
            .into_iter()
            .find(|t| t.letter() == letter.to_ascii_uppercase())
            .with_context(|| format!("unknown branch type letter '{letter}'"))?;
        mask.insert(t);
    }
    Ok(mask)
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // Argument errors exit 1, like every other failure.
            let _ = err.print();
            std::process::exit(1);
        }
    };
    if let Err(err) = run(args).await {
        eprintln!("traceryd: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::load();
    if let Some(port) = args.port {
        config.dispatch.port = port;
    }
    if let Some(name) = &args.trace_name {
        config.trace.base_name = name.clone();
    }
    config.trace.append |= args.append;
    config.sequence.relay |= args.relay;
    if args.pre.is_some() {
        config.sequence.pre = args.pre.clone();
    }
    if args.post.is_some() {
        config.sequence.post = args.post.clone();
    }

    let mode: InstMode = args.mode.into();
    let branch_mask = args
        .branches
        .as_deref()
        .map(parse_branch_mask)
        .transpose()?
        .unwrap_or_else(BranchMask::empty);
    let object_type = if branch_mask.is_empty() {
        ObjectType::Block
    } else {
        ObjectType::Branch
    };
    let block_mask = match args.blocks.as_deref() {
        Some(letters) => parse_block_mask(letters)?,
        None if object_type == ObjectType::Block => {
            let mut mask = BlockMask::empty();
            mask.insert(BlockType::Code);
            mask
        }
        None => BlockMask::empty(),
    };
    let type_names: Vec<String> = match object_type {
        ObjectType::Block => block_mask.iter().map(|t| t.name().to_owned()).collect(),
        ObjectType::Branch => branch_mask.iter().map(|t| t.name().to_owned()).collect(),
    };

    let mut listeners = ListenerSet::new(config.dispatch.synchronized);
    match mode {
        InstMode::Compatible | InstMode::OptNormal => {
            listeners.register(CoverageListener::new(
                object_type,
                type_names,
                config.trace.trace_path(),
                config.trace.append,
            ));
        }
        InstMode::OptSequence => {
            let writer = if config.sequence.relay {
                SequenceWriter::to_relay(
                    config.sequence.relay_port,
                    config.sequence.pre.clone(),
                    config.sequence.post.clone(),
                )
                .await?
            } else {
                SequenceWriter::to_file(
                    &config.trace.sequence_path(),
                    config.sequence.pre.clone(),
                    config.sequence.post.clone(),
                )
                .await?
            };
            listeners.register(writer);
        }
        InstMode::TraceHashing => {
            listeners.register(FingerprintListener);
        }
    }
    let listeners = Arc::new(listeners);
    let metrics = Arc::new(Metrics::new());

    let accept = TcpListener::bind(("127.0.0.1", config.dispatch.port))
        .await
        .with_context(|| format!("binding dispatch port {}", config.dispatch.port))?;
    let port = accept.local_addr()?.port();
    let accept = Arc::new(accept);
    info!("listening on 127.0.0.1:{port}");

    let dispatcher = Arc::new(Dispatcher::new(
        listeners,
        metrics.clone(),
        config.dispatch.signal_port,
    ));
    let control = dispatcher.control();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, abandoning the trace");
            std::process::exit(1);
        }
    });

    let subject_process = if args.subject.is_empty() {
        None
    } else {
        let spec = SubjectSpec {
            command: args.subject.clone(),
            vm_args: args.vm_args.clone(),
            classpath: args.classpath.clone(),
            output: args.output.clone(),
            pipe_stdin: args.pipe_stdin,
        };
        Some(subject::spawn(&spec, port, mode, object_type)?)
    };

    let primary = {
        let dispatcher = dispatcher.clone();
        let accept = accept.clone();
        tokio::spawn(async move { dispatcher.serve_one(&accept, StreamId(0)).await })
    };
    // The second stream exists only for a subject that is itself a
    // dispatcher; it may never connect.
    let secondary = config.dispatch.synchronized.then(|| {
        let dispatcher = dispatcher.clone();
        let accept = accept.clone();
        tokio::spawn(async move { dispatcher.serve_one(&accept, StreamId(1)).await })
    });

    if let Some(subject_process) = subject_process {
        let limit = args.time_limit.map(Duration::from_secs);
        let timed_out = subject_process.wait_with_limit(limit, &control).await?;
        if timed_out {
            warn!("subject killed by time limit; committing what arrived");
        }
    }

    primary
        .await
        .context("receive task panicked")?
        .context("event stream failed")?;
    if let Some(secondary) = secondary {
        if control.is_connected(1) {
            secondary
                .await
                .context("receive task panicked")?
                .context("second event stream failed")?;
        } else {
            secondary.abort();
        }
    }

    if let Some(error) = control.last_error(0).or_else(|| control.last_error(1)) {
        bail!("stream reported: {error}");
    }
    info!(
        "done in {}s: {} frame(s), {} event(s), {} stream(s) committed, \
         {} decode error(s), {} listener error(s)",
        metrics.uptime_seconds(),
        metrics.frames_total(),
        metrics.events_total(),
        metrics.streams_committed(),
        metrics.decode_errors(),
        metrics.listener_errors()
    );
    Ok(())
}
