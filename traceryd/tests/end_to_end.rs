//! End-to-end scenarios: a real probe talking to a real dispatcher over
//! loopback sockets, with instrumented-method behavior driven through the
//! probe API in the order the rewriter emits calls.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpListener;
use tracery_probe::{Probe, ProbeConfig, ProbeError, StackScanner};
use tracery_wire::{BlockType, BranchType, InstMode, ObjectId, ObjectType};
use traceryd::dispatch::Dispatcher;
use traceryd::listener::{
    CoverageListener, EntityKind, EventListener, ListenerSet, SequenceMarker, StreamId,
};
use traceryd::metrics::Metrics;
use traceryd::trace::TraceFile;

struct NoFrames;

impl StackScanner for NoFrames {
    fn frames(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Collects delivered events as text lines; accepts every stream.
#[derive(Default)]
struct Recorder {
    lines: Mutex<Vec<String>>,
}

impl Recorder {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut self.lines.lock().unwrap())
    }
}

struct SharedRecorder(Arc<Recorder>);

#[async_trait]
impl EventListener for SharedRecorder {
    fn name(&self) -> &'static str {
        "recorder"
    }
    fn accepts_object(&self, _: ObjectType) -> bool {
        true
    }
    fn accepts_mode(&self, _: InstMode) -> bool {
        true
    }
    async fn method_enter(&self, _: StreamId, signature: &str, count: u32) -> Result<()> {
        self.0
            .lines
            .lock()
            .unwrap()
            .push(format!("enter {signature} {count}"));
        Ok(())
    }
    async fn entity_witnessed(
        &self,
        _: StreamId,
        _: &str,
        kind: EntityKind,
        id: u32,
    ) -> Result<()> {
        self.0
            .lines
            .lock()
            .unwrap()
            .push(format!("{}{id}", kind.letter()));
        Ok(())
    }
    async fn sequence_marker(&self, _: StreamId, marker: SequenceMarker) -> Result<()> {
        let text = match marker {
            SequenceMarker::MethodExit => ")r",
            SequenceMarker::TestBoundary => ")x",
        };
        self.0.lines.lock().unwrap().push(text.to_owned());
        Ok(())
    }
    async fn commit(&self, _: StreamId) -> Result<()> {
        self.0.lines.lock().unwrap().push("commit".to_owned());
        Ok(())
    }
}

async fn start_dispatcher(
    listeners: ListenerSet,
) -> (
    u16,
    Arc<Metrics>,
    tokio::task::JoinHandle<Result<()>>,
) {
    let metrics = Arc::new(Metrics::new());
    let accept = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = accept.local_addr().unwrap().port();
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(listeners), metrics.clone(), 0));
    let serve = tokio::spawn(async move { dispatcher.serve_one(&accept, StreamId(0)).await });
    (port, metrics, serve)
}

fn probe_config(port: u16, mode: InstMode, object_type: ObjectType) -> ProbeConfig {
    ProbeConfig {
        port,
        mode,
        object_type,
        ..ProbeConfig::default()
    }
}

/// Scenario: one method, three basic blocks, entered once in coverage mode.
/// The wire carries a single batch and the trace file shows `2 E0`.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_method_coverage_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.tr");
    let mut listeners = ListenerSet::new(false);
    listeners.register(CoverageListener::new(
        ObjectType::Block,
        vec!["Basic".into()],
        path.clone(),
        false,
    ));
    let (port, metrics, serve) = start_dispatcher(listeners).await;

    tokio::task::spawn_blocking(move || {
        let probe = Probe::connect(probe_config(port, InstMode::OptNormal, ObjectType::Block))
            .expect("probe connects");
        // What the rewritten method does: fetch the array at entry, then
        // store the Code witness at each block's index.
        let array = probe.object_array("demo.Target.run()V", 3);
        for index in 0..3 {
            array.set(index, BlockType::Code.code());
        }
        probe.shutdown();
    })
    .await
    .unwrap();

    serve.await.unwrap().unwrap();
    assert_eq!(metrics.streams_committed(), 1);

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("3 1 1 Basic"), "header missing in: {text}");
    assert!(text.contains("1 \"demo.Target.run()V\" 3"));
    assert!(text.contains("2 E0"));
}

/// Scenario: an if taken each way across two appended runs; the final trace
/// has both branch bits set.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn appended_runs_accumulate_branch_coverage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.tr");

    for taken_id in [1u32, 2u32] {
        let mut listeners = ListenerSet::new(false);
        listeners.register(CoverageListener::new(
            ObjectType::Branch,
            vec!["If".into()],
            path.clone(),
            true,
        ));
        let (port, _metrics, serve) = start_dispatcher(listeners).await;
        tokio::task::spawn_blocking(move || {
            let probe =
                Probe::connect(probe_config(port, InstMode::OptNormal, ObjectType::Branch))
                    .expect("probe connects");
            let array = probe.object_array("demo.Target.choose(I)V", 2);
            array.set(taken_id as usize - 1, BranchType::If.code());
            probe.shutdown();
        })
        .await
        .unwrap();
        serve.await.unwrap().unwrap();
    }

    let merged = TraceFile::read(&path).unwrap();
    let trace = &merged.methods["demo.Target.choose(I)V"];
    assert!(trace.get(1), "true branch lost after append");
    assert!(trace.get(2), "false branch lost after append");
}

/// Scenario: the subject throws an exception no precise edge models. The
/// summary exit is witnessed, the precise throw edge is not.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unmatched_exception_marks_the_summary_exit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.tr");
    let mut listeners = ListenerSet::new(false);
    listeners.register(CoverageListener::new(
        ObjectType::Block,
        vec!["Basic".into(), "Exit".into()],
        path.clone(),
        false,
    ));
    let (port, _metrics, serve) = start_dispatcher(listeners).await;

    tokio::task::spawn_blocking(move || {
        let probe = Probe::connect(probe_config(port, InstMode::OptNormal, ObjectType::Block))
            .expect("probe connects");
        let array = probe.object_array("demo.Target.boom()V", 9);
        // The dispatch chain tests the ArithmeticException edge (exit id 7),
        // fails to match the thrown IndexOutOfBoundsException, and leaves
        // the suppress flag at zero; the summary wrapper marks exit id 9.
        array.set(8, BlockType::Exit.code());
        probe.shutdown();
    })
    .await
    .unwrap();
    serve.await.unwrap().unwrap();

    let file = TraceFile::read(&path).unwrap();
    let trace = &file.methods["demo.Target.boom()V"];
    assert!(trace.get(9), "summary exit not witnessed");
    assert!(!trace.get(7), "precise edge wrongly witnessed");
}

/// Scenario: 16 385 sequence events overflow the 16 384-slot buffer exactly
/// once; the receiver reconstructs every id in program order.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequence_overflow_flushes_once_and_preserves_order() {
    let recorder = Arc::new(Recorder::default());
    let mut listeners = ListenerSet::new(false);
    listeners.register(SharedRecorder(recorder.clone()));
    let (port, metrics, serve) = start_dispatcher(listeners).await;

    const EVENTS: usize = 16_385;
    tokio::task::spawn_blocking(move || {
        let probe =
            Probe::connect(probe_config(port, InstMode::OptSequence, ObjectType::Block))
                .expect("probe connects");
        probe.sequence_enter("demo.Target.spin()V", 3);
        for i in 0..EVENTS {
            let id = (i % 3) as u32 + 1;
            let packed = ObjectId::pack(BlockType::Code.code() as u32, id).unwrap();
            probe.sequence_append(packed.raw() as i32);
        }
        probe.shutdown();
    })
    .await
    .unwrap();
    serve.await.unwrap().unwrap();

    // One auto-flush mid-run plus the final drain.
    assert_eq!(metrics.frames_total(), 2);

    let lines = recorder.take();
    assert_eq!(lines[0], "enter demo.Target.spin()V 3");
    let events: Vec<&String> = lines
        .iter()
        .filter(|l| l.starts_with('B'))
        .collect();
    assert_eq!(events.len(), EVENTS);
    for (i, line) in events.iter().enumerate() {
        let expected = format!("B{}", (i % 3) + 1);
        assert_eq!(**line, expected, "event {i} out of order");
    }
    assert_eq!(lines.last().map(String::as_str), Some("commit"));
}

/// Scenario: the listener requires coverage mode but the subject declares
/// hashing. The host rejects the mode byte and the probe reports rejection.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mode_mismatch_is_rejected_at_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let mut listeners = ListenerSet::new(false);
    listeners.register(CoverageListener::new(
        ObjectType::Block,
        vec!["Basic".into()],
        dir.path().join("run.tr"),
        false,
    ));
    let (port, metrics, serve) = start_dispatcher(listeners).await;

    let probe_result = tokio::task::spawn_blocking(move || {
        Probe::connect(probe_config(port, InstMode::TraceHashing, ObjectType::Block))
    })
    .await
    .unwrap();

    match probe_result {
        Err(ProbeError::Rejected { object_ok, mode_ok }) => {
            assert!(object_ok);
            assert!(!mode_ok);
        }
        Err(other) => panic!("expected rejection, got {other}"),
        Ok(_) => panic!("expected rejection, got an accepted probe"),
    }
    assert!(serve.await.unwrap().is_err());
    assert_eq!(metrics.handshakes_rejected(), 1);
    assert_eq!(metrics.streams_committed(), 0);
}

/// The signal side channel: the host advertises a port, the probe connects
/// and echoes pings from its daemon thread.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signal_socket_echoes_pings() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let accept = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = accept.local_addr().unwrap().port();

    let host = tokio::spawn(async move {
        let (mut socket, _) = accept.accept().await.unwrap();
        let mut hello = [0u8; 8];
        socket.read_exact(&mut hello).await.unwrap();
        // Accept both bytes.
        socket.write_all(&[0, 0]).await.unwrap();
        let signal_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let signal_port = signal_listener.local_addr().unwrap().port() as i32;
        socket.write_all(&signal_port.to_be_bytes()).await.unwrap();
        let (mut signal, _) = signal_listener.accept().await.unwrap();
        let mut capacity = [0u8; 4];
        socket.read_exact(&mut capacity).await.unwrap();

        signal.write_all(&[0x2a]).await.unwrap();
        let mut echo = [0u8; 1];
        signal.read_exact(&mut echo).await.unwrap();
        echo[0]
    });

    let probe = tokio::task::spawn_blocking(move || {
        let mut config = probe_config(port, InstMode::Compatible, ObjectType::Block);
        config.wants_signal = true;
        Probe::connect(config).expect("probe connects")
    })
    .await
    .unwrap();

    assert_eq!(host.await.unwrap(), 0x2a);
    probe.shutdown();
}

/// Instrument a straight-line method in sequence mode, replay the spliced
/// probe calls in layout order, and check the dispatcher reconstructs the
/// same entities. Ties the rewriter, the probe, and the receive loop
/// together over one wire.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn instrumented_method_replays_through_the_wire() {
    use tracery_instrument::{
        Cfg, CfgBlock, CfgSet, Insn, InstrumentOptions, Instrumentor, Method, MethodAccess,
        MethodBody, Unit, UnitKind,
    };
    use tracery_wire::BlockSubType;

    const SIG: &str = "demo.Target.run()V";
    let block = |id, block_type, span: (usize, usize), successors, predecessors| CfgBlock {
        id,
        block_type,
        subtype: BlockSubType::Other,
        start_offset: span.0,
        end_offset: span.1,
        successors,
        predecessors,
    };
    let cfg = Cfg {
        signature: SIG.into(),
        highest_block_id: 5,
        blocks: vec![
            block(1, BlockType::Code, (0, 0), vec![1], vec![3]),
            block(2, BlockType::Code, (1, 1), vec![2], vec![0]),
            block(3, BlockType::Code, (2, 3), vec![4], vec![1]),
            block(4, BlockType::Entry, (0, 0), vec![0], vec![]),
            block(5, BlockType::Exit, (3, 3), vec![], vec![2]),
        ],
        edges: vec![],
    };
    let mut cfgs = CfgSet::new();
    cfgs.insert(cfg);

    let mut options = InstrumentOptions::new(InstMode::OptSequence, ObjectType::Block);
    options.blocks.insert(BlockType::Code);
    let mut unit = Unit {
        name: "demo.Target".into(),
        kind: UnitKind::Class,
        methods: vec![Method {
            signature: SIG.into(),
            access: MethodAccess::default(),
            body: Some(MethodBody {
                insns: vec![
                    Insn::Nop,
                    Insn::Nop,
                    Insn::Nop,
                    Insn::Return { with_value: false },
                ],
                exceptions: vec![],
                max_locals: 0,
                max_stack: 0,
            }),
        }],
    };
    Instrumentor::new(&cfgs, options)
        .instrument_unit(&mut unit)
        .unwrap();
    let body = unit.methods[0].body.clone().unwrap();

    let recorder = Arc::new(Recorder::default());
    let mut listeners = ListenerSet::new(false);
    listeners.register(SharedRecorder(recorder.clone()));
    let (port, _metrics, serve) = start_dispatcher(listeners).await;

    // A straight-line body executes in layout order, so replaying the
    // spliced calls in that order is exactly what the subject would do.
    tokio::task::spawn_blocking(move || {
        let probe =
            Probe::connect(probe_config(port, InstMode::OptSequence, ObjectType::Block))
                .expect("probe connects");
        for (i, insn) in body.insns.iter().enumerate() {
            let Insn::Invoke(call) = insn else { continue };
            match call.target.as_str() {
                "tracery_probe_sequence_enter" => {
                    let Insn::PushStr(sig) = &body.insns[i - 2] else {
                        panic!("no signature before enter");
                    };
                    let Insn::PushInt(count) = body.insns[i - 1] else {
                        panic!("no count before enter");
                    };
                    probe.sequence_enter(sig, count);
                }
                "tracery_probe_sequence_append" => {
                    let Insn::PushInt(packed) = body.insns[i - 1] else {
                        panic!("no packed id before append");
                    };
                    probe.sequence_append(packed);
                }
                other => panic!("unexpected probe call {other}"),
            }
        }
        probe.shutdown();
    })
    .await
    .unwrap();
    serve.await.unwrap().unwrap();

    assert_eq!(
        recorder.take(),
        vec![
            "enter demo.Target.run()V 5",
            "B1",
            "B2",
            "B3",
            "X5",
            "commit"
        ]
    );
}

/// A probe built over a memory sink exercises the cache growth scenario:
/// 120 live recursive signatures never lose coverage.
#[tokio::test]
async fn recursion_depth_exceeding_the_cache_keeps_all_methods() {
    struct AllLive;
    impl StackScanner for AllLive {
        fn frames(&self) -> Vec<String> {
            (0..120).map(|i| format!("demo.Deep.level{i}")).collect()
        }
    }

    let sink = Arc::new(tracery_probe::MemorySink::new());
    let probe = Probe::with_sink(
        probe_config(0, InstMode::OptNormal, ObjectType::Block),
        sink.clone(),
        Box::new(AllLive),
    );
    for i in 0..120 {
        let array = probe.object_array(&format!("demo.Deep.level{i}()V"), 1);
        array.set(0, BlockType::Code.code());
    }
    probe.shutdown();

    let mut seen = std::collections::BTreeSet::new();
    for payload in sink.take() {
        if let tracery_wire::Payload::Coverage(batch) = payload {
            for method in batch.methods {
                assert_eq!(method.data, vec![BlockType::Code.code()]);
                seen.insert(method.signature);
            }
        }
    }
    assert_eq!(seen.len(), 120, "coverage lost during recursion");
}
