//! Per-thread coverage arrays and their lifecycle.
//!
//! Every thread owns a bounded cache of per-method coverage arrays. When the
//! cache would overflow, the oldest entries are scanned against the live call
//! stack: a method still on the stack keeps its array (evicting it would just
//! force a re-allocation on the next probe hit), everything else is shipped
//! and dropped. Deep recursion can pin more arrays than the bound allows; the
//! cache tracks how far over it keeps landing and grows once that passes a
//! threshold.
//!
//! A dying thread hands its cache to the exit-handler thread from its
//! thread-local destructor; the handler ships it. The final drain merges
//! whatever is left, bytewise, into one batch.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use log::{debug, warn};
use tracery_wire::{CoverageBatch, MethodCoverage, Payload};

use crate::sink::PayloadSink;

/// Per-thread cache bound before growth.
pub const THREAD_LRU_MAX: usize = 100;

/// How many of the oldest entries one eviction pass inspects, beyond the
/// victim itself.
pub const THREAD_LRU_SCAN_SIZE: usize = 15;

/// Accumulated overshoot that triggers a cache growth.
pub const THREAD_LRU_OVERMAX_THRESHOLD: usize = 25;

const CACHE_GROWTH_STEP: usize = 20;

/// One method's coverage array. Cells are atomic so a dying thread's array
/// can be read by the exit handler without a data race.
pub struct CoverageArray {
    cells: Vec<AtomicU8>,
}

impl CoverageArray {
    fn new(len: usize) -> Self {
        CoverageArray {
            cells: (0..len).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    /// Record the witnessed code for the 0-based entity index.
    pub fn set(&self, index: usize, witness: u8) {
        match self.cells.get(index) {
            Some(cell) => cell.store(witness, Ordering::Relaxed),
            None => warn!("coverage index {index} outside array of {}", self.cells.len()),
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.cells
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }
}

/// Source of the current thread's live frames, injectable for tests.
pub trait StackScanner: Send + Sync {
    fn frames(&self) -> Vec<String>;
}

/// Resolves the real call stack through the `backtrace` crate.
pub struct BacktraceScanner;

impl StackScanner for BacktraceScanner {
    fn frames(&self) -> Vec<String> {
        let mut out = Vec::new();
        backtrace::trace(|frame| {
            backtrace::resolve_frame(frame, |symbol| {
                if let Some(name) = symbol.name() {
                    out.push(name.to_string());
                }
            });
            true
        });
        out
    }
}

/// True when some live frame matches the signature's `class.method` prefix.
/// Frame names may use `::` separators; both spellings are accepted.
fn is_on_stack(frames: &[String], signature: &str) -> bool {
    let prefix = signature.split('(').next().unwrap_or(signature);
    let pathy = prefix.replace('.', "::");
    frames
        .iter()
        .any(|f| f.contains(prefix) || f.contains(&pathy))
}

/// The per-thread LRU cache.
pub struct ThreadCache {
    bound: usize,
    over_accum: usize,
    entries: HashMap<String, Arc<CoverageArray>>,
    /// Oldest first.
    order: VecDeque<String>,
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadCache {
    pub fn new() -> Self {
        ThreadCache {
            bound: THREAD_LRU_MAX,
            over_accum: 0,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    /// The per-probe-hit path: return the method's array, allocating (and
    /// possibly evicting) on a miss.
    pub fn get_or_insert(
        &mut self,
        signature: &str,
        count: usize,
        scanner: &dyn StackScanner,
        sink: &dyn PayloadSink,
    ) -> Arc<CoverageArray> {
        if let Some(array) = self.entries.get(signature) {
            let array = array.clone();
            self.touch(signature);
            return array;
        }
        if self.entries.len() >= self.bound {
            self.evict(scanner, sink);
        }
        let array = Arc::new(CoverageArray::new(count));
        self.entries.insert(signature.to_owned(), array.clone());
        self.order.push_back(signature.to_owned());
        array
    }

    fn touch(&mut self, signature: &str) {
        if let Some(at) = self.order.iter().position(|s| s == signature) {
            self.order.remove(at);
            self.order.push_back(signature.to_owned());
        }
    }

    /// Scan the victim and the oldest entries; ship what the stack no longer
    /// holds. When the cache keeps landing over its bound (deep recursion),
    /// grow it instead of thrashing.
    fn evict(&mut self, scanner: &dyn StackScanner, sink: &dyn PayloadSink) {
        let frames = scanner.frames();
        let scan = (THREAD_LRU_SCAN_SIZE + 1).min(self.order.len());
        let candidates: Vec<String> = self.order.iter().take(scan).cloned().collect();
        let mut removed = Vec::new();
        for signature in candidates {
            if is_on_stack(&frames, &signature) {
                continue;
            }
            if let Some(array) = self.entries.remove(&signature) {
                self.order.retain(|s| s != &signature);
                removed.push(MethodCoverage {
                    signature,
                    data: array.snapshot(),
                });
            }
        }
        if !removed.is_empty() {
            sink.ship(&Payload::Coverage(CoverageBatch { methods: removed }));
        }

        let new_size = self.entries.len() + 1;
        if new_size > self.bound {
            self.over_accum += new_size - self.bound;
            if self.over_accum > THREAD_LRU_OVERMAX_THRESHOLD {
                self.bound = (self.bound + CACHE_GROWTH_STEP).max(new_size);
                self.over_accum = 0;
                debug!("coverage cache grown to {} entries", self.bound);
            }
        }
    }

    pub fn snapshot_entries(&self) -> Vec<(String, Vec<u8>)> {
        self.order
            .iter()
            .filter_map(|sig| {
                self.entries
                    .get(sig)
                    .map(|array| (sig.clone(), array.snapshot()))
            })
            .collect()
    }
}

enum ExitMessage {
    Detached(Arc<Mutex<ThreadCache>>),
    Halt,
}

static RUNTIME_IDS: AtomicUsize = AtomicUsize::new(1);

struct CacheGuard {
    runtime_id: usize,
    thread: ThreadId,
    cache: Arc<Mutex<ThreadCache>>,
    registry: Arc<Mutex<HashMap<ThreadId, Arc<Mutex<ThreadCache>>>>>,
    tx: Sender<ExitMessage>,
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.remove(&self.thread);
        }
        // The exit handler ships what this thread recorded. After drain the
        // handler is gone and the send fails; the drain already merged us.
        let _ = self.tx.send(ExitMessage::Detached(self.cache.clone()));
    }
}

thread_local! {
    static THREAD_SLOT: RefCell<Option<CacheGuard>> = const { RefCell::new(None) };
}

/// The process-wide coverage machinery: registry of live thread caches plus
/// the exit-handler thread.
pub struct CoverageRuntime {
    id: usize,
    scanner: Box<dyn StackScanner>,
    registry: Arc<Mutex<HashMap<ThreadId, Arc<Mutex<ThreadCache>>>>>,
    tx: Sender<ExitMessage>,
    handler: Mutex<Option<JoinHandle<()>>>,
}

impl CoverageRuntime {
    pub fn new(scanner: Box<dyn StackScanner>, sink: Arc<dyn PayloadSink>) -> Self {
        let (tx, rx) = mpsc::channel::<ExitMessage>();
        let handler = thread::Builder::new()
            .name("tracery-exit-handler".into())
            .spawn(move || {
                while let Ok(message) = rx.recv() {
                    match message {
                        ExitMessage::Detached(cache) => {
                            let entries = match cache.lock() {
                                Ok(cache) => cache.snapshot_entries(),
                                Err(_) => continue,
                            };
                            ship_entries(entries, sink.as_ref());
                        }
                        ExitMessage::Halt => break,
                    }
                }
            })
            .expect("spawn exit handler");
        CoverageRuntime {
            id: RUNTIME_IDS.fetch_add(1, Ordering::Relaxed),
            scanner,
            registry: Arc::new(Mutex::new(HashMap::new())),
            tx,
            handler: Mutex::new(Some(handler)),
        }
    }

    /// The `object_array` probe entry: per-thread cache lookup.
    pub fn object_array(
        &self,
        signature: &str,
        count: usize,
        sink: &dyn PayloadSink,
    ) -> Arc<CoverageArray> {
        THREAD_SLOT.with(|slot| {
            let mut slot = slot.borrow_mut();
            let stale = slot
                .as_ref()
                .map(|guard| guard.runtime_id != self.id)
                .unwrap_or(true);
            if stale {
                let cache = Arc::new(Mutex::new(ThreadCache::new()));
                let thread = thread::current().id();
                if let Ok(mut registry) = self.registry.lock() {
                    registry.insert(thread, cache.clone());
                }
                *slot = Some(CacheGuard {
                    runtime_id: self.id,
                    thread,
                    cache,
                    registry: self.registry.clone(),
                    tx: self.tx.clone(),
                });
            }
            let guard = slot.as_ref().expect("cache guard just installed");
            let mut cache = guard.cache.lock().expect("thread cache lock");
            cache.get_or_insert(signature, count, self.scanner.as_ref(), sink)
        })
    }

    /// Stop the exit handler, merge every remaining cache bytewise, and ship
    /// the result as one signature-ordered batch.
    pub fn drain(&self, sink: &dyn PayloadSink) {
        let _ = self.tx.send(ExitMessage::Halt);
        if let Some(handle) = self.handler.lock().ok().and_then(|mut h| h.take()) {
            if handle.join().is_err() {
                warn!("exit handler ended abnormally");
            }
        }

        let caches: Vec<Arc<Mutex<ThreadCache>>> = match self.registry.lock() {
            Ok(mut registry) => registry.drain().map(|(_, c)| c).collect(),
            Err(_) => return,
        };
        let mut merged: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for cache in caches {
            let entries = match cache.lock() {
                Ok(cache) => cache.snapshot_entries(),
                Err(_) => continue,
            };
            for (signature, data) in entries {
                let out = merged.entry(signature).or_default();
                if out.len() < data.len() {
                    out.resize(data.len(), 0);
                }
                for (o, i) in out.iter_mut().zip(data) {
                    *o |= i;
                }
            }
        }
        if merged.is_empty() {
            return;
        }
        let methods = merged
            .into_iter()
            .map(|(signature, data)| MethodCoverage { signature, data })
            .collect();
        sink.ship(&Payload::Coverage(CoverageBatch { methods }));
    }
}

fn ship_entries(entries: Vec<(String, Vec<u8>)>, sink: &dyn PayloadSink) {
    if entries.is_empty() {
        return;
    }
    let methods = entries
        .into_iter()
        .map(|(signature, data)| MethodCoverage { signature, data })
        .collect();
    sink.ship(&Payload::Coverage(CoverageBatch { methods }));
}
