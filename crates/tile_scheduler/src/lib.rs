//! Priority-ordered async dispatch of tile renders. Preferred form is a pool
//! of worker threads; if worker creation fails, dispatch falls back to a
//! cooperative main-loop batch of bounded size per tick. See spec.md §4.5.
//!
//! No cyclic ownership (spec.md §9): the scheduler holds no reference to the
//! `TileCache` at all. It reports completed renders back through
//! `poll_completed`, which the orchestrator calls once per tick and applies
//! to the cache itself.

use scene_protocol::{Document, PageBackgroundRenderer, PageLayout, StrokeId, StrokeRenderer};
use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use tile_renderer::RenderContext;
use tile_types::{TileEntry, TileFreshness, TileKey, ZoomBand};

/// One tile render request, fully self-contained: everything a worker (or
/// the fallback loop) needs to reproduce `render_tile`'s output without
/// touching the cache or the spatial index.
#[derive(Debug, Clone)]
pub struct TileJob {
    pub key: TileKey,
    pub world_bounds: scene_protocol::WorldRect,
    pub band: ZoomBand,
    pub tile_physical: u32,
    pub scale: f64,
    /// Pre-queried on the orchestrator thread, per spec.md §4.5 — workers do
    /// not share the spatial index.
    pub stroke_ids: Vec<StrokeId>,
    pub is_dark_mode: bool,
}

/// A finished render, ready to be moved into the cache by the orchestrator.
pub struct TileJobResult {
    pub key: TileKey,
    pub band: ZoomBand,
    pub pixels: scene_protocol::RasterSurface,
    pub stroke_ids: Vec<StrokeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    WorkerPool { worker_count: usize },
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// Tiles rendered per `poll_completed` tick in fallback mode.
    pub fallback_batch_size: usize,
    /// Test/diagnostic hook: skip worker-thread creation and go straight to
    /// the cooperative fallback, mirroring the "worker-creation failure"
    /// path of spec.md §7 without needing to actually starve the OS of
    /// threads.
    pub force_fallback: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fallback_batch_size: 4,
            force_fallback: false,
        }
    }
}

struct DocSnapshot {
    document: Document,
    page_layout: PageLayout,
}

enum ControlMessage {
    DocSync(Arc<DocSnapshot>),
    Shutdown,
}

struct RawResult {
    key: TileKey,
    band: ZoomBand,
    pixels: scene_protocol::RasterSurface,
    stroke_ids: Vec<StrokeId>,
    epoch: u64,
}

struct WorkerPoolState {
    job_sender: crossbeam_channel::Sender<(TileJob, u64)>,
    control_senders: Vec<crossbeam_channel::Sender<ControlMessage>>,
    result_receiver: crossbeam_channel::Receiver<RawResult>,
    handles: Vec<JoinHandle<()>>,
}

enum Backend {
    WorkerPool(WorkerPoolState),
    Fallback {
        queue: VecDeque<TileJob>,
        doc: Arc<DocSnapshot>,
    },
}

pub struct TileScheduler {
    config: SchedulerConfig,
    backend: Backend,
    in_flight: HashSet<TileKey>,
    cancel_epoch: Arc<AtomicU64>,
    doc_version: u64,
    stroke_renderer: Arc<dyn StrokeRenderer>,
    page_background_renderer: Arc<dyn PageBackgroundRenderer>,
}

impl TileScheduler {
    pub fn new(
        config: SchedulerConfig,
        stroke_renderer: Arc<dyn StrokeRenderer>,
        page_background_renderer: Arc<dyn PageBackgroundRenderer>,
    ) -> Self {
        let cancel_epoch = Arc::new(AtomicU64::new(0));
        let empty_doc = Arc::new(DocSnapshot {
            document: Document::default(),
            page_layout: PageLayout::default(),
        });

        let backend = if config.force_fallback {
            tracing::warn!("tile_scheduler: forced fallback mode, worker pool not attempted");
            Backend::Fallback {
                queue: VecDeque::new(),
                doc: empty_doc,
            }
        } else {
            match spawn_worker_pool(&cancel_epoch, &stroke_renderer, &page_background_renderer, &empty_doc) {
                Ok(pool) => Backend::WorkerPool(pool),
                Err(error) => {
                    tracing::warn!(%error, "tile_scheduler: worker pool creation failed, falling back to cooperative main-loop dispatch");
                    Backend::Fallback {
                        queue: VecDeque::new(),
                        doc: empty_doc,
                    }
                }
            }
        };

        Self {
            config,
            backend,
            in_flight: HashSet::new(),
            cancel_epoch,
            doc_version: 0,
            stroke_renderer,
            page_background_renderer,
        }
    }

    pub fn mode(&self) -> SchedulerMode {
        match &self.backend {
            Backend::WorkerPool(pool) => SchedulerMode::WorkerPool {
                worker_count: pool.handles.len(),
            },
            Backend::Fallback { .. } => SchedulerMode::Fallback,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Pushes a new document/layout snapshot to workers, only if `version`
    /// advanced since the last sync (spec.md §4.5/§5: version-tagged,
    /// whole-snapshot replacement, not incremental diffs).
    pub fn sync_document(&mut self, version: u64, document: Document, page_layout: PageLayout) {
        if version <= self.doc_version && self.doc_version != 0 {
            return;
        }
        self.doc_version = version;
        tracing::trace!(version, "tile_scheduler: syncing document snapshot to workers");
        let snapshot = Arc::new(DocSnapshot { document, page_layout });
        match &mut self.backend {
            Backend::WorkerPool(pool) => {
                for sender in &pool.control_senders {
                    let _ = sender.send(ControlMessage::DocSync(snapshot.clone()));
                }
            }
            Backend::Fallback { doc, .. } => {
                *doc = snapshot;
            }
        }
    }

    /// Partitions `jobs` into visible-first / peripheral-second order (stable
    /// within each group), skips any key already in flight, and enqueues the
    /// rest (spec.md §4.5). Caller is expected to have already produced
    /// `jobs` in priority order (e.g. from `TileGrid::visible_tiles`); this
    /// only needs the visibility membership to partition.
    pub fn schedule(&mut self, jobs: Vec<TileJob>, visible: &HashSet<TileKey>) {
        let mut visible_first: Vec<TileJob> = Vec::new();
        let mut peripheral: Vec<TileJob> = Vec::new();
        for job in jobs {
            if self.in_flight.contains(&job.key) {
                continue;
            }
            self.in_flight.insert(job.key);
            if visible.contains(&job.key) {
                visible_first.push(job);
            } else {
                peripheral.push(job);
            }
        }
        visible_first.extend(peripheral);

        match &mut self.backend {
            Backend::WorkerPool(pool) => {
                let epoch = self.cancel_epoch.load(Ordering::SeqCst);
                for job in visible_first {
                    if pool.job_sender.send((job, epoch)).is_err() {
                        tracing::error!("tile_scheduler: worker pool job channel closed");
                    }
                }
            }
            Backend::Fallback { queue, .. } => {
                queue.extend(visible_first);
            }
        }
    }

    /// Empties the queue, drops the in-flight registry, and bumps the cancel
    /// epoch so any worker mid-render observes it between strokes and
    /// abandons its current tile (spec.md §4.5/§5).
    pub fn cancel(&mut self) {
        self.in_flight.clear();
        self.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        if let Backend::Fallback { queue, .. } = &mut self.backend {
            queue.clear();
        }
    }

    /// Drains whatever has completed since the last call.
    ///
    /// Worker-pool mode: non-blocking drain of the result channel, dropping
    /// any result whose epoch predates the current cancel epoch (a job that
    /// finished before observing a `cancel()` call).
    ///
    /// Fallback mode: synchronously renders up to
    /// `config.fallback_batch_size` queued jobs in priority order.
    pub fn poll_completed(&mut self) -> Vec<TileJobResult> {
        let current_epoch = self.cancel_epoch.load(Ordering::SeqCst);
        match &mut self.backend {
            Backend::WorkerPool(pool) => {
                let mut results = Vec::new();
                while let Ok(raw) = pool.result_receiver.try_recv() {
                    self.in_flight.remove(&raw.key);
                    if raw.epoch != current_epoch {
                        tracing::debug!(tile = ?raw.key, "tile_scheduler: dropping result from a cancelled epoch");
                        continue;
                    }
                    results.push(TileJobResult {
                        key: raw.key,
                        band: raw.band,
                        pixels: raw.pixels,
                        stroke_ids: raw.stroke_ids,
                    });
                }
                results
            }
            Backend::Fallback { queue, doc } => {
                let mut results = Vec::new();
                for _ in 0..self.config.fallback_batch_size {
                    let Some(job) = queue.pop_front() else {
                        break;
                    };
                    self.in_flight.remove(&job.key);
                    if let Some(result) =
                        render_job(&job, doc.as_ref(), &*self.stroke_renderer, &*self.page_background_renderer, &mut || false)
                    {
                        results.push(result);
                    }
                }
                results
            }
        }
    }

    /// `cancel()` followed by worker-thread teardown.
    pub fn destroy(mut self) {
        self.cancel();
        if let Backend::WorkerPool(pool) = &mut self.backend {
            for sender in &pool.control_senders {
                let _ = sender.send(ControlMessage::Shutdown);
            }
            for handle in pool.handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

fn render_job(
    job: &TileJob,
    doc: &DocSnapshot,
    stroke_renderer: &dyn StrokeRenderer,
    page_background_renderer: &dyn PageBackgroundRenderer,
    should_abort: &mut dyn FnMut() -> bool,
) -> Option<TileJobResult> {
    let mut entry = TileEntry {
        key: job.key,
        pixels: scene_protocol::RasterSurface::new(
            job.tile_physical,
            job.tile_physical,
            job.scale,
            job.world_bounds.min_x,
            job.world_bounds.min_y,
        ),
        world_bounds: job.world_bounds,
        freshness: TileFreshness::Stale(job.band),
        stroke_ids: Vec::new(),
        last_access: std::time::Instant::now(),
    };
    let ctx = RenderContext {
        document: &doc.document,
        page_layout: &doc.page_layout,
        is_dark_mode: job.is_dark_mode,
    };
    let completed = tile_renderer::render_tile_with_stroke_ids(
        &mut entry,
        &ctx,
        &job.stroke_ids,
        stroke_renderer,
        page_background_renderer,
        should_abort,
    );
    if !completed {
        return None;
    }
    Some(TileJobResult {
        key: entry.key,
        band: job.band,
        pixels: entry.pixels,
        stroke_ids: entry.stroke_ids,
    })
}

#[derive(Debug)]
struct WorkerSpawnError(std::io::Error);

impl std::fmt::Display for WorkerSpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to spawn tile render worker thread: {}", self.0)
    }
}

/// `N = clamp(available_parallelism() - 1, 2, 4)`, per spec.md §4.5.
fn worker_count() -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    cores.saturating_sub(1).clamp(2, 4)
}

fn spawn_worker_pool(
    cancel_epoch: &Arc<AtomicU64>,
    stroke_renderer: &Arc<dyn StrokeRenderer>,
    page_background_renderer: &Arc<dyn PageBackgroundRenderer>,
    initial_doc: &Arc<DocSnapshot>,
) -> Result<WorkerPoolState, WorkerSpawnError> {
    let count = worker_count();
    let (job_sender, job_receiver) = crossbeam_channel::unbounded::<(TileJob, u64)>();
    let (result_sender, result_receiver) = crossbeam_channel::unbounded::<RawResult>();

    let mut control_senders = Vec::with_capacity(count);
    let mut handles = Vec::with_capacity(count);

    for worker_index in 0..count {
        let (control_sender, control_receiver) = crossbeam_channel::unbounded::<ControlMessage>();
        let job_receiver = job_receiver.clone();
        let result_sender = result_sender.clone();
        let cancel_epoch = cancel_epoch.clone();
        let stroke_renderer = stroke_renderer.clone();
        let page_background_renderer = page_background_renderer.clone();
        let doc = Arc::new(RwLock::new(initial_doc.clone()));

        let spawned = std::thread::Builder::new()
            .name(format!("tile-render-worker-{worker_index}"))
            .spawn(move || {
                worker_loop(
                    job_receiver,
                    control_receiver,
                    result_sender,
                    cancel_epoch,
                    stroke_renderer,
                    page_background_renderer,
                    doc,
                )
            });

        match spawned {
            Ok(handle) => {
                control_senders.push(control_sender);
                handles.push(handle);
            }
            Err(io_error) => {
                for sender in &control_senders {
                    let _ = sender.send(ControlMessage::Shutdown);
                }
                for handle in handles {
                    let _ = handle.join();
                }
                return Err(WorkerSpawnError(io_error));
            }
        }
    }

    Ok(WorkerPoolState {
        job_sender,
        control_senders,
        result_receiver,
        handles,
    })
}

/// Applies every control message already queued, without blocking. The
/// orchestrator always sends a doc-sync before the jobs that depend on it
/// (spec.md §5), so draining here biases the worker toward applying a sync
/// before it would otherwise render a job racing in on the unbiased
/// `select!` below. Returns `true` if a shutdown was observed.
fn drain_pending_control(
    control_receiver: &crossbeam_channel::Receiver<ControlMessage>,
    doc: &RwLock<Arc<DocSnapshot>>,
) -> bool {
    loop {
        match control_receiver.try_recv() {
            Ok(ControlMessage::DocSync(snapshot)) => {
                *doc.write().expect("doc snapshot lock poisoned") = snapshot;
            }
            Ok(ControlMessage::Shutdown) => return true,
            Err(_) => return false,
        }
    }
}

fn worker_loop(
    job_receiver: crossbeam_channel::Receiver<(TileJob, u64)>,
    control_receiver: crossbeam_channel::Receiver<ControlMessage>,
    result_sender: crossbeam_channel::Sender<RawResult>,
    cancel_epoch: Arc<AtomicU64>,
    stroke_renderer: Arc<dyn StrokeRenderer>,
    page_background_renderer: Arc<dyn PageBackgroundRenderer>,
    doc: Arc<RwLock<Arc<DocSnapshot>>>,
) {
    loop {
        if drain_pending_control(&control_receiver, &doc) {
            return;
        }
        crossbeam_channel::select! {
            recv(control_receiver) -> msg => match msg {
                Ok(ControlMessage::DocSync(snapshot)) => {
                    *doc.write().expect("doc snapshot lock poisoned") = snapshot;
                }
                Ok(ControlMessage::Shutdown) | Err(_) => return,
            },
            recv(job_receiver) -> msg => match msg {
                Ok((job, epoch)) => {
                    if drain_pending_control(&control_receiver, &doc) {
                        return;
                    }
                    if cancel_epoch.load(Ordering::SeqCst) != epoch {
                        continue;
                    }
                    let snapshot = doc.read().expect("doc snapshot lock poisoned").clone();
                    let cancel_epoch_for_job = cancel_epoch.clone();
                    let job_key = job.key;
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        render_job(
                            &job,
                            snapshot.as_ref(),
                            &*stroke_renderer,
                            &*page_background_renderer,
                            &mut || cancel_epoch_for_job.load(Ordering::SeqCst) != epoch,
                        )
                    }));
                    match outcome {
                        Ok(Some(result)) => {
                            let _ = result_sender.send(RawResult {
                                key: result.key,
                                band: result.band,
                                pixels: result.pixels,
                                stroke_ids: result.stroke_ids,
                                epoch,
                            });
                        }
                        Ok(None) => {
                            tracing::debug!(tile = ?job_key, "tile_scheduler: worker abandoned cancelled job");
                        }
                        Err(_) => {
                            tracing::error!(tile = ?job_key, "tile_scheduler: worker render panicked, tile remains dirty");
                        }
                    }
                }
                Err(_) => return,
            },
        }
    }
}
