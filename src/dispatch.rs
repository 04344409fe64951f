//! Splits the photon count over workers, runs the per-photon engine on
//! scoped threads, and merges the outputs. Photon RNG streams are keyed
//! by the global photon index, so the physics is independent of how the
//! split lands; only float summation order varies with the worker count.

use crate::accum::{self, Field, FieldSink};
use crate::config::Config;
use crate::detector::{DetectorBank, PartialPath};
use crate::math::random::RAND_STATE_WORDS;
use crate::mesh::TetMesh;
use crate::photon::{self, Fate};
use crate::tracer::RayTracer;

use crossbeam::thread;
use log::{debug, info};
use simple_error::{bail, SimpleResult};

use std::sync::atomic::{AtomicBool, Ordering};

// A worker raises the shared error flag once this many of its photons
// errored out and they dominate its chunk; the mesh is then presumed
// broken and the batch is cut short.
const ERROR_FLAG_MIN: u64 = 1000;

/// Batch-wide weight and count totals, summed over workers.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunTotals {
    pub launched_weight: f64,
    pub absorbed_weight: f64,
    pub escaped_weight: f64,
    /// Weight dropped by roulette kills, timeouts and errors.
    pub residual_weight: f64,
    pub errored: u64,
    pub lost: u64,
}

impl RunTotals {
    fn merge(&mut self, o: &RunTotals) {
        self.launched_weight += o.launched_weight;
        self.absorbed_weight += o.absorbed_weight;
        self.escaped_weight += o.escaped_weight;
        self.residual_weight += o.residual_weight;
        self.errored += o.errored;
        self.lost += o.lost;
    }
}

/// Everything one batch produces.
pub struct RunResult {
    /// Row-major `gates x sites` field.
    pub field: Vec<f64>,
    pub gates: usize,
    pub sites: usize,
    /// Stored detected-photon records, `reclen` floats each.
    pub detected: Vec<f32>,
    pub reclen: usize,
    /// Initial RNG states of the stored detected photons.
    pub seeds: Vec<[u64; RAND_STATE_WORDS]>,
    /// All detector hits, including records dropped on overflow.
    pub detected_total: usize,
    pub totals: RunTotals,
}

// The photon loop one worker runs over its contiguous id range.
#[allow(clippy::too_many_arguments)]
fn worker_loop(
    start: u64,
    count: u64,
    cfg: &Config,
    mesh: &TetMesh,
    tracer: &RayTracer,
    bank: &DetectorBank,
    sink: &mut FieldSink,
    sites: usize,
    error_flag: &AtomicBool,
) -> RunTotals {
    let mut partial = PartialPath::new(mesh.media.len() - 1);
    let mut totals = RunTotals::default();
    for id in start..start + count {
        if error_flag.load(Ordering::Relaxed) {
            break;
        }
        let o = photon::track_one(id, cfg, mesh, tracer, sink, sites, bank, &mut partial);
        totals.launched_weight += o.launched;
        totals.absorbed_weight += o.absorbed;
        totals.escaped_weight += o.escaped;
        totals.residual_weight += o.residual;
        match o.fate {
            Fate::Errored => {
                totals.errored += 1;
                if totals.errored >= ERROR_FLAG_MIN && totals.errored * 10 >= count {
                    error_flag.store(true, Ordering::Relaxed);
                }
            }
            Fate::Lost => totals.lost += 1,
            _ => {}
        }
    }
    totals
}

/// Runs a full batch: validates, splits `nphoton` over the workers,
/// tracks every photon, reduces the outputs and (optionally) normalizes
/// the field. Returns the field, the detected-photon records and seeds,
/// and the energy totals.
pub fn run(mesh: &TetMesh, cfg: &Config) -> SimpleResult<RunResult> {
    cfg.validate(mesh)?;
    // The neighbor tables are re-checked before every batch; a stale
    // entry would send photons into the wrong element silently.
    mesh.check_conformity()?;

    let gates = cfg.gates();
    let sites = accum::site_count(cfg, mesh);
    let tracer = RayTracer::new(mesh, cfg.method);
    let bank = DetectorBank::new(cfg, mesh.media.len() - 1);
    let error_flag = AtomicBool::new(false);

    let workers = if cfg.num_workers > 0 {
        cfg.num_workers
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    };
    let workers = workers.max(1).min(cfg.nphoton as usize);

    // Bind workers to cores when there are enough of them; otherwise let
    // the scheduler sort it out:
    let (bind_threads, core_ids) = match core_affinity::get_core_ids() {
        Some(ids) => {
            if ids.len() < workers {
                (false, Vec::new())
            } else {
                (true, ids)
            }
        }
        _ => (false, Vec::new()),
    };
    let core_ids_ref = &core_ids;

    // Contiguous photon-id chunks, remainder spread over the first few:
    let chunk = cfg.nphoton / (workers as u64);
    let rem = cfg.nphoton % (workers as u64);
    let range_of = |k: u64| {
        let start = k * chunk + k.min(rem);
        let count = chunk + if k < rem { 1 } else { 0 };
        (start, count)
    };

    info!(
        "dispatching {} photons over {} workers ({} gates, {} sites)",
        cfg.nphoton, workers, gates, sites
    );

    let cfg_ref = &*cfg;
    let mesh_ref = &*mesh;
    let tracer_ref = &tracer;
    let bank_ref = &bank;
    let error_ref = &error_flag;

    let mut totals = RunTotals::default();
    let mut field;

    if cfg.is_atomic {
        let shared = Field::new(gates, sites);
        let shared_ref = &shared;
        let scope_result = thread::scope(|s| {
            let mut handles = Vec::with_capacity(workers - 1);
            for k in 1..workers as u64 {
                let (start, count) = range_of(k);
                handles.push(s.spawn(move |_| {
                    if bind_threads {
                        core_affinity::set_for_current(core_ids_ref[k as usize]);
                    }
                    let mut sink = FieldSink::Shared(shared_ref);
                    worker_loop(
                        start, count, cfg_ref, mesh_ref, tracer_ref, bank_ref, &mut sink,
                        sites, error_ref,
                    )
                }));
            }

            // The main thread is always worker 0:
            if bind_threads {
                core_affinity::set_for_current(core_ids_ref[0]);
            }
            let (start, count) = range_of(0);
            let mut sink = FieldSink::Shared(shared_ref);
            let mut all = vec![worker_loop(
                start, count, cfg_ref, mesh_ref, tracer_ref, bank_ref, &mut sink, sites,
                error_ref,
            )];
            for h in handles {
                match h.join() {
                    Ok(t) => all.push(t),
                    Err(_) => error_ref.store(true, Ordering::Relaxed),
                }
            }
            all
        });
        let worker_totals = match scope_result {
            Ok(t) => t,
            Err(_) => bail!("a worker thread panicked during the batch"),
        };
        for t in worker_totals.iter() {
            totals.merge(t);
        }
        field = shared.snapshot();
    } else {
        let scope_result = thread::scope(|s| {
            let mut handles = Vec::with_capacity(workers - 1);
            for k in 1..workers as u64 {
                let (start, count) = range_of(k);
                handles.push(s.spawn(move |_| {
                    if bind_threads {
                        core_affinity::set_for_current(core_ids_ref[k as usize]);
                    }
                    let mut local = vec![0.0f64; gates * sites];
                    let t = {
                        let mut sink = FieldSink::Private(&mut local);
                        worker_loop(
                            start, count, cfg_ref, mesh_ref, tracer_ref, bank_ref, &mut sink,
                            sites, error_ref,
                        )
                    };
                    (t, local)
                }));
            }

            if bind_threads {
                core_affinity::set_for_current(core_ids_ref[0]);
            }
            let (start, count) = range_of(0);
            let mut local = vec![0.0f64; gates * sites];
            let t = {
                let mut sink = FieldSink::Private(&mut local);
                worker_loop(
                    start, count, cfg_ref, mesh_ref, tracer_ref, bank_ref, &mut sink, sites,
                    error_ref,
                )
            };
            let mut all = vec![(t, local)];
            for h in handles {
                match h.join() {
                    Ok(r) => all.push(r),
                    Err(_) => error_ref.store(true, Ordering::Relaxed),
                }
            }
            all
        });
        let worker_results = match scope_result {
            Ok(r) => r,
            Err(_) => bail!("a worker thread panicked during the batch"),
        };
        // Element-wise reduction of the private copies, in worker order
        // so a fixed split is bit-reproducible:
        field = vec![0.0f64; gates * sites];
        for (t, local) in worker_results.iter() {
            totals.merge(t);
            for (dst, src) in field.iter_mut().zip(local.iter()) {
                *dst += *src;
            }
        }
    }

    if error_flag.load(Ordering::Relaxed) {
        bail!(
            "batch aborted by the worker error flag ({} errored photons)",
            totals.errored
        );
    }

    debug!(
        "batch done: launched {:.6}, absorbed {:.6}, escaped {:.6}, {} errored, {} lost",
        totals.launched_weight,
        totals.absorbed_weight,
        totals.escaped_weight,
        totals.errored,
        totals.lost
    );

    if cfg.is_normalized {
        accum::normalize(&mut field, cfg, mesh, totals.launched_weight);
    }

    let reclen = bank.reclen();
    let (detected, seeds, detected_total) = bank.finish();

    Ok(RunResult {
        field,
        gates,
        sites,
        detected,
        reclen,
        seeds,
        detected_total,
        totals,
    })
}
