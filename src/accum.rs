//! The time-gated fluence/energy field. Sites are elements (constant
//! basis), nodes (linear basis) or Cartesian voxels (grid method); the
//! buffer is laid out row-major, gate then site.
//!
//! Two accumulation modes: a shared buffer with CAS-loop float adds on the
//! bit pattern, or per-worker private buffers reduced by the dispatcher.

use crate::config::{BasisOrder, Config, OutputType, RayMethod};
use crate::mesh::TetMesh;

use std::sync::atomic::{AtomicU64, Ordering};

/// The shared accumulation buffer. `f64` sums carried in `AtomicU64` bit
/// patterns; adds are lock-free CAS loops.
pub struct Field {
    data: Vec<AtomicU64>,
    gates: usize,
    sites: usize,
}

impl Field {
    pub fn new(gates: usize, sites: usize) -> Self {
        let mut data = Vec::with_capacity(gates * sites);
        data.resize_with(gates * sites, || AtomicU64::new(0f64.to_bits()));
        Field { data, gates, sites }
    }

    pub fn gates(&self) -> usize {
        self.gates
    }

    pub fn sites(&self) -> usize {
        self.sites
    }

    /// Atomically adds `val` to the `(gate, site)` cell.
    pub fn add(&self, gate: usize, site: usize, val: f64) {
        let cell = &self.data[gate * self.sites + site];
        let mut old = cell.load(Ordering::Relaxed);
        loop {
            let new = (f64::from_bits(old) + val).to_bits();
            match cell.compare_exchange_weak(old, new, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                // Someone else changed the value, try again from theirs:
                Err(i) => old = i,
            }
        }
    }

    /// Copies the sums out into a plain buffer.
    pub fn snapshot(&self) -> Vec<f64> {
        self.data
            .iter()
            .map(|cell| f64::from_bits(cell.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Where a worker deposits: the shared atomic field, or its own private
/// copy that the dispatcher reduces at the end of the batch.
pub enum FieldSink<'a> {
    Shared(&'a Field),
    Private(&'a mut [f64]),
}

impl<'a> FieldSink<'a> {
    /// Adds `val` at `(gate, site)`; `sites` is the site count of the
    /// field layout.
    pub fn add(&mut self, gate: usize, site: usize, sites: usize, val: f64) {
        match self {
            FieldSink::Shared(field) => field.add(gate, site, val),
            FieldSink::Private(buf) => buf[gate * sites + site] += val,
        }
    }
}

/// The number of accumulation sites for this configuration.
pub fn site_count(cfg: &Config, mesh: &TetMesh) -> usize {
    if cfg.method == RayMethod::Grid {
        if let Some(grid) = &cfg.grid {
            return grid.num_voxels();
        }
    }
    match cfg.basis {
        BasisOrder::Element => mesh.num_elems(),
        BasisOrder::Node => mesh.num_nodes(),
    }
}

/// Maps one step's absorption onto the configured output quantity.
///
/// `w` is the weight entering the step, `de` the energy deposited over
/// length `l`, `w0` the launch weight and `nscat` the scatter count so
/// far. Flux and jacobian divide by the local absorption; the weighted
/// replay outputs accumulate pathlength/scatter moments instead of the
/// deposit.
pub fn contribution(
    output: OutputType,
    w: f64,
    de: f64,
    mua: f64,
    l: f64,
    w0: f64,
    nscat: u64,
) -> f64 {
    match output {
        OutputType::Energy | OutputType::Fluence => de,
        OutputType::Flux | OutputType::Jacobian => {
            if mua > f64::EPSILON {
                de / mua
            } else {
                // The mua -> 0 limit of (1 - exp(-mua l)) / mua:
                w * l
            }
        }
        OutputType::WeightedPath => w0 * l,
        OutputType::WeightedScatter => w0 * l * (nscat as f64),
    }
}

/// Scales the reduced field by the batch normalizer: energy-type outputs
/// by the launched weight, fluence-type outputs additionally by the gate
/// width and the per-site volume.
pub fn normalize(field: &mut [f64], cfg: &Config, mesh: &TetMesh, launched: f64) {
    if launched <= 0.0 {
        return;
    }
    let gates = cfg.gates();
    let sites = field.len() / gates.max(1);
    let inv_launched = 1.0 / launched;

    match cfg.output {
        OutputType::Energy | OutputType::WeightedPath | OutputType::WeightedScatter => {
            for x in field.iter_mut() {
                *x *= inv_launched;
            }
        }
        OutputType::Flux | OutputType::Fluence | OutputType::Jacobian => {
            let base = inv_launched / cfg.tstep;
            if cfg.method == RayMethod::Grid {
                let dstep = match &cfg.grid {
                    Some(grid) => grid.dstep,
                    None => return,
                };
                // Voxel volume is dstep^-3:
                let scale = base * dstep * dstep * dstep;
                for x in field.iter_mut() {
                    *x *= scale;
                }
                return;
            }
            for g in 0..gates {
                for s in 0..sites {
                    let vol = match cfg.basis {
                        BasisOrder::Element => mesh.evol[s],
                        BasisOrder::Node => mesh.nvol[s],
                    };
                    if vol > 0.0 {
                        field[g * sites + s] *= base / vol;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crossbeam::thread;

    #[test]
    fn test_add_and_snapshot() {
        let field = Field::new(2, 3);
        field.add(0, 1, 0.5);
        field.add(0, 1, 0.25);
        field.add(1, 2, 1.0);
        let snap = field.snapshot();
        assert_eq!(snap.len(), 6);
        assert!((snap[1] - 0.75).abs() < 1e-15);
        assert!((snap[5] - 1.0).abs() < 1e-15);
    }

    #[test]
    fn test_concurrent_adds_sum() {
        let field = Field::new(1, 1);
        let num_threads = 8;
        let adds_per_thread = 10_000;
        thread::scope(|s| {
            for _ in 0..num_threads {
                s.spawn(|_| {
                    for _ in 0..adds_per_thread {
                        field.add(0, 0, 1.0);
                    }
                });
            }
        })
        .unwrap();
        let total = field.snapshot()[0];
        assert_eq!(total, (num_threads * adds_per_thread) as f64);
    }

    #[test]
    fn test_contribution_flux_divides_mua() {
        let de = 0.1;
        let c = contribution(OutputType::Flux, 1.0, de, 0.05, 2.0, 1.0, 0);
        assert!((c - de / 0.05).abs() < 1e-12);
        // And falls back to the limit when mua vanishes:
        let c0 = contribution(OutputType::Flux, 1.0, 0.0, 0.0, 2.0, 1.0, 0);
        assert!((c0 - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_private_sink_indexing() {
        let mut buf = vec![0.0; 6];
        {
            let mut sink = FieldSink::Private(&mut buf);
            sink.add(1, 2, 3, 2.5);
        }
        assert_eq!(buf[5], 2.5);
    }
}
