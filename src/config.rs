//! The read-only configuration record handed to the dispatcher, plus the
//! enumerations it is built from. External collaborators parse session
//! files (JSON or otherwise) straight into these types; `Config::validate`
//! runs every pre-dispatch check so workers never see a bad record.

use crate::math::random::RAND_STATE_WORDS;
use crate::math::vector::{Vec3, Vec4};
use crate::mesh::TetMesh;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use simple_error::{bail, SimpleResult};

/// The source models. The descriptor semantics (footprint, direction and
/// launch weight) are documented on `source::launch`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SrcType {
    Pencil,
    Isotropic,
    Cone,
    Gaussian,
    Planar,
    Pattern,
    Fourier,
    Arcsine,
    Disk,
    FourierX,
    FourierX2D,
    ZGaussian,
    Line,
    Slit,
}

/// What quantity the field accumulates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Flux,
    Fluence,
    Energy,
    Jacobian,
    /// Pathlength weighted by the replayed photon weight.
    WeightedPath,
    /// Scatter count weighted by the replayed photon weight.
    WeightedScatter,
}

/// The ray-tet stepping kernel to use. All methods produce the same tet
/// transitions on a conforming mesh; `Grid` additionally redistributes
/// deposits onto a Cartesian lattice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RayMethod {
    Plucker,
    Havel,
    Badouel,
    Branchless,
    Grid,
}

/// Which basis the field lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BasisOrder {
    /// Piecewise-constant, one site per element.
    Element,
    /// Piecewise-linear, one site per node.
    Node,
}

bitflags! {
    /// Debug trace gates. Each flag turns on one family of per-photon
    /// log lines.
    pub struct DebugFlags: u32 {
        const MOVE        = 1;
        const RAY_POLY    = 2;
        const BARY        = 4;
        const WEIGHT      = 8;
        const DIST        = 16;
        const TRACING_IN  = 32;
        const TRACING_OUT = 64;
        const EDGE        = 128;
        const ACCUM       = 256;
        const TIME        = 512;
        const REFLECT     = 1024;
        const PROGRESS    = 2048;
        const EXIT        = 4096;
    }
}

impl Default for DebugFlags {
    fn default() -> Self {
        DebugFlags::empty()
    }
}

/// A spherical detector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detector {
    pub pos: Vec3<f64>,
    pub r: f64,
}

/// The source descriptor: a type tag plus two parameter 4-vectors, with
/// an optional intensity pattern for pattern sources.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Source {
    pub kind: SrcType,
    pub pos: Vec3<f64>,
    pub dir: Vec3<f64>,
    /// Distance to the focal point along `dir`; 0 disables steering.
    pub focus: f64,
    pub param1: Vec4<f64>,
    pub param2: Vec4<f64>,
    /// Row-major `param2.w x param1.w` intensity image for `Pattern`.
    pub pattern: Option<Vec<f32>>,
}

/// Cartesian output lattice for the grid ray-tracing method.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GridSpec {
    /// Lower corner of the lattice.
    pub nmin: Vec3<f64>,
    /// Voxels per unit length; also the per-step subdivision factor.
    pub dstep: f64,
    /// Lattice extent in voxels.
    pub dims: [usize; 3],
}

impl GridSpec {
    pub fn num_voxels(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }
}

/// Saved per-photon RNG states with matching launch weights and times,
/// used to re-run detected photons deterministically.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Replay {
    pub seeds: Vec<[u64; RAND_STATE_WORDS]>,
    pub weights: Vec<f64>,
    pub times: Vec<f64>,
}

/// The full simulation configuration. Read-only once dispatch starts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Total photons to launch.
    pub nphoton: u64,
    /// 32-bit user seed combined with the photon index per stream.
    pub seed: u32,
    /// Time window start (s).
    pub tstart: f64,
    /// Time window end (s).
    pub tend: f64,
    /// Gate width (s).
    pub tstep: f64,
    /// Background refractive index outside the mesh.
    pub nout: f64,
    /// Weight threshold below which roulette runs.
    pub min_weight: f64,
    /// Roulette survival multiplier (survive with probability 1/size).
    pub roulette_size: f64,
    pub is_reflect: bool,
    pub is_normalized: bool,
    pub is_save_det: bool,
    pub is_save_exit: bool,
    pub is_save_seed: bool,
    pub is_momentum: bool,
    /// Whether time-of-flight accrues while marching through void.
    pub is_void_time: bool,
    /// Treat void elements as external detector sites.
    pub is_ext_det: bool,
    /// Shared atomic accumulation instead of per-worker copies.
    pub is_atomic: bool,
    /// 0 = none, 1 = deterministic launch Fresnel loss, 2 = additionally
    /// terminate on transmission into void.
    pub specular: u8,
    pub basis: BasisOrder,
    pub method: RayMethod,
    pub output: OutputType,
    #[serde(skip)]
    pub debug: DebugFlags,
    /// Worker count; 0 picks the available hardware parallelism.
    pub num_workers: usize,
    /// Capacity of the detected-photon buffer.
    pub max_detected: usize,
    pub source: Source,
    pub detectors: Vec<Detector>,
    /// Starting element id (1-based) for the source search.
    pub e0: u32,
    /// Candidate elements for the initial-element search; falls back to
    /// `[e0]` when empty.
    pub src_elems: Vec<u32>,
    pub grid: Option<GridSpec>,
    pub replay: Option<Replay>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            nphoton: 0,
            seed: 0x623f_9a9e,
            tstart: 0.0,
            tend: 5e-9,
            tstep: 5e-9,
            nout: 1.0,
            min_weight: 1e-6,
            roulette_size: 10.0,
            is_reflect: true,
            is_normalized: true,
            is_save_det: false,
            is_save_exit: false,
            is_save_seed: false,
            is_momentum: false,
            is_void_time: true,
            is_ext_det: false,
            is_atomic: true,
            specular: 0,
            basis: BasisOrder::Node,
            method: RayMethod::Branchless,
            output: OutputType::Flux,
            debug: DebugFlags::empty(),
            num_workers: 0,
            max_detected: 1 << 20,
            source: Source {
                kind: SrcType::Pencil,
                pos: Vec3::zero(),
                dir: Vec3 {
                    x: 0.0,
                    y: 0.0,
                    z: 1.0,
                },
                focus: 0.0,
                param1: Vec4::zero(),
                param2: Vec4::zero(),
                pattern: None,
            },
            detectors: Vec::new(),
            e0: 0,
            src_elems: Vec::new(),
            grid: None,
            replay: None,
        }
    }
}

impl Config {
    /// The number of time gates in the output field.
    pub fn gates(&self) -> usize {
        let g = ((self.tend - self.tstart) / self.tstep).ceil() as usize;
        g.max(1)
    }

    /// Width in floats of one detected-photon record: detector id,
    /// per-medium scatter counts and pathlengths, optional per-medium
    /// momentum transfer, optional exit position/direction, and the
    /// initial weight.
    pub fn reclen(&self, num_media: usize) -> usize {
        let m = num_media;
        2 + 2 * m
            + if self.is_momentum { m } else { 0 }
            + if self.is_save_exit { 6 } else { 0 }
    }

    /// The candidate elements searched for the launch position.
    pub fn source_elems(&self) -> Vec<u32> {
        if self.src_elems.is_empty() {
            vec![self.e0]
        } else {
            self.src_elems.clone()
        }
    }

    /// Runs every pre-dispatch check. All config errors surface here,
    /// before any worker starts.
    pub fn validate(&self, mesh: &TetMesh) -> SimpleResult<()> {
        if self.nphoton == 0 {
            bail!("nphoton must be positive");
        }
        if self.tstep <= 0.0 || self.tend <= self.tstart {
            bail!("the time window is empty: need tend > tstart and tstep > 0");
        }
        if (self.source.dir.length() - 1.0).abs() > 1e-6 {
            bail!("the source direction must be a unit vector");
        }
        if self.min_weight < 0.0 {
            bail!("the minimum weight cannot be negative");
        }
        if self.roulette_size <= 1.0 {
            bail!("the roulette size must exceed 1");
        }
        if self.nout < 1.0 {
            bail!("the background refractive index must be >= 1");
        }
        if self.specular > 2 {
            bail!("unknown specular mode {}", self.specular);
        }
        if self.source.kind == SrcType::Pattern {
            match &self.source.pattern {
                Some(pat) => {
                    let xs = self.source.param1.w as usize;
                    let ys = self.source.param2.w as usize;
                    if xs == 0 || ys == 0 || pat.len() != xs * ys {
                        bail!(
                            "pattern source needs a {}x{} image, got {} samples",
                            xs,
                            ys,
                            pat.len()
                        );
                    }
                }
                None => bail!("pattern source without a pattern image"),
            }
        }
        if self.method == RayMethod::Grid {
            match &self.grid {
                Some(grid) => {
                    if grid.dstep <= 0.0 || grid.num_voxels() == 0 {
                        bail!("grid method needs a positive dstep and a non-empty lattice");
                    }
                }
                None => bail!("grid method selected without a grid spec"),
            }
        }
        for elem in self.source_elems() {
            if elem == 0 || (elem as usize) > mesh.num_elems() {
                bail!("source element {} is out of range", elem);
            }
        }
        for (i, det) in self.detectors.iter().enumerate() {
            if det.r <= 0.0 {
                bail!("detector {} has a non-positive radius", i + 1);
            }
        }
        if self.is_save_det && self.max_detected == 0 {
            bail!("savedet is on but the detected-photon buffer is empty");
        }
        if let Some(replay) = &self.replay {
            let n = self.nphoton as usize;
            if replay.seeds.len() < n || replay.weights.len() < n || replay.times.len() < n {
                bail!(
                    "replay input covers {} photons but nphoton is {}",
                    replay.seeds.len().min(replay.weights.len()).min(replay.times.len()),
                    n
                );
            }
        } else if matches!(
            self.output,
            OutputType::Jacobian | OutputType::WeightedPath | OutputType::WeightedScatter
        ) {
            bail!("output type {:?} requires replay input", self.output);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Medium;

    fn test_mesh() -> TetMesh {
        let nodes = vec![
            Vec3 {
                x: 0.0,
                y: 0.0,
                z: 0.0,
            },
            Vec3 {
                x: 1.0,
                y: 0.0,
                z: 0.0,
            },
            Vec3 {
                x: 0.0,
                y: 1.0,
                z: 0.0,
            },
            Vec3 {
                x: 0.0,
                y: 0.0,
                z: 1.0,
            },
        ];
        let media = vec![
            Medium {
                mua: 0.0,
                mus: 0.0,
                g: 0.0,
                n: 1.0,
            },
            Medium {
                mua: 0.01,
                mus: 1.0,
                g: 0.9,
                n: 1.37,
            },
        ];
        TetMesh::from_components(nodes, vec![[1, 2, 3, 4]], vec![1], media).unwrap()
    }

    fn base_config() -> Config {
        let mut cfg = Config::default();
        cfg.nphoton = 100;
        cfg.e0 = 1;
        cfg.source.pos = Vec3 {
            x: 0.25,
            y: 0.25,
            z: 0.25,
        };
        cfg
    }

    #[test]
    fn test_valid_config_passes() {
        base_config().validate(&test_mesh()).unwrap();
    }

    #[test]
    fn test_gate_count() {
        let mut cfg = base_config();
        cfg.tstart = 0.0;
        cfg.tend = 5e-9;
        cfg.tstep = 1e-10;
        assert_eq!(cfg.gates(), 50);
    }

    #[test]
    fn test_reclen() {
        let mut cfg = base_config();
        assert_eq!(cfg.reclen(3), 8);
        cfg.is_momentum = true;
        assert_eq!(cfg.reclen(3), 11);
        cfg.is_save_exit = true;
        assert_eq!(cfg.reclen(3), 17);
    }

    #[test]
    fn test_rejects_non_unit_dir() {
        let mesh = test_mesh();
        let mut cfg = base_config();
        cfg.source.dir = Vec3 {
            x: 0.0,
            y: 0.0,
            z: 2.0,
        };
        assert!(cfg.validate(&mesh).is_err());
    }

    #[test]
    fn test_rejects_zero_photons() {
        let mesh = test_mesh();
        let mut cfg = base_config();
        cfg.nphoton = 0;
        assert!(cfg.validate(&mesh).is_err());
    }

    #[test]
    fn test_rejects_pattern_without_image() {
        let mesh = test_mesh();
        let mut cfg = base_config();
        cfg.source.kind = SrcType::Pattern;
        assert!(cfg.validate(&mesh).is_err());
    }

    #[test]
    fn test_rejects_jacobian_without_replay() {
        let mesh = test_mesh();
        let mut cfg = base_config();
        cfg.output = OutputType::Jacobian;
        assert!(cfg.validate(&mesh).is_err());
    }

    #[test]
    fn test_config_from_json() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "nphoton": 1000,
                "seed": 1648335518,
                "tstart": 0.0, "tend": 5e-9, "tstep": 1e-10,
                "nout": 1.0,
                "min_weight": 1e-6, "roulette_size": 10.0,
                "is_reflect": true, "is_normalized": true,
                "is_save_det": true, "is_save_exit": false,
                "is_save_seed": false, "is_momentum": false,
                "is_void_time": true, "is_ext_det": false,
                "is_atomic": true, "specular": 0,
                "basis": "node", "method": "branchless", "output": "flux",
                "num_workers": 0, "max_detected": 1000,
                "source": {
                    "kind": "pencil",
                    "pos": {"x": 0.0, "y": 0.0, "z": 0.1},
                    "dir": {"x": 0.0, "y": 0.0, "z": 1.0},
                    "focus": 0.0,
                    "param1": {"x": 0.0, "y": 0.0, "z": 0.0, "w": 0.0},
                    "param2": {"x": 0.0, "y": 0.0, "z": 0.0, "w": 0.0},
                    "pattern": null
                },
                "detectors": [{"pos": {"x": 10.0, "y": 0.0, "z": 0.0}, "r": 1.0}],
                "e0": 1, "src_elems": [],
                "grid": null, "replay": null
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.nphoton, 1000);
        assert_eq!(cfg.method, RayMethod::Branchless);
        assert_eq!(cfg.gates(), 50);
        cfg.validate(&test_mesh()).unwrap();
    }
}
