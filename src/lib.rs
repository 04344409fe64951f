//! tetray: a mesh-based Monte Carlo photon transport engine.
//!
//! Propagates photon packets through a tetrahedral mesh of turbid media,
//! accumulating a time-gated fluence/energy field and per-detected-photon
//! statistics. Mesh loading, configuration parsing and result writing are
//! the host's business; this crate takes the tables and the configuration
//! record and returns the buffers.

pub mod accum;
pub mod config;
pub mod detector;
pub mod dispatch;
pub mod fresnel;
pub mod math;
pub mod mesh;
pub mod photon;
pub mod source;
pub mod tracer;

pub use crate::config::{
    BasisOrder, Config, DebugFlags, Detector, GridSpec, OutputType, RayMethod, Replay, Source,
    SrcType,
};
pub use crate::dispatch::{run, RunResult, RunTotals};
pub use crate::mesh::{Medium, TetMesh};
