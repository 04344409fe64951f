//! Launch sampling (the source models) and the Henyey-Greenstein
//! scattering direction update.
//!
//! Every source model fills a position, a direction and a launch weight,
//! then the enclosing element is found by a signed-volume (barycentric)
//! search over the configured source-element candidates.

use crate::config::{Config, Source, SrcType};
use crate::math::random::RandGen;
use crate::math::util::coord_system;
use crate::math::vector::{Vec3, Vec4};
use crate::mesh::TetMesh;

use std::f64::consts::PI;

// A launched photon may sit on an element face; allow the search this
// much barycentric slack.
const BARY_TOL: f64 = 1e-4;

/// A freshly launched photon: position, unit direction, launch weight and
/// the enclosing element (0 when no candidate element encloses `p`).
#[derive(Clone, Copy, Debug)]
pub struct Launch {
    pub p: Vec3<f64>,
    pub v: Vec3<f64>,
    pub w: f64,
    pub eid: u32,
}

/// Rotates the unit vector `v` by deflection cosine `cos_theta` and
/// azimuth `phi`, staying in the frame aligned with `v`. Uses the
/// explicit rotation; when `v` is nearly parallel to z the frame is
/// replaced directly to dodge the singularity.
pub fn rotate_dir(v: Vec3<f64>, cos_theta: f64, phi: f64) -> Vec3<f64> {
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    let (sin_phi, cos_phi) = phi.sin_cos();

    if v.z.abs() > 1.0 - 1e-12 {
        return Vec3 {
            x: sin_theta * cos_phi,
            y: sin_theta * sin_phi,
            z: cos_theta * v.z.signum(),
        }
        .normalize();
    }

    let tmp = (1.0 - v.z * v.z).sqrt();
    Vec3 {
        x: sin_theta * (v.x * v.z * cos_phi - v.y * sin_phi) / tmp + v.x * cos_theta,
        y: sin_theta * (v.y * v.z * cos_phi + v.x * sin_phi) / tmp + v.y * cos_theta,
        z: -sin_theta * cos_phi * tmp + v.z * cos_theta,
    }
    .normalize()
}

/// Samples the next scattering direction for anisotropy `g`, returning
/// the new direction and the deflection cosine (the latter feeds the
/// momentum-transfer tally).
pub fn next_scatter_dir(rng: &mut RandGen, g: f64, v: Vec3<f64>) -> (Vec3<f64>, f64) {
    let cos_theta = rng.next_cos_theta_hg(g);
    let phi = rng.next_azimuth();
    (rotate_dir(v, cos_theta, phi), cos_theta)
}

// Uniform direction over the sphere:
fn uniform_sphere(rng: &mut RandGen) -> Vec3<f64> {
    let z = 1.0 - 2.0 * rng.uniform_f64();
    let r = (1.0 - z * z).max(0.0).sqrt();
    let phi = rng.next_azimuth();
    Vec3 {
        x: r * phi.cos(),
        y: r * phi.sin(),
        z,
    }
}

// A point on the unit disk perpendicular to dir, scaled by r:
fn disk_offset(rng: &mut RandGen, dir: Vec3<f64>, r: f64) -> Vec3<f64> {
    let (e1, e2) = coord_system(dir);
    let phi = rng.next_azimuth();
    e1.scale(r * phi.cos()) + e2.scale(r * phi.sin())
}

fn plane_axes(src: &Source) -> (Vec3<f64>, Vec3<f64>) {
    let v1 = src.param1.xyz();
    let v2 = src.param2.xyz();
    (v1, v2)
}

// The out-of-plane axis pair used by the Fourier-X family: param1 is the
// first edge, the second is dir x param1 with matching length.
fn fourierx_axes(src: &Source) -> (Vec3<f64>, Vec3<f64>) {
    let v1 = src.param1.xyz();
    let v2 = src.dir.cross(v1.normalize()).scale(v1.length());
    (v1, v2)
}

fn pattern_weight(src: &Source, u: f64, v: f64) -> f64 {
    // Validation guarantees the image is present and sized; a missing
    // one degrades to a plain planar source.
    let pat = match src.pattern.as_ref() {
        Some(pat) => pat,
        None => return 1.0,
    };
    let xs = src.param1.w as usize;
    let ys = src.param2.w as usize;
    let i = ((u * xs as f64) as usize).min(xs - 1);
    let j = ((v * ys as f64) as usize).min(ys - 1);
    pat[j * xs + i] as f64
}

// Launch weight of the Fourier pattern family. The spatial frequencies
// ride in the integer parts of the two w parameters, the phase in the
// fraction of param1.w and the amplitude in one minus the fraction of
// param2.w.
fn fourier_weight(p1: Vec4<f64>, p2: Vec4<f64>, u: f64, v: f64) -> f64 {
    let kx = p1.w.floor();
    let ky = p2.w.floor();
    let phase = (p1.w - kx) * 2.0 * PI;
    let amp = 1.0 - (p2.w - ky);
    ((2.0 * PI * (kx * u + ky * v) + phase).cos() * amp + 1.0) * 0.5
}

/// Fills `(p, v, w)` for one photon according to the source descriptor
/// and locates the enclosing element. `eid` is left at 0 when no
/// candidate element encloses the launch position.
pub fn launch(cfg: &Config, mesh: &TetMesh, rng: &mut RandGen) -> Launch {
    let src = &cfg.source;
    let mut p = src.pos;
    let mut v = src.dir;
    let mut w = 1.0;

    match src.kind {
        SrcType::Pencil => {}
        SrcType::Isotropic => {
            v = uniform_sphere(rng);
        }
        SrcType::Cone => {
            // Uniform over the spherical cap of half-angle param1.x:
            let cos_min = src.param1.x.cos();
            let cos_theta = 1.0 - rng.uniform_f64() * (1.0 - cos_min);
            let phi = rng.next_azimuth();
            v = rotate_dir(src.dir, cos_theta, phi);
        }
        SrcType::Gaussian => {
            // Gaussian intensity profile of waist param1.x; param1.y
            // widens the waist by the Rayleigh factor when meaningful.
            let waist = if src.param1.y > 1e-5 {
                src.param1.x * (1.0 + src.param1.y * src.param1.y).sqrt()
            } else {
                src.param1.x
            };
            let r = waist * (-rng.uniform_f64().max(1e-12).ln()).sqrt();
            p = p + disk_offset(rng, src.dir, r);
        }
        SrcType::ZGaussian => {
            // Gaussian angular profile with spread param1.x (Box-Muller):
            let theta =
                src.param1.x * (-2.0 * rng.uniform_f64().max(1e-12).ln()).sqrt();
            let phi = rng.next_azimuth();
            v = rotate_dir(src.dir, theta.cos(), phi);
        }
        SrcType::Planar => {
            let (v1, v2) = plane_axes(src);
            p = p + v1.scale(rng.uniform_f64()) + v2.scale(rng.uniform_f64());
        }
        SrcType::Pattern => {
            let (v1, v2) = plane_axes(src);
            let u = rng.uniform_f64();
            let t = rng.uniform_f64();
            p = p + v1.scale(u) + v2.scale(t);
            w = pattern_weight(src, u, t);
        }
        SrcType::Fourier => {
            let (v1, v2) = plane_axes(src);
            let u = rng.uniform_f64();
            let t = rng.uniform_f64();
            p = p + v1.scale(u) + v2.scale(t);
            w = fourier_weight(src.param1, src.param2, u, t);
        }
        SrcType::FourierX => {
            let (v1, v2) = fourierx_axes(src);
            let u = rng.uniform_f64();
            let t = rng.uniform_f64();
            p = p + v1.scale(u) + v2.scale(t);
            let phase = src.param2.z * 2.0 * PI;
            w = ((2.0 * PI * (src.param2.x * u + src.param2.y * t) + phase).cos()
                * src.param2.w
                + 1.0)
                * 0.5;
        }
        SrcType::FourierX2D => {
            let (v1, v2) = fourierx_axes(src);
            let u = rng.uniform_f64();
            let t = rng.uniform_f64();
            p = p + v1.scale(u) + v2.scale(t);
            w = ((2.0 * PI * src.param2.x * u + src.param2.z * 2.0 * PI).sin()
                * (2.0 * PI * src.param2.y * t + src.param2.w * 2.0 * PI).sin()
                + 1.0)
                * 0.5;
        }
        SrcType::Arcsine => {
            // Zenith uniform in angle rather than in cos(angle):
            let theta = PI * rng.uniform_f64();
            let phi = rng.next_azimuth();
            let (sin_theta, cos_theta) = theta.sin_cos();
            v = Vec3 {
                x: sin_theta * phi.cos(),
                y: sin_theta * phi.sin(),
                z: cos_theta,
            };
        }
        SrcType::Disk => {
            let r = src.param1.x * rng.uniform_f64().sqrt();
            p = p + disk_offset(rng, src.dir, r);
        }
        SrcType::Line => {
            let axis = src.param1.xyz();
            p = p + axis.scale(rng.uniform_f64());
            // Emission perpendicular to the line, random azimuth:
            let (e1, e2) = coord_system(axis.normalize());
            let phi = rng.next_azimuth();
            v = (e1.scale(phi.cos()) + e2.scale(phi.sin())).normalize();
        }
        SrcType::Slit => {
            let axis = src.param1.xyz();
            p = p + axis.scale(rng.uniform_f64());
        }
    }

    // Converging/diverging beam steering towards the focal point:
    if src.focus != 0.0 && src.focus.is_finite() {
        let focal = src.pos + src.dir.scale(src.focus);
        v = if src.focus > 0.0 {
            (focal - p).normalize()
        } else {
            (p - focal).normalize()
        };
    }

    let eid = find_enclosing(cfg, mesh, p);
    Launch { p, v, w, eid }
}

// Scans the source-element candidates for the first tet whose
// barycentric coordinates are all non-negative within tolerance.
fn find_enclosing(cfg: &Config, mesh: &TetMesh, p: Vec3<f64>) -> u32 {
    for eid in cfg.source_elems() {
        let b = mesh.barycentric(eid, p);
        if b.iter().all(|&bi| bi >= -BARY_TOL) {
            return eid;
        }
    }
    0
}
