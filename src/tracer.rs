//! Ray-tet stepping: given a photon position, direction and its current
//! element, find the exit face, the travel distance to it, and the element
//! on the other side. The branch-less Badouel variant is the reference
//! kernel; the Plucker, Havel and classic Badouel kernels must produce the
//! same tet transitions on a conforming mesh. The grid method shares the
//! branch-less transit and only changes how deposits are laid down.

use crate::config::RayMethod;
use crate::math::vector::Vec3;
use crate::mesh::{TetMesh, FACE_NODES};

use arrayvec::ArrayVec;

/// How often the degenerate-hit fix-up may nudge a photon before the
/// photon is dropped as errored.
pub const MAX_TRIAL: usize = 3;
/// Fraction of the distance to the element centroid the fix-up moves by.
pub const FIX_PHOTON: f64 = 1e-3;

// Travel below this length does not count as leaving the current face;
// keeps a photon from re-crossing the face it just came through.
const T_EPS: f64 = 1e-12;
// Slack on the containment tests of the per-face kernels.
const BARY_EPS: f64 = 1e-9;

/// One face plane `n . x = d`, normal pointing outward, so a point inside
/// the owning tet has `d - n . p > 0` on all four faces.
#[derive(Clone, Copy, Debug)]
pub struct FacePlane {
    pub n: Vec3<f64>,
    pub d: f64,
}

/// Result of one ray-tet step.
#[derive(Clone, Copy, Debug)]
pub struct StepHit {
    /// Distance along the ray to the exit face; infinite when degenerate.
    pub t: f64,
    /// Exit face index 0..3, or -1 when no face was resolved.
    pub face: i32,
    /// 1-based id of the element behind the exit face, 0 = exterior.
    pub nextel: u32,
}

impl StepHit {
    fn none() -> Self {
        StepHit {
            t: f64::INFINITY,
            face: -1,
            nextel: 0,
        }
    }

    /// Whether the step failed to resolve an exit face.
    pub fn is_degenerate(&self) -> bool {
        self.face < 0 || !self.t.is_finite()
    }
}

/// The precomputed ray-tracing tables for one mesh.
pub struct RayTracer<'a> {
    mesh: &'a TetMesh,
    method: RayMethod,
    planes: Vec<[FacePlane; 4]>,
}

impl<'a> RayTracer<'a> {
    /// Builds the per-face plane table for `mesh`.
    pub fn new(mesh: &'a TetMesh, method: RayMethod) -> Self {
        let mut planes = Vec::with_capacity(mesh.num_elems());
        for e in 0..mesh.num_elems() {
            let eid = (e + 1) as u32;
            let nodes = mesh.elem_nodes(eid);
            let mut elem_planes = [FacePlane {
                n: Vec3::zero(),
                d: 0.0,
            }; 4];
            for (f, fnodes) in FACE_NODES.iter().enumerate() {
                let a = nodes[fnodes[0]];
                let b = nodes[fnodes[1]];
                let c = nodes[fnodes[2]];
                let mut n = (b - a).cross(c - a).normalize();
                let mut d = n.dot(a);
                // Outward orientation: the opposite node sits strictly
                // inside, so flip until d - n . q > 0 there.
                let q = nodes[f];
                if d - n.dot(q) < 0.0 {
                    n = -n;
                    d = -d;
                }
                elem_planes[f] = FacePlane { n, d };
            }
            planes.push(elem_planes);
        }
        RayTracer {
            mesh,
            method,
            planes,
        }
    }

    /// The outward normal of face `f` of element `eid`.
    pub fn face_normal(&self, eid: u32, f: usize) -> Vec3<f64> {
        self.planes[(eid - 1) as usize][f].n
    }

    /// Advances the ray `(p, v)` through element `eid` with the method
    /// the tracer was built for.
    pub fn step(&self, eid: u32, p: Vec3<f64>, v: Vec3<f64>) -> StepHit {
        match self.method {
            RayMethod::Plucker => self.plucker_raytet(eid, p, v),
            RayMethod::Havel => self.havel_raytet(eid, p, v),
            RayMethod::Badouel => self.badouel_raytet(eid, p, v),
            RayMethod::Branchless | RayMethod::Grid => self.branchless_raytet(eid, p, v),
        }
    }

    // The reference kernel: evaluate all four planes unconditionally,
    // push every non-forward candidate to infinity and keep the argmin.
    fn branchless_raytet(&self, eid: u32, p: Vec3<f64>, v: Vec3<f64>) -> StepHit {
        let pl = &self.planes[(eid - 1) as usize];

        let s = [
            v.dot(pl[0].n),
            v.dot(pl[1].n),
            v.dot(pl[2].n),
            v.dot(pl[3].n),
        ];
        let mut t = [0.0f64; 4];
        for f in 0..4 {
            let tf = (pl[f].d - p.dot(pl[f].n)) / s[f];
            // A face the ray moves away from, or one closer than the
            // re-entry guard, is not a candidate. The comparison also
            // swallows the NaN from a parallel face.
            t[f] = if s[f] > 0.0 && tf > T_EPS {
                tf
            } else {
                f64::INFINITY
            };
        }

        let mut fmin = 0usize;
        for f in 1..4 {
            if t[f] < t[fmin] {
                fmin = f;
            }
        }
        if !t[fmin].is_finite() {
            return StepHit::none();
        }
        StepHit {
            t: t[fmin],
            face: fmin as i32,
            nextel: self.mesh.facenb[(eid - 1) as usize][fmin],
        }
    }

    // Classic Badouel: the same plane tests with early rejects.
    fn badouel_raytet(&self, eid: u32, p: Vec3<f64>, v: Vec3<f64>) -> StepHit {
        let pl = &self.planes[(eid - 1) as usize];
        let mut best = StepHit::none();
        for f in 0..4 {
            let s = v.dot(pl[f].n);
            if s <= 0.0 {
                continue;
            }
            let t = (pl[f].d - p.dot(pl[f].n)) / s;
            if t <= T_EPS || t >= best.t {
                continue;
            }
            best = StepHit {
                t,
                face: f as i32,
                nextel: self.mesh.facenb[(eid - 1) as usize][f],
            };
        }
        best
    }

    // Havel-style per-face kernel: a Moller-Trumbore containment test
    // against each face triangle.
    fn havel_raytet(&self, eid: u32, p: Vec3<f64>, v: Vec3<f64>) -> StepHit {
        let nodes = self.mesh.elem_nodes(eid);
        let mut best = StepHit::none();
        for (f, fnodes) in FACE_NODES.iter().enumerate() {
            let a = nodes[fnodes[0]];
            let e1 = nodes[fnodes[1]] - a;
            let e2 = nodes[fnodes[2]] - a;

            let pv = v.cross(e2);
            let det = e1.dot(pv);
            if det.abs() < f64::MIN_POSITIVE {
                continue;
            }
            let inv_det = 1.0 / det;
            let tv = p - a;
            let u = tv.dot(pv) * inv_det;
            if u < -BARY_EPS || u > 1.0 + BARY_EPS {
                continue;
            }
            let qv = tv.cross(e1);
            let w = v.dot(qv) * inv_det;
            if w < -BARY_EPS || u + w > 1.0 + BARY_EPS {
                continue;
            }
            let t = e2.dot(qv) * inv_det;
            if t > T_EPS && t < best.t {
                best = StepHit {
                    t,
                    face: f as i32,
                    nextel: self.mesh.facenb[(eid - 1) as usize][f],
                };
            }
        }
        best
    }

    // Plucker-coordinate kernel: the ray is (v, p x v); a face is hit
    // when the permuted inner products against its three edges agree in
    // sign, and those products are the (unnormalized) barycentrics of
    // the hit point.
    fn plucker_raytet(&self, eid: u32, p: Vec3<f64>, v: Vec3<f64>) -> StepHit {
        let nodes = self.mesh.elem_nodes(eid);
        let m = p.cross(v);

        // side(ray, a -> b) = v . (a x b) + (b - a) . (p x v)
        let side = |a: Vec3<f64>, b: Vec3<f64>| v.dot(a.cross(b)) + (b - a).dot(m);

        let mut candidates: ArrayVec<[(usize, f64); 4]> = ArrayVec::new();
        for (f, fnodes) in FACE_NODES.iter().enumerate() {
            let a = nodes[fnodes[0]];
            let b = nodes[fnodes[1]];
            let c = nodes[fnodes[2]];

            let w_ab = side(a, b);
            let w_bc = side(b, c);
            let w_ca = side(c, a);

            let tol = BARY_EPS * (w_ab.abs() + w_bc.abs() + w_ca.abs());
            let all_pos = w_ab >= -tol && w_bc >= -tol && w_ca >= -tol;
            let all_neg = w_ab <= tol && w_bc <= tol && w_ca <= tol;
            if !(all_pos || all_neg) {
                continue;
            }
            let total = w_ab + w_bc + w_ca;
            if total.abs() < f64::MIN_POSITIVE {
                continue;
            }
            // w_bc weights a, w_ca weights b, w_ab weights c:
            let hit = (a.scale(w_bc) + b.scale(w_ca) + c.scale(w_ab)).scale(1.0 / total);
            let t = (hit - p).dot(v);
            if t > T_EPS {
                candidates.push((f, t));
            }
        }

        let mut best = StepHit::none();
        for &(f, t) in candidates.iter() {
            if t < best.t {
                best = StepHit {
                    t,
                    face: f as i32,
                    nextel: self.mesh.facenb[(eid - 1) as usize][f],
                };
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Medium;

    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg32;

    fn single_tet() -> TetMesh {
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

    #[test]
    fn test_planes_positive_inside() {
        let mesh = single_tet();
        let tracer = RayTracer::new(&mesh, RayMethod::Branchless);
        let c = mesh.centroid(1);
        for f in 0..4 {
            let pl = tracer.planes[0][f];
            assert!(pl.d - pl.n.dot(c) > 0.0);
        }
    }

    #[test]
    fn test_exit_face_along_axis() {
        let mesh = single_tet();
        let tracer = RayTracer::new(&mesh, RayMethod::Branchless);
        let c = mesh.centroid(1);
        // Marching towards -x exits through the x = 0 face, which is the
        // face opposite node 2 (index 1):
        let hit = tracer.step(
            1,
            c,
            Vec3 {
                x: -1.0,
                y: 0.0,
                z: 0.0,
            },
        );
        assert_eq!(hit.face, 1);
        assert!((hit.t - 0.25).abs() < 1e-12);
        assert_eq!(hit.nextel, 0);
    }

    #[test]
    fn test_methods_agree() {
        let mesh = single_tet();
        let tracers = [
            RayTracer::new(&mesh, RayMethod::Branchless),
            RayTracer::new(&mesh, RayMethod::Badouel),
            RayTracer::new(&mesh, RayMethod::Havel),
            RayTracer::new(&mesh, RayMethod::Plucker),
        ];
        let mut rng = Pcg32::seed_from_u64(1337);
        let c = mesh.centroid(1);
        for _ in 0..500 {
            let v = Vec3 {
                x: rng.gen::<f64>() - 0.5,
                y: rng.gen::<f64>() - 0.5,
                z: rng.gen::<f64>() - 0.5,
            }
            .normalize();
            let reference = tracers[0].step(1, c, v);
            assert!(!reference.is_degenerate());
            for tracer in tracers[1..].iter() {
                let hit = tracer.step(1, c, v);
                assert_eq!(hit.face, reference.face);
                assert!((hit.t - reference.t).abs() < 1e-9);
                assert_eq!(hit.nextel, reference.nextel);
            }
        }
    }

    #[test]
    fn test_two_tet_transition() {
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
            Vec3 {
                x: 1.0,
                y: 1.0,
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
        let mesh = TetMesh::from_components(
            nodes,
            vec![[1, 2, 3, 4], [2, 3, 4, 5]],
            vec![1, 1],
            media,
        )
        .unwrap();
        let tracer = RayTracer::new(&mesh, RayMethod::Branchless);
        // From inside element 1 towards the far corner of element 2; the
        // step has to hand over to element 2:
        let start = Vec3 {
            x: 0.1,
            y: 0.1,
            z: 0.1,
        };
        let v = (Vec3 {
            x: 1.0,
            y: 1.0,
            z: 1.0,
        })
        .normalize();
        let hit = tracer.step(1, start, v);
        assert_eq!(hit.nextel, 2);
        let p2 = start + v.scale(hit.t + 1e-9);
        let hit2 = tracer.step(2, p2, v);
        assert_eq!(hit2.nextel, 0);
    }

    #[test]
    fn test_degenerate_reported() {
        let mesh = single_tet();
        let tracer = RayTracer::new(&mesh, RayMethod::Branchless);
        // Sitting on a vertex pointing outward leaves no forward face:
        let hit = tracer.step(
            1,
            Vec3 {
                x: 0.0,
                y: 0.0,
                z: 0.0,
            },
            Vec3 {
                x: -1.0,
                y: 0.0,
                z: 0.0,
            }
            .normalize(),
        );
        assert!(hit.is_degenerate() || hit.t < 1e-6);
    }
}
