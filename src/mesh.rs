//! The tetrahedral mesh tables the transport loop walks over: node
//! coordinates, element connectivity, face neighbors, per-element medium
//! assignment and volumes. All tables are immutable for the duration of a
//! batch; photons only carry the integer element id.
//!
//! Node and element ids are 1-based in every table, with 0 reserved for
//! "outside the mesh".

use crate::math::vector::Vec3;

use log::debug;
use serde::{Deserialize, Serialize};
use simple_error::{bail, SimpleResult};

use std::collections::HashMap;

/// Optical properties of one medium. Index 0 of the medium table is the
/// background (void) medium outside the mesh.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Medium {
    /// Absorption coefficient (1/mm).
    pub mua: f64,
    /// Scattering coefficient (1/mm).
    pub mus: f64,
    /// Henyey-Greenstein anisotropy.
    pub g: f64,
    /// Refractive index.
    pub n: f64,
}

/// Local node slots making up face `f` of a tet. Face `f` is opposite
/// node `f`; this table is the fixed permutation that orders the three
/// bounding nodes of each face (used for neighbor matching, plane
/// construction and nodal accumulation).
pub const FACE_NODES: [[usize; 3]; 4] = [[1, 2, 3], [0, 3, 2], [0, 1, 3], [0, 2, 1]];

pub struct TetMesh {
    /// Node positions; node id `i` (1-based) lives at `nodes[i - 1]`.
    pub nodes: Vec<Vec3<f64>>,
    /// Four 1-based node ids per element.
    pub elems: Vec<[u32; 4]>,
    /// Four 1-based neighbor element ids per element, 0 = exterior.
    pub facenb: Vec<[u32; 4]>,
    /// Medium id per element, 0 = void.
    pub types: Vec<u32>,
    /// Element volumes.
    pub evol: Vec<f64>,
    /// Nodal volumes (a quarter of each adjacent element), used to
    /// normalize the linear-basis field.
    pub nvol: Vec<f64>,
    /// The medium table, index 0 = background.
    pub media: Vec<Medium>,
}

// Signed volume of the tet (a, b, c, d):
fn signed_volume(a: Vec3<f64>, b: Vec3<f64>, c: Vec3<f64>, d: Vec3<f64>) -> f64 {
    (b - a).cross(c - a).dot(d - a) / 6.0
}

impl TetMesh {
    /// Builds the full table set from raw node/element lists, the way the
    /// external loader hands them over: derives the face-neighbor table by
    /// shared-face matching, computes element and nodal volumes, and fixes
    /// inverted elements by swapping their last two nodes.
    ///
    /// # Arguments
    /// * `nodes` - Node positions (node id = index + 1).
    /// * `elems` - Four 1-based node ids per element.
    /// * `types` - Medium id per element (0 = void element).
    /// * `media` - Medium table, index 0 = background.
    pub fn from_components(
        nodes: Vec<Vec3<f64>>,
        mut elems: Vec<[u32; 4]>,
        types: Vec<u32>,
        media: Vec<Medium>,
    ) -> SimpleResult<Self> {
        if nodes.len() < 4 || elems.is_empty() {
            bail!("mesh needs at least four nodes and one element");
        }
        if types.len() != elems.len() {
            bail!(
                "medium table length {} does not match element count {}",
                types.len(),
                elems.len()
            );
        }
        if media.is_empty() {
            bail!("the medium table needs at least the background entry");
        }
        for (i, m) in media.iter().enumerate() {
            if m.mua < 0.0 || m.mus < 0.0 {
                bail!("medium {} has a negative mua or mus", i);
            }
            if m.g <= -1.0 || m.g >= 1.0 {
                bail!("medium {} anisotropy must be in (-1, 1)", i);
            }
            if m.n < 1.0 {
                bail!("medium {} refractive index must be >= 1", i);
            }
        }
        for (e, t) in types.iter().enumerate() {
            if (*t as usize) >= media.len() {
                bail!("element {} references unknown medium {}", e + 1, t);
            }
        }

        // Volumes, fixing inverted elements as we go:
        let mut evol = Vec::with_capacity(elems.len());
        for (e, elem) in elems.iter_mut().enumerate() {
            for &nid in elem.iter() {
                if nid == 0 || (nid as usize) > nodes.len() {
                    bail!("element {} references unknown node {}", e + 1, nid);
                }
            }
            let [a, b, c, d] = *elem;
            let mut v = signed_volume(
                nodes[(a - 1) as usize],
                nodes[(b - 1) as usize],
                nodes[(c - 1) as usize],
                nodes[(d - 1) as usize],
            );
            if v < 0.0 {
                elem.swap(2, 3);
                v = -v;
            }
            if v == 0.0 {
                bail!("element {} is degenerate (zero volume)", e + 1);
            }
            evol.push(v);
        }

        let mut nvol = vec![0.0; nodes.len()];
        for (e, elem) in elems.iter().enumerate() {
            for &nid in elem.iter() {
                nvol[(nid - 1) as usize] += evol[e] * 0.25;
            }
        }

        // Face-neighbor derivation. Each interior face appears in exactly
        // two elements; key by the sorted node triple.
        let mut face_map: HashMap<[u32; 3], Vec<(u32, usize)>> = HashMap::new();
        for (e, elem) in elems.iter().enumerate() {
            for (f, fnodes) in FACE_NODES.iter().enumerate() {
                let mut key = [elem[fnodes[0]], elem[fnodes[1]], elem[fnodes[2]]];
                key.sort_unstable();
                face_map
                    .entry(key)
                    .or_insert_with(Vec::new)
                    .push(((e + 1) as u32, f));
            }
        }
        let mut facenb = vec![[0u32; 4]; elems.len()];
        let mut exterior = 0usize;
        for owners in face_map.values() {
            match owners.as_slice() {
                [_] => exterior += 1,
                [(e0, f0), (e1, f1)] => {
                    facenb[(e0 - 1) as usize][*f0] = *e1;
                    facenb[(e1 - 1) as usize][*f1] = *e0;
                }
                _ => bail!(
                    "face shared by {} elements near element {}",
                    owners.len(),
                    owners[0].0
                ),
            }
        }
        debug!(
            "mesh tables built: {} nodes, {} elements, {} exterior faces",
            nodes.len(),
            elems.len(),
            exterior
        );

        let mesh = TetMesh {
            nodes,
            elems,
            facenb,
            types,
            evol,
            nvol,
            media,
        };
        mesh.check_conformity()?;
        Ok(mesh)
    }

    /// The number of elements.
    pub fn num_elems(&self) -> usize {
        self.elems.len()
    }

    /// The number of nodes.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Node position by 1-based id.
    pub fn node(&self, id: u32) -> Vec3<f64> {
        self.nodes[(id - 1) as usize]
    }

    /// The four node positions of element `eid` (1-based).
    pub fn elem_nodes(&self, eid: u32) -> [Vec3<f64>; 4] {
        let e = self.elems[(eid - 1) as usize];
        [
            self.node(e[0]),
            self.node(e[1]),
            self.node(e[2]),
            self.node(e[3]),
        ]
    }

    /// The medium of element `eid`, 0 for a void element.
    pub fn elem_type(&self, eid: u32) -> u32 {
        self.types[(eid - 1) as usize]
    }

    /// The optical properties of element `eid`.
    pub fn elem_medium(&self, eid: u32) -> Medium {
        self.media[self.elem_type(eid) as usize]
    }

    /// The global 1-based node ids bounding face `f` of element `eid`.
    pub fn face_node_ids(&self, eid: u32, f: usize) -> [u32; 3] {
        let e = self.elems[(eid - 1) as usize];
        let fnodes = FACE_NODES[f];
        [e[fnodes[0]], e[fnodes[1]], e[fnodes[2]]]
    }

    /// The centroid of element `eid`, used by the degenerate-hit fix-up.
    pub fn centroid(&self, eid: u32) -> Vec3<f64> {
        let n = self.elem_nodes(eid);
        (n[0] + n[1] + n[2] + n[3]).scale(0.25)
    }

    /// Barycentric coordinates of `p` with respect to element `eid`,
    /// computed from the four signed sub-tet volumes. The coordinates sum
    /// to one; a negative entry means `p` is outside that face.
    pub fn barycentric(&self, eid: u32, p: Vec3<f64>) -> [f64; 4] {
        let n = self.elem_nodes(eid);
        let v = self.evol[(eid - 1) as usize];
        let inv_v = 1.0 / (6.0 * v);
        [
            (n[1] - p).cross(n[2] - p).dot(n[3] - p) * inv_v,
            (p - n[0]).cross(n[2] - n[0]).dot(n[3] - n[0]) * inv_v,
            (n[1] - n[0]).cross(p - n[0]).dot(n[3] - n[0]) * inv_v,
            (n[1] - n[0]).cross(n[2] - n[0]).dot(p - n[0]) * inv_v,
        ]
    }

    /// Verifies that shared faces carry matching neighbor entries on both
    /// sides (a non-conforming table means stale neighbor ids and photons
    /// stepping into the wrong element).
    pub fn check_conformity(&self) -> SimpleResult<()> {
        for (e, nb) in self.facenb.iter().enumerate() {
            let eid = (e + 1) as u32;
            for (f, &other) in nb.iter().enumerate() {
                if other == 0 {
                    continue;
                }
                if (other as usize) > self.elems.len() {
                    bail!("element {} face {} points at unknown element {}", eid, f, other);
                }
                let back = &self.facenb[(other - 1) as usize];
                if !back.iter().any(|&b| b == eid) {
                    bail!(
                        "non-conforming mesh: element {} lists neighbor {} but not vice versa",
                        eid,
                        other
                    );
                }
                // The shared nodes must agree as well:
                let mut mine = self.face_node_ids(eid, f);
                mine.sort_unstable();
                let matched = (0..4).any(|of| {
                    if back[of] != eid {
                        return false;
                    }
                    let mut theirs = self.face_node_ids(other, of);
                    theirs.sort_unstable();
                    theirs == mine
                });
                if !matched {
                    bail!(
                        "non-conforming mesh: elements {} and {} disagree on their shared face",
                        eid,
                        other
                    );
                }
            }
        }
        Ok(())
    }
}
