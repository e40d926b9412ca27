//! Grid builders, partitioning, and non-conforming refinement.
//!
//! Builders produce first-order tensor meshes with boundary ids equal to
//! the local side index facing the domain boundary (e.g. a hex grid gets
//! ids 0..6 for the z-/y-/x+/y+/x-/z+ faces). Refinement splits a tensor
//! element into 2^dim children; neighbor links of children point at the
//! parent's neighbor and are resolved by active-child descent.

use crate::error::{RayTracingError, Result};
use crate::geom::Point;

use super::types::{Elem, ElemId, ElemType, NodeId};
use super::Mesh;

/// Corner lattice coordinates (0 or 2 per axis) in vertex order.
fn corner_lattice(etype: ElemType) -> &'static [[usize; 3]] {
    match etype {
        ElemType::Edge2 => &[[0, 0, 0], [2, 0, 0]],
        ElemType::Quad4 => &[[0, 0, 0], [2, 0, 0], [2, 2, 0], [0, 2, 0]],
        ElemType::Hex8 => &[
            [0, 0, 0],
            [2, 0, 0],
            [2, 2, 0],
            [0, 2, 0],
            [0, 0, 2],
            [2, 0, 2],
            [2, 2, 2],
            [0, 2, 2],
        ],
        _ => panic!("not a tensor element type"),
    }
}

/// Parent side index facing each direction `(axis, positive)`.
fn direction_side(etype: ElemType, axis: usize, positive: bool) -> u16 {
    match etype {
        ElemType::Edge2 => {
            if positive {
                1
            } else {
                0
            }
        }
        ElemType::Quad4 => match (axis, positive) {
            (0, false) => 3,
            (0, true) => 1,
            (1, false) => 0,
            (1, true) => 2,
            _ => unreachable!(),
        },
        ElemType::Hex8 => match (axis, positive) {
            (0, false) => 4,
            (0, true) => 2,
            (1, false) => 1,
            (1, true) => 3,
            (2, false) => 0,
            (2, true) => 5,
            _ => unreachable!(),
        },
        _ => panic!("not a tensor element type"),
    }
}

impl Mesh {
    /// `n` segments over `[xmin, xmax]`.
    pub fn line(n: usize, xmin: f64, xmax: f64) -> Mesh {
        let mut mesh = Mesh::new(1);
        let dx = (xmax - xmin) / n as f64;
        for i in 0..=n {
            mesh.nodes_mut().push(Point::new(xmin + i as f64 * dx, 0.0, 0.0));
        }
        for i in 0..n {
            let neighbors = vec![
                if i > 0 { Some(ElemId(i - 1)) } else { None },
                if i + 1 < n { Some(ElemId(i + 1)) } else { None },
            ];
            mesh.elems_mut().push(Elem {
                id: ElemId(i),
                etype: ElemType::Edge2,
                nodes: vec![NodeId(i), NodeId(i + 1)],
                subdomain: 0,
                neighbors,
                processor_id: 0,
                level: 0,
                parent: None,
                children: Vec::new(),
            });
        }
        mesh.assign_boundary_sides();
        mesh.prepare();
        mesh
    }

    /// `nx` by `ny` quads over the rectangle.
    pub fn quad_grid(nx: usize, ny: usize, x: (f64, f64), y: (f64, f64)) -> Mesh {
        let mut mesh = Mesh::new(2);
        let dx = (x.1 - x.0) / nx as f64;
        let dy = (y.1 - y.0) / ny as f64;
        let node = |i: usize, j: usize| NodeId(j * (nx + 1) + i);
        for j in 0..=ny {
            for i in 0..=nx {
                mesh.nodes_mut()
                    .push(Point::new(x.0 + i as f64 * dx, y.0 + j as f64 * dy, 0.0));
            }
        }
        let eid = |i: usize, j: usize| ElemId(j * nx + i);
        for j in 0..ny {
            for i in 0..nx {
                let neighbors = vec![
                    if j > 0 { Some(eid(i, j - 1)) } else { None },
                    if i + 1 < nx { Some(eid(i + 1, j)) } else { None },
                    if j + 1 < ny { Some(eid(i, j + 1)) } else { None },
                    if i > 0 { Some(eid(i - 1, j)) } else { None },
                ];
                mesh.elems_mut().push(Elem {
                    id: eid(i, j),
                    etype: ElemType::Quad4,
                    nodes: vec![node(i, j), node(i + 1, j), node(i + 1, j + 1), node(i, j + 1)],
                    subdomain: 0,
                    neighbors,
                    processor_id: 0,
                    level: 0,
                    parent: None,
                    children: Vec::new(),
                });
            }
        }
        mesh.assign_boundary_sides();
        mesh.prepare();
        mesh
    }

    /// `nx` by `ny` by `nz` hexes over the box.
    pub fn hex_grid(
        nx: usize,
        ny: usize,
        nz: usize,
        x: (f64, f64),
        y: (f64, f64),
        z: (f64, f64),
    ) -> Mesh {
        let mut mesh = Mesh::new(3);
        let dx = (x.1 - x.0) / nx as f64;
        let dy = (y.1 - y.0) / ny as f64;
        let dz = (z.1 - z.0) / nz as f64;
        let node = |i: usize, j: usize, k: usize| NodeId(k * (ny + 1) * (nx + 1) + j * (nx + 1) + i);
        for k in 0..=nz {
            for j in 0..=ny {
                for i in 0..=nx {
                    mesh.nodes_mut().push(Point::new(
                        x.0 + i as f64 * dx,
                        y.0 + j as f64 * dy,
                        z.0 + k as f64 * dz,
                    ));
                }
            }
        }
        let eid = |i: usize, j: usize, k: usize| ElemId(k * ny * nx + j * nx + i);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let neighbors = vec![
                        if k > 0 { Some(eid(i, j, k - 1)) } else { None },
                        if j > 0 { Some(eid(i, j - 1, k)) } else { None },
                        if i + 1 < nx { Some(eid(i + 1, j, k)) } else { None },
                        if j + 1 < ny { Some(eid(i, j + 1, k)) } else { None },
                        if i > 0 { Some(eid(i - 1, j, k)) } else { None },
                        if k + 1 < nz { Some(eid(i, j, k + 1)) } else { None },
                    ];
                    mesh.elems_mut().push(Elem {
                        id: eid(i, j, k),
                        etype: ElemType::Hex8,
                        nodes: vec![
                            node(i, j, k),
                            node(i + 1, j, k),
                            node(i + 1, j + 1, k),
                            node(i, j + 1, k),
                            node(i, j, k + 1),
                            node(i + 1, j, k + 1),
                            node(i + 1, j + 1, k + 1),
                            node(i, j + 1, k + 1),
                        ],
                        subdomain: 0,
                        neighbors,
                        processor_id: 0,
                        level: 0,
                        parent: None,
                        children: Vec::new(),
                    });
                }
            }
        }
        mesh.assign_boundary_sides();
        mesh.prepare();
        mesh
    }

    /// Assigns boundary id = side index on every neighborless side.
    fn assign_boundary_sides(&mut self) {
        let entries: Vec<(ElemId, u16)> = self
            .elems()
            .filter(|e| e.active())
            .flat_map(|e| {
                e.neighbors
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| n.is_none())
                    .map(move |(s, _)| (e.id, s as u16))
            })
            .collect();
        for (elem, side) in entries {
            self.add_boundary_id(elem, side, side as u32);
        }
    }

    /// Partitions active elements into contiguous slabs along x.
    pub fn partition_slabs_x(&mut self, n_ranks: u32) {
        let mut order: Vec<(f64, ElemId)> = self
            .active_elems()
            .map(|e| (self.vertex_average(e.id).x, e.id))
            .collect();
        order.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        let per_rank = order.len().div_ceil(n_ranks as usize);
        for (idx, (_, id)) in order.into_iter().enumerate() {
            self.elems_mut()[id.0].processor_id = (idx / per_rank) as u32;
        }
        // Inactive elements take the rank of their first active descendant
        for i in 0..self.n_elems() {
            if !self.elem(ElemId(i)).active() {
                let mut cur = ElemId(i);
                while !self.elem(cur).active() {
                    cur = self.elem(cur).children[0];
                }
                self.elems_mut()[i].processor_id = self.elem(cur).processor_id;
            }
        }
        self.set_n_ranks(n_ranks);
    }

    /// Splits a tensor element (`Edge2`, `Quad4`, `Hex8`) into 2^dim
    /// children with hanging nodes at the midpoints. Call `prepare()`
    /// after all refinements.
    pub fn refine(&mut self, elem: ElemId) -> Result<()> {
        let e = self.elem(elem).clone();
        if !e.active() {
            return Err(RayTracingError::setup(format!(
                "cannot refine inactive element {}",
                elem.0
            )));
        }
        if !matches!(e.etype, ElemType::Edge2 | ElemType::Quad4 | ElemType::Hex8) {
            return Err(RayTracingError::setup(format!(
                "refinement is not supported for element type {:?}",
                e.etype
            )));
        }

        let dim = e.etype.dim() as usize;
        let corners = corner_lattice(e.etype);
        let corner_points: Vec<Point> = (0..e.n_vertices())
            .map(|v| self.elem_point(elem, v))
            .collect();

        // Lattice node ids over the 3^dim refinement lattice
        let mut lattice = [[[NodeId(usize::MAX); 3]; 3]; 3];
        let steps = |d: usize| if d < dim { 3 } else { 1 };
        for a in 0..steps(0) {
            for b in 0..steps(1) {
                for c in 0..steps(2) {
                    let p = multilinear(&corner_points, e.etype, a, b, c);
                    // Reuse parent corner nodes exactly
                    let corner = corners
                        .iter()
                        .position(|l| l[0] == a && l[1] == b && l[2] == c);
                    lattice[a][b][c] = match corner {
                        Some(v) => e.nodes[v],
                        None => self.find_or_add_node(p),
                    };
                }
            }
        }

        // Create the 2^dim children
        let cells = |d: usize| if d < dim { 2 } else { 1 };
        let mut children = Vec::with_capacity(1 << dim);
        let first_child = self.n_elems();
        let mut idx = 0;
        let mut child_cells = Vec::new();
        for i in 0..cells(0) {
            for j in 0..cells(1) {
                for k in 0..cells(2) {
                    let id = ElemId(first_child + idx);
                    idx += 1;
                    let nodes: Vec<NodeId> = corners
                        .iter()
                        .map(|l| lattice[i + l[0] / 2][j + l[1] / 2][k + l[2] / 2])
                        .collect();
                    children.push(id);
                    child_cells.push((id, [i, j, k]));
                    self.elems_mut().push(Elem {
                        id,
                        etype: e.etype,
                        nodes,
                        subdomain: e.subdomain,
                        neighbors: vec![None; e.n_sides() as usize],
                        processor_id: e.processor_id,
                        level: e.level + 1,
                        parent: Some(elem),
                        children: Vec::new(),
                    });
                }
            }
        }

        // Neighbor links: siblings internally, the parent's neighbor on
        // external sides (descent handles inactive/coarser targets)
        let sibling = |cell: [usize; 3]| {
            child_cells
                .iter()
                .find(|(_, c)| *c == cell)
                .map(|(id, _)| *id)
        };
        for (child, cell) in child_cells.clone() {
            for axis in 0..dim {
                for positive in [false, true] {
                    let side = direction_side(e.etype, axis, positive);
                    let internal = if positive { cell[axis] == 0 } else { cell[axis] == 1 };
                    let target = if internal {
                        let mut c = cell;
                        c[axis] = 1 - c[axis];
                        sibling(c)
                    } else {
                        e.neighbors[side as usize]
                    };
                    self.elems_mut()[child.0].neighbors[side as usize] = target;
                    // Children on a parent boundary side inherit its ids
                    if !internal {
                        let ids = self.boundary_ids(elem, side).to_vec();
                        for id in ids {
                            self.add_boundary_id(child, side, id);
                        }
                    }
                }
            }
        }

        self.elems_mut()[elem.0].children = children;
        Ok(())
    }

    fn find_or_add_node(&mut self, p: Point) -> NodeId {
        for (i, n) in self.nodes_mut().iter().enumerate() {
            if (n - p).norm() < 1e-12 {
                return NodeId(i);
            }
        }
        self.nodes_mut().push(p);
        NodeId(self.n_nodes() - 1)
    }
}

/// Multilinear interpolation at lattice point `(a, b, c)` of the parent's
/// corner positions.
fn multilinear(corners: &[Point], etype: ElemType, a: usize, b: usize, c: usize) -> Point {
    let (u, v, w) = (a as f64 / 2.0, b as f64 / 2.0, c as f64 / 2.0);
    match etype {
        ElemType::Edge2 => corners[0] * (1.0 - u) + corners[1] * u,
        ElemType::Quad4 => {
            corners[0] * (1.0 - u) * (1.0 - v)
                + corners[1] * u * (1.0 - v)
                + corners[2] * u * v
                + corners[3] * (1.0 - u) * v
        }
        ElemType::Hex8 => {
            let bottom = corners[0] * (1.0 - u) * (1.0 - v)
                + corners[1] * u * (1.0 - v)
                + corners[2] * u * v
                + corners[3] * (1.0 - u) * v;
            let top = corners[4] * (1.0 - u) * (1.0 - v)
                + corners[5] * u * (1.0 - v)
                + corners[6] * u * v
                + corners[7] * (1.0 - u) * v;
            bottom * (1.0 - w) + top * w
        }
        _ => panic!("not a tensor element type"),
    }
}
