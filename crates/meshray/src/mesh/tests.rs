use super::*;
use crate::geom::LOOSE_TRACE_TOL;

#[test]
fn line_mesh_topology() {
    let mesh = Mesh::line(4, 0.0, 1.0);
    assert_eq!(mesh.dim(), 1);
    assert_eq!(mesh.n_elems(), 4);
    assert_eq!(mesh.n_nodes(), 5);

    let first = mesh.elem(ElemId(0));
    assert_eq!(first.neighbors, vec![None, Some(ElemId(1))]);
    assert_eq!(mesh.boundary_ids(ElemId(0), 0), &[0]);
    assert!(mesh.boundary_ids(ElemId(0), 1).is_empty());

    let last = mesh.elem(ElemId(3));
    assert_eq!(last.neighbors, vec![Some(ElemId(2)), None]);
    assert_eq!(mesh.boundary_ids(ElemId(3), 1), &[1]);

    assert!((mesh.hmax(ElemId(0)) - 0.25).abs() < 1e-14);
    assert!((mesh.total_volume() - 1.0).abs() < 1e-12);
}

#[test]
fn quad_grid_neighbors_and_normals() {
    let mesh = Mesh::quad_grid(2, 2, (0.0, 1.0), (0.0, 1.0));
    assert_eq!(mesh.n_elems(), 4);

    // Element 0 is at the lower-left
    let e0 = mesh.elem(ElemId(0));
    assert_eq!(
        e0.neighbors,
        vec![None, Some(ElemId(1)), Some(ElemId(2)), None]
    );

    // Outward normals point out of the domain
    let bottom = mesh.outward_normal(ElemId(0), 0);
    assert!(points_fuzzy_eq(&bottom, &Point::new(0.0, -1.0, 0.0), 1e-12));
    let left = mesh.outward_normal(ElemId(0), 3);
    assert!(points_fuzzy_eq(&left, &Point::new(-1.0, 0.0, 0.0), 1e-12));

    // Interior side neighbor symmetry
    assert_eq!(mesh.which_neighbor_am_i(ElemId(1), ElemId(0)), Some(3));
    assert_eq!(mesh.which_neighbor_am_i(ElemId(0), ElemId(1)), Some(1));
}

#[test]
fn hex_grid_containment_and_sides() {
    let mesh = Mesh::hex_grid(2, 1, 1, (0.0, 2.0), (0.0, 1.0), (0.0, 1.0));
    assert_eq!(mesh.n_elems(), 2);

    assert!(mesh.contains_point(ElemId(0), &Point::new(0.5, 0.5, 0.5)));
    assert!(!mesh.contains_point(ElemId(0), &Point::new(1.5, 0.5, 0.5)));
    assert!(mesh.contains_point(ElemId(1), &Point::new(1.5, 0.5, 0.5)));

    // The shared face at x = 1
    assert!(mesh.side_contains_point(ElemId(0), 2, &Point::new(1.0, 0.5, 0.5), LOOSE_TRACE_TOL));
    assert_eq!(mesh.elem(ElemId(0)).neighbors[2], Some(ElemId(1)));
    assert_eq!(mesh.which_neighbor_am_i(ElemId(1), ElemId(0)), Some(4));

    // Outward normal of the +x face of element 1
    let nx = mesh.outward_normal(ElemId(1), 2);
    assert!(points_fuzzy_eq(&nx, &Point::new(1.0, 0.0, 0.0), 1e-12));

    // Axis-aligned hexes have planar sides
    for s in 0..6 {
        assert!(!mesh.side_is_non_planar(ElemId(0), s));
    }

    assert!((mesh.total_volume() - 2.0).abs() < 1e-12);
}

#[test]
fn point_locator_prefers_lowest_elem_id() {
    let mesh = Mesh::quad_grid(2, 2, (0.0, 1.0), (0.0, 1.0));
    // The exact center is shared by all four quads
    let located = mesh.locate_point(&Point::new(0.5, 0.5, 0.0), None);
    assert_eq!(located, Some(ElemId(0)));
    // Outside the mesh
    assert!(mesh.locate_point(&Point::new(2.0, 0.5, 0.0), None).is_none());
}

#[test]
fn partitioning_into_slabs() {
    let mut mesh = Mesh::hex_grid(4, 1, 1, (0.0, 4.0), (0.0, 1.0), (0.0, 1.0));
    mesh.partition_slabs_x(4);
    assert_eq!(mesh.n_ranks(), 4);
    for i in 0..4 {
        assert_eq!(mesh.elem(ElemId(i)).processor_id, i as u32);
    }
    let bbox = mesh.local_bounding_box(1);
    assert!((bbox.min.x - 1.0).abs() < 1e-14);
    assert!((bbox.max.x - 2.0).abs() < 1e-14);
}

#[test]
fn quad_refinement_children_and_descent() {
    let mut mesh = Mesh::quad_grid(2, 1, (0.0, 2.0), (0.0, 1.0));
    mesh.refine(ElemId(0)).unwrap();
    mesh.prepare();

    let parent = mesh.elem(ElemId(0));
    assert!(!parent.active());
    assert_eq!(parent.children.len(), 4);

    // Children cover the parent
    let total: f64 = parent
        .children
        .iter()
        .map(|c| mesh.elem_volume(*c))
        .sum();
    assert!((total - 1.0).abs() < 1e-12);

    for &child in &parent.children {
        assert_eq!(mesh.elem(child).level, 1);
        assert_eq!(mesh.elem(child).parent, Some(ElemId(0)));
    }

    // Descending from the coarse neighbor lands in the right child
    let point = Point::new(1.0, 0.25, 0.0);
    let child = mesh.active_neighbor(ElemId(1), 3, &point).unwrap();
    assert!(mesh.elem(child).level == 1);
    assert!(mesh.close_to_point(child, &point, LOOSE_TRACE_TOL));

    // The coarse elem still reaches its refined neighbor
    let mut adjacent = Vec::new();
    mesh.active_family_tree_by_neighbor(ElemId(0), ElemId(1), &mut adjacent);
    assert_eq!(adjacent.len(), 2);
}

#[test]
fn refined_children_inherit_boundary_ids() {
    let mut mesh = Mesh::line(2, 0.0, 1.0);
    mesh.refine(ElemId(0)).unwrap();
    mesh.prepare();

    let children = &mesh.elem(ElemId(0)).children;
    let left_child = children
        .iter()
        .find(|c| mesh.elem(**c).neighbors[0].is_none())
        .copied()
        .unwrap();
    assert_eq!(mesh.boundary_ids(left_child, 0), &[0]);
}

#[test]
fn hex_refinement_produces_eight_children() {
    let mut mesh = Mesh::hex_grid(1, 1, 1, (0.0, 1.0), (0.0, 1.0), (0.0, 1.0));
    mesh.refine(ElemId(0)).unwrap();
    mesh.prepare();

    let parent = mesh.elem(ElemId(0));
    assert_eq!(parent.children.len(), 8);
    let total: f64 = parent
        .children
        .iter()
        .map(|c| mesh.elem_volume(*c))
        .sum();
    assert!((total - 1.0).abs() < 1e-12);

    // 27 lattice nodes in total
    assert_eq!(mesh.n_nodes(), 27);
}

#[test]
fn refinement_rejects_unsupported_types() {
    // A pyramid built by hand
    let mut mesh = Mesh::new(3);
    for p in [
        Point::new(0.0, 0.0, 0.0),
        Point::new(1.0, 0.0, 0.0),
        Point::new(1.0, 1.0, 0.0),
        Point::new(0.0, 1.0, 0.0),
        Point::new(0.5, 0.5, 1.0),
    ] {
        mesh.nodes_mut().push(p);
    }
    mesh.elems_mut().push(Elem {
        id: ElemId(0),
        etype: ElemType::Pyramid5,
        nodes: (0..5).map(NodeId).collect(),
        subdomain: 0,
        neighbors: vec![None; 5],
        processor_id: 0,
        level: 0,
        parent: None,
        children: Vec::new(),
    });
    mesh.prepare();

    assert!(mesh.refine(ElemId(0)).is_err());
}
