use rescache::{CacheRegistry, Versioned};
use rescache_kinds::{PixelBufferFactory, PolygonMesh, PolygonSurfaceFactory};
use rescache_test as test;
use std::prelude::v1::test;

fn triangle() -> PolygonMesh {
    PolygonMesh {
        vertices: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        polygons: vec![vec![0, 1, 2]],
    }
}

#[test]
fn test_viewports_share_surface() {
    test::setup();
    let registry = CacheRegistry::default();
    let surfaces = registry.get_or_init(|| PolygonSurfaceFactory);
    let mesh = Versioned::new("mesh", triangle()).shared();

    let left = surfaces.acquire(&mesh, "");
    let right = surfaces.acquire(&mesh, "");
    assert!(surfaces.refresh(&left).unwrap().updated);
    assert!(!surfaces.refresh(&right).unwrap().updated);
    assert_eq!(right.read().unwrap().triangle_count(), 1);

    // a wireframe view gets its own instance
    let wireframe = surfaces.acquire(&mesh, "#wireframe");
    assert_eq!(surfaces.len(), 2);
    assert!(surfaces.refresh(&wireframe).unwrap().updated);

    mesh.write().unwrap().modify(|mesh| {
        mesh.vertices.push([1.0, 1.0, 0.0]);
        mesh.polygons[0] = vec![0, 1, 3, 2];
    });
    let refreshed = surfaces.refresh(&right).unwrap();
    assert!(refreshed.updated);
    assert_eq!(refreshed.loader_result.triangles, 2);
    assert_eq!(left.read().unwrap().triangle_count(), 2);
    assert!(surfaces.needs_refresh(&wireframe).unwrap());

    for handle in [left, right, wireframe] {
        surfaces.release(&handle).unwrap();
    }
    registry.teardown().unwrap();
}

#[test]
fn test_kinds_are_separate_caches() {
    test::setup();
    let registry = CacheRegistry::default();
    let surfaces = registry.get_or_init(|| PolygonSurfaceFactory);
    let pixels = registry.get_or_init(PixelBufferFactory::default);
    assert_eq!(registry.kinds(), ["pixels", "surface"]);

    let mesh = Versioned::new("mesh", triangle()).shared();
    let handle = surfaces.acquire(&mesh, "");
    assert!(pixels.is_empty());

    let err = registry.teardown().unwrap_err();
    insta::assert_snapshot!(err.to_string(), @"1 resource(s) leaked at shutdown in surface: mesh_surface");

    surfaces.release(&handle).unwrap();
    surfaces.check_empty().unwrap();
}
