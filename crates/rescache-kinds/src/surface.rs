use rescache::{PopulateError, ResourceFactory, ResourceKey, Versioned};

/// A polygon mesh with shared vertices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolygonMesh {
    /// Vertex positions.
    pub vertices: Vec<[f32; 3]>,
    /// Convex polygons, as indices into `vertices`.
    pub polygons: Vec<Vec<u32>>,
}

/// The document type of [`PolygonSurfaceFactory`].
pub type MeshDocument = Versioned<PolygonMesh>;

/// An axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    /// The smallest coordinates.
    pub min: [f32; 3],
    /// The largest coordinates.
    pub max: [f32; 3],
}

impl Bounds {
    fn of(points: &[[f32; 3]]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let mut bounds = Bounds {
            min: *first,
            max: *first,
        };
        for point in rest {
            for axis in 0..3 {
                bounds.min[axis] = bounds.min[axis].min(point[axis]);
                bounds.max[axis] = bounds.max[axis].max(point[axis]);
            }
        }
        Some(bounds)
    }
}

/// A triangle list ready for drawing.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonSurface {
    /// The name of the surface, taken from its resource key.
    pub label: ResourceKey,
    /// Vertex positions.
    pub positions: Vec<[f32; 3]>,
    /// Three indices per triangle.
    pub indices: Vec<u32>,
}

impl PolygonSurface {
    /// The number of triangles.
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Describes the content of a [`PolygonSurface`] after a populate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceInfo {
    /// Number of vertices.
    pub vertices: usize,
    /// Number of triangles.
    pub triangles: usize,
    /// The bounds of all vertices, `None` for a mesh without vertices.
    pub bounds: Option<Bounds>,
}

/// Turns [`PolygonMesh`]es into triangulated [`PolygonSurface`]s.
///
/// Polygons are fan-triangulated, which is exact for convex polygons.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolygonSurfaceFactory;

impl ResourceFactory for PolygonSurfaceFactory {
    const KIND: &'static str = "surface";
    type Document = MeshDocument;
    type Resource = PolygonSurface;
    type LoaderResult = SurfaceInfo;

    fn allocate(&self, key: &ResourceKey) -> PolygonSurface {
        PolygonSurface {
            label: key.clone(),
            positions: Vec::new(),
            indices: Vec::new(),
        }
    }

    fn populate(
        &self,
        document: &MeshDocument,
        surface: &mut PolygonSurface,
    ) -> Result<SurfaceInfo, PopulateError> {
        let mesh = document.data();
        let indices = triangulate(mesh)?;

        surface.positions.clone_from(&mesh.vertices);
        surface.indices = indices;

        let info = SurfaceInfo {
            vertices: surface.positions.len(),
            triangles: surface.triangle_count(),
            bounds: Bounds::of(&surface.positions),
        };
        tracing::trace!(
            label = %surface.label,
            vertices = info.vertices,
            triangles = info.triangles,
            "Uploaded polygon surface"
        );
        Ok(info)
    }
}

fn triangulate(mesh: &PolygonMesh) -> Result<Vec<u32>, PopulateError> {
    let vertex_count = mesh.vertices.len();
    let triangles: usize = mesh
        .polygons
        .iter()
        .map(|polygon| polygon.len().saturating_sub(2))
        .sum();
    let mut indices = Vec::with_capacity(triangles * 3);

    for (i, polygon) in mesh.polygons.iter().enumerate() {
        if polygon.len() < 3 {
            return Err(PopulateError::Malformed(format!(
                "polygon {i} is degenerate with {} vertices",
                polygon.len()
            )));
        }
        if let Some(&index) = polygon.iter().find(|&&index| index as usize >= vertex_count) {
            return Err(PopulateError::Malformed(format!(
                "polygon {i} references vertex {index}, but there are only {vertex_count}"
            )));
        }

        let anchor = polygon[0];
        for edge in polygon[1..].windows(2) {
            indices.extend_from_slice(&[anchor, edge[0], edge[1]]);
        }
    }

    Ok(indices)
}
