use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use rescache::{
    CacheRegistry, ResourceCache, ResourceFactory, ResourceHandle, SharedDocument, Versioned,
};
use rescache_kinds::{
    Image, ImageDocument, MeshDocument, PixelBufferFactory, PixelFormat, PolygonMesh,
    PolygonSurfaceFactory,
};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// Number of distinct documents the operations are spread over.
    #[serde(default = "default_documents")]
    pub documents: usize,
    /// Number of suffixed resource instances per document.
    #[serde(default = "default_suffixes")]
    pub suffixes: usize,
    /// Every n-th operation mutates its document before refreshing, `0` never mutates.
    #[serde(default)]
    pub mutate_every: usize,
    #[serde(flatten)]
    pub payload: Payload,
}

fn default_documents() -> usize {
    1
}

fn default_suffixes() -> usize {
    1
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    Pixels {
        width: u32,
        height: u32,
        format: PixelFormat,
    },
    Surface {
        polygons: usize,
        sides: usize,
    },
}

/// The documents of one workload, together with a pinned handle for every resource.
///
/// The pinned handles keep the entries alive between operations, the way an open view keeps
/// its resources while it is being redrawn.
struct Documents<F: ResourceFactory> {
    cache: Arc<ResourceCache<F>>,
    documents: Vec<SharedDocument<F::Document>>,
    pinned: Vec<ResourceHandle<F>>,
}

impl<F: ResourceFactory> Documents<F> {
    fn new(
        cache: Arc<ResourceCache<F>>,
        documents: Vec<SharedDocument<F::Document>>,
        suffixes: &[String],
    ) -> Self {
        let pinned = documents
            .iter()
            .flat_map(|document| suffixes.iter().map(|suffix| cache.acquire(document, suffix)))
            .collect();
        Self {
            cache,
            documents,
            pinned,
        }
    }

    fn refresh(
        &self,
        document: usize,
        suffix: &str,
        mutate: Option<impl FnOnce(&mut F::Document)>,
        check: impl FnOnce(&F::Resource, &F::LoaderResult) -> bool,
    ) -> Result<bool> {
        let document = &self.documents[document];
        let lease = self.cache.lease(document, suffix);
        if let Some(mutate) = mutate {
            let mut document = document.write().unwrap_or_else(PoisonError::into_inner);
            mutate(&mut document);
        }
        let refreshed = lease
            .refresh()
            .with_context(|| format!("failed to refresh `{}`", lease.key()))?;
        let resource = lease.read()?;
        anyhow::ensure!(
            check(&resource, &refreshed.loader_result),
            "resource `{}` does not match its loader result",
            lease.key()
        );
        Ok(refreshed.updated)
    }

    fn finish(self) -> Result<()> {
        for handle in &self.pinned {
            self.cache.release(handle)?;
        }
        Ok(())
    }
}

enum Kind {
    Pixels(Documents<PixelBufferFactory>),
    Surface(Documents<PolygonSurfaceFactory>),
}

/// A workload with its documents, ready to run operations against the caches.
pub struct ParsedWorkload {
    kind: Kind,
    documents: usize,
    suffixes: Vec<String>,
    mutate_every: usize,
    next_op: AtomicUsize,
}

pub fn prepare_workload(
    registry: &CacheRegistry,
    index: usize,
    workload: &Workload,
) -> ParsedWorkload {
    let documents = workload.documents.max(1);
    let keys = (0..documents).map(|doc| format!("w{index}-d{doc}"));
    let suffixes: Vec<_> = (0..workload.suffixes.max(1))
        .map(|i| match i {
            0 => String::new(),
            i => format!("#{i}"),
        })
        .collect();

    let kind = match workload.payload {
        Payload::Pixels {
            width,
            height,
            format,
        } => {
            let cache = registry.get_or_init(PixelBufferFactory::default);
            let documents = keys
                .map(|key| Versioned::new(key, Image::blank(width, height, format)).shared())
                .collect();
            Kind::Pixels(Documents::new(cache, documents, &suffixes))
        }
        Payload::Surface { polygons, sides } => {
            let cache = registry.get_or_init(|| PolygonSurfaceFactory);
            let documents = keys
                .map(|key| Versioned::new(key, ring_mesh(polygons, sides)).shared())
                .collect();
            Kind::Surface(Documents::new(cache, documents, &suffixes))
        }
    };

    ParsedWorkload {
        kind,
        documents,
        suffixes,
        mutate_every: workload.mutate_every,
        next_op: AtomicUsize::new(0),
    }
}

/// Builds `polygons` regular polygons with `sides` corners each, spread along the x axis.
fn ring_mesh(polygons: usize, sides: usize) -> PolygonMesh {
    let sides = sides.max(3);
    let mut mesh = PolygonMesh::default();
    for p in 0..polygons {
        let first = mesh.vertices.len() as u32;
        for s in 0..sides {
            let angle = s as f32 / sides as f32 * std::f32::consts::TAU;
            mesh.vertices
                .push([p as f32 * 3.0 + angle.cos(), angle.sin(), 0.0]);
        }
        mesh.polygons.push((first..first + sides as u32).collect());
    }
    mesh
}

impl ParsedWorkload {
    /// Runs one lease, (mutate), refresh, read, release cycle.
    ///
    /// Returns whether the refresh populated the resource.
    pub fn run_once(&self) -> Result<bool> {
        let op = self.next_op.fetch_add(1, Ordering::Relaxed);
        let document = op % self.documents;
        let suffix = &self.suffixes[(op / self.documents) % self.suffixes.len()];
        let mutate = self.mutate_every > 0 && op % self.mutate_every == 0;

        match &self.kind {
            Kind::Pixels(documents) => documents.refresh(
                document,
                suffix,
                mutate.then_some(|image: &mut ImageDocument| {
                    image.modify(|image| {
                        if let Some(first) = image.pixels.first_mut() {
                            *first = first.wrapping_add(1);
                        }
                    })
                }),
                |buffer, info| buffer.width == info.width && buffer.height == info.height,
            ),
            Kind::Surface(documents) => documents.refresh(
                document,
                suffix,
                mutate.then_some(|mesh: &mut MeshDocument| mesh.touch()),
                |surface, info| surface.triangle_count() == info.triangles,
            ),
        }
    }

    /// Releases the pinned resources of this workload.
    pub fn finish(self) -> Result<()> {
        match self.kind {
            Kind::Pixels(documents) => documents.finish(),
            Kind::Surface(documents) => documents.finish(),
        }
    }
}
