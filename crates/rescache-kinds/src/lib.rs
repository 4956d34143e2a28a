//! Resource factories for the derived resources of image and mesh documents.
//!
//! The resources built here are CPU-side stand-ins for GPU buffers: they have the exact layout
//! a renderer would upload, but live in plain `Vec`s.

#![warn(missing_docs)]

mod pixels;
mod surface;

pub use pixels::*;
pub use surface::*;
