mod defer;
pub mod sync;

pub use defer::*;
