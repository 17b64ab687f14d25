//! Storage seams implemented once per backend.

mod repository;
mod searcher;

pub use repository::*;
pub use searcher::*;
