//! meshql-graphlette - cross-service temporal resolution.
//!
//! A [`Root`] answers named queries from a [`Searcher`](meshql_core::Searcher)
//! and hands each result to a [`DtoFactory`], which fills foreign-key fields by
//! calling other services. Every nested call carries the root's as-of timestamp
//! and the caller's authorization header, so a composite object is assembled
//! from one consistent snapshot.
//!
//! # Example
//!
//! ```ignore
//! use meshql_graphlette::{Root, Selection, SubgraphClient};
//!
//! let client = SubgraphClient::new(&config.subgraph)?;
//! let root = Root::from_config(searcher, Arc::new(BearerAuth), &config.graphlette, &client)?;
//! let coop = root
//!     .query("getById", &args, &request, &Selection::parse("name farm { name }")?)
//!     .await?;
//! ```

pub mod dto;
pub mod resolver;
pub mod root;
pub mod selection;
pub mod subgraph;

#[cfg(test)]
mod test_support;

pub use dto::DtoFactory;
pub use resolver::{FieldResolver, LocalResolver, ResolutionContext, SubgraphResolver};
pub use root::{as_of, Root, AT_ARG};
pub use selection::{Field, Selection};
pub use subgraph::{build_batch_query, build_query, GraphqlError, PartialData, SubgraphClient, DEFAULT_SELECTION};
