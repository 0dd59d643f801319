//! View/alias layer: reshape, slice, and permute relationships between lazy tensors.
//!
//! Views never copy data. Writes through a view are queued on the shared alias and folded
//! into its root value the next time any view of that alias is read.

mod alias;
mod info;

pub use alias::{AliasArena, AliasId, View};
pub use info::{SelectInfo, ViewInfo, ViewType};
