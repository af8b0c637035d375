//! Recipe data model and the read-only Recipe Service client.
//!
//! - [`model`] - `Recipe` (full record, stored verbatim) and `RecipeListItem` (gallery shape)
//! - [`client`] - fetches a recipe or its image with retry, timeout and size limits

mod client;
mod model;

pub use client::{FetchedBinary, RecipeClient};
pub use model::{Ingredient, Recipe, RecipeIngredient, RecipeListItem};
