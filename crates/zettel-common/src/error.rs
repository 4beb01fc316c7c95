//! Error types shared across the zettel crates.

use miette::Diagnostic;

/// Serialization/deserialization errors
#[derive(thiserror::Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum SerDeError {
    #[error(transparent)]
    #[diagnostic(code(zettel::serde::json))]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(code(zettel::serde::postcard))]
    Postcard(#[from] postcard::Error),
}
