//! Error handling types and utilities for the kernel lowering pipeline.
//!
//! # Error Conventions
//!
//! As we are providing a library that others may want to interact with from
//! _code_ as well as from the CLI driver, we keep our errors strongly typed at
//! all times. While libraries like
//! [anyhow](https://docs.rs/anyhow/latest/anyhow/) are well-suited for
//! application code, they make it more difficult than is necessary to handle
//! specific errors in library code. To that end, we make sure that our errors
//! are kept strongly typed within the library as much as is possible.

#![warn(clippy::all, clippy::cargo, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)] // Allows for better API naming
#![allow(clippy::multiple_crate_versions)] // Enforced by our dependencies

pub mod compile;

use thiserror::Error;

/// The result type to be used at the boundaries of the library.
pub type Result<T> = std::result::Result<T, Error>;

/// The root of the error hierarchy for this project.
///
/// All errors should be able to be implicitly converted to this error type as
/// this is the type that is used at the boundaries of the library.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] compile::Error),

    #[error("An unknown error occurred: {_0}")]
    Miscellaneous(String),
}
