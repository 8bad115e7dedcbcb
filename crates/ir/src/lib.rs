//! The intermediate representation shared by every stage of the kernel
//! lowering pipeline.
//!
//! The IR is modelled on a small set of MLIR dialects. A kernel starts out as
//! value-semantic tensor computations with structured control flow, and is
//! progressively lowered to explicit memory operations on slices of buffers,
//! and then to a flat LLVM instruction vocabulary organised into basic blocks.
//! A single data model describes every one of these stages, and which parts of
//! it are legal at a given point is a property of the pipeline rather than of
//! the model itself.
//!
//! # Structure
//!
//! - [`module`] contains the containers: modules, functions, regions, blocks
//!   and operations, as well as the allocation table of buffers.
//! - [`op`] contains the opcodes and their arity schemas.
//! - [`types`] contains the type system.
//! - [`affine`] contains affine expressions and their canonicalization, which
//!   underpin all reasoning about slice offsets.
//! - [`range`] contains the analysis of index value ranges.
//! - [`builder`] contains utilities for constructing IR.
//! - [`eval`] contains a reference interpreter for the scalar subset of the
//!   IR, used to check that rewrites preserve semantics.

#![warn(clippy::all, clippy::cargo, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)] // Allows for better API naming
#![allow(clippy::multiple_crate_versions)] // Enforced by our dependencies

pub mod affine;
pub mod builder;
pub mod eval;
pub mod ids;
pub mod module;
pub mod op;
pub mod range;
pub mod types;

pub use crate::{
    affine::AffineExpr,
    ids::{BlockId, BufferId, SymbolId, ValueId},
    module::{Block, Function, Location, Module, Operation, Region},
    types::{ScalarType, Type},
};
