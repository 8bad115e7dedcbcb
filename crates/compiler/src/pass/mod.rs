//! This module contains both the definition of the [`Pass`] type and the
//! [`PassManager`] object.
//!
//! Every pass should implement [`ConcretePass`], as this provides the full set
//! of features required of a pass. It is also expected that each pass provide a
//! type-specific constructor function called `new`.
//!
//! # Passes
//!
//! A pass is a self-contained unit of functionality that takes ownership of a
//! [`Module`] and hands back a rewritten one alongside some pass data. The
//! passes of the pipeline each narrow the representation a little further:
//!
//! 1. [`lower_tensors::LowerTensors`] assigns buffers to tensors.
//! 2. [`slice_indices::PropagateSliceIndices`] computes slice offsets.
//! 3. [`merge_pointers::MergePointersToSameSlice`] merges identical slices.
//! 4. [`simplify_affine::SimplifyAffine`] canonicalizes index arithmetic.
//! 5. [`float_conversions::ExpandFloatConversions`] expands `bf16`
//!    conversions.
//! 6. [`lower_to_llvm::LowerToLLVM`] produces the LLVM instruction vocabulary.
//!
//! # Ordering
//!
//! Passes declare the passes whose data they depend on and the passes whose
//! data they invalidate. The [`PassManager`] derives an execution order from
//! these declarations, and refuses orderings that cannot satisfy them.

pub mod data;
pub mod float_conversions;
pub mod lower_tensors;
pub mod lower_to_llvm;
pub mod merge_pointers;
pub mod simplify_affine;
pub mod slice_indices;
pub mod verify;

use std::{
    any::{Any, TypeId},
    fmt::Debug,
};

use derivative::Derivative;
use downcast_rs::Downcast;
use itertools::Itertools;
use klo_errors::compile::{Error, Result};
use klo_ir::{Function, Module};

use crate::{
    config::PipelineConfig,
    pass::{
        data::{ConcretePassData, DynPassDataMap, PassData},
        float_conversions::ExpandFloatConversions,
        lower_tensors::LowerTensors,
        lower_to_llvm::LowerToLLVM,
        merge_pointers::MergePointersToSameSlice,
        simplify_affine::SimplifyAffine,
        slice_indices::PropagateSliceIndices,
        verify::Legality,
    },
};

/// A pass is a self-contained unit of functionality that performs some
/// operation over the IR.
pub type Pass = Box<dyn PassOps>;

/// A handle that uniquely identifies the pass.
pub type PassKey = TypeId;

/// Pass return data that returns a dynamic [`PassData`].
pub type DynPassReturnData = PassReturnData<PassData>;

/// The data returned when executing a pass.
#[derive(Derivative)]
#[derivative(Debug(bound = "T: Debug"))]
pub struct PassReturnData<T> {
    /// The newly-modified module.
    pub module: Module,

    /// The data returned by the pass.
    pub data: T,
}

impl<T> PassReturnData<T> {
    /// Creates a new instance of the pass return data.
    pub fn new(module: Module, data: T) -> Self {
        Self { module, data }
    }
}

impl PassReturnData<PassData> {
    /// Allows you to get the returned pass data as the concrete data type `T`,
    /// returning `&T` if possible and `None` otherwise.
    #[must_use]
    pub fn data_as<T: ConcretePassData>(&self) -> Option<&T> {
        self.data.as_any().downcast_ref::<T>()
    }

    /// Allows you to get the returned pass data as the concrete data type `T`,
    /// returning `&T` if possible.
    ///
    /// # Panics
    ///
    /// If `self.data` is not an instance of `T`.
    #[must_use]
    pub fn unwrap_data_as<T: ConcretePassData>(&self) -> &T {
        self.data.unwrap_as::<T>()
    }
}

/// The operations that we expect one of our passes to have.
///
/// The implementation is designed to be used via dynamic dispatch, and hence
/// can provide the requisite operations however it is able.
///
/// # Self Bounds
///
/// - [`Any`] allows downcasting to concrete implementations of the pass.
/// - [`Debug`] to provide representations to aid in debugging.
/// - [`Downcast`] for easy conversions _to_ [`Any`] for downcasting.
///
/// In addition, it is required but not enforced that implementors of this
/// trait also implement [`ConcretePass`].
pub trait PassOps
where
    Self: Any + Debug + Downcast,
{
    /// Executes the pass on the provided `module`, returning both the
    /// rewritten module and any data returned by the pass.
    ///
    /// It takes a map of `pass_data` that allows the running pass to get at the
    /// data produced by the passes that it depends on.
    ///
    /// # Errors
    ///
    /// - [`Error`] if pass execution fails for any reason.
    fn run(&mut self, module: Module, pass_data: &DynPassDataMap) -> Result<DynPassReturnData>;

    /// Gets a slice containing the keys of the passes whose output this pass
    /// depends on.
    fn depends(&self) -> &[PassKey];

    /// Gets a slice containing the keys of the passes whose output is no
    /// longer valid after this pass has run.
    fn invalidates(&self) -> &[PassKey];

    /// Returns a duplicate of this pass.
    fn dupe(&self) -> Pass;

    /// Gets the name of the pass, as used in diagnostics.
    fn name(&self) -> &'static str;

    /// Gets the legality level that the module is guaranteed to satisfy after
    /// the pass has run, if the pass raises it.
    fn legality(&self) -> Option<Legality> {
        None
    }

    /// Gets a key that uniquely represents the pass.
    ///
    /// This **must** return the same value as [`ConcretePass::key`].
    fn key_dyn(&self) -> PassKey {
        self.type_id()
    }
}

/// Operations implemented on `dyn PassOps` are **only** available on the
/// concrete trait object and hence not equivalent to a blanket implementation
/// of a method for `trait PassOps`.
impl dyn PassOps {
    /// Checks if the pass is an instance of the concrete pass `T`.
    pub fn is<T: ConcretePass>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Allows you to view the dynamic pass `self` as the concrete pass type
    /// `T`, returning a `&T` if possible and `None` otherwise.
    pub fn view_as<T: ConcretePass>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Allows you to view the dynamic pass `self` as the concrete pass type
    /// `T`, returning a `&mut T` if possible and `None` otherwise.
    pub fn view_as_mut<T: ConcretePass>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    /// Allows you to view the dynamic pass `self` as the concrete pass type
    /// `T`.
    ///
    /// # Panics
    ///
    /// If `self` is not an instance of `T`.
    pub fn unwrap_as<T: ConcretePass>(&self) -> &T {
        self.view_as::<T>()
            .unwrap_or_else(|| panic!("self was not a {:?}", TypeId::of::<T>()))
    }
}

/// Provides extra operations that can be called when operating on a concrete
/// instance of a specific pass, rather than on any instance of a pass.
pub trait ConcretePass
where
    Self: Clone + Debug + PassOps,
{
    /// The type of data returned by the pass.
    type Data: ConcretePassData;

    /// Gets a key that uniquely represents the pass.
    ///
    /// This **must** return the same value as [`PassOps::key_dyn`].
    #[must_use]
    fn key() -> PassKey {
        TypeId::of::<Self>()
    }
}

/// The data returned when executing all passes via the pass manager.
#[derive(Debug)]
pub struct PassManagerReturnData {
    /// The fully-lowered module.
    pub module: Module,

    /// A mapping from pass key to the data returned by the pass.
    pub data: DynPassDataMap,
}

impl PassManagerReturnData {
    /// Creates a new pass manager return data element wrapping the lowered
    /// `module` and the result `data` from all the passes.
    #[must_use]
    pub fn new(module: Module, data: DynPassDataMap) -> Self {
        Self { module, data }
    }
}

/// A manager for passes within the compiler.
///
/// The primary task of this pass manager is to automatically resolve a pass
/// ordering based on dependencies between passes, and to check that the module
/// satisfies the expected invariants as it moves between them.
#[derive(Debug)]
pub struct PassManager {
    pass_ordering: Vec<Pass>,
    verify:        bool,
}

impl PassManager {
    /// Creates a new pass manager wrapping the provided passes, which verifies
    /// the module after every pass.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPassOrdering`] if no valid pass ordering can be
    ///   generated from the provided `passes`.
    pub fn new(passes: Vec<Pass>) -> Result<Self> {
        let pass_ordering = Self::generate_pass_ordering(passes)?;
        let verify = true;
        Ok(Self {
            pass_ordering,
            verify,
        })
    }

    /// Creates the pass manager for the full lowering pipeline, with the
    /// passes configured by `config`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPassOrdering`] if the pipeline's passes cannot be
    ///   ordered, which indicates a bug in their declarations.
    pub fn pipeline(config: PipelineConfig) -> Result<Self> {
        let passes: Vec<Pass> = vec![
            LowerTensors::new_dyn(),
            PropagateSliceIndices::new_dyn(),
            MergePointersToSameSlice::new_dyn(),
            SimplifyAffine::new_dyn(),
            ExpandFloatConversions::new_dyn(config),
            LowerToLLVM::new_dyn(),
        ];
        Ok(Self::new(passes)?.with_verification(config.verify))
    }

    /// Specifies whether the module is verified after every pass.
    ///
    /// # API Style
    ///
    /// Please note that this API consumes `self` and is hence designed to have
    /// calls chained in the "fluent" API style.
    #[must_use]
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Executes the pass ordering on the provided `module`.
    ///
    /// The module is checked to be structurally sound before any pass runs.
    /// If verification is enabled, the module is additionally checked against
    /// the strictest legality level reached so far after every pass.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedModule`] if the input module is not well formed.
    /// - [`Error::PassFailed`] wrapping the failure of any pass, or wrapping a
    ///   [`Error::VerificationFailed`] if a pass produced an illegal module.
    /// - [`Error::InvalidPassOrdering`] if a pass is missing the data of a
    ///   pass it depends on.
    pub fn run(&mut self, mut module: Module) -> Result<PassManagerReturnData> {
        verify::verify_input(&module)?;
        let mut legality = Legality::Tensor;
        if self.verify {
            verify::verify(&module, legality)?;
        }

        let mut pass_data_map = DynPassDataMap::new();
        for pass in &mut self.pass_ordering {
            let name = pass.name();
            if let Some(missing) = pass.depends().iter().find(|k| !pass_data_map.contains_key(**k)) {
                return Err(Error::InvalidPassOrdering(format!(
                    "Pass `{name}` requires the data of {missing:?}, which is not available"
                )));
            }

            let span = tracing::info_span!("pass", name);
            let _guard = span.enter();
            let ops: usize = module.functions.iter().map(Function::op_count).sum();
            tracing::debug!(ops, "Running pass");

            let PassReturnData { module: output, data } = pass
                .run(module, &pass_data_map)
                .map_err(|e| e.in_pass(name))?;

            for key in pass.invalidates() {
                pass_data_map.clear_key(*key);
            }
            pass_data_map.put_key(pass.key_dyn(), data);

            if let Some(reached) = pass.legality() {
                legality = legality.max(reached);
            }
            if self.verify {
                verify::verify(&output, legality).map_err(|e| e.in_pass(name))?;
            }
            module = output;
        }

        Ok(PassManagerReturnData::new(module, pass_data_map))
    }

    /// Gets the current pass ordering.
    ///
    /// This method is always guaranteed to return a valid pass ordering that
    /// respects the requirements of the passes.
    #[must_use]
    pub fn passes(&self) -> &[Pass] {
        &self.pass_ordering
    }

    /// Generates a valid pass ordering from `passes` wherever possible.
    ///
    /// The ordering is stable: each pass runs as early as its dependencies
    /// allow, and passes that do not depend on one another keep their relative
    /// order.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPassOrdering`] if a pass depends on a pass that is not
    ///   present, or if the dependencies between passes are circular.
    pub fn generate_pass_ordering(passes: Vec<Pass>) -> Result<Vec<Pass>> {
        let keys: Vec<PassKey> = passes.iter().map(|p| p.key_dyn()).collect();
        for pass in &passes {
            if let Some(missing) = pass.depends().iter().find(|k| !keys.contains(k)) {
                return Err(Error::InvalidPassOrdering(format!(
                    "Pass `{}` depends on {missing:?}, which is not part of the pipeline",
                    pass.name()
                )));
            }
        }

        let mut pending: Vec<Option<Pass>> = passes.into_iter().map(Some).collect();
        let mut ordering = Vec::with_capacity(pending.len());
        while ordering.len() < pending.len() {
            let outstanding = |key: &PassKey| {
                pending.iter().flatten().any(|p| p.key_dyn() == *key)
            };
            let ready = pending.iter().position(|p| {
                p.as_ref()
                    .is_some_and(|p| !p.depends().iter().any(|k| outstanding(k)))
            });
            match ready.and_then(|i| pending[i].take()) {
                Some(pass) => ordering.push(pass),
                None => {
                    let stuck = pending.iter().flatten().map(|p| p.name()).join(", ");
                    return Err(Error::InvalidPassOrdering(format!(
                        "Circular dependencies between passes: {stuck}"
                    )));
                }
            }
        }

        Ok(ordering)
    }
}
