//! This library implements the pipeline that lowers tensor-level GPU kernels
//! down to the instruction vocabulary of LLVM, ready to be handed to a code
//! generator.
//!
//! Kernels arrive as a [`Module`] of functions that compute on immutable,
//! statically-shaped tensors using structured control flow. By the end of the
//! pipeline, every tensor lives in a buffer of the module's allocation table,
//! every memory access addresses a known byte offset into that buffer, and
//! every operation is an LLVM instruction arranged in basic blocks.
//!
//! # Process Overview
//!
//! While more information can be found in the module-level documentation of
//! each pass, a brief overview of the lowering process can be stated as
//! follows:
//!
//! 1. We assign a buffer to every tensor value, turning tensor operations into
//!    loads and stores on slices of those buffers.
//! 2. We compute the byte offset of every slice relative to the start of its
//!    buffer, expressed over the index values of the kernel.
//! 3. We merge slices that provably describe the same memory, and canonicalize
//!    the remaining index arithmetic.
//! 4. We expand the floating-point conversions that the target cannot perform
//!    natively.
//! 5. We flatten structured control flow into basic blocks and translate every
//!    operation into its LLVM equivalent.
//!
//! Each of these steps is implemented as a pass, and it is the job of the
//! [`PassManager`] to run them in an order that respects their dependencies,
//! checking the module after every pass.

#![warn(clippy::all, clippy::cargo, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)] // Allows for better API naming
#![allow(clippy::multiple_crate_versions)] // Enforced by our dependencies

pub mod config;
pub mod constant;
pub mod llvm;
pub mod pass;

use klo_errors::compile::Result;
use klo_ir::Module;

use crate::{
    config::PipelineConfig,
    pass::{PassManager, PassManagerReturnData},
};

/// Handles the lowering of a tensor-level [`Module`] to the LLVM instruction
/// vocabulary.
///
/// The compiler owns the [`PassManager`] that it drives, along with the
/// [`PipelineConfig`] used to construct it. Passes never consult any global
/// state, so two compilers with different configurations may happily run side
/// by side.
///
/// Compilation either produces a fully-lowered module alongside the data of
/// every pass, or fails with the first fatal error. Non-fatal diagnostics, such
/// as slice offsets that could not be resolved, are carried in the pass data.
#[derive(Debug)]
pub struct Compiler {
    /// The configuration that the passes were constructed with.
    pub config: PipelineConfig,

    /// The passes that this compiler is configured to run.
    pub passes: PassManager,
}

/// The basic operations required of the compiler.
impl Compiler {
    /// Constructs a new compiler instance that runs the provided `passes`.
    #[must_use]
    pub fn new(config: PipelineConfig, passes: PassManager) -> Self {
        Self { config, passes }
    }

    /// Executes the compiler on the provided `module`.
    ///
    /// # Errors
    ///
    /// - [`klo_errors::compile::Error`] if the module is malformed, or if any
    ///   pass fails. No partially-lowered module is returned in that case.
    #[tracing::instrument(name = "compile", skip_all, fields(module = %module.name))]
    pub fn run(&mut self, module: Module) -> Result<PassManagerReturnData> {
        let result = self.passes.run(module)?;
        tracing::info!(
            functions = result.module.functions.len(),
            buffers = result.module.allocations.len(),
            "Lowered module"
        );
        Ok(result)
    }
}

/// Allows for building a [`Compiler`] instance while retaining the defaults for
/// fields that do not need to be customized.
#[derive(Debug)]
pub struct CompilerBuilder {
    /// The configuration of the pipeline.
    config: PipelineConfig,

    /// The passes that this compiler is configured to run.
    passes: Option<PassManager>,
}

impl CompilerBuilder {
    /// Creates a new compiler builder using the provided `config`.
    ///
    /// The compiler will run the full lowering pipeline unless specified
    /// otherwise by calling [`Self::with_passes`].
    ///
    /// # API Style
    ///
    /// Please note that the API for the builder consumes `self` and is hence
    /// designed to have calls chained in the "fluent" API style.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        let passes = None;
        Self { config, passes }
    }

    /// Specifies the pass configuration for the compiler.
    ///
    /// # API Style
    ///
    /// Please note that the API for the builder consumes `self` and is hence
    /// designed to have calls chained in the "fluent" API style.
    #[must_use]
    pub fn with_passes(mut self, pass_manager: PassManager) -> Self {
        self.passes = Some(pass_manager);
        self
    }

    /// Builds a compiler from the specified configuration.
    ///
    /// # Errors
    ///
    /// - [`klo_errors::compile::Error::InvalidPassOrdering`] if the default
    ///   pipeline cannot be ordered.
    pub fn build(self) -> Result<Compiler> {
        let passes = match self.passes {
            Some(passes) => passes,
            None => PassManager::pipeline(self.config)?,
        };
        Ok(Compiler::new(self.config, passes))
    }
}

impl Default for CompilerBuilder {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

#[cfg(test)]
mod test {
    use klo_errors::compile::Error;
    use klo_ir::{
        affine::AffineExpr,
        builder::FunctionBuilder,
        eval::{evaluate, to_bits},
        module::BufferKind,
        op::{ArithOp, LlvmOp, Opcode},
        types::{ScalarType, SliceType, Type},
        Module,
    };

    use crate::{
        config::PipelineConfig,
        pass::{
            lower_tensors::LowerTensors,
            merge_pointers::MergePointersToSameSlice,
            slice_indices::PropagateSliceIndices,
            verify::{verify, Legality},
            PassManagerReturnData,
        },
        CompilerBuilder,
    };

    fn compile(module: Module, config: PipelineConfig) -> anyhow::Result<PassManagerReturnData> {
        Ok(CompilerBuilder::new(config).build()?.run(module)?)
    }

    fn opcodes(module: &Module) -> Vec<String> {
        let mut opcodes = Vec::new();
        module.functions[0].walk_ops(&mut |op| opcodes.push(op.opcode.to_string()));
        opcodes
    }

    #[test]
    fn slices_with_reordered_offsets_are_merged() -> anyhow::Result<()> {
        let mut module = Module::new("m");
        let buffer = module.allocations.add("k.arg0", 64, BufferKind::Parameter {
            function: "k".into(),
            index:    0,
        });
        let whole = Type::Slice(SliceType::new(buffer, 64, ScalarType::F32));
        let element = Type::Slice(SliceType::new(buffer, 4, ScalarType::F32));
        let f32 = Type::scalar(ScalarType::F32);
        let mut builder = FunctionBuilder::new("k", &[whole], &[f32]);
        let base = builder.params()[0];
        let i = builder.thread_id(0, 16);
        let first = builder.subslice(
            base,
            AffineExpr::dim(0) * 4 + AffineExpr::constant(0),
            &[i],
            element.clone(),
        );
        let second = builder.subslice(
            base,
            AffineExpr::constant(0) + AffineExpr::dim(0) * 4,
            &[i],
            element,
        );
        let x = builder.load(first, AffineExpr::constant(0), &[], ScalarType::F32);
        let y = builder.load(second, AffineExpr::constant(0), &[], ScalarType::F32);
        let sum = builder.arith(ArithOp::AddF, &[x, y]);
        builder.ret(&[sum]);

        let result = compile(module.with_function(builder.finish()), PipelineConfig::new())?;
        let merged = result
            .data
            .get::<MergePointersToSameSlice>()
            .map(|d| d.merged.clone())
            .unwrap_or_default();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].value, second);
        assert_eq!(merged[0].representative, first);

        let geps = opcodes(&result.module)
            .into_iter()
            .filter(|o| o == "llvm.getelementptr")
            .count();
        assert_eq!(geps, 2);

        Ok(())
    }

    #[test]
    fn unsupported_operations_produce_no_module() {
        let f32 = Type::scalar(ScalarType::F32);
        let mut builder = FunctionBuilder::new("k", &[], &[f32.clone()]);
        let x = builder.push_one(Opcode::Unregistered("vendor.magic".into()), &[], f32);
        builder.ret(&[x]);
        let module = Module::new("m").with_function(builder.finish());

        let result = CompilerBuilder::default()
            .build()
            .and_then(|mut compiler| compiler.run(module));
        let Err(error) = result else {
            panic!("Compilation of an unsupported operation succeeded");
        };
        assert!(error.is_fatal());
        assert!(matches!(error, Error::PassFailed { ref pass, .. } if pass == "lower-to-llvm"));
        assert!(matches!(
            error.root(),
            Error::UnsupportedOperation { opcode, .. } if opcode == "vendor.magic"
        ));
    }

    fn narrowing_to_bf16() -> Module {
        let mut builder = FunctionBuilder::new(
            "k",
            &[Type::scalar(ScalarType::F32)],
            &[Type::scalar(ScalarType::BF16)],
        );
        let x = builder.params()[0];
        let y = builder.cast(ArithOp::TruncF, x, ScalarType::BF16);
        builder.ret(&[y]);
        Module::new("m").with_function(builder.finish())
    }

    #[test]
    fn bf16_conversions_are_expanded_by_default() -> anyhow::Result<()> {
        let result = compile(narrowing_to_bf16(), PipelineConfig::new())?;
        let opcodes = opcodes(&result.module);

        assert!(opcodes.len() > 2);
        assert!(!opcodes.contains(&"llvm.fptrunc".to_string()));

        Ok(())
    }

    #[test]
    fn bf16_conversions_are_kept_when_enabled() -> anyhow::Result<()> {
        let result = compile(narrowing_to_bf16(), PipelineConfig::new().with_bf16(true))?;
        assert_eq!(opcodes(&result.module), vec!["llvm.fptrunc", "llvm.ret"]);

        Ok(())
    }

    #[test]
    fn tensor_kernels_lower_to_llvm() -> anyhow::Result<()> {
        let ty = Type::tensor(&[4, 8], ScalarType::F32);
        let f32 = Type::scalar(ScalarType::F32);
        let mut builder = FunctionBuilder::new("row_sum", &[ty, Type::INDEX], &[f32]);
        let params = builder.params();
        let (t, row) = (params[0], params[1]);
        let zero = builder.constant_float(0.0, ScalarType::F32);
        let sum = builder.for_loop(
            AffineExpr::constant(0),
            AffineExpr::constant(8),
            1,
            &[],
            &[zero],
            |b, j, carried| {
                let x = b.extract(t, &[row, j]);
                vec![b.arith(ArithOp::AddF, &[carried[0], x])]
            },
        );
        builder.ret(&sum);

        let result = compile(Module::new("m").with_function(builder.finish()), PipelineConfig::new())?;
        verify(&result.module, Legality::LowLevel)?;
        assert_eq!(result.module.allocations.len(), 1);
        assert!(result.data.get::<LowerTensors>().is_some_and(|d| d.parameters == 1));
        assert!(result.data.get::<PropagateSliceIndices>().is_some());

        let function = &result.module.functions[0];
        assert_eq!(function.value_type(t), &Type::Ptr);
        assert_eq!(function.value_type(row), &Type::scalar(ScalarType::I64));
        assert_eq!(function.body.blocks.len(), 4);
        assert!(opcodes(&result.module).contains(&"llvm.load".to_string()));

        Ok(())
    }

    #[test]
    fn lowering_preserves_index_arithmetic() -> anyhow::Result<()> {
        let mut builder = FunctionBuilder::new("f", &[Type::INDEX], &[Type::INDEX]);
        let n = builder.params()[0];
        let zero = builder.index(0);
        let total = builder.for_loop(
            AffineExpr::constant(-6),
            AffineExpr::dim(0),
            2,
            &[n],
            &[zero],
            |b, iv, carried| {
                let folded = b.apply(AffineExpr::dim(0).floor_div(4) + AffineExpr::dim(1).modulo(3), &[iv, iv]);
                vec![b.arith(ArithOp::AddI, &[carried[0], folded])]
            },
        );
        builder.ret(&total);
        let function = builder.finish();

        let result = compile(Module::new("m").with_function(function.clone()), PipelineConfig::new())?;
        let lowered = &result.module.functions[0];
        for bound in [-7, 0, 5, 17] {
            let args = [to_bits(bound)];
            assert_eq!(evaluate(lowered, &args)?, evaluate(&function, &args)?);
        }

        let mut only_llvm = true;
        lowered.walk_ops(&mut |op| only_llvm &= matches!(op.opcode, Opcode::Llvm(_)));
        assert!(only_llvm);
        assert!(matches!(
            lowered.body.blocks[0].terminator().map(|t| &t.opcode),
            Some(Opcode::Llvm(LlvmOp::Br))
        ));

        Ok(())
    }
}
