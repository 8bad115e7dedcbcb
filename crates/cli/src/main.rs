//! This is the CLI driver for the lowering of tensor-level kernels to the LLVM
//! instruction vocabulary. For more detail, please see the documentation for
//! the [`klo_compiler`] crate.
//!
//! Modules are read and written as JSON.

#![warn(clippy::all, clippy::cargo, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)] // Allows for better API naming
#![allow(clippy::multiple_crate_versions)] // Enforced by our dependencies

use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use itertools::Itertools;
use klo_compiler::{
    config::{PipelineConfig, Target},
    pass::{slice_indices::PropagateSliceIndices, verify::verify_input, PassManager},
    CompilerBuilder,
};
use klo_ir::Module;

/// Lowers tensor-level GPU kernels to the LLVM instruction vocabulary.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Runs the lowering pipeline on a module.
    Lower {
        /// The JSON file containing the module to lower.
        input: PathBuf,

        /// Where to write the lowered module (default: stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Lists the passes of the pipeline in the order that they run.
    Passes {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Checks that a module is well formed.
    Verify {
        /// The JSON file containing the module to check.
        input: PathBuf,
    },
}

/// The flags that configure the pipeline.
#[derive(Args, Clone, Copy, Debug, Default)]
struct PipelineArgs {
    /// Leave bf16 conversions for the target to perform natively.
    #[arg(long)]
    enable_bf16: bool,

    /// Skip checking the module between passes.
    #[arg(long)]
    no_verify: bool,

    /// Treat the target as unable to convert bf16 natively.
    #[arg(long)]
    no_native_bf16: bool,
}

impl PipelineArgs {
    fn config(self) -> PipelineConfig {
        let target = Target::new().with_native_bf16_conversions(!self.no_native_bf16);
        PipelineConfig::new()
            .with_bf16(self.enable_bf16)
            .with_verification(!self.no_verify)
            .with_target(target)
    }
}

/// The result of lowering a module.
#[derive(Debug)]
struct Lowered {
    /// The lowered module, encoded as JSON.
    json: String,

    /// Non-fatal diagnostics produced along the way.
    warnings: Vec<String>,
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Lower {
            input,
            output,
            pipeline,
        } => {
            let source = read(&input)?;
            let lowered = lower(&source, pipeline.config())
                .with_context(|| format!("Failed to lower {}", input.display()))?;
            for warning in &lowered.warnings {
                eprintln!("Warning: {warning}");
            }
            match output {
                Some(path) => fs::write(&path, &lowered.json)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => println!("{}", lowered.json),
            }
        }
        Command::Passes { pipeline } => println!("{}", passes(pipeline.config())?),
        Command::Verify { input } => {
            let module = parse(&read(&input)?)?;
            verify_input(&module).with_context(|| format!("{} is malformed", input.display()))?;
            println!("{}: ok", input.display());
        }
    }

    Ok(())
}

fn read(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn parse(source: &str) -> anyhow::Result<Module> {
    serde_json::from_str(source).context("Input is not a valid module")
}

/// Runs the pipeline configured by `config` over the module encoded in
/// `source`.
#[tracing::instrument(skip_all)]
fn lower(source: &str, config: PipelineConfig) -> anyhow::Result<Lowered> {
    let module = parse(source)?;
    let mut compiler = CompilerBuilder::new(config).build()?;
    let result = compiler.run(module)?;

    let warnings = result
        .data
        .get::<PropagateSliceIndices>()
        .map(|d| d.diagnostics.iter().map(ToString::to_string).collect())
        .unwrap_or_default();
    let json = serde_json::to_string_pretty(&result.module)?;

    Ok(Lowered { json, warnings })
}

/// Describes the passes of the pipeline configured by `config`, one per line.
fn passes(config: PipelineConfig) -> anyhow::Result<String> {
    let manager = PassManager::pipeline(config)?;
    let listing = manager
        .passes()
        .iter()
        .enumerate()
        .map(|(i, pass)| format!("{}. {}", i + 1, pass.name()))
        .join("\n");
    Ok(listing)
}

#[cfg(test)]
mod test {
    use clap::Parser;
    use klo_ir::{
        builder::FunctionBuilder,
        op::Opcode,
        types::{ScalarType, Type},
        Module,
    };

    use crate::{lower, passes, Cli, Command, PipelineArgs};

    #[test]
    fn flags_configure_the_pipeline() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["klo", "lower", "in.json", "--enable-bf16", "--no-native-bf16"])?;
        let Command::Lower { pipeline, output, .. } = cli.command else {
            anyhow::bail!("Expected the lower command");
        };
        let config = pipeline.config();

        assert!(output.is_none());
        assert!(config.enable_bf16);
        assert!(config.verify);
        assert!(!config.keeps_bf16_conversions());

        Ok(())
    }

    #[test]
    fn passes_are_listed_in_order() -> anyhow::Result<()> {
        let listing = passes(PipelineArgs::default().config())?;
        let lines: Vec<_> = listing.lines().collect();

        assert_eq!(lines, vec![
            "1. lower-tensors",
            "2. propagate-slice-indices",
            "3. merge-pointers-to-same-slice",
            "4. simplify-affine",
            "5. expand-float-conversions",
            "6. lower-to-llvm",
        ]);

        Ok(())
    }

    #[test]
    fn modules_are_lowered_from_json() -> anyhow::Result<()> {
        let f32 = Type::scalar(ScalarType::F32);
        let mut builder = FunctionBuilder::new("k", &[Type::tensor(&[4], ScalarType::F32)], &[f32]);
        let t = builder.params()[0];
        let i = builder.index(2);
        let x = builder.extract(t, &[i]);
        builder.ret(&[x]);
        let source = serde_json::to_string(&Module::new("m").with_function(builder.finish()))?;

        let lowered = lower(&source, PipelineArgs::default().config())?;
        let module: Module = serde_json::from_str(&lowered.json)?;

        assert!(lowered.warnings.is_empty());
        assert_eq!(module.allocations.len(), 1);
        let mut only_llvm = true;
        module.functions[0].walk_ops(&mut |op| only_llvm &= matches!(op.opcode, Opcode::Llvm(_)));
        assert!(only_llvm);

        Ok(())
    }

    #[test]
    fn invalid_input_is_rejected() {
        assert!(lower("{", PipelineArgs::default().config()).is_err());
    }
}
