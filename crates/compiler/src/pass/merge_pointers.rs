//! This pass replaces slices that provably describe the same bytes of the same
//! buffer with a single representative, so that later stages see one pointer
//! where there would otherwise be several.
//!
//! Two slices are considered identical only if their buffers and lengths are
//! equal and their offsets canonicalize to the same affine expression. Slices
//! with opaque offsets never take part.
//!
//! A slice is replaced by the earliest identical slice whose definition
//! dominates it. Dominance is structural: a definition dominates everything
//! after it in its own block and in the regions nested there, and definitions
//! in the entry block also dominate every other top-level block. The defining
//! operations of replaced slices are left in place, and running the pass again
//! finds nothing left to replace.
//!
//! Alias classes are reported for the module as a whole. Slices of different
//! functions only share a class when their offsets are constant, as any other
//! offset refers to values of its own function.

use std::collections::HashMap;

use klo_errors::compile::Result;
use klo_ir::{
    affine::canonicalize,
    range::IndexRanges,
    types::SliceOffset,
    AffineExpr,
    BlockId,
    BufferId,
    Function,
    Module,
    Region,
    ScalarType,
    ValueId,
};

use crate::pass::{
    data::{ConcretePassData, DynPassDataMap, PassDataOps},
    slice_indices::PropagateSliceIndices,
    ConcretePass,
    DynPassReturnData,
    Pass,
    PassKey,
    PassOps,
};

/// Merges slices that refer to the same memory.
#[derive(Clone, Debug, PartialEq)]
pub struct MergePointersToSameSlice {
    /// The passes that this pass depends upon the results of for its execution.
    depends: Vec<PassKey>,

    /// The passes that this pass invalidates the results of by executing.
    invalidates: Vec<PassKey>,
}

impl MergePointersToSameSlice {
    /// Creates a new instance of the slice merging pass.
    #[must_use]
    pub fn new() -> Self {
        // Slices can only be compared once their offsets are known.
        let depends = vec![PropagateSliceIndices::key()];

        // Merging only changes uses, never the offsets of the slices involved.
        let invalidates = vec![];

        Self {
            depends,
            invalidates,
        }
    }

    /// Creates a new trait object of the slice merging pass.
    #[must_use]
    pub fn new_dyn() -> Pass {
        Box::new(Self::new())
    }

    /// Merges the identical slices within each function of `module`, and
    /// groups the slices of the whole module into alias classes.
    pub fn merge_module(module: &mut Module) -> MergePointersData {
        let mut data = MergePointersData::default();
        let mut aliases = ModuleAliases::default();
        for function in &mut module.functions {
            let classes = SliceClasses::compute(function);
            for (key, members) in &classes.classes {
                aliases.add(&function.name, key, members);
            }
            Self::merge_function(function, &classes, &mut data);
        }
        data.alias_classes = aliases.finish();
        data
    }

    fn merge_function(function: &mut Function, classes: &SliceClasses, data: &mut MergePointersData) {
        let entry = function.body.blocks.first().map(|b| b.id).unwrap_or_default();

        let mut merges = Vec::new();
        for (_, members) in &classes.classes {
            let mut representatives: Vec<&Member> = Vec::new();
            for member in members {
                match representatives.iter().find(|r| dominates(&r.site, &member.site, entry)) {
                    Some(representative) => merges.push((member.value, representative.value)),
                    None => representatives.push(member),
                }
            }
        }

        for (value, representative) in merges {
            let replaced = function.replace_all_uses(value, representative);
            tracing::debug!(
                function = %function.name,
                value = %value,
                representative = %representative,
                replaced,
                "Merged slice"
            );
            data.replaced_uses += replaced;
            data.merged.push(MergedSlice {
                function: function.name.clone(),
                value,
                representative,
            });
        }
    }
}

impl Default for MergePointersToSameSlice {
    fn default() -> Self {
        Self::new()
    }
}

impl PassOps for MergePointersToSameSlice {
    #[tracing::instrument(name = "merge-pointers-to-same-slice", skip_all)]
    fn run(&mut self, mut module: Module, _pass_data: &DynPassDataMap) -> Result<DynPassReturnData> {
        let data = Self::merge_module(&mut module);
        tracing::debug!(
            merged = data.merged.len(),
            replaced_uses = data.replaced_uses,
            alias_classes = data.alias_classes.len(),
            "Merged identical slices"
        );

        Ok(DynPassReturnData::new(module, Box::new(data)))
    }

    fn depends(&self) -> &[PassKey] {
        self.depends.as_slice()
    }

    fn invalidates(&self) -> &[PassKey] {
        self.invalidates.as_slice()
    }

    fn dupe(&self) -> Pass {
        Box::new(self.clone())
    }

    fn name(&self) -> &'static str {
        "merge-pointers-to-same-slice"
    }
}

impl ConcretePass for MergePointersToSameSlice {
    type Data = MergePointersData;
}

/// A slice whose uses were all replaced by an identical slice.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MergedSlice {
    pub function:       String,
    pub value:          ValueId,
    pub representative: ValueId,
}

/// A group of slices that all describe the same memory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AliasClass {
    pub buffer: BufferId,

    /// The canonical offset shared by the members.
    pub offset: AffineExpr,
    pub length: u64,

    /// The members of the class, each with the function it belongs to.
    pub members: Vec<(String, ValueId)>,
}

/// The data returned by the slice merging pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MergePointersData {
    /// The slices that were replaced, in the order they were replaced in.
    pub merged: Vec<MergedSlice>,

    /// The total number of uses that were replaced.
    pub replaced_uses: usize,

    /// Every group of more than one identical slice in the module.
    pub alias_classes: Vec<AliasClass>,
}

impl PassDataOps for MergePointersData {}

impl ConcretePassData for MergePointersData {
    type Pass = MergePointersToSameSlice;
}

/// The position of a definition: the block and position within it at every
/// level of region nesting, outermost first.
///
/// Block arguments are at position `0`, and the results of the `i`th
/// operation of a block at position `i + 1`.
type Site = Vec<(BlockId, usize)>;

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct SliceKey {
    buffer:  BufferId,
    offset:  AffineExpr,
    length:  u64,
    element: ScalarType,
}

#[derive(Clone, Debug)]
struct Member {
    value: ValueId,
    site:  Site,
}

/// The slices of a function with resolved offsets, grouped by what they
/// describe, in program order.
struct SliceClasses {
    classes: Vec<(SliceKey, Vec<Member>)>,
}

impl SliceClasses {
    fn compute(function: &Function) -> Self {
        let ranges = IndexRanges::compute(function);
        let mut sites = Vec::new();
        collect_sites(&function.body, &mut Vec::new(), &mut sites);

        let mut classes: Vec<(SliceKey, Vec<Member>)> = Vec::new();
        let mut index: HashMap<SliceKey, usize> = HashMap::new();
        for (value, site) in sites {
            let Some(slice) = function.value_type(value).as_slice() else {
                continue;
            };
            let SliceOffset::Affine(offset) = &slice.offset else {
                continue;
            };
            let key = SliceKey {
                buffer:  slice.buffer,
                offset:  canonicalize(offset, &|leaf| ranges.leaf_range(leaf, &[])),
                length:  slice.length,
                element: slice.element,
            };
            let member = Member { value, site };
            match index.get(&key) {
                Some(i) => classes[*i].1.push(member),
                None => {
                    index.insert(key.clone(), classes.len());
                    classes.push((key, vec![member]));
                }
            }
        }

        Self { classes }
    }
}

/// The alias classes of a module, in the order their first member was found.
#[derive(Debug, Default)]
struct ModuleAliases {
    classes: Vec<AliasClass>,

    /// The class of every key, along with the function it is confined to if
    /// its offset is not constant.
    index: HashMap<(Option<String>, SliceKey), usize>,
}

impl ModuleAliases {
    fn add(&mut self, function: &str, key: &SliceKey, members: &[Member]) {
        let scope = (!key.offset.leaves().is_empty()).then(|| function.to_string());
        let class = *self.index.entry((scope, key.clone())).or_insert_with(|| {
            self.classes.push(AliasClass {
                buffer:  key.buffer,
                offset:  key.offset.clone(),
                length:  key.length,
                members: Vec::new(),
            });
            self.classes.len() - 1
        });
        self.classes[class]
            .members
            .extend(members.iter().map(|m| (function.to_string(), m.value)));
    }

    fn finish(self) -> Vec<AliasClass> {
        self.classes.into_iter().filter(|c| c.members.len() > 1).collect()
    }
}

fn collect_sites(region: &Region, outer: &mut Site, sites: &mut Vec<(ValueId, Site)>) {
    let at = |outer: &Site, block: BlockId, position: usize| {
        let mut site = outer.clone();
        site.push((block, position));
        site
    };
    for block in &region.blocks {
        for arg in &block.arguments {
            sites.push((*arg, at(outer, block.id, 0)));
        }
        for (i, op) in block.operations.iter().enumerate() {
            for result in &op.results {
                sites.push((*result, at(outer, block.id, i + 1)));
            }
            outer.push((block.id, i + 1));
            for nested in &op.regions {
                collect_sites(nested, outer, sites);
            }
            outer.pop();
        }
    }
}

/// Returns `true` if the definition at `a` dominates the definition at `b`.
fn dominates(a: &Site, b: &Site, entry: BlockId) -> bool {
    let Some(((block, position), outer)) = a.split_last() else {
        return false;
    };
    if outer.is_empty() && *block == entry && b.first().is_some_and(|(first, _)| *first != entry) {
        return true;
    }
    match b.get(outer.len()) {
        Some((b_block, b_position)) => {
            b[..outer.len()] == *outer && b_block == block && b_position > position
        }
        None => false,
    }
}

#[cfg(test)]
mod test {
    use klo_ir::{
        affine::AffineExpr,
        builder::FunctionBuilder,
        module::BufferKind,
        op::{MemOp, Opcode},
        types::{ScalarType, SliceType, Type},
        Module,
        ValueId,
    };

    use crate::pass::{
        data::DynPassDataMap,
        merge_pointers::{MergePointersData, MergePointersToSameSlice},
        slice_indices::PropagateSliceIndices,
        PassOps,
    };

    fn slice_module(build: impl FnOnce(&mut FunctionBuilder, ValueId, &Type)) -> Module {
        let mut module = Module::new("m");
        let buffer = module.allocations.add("k.arg0", 64, BufferKind::Parameter {
            function: "k".into(),
            index:    0,
        });
        let whole = Type::Slice(SliceType::new(buffer, 64, ScalarType::F32));
        let element = Type::Slice(SliceType::new(buffer, 4, ScalarType::F32));
        let mut builder = FunctionBuilder::new("k", &[whole, Type::I1], &[]);
        let base = builder.params()[0];
        build(&mut builder, base, &element);
        builder.ret(&[]);
        module.with_function(builder.finish())
    }

    fn merge(module: Module) -> anyhow::Result<(Module, MergePointersData)> {
        let propagated = PropagateSliceIndices::new().run(module, &DynPassDataMap::new())?;
        let result = MergePointersToSameSlice::new().run(propagated.module, &DynPassDataMap::new())?;
        let data = result.unwrap_data_as::<MergePointersData>().clone();
        Ok((result.module, data))
    }

    fn loaded_slices(module: &Module) -> Vec<ValueId> {
        let mut slices = Vec::new();
        module.functions[0].walk_ops(&mut |op| {
            if matches!(op.opcode, Opcode::Mem(MemOp::Load { .. })) {
                slices.push(op.operands[0]);
            }
        });
        slices
    }

    #[test]
    fn reordered_offsets_are_merged() -> anyhow::Result<()> {
        let mut slices = vec![];
        let module = slice_module(|b, base, element| {
            let i = b.thread_id(0, 16);
            let first = AffineExpr::dim(0) * 4 + AffineExpr::constant(0);
            let second = AffineExpr::constant(0) + AffineExpr::dim(0) * 4;
            let a = b.subslice(base, first, &[i], element.clone());
            let c = b.subslice(base, second, &[i], element.clone());
            b.load(a, AffineExpr::constant(0), &[], ScalarType::F32);
            b.load(c, AffineExpr::constant(0), &[], ScalarType::F32);
            slices = vec![a, c];
        });
        let (module, data) = merge(module)?;

        assert_eq!(loaded_slices(&module), vec![slices[0], slices[0]]);
        assert_eq!(data.merged.len(), 1);
        assert_eq!(data.merged[0].value, slices[1]);
        assert_eq!(data.merged[0].representative, slices[0]);
        assert_eq!(data.replaced_uses, 1);
        assert_eq!(data.alias_classes.len(), 1);
        assert_eq!(data.alias_classes[0].members.len(), 2);

        Ok(())
    }

    #[test]
    fn merging_is_idempotent() -> anyhow::Result<()> {
        let module = slice_module(|b, base, element| {
            let i = b.thread_id(0, 16);
            let a = b.subslice(base, AffineExpr::dim(0) * 4, &[i], element.clone());
            let c = b.subslice(base, AffineExpr::dim(0) * 2 * 2, &[i], element.clone());
            b.load(a, AffineExpr::constant(0), &[], ScalarType::F32);
            b.load(c, AffineExpr::constant(0), &[], ScalarType::F32);
        });
        let (once, _) = merge(module)?;
        let (twice, data) = merge(once.clone())?;

        assert_eq!(once, twice);
        assert_eq!(data.replaced_uses, 0);

        Ok(())
    }

    #[test]
    fn differing_lengths_are_kept_apart() -> anyhow::Result<()> {
        let module = slice_module(|b, base, element| {
            let mut pair = element.clone();
            if let Type::Slice(s) = &mut pair {
                s.length = 8;
            }
            b.subslice(base, AffineExpr::constant(4), &[], element.clone());
            b.subslice(base, AffineExpr::constant(4), &[], pair);
        });
        let (_, data) = merge(module)?;

        assert!(data.merged.is_empty());
        assert!(data.alias_classes.is_empty());

        Ok(())
    }

    #[test]
    fn sibling_branches_do_not_dominate_each_other() -> anyhow::Result<()> {
        let mut outer = None;
        let module = slice_module(|b, base, element| {
            let cond = b.params()[1];
            let before = b.subslice(base, AffineExpr::constant(8), &[], element.clone());
            outer = Some(before);
            b.if_else(
                cond,
                &[],
                |b| {
                    let s = b.subslice(base, AffineExpr::constant(12), &[], element.clone());
                    b.load(s, AffineExpr::constant(0), &[], ScalarType::F32);
                    let t = b.subslice(base, AffineExpr::constant(8), &[], element.clone());
                    b.load(t, AffineExpr::constant(0), &[], ScalarType::F32);
                    vec![]
                },
                |b| {
                    let s = b.subslice(base, AffineExpr::constant(12), &[], element.clone());
                    b.load(s, AffineExpr::constant(0), &[], ScalarType::F32);
                    vec![]
                },
            );
        });
        let (module, data) = merge(module)?;

        // Only the slice at 8 inside the branch has a dominating twin.
        assert_eq!(data.merged.len(), 1);
        assert_eq!(Some(data.merged[0].representative), outer);
        let loaded = loaded_slices(&module);
        assert_eq!(loaded[1], outer.unwrap_or_default());
        assert_ne!(loaded[0], loaded[2]);

        Ok(())
    }

    #[test]
    fn alias_classes_span_functions() -> anyhow::Result<()> {
        let mut module = Module::new("m");
        let buffer = module.allocations.add("shared", 64, BufferKind::Local {
            function: "a".into(),
        });
        let whole = Type::Slice(SliceType::new(buffer, 64, ScalarType::F32));
        let element = Type::Slice(SliceType::new(buffer, 4, ScalarType::F32));

        let mut constant_slices = Vec::new();
        for name in ["a", "b"] {
            let mut builder = FunctionBuilder::new(name, &[whole.clone()], &[]);
            let base = builder.params()[0];
            let fixed = builder.subslice(base, AffineExpr::constant(8), &[], element.clone());
            let i = builder.thread_id(0, 16);
            let per_thread = builder.subslice(base, AffineExpr::dim(0) * 4, &[i], element.clone());
            builder.load(fixed, AffineExpr::constant(0), &[], ScalarType::F32);
            builder.load(per_thread, AffineExpr::constant(0), &[], ScalarType::F32);
            builder.ret(&[]);
            module = module.with_function(builder.finish());
            constant_slices.push((name.to_string(), fixed));
        }
        let (_, data) = merge(module)?;

        // Slices are only ever replaced within their own function.
        assert!(data.merged.is_empty());
        assert_eq!(data.alias_classes.len(), 1);
        let class = &data.alias_classes[0];
        assert_eq!(class.buffer, buffer);
        assert_eq!(class.offset, AffineExpr::constant(8));
        assert_eq!(class.length, 4);
        assert_eq!(class.members, constant_slices);

        Ok(())
    }

    #[test]
    fn opaque_slices_never_merge() -> anyhow::Result<()> {
        let module = slice_module(|b, base, element| {
            let x = b.push_one(Opcode::Unregistered("vendor.index".into()), &[], Type::INDEX);
            b.subslice(base, AffineExpr::dim(0), &[x], element.clone());
            b.subslice(base, AffineExpr::dim(0), &[x], element.clone());
        });
        let (_, data) = merge(module)?;

        assert!(data.merged.is_empty());

        Ok(())
    }
}
