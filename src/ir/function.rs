//! Function records and the pipeline environment.
//!
//! A pipeline function has one pure definition (stage 0) and any number
//! of update definitions (stages 1..k) in declaration order. Functions
//! are stored in a flat table and referenced by integer handles, so that
//! stages, groups, and cache keys stay cheap to copy, hash, and order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use crate::ir::expr::Expr;
use crate::ir::schedule::StageSchedule;
use crate::utils::errors::{UsageError, UsageErrorKind};

/// Element type of a function value or input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ElemType {
    UInt8,
    UInt16,
    UInt32,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl ElemType {
    /// Storage size of one value in bytes.
    pub fn bytes(self) -> i64 {
        match self {
            ElemType::UInt8 => 1,
            ElemType::UInt16 => 2,
            ElemType::UInt32 | ElemType::Int32 | ElemType::Float32 => 4,
            ElemType::Int64 | ElemType::Float64 => 8,
        }
    }
}

/// Kind of a loop dimension of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DimKind {
    /// Pure dimension, iterating a storage dimension of the output.
    Pure,
    /// Reduction dimension with its domain and the associativity flag
    /// surfaced by the front end.
    Reduction {
        /// Lower bound of the reduction domain.
        min: Expr,
        /// Extent of the reduction domain.
        extent: Expr,
        /// True if the reduction operator permits reordering this
        /// dimension (commutative-associative update).
        parallelizable: bool,
    },
}

/// One loop dimension of a stage. Dimension lists are ordered innermost
/// first; update stages place reduction dimensions before pure ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dim {
    /// Loop variable name.
    pub var: String,
    /// Pure or reduction.
    pub kind: DimKind,
}

impl Dim {
    /// True for pure dimensions.
    pub fn is_pure(&self) -> bool {
        matches!(self.kind, DimKind::Pure)
    }

    /// True for reduction dimensions.
    pub fn is_rvar(&self) -> bool {
        !self.is_pure()
    }

    /// True if a loop over this dimension may be reordered or run in
    /// parallel. Pure dimensions always qualify.
    pub fn parallelizable(&self) -> bool {
        match &self.kind {
            DimKind::Pure => true,
            DimKind::Reduction { parallelizable, .. } => *parallelizable,
        }
    }
}

/// A reduction variable declaration for an update definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RVar {
    /// Variable name.
    pub var: String,
    /// Lower bound of the domain.
    pub min: Expr,
    /// Extent of the domain.
    pub extent: Expr,
    /// True if the update operator is commutative-associative along
    /// this variable.
    pub parallelizable: bool,
}

impl RVar {
    /// A serial reduction variable over `[min, min + extent)`.
    pub fn new(var: impl Into<String>, min: impl Into<Expr>, extent: impl Into<Expr>) -> Self {
        Self {
            var: var.into(),
            min: min.into(),
            extent: extent.into(),
            parallelizable: false,
        }
    }

    /// Mark the reduction as reorderable.
    pub fn parallelizable(mut self) -> Self {
        self.parallelizable = true;
        self
    }
}

/// One definition (pure or update) of a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDef {
    /// Loop dimensions, innermost first.
    pub dims: Vec<Dim>,
    /// Value expressions, one per output value.
    pub values: Vec<Expr>,
    /// Left-hand-side index expression per storage dimension.
    pub args: Vec<Expr>,
}

/// A user estimate on one pure dimension of a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimEstimate {
    /// Pure argument the estimate applies to.
    pub var: String,
    /// Estimated minimum coordinate.
    pub min: i64,
    /// Estimated extent.
    pub extent: i64,
}

/// Argument of an extern (opaque) definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternArg {
    /// A whole pipeline function passed to the extern stage.
    Func(String),
    /// A scalar expression argument.
    Expr(Expr),
    /// An input buffer passed by name.
    Buffer(String),
}

/// A pipeline function: a name, ordered pure arguments, one pure stage,
/// and optional update stages.
#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    args: Vec<String>,
    output_types: Vec<ElemType>,
    stages: Vec<StageDef>,
    estimates: Vec<DimEstimate>,
    extern_args: Option<Vec<ExternArg>>,
}

impl Function {
    /// Create an undefined function over the given pure arguments.
    /// Arguments are ordered innermost first.
    pub fn new(name: impl Into<String>, args: &[&str], ty: ElemType) -> Self {
        Self {
            name: name.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            output_types: vec![ty],
            stages: Vec::new(),
            estimates: Vec::new(),
            extern_args: None,
        }
    }

    /// Create a function with an extern (opaque) definition. The region
    /// analyzer cannot see inside extern definitions; it falls back to
    /// unbounded regions for their function and buffer arguments.
    pub fn new_extern(
        name: impl Into<String>,
        args: &[&str],
        ty: ElemType,
        extern_args: Vec<ExternArg>,
    ) -> Self {
        let mut f = Function::new(name, args, ty);
        let dims = f
            .args
            .iter()
            .map(|a| Dim {
                var: a.clone(),
                kind: DimKind::Pure,
            })
            .collect();
        let lhs = f.args.iter().map(|a| Expr::var(a.clone())).collect();
        f.stages.push(StageDef {
            dims,
            values: Vec::new(),
            args: lhs,
        });
        f.extern_args = Some(extern_args);
        f
    }

    /// Provide the pure definition. Panics if already defined.
    pub fn define(mut self, value: Expr) -> Self {
        assert!(
            self.stages.is_empty() && self.extern_args.is_none(),
            "function {} is already defined",
            self.name
        );
        let dims = self
            .args
            .iter()
            .map(|a| Dim {
                var: a.clone(),
                kind: DimKind::Pure,
            })
            .collect();
        let lhs = self.args.iter().map(|a| Expr::var(a.clone())).collect();
        self.stages.push(StageDef {
            dims,
            values: vec![value],
            args: lhs,
        });
        self
    }

    /// Add an update definition. `args` are the left-hand-side index
    /// expressions; `rdom` declares the reduction variables referenced
    /// by the update. Reduction dimensions are placed innermost, in
    /// declaration order, followed by the free pure variables in
    /// argument order.
    pub fn update(mut self, args: Vec<Expr>, value: Expr, rdom: Vec<RVar>) -> Self {
        assert!(
            !self.stages.is_empty(),
            "function {} needs a pure definition before updates",
            self.name
        );
        let mut dims: Vec<Dim> = rdom
            .into_iter()
            .map(|r| Dim {
                var: r.var,
                kind: DimKind::Reduction {
                    min: r.min,
                    extent: r.extent,
                    parallelizable: r.parallelizable,
                },
            })
            .collect();
        for formal in &self.args {
            let used = args.iter().any(|a| a.uses_var(formal))
                || value.uses_var(formal);
            if used {
                dims.push(Dim {
                    var: formal.clone(),
                    kind: DimKind::Pure,
                });
            }
        }
        self.stages.push(StageDef {
            dims,
            values: vec![value],
            args,
        });
        self
    }

    /// Record an estimate on a pure dimension. The most recent estimate
    /// for a variable wins.
    pub fn estimate(mut self, var: impl Into<String>, min: i64, extent: i64) -> Self {
        self.estimates.push(DimEstimate {
            var: var.into(),
            min,
            extent,
        });
        self
    }

    /// Function name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordered pure argument names.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Output element types, one per value.
    pub fn output_types(&self) -> &[ElemType] {
        &self.output_types
    }

    /// All stage definitions, pure first.
    pub fn stages(&self) -> &[StageDef] {
        &self.stages
    }

    /// A stage definition by index.
    pub fn stage(&self, stage: u32) -> &StageDef {
        &self.stages[stage as usize]
    }

    /// Number of stages (pure plus updates).
    pub fn num_stages(&self) -> u32 {
        self.stages.len() as u32
    }

    /// Index of the final stage.
    pub fn final_stage_index(&self) -> u32 {
        self.num_stages() - 1
    }

    /// True if the function has no update definitions and is not extern.
    pub fn is_pure(&self) -> bool {
        self.stages.len() == 1 && self.extern_args.is_none()
    }

    /// True if the function has an extern definition.
    pub fn has_extern_definition(&self) -> bool {
        self.extern_args.is_some()
    }

    /// Arguments of the extern definition, if any.
    pub fn extern_arguments(&self) -> Option<&[ExternArg]> {
        self.extern_args.as_deref()
    }

    /// Recorded estimates, in declaration order.
    pub fn estimates(&self) -> &[DimEstimate] {
        &self.estimates
    }

    /// The most recent estimate for a pure argument.
    pub fn estimate_for(&self, var: &str) -> Option<&DimEstimate> {
        self.estimates.iter().rev().find(|e| e.var == var)
    }

    /// Bytes needed to store one point of the function (all values).
    pub fn bytes_per_point(&self) -> i64 {
        self.output_types.iter().map(|t| t.bytes()).sum()
    }

    /// Names of every function or buffer called by the given stage,
    /// including extern arguments.
    pub fn stage_callees(&self, stage: u32) -> BTreeSet<String> {
        let def = self.stage(stage);
        let mut out = BTreeSet::new();
        for v in &def.values {
            v.callees(&mut out);
        }
        for a in &def.args {
            a.callees(&mut out);
        }
        for d in &def.dims {
            if let DimKind::Reduction { min, extent, .. } = &d.kind {
                min.callees(&mut out);
                extent.callees(&mut out);
            }
        }
        if let Some(ext) = &self.extern_args {
            for arg in ext {
                match arg {
                    ExternArg::Func(name) | ExternArg::Buffer(name) => {
                        out.insert(name.clone());
                    }
                    ExternArg::Expr(e) => e.callees(&mut out),
                }
            }
        }
        out
    }
}

/// An input buffer feeding the pipeline. Inputs are opaque: they have a
/// type and a rank but no definition and no estimates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputBuffer {
    /// Buffer name.
    pub name: String,
    /// Element type.
    pub ty: ElemType,
    /// Number of storage dimensions.
    pub rank: usize,
}

impl InputBuffer {
    /// Declare an input buffer.
    pub fn new(name: impl Into<String>, ty: ElemType, rank: usize) -> Self {
        Self {
            name: name.into(),
            ty,
            rank,
        }
    }
}

/// Handle of a function in the pipeline environment. Handles are
/// assigned in lexicographic name order, so ordering handles orders
/// functions by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncId(pub u32);

/// Handle of one stage of one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FStage {
    /// Function handle.
    pub func: FuncId,
    /// Stage index; 0 is the pure definition.
    pub stage: u32,
}

impl FStage {
    /// Construct a stage handle.
    pub fn new(func: FuncId, stage: u32) -> Self {
        Self { func, stage }
    }
}

/// The environment of all functions reachable from the pipeline
/// outputs, plus declared inputs and scalar parameter estimates.
#[derive(Debug, Clone)]
pub struct PipelineEnv {
    funcs: Vec<Function>,
    by_name: BTreeMap<String, FuncId>,
    inputs: BTreeMap<String, InputBuffer>,
    params: BTreeMap<String, i64>,
}

impl PipelineEnv {
    /// Look up a function handle by name.
    pub fn lookup(&self, name: &str) -> Option<FuncId> {
        self.by_name.get(name).copied()
    }

    /// The function behind a handle.
    pub fn func(&self, id: FuncId) -> &Function {
        &self.funcs[id.0 as usize]
    }

    /// The function name behind a handle.
    pub fn name(&self, id: FuncId) -> &str {
        self.func(id).name()
    }

    /// All function handles, in name order.
    pub fn func_ids(&self) -> impl Iterator<Item = FuncId> + '_ {
        (0..self.funcs.len() as u32).map(FuncId)
    }

    /// All stages of all functions, in (name, stage) order.
    pub fn all_stages(&self) -> Vec<FStage> {
        let mut out = Vec::new();
        for id in self.func_ids() {
            for s in 0..self.func(id).num_stages() {
                out.push(FStage::new(id, s));
            }
        }
        out
    }

    /// The final stage of a function.
    pub fn final_stage(&self, id: FuncId) -> FStage {
        FStage::new(id, self.func(id).final_stage_index())
    }

    /// True if the name refers to a function in the environment.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// A declared input buffer by name.
    pub fn input(&self, name: &str) -> Option<&InputBuffer> {
        self.inputs.get(name)
    }

    /// All declared inputs.
    pub fn inputs(&self) -> &BTreeMap<String, InputBuffer> {
        &self.inputs
    }

    /// Recorded scalar parameter estimates.
    pub fn params(&self) -> &BTreeMap<String, i64> {
        &self.params
    }

    /// Render a stage handle for messages, as "(name, stage)".
    pub fn stage_name(&self, s: FStage) -> String {
        format!("({}, {})", self.name(s.func), s.stage)
    }

    /// Substitute calls to the functions in `inlines` by their pure
    /// definitions, recursively. Access strides and point costs must be
    /// computed on the expression after inlining; a transpose inlined
    /// into a transpose reads with identity strides, which neither
    /// expression shows on its own.
    pub fn inline_expr(&self, e: &Expr, inlines: &BTreeSet<String>) -> Expr {
        match e {
            Expr::Const(_) | Expr::Var(_) => e.clone(),
            Expr::Bin(op, a, b) => Expr::Bin(
                *op,
                Box::new(self.inline_expr(a, inlines)),
                Box::new(self.inline_expr(b, inlines)),
            ),
            Expr::Let { name, value, body } => Expr::Let {
                name: name.clone(),
                value: Box::new(self.inline_expr(value, inlines)),
                body: Box::new(self.inline_expr(body, inlines)),
            },
            Expr::Call {
                name,
                args,
                value_index,
            } => {
                let new_args: Vec<Expr> =
                    args.iter().map(|a| self.inline_expr(a, inlines)).collect();
                if inlines.contains(name) {
                    if let Some(id) = self.lookup(name) {
                        let callee = self.func(id);
                        assert!(
                            callee.is_pure(),
                            "only pure functions can be inlined, got {}",
                            name
                        );
                        let def = callee.stage(0);
                        let mut subs = BTreeMap::new();
                        for (formal, actual) in callee.args().iter().zip(new_args.iter()) {
                            subs.insert(formal.clone(), actual.clone());
                        }
                        let body = def.values[*value_index].substitute(&subs);
                        return self.inline_expr(&body, inlines);
                    }
                }
                Expr::Call {
                    name: name.clone(),
                    args: new_args,
                    value_index: *value_index,
                }
            }
        }
    }
}

/// A pipeline: the function environment reachable from the declared
/// outputs, plus one mutable schedule record per stage.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub(crate) env: PipelineEnv,
    pub(crate) outputs: Vec<FuncId>,
    pub(crate) schedules: BTreeMap<FStage, StageSchedule>,
}

impl Pipeline {
    /// Build a pipeline from function definitions, declared inputs, and
    /// output names. Only functions transitively reachable from the
    /// outputs are kept. Every call must resolve to a reachable
    /// function or a declared input, with matching arity.
    pub fn new(
        funcs: Vec<Function>,
        inputs: Vec<InputBuffer>,
        outputs: &[&str],
    ) -> Result<Pipeline, UsageError> {
        let mut registry: BTreeMap<String, Function> = BTreeMap::new();
        for f in funcs {
            let name = f.name().to_string();
            if registry.insert(name.clone(), f).is_some() {
                return Err(UsageError::new(
                    UsageErrorKind::DuplicateFunction,
                    name,
                    "function registered twice",
                ));
            }
        }
        let input_map: BTreeMap<String, InputBuffer> =
            inputs.into_iter().map(|i| (i.name.clone(), i)).collect();

        // Transitive call closure of the outputs.
        let mut reachable: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        for out in outputs {
            if !registry.contains_key(*out) {
                return Err(UsageError::new(
                    UsageErrorKind::UnknownOutput,
                    *out,
                    "output is not a registered function",
                ));
            }
            if reachable.insert(out.to_string()) {
                queue.push_back(out.to_string());
            }
        }
        while let Some(name) = queue.pop_front() {
            let f = &registry[&name];
            for s in 0..f.num_stages() {
                for callee in f.stage_callees(s) {
                    if registry.contains_key(&callee) && reachable.insert(callee.clone()) {
                        queue.push_back(callee);
                    }
                }
            }
        }

        // Handles in name order; the grouping engine relies on handle
        // order matching lexicographic name order.
        let mut table: Vec<Function> = Vec::new();
        let mut by_name: BTreeMap<String, FuncId> = BTreeMap::new();
        for name in &reachable {
            by_name.insert(name.clone(), FuncId(table.len() as u32));
            table.push(registry[name].clone());
        }

        let env = PipelineEnv {
            funcs: table,
            by_name,
            inputs: input_map,
            params: BTreeMap::new(),
        };

        // Every callee resolves to a function or a declared input.
        for id in env.func_ids() {
            let f = env.func(id);
            for s in 0..f.num_stages() {
                for callee in f.stage_callees(s) {
                    if !env.contains(&callee) && env.input(&callee).is_none() {
                        return Err(UsageError::new(
                            UsageErrorKind::UnknownCallee,
                            f.name(),
                            format!(
                                "call to \"{}\" which is neither a function nor an input",
                                callee
                            ),
                        ));
                    }
                }
            }
        }

        let mut schedules = BTreeMap::new();
        for stg in env.all_stages() {
            let def = env.func(stg.func).stage(stg.stage);
            schedules.insert(stg, StageSchedule::from_definition(def));
        }

        let output_ids = outputs
            .iter()
            .map(|o| env.lookup(o).expect("validated above"))
            .collect();

        Ok(Pipeline {
            env,
            outputs: output_ids,
            schedules,
        })
    }

    /// The function environment.
    pub fn env(&self) -> &PipelineEnv {
        &self.env
    }

    /// The declared output functions.
    pub fn outputs(&self) -> &[FuncId] {
        &self.outputs
    }

    /// The schedule record of a stage.
    pub fn schedule(&self, stage: FStage) -> &StageSchedule {
        &self.schedules[&stage]
    }

    /// Record an estimate for a free scalar parameter (for example the
    /// symbolic extent of a reduction domain).
    pub fn set_param_estimate(&mut self, name: impl Into<String>, value: i64) {
        self.env.params.insert(name.into(), value);
    }
}

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pointwise() -> Function {
        Function::new("f", &["x", "y"], ElemType::Int32)
            .define(Expr::var("x") + Expr::var("y"))
    }

    #[test]
    fn test_pure_function_dims() {
        let f = make_pointwise();
        assert!(f.is_pure());
        assert_eq!(f.num_stages(), 1);
        let dims = &f.stage(0).dims;
        assert_eq!(dims.len(), 2);
        assert!(dims.iter().all(|d| d.is_pure()));
        assert_eq!(dims[0].var, "x");
    }

    #[test]
    fn test_update_dims_rvars_innermost() {
        let f = Function::new("hist", &["x"], ElemType::Int32)
            .define(Expr::Const(0))
            .update(
                vec![Expr::var("x")],
                Expr::call("hist", vec![Expr::var("x")]) + Expr::Const(1),
                vec![RVar::new("r", 0, 64)],
            );
        assert!(!f.is_pure());
        let dims = &f.stage(1).dims;
        assert_eq!(dims[0].var, "r");
        assert!(dims[0].is_rvar());
        assert!(!dims[0].parallelizable());
        assert_eq!(dims[1].var, "x");
    }

    #[test]
    fn test_pipeline_reachability_and_ids() {
        let h = Function::new("h", &["x", "y"], ElemType::Int32)
            .define(Expr::var("x") * Expr::var("y"));
        let g = Function::new("g", &["x", "y"], ElemType::Int32)
            .define(Expr::call("h", vec![Expr::var("x"), Expr::var("y")]));
        let orphan = Function::new("zz", &["x"], ElemType::Int32).define(Expr::Const(1));
        let p = Pipeline::new(vec![h, g, orphan], vec![], &["g"]).unwrap();
        assert!(p.env().contains("g"));
        assert!(p.env().contains("h"));
        assert!(!p.env().contains("zz"));
        // Handles follow name order.
        let g_id = p.env().lookup("g").unwrap();
        let h_id = p.env().lookup("h").unwrap();
        assert!(g_id < h_id);
    }

    #[test]
    fn test_unknown_callee_rejected() {
        let g = Function::new("g", &["x"], ElemType::Int32)
            .define(Expr::call("mystery", vec![Expr::var("x")]));
        let err = Pipeline::new(vec![g], vec![], &["g"]).unwrap_err();
        assert_eq!(err.kind, UsageErrorKind::UnknownCallee);
    }

    #[test]
    fn test_inline_transpose_chain() {
        let f = Function::new("f", &["x", "y"], ElemType::Int32)
            .define(Expr::var("x") + Expr::var("y"));
        let g = Function::new("g", &["x", "y"], ElemType::Int32)
            .define(Expr::call("f", vec![Expr::var("y"), Expr::var("x")]));
        let h = Function::new("h", &["x", "y"], ElemType::Int32)
            .define(Expr::call("g", vec![Expr::var("y"), Expr::var("x")]));
        let p = Pipeline::new(vec![f, g, h], vec![], &["h"]).unwrap();

        let mut inlines = BTreeSet::new();
        inlines.insert("g".to_string());
        let h_id = p.env().lookup("h").unwrap();
        let body = &p.env().func(h_id).stage(0).values[0];
        let inlined = p.env().inline_expr(body, &inlines);
        // g(y, x) with g(x, y) = f(y, x) becomes f(x, y): the double
        // transpose cancels.
        match inlined {
            Expr::Call { name, args, .. } => {
                assert_eq!(name, "f");
                assert_eq!(args[0].as_var(), Some("x"));
                assert_eq!(args[1].as_var(), Some("y"));
            }
            other => panic!("expected call, got {}", other),
        }
    }
}
