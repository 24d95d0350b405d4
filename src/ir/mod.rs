//! Intermediate representation of pipeline functions.

pub mod expr;
pub mod function;
pub mod schedule;

pub use expr::{BinOp, Expr};
pub use function::{
    Dim, DimEstimate, DimKind, ElemType, ExternArg, FStage, FuncId, Function, InputBuffer,
    Pipeline, PipelineEnv, RVar, StageDef,
};
pub use schedule::{Directive, DirectiveOp, ForType, LoopLevel, SchedDim, Split, StageSchedule};
