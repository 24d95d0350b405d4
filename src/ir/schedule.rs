//! Per-stage schedule records and the directives that mutate them.
//!
//! The emitter drives scheduling exclusively through [`Directive`]s.
//! Applying a directive mutates the stage's [`StageSchedule`] in place
//! and renders one transcript line; the transcript re-parses into the
//! identical directive sequence.

use std::fmt;

use crate::ir::function::{Dim, StageDef};
use crate::utils::errors::TranscriptError;

/// How a loop dimension is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForType {
    Serial,
    Parallel,
    Vectorized,
}

/// Where a function is computed relative to its consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopLevel {
    /// Substituted into consumers; never materialized.
    Inlined,
    /// Computed once, outside all consumer loops.
    Root,
    /// Computed at the given loop variable of the given function.
    At {
        /// Function owning the loop.
        func: String,
        /// Loop variable to compute at.
        var: String,
    },
}

/// A loop dimension of a scheduled stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedDim {
    /// Loop variable name.
    pub var: String,
    /// True if the dimension originated from a reduction variable.
    pub is_rvar: bool,
    /// Execution mode.
    pub for_type: ForType,
}

/// A recorded split of one loop into an outer and an inner loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    /// The variable that was split.
    pub old: String,
    /// Outer loop variable.
    pub outer: String,
    /// Inner loop variable.
    pub inner: String,
    /// Extent of the inner loop.
    pub factor: i64,
}

/// Mutable schedule record of one stage.
///
/// `dims` is ordered innermost first. The store level always follows
/// the compute level; nothing in the emitter decouples them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSchedule {
    /// Current loop order, innermost first.
    pub dims: Vec<SchedDim>,
    /// Splits applied so far.
    pub splits: Vec<Split>,
    /// Compute placement.
    pub compute_level: LoopLevel,
    /// Storage placement; kept equal to the compute level.
    pub store_level: LoopLevel,
}

impl StageSchedule {
    /// The fresh schedule of an unscheduled stage: definition loop
    /// order, all loops serial, computed and stored at root.
    pub fn from_definition(def: &StageDef) -> Self {
        let dims = def
            .dims
            .iter()
            .map(|d: &Dim| SchedDim {
                var: d.var.clone(),
                is_rvar: d.is_rvar(),
                for_type: ForType::Serial,
            })
            .collect();
        Self {
            dims,
            splits: Vec::new(),
            compute_level: LoopLevel::Root,
            store_level: LoopLevel::Root,
        }
    }

    /// True if this schedule is untouched relative to the definition:
    /// no splits, all loops serial, loop order matching declaration.
    pub fn is_unscheduled(&self, def: &StageDef) -> bool {
        self.splits.is_empty()
            && self.dims.len() == def.dims.len()
            && self
                .dims
                .iter()
                .zip(def.dims.iter())
                .all(|(s, d)| s.var == d.var && s.for_type == ForType::Serial)
    }

    /// Index of a loop dimension by variable name.
    pub fn find_dim(&self, var: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.var == var)
    }

    fn split(&mut self, var: &str, outer: &str, inner: &str, factor: i64) {
        let idx = self
            .find_dim(var)
            .unwrap_or_else(|| panic!("split of unknown dimension {}", var));
        let is_rvar = self.dims[idx].is_rvar;
        self.dims[idx] = SchedDim {
            var: inner.to_string(),
            is_rvar,
            for_type: ForType::Serial,
        };
        self.dims.insert(
            idx + 1,
            SchedDim {
                var: outer.to_string(),
                is_rvar,
                for_type: ForType::Serial,
            },
        );
        self.splits.push(Split {
            old: var.to_string(),
            outer: outer.to_string(),
            inner: inner.to_string(),
            factor,
        });
    }

    fn reorder(&mut self, vars: &[String]) {
        let mut positions: Vec<usize> = vars
            .iter()
            .map(|v| {
                self.find_dim(v)
                    .unwrap_or_else(|| panic!("reorder of unknown dimension {}", v))
            })
            .collect();
        positions.sort_unstable();
        // The named dims are permuted among their own slots; unnamed
        // dims keep their positions.
        let reordered: Vec<SchedDim> = vars
            .iter()
            .map(|v| self.dims[self.find_dim(v).unwrap()].clone())
            .collect();
        for (slot, dim) in positions.into_iter().zip(reordered) {
            self.dims[slot] = dim;
        }
    }

    fn set_for_type(&mut self, var: &str, for_type: ForType) {
        let idx = self
            .find_dim(var)
            .unwrap_or_else(|| panic!("unknown dimension {}", var));
        self.dims[idx].for_type = for_type;
    }

    /// Apply one directive operation to this schedule.
    pub fn apply(&mut self, op: &DirectiveOp) {
        match op {
            DirectiveOp::ComputeInline => {
                self.compute_level = LoopLevel::Inlined;
                self.store_level = LoopLevel::Inlined;
            }
            DirectiveOp::ComputeRoot => {
                self.compute_level = LoopLevel::Root;
                self.store_level = LoopLevel::Root;
            }
            DirectiveOp::ComputeAt { func, var } => {
                self.compute_level = LoopLevel::At {
                    func: func.clone(),
                    var: var.clone(),
                };
                self.store_level = self.compute_level.clone();
            }
            DirectiveOp::Split {
                var,
                outer,
                inner,
                factor,
            } => self.split(var, outer, inner, *factor),
            DirectiveOp::Reorder { vars } => self.reorder(vars),
            DirectiveOp::Vectorize { var } => self.set_for_type(var, ForType::Vectorized),
            DirectiveOp::Parallel { var } => self.set_for_type(var, ForType::Parallel),
        }
    }
}

/// A schedule operation, without its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveOp {
    ComputeInline,
    ComputeRoot,
    ComputeAt { func: String, var: String },
    Split {
        var: String,
        outer: String,
        inner: String,
        factor: i64,
    },
    Reorder { vars: Vec<String> },
    Vectorize { var: String },
    Parallel { var: String },
}

/// A schedule operation applied to one stage of one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// Target function name.
    pub func: String,
    /// Target stage; 0 is the pure definition.
    pub stage: u32,
    /// The operation.
    pub op: DirectiveOp,
}

impl Directive {
    /// Construct a directive.
    pub fn new(func: impl Into<String>, stage: u32, op: DirectiveOp) -> Self {
        Self {
            func: func.into(),
            stage,
            op,
        }
    }

    /// Parse a full transcript back into its directive sequence.
    pub fn parse_transcript(transcript: &str) -> Result<Vec<Directive>, TranscriptError> {
        transcript
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(Directive::parse_line)
            .collect()
    }

    /// Parse a single transcript line.
    pub fn parse_line(line: &str) -> Result<Directive, TranscriptError> {
        let text = line.trim();
        let text = text
            .strip_suffix(';')
            .ok_or_else(|| TranscriptError::new("missing trailing semicolon", line))?;

        let dot = text
            .find('.')
            .ok_or_else(|| TranscriptError::new("missing target", line))?;
        let func = text[..dot].to_string();
        let mut rest = &text[dot + 1..];

        let mut stage = 0u32;
        if let Some(after) = rest.strip_prefix("update(") {
            let close = after
                .find(')')
                .ok_or_else(|| TranscriptError::new("unterminated update index", line))?;
            let idx: u32 = after[..close]
                .parse()
                .map_err(|_| TranscriptError::new("bad update index", line))?;
            stage = idx + 1;
            rest = after[close + 1..]
                .strip_prefix('.')
                .ok_or_else(|| TranscriptError::new("missing operation after update", line))?;
        }

        let open = rest
            .find('(')
            .ok_or_else(|| TranscriptError::new("missing argument list", line))?;
        let op_name = &rest[..open];
        let args_text = rest[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| TranscriptError::new("unterminated argument list", line))?;
        let args: Vec<&str> = if args_text.trim().is_empty() {
            Vec::new()
        } else {
            args_text.split(',').map(|a| a.trim()).collect()
        };

        let expect = |n: usize| -> Result<(), TranscriptError> {
            if args.len() == n {
                Ok(())
            } else {
                Err(TranscriptError::new(
                    format!("expected {} arguments for {}", n, op_name),
                    line,
                ))
            }
        };

        let op = match op_name {
            "compute_inline" => {
                expect(0)?;
                DirectiveOp::ComputeInline
            }
            "compute_root" => {
                expect(0)?;
                DirectiveOp::ComputeRoot
            }
            "compute_at" => {
                expect(2)?;
                DirectiveOp::ComputeAt {
                    func: args[0].to_string(),
                    var: args[1].to_string(),
                }
            }
            "split" => {
                expect(4)?;
                DirectiveOp::Split {
                    var: args[0].to_string(),
                    outer: args[1].to_string(),
                    inner: args[2].to_string(),
                    factor: args[3]
                        .parse()
                        .map_err(|_| TranscriptError::new("bad split factor", line))?,
                }
            }
            "reorder" => DirectiveOp::Reorder {
                vars: args.iter().map(|a| a.to_string()).collect(),
            },
            "vectorize" => {
                expect(1)?;
                DirectiveOp::Vectorize {
                    var: args[0].to_string(),
                }
            }
            "parallel" => {
                expect(1)?;
                DirectiveOp::Parallel {
                    var: args[0].to_string(),
                }
            }
            other => {
                return Err(TranscriptError::new(
                    format!("unknown directive {}", other),
                    line,
                ))
            }
        };

        Ok(Directive { func, stage, op })
    }
}

// Rendering is the inverse of parse_line; both sides must agree exactly
// for the transcript round-trip to hold.
impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stage > 0 {
            write!(f, "{}.update({})", self.func, self.stage - 1)?;
        } else {
            write!(f, "{}", self.func)?;
        }
        match &self.op {
            DirectiveOp::ComputeInline => write!(f, ".compute_inline();"),
            DirectiveOp::ComputeRoot => write!(f, ".compute_root();"),
            DirectiveOp::ComputeAt { func, var } => {
                write!(f, ".compute_at({}, {});", func, var)
            }
            DirectiveOp::Split {
                var,
                outer,
                inner,
                factor,
            } => write!(f, ".split({}, {}, {}, {});", var, outer, inner, factor),
            DirectiveOp::Reorder { vars } => write!(f, ".reorder({});", vars.join(", ")),
            DirectiveOp::Vectorize { var } => write!(f, ".vectorize({});", var),
            DirectiveOp::Parallel { var } => write!(f, ".parallel({});", var),
        }
    }
}
