//! Generates target code for a validated program.
//!
//! Everything architecture-independent lives here: control-flow lowering,
//! short-circuit evaluation, call-argument marshaling, and epilogue
//! sharing. Everything target-specific sits behind [Backend], a fixed
//! contract of instruction-emission primitives implemented by the x86-64
//! and AArch64 assembly emitters and by the stack-bytecode emitter.
//!
//! The abstract execution model is a value stack: every value-producing
//! primitive leaves exactly one value on the target's evaluation stack
//! and consumers take their operands from it. On the register targets the
//! "stack" is the hardware stack plus an accumulator; on the bytecode
//! target it is the VM's operand stack directly.

use std::str::FromStr;

use crate::asm::aarch64::Aarch64Backend;
use crate::asm::x86_64::{CallConvention, X86Backend};
use crate::ast::{
    BinaryOp, BlockItem, Declaration, Expression, ForInit, Function, Item, LoopId, Program,
    Statement, Storage, UnaryOp, VarRef,
};
use crate::bytecode::BytecodeBackend;
use crate::errors::CodegenError;

/// Ints are 4 bytes on every target.
pub const INT_SIZE: u32 = 4;

/// Width of one staged call argument, matching the value-stack slot.
const ARG_SLOT_SIZE: u32 = 8;

/// The architecture/OS pair the code generator drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    X86_64Linux,
    X86_64Windows,
    Aarch64,
    Bytecode,
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64-linux" => Ok(Target::X86_64Linux),
            "x86_64-windows" => Ok(Target::X86_64Windows),
            "aarch64" => Ok(Target::Aarch64),
            "bytecode" => Ok(Target::Bytecode),
            other => Err(format!(
                "unknown target `{other}` (expected x86_64-linux, x86_64-windows, aarch64, or bytecode)"
            )),
        }
    }
}

/// The instruction-emission contract every target implements.
///
/// Storage offsets are byte offsets (`slot * INT_SIZE`); each backend maps
/// them onto its own frame layout. `store_local`/`store_global` leave the
/// stored value on the value stack, because assignment is an expression.
pub trait Backend {
    /// Short target name for diagnostics.
    fn target_name(&self) -> &'static str;
    /// How many call arguments this target can pass in registers.
    fn max_register_args(&self) -> usize;

    // Frame
    fn function_prologue(&mut self, name: &str);
    /// Emits the epilogue; expects the return value on top of the value
    /// stack.
    fn function_epilogue(&mut self);
    fn allocate_memory(&mut self, bytes: u32);
    fn deallocate_memory(&mut self, bytes: u32);
    /// Allocate at least `bytes`, rounded up to the target's stack
    /// alignment; returns what was actually reserved.
    fn allocate_at_least(&mut self, bytes: u32) -> u32;

    // Storage
    fn load_local(&mut self, offset: u32);
    fn store_local(&mut self, offset: u32);
    /// Zero-fill a slot without going through the value stack.
    fn initialize_local(&mut self, offset: u32);
    fn load_global(&mut self, name: &str);
    fn store_global(&mut self, name: &str);

    // Control
    fn label(&mut self, name: &str);
    fn jump(&mut self, label: &str);
    /// Branch taken when the value consumed by `compare_zero` was zero.
    fn jump_equal(&mut self, label: &str);
    /// Branch taken when the value consumed by `compare_zero` was nonzero.
    fn jump_not_equal(&mut self, label: &str);
    /// Consume the top of the value stack and compare it against zero.
    fn compare_zero(&mut self);
    /// Push 1 if the value consumed by `compare_zero` was nonzero, else 0.
    fn set_if_not_equal(&mut self);

    // Values
    fn integer_constant(&mut self, value: i32);
    /// Discard the top of the value stack.
    fn drop_value(&mut self);

    // Operators
    fn unary_operation(&mut self, op: UnaryOp);
    fn binary_operation(&mut self, op: BinaryOp);
    fn comparison_operation(&mut self, op: BinaryOp);

    // Calls
    /// Pop one staged argument value into staging slot `index`.
    fn store_arg_in_stack(&mut self, index: usize, size: u32);
    /// Move staged slots `0..count` into the argument registers.
    fn move_args_into_registers(&mut self, count: usize);
    /// Spill the incoming argument registers into locals `0..count`
    /// (used in the prologue of a function definition).
    fn move_registers_into_memory(&mut self, count: usize);
    fn pre_call_deallocate(&mut self, allocated: u32, arg_count: usize);
    fn post_call_deallocate(&mut self, allocated: u32, arg_count: usize);
    /// Call, then push the returned value.
    fn call_function(&mut self, name: &str);

    // Globals
    fn generate_global_variable(&mut self, name: &str, value: i32);
    fn generate_uninitialized_global_variable(&mut self, name: &str);

    fn finish(self) -> String
    where
        Self: Sized;
}

/// Lower a validated (and optionally folded) program for the target.
pub fn generate(program: &Program, target: Target) -> Result<String, CodegenError> {
    match target {
        Target::X86_64Linux => {
            CodeGenerator::new(X86Backend::new(CallConvention::SystemV)).generate(program)
        }
        Target::X86_64Windows => {
            CodeGenerator::new(X86Backend::new(CallConvention::Windows)).generate(program)
        }
        Target::Aarch64 => CodeGenerator::new(Aarch64Backend::new()).generate(program),
        Target::Bytecode => CodeGenerator::new(BytecodeBackend::new()).generate(program),
    }
}

/// Walks the tree and drives one backend.
struct CodeGenerator<B: Backend> {
    backend: B,
    /// Fresh-label counter, local to this compilation.
    next_label: u32,
    /// End-of-function label shared by all returns, present only when the
    /// current function has more than one `return`.
    epilogue_label: Option<String>,
}

impl<B: Backend> CodeGenerator<B> {
    fn new(backend: B) -> Self {
        CodeGenerator {
            backend,
            next_label: 0,
            epilogue_label: None,
        }
    }

    fn fresh_label(&mut self, stem: &str) -> String {
        let n = self.next_label;
        self.next_label += 1;
        format!("{stem}{n}")
    }

    fn generate(mut self, program: &Program) -> Result<String, CodegenError> {
        for item in &program.items {
            if let Item::Function(f) = item {
                if f.is_definition {
                    self.generate_function(f)?;
                }
            }
        }

        // Globals go after all the code, initialized ones first.
        for (name, value) in program.initialized_globals() {
            self.backend.generate_global_variable(name, value);
        }
        for name in program.uninitialized_globals() {
            self.backend.generate_uninitialized_global_variable(name);
        }

        Ok(self.backend.finish())
    }

    fn generate_function(&mut self, function: &Function) -> Result<(), CodegenError> {
        tracing::debug!(function = %function.name, slots = function.local_slots, "generating");

        if function.params.len() > self.backend.max_register_args() {
            return Err(CodegenError::TooManyParameters {
                name: function.name.clone(),
                found: function.params.len(),
                limit: self.backend.max_register_args(),
                target: self.backend.target_name(),
            });
        }

        self.epilogue_label = if function.return_count > 1 {
            Some(self.fresh_label("ret"))
        } else {
            None
        };

        self.backend.function_prologue(&function.name);
        if function.local_slots > 0 {
            self.backend.allocate_at_least(function.local_slots * INT_SIZE);
        }
        self.backend.move_registers_into_memory(function.params.len());

        for item in &function.body {
            self.generate_block_item(item)?;
        }

        // Falling off the end returns 0. When returns share an epilogue,
        // the fall-through path pushes the 0 and joins them at the label.
        let ends_with_return = matches!(
            function.body.last(),
            Some(BlockItem::Statement(Statement::Return { .. }))
        );
        match self.epilogue_label.take() {
            Some(label) => {
                if !ends_with_return {
                    self.backend.integer_constant(0);
                }
                self.backend.label(&label);
                self.backend.function_epilogue();
            }
            None => {
                if !ends_with_return {
                    self.backend.integer_constant(0);
                    self.backend.function_epilogue();
                }
            }
        }
        Ok(())
    }

    fn generate_block_item(&mut self, item: &BlockItem) -> Result<(), CodegenError> {
        match item {
            BlockItem::Declaration(decl) => self.generate_declaration(decl),
            BlockItem::Statement(stmt) => self.generate_statement(stmt),
        }
    }

    fn generate_declaration(&mut self, decl: &Declaration) -> Result<(), CodegenError> {
        let Storage::Local { slot } = decl.storage else {
            // Globals are emitted at the end of the unit, not here.
            return Ok(());
        };
        let offset = slot * INT_SIZE;
        match &decl.init {
            Some(init) => {
                self.generate_expression(init)?;
                self.backend.store_local(offset);
                self.backend.drop_value();
            }
            None => self.backend.initialize_local(offset),
        }
        Ok(())
    }

    fn generate_statement(&mut self, stmt: &Statement) -> Result<(), CodegenError> {
        match stmt {
            Statement::Return { value, .. } => {
                self.generate_expression(value)?;
                match &self.epilogue_label {
                    Some(label) => {
                        let label = label.clone();
                        self.backend.jump(&label);
                    }
                    None => self.backend.function_epilogue(),
                }
                Ok(())
            }
            Statement::Expr(e) => {
                self.generate_expression(e)?;
                self.backend.drop_value();
                Ok(())
            }
            Statement::Null => Ok(()),
            Statement::Compound(items) => {
                for item in items {
                    self.generate_block_item(item)?;
                }
                Ok(())
            }
            Statement::If {
                condition,
                then_branch,
                else_branch,
            } => self.generate_if(condition, then_branch, else_branch.as_deref()),
            Statement::While {
                condition,
                body,
                loop_id,
            } => self.generate_loop(*loop_id, LoopShape::While { condition }, body),
            Statement::DoWhile {
                body,
                condition,
                loop_id,
            } => self.generate_loop(*loop_id, LoopShape::DoWhile { condition }, body),
            Statement::For {
                init,
                condition,
                step,
                body,
                loop_id,
            } => self.generate_loop(
                *loop_id,
                LoopShape::For {
                    init,
                    condition: condition.as_ref(),
                    step: step.as_ref(),
                },
                body,
            ),
            Statement::Break { loop_id, .. } => {
                self.backend.jump(&loop_label(*loop_id, "end"));
                Ok(())
            }
            Statement::Continue { loop_id, .. } => {
                self.backend.jump(&loop_label(*loop_id, "continue"));
                Ok(())
            }
        }
    }

    fn generate_if(
        &mut self,
        condition: &Expression,
        then_branch: &Statement,
        else_branch: Option<&Statement>,
    ) -> Result<(), CodegenError> {
        self.generate_expression(condition)?;
        self.backend.compare_zero();

        match else_branch {
            Some(else_branch) => {
                let else_label = self.fresh_label("else");
                let end_label = self.fresh_label("endif");
                self.backend.jump_equal(&else_label);
                self.generate_statement(then_branch)?;
                self.backend.jump(&end_label);
                self.backend.label(&else_label);
                self.generate_statement(else_branch)?;
                self.backend.label(&end_label);
            }
            None => {
                let end_label = self.fresh_label("endif");
                self.backend.jump_equal(&end_label);
                self.generate_statement(then_branch)?;
                self.backend.label(&end_label);
            }
        }
        Ok(())
    }

    /// One skeleton for all four loop kinds. Per loop id there are four
    /// labels: begin (top of body), continue (before the step), post
    /// (the condition test), end. `while` and `for` jump straight to the
    /// test before first entering the body; `do`-`while` falls into the
    /// body unconditionally.
    fn generate_loop(
        &mut self,
        loop_id: LoopId,
        shape: LoopShape,
        body: &Statement,
    ) -> Result<(), CodegenError> {
        let begin = loop_label(loop_id, "begin");
        let continue_ = loop_label(loop_id, "continue");
        let post = loop_label(loop_id, "post");
        let end = loop_label(loop_id, "end");

        let condition = match shape {
            LoopShape::While { condition } => {
                self.backend.jump(&post);
                Some(condition)
            }
            LoopShape::DoWhile { condition } => Some(condition),
            LoopShape::For {
                init, condition, ..
            } => {
                match init {
                    ForInit::Empty => {}
                    ForInit::Expr(e) => {
                        self.generate_expression(e)?;
                        self.backend.drop_value();
                    }
                    ForInit::Decl(d) => self.generate_declaration(d)?,
                }
                self.backend.jump(&post);
                condition
            }
        };

        self.backend.label(&begin);
        self.generate_statement(body)?;
        self.backend.label(&continue_);
        if let LoopShape::For { step: Some(step), .. } = shape {
            self.generate_expression(step)?;
            self.backend.drop_value();
        }
        self.backend.label(&post);
        match condition {
            Some(condition) => {
                self.generate_expression(condition)?;
                self.backend.compare_zero();
                self.backend.jump_not_equal(&begin);
            }
            None => self.backend.jump(&begin),
        }
        self.backend.label(&end);
        Ok(())
    }

    fn generate_expression(&mut self, expr: &Expression) -> Result<(), CodegenError> {
        match expr {
            Expression::Constant { value, .. } => {
                self.backend.integer_constant(*value);
                Ok(())
            }
            Expression::Var { name, reference, .. } => {
                match reference {
                    VarRef::Local { slot } => self.backend.load_local(slot * INT_SIZE),
                    VarRef::Global | VarRef::Unresolved => self.backend.load_global(name),
                }
                Ok(())
            }
            Expression::Assign {
                name,
                reference,
                value,
                ..
            } => {
                self.generate_expression(value)?;
                match reference {
                    VarRef::Local { slot } => self.backend.store_local(slot * INT_SIZE),
                    VarRef::Global | VarRef::Unresolved => self.backend.store_global(name),
                }
                Ok(())
            }
            Expression::Unary { op, operand } => {
                self.generate_expression(operand)?;
                self.backend.unary_operation(*op);
                Ok(())
            }
            Expression::Binary { op, lhs, rhs } => {
                if op.needs_short_circuit() {
                    return self.generate_short_circuit(*op, lhs, rhs);
                }
                self.generate_expression(lhs)?;
                self.generate_expression(rhs)?;
                if op.is_comparison() {
                    self.backend.comparison_operation(*op);
                } else {
                    self.backend.binary_operation(*op);
                }
                Ok(())
            }
            Expression::Conditional {
                condition,
                then_value,
                else_value,
            } => {
                let else_label = self.fresh_label("ternary_else");
                let end_label = self.fresh_label("ternary_end");
                self.generate_expression(condition)?;
                self.backend.compare_zero();
                self.backend.jump_equal(&else_label);
                self.generate_expression(then_value)?;
                self.backend.jump(&end_label);
                self.backend.label(&else_label);
                self.generate_expression(else_value)?;
                self.backend.label(&end_label);
                Ok(())
            }
            Expression::Call { name, args, .. } => self.generate_call(name, args),
        }
    }

    /// Only the operand that decides the result is evaluated; this fixes
    /// the observable side-effect order and must match the interpreter.
    fn generate_short_circuit(
        &mut self,
        op: BinaryOp,
        lhs: &Expression,
        rhs: &Expression,
    ) -> Result<(), CodegenError> {
        let rhs_label = self.fresh_label("sc_rhs");
        let end_label = self.fresh_label("sc_end");

        self.generate_expression(lhs)?;
        self.backend.compare_zero();
        match op {
            BinaryOp::LogicalOr => {
                // Left zero: the right operand decides. Otherwise 1.
                self.backend.jump_equal(&rhs_label);
                self.backend.integer_constant(1);
            }
            BinaryOp::LogicalAnd => {
                // Left nonzero: the right operand decides. Otherwise 0.
                self.backend.jump_not_equal(&rhs_label);
                self.backend.integer_constant(0);
            }
            _ => unreachable!("only `&&` and `||` short-circuit"),
        }
        self.backend.jump(&end_label);
        self.backend.label(&rhs_label);
        self.generate_expression(rhs)?;
        self.backend.compare_zero();
        self.backend.set_if_not_equal();
        self.backend.label(&end_label);
        Ok(())
    }

    /// Arguments evaluate in reverse order (last first), each staged into
    /// a temporary stack slot at its logical index; then the register
    /// arguments move in one go and the staging area is released per the
    /// backend's convention.
    fn generate_call(&mut self, name: &str, args: &[Expression]) -> Result<(), CodegenError> {
        let count = args.len();
        if count > self.backend.max_register_args() {
            return Err(CodegenError::TooManyCallArguments {
                name: name.to_string(),
                found: count,
                limit: self.backend.max_register_args(),
                target: self.backend.target_name(),
            });
        }

        let allocated = self
            .backend
            .allocate_at_least(count as u32 * ARG_SLOT_SIZE);
        for index in (0..count).rev() {
            self.generate_expression(&args[index])?;
            self.backend.store_arg_in_stack(index, ARG_SLOT_SIZE);
        }
        self.backend.move_args_into_registers(count);
        self.backend.pre_call_deallocate(allocated, count);
        self.backend.call_function(name);
        self.backend.post_call_deallocate(allocated, count);
        Ok(())
    }
}

/// The per-kind differences in the shared loop skeleton.
#[derive(Clone, Copy)]
enum LoopShape<'a> {
    While {
        condition: &'a Expression,
    },
    DoWhile {
        condition: &'a Expression,
    },
    For {
        init: &'a ForInit,
        condition: Option<&'a Expression>,
        step: Option<&'a Expression>,
    },
}

fn loop_label(loop_id: LoopId, suffix: &str) -> String {
    format!("loop{}_{}", loop_id.0, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::parse;
    use crate::validate::validate;

    fn lower(source: &str, target: Target) -> String {
        let mut program = parse(source, "test").expect("parse");
        validate(&mut program).expect("validate");
        generate(&program, target).expect("generate")
    }

    #[test]
    fn while_tests_the_condition_before_the_first_iteration() {
        let text = lower("int main() { while (0) {} return 0; }", Target::Bytecode);
        let jump = text
            .lines()
            .position(|l| l == "jmp loop0_post")
            .expect("entry jump");
        let begin = text
            .lines()
            .position(|l| l == ":loop0_begin")
            .expect("begin label");
        assert!(jump < begin, "entry jump must precede the body:\n{text}");
    }

    #[test]
    fn do_while_enters_the_body_unconditionally() {
        let text = lower("int main() { do {} while (0); return 0; }", Target::Bytecode);
        assert!(!text.contains("jmp loop0_post"), "{text}");
    }

    #[test]
    fn if_branches_on_zero_to_the_else_label() {
        let text = lower(
            "int main() { int x = 1; if (x) return 1; else return 2; }",
            Target::Bytecode,
        );
        // Label 0 is the shared epilogue (two returns), so the else arm
        // gets label 1.
        assert!(text.contains("jmp_z else1"), "{text}");
    }

    #[test]
    fn multiple_returns_share_one_epilogue() {
        let text = lower(
            "int main() { int x = 1; if (x) return 1; return 2; }",
            Target::Bytecode,
        );
        assert_eq!(text.matches("\nret").count(), 1, "{text}");
        assert!(text.contains("jmp ret0"), "{text}");
        assert!(text.contains(":ret0"), "{text}");
    }

    #[test]
    fn function_without_return_yields_zero() {
        let text = lower("int f() { ; } int main() { return f(); }", Target::Bytecode);
        let f_section = text.split(":main").next().expect("f comes first");
        assert!(f_section.contains("immi 0"), "{text}");
    }

    #[test]
    fn break_and_continue_target_their_loop_labels() {
        let text = lower(
            "int main() { for (int i = 0; i < 5; i = i + 1) { if (i == 2) continue; if (i == 4) break; } return 0; }",
            Target::Bytecode,
        );
        assert!(text.contains("jmp loop0_continue"), "{text}");
        assert!(text.contains("jmp loop0_end"), "{text}");
    }

    #[test]
    fn rejects_definitions_beyond_the_register_count() {
        let source = "int f(int a, int b, int c, int d, int e, int f, int g) { return a; }\
                      int main() { return f(1, 2, 3, 4, 5, 6, 7); }";
        let mut program = parse(source, "test").expect("parse");
        validate(&mut program).expect("validate");
        let err = generate(&program, Target::X86_64Linux).unwrap_err();
        assert!(matches!(
            err,
            CodegenError::TooManyParameters { found: 7, limit: 6, .. }
        ));
        // The stack VM has no register limit.
        generate(&program, Target::Bytecode).expect("bytecode lowers it");
    }

    #[test]
    fn rejects_calls_beyond_the_register_count() {
        // Only a prototype here, so the call site carries the check.
        let source = "int ext(int a, int b, int c, int d, int e);\
                      int main() { return ext(1, 2, 3, 4, 5); }";
        let mut program = parse(source, "test").expect("parse");
        validate(&mut program).expect("validate");
        let err = generate(&program, Target::X86_64Windows).unwrap_err();
        assert!(matches!(
            err,
            CodegenError::TooManyCallArguments { found: 5, limit: 4, .. }
        ));
        generate(&program, Target::Aarch64).expect("eight registers are enough");
    }

    #[test]
    fn globals_are_emitted_after_the_code() {
        let text = lower(
            "int g = 3; int h; int main() { return g; }",
            Target::X86_64Linux,
        );
        let code_end = text.find("main:").expect("function label");
        let data = text.find(".data").expect("data section");
        assert!(data > code_end, "{text}");
        assert!(text.contains("g:"), "{text}");
        assert!(text.contains(".bss"), "{text}");
    }
}
