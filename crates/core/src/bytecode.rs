//! The stack-bytecode text backend.
//!
//! One instruction or label per line; labels are written `:name`. This
//! text is the contract an external VM consumes, so the mnemonic
//! spellings here are load-bearing.
//!
//! The VM is a pure stack machine: every value lives on the operand
//! stack, and each frame has a word-indexed local array addressed by
//! `loadi`/`storei`. That collapses most of the backend contract:
//!
//! - there is no allocation; frames size themselves from the slots used;
//! - `compare_zero` emits nothing, because `jmp_z`/`jmp_nz` pop the
//!   condition value and branch on it directly (`jmp_z` jumps when the
//!   popped value is zero, `jmp_nz` when it is nonzero);
//! - argument passing is the operand stack itself. The caller evaluates
//!   arguments last-to-first, leaving the first argument on top, and the
//!   callee's prologue pops them into its first locals with
//!   `storei 0..n-1`. There is no register limit.
//!
//! Binary instructions pop the right operand, then the left, and push
//! `left OP right`. `storei`/`storegi` pop the value they store, so the
//! assignment-expression contract (value stays available) is met by a
//! `dupi` first.

use crate::ast::{BinaryOp, UnaryOp};
use crate::codegen::{Backend, INT_SIZE};

pub struct BytecodeBackend {
    out: String,
}

impl BytecodeBackend {
    pub fn new() -> Self {
        BytecodeBackend { out: String::new() }
    }

    fn emit(&mut self, instr: &str) {
        self.out.push_str(instr);
        self.out.push('\n');
    }

    fn emit_fmt(&mut self, instr: String) {
        self.emit(&instr);
    }

    /// Offsets arrive in bytes; the VM indexes 4-byte words.
    fn slot(offset: u32) -> u32 {
        offset / INT_SIZE
    }
}

impl Backend for BytecodeBackend {
    fn target_name(&self) -> &'static str {
        "bytecode"
    }

    fn max_register_args(&self) -> usize {
        usize::MAX
    }

    fn function_prologue(&mut self, name: &str) {
        self.emit_fmt(format!(":{name}"));
    }

    fn function_epilogue(&mut self) {
        self.emit("ret");
    }

    fn allocate_memory(&mut self, _bytes: u32) {}

    fn deallocate_memory(&mut self, _bytes: u32) {}

    fn allocate_at_least(&mut self, bytes: u32) -> u32 {
        bytes
    }

    fn load_local(&mut self, offset: u32) {
        self.emit_fmt(format!("loadi {}", Self::slot(offset)));
    }

    fn store_local(&mut self, offset: u32) {
        self.emit("dupi");
        self.emit_fmt(format!("storei {}", Self::slot(offset)));
    }

    fn initialize_local(&mut self, offset: u32) {
        self.emit("immi 0");
        self.emit_fmt(format!("storei {}", Self::slot(offset)));
    }

    fn load_global(&mut self, name: &str) {
        self.emit_fmt(format!("loadgi {name}"));
    }

    fn store_global(&mut self, name: &str) {
        self.emit("dupi");
        self.emit_fmt(format!("storegi {name}"));
    }

    fn label(&mut self, name: &str) {
        self.emit_fmt(format!(":{name}"));
    }

    fn jump(&mut self, label: &str) {
        self.emit_fmt(format!("jmp {label}"));
    }

    fn jump_equal(&mut self, label: &str) {
        self.emit_fmt(format!("jmp_z {label}"));
    }

    fn jump_not_equal(&mut self, label: &str) {
        self.emit_fmt(format!("jmp_nz {label}"));
    }

    fn compare_zero(&mut self) {
        // The condition value stays on the stack; the following branch or
        // normalization consumes it.
    }

    fn set_if_not_equal(&mut self) {
        self.emit("cmp_ze");
        self.emit("lnoti");
    }

    fn integer_constant(&mut self, value: i32) {
        self.emit_fmt(format!("immi {value}"));
    }

    fn drop_value(&mut self) {
        self.emit("dropi");
    }

    fn unary_operation(&mut self, op: UnaryOp) {
        match op {
            UnaryOp::Negate => self.emit("negi"),
            UnaryOp::BitwiseNot => self.emit("noti"),
            UnaryOp::LogicalNot => self.emit("lnoti"),
        }
    }

    fn binary_operation(&mut self, op: BinaryOp) {
        let mnemonic = match op {
            BinaryOp::Add => "addi",
            BinaryOp::Subtract => "subi",
            BinaryOp::Multiply => "muli",
            BinaryOp::Divide => "divi",
            BinaryOp::Remainder => "remi",
            BinaryOp::ShiftLeft => "shli",
            BinaryOp::ShiftRight => "sari",
            BinaryOp::BitwiseAnd => "andi",
            BinaryOp::BitwiseOr => "ori",
            BinaryOp::BitwiseXor => "xori",
            other => unreachable!("{other:?} is not an arithmetic operation"),
        };
        self.emit(mnemonic);
    }

    fn comparison_operation(&mut self, op: BinaryOp) {
        let mnemonic = match op {
            BinaryOp::Equal => "cmp_eq",
            BinaryOp::NotEqual => "cmp_neq",
            BinaryOp::Less => "cmp_lt",
            BinaryOp::LessEqual => "cmp_le",
            BinaryOp::Greater => "cmp_gt",
            BinaryOp::GreaterEqual => "cmp_ge",
            other => unreachable!("{other:?} is not a comparison"),
        };
        self.emit(mnemonic);
    }

    fn store_arg_in_stack(&mut self, _index: usize, _size: u32) {
        // The evaluated argument is already in position on the operand
        // stack.
    }

    fn move_args_into_registers(&mut self, _count: usize) {}

    fn move_registers_into_memory(&mut self, count: usize) {
        // The caller left the first argument on top.
        for index in 0..count {
            self.emit_fmt(format!("storei {index}"));
        }
    }

    fn pre_call_deallocate(&mut self, _allocated: u32, _arg_count: usize) {}

    fn post_call_deallocate(&mut self, _allocated: u32, _arg_count: usize) {}

    fn call_function(&mut self, name: &str) {
        self.emit_fmt(format!("call {name}"));
    }

    fn generate_global_variable(&mut self, name: &str, value: i32) {
        self.emit(".data");
        self.emit_fmt(format!(":{name}"));
        self.emit_fmt(format!(".int {value}"));
    }

    fn generate_uninitialized_global_variable(&mut self, name: &str) {
        self.emit(".data");
        self.emit_fmt(format!(":{name}"));
        self.emit(".int 0");
    }

    fn finish(self) -> String {
        self.out
    }
}

impl Default for BytecodeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::codegen::{generate, Target};
    use crate::parsing::parse;
    use crate::validate::validate;
    use pretty_assertions::assert_eq;

    fn lower(source: &str) -> String {
        let mut program = parse(source, "test").expect("parse");
        validate(&mut program).expect("validate");
        generate(&program, Target::Bytecode).expect("generate")
    }

    #[test]
    fn the_smallest_program_is_three_lines() {
        assert_eq!(lower("int main() { return 42; }"), ":main\nimmi 42\nret\n");
    }

    #[test]
    fn locals_round_trip_through_word_slots() {
        let text = lower("int main() { int a = 2; int b = 3; return a + b; }");
        assert_eq!(
            text,
            ":main\n\
             immi 2\n\
             dupi\n\
             storei 0\n\
             dropi\n\
             immi 3\n\
             dupi\n\
             storei 1\n\
             dropi\n\
             loadi 0\n\
             loadi 1\n\
             addi\n\
             ret\n"
        );
    }

    #[test]
    fn callee_pops_arguments_into_its_first_slots() {
        let text = lower("int f(int a, int b) { return a - b; } int main() { return f(5, 2); }");
        // Callee prologue.
        assert!(text.starts_with(":f\nstorei 0\nstorei 1\n"), "{text}");
        // Caller evaluates the last argument first.
        assert!(text.contains("immi 2\nimmi 5\ncall f"), "{text}");
    }

    #[test]
    fn short_circuit_or_normalizes_both_paths() {
        let text = lower("int main() { int a = 1; return a || 9; }");
        assert_eq!(
            text,
            ":main\n\
             immi 1\n\
             dupi\n\
             storei 0\n\
             dropi\n\
             loadi 0\n\
             jmp_z sc_rhs0\n\
             immi 1\n\
             jmp sc_end1\n\
             :sc_rhs0\n\
             immi 9\n\
             cmp_ze\n\
             lnoti\n\
             :sc_end1\n\
             ret\n"
        );
    }

    #[test]
    fn globals_use_data_directives() {
        let text = lower("int g = 7; int h; int main() { return g; }");
        assert!(text.ends_with(".data\n:g\n.int 7\n.data\n:h\n.int 0\n"), "{text}");
    }
}
