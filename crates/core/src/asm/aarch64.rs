//! GNU-syntax AArch64 text assembly backend.
//!
//! REGISTERS:
//!
//! w0                 - accumulator; every operation's result passes through it
//! w1                 - right-hand operand of a binary operation
//! w2                 - scratch for remainder (sdiv/msub pair)
//! x9                 - address scratch for frame- and global-relative access
//! w0..w7 (argument)  - the eight argument registers of the AAPCS64
//! x29                - frame pointer; local slot i lives at x29 - 4*(i+1)
//! x30                - link register
//!
//! Wide immediates do not fit an AArch64 mov, so constants materialize as
//! a movz/movk pair over the value's 16-bit halves. Globals are addressed
//! indirectly through an adrp page plus a :lo12: offset so the output is
//! position-independent.
//!
//! The value stack is the hardware stack in 16-byte slots, which keeps sp
//! 16-aligned at every call as the architecture requires.

use crate::ast::{BinaryOp, UnaryOp};
use crate::codegen::Backend;

const STACK_ALIGNMENT: u32 = 16;
const ARG_REGISTERS: usize = 8;

pub struct Aarch64Backend {
    out: String,
}

impl Aarch64Backend {
    pub fn new() -> Self {
        Aarch64Backend { out: String::new() }
    }

    fn emit(&mut self, instr: &str) {
        self.out.push_str("    ");
        self.out.push_str(instr);
        self.out.push('\n');
    }

    fn emit_fmt(&mut self, instr: String) {
        self.emit(&instr);
    }

    /// Push x0 as a 16-byte value-stack slot.
    fn push(&mut self) {
        self.emit("str x0, [sp, #-16]!");
    }

    /// Pop the top value-stack slot into the named register.
    fn pop(&mut self, reg: &str) {
        self.emit_fmt(format!("ldr {reg}, [sp], #16"));
    }

    /// Leave the slot's address in x9. Offsets can exceed the immediate
    /// range of a load, so the address is always computed explicitly.
    fn slot_into_x9(&mut self, offset: u32) {
        self.emit_fmt(format!("sub x9, x29, #{}", offset + 4));
    }

    /// Leave a global's address in x9 (position-independent).
    fn global_into_x9(&mut self, name: &str) {
        self.emit_fmt(format!("adrp x9, {name}"));
        self.emit_fmt(format!("add x9, x9, :lo12:{name}"));
    }
}

impl Backend for Aarch64Backend {
    fn target_name(&self) -> &'static str {
        "aarch64"
    }

    fn max_register_args(&self) -> usize {
        ARG_REGISTERS
    }

    fn function_prologue(&mut self, name: &str) {
        self.out.push_str("    .text\n");
        self.out.push_str(&format!("    .globl {name}\n"));
        self.out.push_str("    .p2align 2\n");
        self.out.push_str(&format!("{name}:\n"));
        self.emit("stp x29, x30, [sp, #-16]!");
        self.emit("mov x29, sp");
    }

    fn function_epilogue(&mut self) {
        self.pop("x0");
        self.emit("mov sp, x29");
        self.emit("ldp x29, x30, [sp], #16");
        self.emit("ret");
    }

    fn allocate_memory(&mut self, bytes: u32) {
        if bytes > 0 {
            self.emit_fmt(format!("sub sp, sp, #{bytes}"));
        }
    }

    fn deallocate_memory(&mut self, bytes: u32) {
        if bytes > 0 {
            self.emit_fmt(format!("add sp, sp, #{bytes}"));
        }
    }

    fn allocate_at_least(&mut self, bytes: u32) -> u32 {
        let rounded = bytes.next_multiple_of(STACK_ALIGNMENT);
        self.allocate_memory(rounded);
        rounded
    }

    fn load_local(&mut self, offset: u32) {
        self.slot_into_x9(offset);
        self.emit("ldrsw x0, [x9]");
        self.push();
    }

    fn store_local(&mut self, offset: u32) {
        // The stored value stays on the value stack.
        self.emit("ldr x0, [sp]");
        self.slot_into_x9(offset);
        self.emit("str w0, [x9]");
    }

    fn initialize_local(&mut self, offset: u32) {
        self.slot_into_x9(offset);
        self.emit("str wzr, [x9]");
    }

    fn load_global(&mut self, name: &str) {
        self.global_into_x9(name);
        self.emit("ldrsw x0, [x9]");
        self.push();
    }

    fn store_global(&mut self, name: &str) {
        self.emit("ldr x0, [sp]");
        self.global_into_x9(name);
        self.emit("str w0, [x9]");
    }

    fn label(&mut self, name: &str) {
        self.out.push_str(&format!(".L{name}:\n"));
    }

    fn jump(&mut self, label: &str) {
        self.emit_fmt(format!("b .L{label}"));
    }

    fn jump_equal(&mut self, label: &str) {
        self.emit_fmt(format!("b.eq .L{label}"));
    }

    fn jump_not_equal(&mut self, label: &str) {
        self.emit_fmt(format!("b.ne .L{label}"));
    }

    fn compare_zero(&mut self) {
        self.pop("x0");
        self.emit("cmp w0, #0");
    }

    fn set_if_not_equal(&mut self) {
        self.emit("cset w0, ne");
        self.push();
    }

    fn integer_constant(&mut self, value: i32) {
        let bits = value as u32;
        let low = bits & 0xffff;
        let high = bits >> 16;
        self.emit_fmt(format!("movz w0, #{low}"));
        if high != 0 {
            self.emit_fmt(format!("movk w0, #{high}, lsl #16"));
        }
        self.push();
    }

    fn drop_value(&mut self) {
        self.emit("add sp, sp, #16");
    }

    fn unary_operation(&mut self, op: UnaryOp) {
        self.pop("x0");
        match op {
            UnaryOp::Negate => self.emit("neg w0, w0"),
            UnaryOp::BitwiseNot => self.emit("mvn w0, w0"),
            UnaryOp::LogicalNot => {
                self.emit("cmp w0, #0");
                self.emit("cset w0, eq");
            }
        }
        self.push();
    }

    fn binary_operation(&mut self, op: BinaryOp) {
        self.pop("x1");
        self.pop("x0");
        match op {
            BinaryOp::Add => self.emit("add w0, w0, w1"),
            BinaryOp::Subtract => self.emit("sub w0, w0, w1"),
            BinaryOp::Multiply => self.emit("mul w0, w0, w1"),
            BinaryOp::Divide => self.emit("sdiv w0, w0, w1"),
            BinaryOp::Remainder => {
                self.emit("sdiv w2, w0, w1");
                self.emit("msub w0, w2, w1, w0");
            }
            BinaryOp::ShiftLeft => self.emit("lsl w0, w0, w1"),
            BinaryOp::ShiftRight => self.emit("asr w0, w0, w1"),
            BinaryOp::BitwiseAnd => self.emit("and w0, w0, w1"),
            BinaryOp::BitwiseOr => self.emit("orr w0, w0, w1"),
            BinaryOp::BitwiseXor => self.emit("eor w0, w0, w1"),
            other => unreachable!("{other:?} is not an arithmetic operation"),
        }
        self.push();
    }

    fn comparison_operation(&mut self, op: BinaryOp) {
        self.pop("x1");
        self.pop("x0");
        self.emit("cmp w0, w1");
        let cond = match op {
            BinaryOp::Equal => "eq",
            BinaryOp::NotEqual => "ne",
            BinaryOp::Less => "lt",
            BinaryOp::LessEqual => "le",
            BinaryOp::Greater => "gt",
            BinaryOp::GreaterEqual => "ge",
            other => unreachable!("{other:?} is not a comparison"),
        };
        self.emit_fmt(format!("cset w0, {cond}"));
        self.push();
    }

    fn store_arg_in_stack(&mut self, index: usize, size: u32) {
        self.pop("x0");
        self.emit_fmt(format!("str x0, [sp, #{}]", index as u32 * size));
    }

    fn move_args_into_registers(&mut self, count: usize) {
        for index in 0..count {
            self.emit_fmt(format!("ldr w{index}, [sp, #{}]", index * 8));
        }
    }

    fn move_registers_into_memory(&mut self, count: usize) {
        for index in 0..count {
            self.emit_fmt(format!("sub x9, x29, #{}", index as u32 * 4 + 4));
            self.emit_fmt(format!("str w{index}, [x9]"));
        }
    }

    fn pre_call_deallocate(&mut self, allocated: u32, _arg_count: usize) {
        // Arguments are all in registers by now; the staging area can go.
        self.deallocate_memory(allocated);
    }

    fn post_call_deallocate(&mut self, _allocated: u32, _arg_count: usize) {}

    fn call_function(&mut self, name: &str) {
        self.emit_fmt(format!("bl {name}"));
        self.push();
    }

    fn generate_global_variable(&mut self, name: &str, value: i32) {
        self.out.push_str("    .data\n");
        self.out.push_str(&format!("    .globl {name}\n"));
        self.out.push_str("    .p2align 2\n");
        self.out.push_str(&format!("{name}:\n"));
        self.out.push_str(&format!("    .word {value}\n"));
    }

    fn generate_uninitialized_global_variable(&mut self, name: &str) {
        self.out.push_str("    .bss\n");
        self.out.push_str(&format!("    .globl {name}\n"));
        self.out.push_str("    .p2align 2\n");
        self.out.push_str(&format!("{name}:\n"));
        self.out.push_str("    .zero 4\n");
    }

    fn finish(self) -> String {
        self.out
    }
}

impl Default for Aarch64Backend {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::codegen::{generate, Target};
    use crate::parsing::parse;
    use crate::validate::validate;

    fn lower(source: &str) -> String {
        let mut program = parse(source, "test").expect("parse");
        validate(&mut program).expect("validate");
        generate(&program, Target::Aarch64).expect("generate")
    }

    #[test]
    fn frame_record_uses_the_fp_lr_pair() {
        let text = lower("int main() { return 0; }");
        assert!(text.contains("stp x29, x30, [sp, #-16]!"), "{text}");
        assert!(text.contains("mov x29, sp"), "{text}");
        assert!(text.contains("ldp x29, x30, [sp], #16"), "{text}");
    }

    #[test]
    fn small_constants_are_a_single_movz() {
        let text = lower("int main() { return 42; }");
        assert!(text.contains("movz w0, #42"), "{text}");
        assert!(!text.contains("movk"), "{text}");
    }

    #[test]
    fn wide_and_negative_constants_take_two_instructions() {
        let text = lower("int main() { return 100000; }");
        // 100000 = 0x186a0: low 16 bits 0x86a0 = 34464, high 0x1.
        assert!(text.contains("movz w0, #34464"), "{text}");
        assert!(text.contains("movk w0, #1, lsl #16"), "{text}");

        let text = lower("int main() { return 0 - 1; }");
        assert!(text.contains("movz w0, #0"), "{text}");
    }

    #[test]
    fn globals_go_through_adrp_pages() {
        let text = lower("int g = 9; int main() { return g; }");
        assert!(text.contains("adrp x9, g"), "{text}");
        assert!(text.contains("add x9, x9, :lo12:g"), "{text}");
        assert!(text.contains(".word 9"), "{text}");
    }

    #[test]
    fn arguments_fill_the_first_eight_registers() {
        let text = lower(
            "int f(int a, int b, int c) { return a; } int main() { return f(1, 2, 3); }",
        );
        assert!(text.contains("ldr w0, [sp, #0]"), "{text}");
        assert!(text.contains("ldr w1, [sp, #8]"), "{text}");
        assert!(text.contains("ldr w2, [sp, #16]"), "{text}");
    }

    #[test]
    fn remainder_lowers_to_sdiv_and_msub() {
        let text = lower("int main() { int a = 7; return a % 3; }");
        assert!(text.contains("sdiv w2, w0, w1"), "{text}");
        assert!(text.contains("msub w0, w2, w1, w0"), "{text}");
    }
}
