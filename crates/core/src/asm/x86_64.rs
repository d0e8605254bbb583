//! AT&T-syntax x86-64 text assembly backend.
//!
//! One emitter serves both calling conventions:
//!
//! - System-V: arguments in edi, esi, edx, ecx, r8d, r9d.
//! - Windows-style: arguments in ecx, edx, r8d, r9d, and the caller owns
//!   a 32-byte shadow space that stays reserved across the call.
//!
//! REGISTERS:
//!
//! eax - accumulator; every operation's result passes through it
//! edi - right-hand operand of a binary operation (SysV scratch)
//! ecx - shift counts (cl)
//! rbp - frame pointer; local slot i lives at -4*(i+1)(%rbp)
//!
//! The value stack is the hardware stack in 16-byte slots, so %rsp keeps
//! the ABI's 16-byte alignment at every call site no matter how many
//! expression temporaries are live.

use crate::ast::{BinaryOp, UnaryOp};
use crate::codegen::Backend;

const STACK_ALIGNMENT: u32 = 16;
/// Bytes the Windows convention reserves for the callee to spill into.
const SHADOW_SPACE: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConvention {
    SystemV,
    Windows,
}

impl CallConvention {
    fn arg_registers(self) -> &'static [&'static str] {
        match self {
            CallConvention::SystemV => &["edi", "esi", "edx", "ecx", "r8d", "r9d"],
            CallConvention::Windows => &["ecx", "edx", "r8d", "r9d"],
        }
    }
}

pub struct X86Backend {
    convention: CallConvention,
    out: String,
}

impl X86Backend {
    pub fn new(convention: CallConvention) -> Self {
        X86Backend {
            convention,
            out: String::new(),
        }
    }

    fn emit(&mut self, instr: &str) {
        self.out.push_str("    ");
        self.out.push_str(instr);
        self.out.push('\n');
    }

    fn emit_fmt(&mut self, instr: String) {
        self.emit(&instr);
    }

    /// Push %rax as a 16-byte value-stack slot.
    fn push(&mut self) {
        self.emit("subq $16, %rsp");
        self.emit("movq %rax, (%rsp)");
    }

    /// Pop the top value-stack slot into the named 64-bit register.
    fn pop(&mut self, reg: &str) {
        self.emit_fmt(format!("movq (%rsp), %{reg}"));
        self.emit("addq $16, %rsp");
    }

    fn slot_address(offset: u32) -> String {
        format!("-{}(%rbp)", offset + 4)
    }
}

impl Backend for X86Backend {
    fn target_name(&self) -> &'static str {
        match self.convention {
            CallConvention::SystemV => "x86_64-linux",
            CallConvention::Windows => "x86_64-windows",
        }
    }

    fn max_register_args(&self) -> usize {
        self.convention.arg_registers().len()
    }

    fn function_prologue(&mut self, name: &str) {
        self.out.push_str("    .text\n");
        self.out.push_str(&format!("    .globl {name}\n"));
        self.out.push_str(&format!("{name}:\n"));
        self.emit("pushq %rbp");
        self.emit("movq %rsp, %rbp");
    }

    fn function_epilogue(&mut self) {
        self.pop("rax");
        self.emit("movq %rbp, %rsp");
        self.emit("popq %rbp");
        self.emit("ret");
    }

    fn allocate_memory(&mut self, bytes: u32) {
        if bytes > 0 {
            self.emit_fmt(format!("subq ${bytes}, %rsp"));
        }
    }

    fn deallocate_memory(&mut self, bytes: u32) {
        if bytes > 0 {
            self.emit_fmt(format!("addq ${bytes}, %rsp"));
        }
    }

    fn allocate_at_least(&mut self, bytes: u32) -> u32 {
        let rounded = bytes.next_multiple_of(STACK_ALIGNMENT);
        self.allocate_memory(rounded);
        rounded
    }

    fn load_local(&mut self, offset: u32) {
        self.emit_fmt(format!("movslq {}, %rax", Self::slot_address(offset)));
        self.push();
    }

    fn store_local(&mut self, offset: u32) {
        // The stored value stays on the value stack.
        self.emit("movq (%rsp), %rax");
        self.emit_fmt(format!("movl %eax, {}", Self::slot_address(offset)));
    }

    fn initialize_local(&mut self, offset: u32) {
        self.emit_fmt(format!("movl $0, {}", Self::slot_address(offset)));
    }

    fn load_global(&mut self, name: &str) {
        self.emit_fmt(format!("movslq {name}(%rip), %rax"));
        self.push();
    }

    fn store_global(&mut self, name: &str) {
        self.emit("movq (%rsp), %rax");
        self.emit_fmt(format!("movl %eax, {name}(%rip)"));
    }

    fn label(&mut self, name: &str) {
        self.out.push_str(&format!(".L{name}:\n"));
    }

    fn jump(&mut self, label: &str) {
        self.emit_fmt(format!("jmp .L{label}"));
    }

    fn jump_equal(&mut self, label: &str) {
        self.emit_fmt(format!("je .L{label}"));
    }

    fn jump_not_equal(&mut self, label: &str) {
        self.emit_fmt(format!("jne .L{label}"));
    }

    fn compare_zero(&mut self) {
        self.pop("rax");
        self.emit("cmpl $0, %eax");
    }

    fn set_if_not_equal(&mut self) {
        self.emit("setne %al");
        self.emit("movzbl %al, %eax");
        self.push();
    }

    fn integer_constant(&mut self, value: i32) {
        self.emit_fmt(format!("movl ${value}, %eax"));
        self.push();
    }

    fn drop_value(&mut self) {
        self.emit("addq $16, %rsp");
    }

    fn unary_operation(&mut self, op: UnaryOp) {
        self.pop("rax");
        match op {
            UnaryOp::Negate => self.emit("negl %eax"),
            UnaryOp::BitwiseNot => self.emit("notl %eax"),
            UnaryOp::LogicalNot => {
                self.emit("cmpl $0, %eax");
                self.emit("sete %al");
                self.emit("movzbl %al, %eax");
            }
        }
        self.push();
    }

    fn binary_operation(&mut self, op: BinaryOp) {
        self.pop("rdi");
        self.pop("rax");
        match op {
            BinaryOp::Add => self.emit("addl %edi, %eax"),
            BinaryOp::Subtract => self.emit("subl %edi, %eax"),
            BinaryOp::Multiply => self.emit("imull %edi, %eax"),
            BinaryOp::Divide => {
                self.emit("cltd");
                self.emit("idivl %edi");
            }
            BinaryOp::Remainder => {
                self.emit("cltd");
                self.emit("idivl %edi");
                self.emit("movl %edx, %eax");
            }
            BinaryOp::ShiftLeft => {
                self.emit("movl %edi, %ecx");
                self.emit("sall %cl, %eax");
            }
            BinaryOp::ShiftRight => {
                self.emit("movl %edi, %ecx");
                self.emit("sarl %cl, %eax");
            }
            BinaryOp::BitwiseAnd => self.emit("andl %edi, %eax"),
            BinaryOp::BitwiseOr => self.emit("orl %edi, %eax"),
            BinaryOp::BitwiseXor => self.emit("xorl %edi, %eax"),
            other => unreachable!("{other:?} is not an arithmetic operation"),
        }
        self.push();
    }

    fn comparison_operation(&mut self, op: BinaryOp) {
        self.pop("rdi");
        self.pop("rax");
        self.emit("cmpl %edi, %eax");
        let set = match op {
            BinaryOp::Equal => "sete",
            BinaryOp::NotEqual => "setne",
            BinaryOp::Less => "setl",
            BinaryOp::LessEqual => "setle",
            BinaryOp::Greater => "setg",
            BinaryOp::GreaterEqual => "setge",
            other => unreachable!("{other:?} is not a comparison"),
        };
        self.emit_fmt(format!("{set} %al"));
        self.emit("movzbl %al, %eax");
        self.push();
    }

    fn store_arg_in_stack(&mut self, index: usize, size: u32) {
        self.pop("rax");
        self.emit_fmt(format!("movq %rax, {}(%rsp)", index as u32 * size));
    }

    fn move_args_into_registers(&mut self, count: usize) {
        let registers = self.convention.arg_registers();
        for (index, reg) in registers.iter().enumerate().take(count) {
            self.emit_fmt(format!("movl {}(%rsp), %{reg}", index * 8));
        }
    }

    fn move_registers_into_memory(&mut self, count: usize) {
        let registers = self.convention.arg_registers();
        for (index, reg) in registers.iter().enumerate().take(count) {
            self.emit_fmt(format!(
                "movl %{reg}, {}",
                Self::slot_address(index as u32 * 4)
            ));
        }
    }

    fn pre_call_deallocate(&mut self, allocated: u32, _arg_count: usize) {
        // Arguments are all in registers by now; the staging area can go.
        self.deallocate_memory(allocated);
        if self.convention == CallConvention::Windows {
            // The callee owns 32 bytes of spill space above the return
            // address and keeps it for the whole call.
            self.emit_fmt(format!("subq ${SHADOW_SPACE}, %rsp"));
        }
    }

    fn post_call_deallocate(&mut self, _allocated: u32, _arg_count: usize) {
        if self.convention == CallConvention::Windows {
            self.emit_fmt(format!("addq ${SHADOW_SPACE}, %rsp"));
        }
    }

    fn call_function(&mut self, name: &str) {
        self.emit_fmt(format!("call {name}"));
        self.push();
    }

    fn generate_global_variable(&mut self, name: &str, value: i32) {
        self.out.push_str("    .data\n");
        self.out.push_str(&format!("    .globl {name}\n"));
        self.out.push_str("    .align 4\n");
        self.out.push_str(&format!("{name}:\n"));
        self.out.push_str(&format!("    .long {value}\n"));
    }

    fn generate_uninitialized_global_variable(&mut self, name: &str) {
        self.out.push_str("    .bss\n");
        self.out.push_str(&format!("    .globl {name}\n"));
        self.out.push_str("    .align 4\n");
        self.out.push_str(&format!("{name}:\n"));
        self.out.push_str("    .zero 4\n");
    }

    fn finish(self) -> String {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{generate, Target};
    use crate::parsing::parse;
    use crate::validate::validate;

    fn lower(source: &str, target: Target) -> String {
        let mut program = parse(source, "test").expect("parse");
        validate(&mut program).expect("validate");
        generate(&program, target).expect("generate")
    }

    #[test]
    fn frames_are_bracketed_by_prologue_and_epilogue() {
        let text = lower("int main() { return 0; }", Target::X86_64Linux);
        assert!(text.contains("pushq %rbp"), "{text}");
        assert!(text.contains("movq %rsp, %rbp"), "{text}");
        assert!(text.contains("popq %rbp"), "{text}");
        assert!(text.contains("ret"), "{text}");
    }

    #[test]
    fn locals_are_rbp_relative() {
        let text = lower("int main() { int a = 7; return a; }", Target::X86_64Linux);
        assert!(text.contains("movl %eax, -4(%rbp)"), "{text}");
        assert!(text.contains("movslq -4(%rbp), %rax"), "{text}");
    }

    #[test]
    fn sysv_arguments_use_the_sysv_registers() {
        let text = lower(
            "int f(int a, int b) { return a + b; } int main() { return f(1, 2); }",
            Target::X86_64Linux,
        );
        assert!(text.contains("movl 0(%rsp), %edi"), "{text}");
        assert!(text.contains("movl 8(%rsp), %esi"), "{text}");
        // Callee spills the same registers into its first slots.
        assert!(text.contains("movl %edi, -4(%rbp)"), "{text}");
        assert!(text.contains("movl %esi, -8(%rbp)"), "{text}");
    }

    #[test]
    fn windows_calls_carry_shadow_space() {
        let text = lower(
            "int f(int a) { return a; } int main() { return f(1); }",
            Target::X86_64Windows,
        );
        assert!(text.contains("movl 0(%rsp), %ecx"), "{text}");
        assert!(text.contains("subq $32, %rsp"), "{text}");
        assert!(text.contains("addq $32, %rsp"), "{text}");
    }

    #[test]
    fn globals_use_rip_relative_addressing() {
        let text = lower("int g = 1; int main() { g = 2; return g; }", Target::X86_64Linux);
        assert!(text.contains("movl %eax, g(%rip)"), "{text}");
        assert!(text.contains("movslq g(%rip), %rax"), "{text}");
        assert!(text.contains(".long 1"), "{text}");
    }
}
