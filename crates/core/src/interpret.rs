//! Direct execution of the validated tree.
//!
//! The interpreter shares no machinery with the backends, which is the
//! point: it is the semantics oracle the generated code is checked
//! against. It keeps its own function table, global store, and a stack of
//! per-scope variable maps (a full copy pushed for every block execution,
//! the same design as the validator's scopes).
//!
//! Control flow unwinds through three flags — has-returned, is-break,
//! is-continue. Once any of them is set, statement execution is skipped
//! until the nearest consumer: loops clear break/continue at their own
//! level, function exit clears has-returned.
//!
//! Scope maps hold shared cells, not values: the copy pushed on block
//! entry aliases the enclosing variables, so writes through an inner
//! scope stick after the block exits, while a shadowing declaration just
//! rebinds the name in the copy.
//!
//! Output is injected as a callback so tests can capture what `putchar`
//! writes instead of scraping stdout.

use std::cell::Cell;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

use crate::ast::{
    BinaryOp, BlockItem, Declaration, Expression, ForInit, Function, Item, Program, Statement,
    Storage, VarRef,
};
use crate::errors::RuntimeError;
use crate::eval::{self, ArithmeticFault};

/// Run `main` and produce its return value, writing `putchar` output to
/// stdout.
pub fn interpret(program: &Program) -> Result<i32, RuntimeError> {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    interpret_with_output(program, &mut |byte| {
        let _ = handle.write_all(&[byte]);
    })
}

/// Run `main` with a custom sink for `putchar`.
pub fn interpret_with_output(
    program: &Program,
    out: &mut dyn FnMut(u8),
) -> Result<i32, RuntimeError> {
    tracing::debug!(program = %program.name, "interpreting");
    Interpreter::new(program, out).run()
}

struct Interpreter<'p, 'io> {
    functions: HashMap<&'p str, &'p Function>,
    /// The last value each function returned; reading a call's result
    /// means reading this slot right after the callee finishes.
    return_values: HashMap<&'p str, i32>,
    globals: HashMap<&'p str, i32>,
    scopes: Vec<HashMap<&'p str, Rc<Cell<i32>>>>,
    call_stack: Vec<&'p str>,
    has_returned: bool,
    is_break: bool,
    is_continue: bool,
    out: &'io mut dyn FnMut(u8),
}

impl<'p, 'io> Interpreter<'p, 'io> {
    fn new(program: &'p Program, out: &'io mut dyn FnMut(u8)) -> Self {
        let mut functions = HashMap::new();
        for item in &program.items {
            if let Item::Function(f) = item {
                if f.is_definition {
                    functions.insert(f.name.as_str(), f);
                }
            }
        }

        let globals = program
            .globals
            .iter()
            .map(|g| (g.name.as_str(), g.value.unwrap_or(0)))
            .collect();

        Interpreter {
            functions,
            return_values: HashMap::new(),
            globals,
            scopes: Vec::new(),
            call_stack: Vec::new(),
            has_returned: false,
            is_break: false,
            is_continue: false,
            out,
        }
    }

    fn run(&mut self) -> Result<i32, RuntimeError> {
        let main = self
            .functions
            .get("main")
            .copied()
            .ok_or(RuntimeError::MissingMain)?;
        if !main.params.is_empty() {
            return Err(RuntimeError::MainHasParameters);
        }
        self.call("main", Vec::new())
    }

    fn unwinding(&self) -> bool {
        self.has_returned || self.is_break || self.is_continue
    }

    /// Invoke a function body with its own scope stack; the caller's
    /// scopes are parked and restored around it.
    fn call(&mut self, name: &'p str, args: Vec<i32>) -> Result<i32, RuntimeError> {
        if name == "putchar" {
            // The one externally-defined function. Writes a byte, returns 0.
            (self.out)(args.first().copied().unwrap_or(0) as u8);
            return Ok(0);
        }

        let function = self
            .functions
            .get(name)
            .copied()
            .ok_or_else(|| RuntimeError::UnboundFunction(name.to_string()))?;

        let mut scope = HashMap::new();
        for (param, value) in function.params.iter().zip(args) {
            scope.insert(param.as_str(), Rc::new(Cell::new(value)));
        }

        let saved_scopes = std::mem::replace(&mut self.scopes, vec![scope]);
        self.call_stack.push(&function.name);
        // A body that never returns yields 0.
        self.return_values.insert(&function.name, 0);

        let result = self.execute_block_items(&function.body);

        self.call_stack.pop();
        self.scopes = saved_scopes;
        self.has_returned = false;
        result?;

        Ok(*self
            .return_values
            .get(name)
            .expect("return slot was seeded at call entry"))
    }

    // Statements

    fn execute_block_items(&mut self, items: &'p [BlockItem]) -> Result<(), RuntimeError> {
        for item in items {
            if self.unwinding() {
                break;
            }
            match item {
                BlockItem::Declaration(decl) => self.execute_declaration(decl)?,
                BlockItem::Statement(stmt) => self.execute_statement(stmt)?,
            }
        }
        Ok(())
    }

    fn execute_declaration(&mut self, decl: &'p Declaration) -> Result<(), RuntimeError> {
        if decl.storage == Storage::Global {
            return Ok(());
        }
        let value = match &decl.init {
            Some(init) => self.evaluate(init)?,
            None => 0,
        };
        if let Some(scope) = self.scopes.last_mut() {
            // A fresh cell: shadowing never aliases the outer binding.
            scope.insert(decl.name.as_str(), Rc::new(Cell::new(value)));
        }
        Ok(())
    }

    fn execute_statement(&mut self, stmt: &'p Statement) -> Result<(), RuntimeError> {
        if self.unwinding() {
            return Ok(());
        }
        match stmt {
            Statement::Return { value, .. } => {
                let value = self.evaluate(value)?;
                let current = *self
                    .call_stack
                    .last()
                    .expect("return executes inside a call");
                self.return_values.insert(current, value);
                self.has_returned = true;
                Ok(())
            }
            Statement::Expr(e) => {
                self.evaluate(e)?;
                Ok(())
            }
            Statement::Null => Ok(()),
            Statement::Compound(items) => {
                self.push_scope();
                let result = self.execute_block_items(items);
                self.pop_scope();
                result
            }
            Statement::If {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.evaluate(condition)? != 0 {
                    self.execute_statement(then_branch)
                } else if let Some(else_branch) = else_branch {
                    self.execute_statement(else_branch)
                } else {
                    Ok(())
                }
            }
            Statement::While {
                condition, body, ..
            } => {
                loop {
                    if self.evaluate(condition)? == 0 {
                        break;
                    }
                    self.execute_statement(body)?;
                    if !self.consume_loop_flags() {
                        break;
                    }
                }
                Ok(())
            }
            Statement::DoWhile {
                body, condition, ..
            } => {
                loop {
                    self.execute_statement(body)?;
                    if !self.consume_loop_flags() {
                        break;
                    }
                    if self.evaluate(condition)? == 0 {
                        break;
                    }
                }
                Ok(())
            }
            Statement::For {
                init,
                condition,
                step,
                body,
                ..
            } => {
                // The header's declaration lives in a scope that wraps
                // the whole loop.
                self.push_scope();
                let result = (|| {
                    match init {
                        ForInit::Empty => {}
                        ForInit::Expr(e) => {
                            self.evaluate(e)?;
                        }
                        ForInit::Decl(d) => self.execute_declaration(d)?,
                    }
                    loop {
                        let keep_going = match condition {
                            Some(c) => self.evaluate(c)? != 0,
                            None => true,
                        };
                        if !keep_going {
                            break;
                        }
                        self.execute_statement(body)?;
                        if !self.consume_loop_flags() {
                            break;
                        }
                        if let Some(step) = step {
                            self.evaluate(step)?;
                        }
                    }
                    Ok(())
                })();
                self.pop_scope();
                result
            }
            Statement::Break { .. } => {
                self.is_break = true;
                Ok(())
            }
            Statement::Continue { .. } => {
                self.is_continue = true;
                Ok(())
            }
        }
    }

    /// Settle the loop-control flags after one iteration. Returns whether
    /// the loop should continue iterating.
    fn consume_loop_flags(&mut self) -> bool {
        if self.is_break {
            self.is_break = false;
            return false;
        }
        if self.has_returned {
            return false;
        }
        if self.is_continue {
            self.is_continue = false;
        }
        true
    }

    fn push_scope(&mut self) {
        let copy = self.scopes.last().cloned().unwrap_or_default();
        self.scopes.push(copy);
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    // Expressions

    fn evaluate(&mut self, expr: &'p Expression) -> Result<i32, RuntimeError> {
        match expr {
            Expression::Constant { value, .. } => Ok(*value),
            Expression::Var {
                name, reference, ..
            } => self.read_variable(name, *reference),
            Expression::Assign {
                name,
                reference,
                value,
                ..
            } => {
                let value = self.evaluate(value)?;
                self.write_variable(name, *reference, value)?;
                Ok(value)
            }
            Expression::Unary { op, operand } => {
                let value = self.evaluate(operand)?;
                Ok(eval::apply_unary(*op, value))
            }
            Expression::Binary { op, lhs, rhs } => {
                // The short-circuit pair decides from the left operand
                // alone whenever it can.
                match op {
                    BinaryOp::LogicalOr => {
                        if self.evaluate(lhs)? != 0 {
                            return Ok(1);
                        }
                        Ok(i32::from(self.evaluate(rhs)? != 0))
                    }
                    BinaryOp::LogicalAnd => {
                        if self.evaluate(lhs)? == 0 {
                            return Ok(0);
                        }
                        Ok(i32::from(self.evaluate(rhs)? != 0))
                    }
                    _ => {
                        let left = self.evaluate(lhs)?;
                        let right = self.evaluate(rhs)?;
                        eval::apply_binary(*op, left, right).map_err(|fault| match fault {
                            ArithmeticFault::DividedByZero => RuntimeError::DivisionByZero,
                            ArithmeticFault::Overflow => RuntimeError::DivisionOverflow,
                        })
                    }
                }
            }
            Expression::Conditional {
                condition,
                then_value,
                else_value,
            } => {
                if self.evaluate(condition)? != 0 {
                    self.evaluate(then_value)
                } else {
                    self.evaluate(else_value)
                }
            }
            Expression::Call { name, args, .. } => {
                // Arguments evaluate last-to-first, the same observable
                // order every backend produces.
                let mut values = vec![0; args.len()];
                for index in (0..args.len()).rev() {
                    values[index] = self.evaluate(&args[index])?;
                }
                self.call(name, values)
            }
        }
    }

    /// Locals come from the current scope map only; the global store is
    /// consulted only when the validator marked the reference global.
    fn read_variable(&self, name: &'p str, reference: VarRef) -> Result<i32, RuntimeError> {
        match reference {
            VarRef::Global => self.globals.get(name).copied(),
            VarRef::Local { .. } | VarRef::Unresolved => self
                .scopes
                .last()
                .and_then(|scope| scope.get(name))
                .map(|cell| cell.get()),
        }
        .ok_or_else(|| RuntimeError::UnboundVariable(name.to_string()))
    }

    fn write_variable(
        &mut self,
        name: &'p str,
        reference: VarRef,
        value: i32,
    ) -> Result<(), RuntimeError> {
        match reference {
            VarRef::Global => {
                if let Some(slot) = self.globals.get_mut(name) {
                    *slot = value;
                    return Ok(());
                }
            }
            VarRef::Local { .. } | VarRef::Unresolved => {
                if let Some(cell) = self.scopes.last().and_then(|scope| scope.get(name)) {
                    cell.set(value);
                    return Ok(());
                }
            }
        }
        Err(RuntimeError::UnboundVariable(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::parse;
    use crate::validate::validate;
    use pretty_assertions::assert_eq;

    fn run(source: &str) -> i32 {
        let mut program = parse(source, "test").expect("parse");
        validate(&mut program).expect("validate");
        interpret(&program).expect("interpret")
    }

    fn run_capturing(source: &str) -> (i32, Vec<u8>) {
        let mut program = parse(source, "test").expect("parse");
        validate(&mut program).expect("validate");
        let mut output = Vec::new();
        let value = interpret_with_output(&program, &mut |b| output.push(b)).expect("interpret");
        (value, output)
    }

    #[test]
    fn trivial_return() {
        assert_eq!(run("int main() { return 0; }"), 0);
    }

    #[test]
    fn arithmetic_with_locals() {
        assert_eq!(run("int main() { int a = 2; int b = 3; return a + b * 2; }"), 8);
    }

    #[test]
    fn recursive_fibonacci() {
        assert_eq!(
            run("int fib(int n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }\
                 int main() { return fib(6); }"),
            8
        );
    }

    #[test]
    fn ternary_selects_by_condition() {
        assert_eq!(run("int main() { int x = 1; return (x == 1) ? 10 : 20; }"), 10);
    }

    #[test]
    fn while_loop_accumulates() {
        assert_eq!(
            run("int main() { int i = 0; int s = 0; while (i < 5) { s = s + i; i = i + 1; } return s; }"),
            10
        );
    }

    #[test]
    fn do_while_runs_at_least_once() {
        assert_eq!(run("int main() { int i = 9; do i = i + 1; while (0); return i; }"), 10);
    }

    #[test]
    fn continue_and_break_shape_the_iterations() {
        let (value, output) = run_capturing(
            "int main() {\
               for (int i = 0; i < 5; i = i + 1) {\
                 if (i == 2) continue;\
                 if (i == 4) break;\
                 putchar(48 + i);\
               }\
               return 0;\
             }",
        );
        assert_eq!(value, 0);
        assert_eq!(output, b"013");
    }

    #[test]
    fn short_circuit_skips_the_unneeded_operand() {
        let (value, output) = run_capturing(
            "int noisy(int c, int r) { putchar(c); return r; }\
             int main() {\
               noisy(97, 1) || noisy(98, 0);\
               noisy(99, 0) && noisy(100, 1);\
               return 0;\
             }",
        );
        assert_eq!(value, 0);
        assert_eq!(output, b"ac");
    }

    #[test]
    fn arguments_evaluate_last_to_first() {
        let (_, output) = run_capturing(
            "int noisy(int c) { putchar(c); return c; }\
             int two(int a, int b) { return 0; }\
             int main() { return two(noisy(97), noisy(98)); }",
        );
        assert_eq!(output, b"ba");
    }

    #[test]
    fn inner_scopes_shadow_and_expire() {
        assert_eq!(
            run("int main() {\
                   int a = 1;\
                   { int a = 2; a = 3; }\
                   return a;\
                 }"),
            1
        );
    }

    #[test]
    fn loop_bodies_rebind_their_declarations_each_iteration() {
        assert_eq!(
            run("int main() {\
                   int s = 0;\
                   for (int i = 0; i < 3; i = i + 1) {\
                     int x = 0;\
                     x = x + 1;\
                     s = s + x;\
                   }\
                   return s;\
                 }"),
            3
        );
    }

    #[test]
    fn globals_are_shared_across_functions() {
        assert_eq!(
            run("int counter;\
                 int bump() { counter = counter + 1; return counter; }\
                 int main() { bump(); bump(); return counter; }"),
            2
        );
    }

    #[test]
    fn global_initializers_apply() {
        assert_eq!(run("int g = 40; int main() { return g + 2; }"), 42);
    }

    #[test]
    fn implicit_return_is_zero() {
        assert_eq!(run("int f() { ; } int main() { return f() + 5; }"), 5);
    }

    #[test]
    fn return_unwinds_out_of_nested_loops() {
        assert_eq!(
            run("int main() {\
                   while (1) {\
                     while (1) {\
                       return 7;\
                     }\
                   }\
                 }"),
            7
        );
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let mut program = parse("int main() { int z = 0; return 1 / z; }", "test").expect("parse");
        validate(&mut program).expect("validate");
        assert_eq!(interpret(&program), Err(RuntimeError::DivisionByZero));
    }

    #[test]
    fn missing_main_is_reported() {
        let mut program = parse("int f() { return 1; }", "test").expect("parse");
        validate(&mut program).expect("validate");
        assert_eq!(interpret(&program), Err(RuntimeError::MissingMain));
    }

    #[test]
    fn recursion_reads_the_callee_slot_before_it_is_clobbered() {
        // Each fac(n-1) result is consumed immediately, so the shared
        // per-function slot never mixes frames up.
        assert_eq!(
            run("int fac(int n) { if (n < 2) return 1; return n * fac(n - 1); }\
                 int main() { return fac(5); }"),
            120
        );
    }
}
