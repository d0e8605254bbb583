//! Semantic validation: scope resolution, storage assignment, loop
//! tracking, and every well-formedness rule the later passes rely on.
//!
//! One pass over the whole translation unit. The tree is annotated in
//! place (slot indices, global flags, loop ids) and the program's global
//! table is produced as a side effect. Validation stops at the first
//! violation; there is no recovery.
//!
//! The scope model is a stack of *full map copies*: entering a block
//! pushes a copy of the enclosing map, so a lookup is always a single
//! probe of the top map. Each symbol remembers the depth it was declared
//! at, which is how shadowing stays legal while re-declaration within one
//! block stays an error.

use std::collections::HashMap;

use crate::ast::{
    BlockItem, Declaration, Expression, ForInit, Function, Global, Item, LoopId, Program,
    Statement, Storage, VarRef,
};
use crate::errors::{Location, SemanticError, SemanticErrorKind};
use crate::eval;

/// Check the whole program, annotating it in place.
pub fn validate(program: &mut Program) -> Result<(), SemanticError> {
    let mut validator = Validator::new();

    for item in &mut program.items {
        match item {
            Item::Global(decl) => validator.declare_global(decl)?,
            Item::Function(function) => validator.check_function(function)?,
        }
    }

    program.globals = validator.into_globals();
    tracing::debug!(program = %program.name, "validation complete");
    Ok(())
}

#[derive(Clone, Copy)]
struct Symbol {
    slot: u32,
    /// Scope-stack depth at declaration; shadowing re-uses the name at a
    /// deeper depth without conflict.
    depth: usize,
}

struct FunctionSig {
    param_count: usize,
    is_defined: bool,
}

struct Validator {
    functions: HashMap<String, FunctionSig>,
    globals: HashMap<String, Option<i32>>,
    global_order: Vec<String>,
    scopes: Vec<HashMap<String, Symbol>>,
    loop_stack: Vec<LoopId>,
    /// Monotonic across the whole compilation so generated label sets
    /// never collide between functions.
    next_loop_id: u32,
    /// Next storage slot in the current function. Never decremented:
    /// every declaration anywhere in the body takes a fresh slot.
    next_slot: u32,
    return_count: u32,
}

impl Validator {
    fn new() -> Self {
        let mut functions = HashMap::new();
        // The one externally-defined function every target knows about.
        functions.insert(
            "putchar".to_string(),
            FunctionSig {
                param_count: 1,
                is_defined: true,
            },
        );
        Validator {
            functions,
            globals: HashMap::new(),
            global_order: Vec::new(),
            scopes: Vec::new(),
            loop_stack: Vec::new(),
            next_loop_id: 0,
            next_slot: 0,
            return_count: 0,
        }
    }

    fn into_globals(self) -> Vec<Global> {
        let mut globals = self.globals;
        self.global_order
            .into_iter()
            .map(|name| {
                let value = globals.remove(&name).flatten();
                Global { name, value }
            })
            .collect()
    }

    // Scopes

    fn push_scope(&mut self) {
        let copy = self.scopes.last().cloned().unwrap_or_default();
        self.scopes.push(copy);
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn current_scope(&mut self) -> &mut HashMap<String, Symbol> {
        self.scopes.last_mut().expect("scope stack is never empty inside a function")
    }

    // Top-level declarations

    fn declare_global(&mut self, decl: &mut Declaration) -> Result<(), SemanticError> {
        if self.functions.contains_key(&decl.name) {
            return Err(SemanticError::new(
                SemanticErrorKind::NameCollision(decl.name.clone()),
                decl.location,
            ));
        }
        if self.globals.contains_key(&decl.name) {
            return Err(SemanticError::new(
                SemanticErrorKind::DuplicateDeclaration(decl.name.clone()),
                decl.location,
            ));
        }

        let value = match &decl.init {
            None => None,
            Some(init) => match eval::evaluate(init) {
                Some(v) => Some(v),
                None => {
                    return Err(SemanticError::new(
                        SemanticErrorKind::NonConstantGlobalInitializer(decl.name.clone()),
                        decl.location,
                    ))
                }
            },
        };

        decl.storage = Storage::Global;
        self.globals.insert(decl.name.clone(), value);
        self.global_order.push(decl.name.clone());
        Ok(())
    }

    fn check_function(&mut self, function: &mut Function) -> Result<(), SemanticError> {
        if self.globals.contains_key(&function.name) {
            return Err(SemanticError::new(
                SemanticErrorKind::NameCollision(function.name.clone()),
                function.location,
            ));
        }

        for (i, param) in function.params.iter().enumerate() {
            if function.params[..i].contains(param) {
                return Err(SemanticError::new(
                    SemanticErrorKind::DuplicateParameter(param.clone()),
                    function.location,
                ));
            }
        }

        if let Some(existing) = self.functions.get(&function.name) {
            if existing.param_count != function.params.len() {
                return Err(SemanticError::new(
                    SemanticErrorKind::SignatureMismatch {
                        name: function.name.clone(),
                        expected: existing.param_count,
                        found: function.params.len(),
                    },
                    function.location,
                ));
            }
            if function.is_definition && existing.is_defined {
                return Err(SemanticError::new(
                    SemanticErrorKind::DuplicateFunctionDefinition(function.name.clone()),
                    function.location,
                ));
            }
        }
        let signature = self
            .functions
            .entry(function.name.clone())
            .or_insert(FunctionSig {
                param_count: function.params.len(),
                is_defined: false,
            });
        signature.is_defined |= function.is_definition;

        if !function.is_definition {
            return Ok(());
        }

        // Parameters are the function's first slots.
        self.next_slot = 0;
        self.return_count = 0;
        let mut scope = HashMap::new();
        for param in &function.params {
            scope.insert(
                param.clone(),
                Symbol {
                    slot: self.next_slot,
                    depth: 0,
                },
            );
            self.next_slot += 1;
        }
        self.scopes = vec![scope];

        self.check_block_items(&mut function.body)?;

        function.return_count = self.return_count;
        function.local_slots = self.next_slot;
        self.scopes.clear();
        Ok(())
    }

    // Statements

    /// Check one statement list. A second `return` in the same list is
    /// unreachable code and rejected outright; returns nested deeper
    /// (inside an `if`, say) are the shared-epilogue case and fine.
    fn check_block_items(&mut self, items: &mut [BlockItem]) -> Result<(), SemanticError> {
        let mut seen_return = false;
        for item in items {
            match item {
                BlockItem::Declaration(decl) => self.declare_local(decl)?,
                BlockItem::Statement(stmt) => {
                    if let Statement::Return { location, .. } = stmt {
                        if seen_return {
                            return Err(SemanticError::new(
                                SemanticErrorKind::DuplicateReturn,
                                *location,
                            ));
                        }
                        seen_return = true;
                    }
                    self.check_statement(stmt)?;
                }
            }
        }
        Ok(())
    }

    fn declare_local(&mut self, decl: &mut Declaration) -> Result<(), SemanticError> {
        // The initializer sees the enclosing bindings, not the new one.
        if let Some(init) = &mut decl.init {
            self.check_expression(init)?;
        }

        let depth = self.scopes.len() - 1;
        if let Some(existing) = self.current_scope().get(&decl.name) {
            if existing.depth == depth {
                return Err(SemanticError::new(
                    SemanticErrorKind::DuplicateDeclaration(decl.name.clone()),
                    decl.location,
                ));
            }
        }

        let slot = self.next_slot;
        self.next_slot += 1;
        decl.storage = Storage::Local { slot };
        self.current_scope()
            .insert(decl.name.clone(), Symbol { slot, depth });
        Ok(())
    }

    fn check_statement(&mut self, stmt: &mut Statement) -> Result<(), SemanticError> {
        match stmt {
            Statement::Return { value, .. } => {
                self.return_count += 1;
                self.check_expression(value)
            }
            Statement::Expr(e) => self.check_expression(e),
            Statement::Null => Ok(()),
            Statement::Compound(items) => {
                self.push_scope();
                let result = self.check_block_items(items);
                self.pop_scope();
                result
            }
            Statement::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.check_expression(condition)?;
                self.check_statement(then_branch)?;
                if let Some(e) = else_branch {
                    self.check_statement(e)?;
                }
                Ok(())
            }
            Statement::While {
                condition,
                body,
                loop_id,
            } => {
                self.check_expression(condition)?;
                *loop_id = self.enter_loop();
                let result = self.check_statement(body);
                self.exit_loop();
                result
            }
            Statement::DoWhile {
                body,
                condition,
                loop_id,
            } => {
                *loop_id = self.enter_loop();
                let result = self.check_statement(body);
                self.exit_loop();
                result?;
                self.check_expression(condition)
            }
            Statement::For {
                init,
                condition,
                step,
                body,
                loop_id,
            } => {
                // A declaration in the header lives in its own scope that
                // encloses the condition, step, and body.
                self.push_scope();
                let result = (|| {
                    match init {
                        ForInit::Empty => {}
                        ForInit::Expr(e) => self.check_expression(e)?,
                        ForInit::Decl(d) => self.declare_local(d)?,
                    }
                    if let Some(c) = condition {
                        self.check_expression(c)?;
                    }
                    if let Some(s) = step {
                        self.check_expression(s)?;
                    }
                    *loop_id = self.enter_loop();
                    let body_result = self.check_statement(body);
                    self.exit_loop();
                    body_result
                })();
                self.pop_scope();
                result
            }
            Statement::Break { loop_id, location } => match self.loop_stack.last() {
                Some(id) => {
                    *loop_id = *id;
                    Ok(())
                }
                None => Err(SemanticError::new(
                    SemanticErrorKind::InvalidLoopControl { keyword: "break" },
                    *location,
                )),
            },
            Statement::Continue { loop_id, location } => match self.loop_stack.last() {
                Some(id) => {
                    *loop_id = *id;
                    Ok(())
                }
                None => Err(SemanticError::new(
                    SemanticErrorKind::InvalidLoopControl {
                        keyword: "continue",
                    },
                    *location,
                )),
            },
        }
    }

    fn enter_loop(&mut self) -> LoopId {
        let id = LoopId(self.next_loop_id);
        self.next_loop_id += 1;
        self.loop_stack.push(id);
        id
    }

    fn exit_loop(&mut self) {
        self.loop_stack.pop();
    }

    // Expressions

    fn check_expression(&mut self, expr: &mut Expression) -> Result<(), SemanticError> {
        match expr {
            Expression::Constant { .. } => Ok(()),
            Expression::Var {
                name,
                reference,
                location,
            } => {
                *reference = self.resolve_variable(name, *location)?;
                Ok(())
            }
            Expression::Assign {
                name,
                reference,
                value,
                location,
            } => {
                *reference = self.resolve_variable(name, *location)?;
                self.check_expression(value)
            }
            Expression::Unary { operand, .. } => self.check_expression(operand),
            Expression::Binary { lhs, rhs, .. } => {
                self.check_expression(lhs)?;
                self.check_expression(rhs)
            }
            Expression::Conditional {
                condition,
                then_value,
                else_value,
            } => {
                self.check_expression(condition)?;
                self.check_expression(then_value)?;
                self.check_expression(else_value)
            }
            Expression::Call {
                name,
                args,
                location,
            } => {
                let expected = match self.functions.get(name.as_str()) {
                    Some(sig) => sig.param_count,
                    None => {
                        return Err(SemanticError::new(
                            SemanticErrorKind::UnresolvedFunction(name.clone()),
                            *location,
                        ))
                    }
                };
                if args.len() > expected {
                    return Err(SemanticError::new(
                        SemanticErrorKind::TooManyArguments {
                            name: name.clone(),
                            expected,
                            found: args.len(),
                        },
                        *location,
                    ));
                }
                if args.len() < expected {
                    return Err(SemanticError::new(
                        SemanticErrorKind::TooFewArguments {
                            name: name.clone(),
                            expected,
                            found: args.len(),
                        },
                        *location,
                    ));
                }
                for arg in args {
                    self.check_expression(arg)?;
                }
                Ok(())
            }
        }
    }

    /// Current scope map first, then the global table.
    fn resolve_variable(
        &mut self,
        name: &str,
        location: Location,
    ) -> Result<VarRef, SemanticError> {
        if let Some(scope) = self.scopes.last() {
            if let Some(symbol) = scope.get(name) {
                return Ok(VarRef::Local { slot: symbol.slot });
            }
        }
        if self.globals.contains_key(name) {
            return Ok(VarRef::Global);
        }
        Err(SemanticError::new(
            SemanticErrorKind::UnresolvedVariable(name.to_string()),
            location,
        ))
    }
}
