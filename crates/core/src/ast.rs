//! The syntax tree and the annotations later passes write onto it.
//!
//! The tree is a strict ownership hierarchy: a parent exclusively owns its
//! children and there are no back-references, so every pass can walk it
//! with plain borrows. The parser builds it with all annotation fields at
//! their unresolved defaults; the validator fills them in place; after
//! that the tree is read-only for code generation and interpretation.

use std::fmt::Write;

use crate::errors::Location;

/// A whole translation unit.
#[derive(Debug, Clone)]
pub struct Program {
    /// Usually the source file's stem; used for diagnostics only.
    pub name: String,
    pub items: Vec<Item>,
    /// Every global in declaration order, with its compile-time initial
    /// value. Filled in by validation.
    pub globals: Vec<Global>,
}

impl Program {
    pub fn new(name: impl Into<String>, items: Vec<Item>) -> Self {
        Program {
            name: name.into(),
            items,
            globals: Vec::new(),
        }
    }

    /// Globals that carry an explicit compile-time value.
    pub fn initialized_globals(&self) -> impl Iterator<Item = (&str, i32)> {
        self.globals
            .iter()
            .filter_map(|g| g.value.map(|v| (g.name.as_str(), v)))
    }

    /// The subset of globals left without an initializer (zero-filled).
    pub fn uninitialized_globals(&self) -> impl Iterator<Item = &str> {
        self.globals
            .iter()
            .filter(|g| g.value.is_none())
            .map(|g| g.name.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum Item {
    Function(Function),
    Global(Declaration),
}

/// One global variable, as recorded by the validator.
#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    /// `None` for a global declared without an initializer.
    pub value: Option<i32>,
}

/// A function prototype or definition.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    /// Empty for a prototype; `is_definition` tells the two apart.
    pub body: Vec<BlockItem>,
    pub is_definition: bool,
    pub location: Location,
    /// Number of `return` statements anywhere in the body. Filled in by
    /// validation; more than one means codegen shares a single epilogue.
    pub return_count: u32,
    /// Total storage slots (parameters plus every declaration anywhere in
    /// the body). Slots are assigned in declaration order and never
    /// reused, so this is the frame size in 4-byte words.
    pub local_slots: u32,
}

impl Function {
    pub fn contains_return(&self) -> bool {
        self.return_count > 0
    }
}

#[derive(Debug, Clone)]
pub enum BlockItem {
    Statement(Statement),
    Declaration(Declaration),
}

/// A variable declaration, local or global.
#[derive(Debug, Clone)]
pub struct Declaration {
    pub name: String,
    pub init: Option<Expression>,
    pub location: Location,
    pub storage: Storage,
}

/// Where a declared variable lives. Written by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Storage {
    #[default]
    Unresolved,
    Local {
        slot: u32,
    },
    Global,
}

/// Identifies one loop instance; the basis for its generated label set.
/// Assigned by the validator from a counter that never repeats within a
/// compilation, so label names cannot collide across functions.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Default)]
pub struct LoopId(pub u32);

#[derive(Debug, Clone)]
pub enum Statement {
    Return {
        value: Expression,
        location: Location,
    },
    Expr(Expression),
    /// A lone `;`.
    Null,
    Compound(Vec<BlockItem>),
    If {
        condition: Expression,
        then_branch: Box<Statement>,
        else_branch: Option<Box<Statement>>,
    },
    While {
        condition: Expression,
        body: Box<Statement>,
        loop_id: LoopId,
    },
    DoWhile {
        body: Box<Statement>,
        condition: Expression,
        loop_id: LoopId,
    },
    For {
        init: ForInit,
        condition: Option<Expression>,
        step: Option<Expression>,
        body: Box<Statement>,
        loop_id: LoopId,
    },
    Break {
        loop_id: LoopId,
        location: Location,
    },
    Continue {
        loop_id: LoopId,
        location: Location,
    },
}

/// The first clause of a `for` header.
#[derive(Debug, Clone)]
pub enum ForInit {
    Empty,
    Expr(Expression),
    Decl(Declaration),
}

#[derive(Debug, Clone)]
pub enum Expression {
    Constant {
        value: i32,
        location: Location,
    },
    Var {
        name: String,
        reference: VarRef,
        location: Location,
    },
    Assign {
        name: String,
        reference: VarRef,
        value: Box<Expression>,
        location: Location,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    Conditional {
        condition: Box<Expression>,
        then_value: Box<Expression>,
        else_value: Box<Expression>,
    },
    Call {
        name: String,
        args: Vec<Expression>,
        location: Location,
    },
}

impl Expression {
    pub fn constant(value: i32, location: Location) -> Self {
        Expression::Constant { value, location }
    }

    pub fn unary(op: UnaryOp, operand: Expression) -> Self {
        Expression::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expression, rhs: Expression) -> Self {
        Expression::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }
}

/// How a variable reference or assignment resolved. Written by the
/// validator; `Unresolved` past validation is a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarRef {
    #[default]
    Unresolved,
    Local {
        slot: u32,
    },
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    BitwiseNot,
    LogicalNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    ShiftLeft,
    ShiftRight,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    LogicalAnd,
    LogicalOr,
}

impl BinaryOp {
    /// Operators whose result is always 0 or 1 and that lower through the
    /// target's compare/set primitives.
    pub fn is_comparison(self) -> bool {
        use BinaryOp::*;
        matches!(self, Equal | NotEqual | Less | LessEqual | Greater | GreaterEqual)
    }

    /// `&&` and `||`: only as many operands are evaluated as are needed
    /// to decide the result.
    pub fn needs_short_circuit(self) -> bool {
        matches!(self, BinaryOp::LogicalAnd | BinaryOp::LogicalOr)
    }
}

/// Renders the tree in an indented, one-node-per-line form for debugging.
pub fn dump(program: &Program) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "program {}", program.name);
    for item in &program.items {
        match item {
            Item::Function(f) => dump_function(f, &mut out),
            Item::Global(d) => {
                let _ = writeln!(out, "  global {} [{:?}]", d.name, d.storage);
                if let Some(init) = &d.init {
                    dump_expr(init, 2, &mut out);
                }
            }
        }
    }
    out
}

fn dump_function(f: &Function, out: &mut String) {
    let kind = if f.is_definition { "fn" } else { "fn-decl" };
    let _ = writeln!(
        out,
        "  {} {}({}) slots={} returns={}",
        kind,
        f.name,
        f.params.join(", "),
        f.local_slots,
        f.return_count
    );
    for item in &f.body {
        dump_block_item(item, 2, out);
    }
}

fn dump_block_item(item: &BlockItem, depth: usize, out: &mut String) {
    match item {
        BlockItem::Declaration(d) => {
            let _ = writeln!(out, "{:indent$}decl {} [{:?}]", "", d.name, d.storage, indent = depth * 2);
            if let Some(init) = &d.init {
                dump_expr(init, depth + 1, out);
            }
        }
        BlockItem::Statement(s) => dump_stmt(s, depth, out),
    }
}

fn dump_stmt(stmt: &Statement, depth: usize, out: &mut String) {
    let indent = depth * 2;
    match stmt {
        Statement::Return { value, .. } => {
            let _ = writeln!(out, "{:indent$}return", "");
            dump_expr(value, depth + 1, out);
        }
        Statement::Expr(e) => {
            let _ = writeln!(out, "{:indent$}expr", "");
            dump_expr(e, depth + 1, out);
        }
        Statement::Null => {
            let _ = writeln!(out, "{:indent$};", "");
        }
        Statement::Compound(items) => {
            let _ = writeln!(out, "{:indent$}block", "");
            for item in items {
                dump_block_item(item, depth + 1, out);
            }
        }
        Statement::If {
            condition,
            then_branch,
            else_branch,
        } => {
            let _ = writeln!(out, "{:indent$}if", "");
            dump_expr(condition, depth + 1, out);
            dump_stmt(then_branch, depth + 1, out);
            if let Some(e) = else_branch {
                let _ = writeln!(out, "{:indent$}else", "");
                dump_stmt(e, depth + 1, out);
            }
        }
        Statement::While {
            condition,
            body,
            loop_id,
        } => {
            let _ = writeln!(out, "{:indent$}while #{}", "", loop_id.0);
            dump_expr(condition, depth + 1, out);
            dump_stmt(body, depth + 1, out);
        }
        Statement::DoWhile {
            body,
            condition,
            loop_id,
        } => {
            let _ = writeln!(out, "{:indent$}do-while #{}", "", loop_id.0);
            dump_stmt(body, depth + 1, out);
            dump_expr(condition, depth + 1, out);
        }
        Statement::For {
            init,
            condition,
            step,
            body,
            loop_id,
        } => {
            let _ = writeln!(out, "{:indent$}for #{}", "", loop_id.0);
            match init {
                ForInit::Empty => {}
                ForInit::Expr(e) => dump_expr(e, depth + 1, out),
                ForInit::Decl(d) => {
                    let _ = writeln!(out, "{:ind$}decl {} [{:?}]", "", d.name, d.storage, ind = indent + 2);
                    if let Some(e) = &d.init {
                        dump_expr(e, depth + 2, out);
                    }
                }
            }
            if let Some(c) = condition {
                dump_expr(c, depth + 1, out);
            }
            if let Some(s) = step {
                dump_expr(s, depth + 1, out);
            }
            dump_stmt(body, depth + 1, out);
        }
        Statement::Break { loop_id, .. } => {
            let _ = writeln!(out, "{:indent$}break #{}", "", loop_id.0);
        }
        Statement::Continue { loop_id, .. } => {
            let _ = writeln!(out, "{:indent$}continue #{}", "", loop_id.0);
        }
    }
}

fn dump_expr(expr: &Expression, depth: usize, out: &mut String) {
    let indent = depth * 2;
    match expr {
        Expression::Constant { value, .. } => {
            let _ = writeln!(out, "{:indent$}{}", "", value);
        }
        Expression::Var { name, reference, .. } => {
            let _ = writeln!(out, "{:indent$}var {} [{:?}]", "", name, reference);
        }
        Expression::Assign {
            name,
            reference,
            value,
            ..
        } => {
            let _ = writeln!(out, "{:indent$}assign {} [{:?}]", "", name, reference);
            dump_expr(value, depth + 1, out);
        }
        Expression::Unary { op, operand } => {
            let _ = writeln!(out, "{:indent$}{:?}", "", op);
            dump_expr(operand, depth + 1, out);
        }
        Expression::Binary { op, lhs, rhs } => {
            let _ = writeln!(out, "{:indent$}{:?}", "", op);
            dump_expr(lhs, depth + 1, out);
            dump_expr(rhs, depth + 1, out);
        }
        Expression::Conditional {
            condition,
            then_value,
            else_value,
        } => {
            let _ = writeln!(out, "{:indent$}?:", "");
            dump_expr(condition, depth + 1, out);
            dump_expr(then_value, depth + 1, out);
            dump_expr(else_value, depth + 1, out);
        }
        Expression::Call { name, args, .. } => {
            let _ = writeln!(out, "{:indent$}call {}", "", name);
            for arg in args {
                dump_expr(arg, depth + 1, out);
            }
        }
    }
}
