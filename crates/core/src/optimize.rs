//! Constant folding over the syntax tree.
//!
//! A depth-first, bottom-up rewrite: children fold first, and once every
//! operand of a unary or binary node has become a literal the whole node
//! is replaced by its computed value. Anything the evaluator refuses
//! (non-constant leaves, division faults) is left for run time.

use crate::ast::{BlockItem, Expression, ForInit, Item, Program, Statement};
use crate::eval;

/// Fold every constant subtree in the program, in place. Returns the
/// number of subtrees replaced, for diagnostics and tests.
pub fn fold(program: &mut Program) -> u32 {
    let mut folds = 0;

    for item in &mut program.items {
        match item {
            Item::Function(f) => {
                for block_item in &mut f.body {
                    fold_block_item(block_item, &mut folds);
                }
            }
            Item::Global(d) => {
                if let Some(init) = &mut d.init {
                    fold_expr(init, &mut folds);
                }
            }
        }
    }

    folds
}

fn fold_block_item(item: &mut BlockItem, folds: &mut u32) {
    match item {
        BlockItem::Declaration(d) => {
            if let Some(init) = &mut d.init {
                fold_expr(init, folds);
            }
        }
        BlockItem::Statement(s) => fold_stmt(s, folds),
    }
}

fn fold_stmt(stmt: &mut Statement, folds: &mut u32) {
    match stmt {
        Statement::Return { value, .. } => fold_expr(value, folds),
        Statement::Expr(e) => fold_expr(e, folds),
        Statement::Null | Statement::Break { .. } | Statement::Continue { .. } => {}
        Statement::Compound(items) => {
            for item in items {
                fold_block_item(item, folds);
            }
        }
        Statement::If {
            condition,
            then_branch,
            else_branch,
        } => {
            fold_expr(condition, folds);
            fold_stmt(then_branch, folds);
            if let Some(e) = else_branch {
                fold_stmt(e, folds);
            }
        }
        Statement::While {
            condition, body, ..
        } => {
            fold_expr(condition, folds);
            fold_stmt(body, folds);
        }
        Statement::DoWhile {
            body, condition, ..
        } => {
            fold_stmt(body, folds);
            fold_expr(condition, folds);
        }
        Statement::For {
            init,
            condition,
            step,
            body,
            ..
        } => {
            match init {
                ForInit::Empty => {}
                ForInit::Expr(e) => fold_expr(e, folds),
                ForInit::Decl(d) => {
                    if let Some(e) = &mut d.init {
                        fold_expr(e, folds);
                    }
                }
            }
            if let Some(c) = condition {
                fold_expr(c, folds);
            }
            if let Some(s) = step {
                fold_expr(s, folds);
            }
            fold_stmt(body, folds);
        }
    }
}

fn fold_expr(expr: &mut Expression, folds: &mut u32) {
    // Children first, so a node only has to look one level down.
    match expr {
        Expression::Constant { .. } | Expression::Var { .. } => return,
        Expression::Unary { operand, .. } => fold_expr(operand, folds),
        Expression::Binary { lhs, rhs, .. } => {
            fold_expr(lhs, folds);
            fold_expr(rhs, folds);
        }
        Expression::Assign { value, .. } => fold_expr(value, folds),
        Expression::Conditional {
            condition,
            then_value,
            else_value,
        } => {
            fold_expr(condition, folds);
            fold_expr(then_value, folds);
            fold_expr(else_value, folds);
        }
        Expression::Call { args, .. } => {
            for arg in args {
                fold_expr(arg, folds);
            }
        }
    }

    if !foldable(expr) {
        return;
    }

    if let Some(value) = eval::evaluate(expr) {
        *expr = Expression::constant(value, expr_location(expr));
        *folds += 1;
    }
}

/// After its children have folded, a node is a fold candidate iff every
/// direct operand is already a literal.
fn foldable(expr: &Expression) -> bool {
    match expr {
        Expression::Unary { operand, .. } => matches!(**operand, Expression::Constant { .. }),
        Expression::Binary { lhs, rhs, .. } => {
            matches!(**lhs, Expression::Constant { .. })
                && matches!(**rhs, Expression::Constant { .. })
        }
        _ => false,
    }
}

/// The source position the replacement literal should claim: the leftmost
/// leaf of the subtree being replaced.
fn expr_location(expr: &Expression) -> crate::errors::Location {
    match expr {
        Expression::Constant { location, .. }
        | Expression::Var { location, .. }
        | Expression::Assign { location, .. }
        | Expression::Call { location, .. } => *location,
        Expression::Unary { operand, .. } => expr_location(operand),
        Expression::Binary { lhs, .. } => expr_location(lhs),
        Expression::Conditional { condition, .. } => expr_location(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsing::parse;
    use pretty_assertions::assert_eq;

    fn folded(source: &str) -> (Program, u32) {
        let mut program = parse(source, "test").expect("parse");
        let folds = fold(&mut program);
        (program, folds)
    }

    fn return_value(program: &Program) -> &Expression {
        let Item::Function(f) = &program.items[0] else {
            panic!("expected a function");
        };
        let value = f.body.iter().find_map(|item| match item {
            BlockItem::Statement(Statement::Return { value, .. }) => Some(value),
            _ => None,
        });
        value.expect("expected return")
    }

    #[test]
    fn folds_fully_constant_trees() {
        let (program, folds) = folded("int main() { return 1 + 2 * 3 - 4; }");
        assert!(matches!(
            return_value(&program),
            Expression::Constant { value: 3, .. }
        ));
        // One replacement per operator node.
        assert_eq!(folds, 3);
    }

    #[test]
    fn folds_constant_subtrees_under_variables() {
        let (program, folds) = folded("int main() { int x = 1; return x + 2 * 3; }");
        let Expression::Binary { rhs, .. } = return_value(&program) else {
            panic!("expected addition to survive");
        };
        assert!(matches!(**rhs, Expression::Constant { value: 6, .. }));
        assert_eq!(folds, 1);
    }

    #[test]
    fn short_circuit_folds_like_the_evaluator() {
        let (program, _) = folded("int main() { return 2 || 0; }");
        assert!(matches!(
            return_value(&program),
            Expression::Constant { value: 1, .. }
        ));
    }

    #[test]
    fn division_by_zero_is_left_for_run_time() {
        let (program, folds) = folded("int main() { return 1 / 0; }");
        assert!(matches!(return_value(&program), Expression::Binary { .. }));
        assert_eq!(folds, 0);
    }

    #[test]
    fn evaluation_is_unchanged_by_folding() {
        let source = "int main() { return (8 / -3) % 5 + (1 << 4) - ~2; }";
        let mut program = parse(source, "test").expect("parse");
        let before = crate::eval::evaluate(return_value(&program)).expect("constant");
        fold(&mut program);
        let after = crate::eval::evaluate(return_value(&program)).expect("constant");
        assert_eq!(before, after);
    }

    #[test]
    fn ternaries_are_not_folded() {
        let (program, folds) = folded("int main() { return 1 ? 2 : 3; }");
        assert!(matches!(
            return_value(&program),
            Expression::Conditional { .. }
        ));
        assert_eq!(folds, 0);
    }
}
