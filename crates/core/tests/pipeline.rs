//! End-to-end checks across the whole pipeline: the interpreter and every
//! backend see the same validated tree, so programs here are pushed
//! through all of them.

use proptest::prelude::*;

use minicc_core::ast::{
    BinaryOp, BlockItem, Expression, Function, Item, Program, Statement, UnaryOp,
};
use minicc_core::errors::{CompilationError, Location, SemanticErrorKind};
use minicc_core::{codegen, eval, interpret, optimize, parsing, validate, Target};

const ALL_TARGETS: [Target; 4] = [
    Target::X86_64Linux,
    Target::X86_64Windows,
    Target::Aarch64,
    Target::Bytecode,
];

fn run(source: &str) -> i32 {
    let program = minicc_core::frontend(source, "test", true).expect("frontend");
    interpret::interpret(&program).expect("interpret")
}

fn lowers_everywhere(source: &str) {
    let program = minicc_core::frontend(source, "test", true).expect("frontend");
    for target in ALL_TARGETS {
        let text = codegen::generate(&program, target).expect("generate");
        assert!(!text.is_empty(), "{target:?} produced nothing");
    }
}

#[test]
fn the_reference_programs_interpret_to_their_known_values() {
    assert_eq!(run("int main() { return 0; }"), 0);
    assert_eq!(run("int main() { int a = 2; int b = 3; return a + b * 2; }"), 8);
    assert_eq!(
        run("int fib(int n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }\
             int main() { return fib(6); }"),
        8
    );
    assert_eq!(run("int main() { int x = 1; return (x == 1) ? 10 : 20; }"), 10);
    assert_eq!(
        run("int main() { int i = 0; int s = 0; while (i < 5) { s = s + i; i = i + 1; } return s; }"),
        10
    );
}

#[test]
fn the_reference_programs_lower_on_every_target() {
    lowers_everywhere("int main() { return 0; }");
    lowers_everywhere("int main() { int a = 2; int b = 3; return a + b * 2; }");
    lowers_everywhere(
        "int fib(int n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }\
         int main() { return fib(6); }",
    );
    lowers_everywhere("int main() { int x = 1; return (x == 1) ? 10 : 20; }");
    lowers_everywhere(
        "int main() { int i = 0; int s = 0; while (i < 5) { s = s + i; i = i + 1; } return s; }",
    );
    lowers_everywhere(
        "int g = 1; int h;\
         int tick(int n) { h = h + n; return h; }\
         int main() { for (int i = 0; i < 3; i = i + 1) tick(g); return h; }",
    );
}

#[test]
fn an_unresolved_variable_stops_the_pipeline() {
    let err = minicc_core::compile("int main() { return y; }", "test", Target::Bytecode, true)
        .expect_err("must not compile");
    match err {
        CompilationError::Semantic(semantic) => {
            assert_eq!(
                semantic.kind,
                SemanticErrorKind::UnresolvedVariable("y".to_string())
            );
        }
        other => panic!("expected a semantic error, got {other:?}"),
    }
}

#[test]
fn folding_does_not_change_what_the_interpreter_computes() {
    let source = "int main() {\
                    int a = 3 * 4 - 5;\
                    int b = (1 << 6) / (2 + 2);\
                    return a + b % (7 & 5);\
                  }";
    let unfolded = minicc_core::frontend(source, "test", false).expect("frontend");
    let folded = minicc_core::frontend(source, "test", true).expect("frontend");
    assert_eq!(
        interpret::interpret(&unfolded).expect("interpret"),
        interpret::interpret(&folded).expect("interpret"),
    );
}

#[test]
fn fold_counter_reports_work_done() {
    let mut program = parsing::parse("int main() { return 1 + 2 + 3; }", "test").expect("parse");
    validate::validate(&mut program).expect("validate");
    assert_eq!(optimize::fold(&mut program), 2);
    // A second pass finds nothing left to do.
    assert_eq!(optimize::fold(&mut program), 0);
}

// Property tests: random constant expression trees.

const UNARY_OPS: &[UnaryOp] = &[UnaryOp::Negate, UnaryOp::BitwiseNot, UnaryOp::LogicalNot];

const BINARY_OPS: &[BinaryOp] = &[
    BinaryOp::Add,
    BinaryOp::Subtract,
    BinaryOp::Multiply,
    BinaryOp::Divide,
    BinaryOp::Remainder,
    BinaryOp::ShiftLeft,
    BinaryOp::ShiftRight,
    BinaryOp::BitwiseAnd,
    BinaryOp::BitwiseOr,
    BinaryOp::BitwiseXor,
    BinaryOp::Equal,
    BinaryOp::NotEqual,
    BinaryOp::Less,
    BinaryOp::LessEqual,
    BinaryOp::Greater,
    BinaryOp::GreaterEqual,
    BinaryOp::LogicalAnd,
    BinaryOp::LogicalOr,
];

fn arb_unary_op() -> impl Strategy<Value = UnaryOp> {
    proptest::sample::select(UNARY_OPS)
}

fn arb_binary_op() -> impl Strategy<Value = BinaryOp> {
    proptest::sample::select(BINARY_OPS)
}

fn arb_constant_expr() -> impl Strategy<Value = Expression> {
    let leaf = any::<i32>().prop_map(|v| Expression::constant(v, Location::default()));
    leaf.prop_recursive(4, 48, 2, |inner| {
        prop_oneof![
            (arb_unary_op(), inner.clone())
                .prop_map(|(op, operand)| Expression::unary(op, operand)),
            (arb_binary_op(), inner.clone(), inner)
                .prop_map(|(op, lhs, rhs)| Expression::binary(op, lhs, rhs)),
        ]
    })
}

/// Wrap an expression as `int main() { return <expr>; }`.
fn program_returning(expr: Expression) -> Program {
    let mut program = Program::new(
        "prop",
        vec![Item::Function(Function {
            name: "main".to_string(),
            params: Vec::new(),
            body: vec![BlockItem::Statement(Statement::Return {
                value: expr,
                location: Location::default(),
            })],
            is_definition: true,
            location: Location::default(),
            return_count: 0,
            local_slots: 0,
        })],
    );
    validate::validate(&mut program).expect("constant programs always validate");
    program
}

proptest! {
    /// Folding is sound: it never changes the computed value, and the
    /// interpreter agrees with the evaluator on every foldable tree.
    #[test]
    fn fold_soundness(expr in arb_constant_expr()) {
        let before = eval::evaluate(&expr);

        let mut folded_program = program_returning(expr.clone());
        optimize::fold(&mut folded_program);
        let Item::Function(main) = &folded_program.items[0] else {
            unreachable!("the program has exactly one function");
        };
        let BlockItem::Statement(Statement::Return { value: folded, .. }) = &main.body[0] else {
            unreachable!("the body is a single return");
        };
        prop_assert_eq!(eval::evaluate(folded), before);

        match before {
            Some(value) => {
                let program = program_returning(expr.clone());
                prop_assert_eq!(interpret::interpret(&program), Ok(value));
            }
            // The only way a constant tree refuses to evaluate is a
            // division fault on the taken path; running it must fault
            // too.
            None => {
                let program = program_returning(expr.clone());
                prop_assert!(interpret::interpret(&program).is_err());
            }
        }
    }

    /// Every constant tree either lowers on every backend or faults in
    /// the interpreter (a division fault the folder refused to hide).
    #[test]
    fn constant_trees_lower_everywhere(expr in arb_constant_expr()) {
        let program = program_returning(expr);
        for target in ALL_TARGETS {
            prop_assert!(codegen::generate(&program, target).is_ok());
        }
    }
}
