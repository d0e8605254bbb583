//! Recursive-descent parser producing the syntax tree.
//!
//! Standard precedence climbing for expressions; one helper per grammar
//! level. The parser attaches line/column to every node that later passes
//! can reject, and leaves all annotation fields at their unresolved
//! defaults for the validator to fill in.

use crate::ast::{
    BinaryOp, BlockItem, Declaration, Expression, ForInit, Function, Item, LoopId, Program,
    Statement, Storage, UnaryOp, VarRef,
};
use crate::errors::{Location, ParseError};
use crate::tokenizer::{token_text, tokenize, Token, TokenKind};

/// Parse one translation unit. `name` is used only for diagnostics.
pub fn parse(source: &str, name: &str) -> Result<Program, ParseError> {
    let tokens = tokenize(source)?;
    let mut stream = TokenStream::new(tokens, source);

    let mut items = Vec::new();
    while !stream.is_eof() {
        items.push(parse_top_level(&mut stream)?);
    }

    Ok(Program::new(name, items))
}

/// `int name ...` — either a function (prototype or definition) or a
/// global variable declaration.
fn parse_top_level(stream: &mut TokenStream) -> Result<Item, ParseError> {
    stream.skip_keyword("int")?;
    let (name, location) = stream.get_ident()?;

    if stream.equal("(") {
        return parse_function(stream, name, location).map(Item::Function);
    }

    let init = if stream.equal("=") {
        Some(parse_expr(stream)?)
    } else {
        None
    };
    stream.skip(";")?;
    Ok(Item::Global(Declaration {
        name,
        init,
        location,
        storage: Storage::default(),
    }))
}

fn parse_function(
    stream: &mut TokenStream,
    name: String,
    location: Location,
) -> Result<Function, ParseError> {
    let mut params = Vec::new();
    if !stream.equal(")") {
        loop {
            stream.skip_keyword("int")?;
            let (param, _) = stream.get_ident()?;
            params.push(param);
            if !stream.equal(",") {
                break;
            }
        }
        stream.skip(")")?;
    }

    if stream.equal(";") {
        return Ok(Function {
            name,
            params,
            body: Vec::new(),
            is_definition: false,
            location,
            return_count: 0,
            local_slots: 0,
        });
    }

    stream.skip("{")?;
    let body = parse_block_items(stream)?;
    Ok(Function {
        name,
        params,
        body,
        is_definition: true,
        location,
        return_count: 0,
        local_slots: 0,
    })
}

/// Block items up to (and consuming) the closing `}`.
fn parse_block_items(stream: &mut TokenStream) -> Result<Vec<BlockItem>, ParseError> {
    let mut items = Vec::new();
    while !stream.equal("}") {
        items.push(parse_block_item(stream)?);
    }
    Ok(items)
}

fn parse_block_item(stream: &mut TokenStream) -> Result<BlockItem, ParseError> {
    if stream.peek_keyword("int") {
        return parse_declaration(stream).map(BlockItem::Declaration);
    }
    parse_stmt(stream).map(BlockItem::Statement)
}

fn parse_declaration(stream: &mut TokenStream) -> Result<Declaration, ParseError> {
    stream.skip_keyword("int")?;
    let (name, location) = stream.get_ident()?;
    let init = if stream.equal("=") {
        Some(parse_expr(stream)?)
    } else {
        None
    };
    stream.skip(";")?;
    Ok(Declaration {
        name,
        init,
        location,
        storage: Storage::default(),
    })
}

fn parse_stmt(stream: &mut TokenStream) -> Result<Statement, ParseError> {
    if stream.equal_keyword("return") {
        let location = stream.previous_location();
        let value = parse_expr(stream)?;
        stream.skip(";")?;
        return Ok(Statement::Return { value, location });
    }

    if stream.equal_keyword("if") {
        stream.skip("(")?;
        let condition = parse_expr(stream)?;
        stream.skip(")")?;
        let then_branch = Box::new(parse_stmt(stream)?);
        let else_branch = if stream.equal_keyword("else") {
            Some(Box::new(parse_stmt(stream)?))
        } else {
            None
        };
        return Ok(Statement::If {
            condition,
            then_branch,
            else_branch,
        });
    }

    if stream.equal_keyword("while") {
        stream.skip("(")?;
        let condition = parse_expr(stream)?;
        stream.skip(")")?;
        let body = Box::new(parse_stmt(stream)?);
        return Ok(Statement::While {
            condition,
            body,
            loop_id: LoopId::default(),
        });
    }

    if stream.equal_keyword("do") {
        let body = Box::new(parse_stmt(stream)?);
        stream.skip_keyword("while")?;
        stream.skip("(")?;
        let condition = parse_expr(stream)?;
        stream.skip(")")?;
        stream.skip(";")?;
        return Ok(Statement::DoWhile {
            body,
            condition,
            loop_id: LoopId::default(),
        });
    }

    if stream.equal_keyword("for") {
        stream.skip("(")?;
        let init = if stream.peek_keyword("int") {
            ForInit::Decl(parse_declaration(stream)?)
        } else if stream.equal(";") {
            ForInit::Empty
        } else {
            let e = parse_expr(stream)?;
            stream.skip(";")?;
            ForInit::Expr(e)
        };
        let condition = if stream.equal(";") {
            None
        } else {
            let e = parse_expr(stream)?;
            stream.skip(";")?;
            Some(e)
        };
        let step = if stream.check(")") {
            None
        } else {
            Some(parse_expr(stream)?)
        };
        stream.skip(")")?;
        let body = Box::new(parse_stmt(stream)?);
        return Ok(Statement::For {
            init,
            condition,
            step,
            body,
            loop_id: LoopId::default(),
        });
    }

    if stream.equal_keyword("break") {
        let location = stream.previous_location();
        stream.skip(";")?;
        return Ok(Statement::Break {
            loop_id: LoopId::default(),
            location,
        });
    }

    if stream.equal_keyword("continue") {
        let location = stream.previous_location();
        stream.skip(";")?;
        return Ok(Statement::Continue {
            loop_id: LoopId::default(),
            location,
        });
    }

    if stream.equal("{") {
        let items = parse_block_items(stream)?;
        return Ok(Statement::Compound(items));
    }

    if stream.equal(";") {
        return Ok(Statement::Null);
    }

    let expr = parse_expr(stream)?;
    stream.skip(";")?;
    Ok(Statement::Expr(expr))
}

// Expressions, one function per precedence level, loosest binding first.

fn parse_expr(stream: &mut TokenStream) -> Result<Expression, ParseError> {
    parse_assign(stream)
}

fn parse_assign(stream: &mut TokenStream) -> Result<Expression, ParseError> {
    let node = parse_conditional(stream)?;

    if stream.equal("=") {
        let (name, location) = match &node {
            Expression::Var { name, location, .. } => (name.clone(), *location),
            _ => {
                return Err(ParseError::new(
                    "left-hand side of `=` is not assignable",
                    stream.previous_location(),
                ))
            }
        };
        let value = parse_assign(stream)?;
        return Ok(Expression::Assign {
            name,
            reference: VarRef::default(),
            value: Box::new(value),
            location,
        });
    }

    Ok(node)
}

fn parse_conditional(stream: &mut TokenStream) -> Result<Expression, ParseError> {
    let condition = parse_logical_or(stream)?;

    if stream.equal("?") {
        let then_value = parse_expr(stream)?;
        stream.skip(":")?;
        let else_value = parse_conditional(stream)?;
        return Ok(Expression::Conditional {
            condition: Box::new(condition),
            then_value: Box::new(then_value),
            else_value: Box::new(else_value),
        });
    }

    Ok(condition)
}

fn parse_logical_or(stream: &mut TokenStream) -> Result<Expression, ParseError> {
    let mut node = parse_logical_and(stream)?;
    while stream.equal("||") {
        let rhs = parse_logical_and(stream)?;
        node = Expression::binary(BinaryOp::LogicalOr, node, rhs);
    }
    Ok(node)
}

fn parse_logical_and(stream: &mut TokenStream) -> Result<Expression, ParseError> {
    let mut node = parse_bit_or(stream)?;
    while stream.equal("&&") {
        let rhs = parse_bit_or(stream)?;
        node = Expression::binary(BinaryOp::LogicalAnd, node, rhs);
    }
    Ok(node)
}

fn parse_bit_or(stream: &mut TokenStream) -> Result<Expression, ParseError> {
    let mut node = parse_bit_xor(stream)?;
    while stream.equal("|") {
        let rhs = parse_bit_xor(stream)?;
        node = Expression::binary(BinaryOp::BitwiseOr, node, rhs);
    }
    Ok(node)
}

fn parse_bit_xor(stream: &mut TokenStream) -> Result<Expression, ParseError> {
    let mut node = parse_bit_and(stream)?;
    while stream.equal("^") {
        let rhs = parse_bit_and(stream)?;
        node = Expression::binary(BinaryOp::BitwiseXor, node, rhs);
    }
    Ok(node)
}

fn parse_bit_and(stream: &mut TokenStream) -> Result<Expression, ParseError> {
    let mut node = parse_equality(stream)?;
    while stream.equal("&") {
        let rhs = parse_equality(stream)?;
        node = Expression::binary(BinaryOp::BitwiseAnd, node, rhs);
    }
    Ok(node)
}

fn parse_equality(stream: &mut TokenStream) -> Result<Expression, ParseError> {
    let mut node = parse_relational(stream)?;
    loop {
        let op = if stream.equal("==") {
            BinaryOp::Equal
        } else if stream.equal("!=") {
            BinaryOp::NotEqual
        } else {
            break;
        };
        let rhs = parse_relational(stream)?;
        node = Expression::binary(op, node, rhs);
    }
    Ok(node)
}

fn parse_relational(stream: &mut TokenStream) -> Result<Expression, ParseError> {
    let mut node = parse_shift(stream)?;
    loop {
        let op = if stream.equal("<=") {
            BinaryOp::LessEqual
        } else if stream.equal(">=") {
            BinaryOp::GreaterEqual
        } else if stream.equal("<") {
            BinaryOp::Less
        } else if stream.equal(">") {
            BinaryOp::Greater
        } else {
            break;
        };
        let rhs = parse_shift(stream)?;
        node = Expression::binary(op, node, rhs);
    }
    Ok(node)
}

fn parse_shift(stream: &mut TokenStream) -> Result<Expression, ParseError> {
    let mut node = parse_add(stream)?;
    loop {
        let op = if stream.equal("<<") {
            BinaryOp::ShiftLeft
        } else if stream.equal(">>") {
            BinaryOp::ShiftRight
        } else {
            break;
        };
        let rhs = parse_add(stream)?;
        node = Expression::binary(op, node, rhs);
    }
    Ok(node)
}

fn parse_add(stream: &mut TokenStream) -> Result<Expression, ParseError> {
    let mut node = parse_mul(stream)?;
    loop {
        let op = if stream.equal("+") {
            BinaryOp::Add
        } else if stream.equal("-") {
            BinaryOp::Subtract
        } else {
            break;
        };
        let rhs = parse_mul(stream)?;
        node = Expression::binary(op, node, rhs);
    }
    Ok(node)
}

fn parse_mul(stream: &mut TokenStream) -> Result<Expression, ParseError> {
    let mut node = parse_unary(stream)?;
    loop {
        let op = if stream.equal("*") {
            BinaryOp::Multiply
        } else if stream.equal("/") {
            BinaryOp::Divide
        } else if stream.equal("%") {
            BinaryOp::Remainder
        } else {
            break;
        };
        let rhs = parse_unary(stream)?;
        node = Expression::binary(op, node, rhs);
    }
    Ok(node)
}

fn parse_unary(stream: &mut TokenStream) -> Result<Expression, ParseError> {
    // Unary plus is the identity on an int; drop it here.
    if stream.equal("+") {
        return parse_unary(stream);
    }
    if stream.equal("-") {
        let operand = parse_unary(stream)?;
        return Ok(Expression::unary(UnaryOp::Negate, operand));
    }
    if stream.equal("~") {
        let operand = parse_unary(stream)?;
        return Ok(Expression::unary(UnaryOp::BitwiseNot, operand));
    }
    if stream.equal("!") {
        let operand = parse_unary(stream)?;
        return Ok(Expression::unary(UnaryOp::LogicalNot, operand));
    }
    parse_primary(stream)
}

fn parse_primary(stream: &mut TokenStream) -> Result<Expression, ParseError> {
    if stream.equal("(") {
        let node = parse_expr(stream)?;
        stream.skip(")")?;
        return Ok(node);
    }

    if stream.peek_kind() == Some(TokenKind::Ident) {
        let (name, location) = stream.get_ident()?;
        if stream.equal("(") {
            let mut args = Vec::new();
            if !stream.equal(")") {
                loop {
                    args.push(parse_expr(stream)?);
                    if !stream.equal(",") {
                        break;
                    }
                }
                stream.skip(")")?;
            }
            return Ok(Expression::Call {
                name,
                args,
                location,
            });
        }
        return Ok(Expression::Var {
            name,
            reference: VarRef::default(),
            location,
        });
    }

    let (value, location) = stream.get_number()?;
    Ok(Expression::constant(value, location))
}

/// Lightweight cursor over the token vector.
struct TokenStream<'a> {
    tokens: Vec<Token>,
    source: &'a str,
    pos: usize,
}

impl<'a> TokenStream<'a> {
    fn new(tokens: Vec<Token>, source: &'a str) -> Self {
        Self {
            tokens,
            source,
            pos: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn is_eof(&self) -> bool {
        matches!(self.peek_kind(), Some(TokenKind::Eof) | None)
    }

    /// Location of the most recently consumed token.
    fn previous_location(&self) -> Location {
        self.tokens
            .get(self.pos.saturating_sub(1))
            .map(|t| t.location)
            .unwrap_or_default()
    }

    fn current_location(&self) -> Location {
        self.peek().map(|t| t.location).unwrap_or_default()
    }

    fn describe_current(&self) -> String {
        match self.peek() {
            Some(t) if t.kind == TokenKind::Eof => "end of input".to_string(),
            Some(t) => format!("`{}`", token_text(t, self.source)),
            None => "end of input".to_string(),
        }
    }

    /// True if the current token is the given punctuator; does not consume.
    fn check(&self, op: &str) -> bool {
        matches!(
            self.peek(),
            Some(t) if t.kind == TokenKind::Punctuator && token_text(t, self.source) == op
        )
    }

    /// Consume the current token if it matches the given punctuator.
    fn equal(&mut self, op: &str) -> bool {
        if self.check(op) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn skip(&mut self, op: &str) -> Result<(), ParseError> {
        if self.equal(op) {
            return Ok(());
        }
        Err(ParseError::new(
            format!("expected `{}`, but got {}", op, self.describe_current()),
            self.current_location(),
        ))
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(
            self.peek(),
            Some(t) if t.kind == TokenKind::Keyword && token_text(t, self.source) == keyword
        )
    }

    fn equal_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn skip_keyword(&mut self, keyword: &str) -> Result<(), ParseError> {
        if self.equal_keyword(keyword) {
            return Ok(());
        }
        Err(ParseError::new(
            format!("expected `{}`, but got {}", keyword, self.describe_current()),
            self.current_location(),
        ))
    }

    fn get_ident(&mut self) -> Result<(String, Location), ParseError> {
        if let Some(t) = self.peek() {
            if t.kind == TokenKind::Ident {
                let name = token_text(t, self.source).to_string();
                let location = t.location;
                self.pos += 1;
                return Ok((name, location));
            }
        }
        Err(ParseError::new(
            format!("expected an identifier, but got {}", self.describe_current()),
            self.current_location(),
        ))
    }

    fn get_number(&mut self) -> Result<(i32, Location), ParseError> {
        if let Some(t) = self.peek() {
            if t.kind == TokenKind::Num {
                let value = t.value.ok_or_else(|| {
                    ParseError::new("numeric token missing its value", t.location)
                })?;
                let location = t.location;
                self.pos += 1;
                return Ok((value, location));
            }
        }
        Err(ParseError::new(
            format!("expected an expression, but got {}", self.describe_current()),
            self.current_location(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse_one(source: &str) -> Program {
        parse(source, "test").expect("parse")
    }

    fn main_body(program: &Program) -> &[BlockItem] {
        match &program.items[0] {
            Item::Function(f) => &f.body,
            other => panic!("expected a function, got {other:?}"),
        }
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let program = parse_one("int main() { return 2 + 3 * 4; }");
        let body = main_body(&program);
        let BlockItem::Statement(Statement::Return { value, .. }) = &body[0] else {
            panic!("expected return");
        };
        let Expression::Binary { op: BinaryOp::Add, rhs, .. } = value else {
            panic!("expected addition at the root, got {value:?}");
        };
        assert!(matches!(
            rhs.as_ref(),
            Expression::Binary { op: BinaryOp::Multiply, .. }
        ));
    }

    #[test]
    fn assignment_is_right_associative() {
        let program = parse_one("int main() { int a; int b; a = b = 1; return a; }");
        let body = main_body(&program);
        let BlockItem::Statement(Statement::Expr(Expression::Assign { name, value, .. })) = &body[2]
        else {
            panic!("expected assignment statement");
        };
        assert_eq!(name, "a");
        assert!(matches!(value.as_ref(), Expression::Assign { .. }));
    }

    #[test]
    fn parses_all_loop_forms() {
        let program = parse_one(
            "int main() {\
               int i = 0;\
               while (i < 3) i = i + 1;\
               do i = i - 1; while (i > 0);\
               for (int j = 0; j < 2; j = j + 1) { i = i + j; }\
               for (;;) break;\
               return i;\
             }",
        );
        let body = main_body(&program);
        assert!(matches!(body[1], BlockItem::Statement(Statement::While { .. })));
        assert!(matches!(body[2], BlockItem::Statement(Statement::DoWhile { .. })));
        assert!(matches!(
            body[3],
            BlockItem::Statement(Statement::For { init: ForInit::Decl(_), .. })
        ));
        assert!(matches!(
            body[4],
            BlockItem::Statement(Statement::For {
                init: ForInit::Empty,
                condition: None,
                step: None,
                ..
            })
        ));
    }

    #[test]
    fn prototype_versus_definition() {
        let program = parse_one("int f(int a, int b); int f(int a, int b) { return a + b; }");
        let Item::Function(decl) = &program.items[0] else {
            panic!("expected function");
        };
        let Item::Function(def) = &program.items[1] else {
            panic!("expected function");
        };
        assert!(!decl.is_definition);
        assert!(def.is_definition);
        assert_eq!(decl.params, vec!["a", "b"]);
    }

    #[test]
    fn unary_plus_is_dropped() {
        let program = parse_one("int main() { return +5; }");
        let body = main_body(&program);
        let BlockItem::Statement(Statement::Return { value, .. }) = &body[0] else {
            panic!("expected return");
        };
        assert!(matches!(value, Expression::Constant { value: 5, .. }));
    }

    #[test]
    fn ternary_nests_in_its_else_arm() {
        let program = parse_one("int main() { return 1 ? 2 : 3 ? 4 : 5; }");
        let body = main_body(&program);
        let BlockItem::Statement(Statement::Return { value, .. }) = &body[0] else {
            panic!("expected return");
        };
        let Expression::Conditional { else_value, .. } = value else {
            panic!("expected a conditional");
        };
        assert!(matches!(else_value.as_ref(), Expression::Conditional { .. }));
    }

    #[test]
    fn reports_missing_semicolon() {
        let err = parse("int main() { return 0 }", "test").unwrap_err();
        assert!(err.message.contains("expected `;`"));
    }

    #[test]
    fn rejects_assignment_to_non_lvalue() {
        assert!(parse("int main() { 1 = 2; return 0; }", "test").is_err());
    }
}
