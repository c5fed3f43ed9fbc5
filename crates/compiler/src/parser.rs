//! Parser for Orus syntax
//!
//! A Pratt parser over the scanner's token stream. Statements are newline
//! terminated; semicolons are diagnosed and skipped. Errors go through a
//! single `error_at` sink which sets panic mode; `synchronize` then skips to
//! the next statement boundary so several errors can be reported per run.

use std::collections::HashSet;

use orus_core::diag::{Diagnostic, Span};

use crate::ast::{
    BinaryOp, Expr, ExprKind, FnDecl, Loc, MatchArm, Pattern, Stmt, StmtKind, TypeExpr, UnaryOp,
};
use crate::scanner::{Token, TokenKind, tokenize};

/// Binding power ladder, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Ternary,
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Equality,
    Comparison,
    Shift,
    Term,
    Factor,
    Unary,
    Call,
}

fn infix_precedence(kind: TokenKind) -> Prec {
    match kind {
        TokenKind::Question => Prec::Ternary,
        TokenKind::Or => Prec::Or,
        TokenKind::And => Prec::And,
        TokenKind::Pipe => Prec::BitOr,
        TokenKind::Caret => Prec::BitXor,
        TokenKind::Ampersand => Prec::BitAnd,
        TokenKind::EqualEqual | TokenKind::BangEqual => Prec::Equality,
        TokenKind::Less
        | TokenKind::LessEqual
        | TokenKind::Greater
        | TokenKind::GreaterEqual => Prec::Comparison,
        TokenKind::LessLess | TokenKind::GreaterGreater => Prec::Shift,
        TokenKind::Plus | TokenKind::Minus => Prec::Term,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Prec::Factor,
        TokenKind::Dot | TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::As => {
            Prec::Call
        }
        _ => Prec::None,
    }
}

fn binary_op(kind: TokenKind) -> Option<BinaryOp> {
    let op = match kind {
        TokenKind::Plus => BinaryOp::Add,
        TokenKind::Minus => BinaryOp::Sub,
        TokenKind::Star => BinaryOp::Mul,
        TokenKind::Slash => BinaryOp::Div,
        TokenKind::Percent => BinaryOp::Mod,
        TokenKind::EqualEqual => BinaryOp::Equal,
        TokenKind::BangEqual => BinaryOp::NotEqual,
        TokenKind::Less => BinaryOp::Less,
        TokenKind::LessEqual => BinaryOp::LessEqual,
        TokenKind::Greater => BinaryOp::Greater,
        TokenKind::GreaterEqual => BinaryOp::GreaterEqual,
        TokenKind::And => BinaryOp::And,
        TokenKind::Or => BinaryOp::Or,
        TokenKind::Ampersand => BinaryOp::BitAnd,
        TokenKind::Pipe => BinaryOp::BitOr,
        TokenKind::Caret => BinaryOp::BitXor,
        TokenKind::LessLess => BinaryOp::Shl,
        TokenKind::GreaterGreater => BinaryOp::Shr,
        _ => return None,
    };
    Some(op)
}

/// The compound-assignment operators and what they desugar to.
fn compound_op(kind: TokenKind) -> Option<BinaryOp> {
    let op = match kind {
        TokenKind::PlusEqual => BinaryOp::Add,
        TokenKind::MinusEqual => BinaryOp::Sub,
        TokenKind::StarEqual => BinaryOp::Mul,
        TokenKind::SlashEqual => BinaryOp::Div,
        TokenKind::PercentEqual => BinaryOp::Mod,
        _ => return None,
    };
    Some(op)
}

/// Tokens that can begin a statement; `synchronize` stops at these.
fn starts_statement(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Let
            | TokenKind::Const
            | TokenKind::Static
            | TokenKind::Fn
            | TokenKind::Struct
            | TokenKind::Impl
            | TokenKind::If
            | TokenKind::While
            | TokenKind::For
            | TokenKind::Match
            | TokenKind::Try
            | TokenKind::Return
            | TokenKind::Break
            | TokenKind::Continue
            | TokenKind::Use
            | TokenKind::Print
            | TokenKind::Pub
    )
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    file: String,
    diagnostics: Vec<Diagnostic>,
    panic_mode: bool,
    /// Struct names declared in this file; `Name { ... }` only parses as a
    /// struct literal when `Name` is known.
    known_structs: HashSet<String>,
    fn_depth: usize,
    loop_depth: usize,
}

/// Parse a whole source file into top-level statements.
pub fn parse(source: &str, file: &str) -> Result<Vec<Stmt>, Vec<Diagnostic>> {
    let tokens = tokenize(source);
    let mut parser = Parser::new(tokens, file);
    parser.prescan_struct_names();
    let program = parser.program();
    if parser.diagnostics.is_empty() {
        Ok(program)
    } else {
        Err(parser.diagnostics)
    }
}

impl Parser {
    fn new(tokens: Vec<Token>, file: &str) -> Self {
        Parser {
            tokens,
            pos: 0,
            file: file.to_string(),
            diagnostics: Vec::new(),
            panic_mode: false,
            known_structs: HashSet::new(),
            fn_depth: 0,
            loop_depth: 0,
        }
    }

    /// Struct literals need the declared struct names before parsing starts,
    /// since declarations may appear after their first use.
    fn prescan_struct_names(&mut self) {
        for pair in self.tokens.windows(2) {
            if pair[0].kind == TokenKind::Struct && pair[1].kind == TokenKind::Identifier {
                self.known_structs.insert(pair[1].lexeme.clone());
            }
        }
    }

    // --- Token plumbing ---------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let index = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[index]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.pos.saturating_sub(1)]
    }

    fn is_at_end(&self) -> bool {
        self.peek_kind() == TokenKind::Eof
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if !self.is_at_end() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(TokenKind::Newline) {
            self.advance();
        }
    }

    fn loc_of(token: &Token) -> Loc {
        Loc::new(token.line, token.column, token.length)
    }

    fn loc(&self) -> Loc {
        Self::loc_of(self.peek())
    }

    // --- Error sink -------------------------------------------------------

    fn error_at(&mut self, token: &Token, message: impl Into<String>) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let span = Span::new(
            self.file.clone(),
            token.line,
            token.column,
            token.length.max(1),
        );
        self.diagnostics.push(Diagnostic::parse(message, span));
    }

    fn error_here(&mut self, message: impl Into<String>) {
        let token = self.peek().clone();
        self.error_at(&token, message);
    }

    /// Skip to the next statement boundary: past a newline, or up to a token
    /// that starts a statement.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.is_at_end() {
            if self.previous().kind == TokenKind::Newline {
                return;
            }
            if starts_statement(self.peek_kind()) || self.check(TokenKind::RightBrace) {
                return;
            }
            self.advance();
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Option<Token> {
        if self.check(kind) {
            return Some(self.advance());
        }
        self.error_here(message);
        None
    }

    fn consume_identifier(&mut self, what: &str) -> Option<String> {
        if self.check(TokenKind::Identifier) {
            return Some(self.advance().lexeme);
        }
        self.error_here(format!("expected {}", what));
        None
    }

    /// Statement terminator: newline, EOF, or a closing brace (left for the
    /// block parser). Semicolons are diagnosed and skipped.
    fn end_statement(&mut self) {
        if self.check(TokenKind::Semicolon) {
            self.error_here("';' is not a statement terminator; use a newline");
            self.advance();
            self.panic_mode = false;
            // Eat the rest of the line so one stray semicolon yields one error.
            if self.check(TokenKind::Newline) {
                self.advance();
            }
            return;
        }
        if self.check(TokenKind::Newline) {
            self.advance();
            return;
        }
        if self.is_at_end() || self.check(TokenKind::RightBrace) {
            return;
        }
        self.error_here("expected a newline after the statement");
        self.synchronize();
    }

    // --- Program / statements ---------------------------------------------

    fn program(&mut self) -> Vec<Stmt> {
        let mut statements = Vec::new();
        self.skip_newlines();
        while !self.is_at_end() {
            if let Some(stmt) = self.statement() {
                statements.push(stmt);
            }
            if self.panic_mode {
                self.synchronize();
            }
            self.skip_newlines();
        }
        statements
    }

    fn statement(&mut self) -> Option<Stmt> {
        let loc = self.loc();
        let public = if self.check(TokenKind::Pub) {
            match self.peek_at(1).kind {
                TokenKind::Fn | TokenKind::Const | TokenKind::Static | TokenKind::Struct => {
                    self.advance();
                    true
                }
                _ => {
                    self.error_here("'pub' must precede fn, const, static, or struct");
                    self.advance();
                    false
                }
            }
        } else {
            false
        };

        let kind = match self.peek_kind() {
            TokenKind::Let => self.let_statement()?,
            TokenKind::Const => self.const_statement(public)?,
            TokenKind::Static => self.static_statement(public)?,
            TokenKind::Fn => StmtKind::Function(self.fn_declaration(public)?),
            TokenKind::Struct => self.struct_declaration(public)?,
            TokenKind::Impl => self.impl_block()?,
            TokenKind::If => self.if_statement()?,
            TokenKind::While => self.while_statement()?,
            TokenKind::For => self.for_statement()?,
            TokenKind::Match => self.match_statement()?,
            TokenKind::Try => self.try_statement()?,
            TokenKind::Return => self.return_statement()?,
            TokenKind::Break => {
                let token = self.advance();
                if self.loop_depth == 0 {
                    self.error_at(&token, "'break' outside of a loop");
                    return None;
                }
                self.end_statement();
                return Some(Stmt {
                    kind: StmtKind::Break,
                    loc,
                });
            }
            TokenKind::Continue => {
                let token = self.advance();
                if self.loop_depth == 0 {
                    self.error_at(&token, "'continue' outside of a loop");
                    return None;
                }
                self.end_statement();
                return Some(Stmt {
                    kind: StmtKind::Continue,
                    loc,
                });
            }
            TokenKind::Use => self.use_statement()?,
            TokenKind::Print => self.print_statement()?,
            TokenKind::LeftBrace => StmtKind::Block(self.block()?),
            TokenKind::Error => {
                let token = self.advance();
                self.error_at(&token, token.lexeme.clone());
                return None;
            }
            _ => {
                let expr = self.expression()?;
                self.end_statement();
                return Some(Stmt {
                    kind: StmtKind::Expr(expr),
                    loc,
                });
            }
        };
        Some(Stmt { kind, loc })
    }

    fn let_statement(&mut self) -> Option<StmtKind> {
        self.advance(); // let
        let mutable = self.matches(TokenKind::Mut);
        let name = self.consume_identifier("a variable name after 'let'")?;
        let ty = if self.matches(TokenKind::Colon) {
            Some(self.type_expr()?)
        } else {
            None
        };
        self.consume(TokenKind::Equal, "expected '=' in 'let' binding")?;
        let init = self.expression()?;
        self.end_statement();
        Some(StmtKind::Let {
            name,
            mutable,
            ty,
            init,
        })
    }

    fn const_statement(&mut self, public: bool) -> Option<StmtKind> {
        self.advance(); // const
        let name = self.consume_identifier("a name after 'const'")?;
        let ty = if self.matches(TokenKind::Colon) {
            Some(self.type_expr()?)
        } else {
            None
        };
        self.consume(TokenKind::Equal, "expected '=' in 'const' declaration")?;
        let init = self.expression()?;
        if !matches!(
            init.kind,
            ExprKind::Int { .. }
                | ExprKind::Float(_)
                | ExprKind::Bool(_)
                | ExprKind::Str(_)
                | ExprKind::Nil
        ) {
            self.error_here("'const' initializer must be a literal");
            return None;
        }
        self.end_statement();
        Some(StmtKind::Const {
            name,
            ty,
            init,
            public,
        })
    }

    fn static_statement(&mut self, public: bool) -> Option<StmtKind> {
        self.advance(); // static
        let mutable = self.matches(TokenKind::Mut);
        let name = self.consume_identifier("a name after 'static'")?;
        let ty = if self.matches(TokenKind::Colon) {
            Some(self.type_expr()?)
        } else {
            None
        };
        self.consume(TokenKind::Equal, "expected '=' in 'static' declaration")?;
        let init = self.expression()?;
        self.end_statement();
        Some(StmtKind::Static {
            name,
            mutable,
            ty,
            init,
            public,
        })
    }

    fn fn_declaration(&mut self, public: bool) -> Option<FnDecl> {
        let loc = self.loc();
        self.advance(); // fn
        let name = self.consume_identifier("a function name after 'fn'")?;
        let generics = self.generic_params()?;
        self.consume(TokenKind::LeftParen, "expected '(' after function name")?;
        let mut params = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                let param = self.consume_identifier("a parameter name")?;
                self.consume(TokenKind::Colon, "expected ':' after parameter name")?;
                let ty = self.type_expr()?;
                params.push((param, ty));
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters")?;
        let ret = if self.matches(TokenKind::Arrow) {
            Some(self.type_expr()?)
        } else {
            None
        };
        self.fn_depth += 1;
        let body = self.block();
        self.fn_depth -= 1;
        self.end_statement();
        Some(FnDecl {
            name,
            generics,
            params,
            ret,
            body: body?,
            public,
            loc,
        })
    }

    fn generic_params(&mut self) -> Option<Vec<String>> {
        let mut generics = Vec::new();
        if self.matches(TokenKind::Less) {
            loop {
                generics.push(self.consume_identifier("a generic parameter name")?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::Greater, "expected '>' after generic parameters")?;
        }
        Some(generics)
    }

    fn struct_declaration(&mut self, public: bool) -> Option<StmtKind> {
        self.advance(); // struct
        let name = self.consume_identifier("a struct name after 'struct'")?;
        self.known_structs.insert(name.clone());
        let generics = self.generic_params()?;
        self.consume(TokenKind::LeftBrace, "expected '{' after struct name")?;
        let mut fields = Vec::new();
        self.skip_newlines();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            let field = self.consume_identifier("a field name")?;
            self.consume(TokenKind::Colon, "expected ':' after field name")?;
            let ty = self.type_expr()?;
            fields.push((field, ty));
            if !self.matches(TokenKind::Comma) {
                self.skip_newlines();
                break;
            }
            self.skip_newlines();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after struct fields")?;
        self.end_statement();
        Some(StmtKind::StructDecl {
            name,
            generics,
            fields,
            public,
        })
    }

    fn impl_block(&mut self) -> Option<StmtKind> {
        self.advance(); // impl
        let struct_name = self.consume_identifier("a struct name after 'impl'")?;
        let generics = self.generic_params()?;
        self.consume(TokenKind::LeftBrace, "expected '{' after impl header")?;
        let mut methods = Vec::new();
        self.skip_newlines();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            let public = self.matches(TokenKind::Pub);
            if !self.check(TokenKind::Fn) {
                self.error_here("only 'fn' items are allowed in an impl block");
                return None;
            }
            methods.push(self.fn_declaration(public)?);
            self.skip_newlines();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after impl block")?;
        self.end_statement();
        Some(StmtKind::Impl {
            struct_name,
            generics,
            methods,
        })
    }

    fn if_statement(&mut self) -> Option<StmtKind> {
        self.advance(); // if
        let cond = self.expression()?;
        let then_body = self.block()?;
        let mut elif_branches = Vec::new();
        let mut else_body = None;

        loop {
            // `elif`/`else` may sit on the line after the closing brace.
            let saved = self.pos;
            self.skip_newlines();
            if self.matches(TokenKind::Elif) {
                let elif_cond = self.expression()?;
                let elif_body = self.block()?;
                elif_branches.push((elif_cond, elif_body));
            } else if self.matches(TokenKind::Else) {
                else_body = Some(self.block()?);
                break;
            } else {
                self.pos = saved;
                break;
            }
        }
        self.end_statement();
        Some(StmtKind::If {
            cond,
            then_body,
            elif_branches,
            else_body,
        })
    }

    fn while_statement(&mut self) -> Option<StmtKind> {
        self.advance(); // while
        let cond = self.expression()?;
        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        self.end_statement();
        Some(StmtKind::While { cond, body: body? })
    }

    fn for_statement(&mut self) -> Option<StmtKind> {
        self.advance(); // for
        let var = self.consume_identifier("a loop variable after 'for'")?;
        self.consume(TokenKind::In, "expected 'in' after the loop variable")?;
        let first = self.expression()?;

        let (start, end, step) = if self.matches(TokenKind::DotDot) {
            let end = self.expression()?;
            let step = if self.matches(TokenKind::DotDot) {
                Some(self.expression()?)
            } else {
                None
            };
            (first, end, step)
        } else if let ExprKind::Call { callee, mut args } = first.kind {
            // `for i in range(start, end)` is the call spelling of a range.
            let is_range =
                matches!(&callee.kind, ExprKind::Variable(name) if name == "range");
            if !is_range || args.len() != 2 {
                self.error_here("'for' expects 'start..end' or 'range(start, end)'");
                return None;
            }
            let end = args.pop().unwrap();
            let start = args.pop().unwrap();
            (start, end, None)
        } else {
            self.error_here("'for' expects 'start..end' or 'range(start, end)'");
            return None;
        };

        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        self.end_statement();
        Some(StmtKind::ForRange {
            var,
            start,
            end,
            step,
            body: body?,
        })
    }

    fn match_statement(&mut self) -> Option<StmtKind> {
        self.advance(); // match
        let scrutinee = self.expression()?;
        self.consume(TokenKind::LeftBrace, "expected '{' after match value")?;
        let mut arms = Vec::new();
        self.skip_newlines();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            let loc = self.loc();
            let pattern = if self.check(TokenKind::Identifier) && self.peek().lexeme == "_" {
                self.advance();
                Pattern::Wildcard
            } else {
                Pattern::Literal(self.expression()?)
            };
            self.consume(TokenKind::FatArrow, "expected '=>' after match pattern")?;
            let body = if self.check(TokenKind::LeftBrace) {
                self.block()?
            } else {
                vec![self.statement()?]
            };
            arms.push(MatchArm { pattern, body, loc });
            self.matches(TokenKind::Comma);
            self.skip_newlines();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after match arms")?;
        if arms.is_empty() {
            self.error_here("'match' needs at least one arm");
            return None;
        }
        self.end_statement();
        Some(StmtKind::Match { scrutinee, arms })
    }

    fn try_statement(&mut self) -> Option<StmtKind> {
        self.advance(); // try
        let body = self.block()?;
        self.skip_newlines();
        self.consume(TokenKind::Catch, "expected 'catch' after try block")?;
        let err_name = self.consume_identifier("an error variable after 'catch'")?;
        let handler = self.block()?;
        self.end_statement();
        Some(StmtKind::TryCatch {
            body,
            err_name,
            handler,
        })
    }

    fn return_statement(&mut self) -> Option<StmtKind> {
        let token = self.advance(); // return
        if self.fn_depth == 0 {
            self.error_at(&token, "'return' outside of a function");
            return None;
        }
        let value = if self.check(TokenKind::Newline)
            || self.check(TokenKind::RightBrace)
            || self.is_at_end()
        {
            None
        } else {
            Some(self.expression()?)
        };
        self.end_statement();
        Some(StmtKind::Return(value))
    }

    fn use_statement(&mut self) -> Option<StmtKind> {
        self.advance(); // use
        let mut path = vec![self.consume_identifier("a module path after 'use'")?];
        while self.matches(TokenKind::DoubleColon) {
            path.push(self.consume_identifier("a path segment after '::'")?);
        }
        let alias = if self.matches(TokenKind::As) {
            Some(self.consume_identifier("an alias after 'as'")?)
        } else {
            None
        };
        self.end_statement();
        Some(StmtKind::Use { path, alias })
    }

    fn print_statement(&mut self) -> Option<StmtKind> {
        self.advance(); // print
        self.consume(TokenKind::LeftParen, "expected '(' after 'print'")?;
        let mut args = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                args.push(self.expression()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after print arguments")?;
        if args.is_empty() {
            self.error_here("'print' needs at least one argument");
            return None;
        }
        self.end_statement();
        Some(StmtKind::Print { args })
    }

    fn block(&mut self) -> Option<Vec<Stmt>> {
        self.consume(TokenKind::LeftBrace, "expected '{'")?;
        let mut statements = Vec::new();
        self.skip_newlines();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            if let Some(stmt) = self.statement() {
                statements.push(stmt);
            }
            if self.panic_mode {
                self.synchronize();
            }
            self.skip_newlines();
        }
        self.consume(TokenKind::RightBrace, "expected '}' to close the block")?;
        Some(statements)
    }

    // --- Expressions ------------------------------------------------------

    fn expression(&mut self) -> Option<Expr> {
        let expr = self.parse_precedence(Prec::Ternary)?;
        self.finish_assignment(expr)
    }

    /// Assignment is right-associative and only valid on variables, index
    /// expressions, and field accesses. `x OP= v` desugars to `x = x OP v`.
    fn finish_assignment(&mut self, target: Expr) -> Option<Expr> {
        let kind = self.peek_kind();
        let is_plain = kind == TokenKind::Equal;
        let compound = compound_op(kind);
        if !is_plain && compound.is_none() {
            return Some(target);
        }
        let op_token = self.advance();
        let rhs = self.expression()?;
        let loc = target.loc;

        let value = match compound {
            None => rhs,
            Some(op) => Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(target.clone()),
                    rhs: Box::new(rhs),
                },
                loc,
            },
        };

        let kind = match target.kind {
            ExprKind::Variable(name) => ExprKind::Assign {
                name,
                value: Box::new(value),
            },
            ExprKind::Index { array, index } => ExprKind::IndexAssign {
                array,
                index,
                value: Box::new(value),
            },
            ExprKind::Field { object, name } => ExprKind::FieldAssign {
                object,
                name,
                value: Box::new(value),
            },
            _ => {
                self.error_at(&op_token, "invalid assignment target");
                return None;
            }
        };
        Some(Expr { kind, loc })
    }

    fn parse_precedence(&mut self, min: Prec) -> Option<Expr> {
        let mut expr = self.prefix()?;
        loop {
            let prec = infix_precedence(self.peek_kind());
            if prec < min || prec == Prec::None {
                break;
            }
            expr = self.infix(expr, prec)?;
        }
        Some(expr)
    }

    fn prefix(&mut self) -> Option<Expr> {
        let token = self.advance();
        let loc = Self::loc_of(&token);
        let kind = match token.kind {
            TokenKind::Int => self.int_literal(&token)?,
            TokenKind::Float => {
                let text: String = token.lexeme.chars().filter(|c| *c != '_').collect();
                match text.parse::<f64>() {
                    Ok(value) => ExprKind::Float(value),
                    Err(_) => {
                        self.error_at(&token, format!("invalid float literal '{}'", token.lexeme));
                        return None;
                    }
                }
            }
            TokenKind::Str => ExprKind::Str(token.lexeme.clone()),
            TokenKind::True => ExprKind::Bool(true),
            TokenKind::False => ExprKind::Bool(false),
            TokenKind::Nil => ExprKind::Nil,
            TokenKind::Identifier => return self.identifier_expr(token),
            TokenKind::LeftParen => {
                let expr = self.expression()?;
                self.consume(TokenKind::RightParen, "expected ')' after expression")?;
                return Some(expr);
            }
            TokenKind::LeftBracket => {
                let mut items = Vec::new();
                if !self.check(TokenKind::RightBracket) {
                    loop {
                        items.push(self.expression()?);
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(TokenKind::RightBracket, "expected ']' after array literal")?;
                ExprKind::Array(items)
            }
            TokenKind::Minus => {
                let operand = self.parse_precedence(Prec::Unary)?;
                ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                }
            }
            TokenKind::Not => {
                let operand = self.parse_precedence(Prec::Unary)?;
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                }
            }
            TokenKind::Tilde => {
                let operand = self.parse_precedence(Prec::Unary)?;
                ExprKind::Unary {
                    op: UnaryOp::BitNot,
                    operand: Box::new(operand),
                }
            }
            TokenKind::Error => {
                self.error_at(&token, token.lexeme.clone());
                return None;
            }
            _ => {
                self.error_at(&token, format!("unexpected token '{}'", token.lexeme));
                return None;
            }
        };
        Some(Expr { kind, loc })
    }

    fn int_literal(&mut self, token: &Token) -> Option<ExprKind> {
        let mut text: String = token.lexeme.chars().filter(|c| *c != '_').collect();
        let unsigned = text.ends_with('u') || text.ends_with('U');
        if unsigned {
            text.pop();
        }
        let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))
        {
            i128::from_str_radix(hex, 16)
        } else {
            text.parse::<i128>()
        };
        match parsed {
            Ok(value) if value <= u64::MAX as i128 => Some(ExprKind::Int { value, unsigned }),
            _ => {
                self.error_at(token, format!("integer literal '{}' is out of range", token.lexeme));
                None
            }
        }
    }

    /// An identifier begins a variable reference, a struct literal, or a
    /// generic argument list (`ident<...>` followed by `{` or `(`).
    fn identifier_expr(&mut self, token: Token) -> Option<Expr> {
        let loc = Self::loc_of(&token);
        let name = token.lexeme;

        let generic_args = if self.check(TokenKind::Less) && self.looks_like_generic_args() {
            self.advance(); // <
            let mut args = Vec::new();
            loop {
                args.push(self.type_expr()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::Greater, "expected '>' after generic arguments")?;
            args
        } else {
            Vec::new()
        };

        if self.check(TokenKind::LeftBrace) && self.known_structs.contains(&name) {
            return self.struct_literal(name, generic_args, loc);
        }

        if !generic_args.is_empty() {
            // `ident<...>` not followed by a struct literal must be a call.
            self.consume(TokenKind::LeftParen, "expected '(' after generic arguments")?;
            let callee = Expr {
                kind: ExprKind::Variable(name),
                loc,
            };
            return self.finish_call(callee, loc);
        }

        Some(Expr {
            kind: ExprKind::Variable(name),
            loc,
        })
    }

    /// Bounded scan deciding whether `<` opens a generic argument list: the
    /// matching `>` must be followed by `{` or `(`; otherwise it is the
    /// less-than operator.
    fn looks_like_generic_args(&self) -> bool {
        let mut depth = 0usize;
        for offset in 0..32 {
            let token = self.peek_at(offset);
            match token.kind {
                TokenKind::Less => depth += 1,
                TokenKind::Greater => {
                    depth -= 1;
                    if depth == 0 {
                        return matches!(
                            self.peek_at(offset + 1).kind,
                            TokenKind::LeftBrace | TokenKind::LeftParen
                        );
                    }
                }
                TokenKind::Identifier
                | TokenKind::Comma
                | TokenKind::LeftBracket
                | TokenKind::RightBracket => {}
                _ => return false,
            }
        }
        false
    }

    fn struct_literal(
        &mut self,
        name: String,
        generic_args: Vec<TypeExpr>,
        loc: Loc,
    ) -> Option<Expr> {
        self.consume(TokenKind::LeftBrace, "expected '{'")?;
        let mut fields = Vec::new();
        self.skip_newlines();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            let field = self.consume_identifier("a field name")?;
            self.consume(TokenKind::Colon, "expected ':' after field name")?;
            let value = self.expression()?;
            fields.push((field, value));
            if !self.matches(TokenKind::Comma) {
                self.skip_newlines();
                break;
            }
            self.skip_newlines();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after struct literal")?;
        Some(Expr {
            kind: ExprKind::StructLit {
                name,
                generic_args,
                fields,
            },
            loc,
        })
    }

    fn infix(&mut self, lhs: Expr, prec: Prec) -> Option<Expr> {
        let token = self.advance();
        let loc = lhs.loc;
        match token.kind {
            TokenKind::Question => {
                let then_value = self.parse_precedence(Prec::Ternary)?;
                self.consume(TokenKind::Colon, "expected ':' in conditional expression")?;
                let else_value = self.parse_precedence(Prec::Ternary)?;
                Some(Expr {
                    kind: ExprKind::Ternary {
                        cond: Box::new(lhs),
                        then_value: Box::new(then_value),
                        else_value: Box::new(else_value),
                    },
                    loc,
                })
            }
            TokenKind::Dot => {
                let name = self.consume_identifier("a field or method name after '.'")?;
                let field = Expr {
                    kind: ExprKind::Field {
                        object: Box::new(lhs),
                        name,
                    },
                    loc,
                };
                if self.matches(TokenKind::LeftParen) {
                    self.finish_call(field, loc)
                } else {
                    Some(field)
                }
            }
            TokenKind::LeftParen => self.finish_call(lhs, loc),
            TokenKind::LeftBracket => {
                let index = self.expression()?;
                if self.matches(TokenKind::DotDot) {
                    let end = self.expression()?;
                    self.consume(TokenKind::RightBracket, "expected ']' after slice")?;
                    return Some(Expr {
                        kind: ExprKind::Slice {
                            array: Box::new(lhs),
                            start: Box::new(index),
                            end: Box::new(end),
                        },
                        loc,
                    });
                }
                self.consume(TokenKind::RightBracket, "expected ']' after index")?;
                Some(Expr {
                    kind: ExprKind::Index {
                        array: Box::new(lhs),
                        index: Box::new(index),
                    },
                    loc,
                })
            }
            TokenKind::As => {
                let target = self.type_expr()?;
                Some(Expr {
                    kind: ExprKind::Cast {
                        value: Box::new(lhs),
                        target,
                    },
                    loc,
                })
            }
            _ => {
                let Some(op) = binary_op(token.kind) else {
                    self.error_at(&token, format!("unexpected operator '{}'", token.lexeme));
                    return None;
                };
                // Left-associative: the right operand binds one level tighter.
                let next = match prec {
                    Prec::Call => Prec::Call,
                    _ => next_precedence(prec),
                };
                let rhs = self.parse_precedence(next)?;
                Some(Expr {
                    kind: ExprKind::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    loc,
                })
            }
        }
    }

    fn finish_call(&mut self, callee: Expr, loc: Loc) -> Option<Expr> {
        let mut args = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                args.push(self.expression()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments")?;
        Some(Expr {
            kind: ExprKind::Call {
                callee: Box::new(callee),
                args,
            },
            loc,
        })
    }

    // --- Types ------------------------------------------------------------

    fn type_expr(&mut self) -> Option<TypeExpr> {
        if self.matches(TokenKind::LeftBracket) {
            let elem = self.type_expr()?;
            self.consume(TokenKind::RightBracket, "expected ']' in array type")?;
            return Some(TypeExpr::Array(Box::new(elem)));
        }
        let name = self.consume_identifier("a type name")?;
        if self.matches(TokenKind::Less) {
            let mut args = Vec::new();
            loop {
                args.push(self.type_expr()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::Greater, "expected '>' after type arguments")?;
            return Some(TypeExpr::Instantiated { name, args });
        }
        Some(TypeExpr::Named(name))
    }
}

fn next_precedence(prec: Prec) -> Prec {
    match prec {
        Prec::None => Prec::Ternary,
        Prec::Ternary => Prec::Or,
        Prec::Or => Prec::And,
        Prec::And => Prec::BitOr,
        Prec::BitOr => Prec::BitXor,
        Prec::BitXor => Prec::BitAnd,
        Prec::BitAnd => Prec::Equality,
        Prec::Equality => Prec::Comparison,
        Prec::Comparison => Prec::Shift,
        Prec::Shift => Prec::Term,
        Prec::Term => Prec::Factor,
        Prec::Factor => Prec::Unary,
        Prec::Unary | Prec::Call => Prec::Call,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Vec<Stmt> {
        parse(source, "test.orus").expect("parse should succeed")
    }

    fn parse_err(source: &str) -> Vec<Diagnostic> {
        parse(source, "test.orus").expect_err("parse should fail")
    }

    #[test]
    fn precedence_binds_factor_over_term() {
        let program = parse_ok("fn main() { let x = 1 + 2 * 3 }");
        let StmtKind::Function(decl) = &program[0].kind else {
            panic!("expected function");
        };
        let StmtKind::Let { init, .. } = &decl.body[0].kind else {
            panic!("expected let");
        };
        let ExprKind::Binary { op, rhs, .. } = &init.kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            rhs.kind,
            ExprKind::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn compound_assignment_desugars() {
        let program = parse_ok("fn main() { let mut x = 0\nx += 2 }");
        let StmtKind::Function(decl) = &program[0].kind else {
            panic!("expected function");
        };
        let StmtKind::Expr(expr) = &decl.body[1].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Assign { name, value } = &expr.kind else {
            panic!("expected assignment, got {:?}", expr.kind);
        };
        assert_eq!(name, "x");
        assert!(matches!(
            value.kind,
            ExprKind::Binary {
                op: BinaryOp::Add,
                ..
            }
        ));
    }

    #[test]
    fn index_compound_assignment_desugars() {
        let program = parse_ok("fn main() { let a = [1]\na[0] *= 3 }");
        let StmtKind::Function(decl) = &program[0].kind else {
            panic!("expected function");
        };
        let StmtKind::Expr(expr) = &decl.body[1].kind else {
            panic!("expected expression statement");
        };
        assert!(matches!(expr.kind, ExprKind::IndexAssign { .. }));
    }

    #[test]
    fn semicolon_is_diagnosed() {
        let errors = parse_err("print(1);\n");
        assert!(errors[0].message.contains("newline"));
    }

    #[test]
    fn for_range_forms() {
        let program = parse_ok("fn main() { for i in 0..5 { print(i) } }");
        let StmtKind::Function(decl) = &program[0].kind else {
            panic!("expected function");
        };
        assert!(matches!(decl.body[0].kind, StmtKind::ForRange { .. }));

        let program = parse_ok("fn main() { for i in range(1, 4) { print(i) } }");
        let StmtKind::Function(decl) = &program[0].kind else {
            panic!("expected function");
        };
        let StmtKind::ForRange { step, .. } = &decl.body[0].kind else {
            panic!("expected for-range");
        };
        assert!(step.is_none());

        let program = parse_ok("fn main() { for i in 0..10..2 { print(i) } }");
        let StmtKind::Function(decl) = &program[0].kind else {
            panic!("expected function");
        };
        let StmtKind::ForRange { step, .. } = &decl.body[0].kind else {
            panic!("expected for-range");
        };
        assert!(step.is_some());
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let errors = parse_err("fn main() { break }");
        assert!(errors[0].message.contains("break"));
    }

    #[test]
    fn return_outside_function_is_rejected() {
        let errors = parse_err("return 1");
        assert!(errors[0].message.contains("return"));
    }

    #[test]
    fn struct_literal_requires_known_struct() {
        // `Point` is declared, so `Point { ... }` is a literal.
        let program = parse_ok(
            "struct Point { x: i32, y: i32 }\nfn main() { let p = Point { x: 1, y: 2 } }",
        );
        let StmtKind::Function(decl) = &program[1].kind else {
            panic!("expected function");
        };
        let StmtKind::Let { init, .. } = &decl.body[0].kind else {
            panic!("expected let");
        };
        assert!(matches!(init.kind, ExprKind::StructLit { .. }));
    }

    #[test]
    fn less_than_is_not_generics() {
        let program = parse_ok("fn main() { let b = a < 3 }");
        let StmtKind::Function(decl) = &program[0].kind else {
            panic!("expected function");
        };
        let StmtKind::Let { init, .. } = &decl.body[0].kind else {
            panic!("expected let");
        };
        assert!(matches!(
            init.kind,
            ExprKind::Binary {
                op: BinaryOp::Less,
                ..
            }
        ));
    }

    #[test]
    fn generic_struct_literal_parses() {
        let program = parse_ok(
            "struct Box<T> { value: T }\nfn main() { let b = Box<i32> { value: 7 } }",
        );
        let StmtKind::Function(decl) = &program[1].kind else {
            panic!("expected function");
        };
        let StmtKind::Let { init, .. } = &decl.body[0].kind else {
            panic!("expected let");
        };
        let ExprKind::StructLit { generic_args, .. } = &init.kind else {
            panic!("expected struct literal");
        };
        assert_eq!(generic_args.len(), 1);
    }

    #[test]
    fn use_statement_with_alias() {
        let program = parse_ok("use std::math as m");
        let StmtKind::Use { path, alias } = &program[0].kind else {
            panic!("expected use");
        };
        assert_eq!(path, &vec!["std".to_string(), "math".to_string()]);
        assert_eq!(alias.as_deref(), Some("m"));
    }

    #[test]
    fn ternary_and_cast() {
        let program = parse_ok("fn main() { let x = (a > 0 ? 1 : 2) as i64 }");
        let StmtKind::Function(decl) = &program[0].kind else {
            panic!("expected function");
        };
        let StmtKind::Let { init, .. } = &decl.body[0].kind else {
            panic!("expected let");
        };
        assert!(matches!(init.kind, ExprKind::Cast { .. }));
    }

    #[test]
    fn try_catch_parses() {
        let program = parse_ok("fn main() { try { print(1) } catch e { print(2) } }");
        let StmtKind::Function(decl) = &program[0].kind else {
            panic!("expected function");
        };
        assert!(matches!(decl.body[0].kind, StmtKind::TryCatch { .. }));
    }

    #[test]
    fn match_arms_parse() {
        let program = parse_ok(
            "fn main() { match x { 1 => print(\"one\"), _ => print(\"other\") } }",
        );
        let StmtKind::Function(decl) = &program[0].kind else {
            panic!("expected function");
        };
        let StmtKind::Match { arms, .. } = &decl.body[0].kind else {
            panic!("expected match");
        };
        assert_eq!(arms.len(), 2);
        assert!(matches!(arms[1].pattern, Pattern::Wildcard));
    }

    #[test]
    fn const_requires_literal_initializer() {
        let errors = parse_err("const X = 1 + 2");
        assert!(errors[0].message.contains("literal"));
    }

    #[test]
    fn multiple_errors_are_reported() {
        let errors = parse_err("let = 1\nlet = 2\n");
        assert!(errors.len() >= 2);
    }

    #[test]
    fn error_spans_carry_position() {
        let errors = parse_err("fn main() {\n  let 5 = 3\n}");
        assert_eq!(errors[0].span.line, 2);
        assert!(errors[0].span.column > 1);
    }
}
