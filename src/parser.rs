use std::sync::Arc;

use indexmap::IndexSet;

use crate::{
    ast::{
        BinaryOp, ClassDecl, Expr, ExprKind, FieldDecl, FunctionDecl, Literal, LogicalOp,
        MethodDecl, Param, Program, Stmt, StmtKind, UnaryOp,
    },
    diagnostics::{CodeError, ErrorKind, SourceSpan},
    lexer::{Keyword, Lexer, Token, TokenKind},
};

/// Deepest statement/expression nesting accepted before the parser gives up
/// with `IllegalSyntax`.
pub const MAX_NESTING: usize = 1000;

const RED_ZONE: usize = 64 * 1024;
const STACK_GROWTH: usize = 1024 * 1024;

/// Parse-time symbol table of declared names, discarded after parsing.
///
/// The root frame is seeded with the built-in names and whatever the host
/// context has already declared.
#[derive(Debug, Clone)]
pub struct DeclarationScope {
    builtins: IndexSet<String>,
    frames: Vec<IndexSet<String>>,
}

impl DeclarationScope {
    pub fn new<I, S>(builtins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            builtins: builtins.into_iter().map(Into::into).collect(),
            frames: vec![IndexSet::new()],
        }
    }

    pub fn declare(&mut self, name: impl Into<String>) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.into());
        }
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtins.contains(name)
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.frames.iter().rev().any(|frame| frame.contains(name))
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    fn push(&mut self) {
        self.frames.push(IndexSet::new());
    }

    fn pop(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }
}

pub fn parse_source(
    lexer: &Lexer,
    source: &str,
    source_name: &Arc<str>,
    scope: DeclarationScope,
) -> Result<Program, CodeError> {
    let tokens = lexer.tokenize(source, source_name)?;
    parse(tokens, Arc::clone(source_name), scope)
}

pub fn parse(
    tokens: Vec<Token>,
    source_name: Arc<str>,
    scope: DeclarationScope,
) -> Result<Program, CodeError> {
    Parser::new(tokens, scope).parse_program(source_name)
}

struct Parser {
    tokens: Vec<Token>,
    current: usize,
    scope: DeclarationScope,
    class_depth: usize,
    nesting: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, scope: DeclarationScope) -> Self {
        Self {
            tokens,
            current: 0,
            scope,
            class_depth: 0,
            nesting: 0,
        }
    }

    /// Runs one level of recursive descent, bounding how deep input may nest.
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, CodeError>,
    ) -> Result<T, CodeError> {
        if self.nesting >= MAX_NESTING {
            return Err(self.error(
                ErrorKind::IllegalSyntax,
                self.peek(),
                "input is nested too deeply",
            ));
        }
        self.nesting += 1;
        let result = stacker::maybe_grow(RED_ZONE, STACK_GROWTH, || parse(self));
        self.nesting -= 1;
        result
    }

    fn parse_program(&mut self, source_name: Arc<str>) -> Result<Program, CodeError> {
        let mut statements = Vec::new();
        while !self.check(TokenKind::Eof) {
            statements.push(self.parse_statement()?);
        }
        Ok(Program {
            source_name,
            statements,
        })
    }

    fn parse_statement(&mut self) -> Result<Stmt, CodeError> {
        self.nested(Self::parse_statement_kind)
    }

    fn parse_statement_kind(&mut self) -> Result<Stmt, CodeError> {
        match self.peek().kind {
            TokenKind::Keyword(Keyword::Var) => self.parse_var_decl(),
            TokenKind::Keyword(Keyword::Function) if self.peek_next_is(TokenKind::Identifier) => {
                self.parse_function_decl()
            }
            TokenKind::Keyword(Keyword::Class) => self.parse_class_decl(),
            TokenKind::Keyword(Keyword::If) => self.parse_if(),
            TokenKind::Keyword(Keyword::While) => self.parse_while(),
            TokenKind::Keyword(Keyword::Return) => self.parse_return(),
            TokenKind::Keyword(Keyword::Break) => {
                let token = self.advance();
                self.expect_terminator()?;
                Ok(Stmt {
                    kind: StmtKind::Break,
                    span: token.span,
                })
            }
            TokenKind::Keyword(Keyword::Continue) => {
                let token = self.advance();
                self.expect_terminator()?;
                Ok(Stmt {
                    kind: StmtKind::Continue,
                    span: token.span,
                })
            }
            TokenKind::LBrace => {
                self.scope.push();
                let block = self.parse_block();
                self.scope.pop();
                let (items, span) = block?;
                Ok(Stmt {
                    kind: StmtKind::Block(items),
                    span,
                })
            }
            _ => self.parse_expression_statement(),
        }
    }

    /// Parses `{ ... }` without opening a declaration frame.
    fn parse_block(&mut self) -> Result<(Vec<Stmt>, SourceSpan), CodeError> {
        let lbrace = self.consume(TokenKind::LBrace, "expected `{` to start block")?;
        let mut items = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            items.push(self.parse_statement()?);
        }
        let rbrace = self.consume(TokenKind::RBrace, "expected `}` to close block")?;
        Ok((items, lbrace.span.to(&rbrace.span)))
    }

    fn parse_var_decl(&mut self) -> Result<Stmt, CodeError> {
        let keyword = self.consume_keyword(Keyword::Var)?;
        let name = self.consume_identifier("expected variable name after `var`")?;
        let initializer = if self.matches(TokenKind::Assign) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.declare_binding(&name)?;
        self.expect_terminator()?;
        Ok(Stmt {
            span: keyword.span.to(&self.previous().span),
            kind: StmtKind::VarDecl {
                name: name.lexeme,
                initializer,
            },
        })
    }

    fn parse_function_decl(&mut self) -> Result<Stmt, CodeError> {
        let keyword = self.consume_keyword(Keyword::Function)?;
        let name = self.consume_identifier("expected function name")?;
        self.declare_binding(&name)?;
        let decl = self.parse_function_rest(name.lexeme, &keyword.span)?;
        Ok(Stmt {
            span: decl.span.clone(),
            kind: StmtKind::Function(decl),
        })
    }

    /// Parameters and body; `start` is the span the declaration begins at.
    fn parse_function_rest(
        &mut self,
        name: String,
        start: &SourceSpan,
    ) -> Result<Arc<FunctionDecl>, CodeError> {
        self.consume(TokenKind::LParen, "expected `(` before parameters")?;
        let mut params = Vec::new();
        let mut rest = None;
        if !self.check(TokenKind::RParen) {
            loop {
                if self.matches(TokenKind::Ellipsis) {
                    let token = self.consume_identifier("expected parameter name after `...`")?;
                    rest = Some(token);
                    break;
                }
                params.push(self.consume_identifier("expected parameter name")?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "expected `)` after parameters")?;

        self.scope.push();
        let body = self.parse_function_body(&params, rest.as_ref());
        self.scope.pop();
        let body = body?;

        let to_param = |token: Token| Param {
            name: token.lexeme,
            span: token.span,
        };
        Ok(Arc::new(FunctionDecl {
            name,
            params: params.into_iter().map(to_param).collect(),
            rest: rest.map(to_param),
            body: body.into(),
            span: start.to(&self.previous().span),
        }))
    }

    fn parse_function_body(
        &mut self,
        params: &[Token],
        rest: Option<&Token>,
    ) -> Result<Vec<Stmt>, CodeError> {
        let mut seen = IndexSet::new();
        for param in params.iter().chain(rest) {
            if !seen.insert(param.lexeme.as_str()) {
                return Err(self.error(
                    ErrorKind::IllegalSyntax,
                    param,
                    &format!("duplicate parameter `{}`", param.lexeme),
                ));
            }
            self.declare_binding(param)?;
        }
        let (body, _) = self.parse_block()?;
        Ok(body)
    }

    fn parse_class_decl(&mut self) -> Result<Stmt, CodeError> {
        let keyword = self.consume_keyword(Keyword::Class)?;
        let name = self.consume_identifier("expected class name")?;
        self.declare_binding(&name)?;
        let parent = if self.matches_keyword(Keyword::Extends) {
            let parent = self.consume_identifier("expected parent class name after `extends`")?;
            Some((parent.lexeme, parent.span))
        } else {
            None
        };
        self.consume(TokenKind::LBrace, "expected `{` after class header")?;

        self.class_depth += 1;
        self.scope.push();
        let members = self.parse_class_members();
        self.scope.pop();
        self.class_depth -= 1;
        let (fields, constructors, methods) = members?;

        let rbrace = self.consume(TokenKind::RBrace, "expected `}` after class body")?;
        let decl = ClassDecl {
            name: name.lexeme,
            parent,
            fields,
            constructors,
            methods,
            span: keyword.span.to(&rbrace.span),
        };
        Ok(Stmt {
            span: decl.span.clone(),
            kind: StmtKind::Class(Arc::new(decl)),
        })
    }

    #[allow(clippy::type_complexity)]
    fn parse_class_members(
        &mut self,
    ) -> Result<(Vec<FieldDecl>, Vec<Arc<FunctionDecl>>, Vec<MethodDecl>), CodeError> {
        let mut fields = Vec::new();
        let mut constructors = Vec::new();
        let mut methods = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            let start = self.peek().span.clone();
            let is_static = self.matches_keyword(Keyword::Static);
            match self.peek().kind {
                TokenKind::Keyword(Keyword::Var) => {
                    self.advance();
                    let name = self.consume_identifier("expected field name")?;
                    let initializer = if self.matches(TokenKind::Assign) {
                        Some(self.parse_expression()?)
                    } else {
                        None
                    };
                    self.consume(TokenKind::Semicolon, "expected `;` after field declaration")?;
                    fields.push(FieldDecl {
                        name: name.lexeme,
                        is_static,
                        initializer,
                        span: start.to(&self.previous().span),
                    });
                }
                TokenKind::Keyword(Keyword::Function) => {
                    self.advance();
                    let name = self.consume_identifier("expected method name")?;
                    let function = self.parse_function_rest(name.lexeme, &start)?;
                    methods.push(MethodDecl {
                        function,
                        is_static,
                        is_operator: false,
                    });
                }
                TokenKind::Keyword(Keyword::Constructor) if !is_static => {
                    self.advance();
                    let function = self.parse_function_rest("constructor".into(), &start)?;
                    if function.is_variadic() {
                        return Err(CodeError::new(
                            ErrorKind::IllegalSyntax,
                            "constructors cannot take a rest parameter",
                        )
                        .with_span(function.span.clone()));
                    }
                    constructors.push(function);
                }
                TokenKind::Keyword(Keyword::Operator) if !is_static => {
                    self.advance();
                    methods.push(self.parse_operator(&start)?);
                }
                _ => {
                    let token = self.peek().clone();
                    return Err(self.error(
                        ErrorKind::IllegalSyntax,
                        &token,
                        "expected field, method, constructor or operator in class body",
                    ));
                }
            }
        }
        Ok((fields, constructors, methods))
    }

    fn parse_operator(&mut self, start: &SourceSpan) -> Result<MethodDecl, CodeError> {
        let token = self.advance();
        let symbol = match token.kind {
            TokenKind::Plus => BinaryOp::Add.symbol(),
            TokenKind::Minus => BinaryOp::Sub.symbol(),
            TokenKind::Star => BinaryOp::Mul.symbol(),
            TokenKind::Slash => BinaryOp::Div.symbol(),
            TokenKind::Percent => BinaryOp::Mod.symbol(),
            TokenKind::Caret => BinaryOp::Pow.symbol(),
            TokenKind::EqualEqual => BinaryOp::Equal.symbol(),
            TokenKind::BangEqual => BinaryOp::NotEqual.symbol(),
            TokenKind::Less => BinaryOp::Less.symbol(),
            TokenKind::LessEqual => BinaryOp::LessEqual.symbol(),
            TokenKind::Greater => BinaryOp::Greater.symbol(),
            TokenKind::GreaterEqual => BinaryOp::GreaterEqual.symbol(),
            TokenKind::Bang => UnaryOp::Not.symbol(),
            _ => {
                return Err(self.error(
                    ErrorKind::IllegalSyntax,
                    &token,
                    "expected an overloadable operator after `operator`",
                ));
            }
        };
        let function = self.parse_function_rest(symbol.to_string(), start)?;
        let allowed: &[usize] = match token.kind {
            TokenKind::Bang => &[0],
            TokenKind::Minus => &[0, 1],
            _ => &[1],
        };
        if function.is_variadic() || !allowed.contains(&function.arity()) {
            return Err(CodeError::new(
                ErrorKind::IllegalSyntax,
                format!(
                    "operator `{symbol}` cannot take {} parameter(s)",
                    function.arity()
                ),
            )
            .with_span(function.span.clone()));
        }
        Ok(MethodDecl {
            function,
            is_static: false,
            is_operator: true,
        })
    }

    fn parse_if(&mut self) -> Result<Stmt, CodeError> {
        let keyword = self.consume_keyword(Keyword::If)?;
        self.consume(TokenKind::LParen, "expected `(` after `if`")?;
        let condition = self.parse_expression()?;
        self.consume(TokenKind::RParen, "expected `)` after condition")?;
        let then_branch = Box::new(self.parse_statement()?);
        let else_branch = if self.matches_keyword(Keyword::Else) {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt {
            span: keyword.span.to(&self.previous().span),
            kind: StmtKind::If {
                condition,
                then_branch,
                else_branch,
            },
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, CodeError> {
        let keyword = self.consume_keyword(Keyword::While)?;
        self.consume(TokenKind::LParen, "expected `(` after `while`")?;
        let condition = self.parse_expression()?;
        self.consume(TokenKind::RParen, "expected `)` after condition")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt {
            span: keyword.span.to(&self.previous().span),
            kind: StmtKind::While { condition, body },
        })
    }

    fn parse_return(&mut self) -> Result<Stmt, CodeError> {
        let keyword = self.consume_keyword(Keyword::Return)?;
        let value = if self.check(TokenKind::Semicolon)
            || self.check(TokenKind::RBrace)
            || self.check(TokenKind::Eof)
        {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_terminator()?;
        Ok(Stmt {
            span: keyword.span.to(&self.previous().span),
            kind: StmtKind::Return(value),
        })
    }

    fn parse_expression_statement(&mut self) -> Result<Stmt, CodeError> {
        let expr = self.parse_expression()?;
        self.expect_terminator()?;
        Ok(Stmt {
            span: expr.span.clone(),
            kind: StmtKind::Expr(expr),
        })
    }

    fn parse_expression(&mut self) -> Result<Expr, CodeError> {
        self.nested(Self::parse_assignment)
    }

    fn parse_assignment(&mut self) -> Result<Expr, CodeError> {
        if self.check(TokenKind::Identifier) {
            let mark = self.current;
            let name = self.advance();
            if self.matches(TokenKind::Assign) {
                self.check_assignable(&name)?;
                let value = self.parse_expression()?;
                return Ok(Expr {
                    span: name.span.to(&value.span),
                    kind: ExprKind::Assign {
                        name: name.lexeme,
                        value: Box::new(value),
                    },
                });
            }
            self.current = mark;
        }

        let expr = self.parse_or()?;
        if !self.matches(TokenKind::Assign) {
            return Ok(expr);
        }
        let equals = self.previous().clone();
        let value = self.parse_expression()?;
        let span = expr.span.to(&value.span);
        let kind = match expr.kind {
            ExprKind::Member { target, field } => ExprKind::SetMember {
                target,
                field,
                value: Box::new(value),
            },
            ExprKind::Index { target, index } => ExprKind::SetIndex {
                target,
                index,
                value: Box::new(value),
            },
            _ => {
                return Err(self.error(
                    ErrorKind::IllegalSyntax,
                    &equals,
                    "invalid assignment target",
                ));
            }
        };
        Ok(Expr { kind, span })
    }

    fn parse_or(&mut self) -> Result<Expr, CodeError> {
        let mut expr = self.parse_and()?;
        while self.matches(TokenKind::DoublePipe) {
            let right = self.parse_and()?;
            expr = logical(LogicalOp::Or, expr, right);
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, CodeError> {
        let mut expr = self.parse_comparison()?;
        while self.matches(TokenKind::DoubleAmpersand) {
            let right = self.parse_comparison()?;
            expr = logical(LogicalOp::And, expr, right);
        }
        Ok(expr)
    }

    /// Equality and relational operators share one level.
    fn parse_comparison(&mut self) -> Result<Expr, CodeError> {
        let mut expr = self.parse_additive()?;
        while let Some(op) = self.match_binary(&[
            (TokenKind::EqualEqual, BinaryOp::Equal),
            (TokenKind::BangEqual, BinaryOp::NotEqual),
            (TokenKind::LessEqual, BinaryOp::LessEqual),
            (TokenKind::GreaterEqual, BinaryOp::GreaterEqual),
            (TokenKind::Less, BinaryOp::Less),
            (TokenKind::Greater, BinaryOp::Greater),
        ]) {
            let right = self.parse_additive()?;
            expr = binary(op, expr, right);
        }
        Ok(expr)
    }

    fn parse_additive(&mut self) -> Result<Expr, CodeError> {
        let mut expr = self.parse_multiplicative()?;
        while let Some(op) = self.match_binary(&[
            (TokenKind::Plus, BinaryOp::Add),
            (TokenKind::Minus, BinaryOp::Sub),
        ]) {
            let right = self.parse_multiplicative()?;
            expr = binary(op, expr, right);
        }
        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, CodeError> {
        let mut expr = self.parse_unary()?;
        while let Some(op) = self.match_binary(&[
            (TokenKind::Star, BinaryOp::Mul),
            (TokenKind::Slash, BinaryOp::Div),
            (TokenKind::Percent, BinaryOp::Mod),
        ]) {
            let right = self.parse_unary()?;
            expr = binary(op, expr, right);
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, CodeError> {
        let op = if self.matches(TokenKind::Minus) {
            UnaryOp::Negate
        } else if self.matches(TokenKind::Bang) {
            UnaryOp::Not
        } else {
            return self.parse_power();
        };
        let operator = self.previous().span.clone();
        let operand = self.nested(Self::parse_unary)?;
        Ok(Expr {
            span: operator.to(&operand.span),
            kind: ExprKind::Unary {
                op,
                expr: Box::new(operand),
            },
        })
    }

    fn parse_power(&mut self) -> Result<Expr, CodeError> {
        let expr = self.parse_postfix()?;
        if self.matches(TokenKind::Caret) {
            let right = self.nested(Self::parse_unary)?;
            return Ok(binary(BinaryOp::Pow, expr, right));
        }
        Ok(expr)
    }

    fn parse_postfix(&mut self) -> Result<Expr, CodeError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.matches(TokenKind::LParen) {
                let args = self.parse_arguments()?;
                expr = Expr {
                    span: expr.span.to(&self.previous().span),
                    kind: ExprKind::Call {
                        callee: Box::new(expr),
                        args,
                    },
                };
            } else if self.matches(TokenKind::LBracket) {
                let index = self.parse_expression()?;
                let bracket = self.consume(TokenKind::RBracket, "expected `]` after index")?;
                expr = Expr {
                    span: expr.span.to(&bracket.span),
                    kind: ExprKind::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    },
                };
            } else if self.matches(TokenKind::Dot) {
                let field = self.consume_identifier("expected member name after `.`")?;
                expr = Expr {
                    span: expr.span.to(&field.span),
                    kind: ExprKind::Member {
                        target: Box::new(expr),
                        field: field.lexeme,
                    },
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    /// Arguments after an already consumed `(`, through the closing `)`.
    fn parse_arguments(&mut self) -> Result<Vec<Expr>, CodeError> {
        let mut args = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                args.push(self.parse_expression()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "expected `)` after arguments")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, CodeError> {
        let token = self.peek().clone();
        let literal = |literal: Literal, token: Token| Expr {
            span: token.span,
            kind: ExprKind::Literal(literal),
        };
        match token.kind {
            TokenKind::Keyword(Keyword::True) => Ok(literal(Literal::Bool(true), self.advance())),
            TokenKind::Keyword(Keyword::False) => {
                Ok(literal(Literal::Bool(false), self.advance()))
            }
            TokenKind::Keyword(Keyword::Null) => Ok(literal(Literal::Null, self.advance())),
            TokenKind::Number => {
                let token = self.advance();
                let value = token.lexeme.parse::<f64>().map_err(|_| {
                    self.error(ErrorKind::IllegalSyntax, &token, "malformed number literal")
                })?;
                Ok(literal(Literal::Number(value), token))
            }
            TokenKind::String => {
                let token = self.advance();
                let value = unescape(&token.lexeme);
                Ok(literal(Literal::String(value), token))
            }
            TokenKind::Identifier => {
                let token = self.advance();
                Ok(Expr {
                    span: token.span,
                    kind: ExprKind::Variable(token.lexeme),
                })
            }
            TokenKind::Keyword(Keyword::This) => {
                let token = self.advance();
                if self.class_depth == 0 {
                    return Err(self.error(
                        ErrorKind::IllegalOperation,
                        &token,
                        "`this` used outside of a class body",
                    ));
                }
                Ok(Expr {
                    span: token.span,
                    kind: ExprKind::This,
                })
            }
            TokenKind::Keyword(Keyword::New) => {
                let keyword = self.advance();
                let class = self.consume_identifier("expected class name after `new`")?;
                self.consume(TokenKind::LParen, "expected `(` after class name")?;
                let args = self.parse_arguments()?;
                Ok(Expr {
                    span: keyword.span.to(&self.previous().span),
                    kind: ExprKind::New {
                        class: class.lexeme,
                        args,
                    },
                })
            }
            TokenKind::Keyword(Keyword::Function) => {
                let keyword = self.advance();
                let name = format!(
                    "<lambda@{}:{}>",
                    keyword.span.start.line, keyword.span.start.column
                );
                let decl = self.parse_function_rest(name, &keyword.span)?;
                Ok(Expr {
                    span: decl.span.clone(),
                    kind: ExprKind::Lambda(decl),
                })
            }
            TokenKind::LParen => {
                let lparen = self.advance();
                let inner = self.parse_expression()?;
                let rparen = self.consume(TokenKind::RParen, "expected `)` after expression")?;
                Ok(Expr {
                    span: lparen.span.to(&rparen.span),
                    kind: ExprKind::Group(Box::new(inner)),
                })
            }
            TokenKind::LBracket => {
                let lbracket = self.advance();
                let mut elements = Vec::new();
                if !self.check(TokenKind::RBracket) {
                    loop {
                        elements.push(self.parse_expression()?);
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                let rbracket =
                    self.consume(TokenKind::RBracket, "expected `]` after list literal")?;
                Ok(Expr {
                    span: lbracket.span.to(&rbracket.span),
                    kind: ExprKind::ListLiteral(elements),
                })
            }
            TokenKind::LBrace => self.parse_map_literal(),
            TokenKind::Eof => Err(self.error(
                ErrorKind::IllegalSyntax,
                &token,
                "unexpected end of input in expression",
            )),
            _ => Err(self.error(
                ErrorKind::IllegalSyntax,
                &token,
                &format!("unexpected {} in expression", token.kind.describe()),
            )),
        }
    }

    fn parse_map_literal(&mut self) -> Result<Expr, CodeError> {
        let lbrace = self.advance();
        let mut entries = Vec::new();
        if !self.check(TokenKind::RBrace) {
            loop {
                let key = self.parse_expression()?;
                self.consume(TokenKind::Colon, "expected `:` in map literal")?;
                let value = self.parse_expression()?;
                entries.push((key, value));
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        let rbrace = self.consume(TokenKind::RBrace, "expected `}` after map literal")?;
        Ok(Expr {
            span: lbrace.span.to(&rbrace.span),
            kind: ExprKind::MapLiteral(entries),
        })
    }

    fn declare_binding(&mut self, name: &Token) -> Result<(), CodeError> {
        if self.scope.is_builtin(&name.lexeme) {
            return Err(self.error(
                ErrorKind::IllegalOperation,
                name,
                &format!("cannot redefine built-in `{}`", name.lexeme),
            ));
        }
        self.scope.declare(name.lexeme.clone());
        Ok(())
    }

    fn check_assignable(&self, name: &Token) -> Result<(), CodeError> {
        if self.scope.is_builtin(&name.lexeme) {
            return Err(self.error(
                ErrorKind::IllegalOperation,
                name,
                &format!("cannot assign to built-in `{}`", name.lexeme),
            ));
        }
        if !self.scope.is_declared(&name.lexeme) {
            return Err(self.error(
                ErrorKind::UnknownIdentifier,
                name,
                &format!("cannot assign to undeclared variable `{}`", name.lexeme),
            ));
        }
        Ok(())
    }

    /// `;` is required, except directly before the end of input.
    fn expect_terminator(&mut self) -> Result<(), CodeError> {
        if self.matches(TokenKind::Semicolon) || self.check(TokenKind::Eof) {
            Ok(())
        } else {
            let token = self.peek().clone();
            Err(self.error(ErrorKind::ExpectedChar, &token, "expected `;`"))
        }
    }

    fn match_binary(&mut self, table: &[(TokenKind, BinaryOp)]) -> Option<BinaryOp> {
        let found = table
            .iter()
            .find(|(kind, _)| self.check(*kind))
            .map(|(_, op)| *op);
        if found.is_some() {
            self.advance();
        }
        found
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn matches_keyword(&mut self, keyword: Keyword) -> bool {
        self.matches(TokenKind::Keyword(keyword))
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Result<Token, CodeError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            let token = self.peek().clone();
            Err(self.error(ErrorKind::ExpectedChar, &token, message))
        }
    }

    fn consume_keyword(&mut self, keyword: Keyword) -> Result<Token, CodeError> {
        self.consume(
            TokenKind::Keyword(keyword),
            &format!("expected keyword `{}`", keyword.as_str()),
        )
    }

    fn consume_identifier(&mut self, message: &str) -> Result<Token, CodeError> {
        self.consume(TokenKind::Identifier, message)
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn peek_next_is(&self, kind: TokenKind) -> bool {
        self.tokens
            .get(self.current + 1)
            .is_some_and(|token| token.kind == kind)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.current += 1;
        }
        token
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current.saturating_sub(1)]
    }

    /// The token stream always ends with `Eof`, which is never consumed.
    fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn error(&self, kind: ErrorKind, token: &Token, message: &str) -> CodeError {
        let found = if token.kind == TokenKind::Eof {
            "end of input".to_string()
        } else {
            format!("`{}`", token.lexeme)
        };
        CodeError::new(kind, message.to_string())
            .with_span(token.span.clone())
            .with_note(format!("found {found}"))
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr {
        span: left.span.to(&right.span),
        kind: ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
    }
}

fn logical(op: LogicalOp, left: Expr, right: Expr) -> Expr {
    Expr {
        span: left.span.to(&right.span),
        kind: ExprKind::Logical {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
    }
}

/// Strips the surrounding quotes and resolves backslash escapes.
fn unescape(lexeme: &str) -> String {
    let inner = lexeme
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(lexeme);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_with(source: &str, builtins: &[&str]) -> Result<Program, CodeError> {
        let lexer = Lexer::new().unwrap();
        parse_source(
            &lexer,
            source,
            &Arc::from("test"),
            DeclarationScope::new(builtins.iter().copied()),
        )
    }

    fn parse_ok(source: &str) -> Program {
        parse_with(source, &["print"]).unwrap()
    }

    fn first_expr(program: &Program) -> &Expr {
        match &program.statements[0].kind {
            StmtKind::Expr(expr) => expr,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let program = parse_ok("1 + 2 * 3;");
        let ExprKind::Binary { op, right, .. } = &first_expr(&program).kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn power_is_above_unary_minus() {
        let program = parse_ok("-2 ^ 2;");
        let ExprKind::Unary { op, expr } = &first_expr(&program).kind else {
            panic!("expected unary");
        };
        assert_eq!(*op, UnaryOp::Negate);
        assert!(matches!(expr.kind, ExprKind::Binary { op: BinaryOp::Pow, .. }));
    }

    #[test]
    fn equality_and_relational_share_a_level() {
        let program = parse_ok("1 < 2 == true;");
        let ExprKind::Binary { op, left, .. } = &first_expr(&program).kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Equal);
        assert!(matches!(left.kind, ExprKind::Binary { op: BinaryOp::Less, .. }));
    }

    #[test]
    fn assignment_detection_backtracks_for_comparisons() {
        let program = parse_ok("var x = 1; x == 2; x = 3;");
        assert!(matches!(
            program.statements[1].kind,
            StmtKind::Expr(Expr {
                kind: ExprKind::Binary { .. },
                ..
            })
        ));
        assert!(matches!(
            program.statements[2].kind,
            StmtKind::Expr(Expr {
                kind: ExprKind::Assign { .. },
                ..
            })
        ));
    }

    #[test]
    fn member_and_index_assignment() {
        let program = parse_ok("var p = {}; p.x = 1; p[0] = 2;");
        assert!(matches!(
            program.statements[1].kind,
            StmtKind::Expr(Expr {
                kind: ExprKind::SetMember { .. },
                ..
            })
        ));
        assert!(matches!(
            program.statements[2].kind,
            StmtKind::Expr(Expr {
                kind: ExprKind::SetIndex { .. },
                ..
            })
        ));
    }

    #[test]
    fn assigning_undeclared_name_is_unknown_identifier() {
        let error = parse_with("y = 3;", &["print"]).unwrap_err();
        assert_eq!(error.kind, ErrorKind::UnknownIdentifier);
    }

    #[test]
    fn redefining_builtin_is_illegal() {
        for source in ["var print = 1;", "print = 1;", "function f(print) {}", "function print() {}"] {
            let error = parse_with(source, &["print"]).unwrap_err();
            assert_eq!(error.kind, ErrorKind::IllegalOperation, "{source}");
        }
    }

    #[test]
    fn block_declarations_do_not_leak() {
        let error = parse_with("{ var inner = 1; } inner = 2;", &[]).unwrap_err();
        assert_eq!(error.kind, ErrorKind::UnknownIdentifier);
    }

    #[test]
    fn host_declared_names_are_assignable() {
        let lexer = Lexer::new().unwrap();
        let mut scope = DeclarationScope::new(["print"]);
        scope.declare("counter");
        parse_source(&lexer, "counter = 2;", &Arc::from("test"), scope).unwrap();
    }

    #[test]
    fn runaway_nesting_is_a_syntax_error() {
        let source = format!("{}1;", "-".repeat(200_000));
        let error = parse_with(&source, &[]).unwrap_err();
        assert_eq!(error.kind, ErrorKind::IllegalSyntax);
        assert!(error.message.contains("nested too deeply"), "{}", error.message);

        let parens = format!("{}1{};", "(".repeat(200), ")".repeat(200));
        parse_with(&parens, &[]).unwrap();
    }

    #[test]
    fn missing_semicolon_is_expected_char() {
        let error = parse_with("var a = 1 var b = 2;", &[]).unwrap_err();
        assert_eq!(error.kind, ErrorKind::ExpectedChar);
    }

    #[test]
    fn lambdas_are_named_by_position() {
        let program = parse_ok("var f = function(a, ...rest) { return a; };");
        let StmtKind::VarDecl {
            initializer: Some(init),
            ..
        } = &program.statements[0].kind
        else {
            panic!("expected var");
        };
        let ExprKind::Lambda(decl) = &init.kind else {
            panic!("expected lambda");
        };
        assert_eq!(decl.name, "<lambda@1:9>");
        assert_eq!(decl.rest.as_ref().map(|p| p.name.as_str()), Some("rest"));
    }

    #[test]
    fn class_members_are_collected() {
        let program = parse_ok(
            r#"
            class Vec2 extends Base {
                var x = 0;
                static var count = 0;
                constructor(x) { this.x = x; }
                function len() { return this.x; }
                static function origin() { return new Vec2(0); }
                operator +(other) { return new Vec2(this.x + other.x); }
                operator -() { return new Vec2(-this.x); }
            }
            "#,
        );
        let StmtKind::Class(class) = &program.statements[0].kind else {
            panic!("expected class");
        };
        assert_eq!(class.parent.as_ref().map(|(name, _)| name.as_str()), Some("Base"));
        assert_eq!(class.fields.len(), 2);
        assert!(class.fields[1].is_static);
        assert_eq!(class.constructors.len(), 1);
        assert_eq!(class.methods.len(), 4);
        assert!(class.methods[2].is_operator);
        assert_eq!(class.methods[3].function.arity(), 0);
    }

    #[test]
    fn this_outside_class_is_rejected() {
        let error = parse_with("this;", &[]).unwrap_err();
        assert_eq!(error.kind, ErrorKind::IllegalOperation);
    }

    #[test]
    fn string_escapes_are_resolved() {
        let program = parse_ok(r#""a\n\"b\"";"#);
        assert_eq!(
            first_expr(&program).kind,
            ExprKind::Literal(Literal::String("a\n\"b\"".into()))
        );
    }

    #[test]
    fn parsing_is_deterministic() {
        let source = "var a = [1, 2]; function f(x) { while (x > 0) { x = x - 1; } return x; }";
        assert_eq!(parse_ok(source), parse_ok(source));
    }
}
