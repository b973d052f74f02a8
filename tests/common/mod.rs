//! Shared test support: a calculator subset of Lox run as a native guest.
//!
//! Supports numbers, `+ - * /`, unary minus, parentheses, `var`
//! declarations, `print` and expression statements. Errors are reported in
//! the `[Line l Col c] Error at 'x': message` form.

#![allow(dead_code)]

use rulox_bridge::{Bridge, BridgeConfig, GuestProgram};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Output of a program that printed nothing
pub const NO_OUTPUT: &str = "No output to display.";

/// Environment dump of a program without bindings
pub const EMPTY_ENVIRONMENT: &str = "Environment: {  }";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    Number(f64),
    Identifier,
    Var,
    Print,
    Plus,
    Minus,
    Star,
    Slash,
    LeftParen,
    RightParen,
    Equal,
    Semicolon,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    kind: Kind,
    lexeme: String,
    line: usize,
    col: usize,
}

impl Token {
    fn to_json(&self) -> Value {
        let kind = match self.kind {
            Kind::Number(_) => "NUMBER",
            Kind::Identifier => "IDENTIFIER",
            Kind::Var => "VAR",
            Kind::Print => "PRINT",
            Kind::Plus => "PLUS",
            Kind::Minus => "MINUS",
            Kind::Star => "STAR",
            Kind::Slash => "SLASH",
            Kind::LeftParen => "LEFT_PAREN",
            Kind::RightParen => "RIGHT_PAREN",
            Kind::Equal => "EQUAL",
            Kind::Semicolon => "SEMICOLON",
            Kind::Eof => "EOF",
        };
        json!({ "type": kind, "lexeme": self.lexeme, "line": self.line, "col": self.col })
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Number(f64),
    Variable(Token),
    Negate(Box<Expr>),
    Binary(Box<Expr>, char, Box<Expr>),
    Grouping(Box<Expr>),
}

impl Expr {
    fn to_json(&self) -> Value {
        match self {
            Expr::Number(n) => json!({ "literal": format_number(*n) }),
            Expr::Variable(token) => json!({ "variable": token.lexeme }),
            Expr::Negate(inner) => json!({ "unary": "-", "right": inner.to_json() }),
            Expr::Binary(left, op, right) => json!({
                "binary": op.to_string(),
                "left": left.to_json(),
                "right": right.to_json(),
            }),
            Expr::Grouping(inner) => json!({ "grouping": inner.to_json() }),
        }
    }
}

#[derive(Debug, Clone)]
enum Stmt {
    Var(String, Option<Expr>),
    Print(Expr),
    Expression(Expr),
}

impl Stmt {
    fn to_json(&self) -> Value {
        match self {
            Stmt::Var(name, init) => json!({
                "var": name,
                "initializer": init.as_ref().map(Expr::to_json),
            }),
            Stmt::Print(expr) => json!({ "print": expr.to_json() }),
            Stmt::Expression(expr) => json!({ "expression": expr.to_json() }),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn report(line: usize, col: usize, location: &str, message: &str) -> String {
    format!("[Line {} Col {}] Error{}: {}", line, col, location, message)
}

fn scan(source: &str, errors: &mut Vec<String>) -> Vec<Token> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let (mut i, mut line, mut col) = (0, 1, 1);

    while i < chars.len() {
        let c = chars[i];
        let (start, start_col) = (i, col);
        i += 1;
        col += 1;

        let kind = match c {
            '\n' => {
                line += 1;
                col = 1;
                continue;
            }
            c if c.is_whitespace() => continue,
            '/' if chars.get(i) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '+' => Kind::Plus,
            '-' => Kind::Minus,
            '*' => Kind::Star,
            '/' => Kind::Slash,
            '(' => Kind::LeftParen,
            ')' => Kind::RightParen,
            '=' => Kind::Equal,
            ';' => Kind::Semicolon,
            c if c.is_ascii_digit() => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                    col += 1;
                }
                let text: String = chars[start..i].iter().collect();
                match text.parse() {
                    Ok(n) => Kind::Number(n),
                    Err(_) => {
                        errors.push(report(line, start_col, "", "Invalid number."));
                        continue;
                    }
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                    col += 1;
                }
                let text: String = chars[start..i].iter().collect();
                match text.as_str() {
                    "var" => Kind::Var,
                    "print" => Kind::Print,
                    _ => Kind::Identifier,
                }
            }
            other => {
                errors.push(report(
                    line,
                    start_col,
                    &format!(" at '{}'", other),
                    "Unexpected character.",
                ));
                continue;
            }
        };

        tokens.push(Token {
            kind,
            lexeme: chars[start..i].iter().collect(),
            line,
            col: start_col,
        });
    }

    tokens.push(Token {
        kind: Kind::Eof,
        lexeme: String::new(),
        line,
        col,
    });
    tokens
}

struct Parser<'t> {
    tokens: &'t [Token],
    current: usize,
    errors: Vec<String>,
}

impl<'t> Parser<'t> {
    fn parse(tokens: &'t [Token]) -> (Vec<Stmt>, Vec<String>) {
        let mut parser = Parser {
            tokens,
            current: 0,
            errors: Vec::new(),
        };
        let mut statements = Vec::new();
        while parser.peek().kind != Kind::Eof {
            match parser.statement() {
                Some(stmt) => statements.push(stmt),
                None => parser.synchronize(),
            }
        }
        (statements, parser.errors)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.current].clone();
        if token.kind != Kind::Eof {
            self.current += 1;
        }
        token
    }

    fn check(&self, kind: Kind) -> bool {
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(&kind)
    }

    fn error(&mut self, message: &str) {
        let token = self.peek().clone();
        let location = if token.kind == Kind::Eof {
            " at end".to_string()
        } else {
            format!(" at '{}'", token.lexeme)
        };
        self.errors
            .push(report(token.line, token.col, &location, message));
    }

    fn expect(&mut self, kind: Kind, message: &str) -> Option<Token> {
        if self.check(kind) {
            Some(self.advance())
        } else {
            self.error(message);
            None
        }
    }

    fn synchronize(&mut self) {
        while self.peek().kind != Kind::Eof {
            if self.advance().kind == Kind::Semicolon {
                return;
            }
        }
    }

    fn statement(&mut self) -> Option<Stmt> {
        if self.check(Kind::Var) {
            self.advance();
            let name = self.expect(Kind::Identifier, "Expect variable name.")?;
            let init = if self.check(Kind::Equal) {
                self.advance();
                Some(self.expression()?)
            } else {
                None
            };
            self.expect(Kind::Semicolon, "Expect ';' after variable declaration.")?;
            return Some(Stmt::Var(name.lexeme, init));
        }

        let print = self.check(Kind::Print);
        if print {
            self.advance();
        }
        let expr = self.expression()?;
        self.expect(Kind::Semicolon, "Expect ';' after expression.")?;
        Some(if print {
            Stmt::Print(expr)
        } else {
            Stmt::Expression(expr)
        })
    }

    fn expression(&mut self) -> Option<Expr> {
        let mut expr = self.factor()?;
        while self.check(Kind::Plus) || self.check(Kind::Minus) {
            let op = self.advance().lexeme.chars().next()?;
            let right = self.factor()?;
            expr = Expr::Binary(Box::new(expr), op, Box::new(right));
        }
        Some(expr)
    }

    fn factor(&mut self) -> Option<Expr> {
        let mut expr = self.unary()?;
        while self.check(Kind::Star) || self.check(Kind::Slash) {
            let op = self.advance().lexeme.chars().next()?;
            let right = self.unary()?;
            expr = Expr::Binary(Box::new(expr), op, Box::new(right));
        }
        Some(expr)
    }

    fn unary(&mut self) -> Option<Expr> {
        if self.check(Kind::Minus) {
            self.advance();
            return Some(Expr::Negate(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Option<Expr> {
        let token = self.peek().clone();
        match token.kind {
            Kind::Number(n) => {
                self.advance();
                Some(Expr::Number(n))
            }
            Kind::Identifier => {
                self.advance();
                Some(Expr::Variable(token))
            }
            Kind::LeftParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(Kind::RightParen, "Expect ')' after expression.")?;
                Some(Expr::Grouping(Box::new(inner)))
            }
            _ => {
                self.error("Expect expression.");
                None
            }
        }
    }
}

/// One compiled calculator program
pub struct Session {
    tokens: Vec<Token>,
    statements: Vec<Stmt>,
    errors: Vec<String>,
    environment: BTreeMap<String, f64>,
    destroyed: Arc<AtomicUsize>,
}

impl Session {
    fn evaluate(&self, expr: &Expr) -> Result<f64, String> {
        match expr {
            Expr::Number(n) => Ok(*n),
            Expr::Variable(token) => self.environment.get(&token.lexeme).copied().ok_or_else(|| {
                format!(
                    "[Line {} Col {}] Runtime Error: Undefined variable '{}'.",
                    token.line, token.col, token.lexeme
                )
            }),
            Expr::Negate(inner) => Ok(-self.evaluate(inner)?),
            Expr::Grouping(inner) => self.evaluate(inner),
            Expr::Binary(left, op, right) => {
                let (l, r) = (self.evaluate(left)?, self.evaluate(right)?);
                Ok(match op {
                    '+' => l + r,
                    '-' => l - r,
                    '*' => l * r,
                    _ => l / r,
                })
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// The calculator guest
#[derive(Default)]
pub struct Calculator {
    /// Number of sessions dropped by the module
    pub destroyed: Arc<AtomicUsize>,
}

impl Calculator {
    /// Calculator plus a handle on its destroy counter
    pub fn with_counter() -> (Self, Arc<AtomicUsize>) {
        let calculator = Self::default();
        let counter = Arc::clone(&calculator.destroyed);
        (calculator, counter)
    }
}

impl GuestProgram for Calculator {
    type Instance = Session;

    fn construct(&mut self, source: String) -> Session {
        let mut errors = Vec::new();
        let tokens = scan(&source, &mut errors);
        let (statements, parse_errors) = Parser::parse(&tokens);
        errors.extend(parse_errors);

        Session {
            tokens,
            statements,
            errors,
            environment: BTreeMap::new(),
            destroyed: Arc::clone(&self.destroyed),
        }
    }

    fn tokens(&mut self, session: &mut Session) -> Result<Value, String> {
        Ok(Value::Array(session.tokens.iter().map(Token::to_json).collect()))
    }

    fn parse_tree(&mut self, session: &mut Session) -> Result<Value, String> {
        if !session.errors.is_empty() {
            return Err(format!(
                "cannot build a parse tree: {} error(s) in source",
                session.errors.len()
            ));
        }
        Ok(Value::Array(
            session.statements.iter().map(Stmt::to_json).collect(),
        ))
    }

    fn interpret(&mut self, session: &mut Session) -> Result<Value, String> {
        if !session.errors.is_empty() {
            return Ok(json!(session.errors));
        }

        let mut output = Vec::new();
        for stmt in session.statements.clone() {
            let result = match &stmt {
                Stmt::Var(name, init) => init
                    .as_ref()
                    .map_or(Ok(0.0), |expr| session.evaluate(expr))
                    .map(|value| {
                        session.environment.insert(name.clone(), value);
                    }),
                Stmt::Print(expr) | Stmt::Expression(expr) => session
                    .evaluate(expr)
                    .map(|value| output.push(format_number(value))),
            };
            if let Err(message) = result {
                output.push(message);
                break;
            }
        }

        if output.is_empty() {
            output.push(NO_OUTPUT.to_string());
        }
        Ok(json!(output))
    }

    fn had_errors(&self, session: &Session) -> bool {
        !session.errors.is_empty()
    }

    fn environment(&self, session: &Session) -> String {
        let entries: Vec<String> = session
            .environment
            .iter()
            .map(|(name, value)| format!("'{}':{}", name, format_number(*value)))
            .collect();
        format!("Environment: {{ {} }}", entries.join("; "))
    }
}

/// Bridge over a fresh calculator with the default configuration
pub fn calculator_bridge() -> (Bridge, Arc<AtomicUsize>) {
    calculator_bridge_with(BridgeConfig::default())
}

/// Bridge over a fresh calculator
pub fn calculator_bridge_with(config: BridgeConfig) -> (Bridge, Arc<AtomicUsize>) {
    let (calculator, counter) = Calculator::with_counter();
    let bridge = Bridge::native(calculator, config).expect("calculator bridge");
    (bridge, counter)
}
