//! Fixed-grammar condition evaluator for success criteria, rollback triggers,
//! safety checks, and escalation rules.
//!
//! The grammar is deliberately small: comparisons and boolean connectives over
//! named variables drawn from a JSON context. There is no function call, no
//! assignment, and no loop, so evaluation is deterministic and bounded.
//!
//! ```text
//! expr    := or
//! or      := and (("||" | "or") and)*
//! and     := unary (("&&" | "and") unary)*
//! unary   := ("!" | "not") unary | compare
//! compare := operand (("==" | "!=" | ">" | ">=" | "<" | "<=") operand)?
//! operand := number ["%"] | 'str' | "str" | true | false | null | path | "(" expr ")"
//! path    := ident ("." ident)*
//! ```
//!
//! **Security note:** telemetry and alert payloads are always passed as the
//! context object, NEVER interpolated into expression strings.

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

use super::context::WorkflowContext;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unterminated string literal starting at position {0}")]
    UnterminatedString(usize),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unexpected token {found} (expected {expected})")]
    UnexpectedToken { found: String, expected: String },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("expression is empty")]
    Empty,

    #[error("cannot order {left} against {right}")]
    TypeMismatch { left: String, right: String },

    #[error("invalid context: {0}")]
    InvalidContext(String),

    #[error("expression nests deeper than {0} levels")]
    TooDeep(usize),

    #[error("expression has {tokens} tokens (limit {limit})")]
    TooLong { tokens: usize, limit: usize },
}

/// Maximum nesting of `!` and parentheses.
pub const MAX_NESTING: usize = 64;

/// Maximum token count. Also bounds the depth of `&&`/`||` chains, which the
/// parser builds left-deep.
pub const MAX_TOKENS: usize = 1024;

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Dot,
    LParen,
    RParen,
    Op(CompareOp),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {n}"),
            Token::Str(s) => write!(f, "string '{s}'"),
            Token::Ident(i) => write!(f, "identifier '{i}'"),
            Token::True => f.write_str("'true'"),
            Token::False => f.write_str("'false'"),
            Token::Null => f.write_str("'null'"),
            Token::And => f.write_str("'&&'"),
            Token::Or => f.write_str("'||'"),
            Token::Not => f.write_str("'!'"),
            Token::Dot => f.write_str("'.'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Op(op) => write!(f, "'{op}'"),
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        })
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(ExpressionError::UnexpectedChar { ch: c, pos: i });
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' => {
                if chars.get(i + 1) != Some(&'=') {
                    return Err(ExpressionError::UnexpectedChar { ch: c, pos: i });
                }
                tokens.push(Token::Op(CompareOp::Eq));
                i += 2;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CompareOp::Ne));
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '>' | '<' => {
                let with_eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, with_eq) {
                    ('>', true) => CompareOp::Ge,
                    ('>', false) => CompareOp::Gt,
                    ('<', true) => CompareOp::Le,
                    _ => CompareOp::Lt,
                };
                tokens.push(Token::Op(op));
                i += if with_eq { 2 } else { 1 };
            }
            '\'' | '"' => {
                let start = i;
                i += 1;
                let mut literal = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(ExpressionError::UnterminatedString(start)),
                        Some(&ch) if ch == c => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            literal.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let number: f64 = raw
                    .parse()
                    .map_err(|_| ExpressionError::InvalidNumber(raw.clone()))?;
                // `10%` is the number 10 in percent units.
                if chars.get(i) == Some(&'%') {
                    i += 1;
                }
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(ExpressionError::UnexpectedChar { ch: other, pos: i }),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST and parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Compare {
        left: Box<Node>,
        op: CompareOp,
        right: Box<Node>,
    },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn descend(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ExpressionError::TooDeep(MAX_NESTING));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Node, ExpressionError> {
        let mut node = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            node = Node::Or(Box::new(node), Box::new(right));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Node, ExpressionError> {
        let mut node = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            node = Node::And(Box::new(node), Box::new(right));
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Node, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Node, ExpressionError> {
        let left = self.parse_operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Node::Compare {
                left: Box::new(left),
                op,
                right: Box::new(right),
            });
        }
        Ok(left)
    }

    fn parse_operand(&mut self) -> Result<Node, ExpressionError> {
        match self.next() {
            None => Err(ExpressionError::UnexpectedEnd),
            Some(Token::Number(n)) => Ok(Node::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Node::Literal(Value::String(s))),
            Some(Token::True) => Ok(Node::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Node::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Node::Literal(Value::Null)),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(ExpressionError::UnexpectedToken {
                        found: other.to_string(),
                        expected: "')'".to_string(),
                    }),
                    None => Err(ExpressionError::UnexpectedEnd),
                }
            }
            Some(Token::Ident(first)) => {
                let mut segments = vec![first];
                while self.peek() == Some(&Token::Dot) {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(segment)) => segments.push(segment),
                        Some(other) => {
                            return Err(ExpressionError::UnexpectedToken {
                                found: other.to_string(),
                                expected: "identifier after '.'".to_string(),
                            });
                        }
                        None => return Err(ExpressionError::UnexpectedEnd),
                    }
                }
                Ok(Node::Path(segments))
            }
            Some(other) => Err(ExpressionError::UnexpectedToken {
                found: other.to_string(),
                expected: "operand".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    /// Parse an expression string.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Empty);
        }
        if tokens.len() > MAX_TOKENS {
            return Err(ExpressionError::TooLong {
                tokens: tokens.len(),
                limit: MAX_TOKENS,
            });
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.parse_or()?;
        if let Some(extra) = parser.peek() {
            return Err(ExpressionError::UnexpectedToken {
                found: extra.to_string(),
                expected: "end of expression".to_string(),
            });
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to a raw JSON value.
    pub fn evaluate(&self, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        eval_node(&self.root, context)
    }

    /// Evaluate and coerce the result to a boolean.
    pub fn evaluate_bool(&self, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate(context).map(|v| truthy(&v))
    }
}

fn eval_node(node: &Node, ctx: &Value) -> Result<Value, ExpressionError> {
    match node {
        Node::Literal(v) => Ok(v.clone()),
        Node::Path(segments) => Ok(resolve_path(ctx, segments)),
        Node::Not(inner) => Ok(Value::Bool(!truthy(&eval_node(inner, ctx)?))),
        Node::And(l, r) => {
            if !truthy(&eval_node(l, ctx)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval_node(r, ctx)?)))
        }
        Node::Or(l, r) => {
            if truthy(&eval_node(l, ctx)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval_node(r, ctx)?)))
        }
        Node::Compare { left, op, right } => {
            let l = eval_node(left, ctx)?;
            let r = eval_node(right, ctx)?;
            compare(&l, *op, &r).map(Value::Bool)
        }
    }
}

fn resolve_path(ctx: &Value, segments: &[String]) -> Value {
    let mut current = ctx;
    for segment in segments {
        match current.get(segment.as_str()) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Numeric view of a value: numbers, numeric strings, and percent strings.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            let trimmed = trimmed.strip_suffix('%').unwrap_or(trimmed);
            trimmed.trim().parse().ok()
        }
        _ => None,
    }
}

fn type_name(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(s) => format!("string '{s}'"),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> Result<bool, ExpressionError> {
    let numeric = match (left, right) {
        (Value::Number(_), _) | (_, Value::Number(_)) => as_number(left).zip(as_number(right)),
        _ => None,
    };

    match op {
        CompareOp::Eq | CompareOp::Ne => {
            let equal = match numeric {
                Some((l, r)) => l == r,
                None => left == right,
            };
            Ok(if op == CompareOp::Eq { equal } else { !equal })
        }
        _ => {
            let ordering = match (numeric, left, right) {
                (Some((l, r)), _, _) => l.partial_cmp(&r),
                (None, Value::String(l), Value::String(r)) => {
                    match (as_number(left), as_number(right)) {
                        (Some(ln), Some(rn)) => ln.partial_cmp(&rn),
                        _ => Some(l.cmp(r)),
                    }
                }
                _ => None,
            };
            let ordering = ordering.ok_or_else(|| ExpressionError::TypeMismatch {
                left: type_name(left),
                right: type_name(right),
            })?;
            Ok(match op {
                CompareOp::Gt => ordering == Ordering::Greater,
                CompareOp::Ge => ordering != Ordering::Less,
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Le => ordering != Ordering::Greater,
                CompareOp::Eq | CompareOp::Ne => unreachable!("handled above"),
            })
        }
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// Convenience wrapper used by the monitor, rollback coordinator, and probes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Check that an expression parses, without evaluating it.
    pub fn validate(&self, expression: &str) -> Result<(), ExpressionError> {
        Expression::parse(expression).map(|_| ())
    }

    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        Expression::parse(expression)?.evaluate_bool(context)
    }

    /// Evaluate against a workflow context's expression view.
    pub fn evaluate_in_workflow_context(
        &self,
        expression: &str,
        workflow_context: &WorkflowContext,
    ) -> Result<bool, ExpressionError> {
        let context = workflow_context.to_expression_context();
        self.evaluate_bool(expression, &context)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
