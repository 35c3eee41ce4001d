//! Reference expressions for step `input`, `condition`, `transform`, and
//! prompt templates.
//!
//! Source strings are parsed once into an [`Expr`] / [`Template`] AST when a
//! definition is compiled; the runner only evaluates the AST. Evaluation is
//! total: a reference to a missing step, a skipped step, or a missing field
//! yields `null`, which is falsy. The only runtime failure is `|parse_json`
//! applied to a string that is not JSON.
//!
//! Grammar (informal):
//!
//! ```text
//! expr    := or
//! or      := and ('||' and)*
//! and     := cmp ('&&' cmp)*
//! cmp     := unary (('=='|'!='|'<'|'<='|'>'|'>=') unary)?
//! unary   := '!' unary | postfix
//! postfix := primary ('|' filter ('(' expr ')')?)*
//! primary := ref | string | number | true | false | null
//!          | '(' expr ')' | '[' exprs ']' | '{' key ':' expr, ... '}'
//! ref     := '$' ('args' | 'prev' | step-id) ('.' field | '[' index ']')*
//! ```

use std::collections::HashMap;

use serde_json::{Map, Number, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced while parsing or evaluating expressions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("evaluation failed: {0}")]
    Eval(String),
}

fn syntax(offset: usize, message: impl Into<String>) -> ExpressionError {
    ExpressionError::Syntax {
        offset,
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// What a reference is rooted at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefRoot {
    Args,
    Prev,
    Step(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// `$root.path[0].more`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub root: RefRoot,
    pub path: Vec<PathSegment>,
}

impl Reference {
    /// First path field, used for `$args.<name>` lookups.
    pub fn first_field(&self) -> Option<&str> {
        match self.path.first() {
            Some(PathSegment::Field(name)) => Some(name.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Length,
    Upper,
    Lower,
    Trim,
    Json,
    ParseJson,
    Keys,
    Default(Box<Expr>),
    Join(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ref(Reference),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Pipe {
        input: Box<Expr>,
        filter: Filter,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Expr(Expr),
}

/// Free text with `{{ expr }}` holes and bare `$ref` tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub parts: Vec<TemplatePart>,
}

/// A step `input`: either a single expression (evaluates to any value) or a
/// template (evaluates to a string).
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Expr(Expr),
    Template(Template),
}

// ---------------------------------------------------------------------------
// Evaluation scope
// ---------------------------------------------------------------------------

/// Values visible to an expression.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub args: &'a Map<String, Value>,
    pub prev: Option<&'a Value>,
    pub steps: &'a HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ref(Reference),
    Str(String),
    Num(Value),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Pipe,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Lex a reference starting at `chars[start] == '$'`. Returns the reference
/// and the index just past it.
fn lex_reference(chars: &[char], start: usize) -> Result<(Reference, usize), ExpressionError> {
    let mut i = start + 1;
    if i >= chars.len() || !is_ident_start(chars[i]) {
        return Err(syntax(start, "expected a name after '$'"));
    }
    let name_start = i;
    while i < chars.len() && is_ident_char(chars[i]) {
        i += 1;
    }
    let name: String = chars[name_start..i].iter().collect();
    let root = match name.as_str() {
        "args" => RefRoot::Args,
        "prev" => RefRoot::Prev,
        _ => RefRoot::Step(name),
    };

    let mut path = Vec::new();
    loop {
        if i + 1 < chars.len() && chars[i] == '.' && is_ident_start(chars[i + 1]) {
            i += 1;
            let field_start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            path.push(PathSegment::Field(chars[field_start..i].iter().collect()));
        } else if i + 1 < chars.len() && chars[i] == '[' && chars[i + 1].is_ascii_digit() {
            let open = i;
            i += 1;
            let digits_start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            if i >= chars.len() || chars[i] != ']' {
                return Err(syntax(open, "unclosed index"));
            }
            let digits: String = chars[digits_start..i].iter().collect();
            let index = digits
                .parse::<usize>()
                .map_err(|_| syntax(digits_start, "index out of range"))?;
            i += 1;
            path.push(PathSegment::Index(index));
        } else {
            break;
        }
    }

    Ok((Reference { root, path }, i))
}

fn lex(src: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        let two = |a: char, b: char| c == a && chars.get(i + 1) == Some(&b);

        let token = if c == '$' {
            let (reference, next) = lex_reference(&chars, i)?;
            i = next;
            Token::Ref(reference)
        } else if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            let mut s = String::new();
            loop {
                match chars.get(i) {
                    None => return Err(syntax(start, "unterminated string")),
                    Some('\\') => {
                        match chars.get(i + 1) {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(*other),
                            None => return Err(syntax(i, "dangling escape")),
                        }
                        i += 2;
                    }
                    Some(ch) if *ch == quote => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        s.push(*ch);
                        i += 1;
                    }
                }
            }
            Token::Str(s)
        } else if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            Token::Num(parse_number(&text).ok_or_else(|| syntax(start, format!("invalid number '{text}'")))?)
        } else if is_ident_start(c) {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            Token::Ident(chars[start..i].iter().collect())
        } else if two('=', '=') {
            i += 2;
            Token::EqEq
        } else if two('!', '=') {
            i += 2;
            Token::NotEq
        } else if two('<', '=') {
            i += 2;
            Token::Le
        } else if two('>', '=') {
            i += 2;
            Token::Ge
        } else if two('&', '&') {
            i += 2;
            Token::AndAnd
        } else if two('|', '|') {
            i += 2;
            Token::OrOr
        } else {
            i += 1;
            match c {
                '(' => Token::LParen,
                ')' => Token::RParen,
                '[' => Token::LBracket,
                ']' => Token::RBracket,
                '{' => Token::LBrace,
                '}' => Token::RBrace,
                ',' => Token::Comma,
                ':' => Token::Colon,
                '|' => Token::Pipe,
                '!' => Token::Bang,
                '<' => Token::Lt,
                '>' => Token::Gt,
                other => return Err(syntax(start, format!("unexpected character '{other}'"))),
            }
        };
        tokens.push((start, token));
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> Option<Value> {
    if let Ok(n) = text.parse::<i64>() {
        return Some(Value::Number(n.into()));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Deepest nesting of parentheses, brackets, braces, filter arguments and
/// `!` the parser accepts.
pub const MAX_NESTING: usize = 128;

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExpressionError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(syntax(self.offset(), format!("expected {what}")))
        }
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        if self.depth >= MAX_NESTING {
            return Err(syntax(self.offset(), "expression nested too deeply"));
        }
        self.depth += 1;
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        self.enter()?;
        let result = self.parse_or_inner();
        self.depth -= 1;
        result
    }

    fn parse_or_inner(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.parse_cmp()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.parse_cmp()?;
            lhs = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExpressionError> {
        let lhs = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_unary()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&Token::Bang) {
            self.enter()?;
            let inner = self.parse_unary();
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.parse_primary()?;
        while self.eat(&Token::Pipe) {
            let offset = self.offset();
            let name = match self.next() {
                Some(Token::Ident(name)) => name,
                _ => return Err(syntax(offset, "expected a filter name after '|'")),
            };
            let arg = if self.eat(&Token::LParen) {
                let arg = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Some(Box::new(arg))
            } else {
                None
            };
            let filter = match (name.as_str(), arg) {
                ("length", None) => Filter::Length,
                ("upper", None) => Filter::Upper,
                ("lower", None) => Filter::Lower,
                ("trim", None) => Filter::Trim,
                ("json", None) => Filter::Json,
                ("parse_json", None) => Filter::ParseJson,
                ("keys", None) => Filter::Keys,
                ("default", Some(arg)) => Filter::Default(arg),
                ("join", Some(arg)) => Filter::Join(arg),
                ("join", None) => Filter::Join(Box::new(Expr::Literal(Value::String(",".into())))),
                ("default", None) => {
                    return Err(syntax(offset, "filter 'default' needs an argument"));
                }
                (other, _) => return Err(ExpressionError::UnknownFilter(other.to_string())),
            };
            expr = Expr::Pipe {
                input: Box::new(expr),
                filter,
            };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Ref(r)) => Ok(Expr::Ref(r)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(n)),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                other => Err(syntax(offset, format!("unexpected word '{other}'"))),
            },
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                while !self.eat(&Token::RBracket) {
                    items.push(self.parse_or()?);
                    if !self.eat(&Token::Comma) {
                        self.expect(Token::RBracket, "',' or ']'")?;
                        break;
                    }
                }
                Ok(Expr::Array(items))
            }
            Some(Token::LBrace) => {
                let mut fields = Vec::new();
                while !self.eat(&Token::RBrace) {
                    let key_offset = self.offset();
                    let key = match self.next() {
                        Some(Token::Ident(k)) | Some(Token::Str(k)) => k,
                        _ => return Err(syntax(key_offset, "expected an object key")),
                    };
                    self.expect(Token::Colon, "':'")?;
                    fields.push((key, self.parse_or()?));
                    if !self.eat(&Token::Comma) {
                        self.expect(Token::RBrace, "',' or '}'")?;
                        break;
                    }
                }
                Ok(Expr::Object(fields))
            }
            Some(_) => Err(syntax(offset, "unexpected token")),
            None => Err(syntax(offset, "unexpected end of expression")),
        }
    }
}

/// Parse a complete expression.
pub fn parse_expression(src: &str) -> Result<Expr, ExpressionError> {
    let tokens = lex(src)?;
    if tokens.is_empty() {
        return Err(syntax(0, "empty expression"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: src.len(),
        depth: 0,
    };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(syntax(parser.offset(), "trailing input"));
    }
    Ok(expr)
}

/// Parse a template: `{{ expr }}` holes and bare `$ref` tokens in free text.
pub fn parse_template(src: &str) -> Result<Template, ExpressionError> {
    let chars: Vec<char> = src.chars().collect();
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '{' && chars.get(i + 1) == Some(&'{') {
            let open = i;
            let mut j = i + 2;
            while j + 1 < chars.len() && !(chars[j] == '}' && chars[j + 1] == '}') {
                j += 1;
            }
            if j + 1 >= chars.len() {
                return Err(syntax(open, "unclosed '{{'"));
            }
            let inner: String = chars[i + 2..j].iter().collect();
            let expr = parse_expression(&inner).map_err(|e| match e {
                ExpressionError::Syntax { offset, message } => syntax(open + 2 + offset, message),
                other => other,
            })?;
            if !text.is_empty() {
                parts.push(TemplatePart::Text(std::mem::take(&mut text)));
            }
            parts.push(TemplatePart::Expr(expr));
            i = j + 2;
        } else if chars[i] == '$' && chars.get(i + 1).is_some_and(|c| is_ident_start(*c)) {
            let (reference, next) = lex_reference(&chars, i)?;
            if !text.is_empty() {
                parts.push(TemplatePart::Text(std::mem::take(&mut text)));
            }
            parts.push(TemplatePart::Expr(Expr::Ref(reference)));
            i = next;
        } else {
            text.push(chars[i]);
            i += 1;
        }
    }
    if !text.is_empty() {
        parts.push(TemplatePart::Text(text));
    }
    Ok(Template { parts })
}

/// Parse a step `input`: a whole-string expression when it parses as one,
/// otherwise a template.
pub fn parse_payload(src: &str) -> Result<Payload, ExpressionError> {
    match parse_expression(src.trim()) {
        Ok(expr) => Ok(Payload::Expr(expr)),
        Err(_) => parse_template(src).map(Payload::Template),
    }
}

// ---------------------------------------------------------------------------
// Reference collection
// ---------------------------------------------------------------------------

impl Expr {
    /// Append every reference in this expression to `out`, in source order.
    pub fn collect_refs<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ref(r) => out.push(r),
            Expr::Array(items) => items.iter().for_each(|e| e.collect_refs(out)),
            Expr::Object(fields) => fields.iter().for_each(|(_, e)| e.collect_refs(out)),
            Expr::Not(inner) => inner.collect_refs(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_refs(out);
                rhs.collect_refs(out);
            }
            Expr::Pipe { input, filter } => {
                input.collect_refs(out);
                if let Filter::Default(arg) | Filter::Join(arg) = filter {
                    arg.collect_refs(out);
                }
            }
        }
    }
}

impl Template {
    pub fn collect_refs<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        for part in &self.parts {
            if let TemplatePart::Expr(e) = part {
                e.collect_refs(out);
            }
        }
    }
}

impl Payload {
    pub fn collect_refs<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Payload::Expr(e) => e.collect_refs(out),
            Payload::Template(t) => t.collect_refs(out),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// JavaScript-like truthiness: `null`, `false`, `0`, `""`, and `[]` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

/// Render a value for text interpolation. `null` renders as empty.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_reference(reference: &Reference, scope: &Scope<'_>) -> Value {
    let root = match &reference.root {
        RefRoot::Args => Some(Value::Object(scope.args.clone())),
        RefRoot::Prev => scope.prev.cloned(),
        RefRoot::Step(id) => scope.steps.get(id).cloned(),
    };
    let mut current = match root {
        Some(v) => v,
        None => return Value::Null,
    };
    for segment in &reference.path {
        let next = match (segment, &current) {
            (PathSegment::Field(name), Value::Object(map)) => map.get(name).cloned(),
            (PathSegment::Index(idx), Value::Array(items)) => items.get(*idx).cloned(),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(op: BinaryOp, a: &Value, b: &Value) -> bool {
    let ordering = match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    };
    match (op, ordering) {
        (BinaryOp::Lt, Some(o)) => o.is_lt(),
        (BinaryOp::Le, Some(o)) => o.is_le(),
        (BinaryOp::Gt, Some(o)) => o.is_gt(),
        (BinaryOp::Ge, Some(o)) => o.is_ge(),
        _ => false,
    }
}

fn apply_filter(filter: &Filter, input: Value, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
    Ok(match filter {
        Filter::Length => {
            let len = match &input {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                _ => 0,
            };
            Value::from(len as u64)
        }
        Filter::Upper => Value::String(value_to_string(&input).to_uppercase()),
        Filter::Lower => Value::String(value_to_string(&input).to_lowercase()),
        Filter::Trim => Value::String(value_to_string(&input).trim().to_string()),
        Filter::Json => Value::String(input.to_string()),
        Filter::ParseJson => match &input {
            Value::String(s) => serde_json::from_str(s)
                .map_err(|e| ExpressionError::Eval(format!("parse_json: {e}")))?,
            Value::Null => Value::Null,
            other => other.clone(),
        },
        Filter::Keys => match &input {
            Value::Object(map) => Value::Array(map.keys().cloned().map(Value::String).collect()),
            _ => Value::Array(Vec::new()),
        },
        Filter::Default(fallback) => {
            if input.is_null() {
                evaluate(fallback, scope)?
            } else {
                input
            }
        }
        Filter::Join(separator) => {
            let sep = value_to_string(&evaluate(separator, scope)?);
            match &input {
                Value::Array(items) => Value::String(
                    items
                        .iter()
                        .map(value_to_string)
                        .collect::<Vec<_>>()
                        .join(&sep),
                ),
                other => Value::String(value_to_string(other)),
            }
        }
    })
}

/// Evaluate an expression against `scope`.
pub fn evaluate(expr: &Expr, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ref(r) => Ok(resolve_reference(r, scope)),
        Expr::Array(items) => items
            .iter()
            .map(|e| evaluate(e, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Object(fields) => {
            let mut map = Map::new();
            for (key, e) in fields {
                map.insert(key.clone(), evaluate(e, scope)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&evaluate(inner, scope)?))),
        Expr::Binary { op, lhs, rhs } => {
            let left = evaluate(lhs, scope)?;
            match op {
                // Short-circuit, returning the deciding operand like JS.
                BinaryOp::And => {
                    if is_truthy(&left) {
                        evaluate(rhs, scope)
                    } else {
                        Ok(left)
                    }
                }
                BinaryOp::Or => {
                    if is_truthy(&left) {
                        Ok(left)
                    } else {
                        evaluate(rhs, scope)
                    }
                }
                BinaryOp::Eq => Ok(Value::Bool(values_equal(&left, &evaluate(rhs, scope)?))),
                BinaryOp::Ne => Ok(Value::Bool(!values_equal(&left, &evaluate(rhs, scope)?))),
                BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                    Ok(Value::Bool(compare(*op, &left, &evaluate(rhs, scope)?)))
                }
            }
        }
        Expr::Pipe { input, filter } => {
            let value = evaluate(input, scope)?;
            apply_filter(filter, value, scope)
        }
    }
}

/// Render a template to a string.
pub fn render(template: &Template, scope: &Scope<'_>) -> Result<String, ExpressionError> {
    let mut out = String::new();
    for part in &template.parts {
        match part {
            TemplatePart::Text(t) => out.push_str(t),
            TemplatePart::Expr(e) => out.push_str(&value_to_string(&evaluate(e, scope)?)),
        }
    }
    Ok(out)
}

/// Evaluate a step payload.
pub fn evaluate_payload(payload: &Payload, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
    match payload {
        Payload::Expr(e) => evaluate(e, scope),
        Payload::Template(t) => render(t, scope).map(Value::String),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixture {
        args: Map<String, Value>,
        prev: Option<Value>,
        steps: HashMap<String, Value>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut steps = HashMap::new();
            steps.insert(
                "fetch".to_string(),
                json!({"title": "Weekly", "items": ["a", "b", "c"], "count": 3}),
            );
            steps.insert("format-step".to_string(), json!("formatted"));
            let args = json!({"topic": "rust", "limit": 2})
                .as_object()
                .cloned()
                .unwrap();
            Self {
                args,
                prev: Some(json!({"ok": true, "raw": "{\"n\": 1}"})),
                steps,
            }
        }

        fn scope(&self) -> Scope<'_> {
            Scope {
                args: &self.args,
                prev: self.prev.as_ref(),
                steps: &self.steps,
            }
        }

        fn eval(&self, src: &str) -> Value {
            let expr = parse_expression(src).unwrap_or_else(|e| panic!("{src}: {e}"));
            evaluate(&expr, &self.scope()).unwrap()
        }
    }

    #[test]
    fn test_reference_paths() {
        let fx = Fixture::new();
        assert_eq!(fx.eval("$fetch.title"), json!("Weekly"));
        assert_eq!(fx.eval("$fetch.items[1]"), json!("b"));
        assert_eq!(fx.eval("$args.topic"), json!("rust"));
        assert_eq!(fx.eval("$prev.ok"), json!(true));
        assert_eq!(fx.eval("$format-step"), json!("formatted"));
    }

    #[test]
    fn test_absent_references_are_null_and_falsy() {
        let fx = Fixture::new();
        assert_eq!(fx.eval("$missing.field"), Value::Null);
        assert_eq!(fx.eval("$fetch.nope.deeper"), Value::Null);
        assert_eq!(fx.eval("$fetch.items[10]"), Value::Null);
        assert_eq!(fx.eval("!$missing"), json!(true));
        assert!(!is_truthy(&fx.eval("$missing && $fetch")));
    }

    #[test]
    fn test_operators() {
        let fx = Fixture::new();
        assert_eq!(fx.eval("$fetch.count == 3"), json!(true));
        assert_eq!(fx.eval("$fetch.count != 3.0"), json!(false));
        assert_eq!(fx.eval("$fetch.count > $args.limit"), json!(true));
        assert_eq!(fx.eval("$fetch.count <= 2"), json!(false));
        assert_eq!(fx.eval("$missing > 1"), json!(false));
        assert_eq!(fx.eval("$args.topic == 'rust' && $prev.ok"), json!(true));
        assert_eq!(fx.eval("$missing || 'fallback'"), json!("fallback"));
        assert_eq!(fx.eval("!($fetch.count == 3)"), json!(false));
    }

    #[test]
    fn test_literals_and_objects() {
        let fx = Fixture::new();
        assert_eq!(
            fx.eval("{ title: $fetch.title, tags: [1, 'two', null], \"quoted key\": -1.5 }"),
            json!({"title": "Weekly", "tags": [1, "two", null], "quoted key": -1.5})
        );
        assert_eq!(fx.eval("[]"), json!([]));
        assert_eq!(fx.eval("{}"), json!({}));
    }

    #[test]
    fn test_filters() {
        let fx = Fixture::new();
        assert_eq!(fx.eval("$fetch.items|length"), json!(3));
        assert_eq!(fx.eval("$fetch.title|upper"), json!("WEEKLY"));
        assert_eq!(fx.eval("$fetch.items|join(' / ')"), json!("a / b / c"));
        assert_eq!(fx.eval("$fetch.items|join"), json!("a,b,c"));
        assert_eq!(fx.eval("$missing|default('none')"), json!("none"));
        assert_eq!(fx.eval("$prev.raw|parse_json"), json!({"n": 1}));
        assert_eq!(fx.eval("$args|keys"), json!(["limit", "topic"]));
        assert_eq!(fx.eval("$fetch.count|json"), json!("3"));
    }

    #[test]
    fn test_parse_json_failure_is_eval_error() {
        let fx = Fixture::new();
        let expr = parse_expression("$fetch.title|parse_json").unwrap();
        let err = evaluate(&expr, &fx.scope()).unwrap_err();
        assert!(matches!(err, ExpressionError::Eval(_)), "got: {err}");
    }

    #[test]
    fn test_syntax_errors() {
        for src in ["", "$", "$fetch ==", "(1", "{ a 1 }", "'open", "1 2", "#"] {
            let err = parse_expression(src).unwrap_err();
            assert!(matches!(err, ExpressionError::Syntax { .. }), "{src}: {err}");
        }
        let err = parse_expression("$fetch|shout").unwrap_err();
        assert_eq!(err, ExpressionError::UnknownFilter("shout".to_string()));
    }

    #[test]
    fn test_nesting_is_bounded() {
        let shallow = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(parse_expression(&shallow).unwrap(), Expr::Literal(json!(1)));

        let deep = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        let err = parse_expression(&deep).unwrap_err();
        assert!(err.to_string().contains("nested too deeply"), "{err}");

        let nots = format!("{}true", "!".repeat(200_000));
        assert!(parse_expression(&nots).unwrap_err().to_string().contains("nested too deeply"));

        let arrays = format!("{}{}", "[".repeat(MAX_NESTING + 1), "]".repeat(MAX_NESTING + 1));
        assert!(parse_expression(&arrays).is_err());
    }

    #[test]
    fn test_template_rendering() {
        let fx = Fixture::new();
        let template =
            parse_template("Summarize $fetch.title about {{ $args.topic|upper }}. Missing: [$nope]").unwrap();
        let rendered = render(&template, &fx.scope()).unwrap();
        assert_eq!(rendered, "Summarize Weekly about RUST. Missing: []");
    }

    #[test]
    fn test_template_leaves_plain_dollars() {
        let fx = Fixture::new();
        let template = parse_template("costs $5 total").unwrap();
        assert_eq!(render(&template, &fx.scope()).unwrap(), "costs $5 total");
        assert!(parse_template("oops {{ $fetch").is_err());
    }

    #[test]
    fn test_payload_prefers_expression() {
        let fx = Fixture::new();
        match parse_payload("$fetch.items").unwrap() {
            Payload::Expr(e) => assert_eq!(evaluate(&e, &fx.scope()).unwrap(), json!(["a", "b", "c"])),
            other => panic!("expected expression, got {other:?}"),
        }
        match parse_payload("Write about $args.topic").unwrap() {
            Payload::Template(t) => {
                assert_eq!(render(&t, &fx.scope()).unwrap(), "Write about rust")
            }
            other => panic!("expected template, got {other:?}"),
        }
    }

    #[test]
    fn test_collect_refs_in_source_order() {
        let expr = parse_expression("{ a: $fetch.title, b: $prev|default($args.topic) }").unwrap();
        let mut refs = Vec::new();
        expr.collect_refs(&mut refs);
        let roots: Vec<&RefRoot> = refs.iter().map(|r| &r.root).collect();
        assert_eq!(
            roots,
            vec![
                &RefRoot::Step("fetch".to_string()),
                &RefRoot::Prev,
                &RefRoot::Args
            ]
        );
        assert_eq!(refs[2].first_field(), Some("topic"));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
        assert!(is_truthy(&json!("false")));
        assert!(is_truthy(&json!(-1)));
    }
}
