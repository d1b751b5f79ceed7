//! SQL/JSONPath subset: parser and lax-mode evaluator.
//!
//! The database evaluates selector queries with its own JSONPath engine;
//! this module mirrors that behavior in-process so notification matching
//! agrees with what a `jsonb_path_exists` predicate would select. Supported
//! syntax: member and index steps (including wildcards), `?(...)` filters
//! over `@`, the six comparison operators, `&&`/`||`/`!`, `exists(...)`,
//! string/number/bool/null literals and `$var` substitution. `strict` mode
//! is rejected at parse time.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{DomainError, DomainResult};

#[derive(Debug, Clone, PartialEq)]
pub struct JsonPath {
    steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Member(String),
    MemberWildcard,
    Index(usize),
    IndexWildcard,
    Filter(Expr),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Exists(Operand),
    Cmp(Operand, CmpOp, Operand),
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    /// Path rooted at `@` (filter item) or `$` (document root).
    Path { from_root: bool, steps: Vec<Step> },
    Literal(Value),
    Var(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl JsonPath {
    pub fn parse(input: &str) -> DomainResult<Self> {
        let mut parser = Parser::new(input);
        parser.skip_ws();
        if parser.eat_keyword("strict") {
            return Err(DomainError::invalid_path(
                "strict mode is not supported".to_string(),
            ));
        }
        parser.eat_keyword("lax");
        parser.skip_ws();
        parser.expect_char(b'$')?;
        let steps = parser.parse_steps()?;
        parser.skip_ws();
        if !parser.at_end() {
            return Err(parser.error("trailing input"));
        }
        Ok(Self { steps })
    }

    /// `jsonb_path_exists` semantics: does the path select at least one item?
    pub fn exists(&self, root: &Value, vars: &BTreeMap<String, Value>) -> bool {
        !eval_steps(root, root, &self.steps, vars).is_empty()
    }
}

fn eval_steps<'a>(
    root: &'a Value,
    current: &'a Value,
    steps: &[Step],
    vars: &BTreeMap<String, Value>,
) -> Vec<&'a Value> {
    let mut items = vec![current];
    for step in steps {
        let mut next = Vec::new();
        for item in items {
            apply_step(root, item, step, vars, &mut next);
        }
        items = next;
        if items.is_empty() {
            break;
        }
    }
    items
}

// Lax mode auto-unwraps one array level when a member accessor meets an
// array, and auto-wraps scalars when an index accessor meets a non-array.
fn apply_step<'a>(
    root: &'a Value,
    item: &'a Value,
    step: &Step,
    vars: &BTreeMap<String, Value>,
    out: &mut Vec<&'a Value>,
) {
    match step {
        Step::Member(name) => match item {
            Value::Object(map) => out.extend(map.get(name)),
            Value::Array(elems) => {
                for elem in elems {
                    if let Value::Object(map) = elem {
                        out.extend(map.get(name));
                    }
                }
            }
            _ => {}
        },
        Step::MemberWildcard => match item {
            Value::Object(map) => out.extend(map.values()),
            Value::Array(elems) => {
                for elem in elems {
                    if let Value::Object(map) = elem {
                        out.extend(map.values());
                    }
                }
            }
            _ => {}
        },
        Step::Index(i) => match item {
            Value::Array(elems) => out.extend(elems.get(*i)),
            other if *i == 0 => out.push(other),
            _ => {}
        },
        Step::IndexWildcard => match item {
            Value::Array(elems) => out.extend(elems.iter()),
            other => out.push(other),
        },
        Step::Filter(expr) => {
            // A filter applies per element after lax unwrapping.
            match item {
                Value::Array(elems) => {
                    for elem in elems {
                        if eval_expr(root, elem, expr, vars) {
                            out.push(elem);
                        }
                    }
                }
                other => {
                    if eval_expr(root, other, expr, vars) {
                        out.push(other);
                    }
                }
            }
        }
    }
}

fn eval_expr(root: &Value, item: &Value, expr: &Expr, vars: &BTreeMap<String, Value>) -> bool {
    match expr {
        Expr::Or(a, b) => eval_expr(root, item, a, vars) || eval_expr(root, item, b, vars),
        Expr::And(a, b) => eval_expr(root, item, a, vars) && eval_expr(root, item, b, vars),
        Expr::Not(inner) => !eval_expr(root, item, inner, vars),
        Expr::Exists(operand) => !eval_operand(root, item, operand, vars).is_empty(),
        Expr::Cmp(lhs, op, rhs) => {
            let lhs = eval_operand(root, item, lhs, vars);
            let rhs = eval_operand(root, item, rhs, vars);
            // Existential comparison: any pair of selected items satisfies.
            lhs.iter()
                .any(|a| rhs.iter().any(|b| compare(a, b, *op) == Some(true)))
        }
    }
}

fn eval_operand<'a>(
    root: &'a Value,
    item: &'a Value,
    operand: &'a Operand,
    vars: &'a BTreeMap<String, Value>,
) -> Vec<&'a Value> {
    match operand {
        Operand::Path { from_root, steps } => {
            let base = if *from_root { root } else { item };
            eval_steps(root, base, steps, vars)
        }
        Operand::Literal(value) => vec![value],
        Operand::Var(name) => vars.get(name).into_iter().collect(),
    }
}

// Comparisons across differing types are unknown (None), which lax mode
// swallows as false.
fn compare(a: &Value, b: &Value, op: CmpOp) -> Option<bool> {
    use std::cmp::Ordering;

    let ordering = match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64()?.partial_cmp(&y.as_f64()?)?
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => return None,
    };

    Some(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    })
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            input: source.as_bytes(),
            pos: 0,
            source,
        }
    }

    fn error(&self, message: &str) -> DomainError {
        DomainError::invalid_path(format!(
            "{message} at offset {} in {:?}",
            self.pos, self.source
        ))
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        if self.source[self.pos..].starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        let rest = &self.source[self.pos..];
        if rest.starts_with(word) {
            let after = rest.as_bytes().get(word.len()).copied();
            if !matches!(after, Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
                self.pos += word.len();
                self.skip_ws();
                return true;
            }
        }
        false
    }

    fn expect_char(&mut self, b: u8) -> DomainResult<()> {
        if self.eat(b) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {:?}", b as char)))
        }
    }

    fn parse_steps(&mut self) -> DomainResult<Vec<Step>> {
        let mut steps = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'.') => {
                    self.pos += 1;
                    if self.eat(b'*') {
                        steps.push(Step::MemberWildcard);
                    } else if self.peek() == Some(b'"') {
                        steps.push(Step::Member(self.parse_string()?));
                    } else {
                        steps.push(Step::Member(self.parse_ident()?));
                    }
                }
                Some(b'[') => {
                    self.pos += 1;
                    self.skip_ws();
                    if self.eat(b'*') {
                        steps.push(Step::IndexWildcard);
                    } else {
                        let start = self.pos;
                        while matches!(self.peek(), Some(b'0'..=b'9')) {
                            self.pos += 1;
                        }
                        let digits = &self.source[start..self.pos];
                        let index: usize = digits
                            .parse()
                            .map_err(|_| self.error("expected array index"))?;
                        steps.push(Step::Index(index));
                    }
                    self.skip_ws();
                    self.expect_char(b']')?;
                }
                Some(b'?') => {
                    self.pos += 1;
                    self.skip_ws();
                    self.expect_char(b'(')?;
                    let expr = self.parse_or()?;
                    self.skip_ws();
                    self.expect_char(b')')?;
                    steps.push(Step::Filter(expr));
                }
                _ => break,
            }
        }
        Ok(steps)
    }

    fn parse_ident(&mut self) -> DomainResult<String> {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("expected member name"));
        }
        Ok(self.source[start..self.pos].to_string())
    }

    fn parse_string(&mut self) -> DomainResult<String> {
        self.expect_char(b'"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(b'"') => return Ok(out),
                Some(b'\\') => match self.bump() {
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(b'/') => out.push('/'),
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(b'r') => out.push('\r'),
                    Some(b'b') => out.push('\u{8}'),
                    Some(b'f') => out.push('\u{c}'),
                    Some(b'u') => {
                        if self.pos + 4 > self.input.len() {
                            return Err(self.error("truncated unicode escape"));
                        }
                        let hex = &self.source[self.pos..self.pos + 4];
                        self.pos += 4;
                        let code = u32::from_str_radix(hex, 16)
                            .map_err(|_| self.error("invalid unicode escape"))?;
                        out.push(
                            char::from_u32(code)
                                .ok_or_else(|| self.error("invalid unicode escape"))?,
                        );
                    }
                    _ => return Err(self.error("invalid escape")),
                },
                Some(byte) => {
                    // Re-read the full UTF-8 character starting at `byte`.
                    let width = utf8_width(byte);
                    let start = self.pos - 1;
                    self.pos = start + width;
                    if self.pos > self.input.len() {
                        return Err(self.error("truncated UTF-8"));
                    }
                    out.push_str(&self.source[start..self.pos]);
                }
            }
        }
    }

    fn parse_or(&mut self) -> DomainResult<Expr> {
        let mut expr = self.parse_and()?;
        loop {
            self.skip_ws();
            if self.eat_str("||") {
                let rhs = self.parse_and()?;
                expr = Expr::Or(Box::new(expr), Box::new(rhs));
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_and(&mut self) -> DomainResult<Expr> {
        let mut expr = self.parse_unary()?;
        loop {
            self.skip_ws();
            if self.eat_str("&&") {
                let rhs = self.parse_unary()?;
                expr = Expr::And(Box::new(expr), Box::new(rhs));
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_unary(&mut self) -> DomainResult<Expr> {
        self.skip_ws();
        if self.eat(b'!') {
            self.skip_ws();
            self.expect_char(b'(')?;
            let inner = self.parse_or()?;
            self.skip_ws();
            self.expect_char(b')')?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        if self.eat_keyword("exists") {
            self.expect_char(b'(')?;
            let operand = self.parse_operand()?;
            self.skip_ws();
            self.expect_char(b')')?;
            return Ok(Expr::Exists(operand));
        }
        if self.peek() == Some(b'(') {
            self.pos += 1;
            let inner = self.parse_or()?;
            self.skip_ws();
            self.expect_char(b')')?;
            return Ok(inner);
        }

        let lhs = self.parse_operand()?;
        self.skip_ws();
        let op = if self.eat_str("==") {
            CmpOp::Eq
        } else if self.eat_str("!=") || self.eat_str("<>") {
            CmpOp::Ne
        } else if self.eat_str("<=") {
            CmpOp::Le
        } else if self.eat_str(">=") {
            CmpOp::Ge
        } else if self.eat(b'<') {
            CmpOp::Lt
        } else if self.eat(b'>') {
            CmpOp::Gt
        } else {
            return Err(self.error("expected comparison operator"));
        };
        let rhs = self.parse_operand()?;
        Ok(Expr::Cmp(lhs, op, rhs))
    }

    fn parse_operand(&mut self) -> DomainResult<Operand> {
        self.skip_ws();
        match self.peek() {
            Some(b'@') => {
                self.pos += 1;
                Ok(Operand::Path {
                    from_root: false,
                    steps: self.parse_path_steps()?,
                })
            }
            Some(b'$') => {
                self.pos += 1;
                // `$ident` is a variable; `$`, `$.x`, `$[0]` are root paths.
                if matches!(self.peek(), Some(b) if b.is_ascii_alphabetic() || b == b'_') {
                    Ok(Operand::Var(self.parse_ident()?))
                } else {
                    Ok(Operand::Path {
                        from_root: true,
                        steps: self.parse_path_steps()?,
                    })
                }
            }
            Some(b'"') => Ok(Operand::Literal(Value::String(self.parse_string()?))),
            Some(b't') if self.eat_keyword("true") => Ok(Operand::Literal(Value::Bool(true))),
            Some(b'f') if self.eat_keyword("false") => Ok(Operand::Literal(Value::Bool(false))),
            Some(b'n') if self.eat_keyword("null") => Ok(Operand::Literal(Value::Null)),
            Some(b) if b == b'-' || b.is_ascii_digit() => {
                let start = self.pos;
                if b == b'-' {
                    self.pos += 1;
                }
                while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == b'.' || c == b'e' || c == b'E' || c == b'+' || c == b'-')
                {
                    self.pos += 1;
                }
                let text = &self.source[start..self.pos];
                let number: serde_json::Number = text
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .ok_or_else(|| self.error("invalid number"))?;
                Ok(Operand::Literal(Value::Number(number)))
            }
            _ => Err(self.error("expected operand")),
        }
    }

    // Member/index steps inside a filter operand (no nested filters).
    fn parse_path_steps(&mut self) -> DomainResult<Vec<Step>> {
        let mut steps = Vec::new();
        loop {
            match self.peek() {
                Some(b'.') => {
                    self.pos += 1;
                    if self.eat(b'*') {
                        steps.push(Step::MemberWildcard);
                    } else if self.peek() == Some(b'"') {
                        steps.push(Step::Member(self.parse_string()?));
                    } else {
                        steps.push(Step::Member(self.parse_ident()?));
                    }
                }
                Some(b'[') => {
                    self.pos += 1;
                    self.skip_ws();
                    if self.eat(b'*') {
                        steps.push(Step::IndexWildcard);
                    } else {
                        let start = self.pos;
                        while matches!(self.peek(), Some(b'0'..=b'9')) {
                            self.pos += 1;
                        }
                        let index: usize = self.source[start..self.pos]
                            .parse()
                            .map_err(|_| self.error("expected array index"))?;
                        steps.push(Step::Index(index));
                    }
                    self.skip_ws();
                    self.expect_char(b']')?;
                }
                _ => return Ok(steps),
            }
        }
    }
}

fn utf8_width(first: u8) -> usize {
    match first {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exists(path: &str, doc: &Value) -> bool {
        JsonPath::parse(path).unwrap().exists(doc, &BTreeMap::new())
    }

    #[test]
    fn root_matches_anything() {
        assert!(exists("$", &json!(null)));
        assert!(exists("$", &json!({"a": 1})));
    }

    #[test]
    fn member_steps_descend_objects() {
        let doc = json!({"a": {"b": 2}});
        assert!(exists("$.a.b", &doc));
        assert!(!exists("$.a.c", &doc));
        assert!(exists("$.\"a\".b", &doc));
    }

    #[test]
    fn lax_mode_unwraps_arrays_for_member_access() {
        let doc = json!({"items": [{"sku": "a"}, {"sku": "b"}]});
        assert!(exists("$.items.sku", &doc));
        assert!(exists("$.items ? (@.sku == \"b\")", &doc));
        assert!(!exists("$.items ? (@.sku == \"c\")", &doc));
    }

    #[test]
    fn filters_compare_numbers_strings_and_bools() {
        let doc = json!({"total": 42, "state": "open", "ok": true});
        assert!(exists("$ ? (@.total > 40 && @.total <= 42)", &doc));
        assert!(exists("$ ? (@.state == \"open\" || @.state == \"held\")", &doc));
        assert!(exists("$ ? (@.ok == true)", &doc));
        assert!(!exists("$ ? (@.total < 42)", &doc));
    }

    #[test]
    fn mixed_type_comparisons_are_false() {
        let doc = json!({"total": "42"});
        assert!(!exists("$ ? (@.total == 42)", &doc));
    }

    #[test]
    fn negation_and_exists() {
        let doc = json!({"a": 1});
        assert!(exists("$ ? (exists(@.a))", &doc));
        assert!(exists("$ ? (!(@.a == 2))", &doc));
        assert!(!exists("$ ? (exists(@.b))", &doc));
    }

    #[test]
    fn variables_substitute_from_bindings() {
        let doc = json!({"sku": "widget"});
        let path = JsonPath::parse("$ ? (@.sku == $wanted)").unwrap();
        let vars = BTreeMap::from([("wanted".to_string(), json!("widget"))]);
        assert!(path.exists(&doc, &vars));
        let other = BTreeMap::from([("wanted".to_string(), json!("gadget"))]);
        assert!(!path.exists(&doc, &other));
        // Unbound variables select nothing, so the comparison is false.
        assert!(!path.exists(&doc, &BTreeMap::new()));
    }

    #[test]
    fn index_steps_and_wildcards() {
        let doc = json!({"xs": [10, 20, 30]});
        assert!(exists("$.xs[1] ? (@ == 20)", &doc));
        assert!(exists("$.xs[*] ? (@ == 30)", &doc));
        assert!(!exists("$.xs[9]", &doc));
    }

    #[test]
    fn strict_mode_is_rejected() {
        let err = JsonPath::parse("strict $.a").unwrap_err();
        assert!(err.to_string().contains("strict"));
    }

    #[test]
    fn lax_prefix_is_accepted() {
        assert!(JsonPath::parse("lax $.a").is_ok());
    }

    #[test]
    fn malformed_paths_are_rejected() {
        assert!(JsonPath::parse("$.").is_err());
        assert!(JsonPath::parse("$ ? (@.a ==)").is_err());
        assert!(JsonPath::parse("a.b").is_err());
        assert!(JsonPath::parse("$ ? (@.a == 1) trailing").is_err());
    }

    #[test]
    fn quoted_members_accept_unicode() {
        let doc = json!({"📒": {"id": 1}});
        assert!(exists("$.\"📒\".id", &doc));
    }
}
