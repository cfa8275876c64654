//! Condition expressions
//!
//! CONDITION nodes carry a boolean expression over resolved variables,
//! e.g. `form.age >= 18` or `node.check.valid && form.tier == 'pro'`.
//! This module parses and evaluates them: a small recursive-descent parser
//! over comparisons (`== != < <= > >=`), boolean connectives (`&&`, `||`,
//! `!`), literals, and bare dotted paths with JSON truthiness.
//!
//! Parsing happens at validation time (to prove every referenced path is
//! defined) and again at execution time; both are pure.

use serde_json::Value;

use crate::context::ContextView;

/// A parse or evaluation failure, surfaced with the offending detail.
pub type ExprError = String;

#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Path(String),
    Literal(Value),
    Not(Box<Ast>),
    Compare(CmpOp, Box<Ast>, Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A parsed condition expression
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: Ast,
}

impl Expression {
    /// Parse an expression from its schema text.
    pub fn parse(text: &str) -> Result<Expression, ExprError> {
        let tokens = tokenize(text)?;
        let mut parser = Parser { tokens, pos: 0 };
        let ast = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(format!(
                "unexpected trailing input at token {:?}",
                parser.tokens[parser.pos]
            ));
        }
        Ok(Expression {
            source: text.to_string(),
            ast,
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every dotted path the expression reads.
    pub fn referenced_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        collect_paths(&self.ast, &mut paths);
        paths
    }

    /// Evaluate to a boolean against an execution context.
    pub fn eval<C: ContextView + ?Sized>(&self, ctx: &C) -> Result<bool, ExprError> {
        Ok(is_truthy(&eval_ast(&self.ast, ctx)?))
    }
}

fn collect_paths(ast: &Ast, paths: &mut Vec<String>) {
    match ast {
        Ast::Path(p) => paths.push(p.clone()),
        Ast::Literal(_) => {}
        Ast::Not(inner) => collect_paths(inner, paths),
        Ast::Compare(_, l, r) | Ast::And(l, r) | Ast::Or(l, r) => {
            collect_paths(l, paths);
            collect_paths(r, paths);
        }
    }
}

fn eval_ast<C: ContextView + ?Sized>(ast: &Ast, ctx: &C) -> Result<Value, ExprError> {
    match ast {
        Ast::Path(path) => ctx
            .lookup(path)
            .cloned()
            .ok_or_else(|| format!("undefined path '{}'", path)),
        Ast::Literal(v) => Ok(v.clone()),
        Ast::Not(inner) => Ok(Value::Bool(!is_truthy(&eval_ast(inner, ctx)?))),
        Ast::Compare(op, l, r) => {
            let left = eval_ast(l, ctx)?;
            let right = eval_ast(r, ctx)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
        Ast::And(l, r) => {
            if !is_truthy(&eval_ast(l, ctx)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(is_truthy(&eval_ast(r, ctx)?)))
        }
        Ast::Or(l, r) => {
            if is_truthy(&eval_ast(l, ctx)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(is_truthy(&eval_ast(r, ctx)?)))
        }
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, ExprError> {
    match op {
        CmpOp::Eq => Ok(values_equal(left, right)),
        CmpOp::Ne => Ok(!values_equal(left, right)),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = order(left, right)?;
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            })
        }
    }
}

/// Equality with numeric normalization (`1` == `1.0`).
fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a == b;
    }
    left == right
}

fn order(left: &Value, right: &Value) -> Result<std::cmp::Ordering, ExprError> {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| "NaN in comparison".to_string());
    }
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return Ok(a.cmp(b));
    }
    Err(format!(
        "cannot order {} against {}",
        type_name(left),
        type_name(right)
    ))
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// JSON truthiness: null, false, 0, "", "false", "0", [], {} are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Tokenizer / parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(text: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err("expected '&&'".to_string());
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err("expected '||'".to_string());
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Eq));
                    i += 2;
                } else {
                    return Err("expected '=='".to_string());
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ne));
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '-' && next_is_digit(&chars, i)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", text))?;
                tokens.push(Token::Number(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric()
                        || chars[i] == '_'
                        || chars[i] == '-'
                        || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(word));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(tokens)
}

fn next_is_digit(chars: &[char], i: usize) -> bool {
    chars.get(i + 1).is_some_and(|c| c.is_ascii_digit())
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse_or(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Ast::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_cmp()?;
            left = Ast::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Ast, ExprError> {
        let left = self.parse_unary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.advance();
            let right = self.parse_unary()?;
            return Ok(Ast::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Ast, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Ast::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Ast, ExprError> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(Token::Number(n)) => Ok(Ast::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Ast::Literal(Value::String(s))),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Ast::Literal(Value::Bool(true))),
                "false" => Ok(Ast::Literal(Value::Bool(false))),
                "null" => Ok(Ast::Literal(Value::Null)),
                _ => Ok(Ast::Path(word)),
            },
            Some(other) => Err(format!("unexpected token {:?}", other)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::seeded(
            &json!({"age": 20, "tier": "pro", "beta": false}),
            &json!({"region": "eu"}),
        )
    }

    #[test]
    fn test_numeric_comparison() {
        let expr = Expression::parse("form.age >= 18").unwrap();
        assert!(expr.eval(&ctx()).unwrap());

        let expr = Expression::parse("form.age < 18").unwrap();
        assert!(!expr.eval(&ctx()).unwrap());
    }

    #[test]
    fn test_string_equality() {
        let expr = Expression::parse("form.tier == 'pro'").unwrap();
        assert!(expr.eval(&ctx()).unwrap());

        let expr = Expression::parse("form.tier != 'free'").unwrap();
        assert!(expr.eval(&ctx()).unwrap());
    }

    #[test]
    fn test_connectives_and_negation() {
        let expr = Expression::parse("form.age >= 18 && system.region == 'eu'").unwrap();
        assert!(expr.eval(&ctx()).unwrap());

        let expr = Expression::parse("form.beta || form.age > 100").unwrap();
        assert!(!expr.eval(&ctx()).unwrap());

        let expr = Expression::parse("!form.beta").unwrap();
        assert!(expr.eval(&ctx()).unwrap());
    }

    #[test]
    fn test_precedence() {
        // && binds tighter than ||
        let expr = Expression::parse("true || false && false").unwrap();
        assert!(expr.eval(&ctx()).unwrap());

        let expr = Expression::parse("(true || false) && false").unwrap();
        assert!(!expr.eval(&ctx()).unwrap());
    }

    #[test]
    fn test_bare_path_truthiness() {
        let expr = Expression::parse("form.tier").unwrap();
        assert!(expr.eval(&ctx()).unwrap());

        let expr = Expression::parse("form.beta").unwrap();
        assert!(!expr.eval(&ctx()).unwrap());
    }

    #[test]
    fn test_referenced_paths() {
        let expr = Expression::parse("node.check.valid && form.age >= 18").unwrap();
        assert_eq!(expr.referenced_paths(), vec!["node.check.valid", "form.age"]);
    }

    #[test]
    fn test_undefined_path_errors() {
        let expr = Expression::parse("form.unknown > 1").unwrap();
        let err = expr.eval(&ctx()).unwrap_err();
        assert!(err.contains("form.unknown"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expression::parse("form.age >=").is_err());
        assert!(Expression::parse("form.age = 18").is_err());
        assert!(Expression::parse("(form.age > 1").is_err());
        assert!(Expression::parse("form.age > 1 extra").is_err());
        assert!(Expression::parse("'unterminated").is_err());
    }

    #[test]
    fn test_is_truthy() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!("false")));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("yes")));
        assert!(is_truthy(&json!([1])));
        assert!(!is_truthy(&json!([])));
    }
}
