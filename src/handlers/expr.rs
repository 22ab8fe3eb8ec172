//! Condition expression mini-language.
//!
//! Grammar (loosest binding first):
//! ```text
//! expr   := and ('||' and)*
//! and    := unary ('&&' unary)*
//! unary  := '!' unary | cmp
//! cmp    := term (('=='|'!='|'>='|'<='|'>'|'<') term)?
//! term   := number | string | 'true' | 'false' | 'null' | path | '(' expr ')'
//! path   := ident ('.' ident)*
//! ```
//! Paths resolve against a JSON context (e.g. `inputs.x`). Missing paths
//! evaluate to null. Truthiness: null and false are false, zero and empty
//! strings/collections are false, everything else is true.

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_while1},
    character::complete::{char, multispace0},
    combinator::{all_consuming, map, opt, recognize, value},
    multi::many0,
    number::complete::double,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use serde_json::Value;

use crate::engine::template::lookup;

/// Comparison and logical operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Path(Vec<String>),
    Not(Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// Parse an expression; the whole input must be consumed.
pub fn parse_expression(input: &str) -> Result<Expr, String> {
    match all_consuming(delimited(multispace0, or_expr, multispace0))(input) {
        Ok((_, expr)) => Ok(expr),
        Err(err) => Err(format!("parse error: {err}")),
    }
}

/// Evaluate a parsed expression to a boolean against a JSON context.
pub fn eval_bool(expr: &Expr, context: &Value) -> bool {
    truthy(&eval(expr, context))
}

/// Parse and evaluate in one step.
pub fn evaluate(input: &str, context: &Value) -> Result<bool, String> {
    Ok(eval_bool(&parse_expression(input)?, context))
}

fn eval(expr: &Expr, context: &Value) -> Value {
    match expr {
        Expr::Number(n) => serde_json::json!(n),
        Expr::Str(s) => Value::String(s.clone()),
        Expr::Bool(b) => Value::Bool(*b),
        Expr::Null => Value::Null,
        Expr::Path(parts) => lookup(context, &parts.join("."))
            .cloned()
            .unwrap_or(Value::Null),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, context))),
        Expr::And(a, b) => {
            Value::Bool(truthy(&eval(a, context)) && truthy(&eval(b, context)))
        }
        Expr::Or(a, b) => {
            Value::Bool(truthy(&eval(a, context)) || truthy(&eval(b, context)))
        }
        Expr::Cmp(op, a, b) => Value::Bool(compare(*op, &eval(a, context), &eval(b, context))),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> bool {
    use CmpOp::*;
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => match op {
            Eq => x == y,
            Ne => x != y,
            Ge => x >= y,
            Le => x <= y,
            Gt => x > y,
            Lt => x < y,
        },
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => match op {
                Eq => x == y,
                Ne => x != y,
                Ge => x >= y,
                Le => x <= y,
                Gt => x > y,
                Lt => x < y,
            },
            _ => match op {
                Eq => a == b,
                Ne => a != b,
                _ => false,
            },
        },
    }
}

// =============================================================================
// Parsers
// =============================================================================

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(ws(tag("||")), and_expr))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, e| Expr::Or(Box::new(acc), Box::new(e))),
    ))
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = unary_expr(input)?;
    let (input, rest) = many0(preceded(ws(tag("&&")), unary_expr))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, e| Expr::And(Box::new(acc), Box::new(e))),
    ))
}

fn unary_expr(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(char('!')), unary_expr), |e| {
            Expr::Not(Box::new(e))
        }),
        cmp_expr,
    ))(input)
}

fn cmp_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = term(input)?;
    let (input, tail) = opt(pair(ws(cmp_op), term))(input)?;
    Ok((
        input,
        match tail {
            Some((op, rhs)) => Expr::Cmp(op, Box::new(first), Box::new(rhs)),
            None => first,
        },
    ))
}

fn cmp_op(input: &str) -> IResult<&str, CmpOp> {
    alt((
        value(CmpOp::Eq, tag("==")),
        value(CmpOp::Ne, tag("!=")),
        value(CmpOp::Ge, tag(">=")),
        value(CmpOp::Le, tag("<=")),
        value(CmpOp::Gt, tag(">")),
        value(CmpOp::Lt, tag("<")),
    ))(input)
}

fn term(input: &str) -> IResult<&str, Expr> {
    preceded(
        multispace0,
        alt((
            delimited(char('('), or_expr, ws(char(')'))),
            string_literal,
            keyword,
            map(double, Expr::Number),
            path,
        )),
    )(input)
}

fn keyword(input: &str) -> IResult<&str, Expr> {
    alt((
        value(Expr::Bool(true), keyword_tag("true")),
        value(Expr::Bool(false), keyword_tag("false")),
        value(Expr::Null, keyword_tag("null")),
    ))(input)
}

/// A keyword not followed by an identifier character.
fn keyword_tag(word: &'static str) -> impl Fn(&str) -> IResult<&str, &str> {
    move |input: &str| {
        let (rest, matched) = tag(word)(input)?;
        if rest
            .chars()
            .next()
            .map(|c| c.is_alphanumeric() || c == '_' || c == '.')
            .unwrap_or(false)
        {
            Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )))
        } else {
            Ok((rest, matched))
        }
    }
}

fn string_literal(input: &str) -> IResult<&str, Expr> {
    alt((
        map(
            delimited(char('"'), opt(is_not("\"")), char('"')),
            |s: Option<&str>| Expr::Str(s.unwrap_or("").to_string()),
        ),
        map(
            delimited(char('\''), opt(is_not("'")), char('\'')),
            |s: Option<&str>| Expr::Str(s.unwrap_or("").to_string()),
        ),
    ))(input)
}

fn ident(input: &str) -> IResult<&str, &str> {
    recognize(take_while1(|c: char| c.is_alphanumeric() || c == '_'))(input)
}

fn path(input: &str) -> IResult<&str, Expr> {
    map(
        recognize(tuple((ident, many0(pair(char('.'), ident))))),
        |s: &str| Expr::Path(s.split('.').map(str::to_string).collect()),
    )(input)
}

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    preceded(multispace0, inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_comparison() {
        let context = json!({"inputs": {"x": 7}});
        assert!(evaluate("inputs.x > 5", &context).unwrap());
        assert!(!evaluate("inputs.x > 10", &context).unwrap());
        assert!(evaluate("inputs.x == 7", &context).unwrap());
    }

    #[test]
    fn logical_operators_and_precedence() {
        let context = json!({"a": 1, "b": 0});
        assert!(evaluate("a == 1 && b == 0", &context).unwrap());
        assert!(evaluate("a == 2 || b == 0", &context).unwrap());
        assert!(evaluate("!b", &context).unwrap());
        // && binds tighter than ||
        assert!(evaluate("a == 2 || a == 1 && b == 0", &context).unwrap());
    }

    #[test]
    fn string_comparison() {
        let context = json!({"status": "done"});
        assert!(evaluate("status == 'done'", &context).unwrap());
        assert!(evaluate("status != \"pending\"", &context).unwrap());
    }

    #[test]
    fn missing_path_is_null_and_falsy() {
        let context = json!({});
        assert!(!evaluate("missing.path", &context).unwrap());
        assert!(evaluate("missing.path == null", &context).unwrap());
    }

    #[test]
    fn parentheses() {
        let context = json!({"a": 1, "b": 2});
        assert!(evaluate("(a == 2 || b == 2) && a == 1", &context).unwrap());
    }

    #[test]
    fn keywords_are_not_path_prefixes() {
        let context = json!({"truthy": false});
        // `truthy` must parse as a path, not the keyword `true` + `thy`.
        assert!(!evaluate("truthy", &context).unwrap());
    }

    #[test]
    fn invalid_expression_is_a_parse_error() {
        assert!(parse_expression("a &&").is_err());
        assert!(parse_expression("== 3").is_err());
    }

    #[test]
    fn bare_truthiness() {
        let context = json!({"xs": [1], "none": []});
        assert!(evaluate("xs", &context).unwrap());
        assert!(!evaluate("none", &context).unwrap());
    }
}
