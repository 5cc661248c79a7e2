//! Match predicates written in a small, side-effect free expression language.
//!
//! The syntax follows the Python subset match expressions are usually written in:
//! `job["RequestCpus"] <= glidein["attrs"]["GLIDEIN_CPUS"] and
//! glidein["attrs"]["GLIDEIN_Site"] in job.get("DESIRED_Sites", "").split(",")`.
//! Nothing in an expression can reach the host; evaluation only reads the two bags.

use std::collections::{BTreeMap, BTreeSet};

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{char, digit0, digit1, multispace1};
use nom::combinator::{all_consuming, map, map_res, opt, recognize, value};
use nom::multi::{many0, separated_list0};
use nom::sequence::{delimited, pair, preceded, tuple};
use thiserror::Error;

use gwms_core::classad::{AdValue, ClassAd};
use gwms_core::common::error::CoreError;

use crate::common::parser::{
    NomResult, format_parse_error, p_identifier, p_keyword, p_string_literal, p_symbol, ws,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Dict(DictKind),
}

/// The attribute bags an expression can index.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DictKind {
    Job,
    Glidein,
    GlideinAttrs,
    GlideinParams,
}

impl From<&AdValue> for Value {
    fn from(value: &AdValue) -> Self {
        match value {
            AdValue::Bool(v) => Value::Bool(*v),
            AdValue::Int(v) => Value::Int(*v),
            AdValue::Float(v) => Value::Float(*v),
            AdValue::String(v) => Value::Str(v.clone()),
        }
    }
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(v) => *v,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(v) => !v.is_empty(),
            Value::List(v) => !v.is_empty(),
            Value::Dict(_) => true,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Bool(v) => Some(*v as i64 as f64),
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
        }
    }

    fn to_display(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Str(v) => v.clone(),
            Value::List(items) => format!(
                "[{}]",
                items
                    .iter()
                    .map(|item| item.to_display())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Value::Dict(kind) => format!("{kind:?}"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("Missing key `{0}`")]
    MissingKey(String),
    #[error("Unknown name `{0}`")]
    UnknownName(String),
    #[error("Type error: {0}")]
    Type(String),
    #[error("Division by zero")]
    ZeroDivision,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    List(Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Call {
        target: Option<Box<Expr>>,
        name: String,
        args: Vec<Expr>,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// The glidein side of a match: the entry ad and its `GlideinParam*` attributes.
#[derive(Debug, Clone, Default)]
pub struct GlideinView {
    pub attrs: BTreeMap<String, AdValue>,
    pub params: BTreeMap<String, AdValue>,
}

impl GlideinView {
    pub fn from_ad(ad: &ClassAd) -> Self {
        GlideinView {
            attrs: ad.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            params: ad.typed_attrs(gwms_core::classad::PARAM_PREFIX),
        }
    }
}

pub struct Scope<'a> {
    pub job: &'a ClassAd,
    pub glidein: &'a GlideinView,
}

const RESERVED: [&str; 8] = ["and", "or", "not", "in", "True", "False", "None", "lambda"];

enum Postfix {
    Index(Expr),
    Method(String, Vec<Expr>),
}

fn p_number(input: &str) -> NomResult<Expr> {
    alt((
        map_res(
            recognize(tuple((digit1, char('.'), digit0))),
            |number: &str| number.parse::<f64>().map(|v| Expr::Literal(Value::Float(v))),
        ),
        map_res(digit1, |number: &str| {
            number.parse::<i64>().map(|v| Expr::Literal(Value::Int(v)))
        }),
    ))(input)
}

fn p_args(input: &str) -> NomResult<Vec<Expr>> {
    delimited(
        p_symbol('('),
        separated_list0(p_symbol(','), p_expr),
        p_symbol(')'),
    )(input)
}

fn p_name(input: &str) -> NomResult<Expr> {
    let (rest, name) = p_identifier(input)?;
    let literal = match name {
        "True" => Some(Value::Bool(true)),
        "False" => Some(Value::Bool(false)),
        "None" => Some(Value::None),
        _ if RESERVED.contains(&name) => {
            return Err(nom::Err::Error(crate::common::parser::ParserError::Nom(
                input,
                nom::error::ErrorKind::Verify,
            )));
        }
        _ => None,
    };
    if let Some(literal) = literal {
        return Ok((rest, Expr::Literal(literal)));
    }
    match p_args(rest) {
        Ok((rest, args)) => Ok((
            rest,
            Expr::Call {
                target: None,
                name: name.to_string(),
                args,
            },
        )),
        Err(_) => Ok((rest, Expr::Name(name.to_string()))),
    }
}

fn p_parenthesized(input: &str) -> NomResult<Expr> {
    let (input, _) = p_symbol('(')(input)?;
    let (input, first) = p_expr(input)?;
    let (input, others) = many0(preceded(p_symbol(','), p_expr))(input)?;
    let (input, trailing) = opt(p_symbol(','))(input)?;
    let (input, _) = p_symbol(')')(input)?;
    if others.is_empty() && trailing.is_none() {
        Ok((input, first))
    } else {
        let mut items = vec![first];
        items.extend(others);
        Ok((input, Expr::List(items)))
    }
}

fn p_primary(input: &str) -> NomResult<Expr> {
    alt((
        p_number,
        map(p_string_literal, |s| Expr::Literal(Value::Str(s))),
        map(
            delimited(
                p_symbol('['),
                separated_list0(p_symbol(','), p_expr),
                p_symbol(']'),
            ),
            Expr::List,
        ),
        p_parenthesized,
        p_name,
    ))(input)
}

fn p_postfix(input: &str) -> NomResult<Expr> {
    let (input, base) = ws(p_primary)(input)?;
    let (input, suffixes) = many0(alt((
        map(
            delimited(p_symbol('['), p_expr, p_symbol(']')),
            Postfix::Index,
        ),
        map(
            pair(preceded(p_symbol('.'), p_identifier), p_args),
            |(name, args)| Postfix::Method(name.to_string(), args),
        ),
    )))(input)?;
    let expr = suffixes.into_iter().fold(base, |target, suffix| match suffix {
        Postfix::Index(key) => Expr::Index(Box::new(target), Box::new(key)),
        Postfix::Method(name, args) => Expr::Call {
            target: Some(Box::new(target)),
            name,
            args,
        },
    });
    Ok((input, expr))
}

fn p_unary(input: &str) -> NomResult<Expr> {
    alt((
        map(preceded(p_symbol('-'), p_unary), |e| {
            Expr::Unary(UnaryOp::Neg, Box::new(e))
        }),
        p_postfix,
    ))(input)
}

fn p_product(input: &str) -> NomResult<Expr> {
    let (input, first) = p_unary(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinaryOp::Mul, char('*')),
            value(BinaryOp::Div, char('/')),
            value(BinaryOp::Mod, char('%')),
        ))),
        p_unary,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn p_sum(input: &str) -> NomResult<Expr> {
    let (input, first) = p_product(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinaryOp::Add, char('+')),
            value(BinaryOp::Sub, char('-')),
        ))),
        p_product,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn fold_binary(first: Expr, rest: Vec<(BinaryOp, Expr)>) -> Expr {
    rest.into_iter().fold(first, |lhs, (op, rhs)| {
        Expr::Binary(Box::new(lhs), op, Box::new(rhs))
    })
}

fn p_compare_op(input: &str) -> NomResult<CompareOp> {
    ws(alt((
        value(CompareOp::Eq, tag("==")),
        value(CompareOp::Ne, tag("!=")),
        value(CompareOp::Le, tag("<=")),
        value(CompareOp::Ge, tag(">=")),
        value(CompareOp::Lt, tag("<")),
        value(CompareOp::Gt, tag(">")),
        value(
            CompareOp::NotIn,
            tuple((p_keyword("not"), multispace1, p_keyword("in"))),
        ),
        value(CompareOp::In, p_keyword("in")),
    )))(input)
}

fn p_comparison(input: &str) -> NomResult<Expr> {
    let (input, lhs) = p_sum(input)?;
    let (input, rhs) = opt(pair(p_compare_op, p_sum))(input)?;
    Ok((
        input,
        match rhs {
            Some((op, rhs)) => Expr::Compare(Box::new(lhs), op, Box::new(rhs)),
            None => lhs,
        },
    ))
}

fn p_not(input: &str) -> NomResult<Expr> {
    alt((
        map(preceded(ws(p_keyword("not")), p_not), |e| {
            Expr::Not(Box::new(e))
        }),
        p_comparison,
    ))(input)
}

fn p_and(input: &str) -> NomResult<Expr> {
    let (input, first) = p_not(input)?;
    let (input, rest) = many0(preceded(ws(p_keyword("and")), p_not))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, e| Expr::And(Box::new(acc), Box::new(e))),
    ))
}

fn p_expr(input: &str) -> NomResult<Expr> {
    let (input, first) = p_and(input)?;
    let (input, rest) = many0(preceded(ws(p_keyword("or")), p_and))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, e| Expr::Or(Box::new(acc), Box::new(e))),
    ))
}

fn compare_values(lhs: &Value, op: CompareOp, rhs: &Value) -> Result<bool, EvalError> {
    use std::cmp::Ordering;

    let ordering = || -> Result<Ordering, EvalError> {
        if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
            return a
                .partial_cmp(&b)
                .ok_or_else(|| EvalError::Type("NaN comparison".to_string()));
        }
        match (lhs, rhs) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            _ => Err(EvalError::Type(format!(
                "cannot order {} and {}",
                lhs.type_name(),
                rhs.type_name()
            ))),
        }
    };
    let equal = || match (lhs.as_number(), rhs.as_number()) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    };
    Ok(match op {
        CompareOp::Eq => equal(),
        CompareOp::Ne => !equal(),
        CompareOp::Lt => ordering()? == Ordering::Less,
        CompareOp::Le => ordering()? != Ordering::Greater,
        CompareOp::Gt => ordering()? == Ordering::Greater,
        CompareOp::Ge => ordering()? != Ordering::Less,
        CompareOp::In => contains(rhs, lhs)?,
        CompareOp::NotIn => !contains(rhs, lhs)?,
    })
}

fn contains(container: &Value, item: &Value) -> Result<bool, EvalError> {
    match (container, item) {
        (Value::List(items), _) => Ok(items
            .iter()
            .any(|candidate| compare_values(candidate, CompareOp::Eq, item).unwrap_or(false))),
        (Value::Str(haystack), Value::Str(needle)) => Ok(haystack.contains(needle.as_str())),
        _ => Err(EvalError::Type(format!(
            "`in` on {} with {}",
            container.type_name(),
            item.type_name()
        ))),
    }
}

fn arithmetic(lhs: Value, op: BinaryOp, rhs: Value) -> Result<Value, EvalError> {
    match (&lhs, op, &rhs) {
        (Value::Str(a), BinaryOp::Add, Value::Str(b)) => return Ok(Value::Str(format!("{a}{b}"))),
        (Value::List(a), BinaryOp::Add, Value::List(b)) => {
            return Ok(Value::List(a.iter().chain(b).cloned().collect()));
        }
        _ => {}
    }
    let integers = match (&lhs, &rhs) {
        (Value::Int(a), Value::Int(b)) => Some((*a, *b)),
        _ => None,
    };
    let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) else {
        return Err(EvalError::Type(format!(
            "unsupported operands {} and {}",
            lhs.type_name(),
            rhs.type_name()
        )));
    };
    Ok(match (op, integers) {
        (BinaryOp::Add, Some((a, b))) => Value::Int(a.wrapping_add(b)),
        (BinaryOp::Sub, Some((a, b))) => Value::Int(a.wrapping_sub(b)),
        (BinaryOp::Mul, Some((a, b))) => Value::Int(a.wrapping_mul(b)),
        (BinaryOp::Mod, Some((_, 0))) | (BinaryOp::Div, _) if b == 0.0 => {
            return Err(EvalError::ZeroDivision);
        }
        (BinaryOp::Mod, Some((a, b))) => Value::Int(a.rem_euclid(b)),
        (BinaryOp::Add, None) => Value::Float(a + b),
        (BinaryOp::Sub, None) => Value::Float(a - b),
        (BinaryOp::Mul, None) => Value::Float(a * b),
        (BinaryOp::Mod, None) if b == 0.0 => return Err(EvalError::ZeroDivision),
        (BinaryOp::Mod, None) => Value::Float(a.rem_euclid(b)),
        (BinaryOp::Div, _) => Value::Float(a / b),
    })
}

fn call_function(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    let single = |args: Vec<Value>| -> Result<Value, EvalError> {
        let mut args = args.into_iter();
        match (args.next(), args.next()) {
            (Some(arg), None) => Ok(arg),
            _ => Err(EvalError::Type(format!("{name}() takes one argument"))),
        }
    };
    let arg = single(args)?;
    match name {
        "int" => match &arg {
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| EvalError::Type(format!("invalid int `{s}`"))),
            Value::Float(v) => Ok(Value::Int(v.trunc() as i64)),
            _ => arg
                .as_number()
                .map(|v| Value::Int(v as i64))
                .ok_or_else(|| EvalError::Type(format!("int() of {}", arg.type_name()))),
        },
        "float" => match &arg {
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| EvalError::Type(format!("invalid float `{s}`"))),
            _ => arg
                .as_number()
                .map(Value::Float)
                .ok_or_else(|| EvalError::Type(format!("float() of {}", arg.type_name()))),
        },
        "str" => Ok(Value::Str(arg.to_display())),
        "bool" => Ok(Value::Bool(arg.is_truthy())),
        "len" => match &arg {
            Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::List(items) => Ok(Value::Int(items.len() as i64)),
            _ => Err(EvalError::Type(format!("len() of {}", arg.type_name()))),
        },
        _ => Err(EvalError::UnknownName(name.to_string())),
    }
}

impl Expr {
    pub fn parse(text: &str) -> crate::Result<Expr> {
        all_consuming(ws(p_expr))(text)
            .map(|(_, expr)| expr)
            .map_err(|error| {
                CoreError::configuration(format!(
                    "Invalid match expression `{text}`: {}",
                    format_parse_error(error)
                ))
                .into()
            })
    }

    pub fn evaluate(&self, scope: &Scope) -> Result<Value, EvalError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Name(name) => match name.as_str() {
                "job" => Ok(Value::Dict(DictKind::Job)),
                "glidein" => Ok(Value::Dict(DictKind::Glidein)),
                _ => Err(EvalError::UnknownName(name.clone())),
            },
            Expr::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| item.evaluate(scope))
                    .collect::<Result<_, _>>()?,
            )),
            Expr::Index(target, key) => {
                let target = target.evaluate(scope)?;
                let key = key.evaluate(scope)?;
                index(scope, &target, &key)
            }
            Expr::Call { target, name, args } => {
                let args = args
                    .iter()
                    .map(|arg| arg.evaluate(scope))
                    .collect::<Result<Vec<_>, _>>()?;
                match target {
                    Some(target) => {
                        let target = target.evaluate(scope)?;
                        call_method(scope, target, name, args)
                    }
                    None => call_function(name, args),
                }
            }
            Expr::Unary(UnaryOp::Neg, inner) => match inner.evaluate(scope)? {
                Value::Int(v) => Ok(Value::Int(-v)),
                Value::Float(v) => Ok(Value::Float(-v)),
                other => Err(EvalError::Type(format!("cannot negate {}", other.type_name()))),
            },
            Expr::Binary(lhs, op, rhs) => arithmetic(lhs.evaluate(scope)?, *op, rhs.evaluate(scope)?),
            Expr::Compare(lhs, op, rhs) => Ok(Value::Bool(compare_values(
                &lhs.evaluate(scope)?,
                *op,
                &rhs.evaluate(scope)?,
            )?)),
            Expr::Not(inner) => Ok(Value::Bool(!inner.evaluate(scope)?.is_truthy())),
            Expr::And(lhs, rhs) => Ok(Value::Bool(
                lhs.evaluate(scope)?.is_truthy() && rhs.evaluate(scope)?.is_truthy(),
            )),
            Expr::Or(lhs, rhs) => Ok(Value::Bool(
                lhs.evaluate(scope)?.is_truthy() || rhs.evaluate(scope)?.is_truthy(),
            )),
        }
    }

    pub fn matches(&self, scope: &Scope) -> Result<bool, EvalError> {
        self.evaluate(scope).map(|value| value.is_truthy())
    }

    /// Job attributes the expression reads, or `None` when it uses the job bag as a whole.
    pub fn job_attributes(&self) -> Option<BTreeSet<String>> {
        let mut attributes = BTreeSet::new();
        if collect_job_attributes(self, &mut attributes) {
            Some(attributes)
        } else {
            None
        }
    }
}

fn is_job(expr: &Expr) -> bool {
    matches!(expr, Expr::Name(name) if name == "job")
}

fn collect_job_attributes(expr: &Expr, out: &mut BTreeSet<String>) -> bool {
    match expr {
        Expr::Index(target, key) if is_job(target) => match key.as_ref() {
            Expr::Literal(Value::Str(name)) => {
                out.insert(name.clone());
                true
            }
            _ => false,
        },
        Expr::Call {
            target: Some(target),
            name,
            args,
        } if is_job(target) && name == "get" => match args.first() {
            Some(Expr::Literal(Value::Str(attribute))) => {
                out.insert(attribute.clone());
                args[1..].iter().all(|arg| collect_job_attributes(arg, out))
            }
            _ => false,
        },
        Expr::Name(name) => name != "job",
        Expr::Literal(_) => true,
        Expr::List(items) => items.iter().all(|item| collect_job_attributes(item, out)),
        Expr::Index(target, key) => {
            collect_job_attributes(target, out) && collect_job_attributes(key, out)
        }
        Expr::Call { target, args, .. } => {
            target
                .as_ref()
                .is_none_or(|target| collect_job_attributes(target, out))
                && args.iter().all(|arg| collect_job_attributes(arg, out))
        }
        Expr::Unary(_, inner) | Expr::Not(inner) => collect_job_attributes(inner, out),
        Expr::Binary(lhs, _, rhs)
        | Expr::Compare(lhs, _, rhs)
        | Expr::And(lhs, rhs)
        | Expr::Or(lhs, rhs) => collect_job_attributes(lhs, out) && collect_job_attributes(rhs, out),
    }
}

fn lookup(scope: &Scope, kind: DictKind, key: &str) -> Option<Value> {
    match kind {
        DictKind::Job => scope.job.get(key).map(Value::from),
        DictKind::Glidein => match key {
            "attrs" => Some(Value::Dict(DictKind::GlideinAttrs)),
            "params" => Some(Value::Dict(DictKind::GlideinParams)),
            _ => None,
        },
        DictKind::GlideinAttrs => scope.glidein.attrs.get(key).map(Value::from),
        DictKind::GlideinParams => scope.glidein.params.get(key).map(Value::from),
    }
}

fn index(scope: &Scope, target: &Value, key: &Value) -> Result<Value, EvalError> {
    match (target, key) {
        (Value::Dict(kind), Value::Str(key)) => {
            lookup(scope, *kind, key).ok_or_else(|| EvalError::MissingKey(key.clone()))
        }
        (Value::List(items), Value::Int(position)) => {
            let length = items.len() as i64;
            let position = if *position < 0 { length + position } else { *position };
            items
                .get(position.max(0) as usize)
                .filter(|_| position >= 0)
                .cloned()
                .ok_or_else(|| EvalError::Type("list index out of range".to_string()))
        }
        _ => Err(EvalError::Type(format!(
            "cannot index {} with {}",
            target.type_name(),
            key.type_name()
        ))),
    }
}

fn call_method(
    scope: &Scope,
    target: Value,
    name: &str,
    args: Vec<Value>,
) -> Result<Value, EvalError> {
    match (&target, name) {
        (Value::Dict(kind), "get") => {
            let mut args = args.into_iter();
            let key = match args.next() {
                Some(Value::Str(key)) => key,
                _ => return Err(EvalError::Type("get() needs a string key".to_string())),
            };
            let default = args.next().unwrap_or(Value::None);
            Ok(lookup(scope, *kind, &key).unwrap_or(default))
        }
        (Value::Str(s), "split") => Ok(Value::List(match args.first() {
            Some(Value::Str(separator)) => s
                .split(separator.as_str())
                .map(|part| Value::Str(part.to_string()))
                .collect(),
            _ => s
                .split_whitespace()
                .map(|part| Value::Str(part.to_string()))
                .collect(),
        })),
        (Value::Str(s), "strip") => Ok(Value::Str(s.trim().to_string())),
        (Value::Str(s), "lower") => Ok(Value::Str(s.to_lowercase())),
        (Value::Str(s), "upper") => Ok(Value::Str(s.to_uppercase())),
        (Value::Str(s), "startswith" | "endswith") => match args.first() {
            Some(Value::Str(affix)) => Ok(Value::Bool(if name == "startswith" {
                s.starts_with(affix.as_str())
            } else {
                s.ends_with(affix.as_str())
            })),
            _ => Err(EvalError::Type(format!("{name}() needs a string"))),
        },
        _ => Err(EvalError::Type(format!(
            "{} has no method {name}",
            target.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ClassAd {
        let mut ad = ClassAd::default();
        ad.insert("RequestCpus", 4);
        ad.insert("DESIRED_Sites", "Nebraska,Wisconsin");
        ad.insert("Owner", "alice");
        ad
    }

    fn glidein() -> GlideinView {
        let mut view = GlideinView::default();
        view.attrs
            .insert("GLIDEIN_Site".to_string(), AdValue::from("Wisconsin"));
        view.attrs.insert("GLIDEIN_CPUS".to_string(), AdValue::from(8));
        view.attrs
            .insert("GLIDEIN_In_Downtime".to_string(), AdValue::from(false));
        view.params
            .insert("Memory".to_string(), AdValue::from(2048.5));
        view
    }

    fn eval(text: &str) -> Result<bool, EvalError> {
        let job = job();
        let glidein = glidein();
        let scope = Scope {
            job: &job,
            glidein: &glidein,
        };
        Expr::parse(text).unwrap().matches(&scope)
    }

    #[test]
    fn site_membership() {
        assert_eq!(
            eval(r#"glidein["attrs"]["GLIDEIN_Site"] in job["DESIRED_Sites"].split(",")"#),
            Ok(true)
        );
        assert_eq!(
            eval(r#"glidein["attrs"]["GLIDEIN_Site"] not in job.get("Missing", "").split(",")"#),
            Ok(true)
        );
    }

    #[test]
    fn arithmetic_and_comparisons() {
        assert_eq!(
            eval(r#"job["RequestCpus"] * 2 <= glidein["attrs"]["GLIDEIN_CPUS"]"#),
            Ok(true)
        );
        assert_eq!(eval(r#"glidein["params"]["Memory"] > 2048"#), Ok(true));
        assert_eq!(eval("(1 + 2) * 3 == 9 and not False"), Ok(true));
        assert_eq!(eval("7 / 2 == 3.5"), Ok(true));
        assert_eq!(eval("-3 % 2 == 1"), Ok(true));
        assert_eq!(eval(r#"job["Owner"] in ("bob", "alice")"#), Ok(true));
        assert_eq!(eval(r#"int("12") + len([1, 2]) == 14"#), Ok(true));
        assert_eq!(eval("True or job['Never']"), Ok(true));
    }

    #[test]
    fn errors_are_reported() {
        assert_eq!(
            eval(r#"job["Missing"] == 1"#),
            Err(EvalError::MissingKey("Missing".to_string()))
        );
        assert_eq!(eval("1 / 0"), Err(EvalError::ZeroDivision));
        assert!(matches!(eval("open('x')"), Err(EvalError::UnknownName(_))));
        assert!(matches!(eval("'a' < 1"), Err(EvalError::Type(_))));
    }

    #[test]
    fn parse_errors_are_configuration_errors() {
        for text in ["job[", "1 +", "job['a'] ==", "and", "import os"] {
            let error = Expr::parse(text).unwrap_err();
            assert_eq!(
                error.kind(),
                gwms_core::common::error::ErrorKind::Configuration,
                "{text}"
            );
        }
    }

    #[test]
    fn referenced_job_attributes() {
        let expr = Expr::parse(
            r#"job["RequestCpus"] > 1 and job.get("Owner", glidein["attrs"]["X"]) == "a""#,
        )
        .unwrap();
        assert_eq!(
            expr.job_attributes(),
            Some(BTreeSet::from(["Owner".to_string(), "RequestCpus".to_string()]))
        );
        assert_eq!(Expr::parse("len(str(job)) > 0").unwrap().job_attributes(), None);
        assert_eq!(
            Expr::parse("True").unwrap().job_attributes(),
            Some(BTreeSet::new())
        );
    }
}
