pub mod command;
pub mod memory;

use std::fmt::Write;
use std::future::Future;
use std::pin::Pin;

use crate::ExternalResult;
use crate::classad::wire::escape;
use crate::classad::{AdType, AdValue, ClassAd};

pub use command::CommandAdBus;
pub use memory::MemoryAdBus;

/// Typed filter over ad attributes.
///
/// Equality on a missing attribute is false, inequality on a missing attribute is true
/// (the `=?=`/`=!=` semantics of the collector).
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    All,
    Eq(String, AdValue),
    Ne(String, AdValue),
    And(Vec<Constraint>),
    Or(Vec<Constraint>),
}

impl Constraint {
    pub fn eq<S: Into<String>, V: Into<AdValue>>(attr: S, value: V) -> Self {
        Constraint::Eq(attr.into(), value.into())
    }

    pub fn ne<S: Into<String>, V: Into<AdValue>>(attr: S, value: V) -> Self {
        Constraint::Ne(attr.into(), value.into())
    }

    pub fn and(self, other: Constraint) -> Self {
        match (self, other) {
            (Constraint::All, c) | (c, Constraint::All) => c,
            (Constraint::And(mut items), Constraint::And(rest)) => {
                items.extend(rest);
                Constraint::And(items)
            }
            (Constraint::And(mut items), c) => {
                items.push(c);
                Constraint::And(items)
            }
            (a, b) => Constraint::And(vec![a, b]),
        }
    }

    pub fn matches(&self, ad: &ClassAd) -> bool {
        match self {
            Constraint::All => true,
            Constraint::Eq(attr, value) => ad.get(attr).is_some_and(|v| values_equal(v, value)),
            Constraint::Ne(attr, value) => !ad.get(attr).is_some_and(|v| values_equal(v, value)),
            Constraint::And(items) => items.iter().all(|c| c.matches(ad)),
            Constraint::Or(items) => items.iter().any(|c| c.matches(ad)),
        }
    }

    /// Renders the constraint as a collector expression.
    pub fn to_expression(&self) -> String {
        let mut out = String::new();
        self.write_expression(&mut out);
        out
    }

    fn write_expression(&self, out: &mut String) {
        let literal = |value: &AdValue| match value {
            AdValue::String(s) => format!("\"{}\"", escape(s)),
            v => v.to_string(),
        };
        match self {
            Constraint::All => out.push_str("true"),
            Constraint::Eq(attr, value) => {
                let _ = write!(out, "({attr} =?= {})", literal(value));
            }
            Constraint::Ne(attr, value) => {
                let _ = write!(out, "({attr} =!= {})", literal(value));
            }
            Constraint::And(items) | Constraint::Or(items) => {
                if items.is_empty() {
                    out.push_str(if matches!(self, Constraint::And(_)) {
                        "true"
                    } else {
                        "false"
                    });
                    return;
                }
                let separator = if matches!(self, Constraint::And(_)) {
                    " && "
                } else {
                    " || "
                };
                out.push('(');
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        out.push_str(separator);
                    }
                    item.write_expression(out);
                }
                out.push(')');
            }
        }
    }
}

fn values_equal(a: &AdValue, b: &AdValue) -> bool {
    match (a, b) {
        (AdValue::String(a), AdValue::String(b)) => a == b,
        (AdValue::Bool(a), AdValue::Bool(b)) => a == b,
        (AdValue::String(_), _) | (_, AdValue::String(_)) => false,
        (AdValue::Bool(_), _) | (_, AdValue::Bool(_)) => false,
        (a, b) => a.as_float() == b.as_float(),
    }
}

pub type AdBusFuture<T> = Pin<Box<dyn Future<Output = ExternalResult<T>>>>;

/// Client of the advertisement fabric.
pub trait AdBus {
    /// Publish a batch of ads in one call.
    fn publish(&self, ads: Vec<ClassAd>) -> AdBusFuture<()>;

    /// Withdraw every ad of the given type matching the constraint.
    fn invalidate(&self, ad_type: AdType, constraint: Constraint) -> AdBusFuture<()>;

    fn query(&self, ad_type: AdType, constraint: Constraint) -> AdBusFuture<Vec<ClassAd>>;
}
