pub mod expr;
pub mod matcher;
pub mod real_running;

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use gwms_core::classad::{AdValue, ClassAd};

pub use expr::{EvalError, Expr, GlideinView, Scope};
pub use matcher::{MatchCounts, MatchOptions, Matcher};
pub use real_running::{RealRunning, annotate_running_on, count_real_running};

pub const ATTR_IN_DOWNTIME: &str = "GLIDEIN_In_Downtime";
pub const ATTR_GLIDEIN_CPUS: &str = "GLIDEIN_CPUS";
pub const ATTR_REQUEST_CPUS: &str = "RequestCpus";

/// An entry as known to a frontend: the factory pool it was read from and its request name
/// (`<entry>@<glidein>@<factory>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlideinId {
    pub factory_pool: String,
    pub request_name: String,
}

impl GlideinId {
    pub fn new(factory_pool: &str, request_name: &str) -> Self {
        GlideinId {
            factory_pool: factory_pool.to_string(),
            request_name: request_name.to_string(),
        }
    }

    /// Value of `RunningOn` for jobs running in glideins of this entry.
    pub fn running_on(&self) -> String {
        format!("{}@{}", self.request_name, strip_port(&self.factory_pool))
    }
}

impl Display for GlideinId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.request_name, self.factory_pool)
    }
}

pub(crate) fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

/// One entry the jobs are matched against.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub id: GlideinId,
    pub view: GlideinView,
}

impl MatchCandidate {
    pub fn from_ad(factory_pool: &str, ad: &ClassAd) -> Option<Self> {
        let name = ad.name()?;
        Some(MatchCandidate {
            id: GlideinId::new(factory_pool, name),
            view: GlideinView::from_ad(ad),
        })
    }

    pub fn in_downtime(&self) -> bool {
        self.view
            .attrs
            .get(ATTR_IN_DOWNTIME)
            .is_some_and(AdValue::is_true)
    }

    pub fn glidein_cpus(&self) -> u32 {
        glidein_cpus(self.view.attrs.get(ATTR_GLIDEIN_CPUS))
    }
}

/// Cores a glidein of an entry offers; `auto`, `slot`, `node` and missing values count as one.
pub fn glidein_cpus(value: Option<&AdValue>) -> u32 {
    match value {
        None => 1,
        Some(AdValue::String(s))
            if ["auto", "slot", "node"].contains(&s.trim().to_lowercase().as_str()) =>
        {
            1
        }
        Some(value) => match value
            .as_int()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        {
            Some(cpus) if cpus > 0 => cpus as u32,
            _ => {
                log::warn!("Invalid {ATTR_GLIDEIN_CPUS} value {value}, using 1");
                1
            }
        },
    }
}

/// Cores requested by a job; one when not stated.
pub fn job_cpus(job: &ClassAd) -> u32 {
    job.get_int(ATTR_REQUEST_CPUS)
        .filter(|cpus| *cpus > 0)
        .map(|cpus| cpus as u32)
        .unwrap_or(1)
}

/// Additional predicate ANDed with a group's match expression.
pub trait MatchPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// Job attributes read by the predicate, `None` when unknown.
    fn job_attributes(&self) -> Option<BTreeSet<String>>;

    fn matches(&self, scope: &Scope) -> Result<bool, EvalError>;
}

/// Policy given as a named expression in the group configuration.
pub struct ExprPolicy {
    name: String,
    expr: Expr,
}

impl ExprPolicy {
    pub fn new(name: &str, text: &str) -> crate::Result<Self> {
        Ok(ExprPolicy {
            name: name.to_string(),
            expr: Expr::parse(text)?,
        })
    }
}

impl MatchPolicy for ExprPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn job_attributes(&self) -> Option<BTreeSet<String>> {
        self.expr.job_attributes()
    }

    fn matches(&self, scope: &Scope) -> Result<bool, EvalError> {
        match self.expr.evaluate(scope)? {
            expr::Value::Bool(value) => Ok(value),
            other => {
                log::warn!(
                    "Match policy {} evaluated to a non boolean result {other:?}; assuming False",
                    self.name
                );
                Ok(false)
            }
        }
    }
}
