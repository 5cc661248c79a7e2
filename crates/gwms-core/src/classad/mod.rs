pub mod sequence;
pub mod wire;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::GLIDEINWMS_VERSION;
use crate::common::error::CoreError;

pub use sequence::SequenceCounter;
pub use wire::{parse_ads, parse_records, render_ads, write_multi_ad_file};

pub const PARAM_PREFIX: &str = "GlideinParam";
pub const ENC_PARAM_PREFIX: &str = "GlideinEncParam";
pub const MONITOR_PREFIX: &str = "GlideinMonitor";
pub const CONFIG_PREFIX: &str = "GlideinConfig";
pub const PERF_METRIC_PREFIX: &str = "GlideinPerfMetric";
pub const REQUEST_PREFIX: &str = "Req";

pub const ATTR_MY_TYPE: &str = "MyType";
pub const ATTR_GLIDEIN_MY_TYPE: &str = "GlideinMyType";
pub const ATTR_VERSION: &str = "GlideinWMSVersion";
pub const ATTR_NAME: &str = "Name";
pub const ATTR_SEQUENCE: &str = "UpdateSequenceNumber";
pub const ATTR_DAEMON_START: &str = "DaemonStartTime";
pub const ATTR_AUTHENTICATED_IDENTITY: &str = "AuthenticatedIdentity";

/// Attributes owned by the advertisement fabric. They are removed from every ad a service
/// ingests so they never leak into forwarded parameters.
pub const RESERVED_ATTRS: [&str; 11] = [
    "MyType",
    "TargetType",
    "GlideinMyType",
    "MyAddress",
    "UpdatesHistory",
    "UpdatesTotal",
    "UpdatesLost",
    "UpdatesSequenced",
    "UpdateSequenceNumber",
    "DaemonStartTime",
    "AuthenticatedIdentity",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl AdValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AdValue::String(value) => Some(value),
            _ => None,
        }
    }

    /// Integer view of the value. Strings holding an integer are accepted, since several
    /// request attributes travel quoted.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AdValue::Int(value) => Some(*value),
            AdValue::Float(value) if value.fract() == 0.0 => Some(*value as i64),
            AdValue::String(value) => value.trim().parse().ok(),
            AdValue::Bool(_) | AdValue::Float(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AdValue::Int(value) => Some(*value as f64),
            AdValue::Float(value) => Some(*value),
            AdValue::String(value) => value.trim().parse().ok(),
            AdValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AdValue::Bool(value) => Some(*value),
            AdValue::Int(value) => Some(*value != 0),
            AdValue::String(value) => match value.to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            AdValue::Float(_) => None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.as_bool().unwrap_or(false)
    }
}

impl Display for AdValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AdValue::Bool(value) => write!(f, "{value}"),
            AdValue::Int(value) => write!(f, "{value}"),
            AdValue::Float(value) => write!(f, "{value}"),
            AdValue::String(value) => f.write_str(value),
        }
    }
}

impl From<&str> for AdValue {
    fn from(value: &str) -> Self {
        AdValue::String(value.to_string())
    }
}

impl From<String> for AdValue {
    fn from(value: String) -> Self {
        AdValue::String(value)
    }
}

impl From<&String> for AdValue {
    fn from(value: &String) -> Self {
        AdValue::String(value.clone())
    }
}

impl From<bool> for AdValue {
    fn from(value: bool) -> Self {
        AdValue::Bool(value)
    }
}

impl From<i64> for AdValue {
    fn from(value: i64) -> Self {
        AdValue::Int(value)
    }
}

impl From<i32> for AdValue {
    fn from(value: i32) -> Self {
        AdValue::Int(value as i64)
    }
}

impl From<u32> for AdValue {
    fn from(value: u32) -> Self {
        AdValue::Int(value as i64)
    }
}

impl From<u64> for AdValue {
    fn from(value: u64) -> Self {
        AdValue::Int(value as i64)
    }
}

impl From<usize> for AdValue {
    fn from(value: usize) -> Self {
        AdValue::Int(value as i64)
    }
}

impl From<f64> for AdValue {
    fn from(value: f64) -> Self {
        AdValue::Float(value)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AdType {
    FactoryGlobal,
    Factory,
    FactoryClient,
    ClientGlobal,
    Client,
    Resource,
    /// Agent slot registered in a worker pool.
    Slot,
    /// User job scheduler.
    Schedd,
}

impl AdType {
    pub fn my_type(&self) -> &'static str {
        match self {
            AdType::FactoryGlobal => "glidefactoryglobal",
            AdType::Factory => "glidefactory",
            AdType::FactoryClient => "glidefactoryclient",
            AdType::ClientGlobal => "glideclientglobal",
            AdType::Client => "glideclient",
            AdType::Resource => "glideresource",
            AdType::Slot => "Machine",
            AdType::Schedd => "Scheduler",
        }
    }

    /// Attribute that carries the type on the wire.
    pub fn type_attribute(&self) -> &'static str {
        match self {
            AdType::Slot | AdType::Schedd => ATTR_MY_TYPE,
            _ => ATTR_GLIDEIN_MY_TYPE,
        }
    }
}

impl FromStr for AdType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "glidefactoryglobal" => AdType::FactoryGlobal,
            "glidefactory" => AdType::Factory,
            "glidefactoryclient" => AdType::FactoryClient,
            "glideclientglobal" => AdType::ClientGlobal,
            "glideclient" => AdType::Client,
            "glideresource" => AdType::Resource,
            "Machine" => AdType::Slot,
            "Scheduler" => AdType::Schedd,
            _ => return Err(CoreError::invalid_input(format!("Unknown ad type {s}"))),
        })
    }
}

impl Display for AdType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.my_type())
    }
}

/// A typed attribute record exchanged over the advertisement fabric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassAd {
    attrs: BTreeMap<String, AdValue>,
}

impl ClassAd {
    /// Creates an ad with the attributes every emitted record carries.
    pub fn new(ad_type: AdType, name: &str) -> Self {
        let mut ad = ClassAd::default();
        ad.insert(ATTR_MY_TYPE, ad_type.my_type());
        ad.insert(ATTR_GLIDEIN_MY_TYPE, ad_type.my_type());
        ad.insert(ATTR_VERSION, GLIDEINWMS_VERSION);
        ad.insert(ATTR_NAME, name);
        ad
    }

    pub fn name(&self) -> Option<&str> {
        self.get_str(ATTR_NAME)
    }

    pub fn ad_type(&self) -> Option<AdType> {
        self.get_str(ATTR_GLIDEIN_MY_TYPE)
            .or_else(|| self.get_str(ATTR_MY_TYPE))
            .and_then(|t| t.parse().ok())
    }

    pub fn get(&self, name: &str) -> Option<&AdValue> {
        self.attrs.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(|v| v.as_str())
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.attrs.get(name).and_then(|v| v.as_int())
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.attrs.get(name).and_then(|v| v.as_float())
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.attrs.get(name).and_then(|v| v.as_bool())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attrs.contains_key(name)
    }

    pub fn insert<K: Into<String>, V: Into<AdValue>>(&mut self, name: K, value: V) {
        self.attrs.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<AdValue> {
        self.attrs.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AdValue)> {
        self.attrs.iter()
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// All attributes starting with `prefix`, keyed by the remainder of their name.
    pub fn typed_attrs(&self, prefix: &str) -> BTreeMap<String, AdValue> {
        self.attrs
            .iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(prefix)
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (rest.to_string(), value.clone()))
            })
            .collect()
    }

    pub fn set_typed<'a, I>(&mut self, prefix: &str, values: I)
    where
        I: IntoIterator<Item = (&'a String, &'a AdValue)>,
    {
        for (name, value) in values {
            self.attrs.insert(format!("{prefix}{name}"), value.clone());
        }
    }

    /// Removes the attributes owned by the advertisement fabric.
    pub fn strip_reserved(&mut self) {
        for attr in RESERVED_ATTRS {
            self.attrs.remove(attr);
        }
    }
}

impl FromIterator<(String, AdValue)> for ClassAd {
    fn from_iter<I: IntoIterator<Item = (String, AdValue)>>(iter: I) -> Self {
        ClassAd {
            attrs: iter.into_iter().collect(),
        }
    }
}
