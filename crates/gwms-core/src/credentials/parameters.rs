use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::classad::wire::escape;
use crate::common::error::CoreError;
use crate::credentials::GeneratorRegistry;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParameterName {
    VmId,
    VmType,
    GlideinProxy,
    RemoteUsername,
    ProjectId,
}

impl ParameterName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterName::VmId => "VMId",
            ParameterName::VmType => "VMType",
            ParameterName::GlideinProxy => "GlideinProxy",
            ParameterName::RemoteUsername => "RemoteUsername",
            ParameterName::ProjectId => "ProjectId",
        }
    }
}

impl FromStr for ParameterName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "vmid" | "vm_id" => ParameterName::VmId,
            "vmtype" | "vm_type" => ParameterName::VmType,
            "glideinproxy" => ParameterName::GlideinProxy,
            "remoteusername" | "remote_username" => ParameterName::RemoteUsername,
            "projectid" | "project_id" => ParameterName::ProjectId,
            _ => return Err(CoreError::invalid_input(format!("Unknown parameter name: {s}"))),
        })
    }
}

impl Display for ParameterName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterType {
    Generator,
    Integer,
    Expression,
    String,
}

impl FromStr for ParameterType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "generator" => ParameterType::Generator,
            "integer" | "int" => ParameterType::Integer,
            "expression" | "expr" => ParameterType::Expression,
            "string" | "str" => ParameterType::String,
            _ => return Err(CoreError::invalid_input(format!("Unknown parameter type: {s}"))),
        })
    }
}

/// A non-secret value forwarded with a request (for example the VM image to start).
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    name: ParameterName,
    kind: ParameterType,
    value: String,
    context: BTreeMap<String, String>,
}

impl Parameter {
    pub fn new(name: ParameterName, kind: ParameterType, value: &str) -> crate::Result<Self> {
        let value = value.trim();
        match kind {
            ParameterType::Integer => {
                value.parse::<i64>().map_err(|_| {
                    CoreError::invalid_input(format!("Parameter {name} is not an integer: {value}"))
                })?;
            }
            ParameterType::Expression | ParameterType::Generator if value.is_empty() => {
                return Err(CoreError::invalid_input(format!("Parameter {name} is empty")));
            }
            _ => {}
        }
        Ok(Parameter {
            name,
            kind,
            value: value.to_string(),
            context: Default::default(),
        })
    }

    pub fn with_context(mut self, context: BTreeMap<String, String>) -> Self {
        self.context = context;
        self
    }

    pub fn name(&self) -> ParameterName {
        self.name
    }

    pub fn kind(&self) -> ParameterType {
        self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Value as written into an ad; generator parameters have none until resolved.
    pub fn quoted_value(&self) -> Option<String> {
        match self.kind {
            ParameterType::Integer | ParameterType::Expression => Some(self.value.clone()),
            ParameterType::String => Some(format!("\"{}\"", escape(&self.value))),
            ParameterType::Generator => None,
        }
    }

    /// Replaces a generator parameter by the string it produces.
    pub async fn resolve(&self, registry: &GeneratorRegistry) -> crate::Result<Parameter> {
        if self.kind != ParameterType::Generator {
            return Ok(self.clone());
        }
        let generated = registry
            .get(&self.value)?
            .generate(self.context.clone())
            .await
            .map_err(|e| {
                CoreError::invalid_input(format!("Generator for {} failed: {e:?}", self.name))
            })?;
        let value = String::from_utf8_lossy(&generated.data).trim().to_string();
        Parameter::new(self.name, ParameterType::String, &value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParameterDict {
    parameters: BTreeMap<ParameterName, Parameter>,
}

impl ParameterDict {
    pub fn add(&mut self, parameter: Parameter) {
        self.parameters.insert(parameter.name, parameter);
    }

    pub fn get(&self, name: ParameterName) -> Option<&Parameter> {
        self.parameters.get(&name)
    }

    pub fn contains(&self, name: ParameterName) -> bool {
        self.parameters.contains_key(&name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.values()
    }

    pub fn names(&self) -> impl Iterator<Item = ParameterName> + '_ {
        self.parameters.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_names_and_types() {
        assert_eq!("vm_id".parse::<ParameterName>().unwrap(), ParameterName::VmId);
        assert_eq!(
            "ProjectId".parse::<ParameterName>().unwrap(),
            ParameterName::ProjectId
        );
        assert_eq!(
            "expr".parse::<ParameterType>().unwrap(),
            ParameterType::Expression
        );
        assert!("color".parse::<ParameterName>().is_err());
    }

    #[test]
    fn quoted_values() {
        let int = Parameter::new(ParameterName::VmId, ParameterType::Integer, " 42 ").unwrap();
        assert_eq!(int.quoted_value().as_deref(), Some("42"));
        let string = Parameter::new(ParameterName::VmType, ParameterType::String, "a\"b").unwrap();
        assert_eq!(string.quoted_value().as_deref(), Some("\"a\\\"b\""));
        assert!(Parameter::new(ParameterName::VmId, ParameterType::Integer, "x").is_err());
        let generator =
            Parameter::new(ParameterName::ProjectId, ParameterType::Generator, "command").unwrap();
        assert_eq!(generator.quoted_value(), None);
    }

    #[tokio::test]
    async fn resolve_generator() {
        let registry = GeneratorRegistry::with_builtins(std::time::Duration::from_secs(5));
        let mut context = BTreeMap::new();
        context.insert("command".to_string(), "echo proj-7".to_string());
        let parameter = Parameter::new(ParameterName::ProjectId, ParameterType::Generator, "command")
            .unwrap()
            .with_context(context);
        let resolved = parameter.resolve(&registry).await.unwrap();
        assert_eq!(resolved.value(), "proj-7");
        assert_eq!(resolved.kind(), ParameterType::String);
    }
}
