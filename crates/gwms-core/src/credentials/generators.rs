use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;

use crate::ExternalResult;
use crate::Map;
use crate::common::command::run_command;
use crate::common::error::CoreError;
use crate::credentials::CredentialType;

#[derive(Debug, Clone)]
pub struct GeneratedCredential {
    pub kind: CredentialType,
    pub data: Vec<u8>,
}

pub type GeneratorFuture = Pin<Box<dyn Future<Output = ExternalResult<GeneratedCredential>>>>;

/// Produces a concrete credential for a dynamic credential at request time.
pub trait CredentialGenerator {
    fn generate(&self, context: BTreeMap<String, String>) -> GeneratorFuture;
}

/// The produced type is taken from `context["type"]`, text by default.
fn generated_type(context: &BTreeMap<String, String>) -> ExternalResult<CredentialType> {
    match context.get("type") {
        Some(name) => name
            .parse()
            .map_err(|e: CoreError| anyhow::anyhow!("{e}")),
        None => Ok(CredentialType::Text),
    }
}

/// Reads the credential from `context["path"]`.
pub struct FileGenerator;

impl CredentialGenerator for FileGenerator {
    fn generate(&self, context: BTreeMap<String, String>) -> GeneratorFuture {
        Box::pin(async move {
            let kind = generated_type(&context)?;
            let path = context
                .get("path")
                .ok_or_else(|| anyhow::anyhow!("File generator needs a `path` in its context"))?;
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("Cannot read generated credential {path}"))?;
            Ok(GeneratedCredential { kind, data })
        })
    }
}

/// Runs `context["command"]` in a shell and takes its stdout.
pub struct CommandGenerator {
    timeout: Duration,
}

impl CredentialGenerator for CommandGenerator {
    fn generate(&self, context: BTreeMap<String, String>) -> GeneratorFuture {
        let timeout = self.timeout;
        Box::pin(async move {
            let kind = generated_type(&context)?;
            let command = context
                .get("command")
                .ok_or_else(|| anyhow::anyhow!("Command generator needs a `command` in its context"))?;
            let output = run_command(&["/bin/sh", "-c", command], None, timeout).await?;
            Ok(GeneratedCredential {
                kind,
                data: output.into_bytes(),
            })
        })
    }
}

pub struct GeneratorRegistry {
    generators: Map<String, Box<dyn CredentialGenerator>>,
}

impl GeneratorRegistry {
    pub fn empty() -> Self {
        GeneratorRegistry {
            generators: Map::default(),
        }
    }

    pub fn with_builtins(timeout: Duration) -> Self {
        let mut registry = Self::empty();
        registry.register("file", Box::new(FileGenerator));
        registry.register("command", Box::new(CommandGenerator { timeout }));
        registry
    }

    pub fn register(&mut self, name: &str, generator: Box<dyn CredentialGenerator>) {
        self.generators.insert(name.to_string(), generator);
    }

    pub fn get(&self, name: &str) -> crate::Result<&dyn CredentialGenerator> {
        self.generators
            .get(name)
            .map(|g| g.as_ref())
            .ok_or_else(|| CoreError::configuration(format!("Unknown credential generator {name}")))
    }
}
