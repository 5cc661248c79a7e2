use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::write::GzEncoder;

use crate::common::error::CoreError;
use crate::common::fsutils::{PRIVATE_FILE_MODE, atomic_write};
use crate::credentials::Credential;

#[derive(Debug, Clone)]
pub struct SaveOptions {
    pub permissions: u32,
    pub backup: bool,
    pub compress: bool,
    /// Wraps the data before writing; `{}` marks where it goes, otherwise the pattern is a prefix
    pub data_pattern: Option<String>,
    pub overwrite: bool,
    pub continue_if_no_path: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        SaveOptions {
            permissions: PRIVATE_FILE_MODE,
            backup: false,
            compress: false,
            data_pattern: None,
            overwrite: true,
            continue_if_no_path: false,
        }
    }
}

/// Gzip followed by standard base64.
pub fn compress_credential(data: &[u8]) -> crate::Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(STANDARD.encode(encoder.finish()?))
}

fn apply_pattern(pattern: &str, data: &[u8]) -> Vec<u8> {
    match pattern.split_once("{}") {
        Some((before, after)) => [before.as_bytes(), data, after.as_bytes()].concat(),
        None => [pattern.as_bytes(), data].concat(),
    }
}

impl Credential {
    /// Writes the credential data atomically to `path` (or to its own path).
    ///
    /// Returns the written path, `None` when there was no path and `continue_if_no_path` is set.
    pub fn save_to_file(
        &self,
        path: Option<&Path>,
        options: &SaveOptions,
    ) -> crate::Result<Option<PathBuf>> {
        let Some(target) = path.map(Path::to_path_buf).or_else(|| self.path.clone()) else {
            if options.continue_if_no_path {
                return Ok(None);
            }
            return Err(CoreError::credential("No path to save the credential to"));
        };
        let data = self.require_data()?;
        if !options.overwrite && target.exists() {
            log::debug!("Keeping existing credential file {}", target.display());
            return Ok(Some(target));
        }

        let data = if options.compress {
            compress_credential(data)?.into_bytes()
        } else {
            data.to_vec()
        };
        let data = match &options.data_pattern {
            Some(pattern) => apply_pattern(pattern, &data),
            None => data,
        };
        atomic_write(&target, &data, options.permissions, options.backup)?;
        Ok(Some(target))
    }

    /// `credential_<purpose>_<basename>.<ext>` beside the credential's own path.
    pub fn standard_path(&self) -> Option<PathBuf> {
        let path = self.path.as_ref()?;
        let basename = path.file_stem()?.to_string_lossy();
        let file_name = format!(
            "credential_{}_{basename}.{}",
            self.purpose.alias(),
            self.extension()
        );
        Some(match path.parent() {
            Some(directory) => directory.join(file_name),
            None => PathBuf::from(file_name),
        })
    }
}
