use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("assembled file is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("failed to inspect assembled file: {0}")]
    Io(#[from] std::io::Error),
    #[error("assembled file rejected: {0}")]
    Rejected(String),
}

pub trait AssemblyValidator: Send + Sync {
    fn validate(&self, path: &Path, expected_size: u64) -> Result<Vec<String>, ValidationError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SizeValidator;

impl AssemblyValidator for SizeValidator {
    fn validate(&self, path: &Path, expected_size: u64) -> Result<Vec<String>, ValidationError> {
        let actual = std::fs::metadata(path)?.len();
        if actual != expected_size {
            return Err(ValidationError::SizeMismatch {
                expected: expected_size,
                actual,
            });
        }

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| ValidationError::Rejected("artifact has no file name".to_string()))?;
        Ok(vec![name])
    }
}
