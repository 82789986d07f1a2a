// JSON passthrough converter: a `.json` drop already is the canonical record

use std::fs;
use std::path::Path;

use relay_core::domain::CanonicalRecord;
use relay_core::port::converter::matches_extension;
use relay_core::port::{ConversionOutcome, ConvertError, Converter};

pub const JSON_CONVERTER_NAME: &str = "json";

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPassthroughConverter;

impl JsonPassthroughConverter {
    pub fn new() -> Self {
        Self
    }
}

impl Converter for JsonPassthroughConverter {
    fn name(&self) -> &str {
        JSON_CONVERTER_NAME
    }

    fn matches(&self, path: &Path) -> bool {
        matches_extension(path, &["json"])
    }

    fn convert(&self, path: &Path) -> Result<ConversionOutcome, ConvertError> {
        let bytes = fs::read(path)?;
        // Writers create the file before filling it
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(ConversionOutcome::Suspended("file is empty".to_string()));
        }
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(ConversionOutcome::Success(CanonicalRecord::new(value))),
            Err(e) => Ok(ConversionOutcome::Failed(format!("invalid JSON: {}", e))),
        }
    }
}
