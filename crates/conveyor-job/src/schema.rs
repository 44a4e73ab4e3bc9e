//! Fixed-width record schemas.
//!
//! File layouts exchanged with the batch gateway are described as
//! values: an ordered list of field descriptors held in a registry
//! keyed by schema name. The codec below consumes the descriptor list;
//! step bodies look schemas up by name when encoding outbound files or
//! decoding inbound ones.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Which side of the field the payload sits on; the other side is
/// filled with the padding character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    Left,
    Right,
}

/// Lexical class of a field, used when decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldFormat {
    Text,
    Numeric,
}

/// One column of a fixed-width record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub length: usize,
    pub padding: char,
    pub align: Alignment,
    pub format: FieldFormat,
}

impl FieldSpec {
    pub fn text(name: impl Into<String>, length: usize) -> Self {
        Self {
            name: name.into(),
            length,
            padding: ' ',
            align: Alignment::Left,
            format: FieldFormat::Text,
        }
    }

    /// Numeric fields are conventionally right-aligned and zero-padded.
    pub fn numeric(name: impl Into<String>, length: usize) -> Self {
        Self {
            name: name.into(),
            length,
            padding: '0',
            align: Alignment::Right,
            format: FieldFormat::Numeric,
        }
    }
}

/// An ordered field list describing one record layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSchema {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

impl RecordSchema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Total line width of a record under this schema.
    pub fn record_length(&self) -> usize {
        self.fields.iter().map(|f| f.length).sum()
    }

    /// Render one record. Every field value must fit its declared
    /// length; overflow is an error rather than silent truncation.
    pub fn encode(&self, values: &BTreeMap<String, String>) -> Result<String, JobError> {
        let mut line = String::with_capacity(self.record_length());
        for field in &self.fields {
            let raw = values.get(&field.name).map(String::as_str).unwrap_or("");
            if raw.chars().count() > field.length {
                return Err(JobError::schema(
                    &self.name,
                    format!(
                        "value '{raw}' overflows field '{}' (len {})",
                        field.name, field.length
                    ),
                ));
            }
            let pad_len = field.length - raw.chars().count();
            let padding: String = std::iter::repeat(field.padding).take(pad_len).collect();
            match field.align {
                Alignment::Left => {
                    line.push_str(raw);
                    line.push_str(&padding);
                }
                Alignment::Right => {
                    line.push_str(&padding);
                    line.push_str(raw);
                }
            }
        }
        Ok(line)
    }

    /// Slice one fixed-width line back into named field values, with
    /// padding stripped.
    pub fn decode(&self, line: &str) -> Result<BTreeMap<String, String>, JobError> {
        let chars: Vec<char> = line.chars().collect();
        if chars.len() != self.record_length() {
            return Err(JobError::schema(
                &self.name,
                format!(
                    "line length {} does not match schema length {}",
                    chars.len(),
                    self.record_length()
                ),
            ));
        }

        let mut values = BTreeMap::new();
        let mut offset = 0;
        for field in &self.fields {
            let slice: String = chars[offset..offset + field.length].iter().collect();
            offset += field.length;
            let value = match field.align {
                Alignment::Left => slice.trim_end_matches(field.padding),
                Alignment::Right => {
                    let trimmed = slice.trim_start_matches(field.padding);
                    // An all-padding numeric field is a zero, not blank.
                    if trimmed.is_empty() && field.format == FieldFormat::Numeric {
                        "0"
                    } else {
                        trimmed
                    }
                }
            };
            if field.format == FieldFormat::Numeric
                && !value.is_empty()
                && value.parse::<f64>().is_err()
            {
                return Err(JobError::schema(
                    &self.name,
                    format!("field '{}' is not numeric: '{value}'", field.name),
                ));
            }
            values.insert(field.name.clone(), value.to_string());
        }
        Ok(values)
    }
}

/// Registry of record schemas, keyed by schema name. Populated during
/// initialization and read-only afterwards.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, RecordSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: RecordSchema) -> Result<(), JobError> {
        if schema.fields.is_empty() {
            return Err(JobError::schema(&schema.name, "schema has no fields"));
        }
        if self.schemas.contains_key(&schema.name) {
            return Err(JobError::schema(&schema.name, "schema already registered"));
        }
        self.schemas.insert(schema.name.clone(), schema);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&RecordSchema> {
        self.schemas.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
