//! Job parameters: typed values, identifying flags and coercion.
//!
//! Two executions whose identifying-parameter sets are equal belong to
//! the same job instance; the coordinator always injects `triggerId`
//! and `timestamp` as identifying parameters so that every trigger
//! produces a distinct instance.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::JobError;

/// Parameter name the coordinator injects for the external correlation id.
pub const TRIGGER_ID_KEY: &str = "triggerId";

/// Parameter name the coordinator injects for the launch timestamp (epoch millis).
pub const TIMESTAMP_KEY: &str = "timestamp";

/// A typed job-parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "UPPERCASE")]
pub enum ParameterValue {
    String(String),
    Long(i64),
    Double(f64),
    Bool(bool),
}

impl ParameterValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::String(_) => "STRING",
            ParameterValue::Long(_) => "LONG",
            ParameterValue::Double(_) => "DOUBLE",
            ParameterValue::Bool(_) => "BOOL",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            ParameterValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            ParameterValue::Double(v) => Some(*v),
            ParameterValue::Long(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::String(s) => write!(f, "{s}"),
            ParameterValue::Long(v) => write!(f, "{v}"),
            ParameterValue::Double(v) => write!(f, "{v}"),
            ParameterValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// Declared type of a recognized parameter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParameterType {
    String,
    Long,
    Double,
    Bool,
}

impl ParameterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "STRING",
            ParameterType::Long => "LONG",
            ParameterType::Double => "DOUBLE",
            ParameterType::Bool => "BOOL",
        }
    }

    /// Coerce a raw string (as received from the trigger API) into a
    /// typed value of this declared type.
    pub fn coerce(&self, key: &str, raw: &str) -> Result<ParameterValue, JobError> {
        match self {
            ParameterType::String => Ok(ParameterValue::String(raw.to_string())),
            ParameterType::Long => raw
                .trim()
                .parse::<i64>()
                .map(ParameterValue::Long)
                .map_err(|_| JobError::ParameterCoercion {
                    key: key.to_string(),
                    expected: "LONG",
                    value: raw.to_string(),
                }),
            ParameterType::Double => raw
                .trim()
                .parse::<f64>()
                .map(ParameterValue::Double)
                .map_err(|_| JobError::ParameterCoercion {
                    key: key.to_string(),
                    expected: "DOUBLE",
                    value: raw.to_string(),
                }),
            ParameterType::Bool => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(ParameterValue::Bool(true)),
                "false" | "0" | "no" => Ok(ParameterValue::Bool(false)),
                _ => Err(JobError::ParameterCoercion {
                    key: key.to_string(),
                    expected: "BOOL",
                    value: raw.to_string(),
                }),
            },
        }
    }
}

/// A recognized parameter key declared on a job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterKey {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParameterType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<ParameterValue>,
    #[serde(default)]
    pub identifying: bool,
}

impl ParameterKey {
    pub fn new(name: impl Into<String>, ty: ParameterType) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
            identifying: false,
        }
    }

    pub fn identifying(mut self) -> Self {
        self.identifying = true;
        self
    }

    pub fn with_default(mut self, default: ParameterValue) -> Self {
        self.default = Some(default);
        self
    }
}

/// A single parameter entry: its value and whether it participates in
/// instance identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: ParameterValue,
    pub identifying: bool,
}

/// The full parameter set of one execution.
///
/// Backed by a `BTreeMap` so iteration order (and therefore the
/// instance key digest) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    params: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParameterValue, identifying: bool) {
        self.params
            .insert(name.into(), JobParameter { value, identifying });
    }

    pub fn with(
        mut self,
        name: impl Into<String>,
        value: ParameterValue,
        identifying: bool,
    ) -> Self {
        self.insert(name, value, identifying);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.params.get(name).map(|p| &p.value)
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ParameterValue::as_str)
    }

    pub fn get_long(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(ParameterValue::as_long)
    }

    pub fn get_double(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ParameterValue::as_double)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(ParameterValue::as_bool)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JobParameter)> {
        self.params.iter()
    }

    /// The externally supplied correlation id, if present.
    pub fn trigger_id(&self) -> Option<&str> {
        self.get_string(TRIGGER_ID_KEY)
    }

    /// Identifying entries only, in key order.
    pub fn identifying(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.params
            .iter()
            .filter(|(_, p)| p.identifying)
            .map(|(k, p)| (k, &p.value))
    }

    /// Deterministic digest of the identifying parameters; two
    /// executions share a job instance exactly when their digests match
    /// for the same job name.
    pub fn instance_key(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in self.identifying() {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.type_name().as_bytes());
            hasher.update(b":");
            hasher.update(value.to_string().as_bytes());
            hasher.update(b";");
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}
