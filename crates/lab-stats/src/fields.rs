use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::error::{StatsError, StatsResult};

/// Output name of the derived validity column.
pub const OK_FIELD: &str = "ok";

/// How a sequence of values for one field collapses into a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Mean of the non-negative, defined values; remembers whether any value was rejected.
    Average,
    Sum,
    Last,
    And,
    /// Used only to order or filter samples; never reduced.
    None,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::Average => "average",
            Strategy::Sum => "sum",
            Strategy::Last => "last",
            Strategy::And => "and",
            Strategy::None => "none",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Int,
    Float,
    Bool,
}

impl ValueKind {
    pub fn parse(self, column: &str, raw: &str) -> StatsResult<StatValue> {
        let raw = raw.trim();
        let invalid = || StatsError::InvalidValue {
            column: column.to_string(),
            value: raw.to_string(),
        };
        match self {
            ValueKind::Int => raw.parse::<i64>().map(StatValue::Int).map_err(|_| invalid()),
            ValueKind::Float => raw
                .parse::<f64>()
                .map(StatValue::Float)
                .map_err(|_| invalid()),
            ValueKind::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(StatValue::Bool(true)),
                "false" | "0" => Ok(StatValue::Bool(false)),
                _ => Err(invalid()),
            },
        }
    }

    pub fn zero(self) -> StatValue {
        match self {
            ValueKind::Int => StatValue::Int(0),
            ValueKind::Float => StatValue::Float(0.0),
            ValueKind::Bool => StatValue::Bool(false),
        }
    }
}

/// A parsed or finalized metric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatValue {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl StatValue {
    pub fn as_f64(self) -> f64 {
        match self {
            StatValue::Int(v) => v as f64,
            StatValue::Float(v) => v,
            StatValue::Bool(v) => {
                if v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    pub fn as_bool(self) -> bool {
        match self {
            StatValue::Int(v) => v != 0,
            StatValue::Float(v) => v != 0.0 && !v.is_nan(),
            StatValue::Bool(v) => v,
        }
    }

    pub fn is_nan(self) -> bool {
        matches!(self, StatValue::Float(v) if v.is_nan())
    }

    /// Integer plus integer stays exact; anything else widens to float.
    pub fn add(self, other: StatValue) -> StatValue {
        match (self, other) {
            (StatValue::Int(a), StatValue::Int(b)) => StatValue::Int(a.saturating_add(b)),
            (a, b) => StatValue::Float(a.as_f64() + b.as_f64()),
        }
    }

    pub fn to_json(self) -> Value {
        match self {
            StatValue::Int(v) => Value::from(v),
            StatValue::Float(v) => serde_json::Number::from_f64(v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            StatValue::Bool(v) => Value::Bool(v),
        }
    }
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            StatValue::Int(v) => write!(f, "{}", v),
            StatValue::Float(v) if v.is_nan() => f.write_str("nan"),
            StatValue::Float(v) if v.is_infinite() => {
                f.write_str(if v > 0.0 { "inf" } else { "-inf" })
            }
            StatValue::Float(v) if v.fract() == 0.0 && v.abs() < 1e16 => write!(f, "{:.1}", v),
            StatValue::Float(v) => write!(f, "{}", v),
            StatValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

/// Describes one metric column: where it comes from, how it parses and how it reduces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: &'static str,
    pub source: &'static str,
    pub kind: ValueKind,
    pub strategy: Strategy,
}

impl FieldSpec {
    pub const fn new(
        name: &'static str,
        source: &'static str,
        kind: ValueKind,
        strategy: Strategy,
    ) -> Self {
        Self {
            name,
            source,
            kind,
            strategy,
        }
    }

    pub fn is_reduced(&self) -> bool {
        self.strategy != Strategy::None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldRegistry {
    fields: Vec<FieldSpec>,
    timestamp: Option<&'static str>,
    validity_field: Option<&'static str>,
}

impl FieldRegistry {
    pub fn new(fields: Vec<FieldSpec>) -> StatsResult<Self> {
        let mut names = BTreeSet::new();
        let mut sources = BTreeSet::new();
        for field in &fields {
            if !names.insert(field.name) {
                return Err(StatsError::InconsistentRegistry(format!(
                    "duplicate field name '{}'",
                    field.name
                )));
            }
            if !sources.insert(field.source) {
                return Err(StatsError::InconsistentRegistry(format!(
                    "duplicate source column '{}'",
                    field.source
                )));
            }
        }
        Ok(Self {
            fields,
            timestamp: None,
            validity_field: None,
        })
    }

    /// Marks the field whose samples carry the time axis.
    pub fn with_timestamp(mut self, name: &'static str) -> StatsResult<Self> {
        match self.get(name) {
            Some(spec) if spec.strategy == Strategy::None => {
                self.timestamp = Some(name);
                Ok(self)
            }
            Some(_) => Err(StatsError::InconsistentRegistry(format!(
                "timestamp field '{}' must not be reduced",
                name
            ))),
            None => Err(StatsError::InconsistentRegistry(format!(
                "unknown timestamp field '{}'",
                name
            ))),
        }
    }

    /// Marks the averaged field whose validity becomes the derived `ok` column.
    pub fn with_validity_field(mut self, name: &'static str) -> StatsResult<Self> {
        match self.get(name) {
            Some(spec) if spec.strategy == Strategy::Average => {
                self.validity_field = Some(name);
                Ok(self)
            }
            Some(spec) => Err(StatsError::InconsistentRegistry(format!(
                "validity field '{}' uses strategy {}, expected average",
                name, spec.strategy
            ))),
            None => Err(StatsError::InconsistentRegistry(format!(
                "unknown validity field '{}'",
                name
            ))),
        }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn reduced_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.is_reduced())
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn timestamp(&self) -> Option<&FieldSpec> {
        self.timestamp.and_then(|name| self.get(name))
    }

    pub fn validity_field(&self) -> Option<&'static str> {
        self.validity_field
    }

    /// Names present in every record this registry produces.
    pub fn output_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.reduced_fields().map(|f| f.name).collect();
        if self.validity_field.is_some() && !names.contains(&OK_FIELD) {
            names.push(OK_FIELD);
        }
        names
    }

    /// Starts the registry used to fold finalized per-participant records.
    pub fn derive(&self) -> RegistryBuilder {
        RegistryBuilder::from_base(self)
    }
}

/// Builds a combining registry from a per-participant one.
///
/// Non-reduced fields are dropped and every source is re-keyed to the output
/// name, since the input records are already finalized summaries.
#[derive(Debug, Clone)]
pub struct RegistryBuilder {
    fields: Vec<FieldSpec>,
    overrides: Vec<(&'static str, Strategy)>,
}

impl RegistryBuilder {
    pub fn from_base(base: &FieldRegistry) -> Self {
        let fields = base
            .reduced_fields()
            .map(|f| FieldSpec::new(f.name, f.name, f.kind, f.strategy))
            .collect();
        Self {
            fields,
            overrides: Vec::new(),
        }
    }

    pub fn override_strategy(mut self, field: &'static str, strategy: Strategy) -> Self {
        self.overrides.push((field, strategy));
        self
    }

    pub fn overrides(mut self, list: &[(&'static str, Strategy)]) -> Self {
        self.overrides.extend_from_slice(list);
        self
    }

    pub fn with_field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn build(mut self) -> StatsResult<FieldRegistry> {
        for (name, strategy) in &self.overrides {
            let field = self
                .fields
                .iter_mut()
                .find(|f| f.name == *name)
                .ok_or_else(|| {
                    StatsError::InconsistentRegistry(format!(
                        "override references unknown field '{}'",
                        name
                    ))
                })?;
            field.strategy = *strategy;
        }
        FieldRegistry::new(self.fields)
    }
}
