use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::error::{StatsError, StatsResult};

pub const N_CLIENTS: &str = "n_clients";
pub const INTENDED_LOAD_TPS: &str = "intended_load_tps";
pub const LOAD_DURATION_SEC: &str = "load_duration_sec";
pub const FAULT_TOLERANCE: &str = "f";

/// Load one client process can generate; bounds the useful client count.
pub const LOAD_PER_CLIENT_TPS: i64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Text,
    Int,
    /// Text, with the legacy `dummy` client normalized to `bc`.
    ClientType,
}

impl ParamKind {
    pub fn parse(self, name: &str, raw: &str) -> StatsResult<ParamValue> {
        match self {
            ParamKind::Text => Ok(ParamValue::Text(raw.to_string())),
            ParamKind::Int => raw.trim().parse::<i64>().map(ParamValue::Int).map_err(|_| {
                StatsError::InvalidParameterValue {
                    name: name.to_string(),
                    value: raw.to_string(),
                }
            }),
            ParamKind::ClientType => Ok(ParamValue::Text(if raw == "dummy" {
                "bc".to_string()
            } else {
                raw.to_string()
            })),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Text(String),
}

impl ParamValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Text(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Int(v) => Value::from(*v),
            ParamValue::Text(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

/// An experiment-level constant encoded in the results directory name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Parameter {
    pub name: &'static str,
    pub short: &'static str,
    pub kind: ParamKind,
    /// Raw default, parsed with `kind` when the identifier omits the key.
    pub default: Option<&'static str>,
}

impl Parameter {
    pub const fn required(name: &'static str, short: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            short,
            kind,
            default: None,
        }
    }

    pub const fn with_default(
        name: &'static str,
        short: &'static str,
        kind: ParamKind,
        default: &'static str,
    ) -> Self {
        Self {
            name,
            short,
            kind,
            default: Some(default),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct ExperimentParameters {
    values: BTreeMap<String, ParamValue>,
}

impl ExperimentParameters {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn int(&self, name: &str) -> StatsResult<i64> {
        match self.values.get(name) {
            Some(ParamValue::Int(v)) => Ok(*v),
            Some(other) => Err(StatsError::InvalidParameterValue {
                name: name.to_string(),
                value: other.to_string(),
            }),
            None => Err(StatsError::MissingParameter {
                name: name.to_string(),
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn set(&mut self, name: &str, value: ParamValue) {
        self.values.insert(name.to_string(), value);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterTable {
    params: Vec<Parameter>,
}

impl ParameterTable {
    pub fn new(params: Vec<Parameter>) -> StatsResult<Self> {
        let mut names = BTreeSet::new();
        let mut shorts = BTreeSet::new();
        for p in &params {
            if !names.insert(p.name) {
                return Err(StatsError::InconsistentRegistry(format!(
                    "duplicate parameter name '{}'",
                    p.name
                )));
            }
            if !shorts.insert(p.short) {
                return Err(StatsError::InconsistentRegistry(format!(
                    "duplicate parameter key '{}'",
                    p.short
                )));
            }
        }
        Ok(Self { params })
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.params.iter().map(|p| p.name)
    }

    fn by_short(&self, short: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.short == short)
    }

    /// Decodes a `key=value,key=value` identifier.
    ///
    /// Segment order does not matter and a repeated key keeps its last value.
    /// `n_clients` is capped at `intended_load_tps / 256 + 1`.
    pub fn decode(&self, identifier: &str) -> StatsResult<ExperimentParameters> {
        let mut supplied: BTreeMap<&'static str, ParamValue> = BTreeMap::new();
        for segment in identifier.split(',') {
            let (key, raw) = match segment.split_once('=') {
                Some((key, raw)) if !raw.contains('=') => (key, raw),
                _ => {
                    return Err(StatsError::MalformedIdentifier {
                        segment: segment.to_string(),
                    })
                }
            };
            let param = self
                .by_short(key)
                .ok_or_else(|| StatsError::UnknownKey {
                    key: key.to_string(),
                })?;
            supplied.insert(param.name, param.kind.parse(param.name, raw)?);
        }

        let mut params = ExperimentParameters::default();
        for p in &self.params {
            let value = match (supplied.remove(p.name), p.default) {
                (Some(value), _) => value,
                (None, Some(default)) => p.kind.parse(p.name, default)?,
                (None, None) => {
                    return Err(StatsError::MissingParameter {
                        name: p.name.to_string(),
                    })
                }
            };
            params.set(p.name, value);
        }
        clamp_clients(&mut params);
        Ok(params)
    }

    /// Canonical identifier in declaration order; the inverse of [`decode`](Self::decode).
    pub fn encode(&self, params: &ExperimentParameters) -> String {
        self.params
            .iter()
            .filter_map(|p| params.get(p.name).map(|v| format!("{}={}", p.short, v)))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn clamp_clients(params: &mut ExperimentParameters) {
    let (Ok(clients), Ok(load)) = (params.int(N_CLIENTS), params.int(INTENDED_LOAD_TPS)) else {
        return;
    };
    let cap = load / LOAD_PER_CLIENT_TPS + 1;
    if clients > cap {
        params.set(N_CLIENTS, ParamValue::Int(cap));
    }
}
