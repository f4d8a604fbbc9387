//! Deployment variants: which tables a results directory holds and how they reduce.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::StatsConfig;
use crate::error::{StatsError, StatsResult};
use crate::fields::{FieldRegistry, FieldSpec, Strategy, ValueKind, OK_FIELD};
use crate::params::{
    ExperimentParameters, ParamKind, Parameter, ParameterTable, FAULT_TOLERANCE, N_CLIENTS,
};
use crate::window::{LoadStartDetector, WindowConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// One table per replica, millisecond timestamps.
    #[default]
    Replica,
    /// One table per load-generating client, second timestamps.
    Client,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Replica => "replica",
            Variant::Client => "client",
        }
    }
}

const AVG_LATENCY: &str = "avg_latency_sec";

const REPLICA_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("ts_ms", "ts", ValueKind::Int, Strategy::None),
    FieldSpec::new("received_txs_count", "nrReceived", ValueKind::Int, Strategy::Sum),
    FieldSpec::new("observed_load_tps", "loadtps", ValueKind::Float, Strategy::Average),
    FieldSpec::new("delivered_txs_count", "nrDelivered", ValueKind::Int, Strategy::Sum),
    FieldSpec::new("tps", "tps", ValueKind::Float, Strategy::Average),
    FieldSpec::new(AVG_LATENCY, "avgLatency", ValueKind::Float, Strategy::Average),
    FieldSpec::new("mem_sys", "memSys", ValueKind::Int, Strategy::Last),
    FieldSpec::new("mem_stack_in_use", "memStackInUse", ValueKind::Int, Strategy::Last),
    FieldSpec::new("mem_heap_alloc", "memHeapAlloc", ValueKind::Int, Strategy::Last),
    FieldSpec::new("mem_total_alloc", "memTotalAlloc", ValueKind::Int, Strategy::Last),
    FieldSpec::new("mem_malloc_count", "memMallocs", ValueKind::Int, Strategy::Last),
    FieldSpec::new("mem_free_count", "memFrees", ValueKind::Int, Strategy::Last),
    FieldSpec::new("mem_pause_total_ns", "memPauseTotalNs", ValueKind::Int, Strategy::Last),
    FieldSpec::new("mem_pause_count", "memNumGC", ValueKind::Int, Strategy::Last),
    FieldSpec::new("mempool_batch_count", "mempoolNewBatches", ValueKind::Int, Strategy::Sum),
    FieldSpec::new("ag_round_deliver_count", "agRoundDelivers", ValueKind::Int, Strategy::Sum),
    FieldSpec::new(
        "ag_round_false_deliver_count",
        "agRoundFalseDelivers",
        ValueKind::Int,
        Strategy::Sum,
    ),
    FieldSpec::new("bc_deliver_count", "bcDelivers", ValueKind::Int, Strategy::Sum),
    FieldSpec::new("tc_queue_size", "threshQueueSize", ValueKind::Int, Strategy::None),
];

// Per-replica averages of offered load and point-in-time memory counters add
// up across replicas.
const REPLICA_COMBINED_OVERRIDES: &[(&str, Strategy)] = &[
    ("observed_load_tps", Strategy::Sum),
    ("mem_sys", Strategy::Sum),
    ("mem_stack_in_use", Strategy::Sum),
    ("mem_heap_alloc", Strategy::Sum),
    ("mem_total_alloc", Strategy::Sum),
    ("mem_malloc_count", Strategy::Sum),
    ("mem_free_count", Strategy::Sum),
    ("mem_pause_total_ns", Strategy::Sum),
    ("mem_pause_count", Strategy::Sum),
];

const REPLICA_COLUMNS: &[&str] = &[
    "replica_idx",
    "protocol",
    "f",
    "intended_load_tps",
    "batch_size",
    "observed_load_tps",
    "tps",
    AVG_LATENCY,
    "mem_sys",
    "mem_stack_in_use",
    "mem_heap_alloc",
    "mem_total_alloc",
    "mem_malloc_count",
    "mem_free_count",
    "mem_pause_total_ns",
    "mem_pause_count",
    OK_FIELD,
];

const CLIENT_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("ts_s", "ts", ValueKind::Float, Strategy::None),
    FieldSpec::new("delivered_txs_count", "nrDelivered", ValueKind::Int, Strategy::Average),
    FieldSpec::new("tps", "tps", ValueKind::Float, Strategy::Average),
    FieldSpec::new(AVG_LATENCY, "avgLatency", ValueKind::Float, Strategy::Average),
];

// Each client sees only its own share of the throughput.
const CLIENT_COMBINED_OVERRIDES: &[(&str, Strategy)] = &[
    ("delivered_txs_count", Strategy::Sum),
    ("tps", Strategy::Sum),
];

const CLIENT_COLUMNS: &[&str] = &[
    "protocol",
    "client_type",
    "f",
    "intended_load_tps",
    "batch_size",
    "runno",
    "client_idx",
    "tps",
    AVG_LATENCY,
    OK_FIELD,
];

fn parameters(variant: Variant) -> Vec<Parameter> {
    let cooldown = match variant {
        Variant::Replica => "30",
        Variant::Client => "45",
    };
    let mut params = vec![
        Parameter::required("protocol", "p", ParamKind::Text),
        Parameter::required(FAULT_TOLERANCE, "f", ParamKind::Int),
        Parameter::with_default(N_CLIENTS, "c", ParamKind::Int, "24"),
        Parameter::required("intended_load_tps", "l", ParamKind::Int),
        Parameter::with_default("cooldown_time_sec", "C", ParamKind::Int, cooldown),
        Parameter::required("batch_size", "b", ParamKind::Int),
        Parameter::with_default("stat_period_sec", "P", ParamKind::Int, "1"),
    ];
    if variant == Variant::Client {
        params.push(Parameter::with_default("burst_size", "B", ParamKind::Int, "1024"));
    }
    params.extend([
        Parameter::with_default("load_duration_sec", "T", ParamKind::Int, "120"),
        Parameter::with_default("req_size", "s", ParamKind::Int, "256"),
        Parameter::with_default("runno", "i", ParamKind::Int, "0"),
        Parameter::with_default("client_type", "-client-type", ParamKind::ClientType, "bc"),
    ]);
    params
}

/// Everything needed to turn one results directory into report rows.
#[derive(Debug, Clone)]
pub struct Profile {
    pub variant: Variant,
    pub parameters: ParameterTable,
    pub participant: FieldRegistry,
    pub combined: FieldRegistry,
    pub window: WindowConfig,
    pub load_start: Option<LoadStartDetector>,
    pub columns: Vec<&'static str>,
}

impl Profile {
    pub fn for_variant(variant: Variant) -> StatsResult<Self> {
        let (fields, timestamp, overrides, columns, window, load_start) = match variant {
            Variant::Replica => (
                REPLICA_FIELDS,
                "ts_ms",
                REPLICA_COMBINED_OVERRIDES,
                REPLICA_COLUMNS,
                WindowConfig::new(1000),
                Some(LoadStartDetector::default()),
            ),
            Variant::Client => (
                CLIENT_FIELDS,
                "ts_s",
                CLIENT_COMBINED_OVERRIDES,
                CLIENT_COLUMNS,
                WindowConfig::new(1),
                None,
            ),
        };
        let participant = FieldRegistry::new(fields.to_vec())?
            .with_timestamp(timestamp)?
            .with_validity_field(AVG_LATENCY)?;
        let combined = participant
            .derive()
            .overrides(overrides)
            .with_field(FieldSpec::new(OK_FIELD, OK_FIELD, ValueKind::Bool, Strategy::And))
            .build()?;
        let profile = Self {
            variant,
            parameters: ParameterTable::new(parameters(variant))?,
            participant,
            combined,
            window,
            load_start,
            columns: columns.to_vec(),
        };
        profile.validate()?;
        Ok(profile)
    }

    pub fn replica() -> StatsResult<Self> {
        Self::for_variant(Variant::Replica)
    }

    pub fn client() -> StatsResult<Self> {
        Self::for_variant(Variant::Client)
    }

    /// Built-in profile for the configured variant with the config's knobs applied.
    pub fn from_config(config: &StatsConfig) -> StatsResult<Self> {
        let mut profile = Self::for_variant(config.variant)?;
        if let Some(pct) = config.cut_start_percent {
            profile.window.cut_start_percent = pct;
        }
        if let Some(pct) = config.cut_end_percent {
            profile.window.cut_end_percent = pct;
        }
        if let Some(load_start) = &config.load_start {
            profile.load_start = if load_start.enabled {
                let mut detector = profile.load_start.take().unwrap_or_default();
                if let Some(column) = &load_start.column {
                    detector.column = column.clone();
                }
                if let Some(count) = load_start.canary_count {
                    detector.canary_count = count;
                }
                if let Some(count) = load_start.idle_count {
                    detector.idle_count = count;
                }
                Some(detector)
            } else {
                None
            };
        }
        profile.validate()?;
        Ok(profile)
    }

    pub fn index_column(&self) -> &'static str {
        match self.variant {
            Variant::Replica => "replica_idx",
            Variant::Client => "client_idx",
        }
    }

    pub fn participant_file(&self, index: usize) -> String {
        format!("{}-{}.csv", self.variant.as_str(), index)
    }

    /// Replicas: `3f + 1`. Clients: the (already capped) client count.
    pub fn participant_count(&self, params: &ExperimentParameters) -> StatsResult<usize> {
        let (name, raw, count) = match self.variant {
            Variant::Replica => {
                let f = params.int(FAULT_TOLERANCE)?;
                let count = f.checked_mul(3).and_then(|n| n.checked_add(1));
                (FAULT_TOLERANCE, f, count)
            }
            Variant::Client => {
                let clients = params.int(N_CLIENTS)?;
                (N_CLIENTS, clients, Some(clients))
            }
        };
        count
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| StatsError::InvalidParameterValue {
                name: name.to_string(),
                value: raw.to_string(),
            })
    }

    pub fn timestamp_column(&self) -> StatsResult<&'static str> {
        self.participant
            .timestamp()
            .map(|spec| spec.source)
            .ok_or_else(|| StatsError::InconsistentRegistry("no timestamp field".into()))
    }

    /// Names must not collide across parameters, fields, the index column and
    /// `ok`, and every report column must be one of them.
    pub fn validate(&self) -> StatsResult<()> {
        self.window.validate()?;
        let mut known = BTreeSet::new();
        let names = self
            .parameters
            .names()
            .chain(self.participant.fields().iter().map(|f| f.name))
            .chain([self.index_column(), OK_FIELD]);
        for name in names {
            if !known.insert(name) {
                return Err(StatsError::InconsistentRegistry(format!(
                    "name '{}' is declared twice",
                    name
                )));
            }
        }
        if let Some(unknown) = self.columns.iter().find(|c| !known.contains(*c)) {
            return Err(StatsError::InconsistentRegistry(format!(
                "report column '{}' is neither a parameter nor a field",
                unknown
            )));
        }
        Ok(())
    }
}
