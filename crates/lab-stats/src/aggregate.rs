//! Temporal reduction of one participant's samples and the cross-participant
//! combination of the resulting summaries.
//!
//! Both passes are pure folds: every accumulator is a value that each step
//! consumes and returns.

use std::collections::BTreeMap;

use crate::error::{StatsError, StatsResult};
use crate::fields::{FieldRegistry, FieldSpec, StatValue, Strategy, OK_FIELD};
use crate::table::RawSample;

/// Running mean that rejects negative and NaN inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AverageAcc {
    sum: f64,
    count: u64,
    valid: bool,
}

impl Default for AverageAcc {
    fn default() -> Self {
        Self {
            sum: 0.0,
            count: 0,
            valid: true,
        }
    }
}

impl AverageAcc {
    pub fn update(self, x: f64) -> Self {
        if x < 0.0 || x.is_nan() {
            return Self {
                valid: false,
                ..self
            };
        }
        Self {
            sum: self.sum + x,
            count: self.count + 1,
            valid: self.valid,
        }
    }

    pub fn finalize(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        self.sum / self.count as f64
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Accumulator {
    Average(AverageAcc),
    Sum(StatValue),
    Last(Option<StatValue>),
    And(Option<bool>),
}

impl Accumulator {
    /// Initial state for a field, or `None` for fields that are never reduced.
    pub fn seed(spec: &FieldSpec) -> Option<Self> {
        match spec.strategy {
            Strategy::Average => Some(Accumulator::Average(AverageAcc::default())),
            Strategy::Sum => Some(Accumulator::Sum(spec.kind.zero())),
            Strategy::Last => Some(Accumulator::Last(None)),
            Strategy::And => Some(Accumulator::And(None)),
            Strategy::None => None,
        }
    }

    pub fn fold(self, value: StatValue) -> Self {
        match self {
            Accumulator::Average(acc) => Accumulator::Average(acc.update(value.as_f64())),
            Accumulator::Sum(acc) => Accumulator::Sum(acc.add(value)),
            Accumulator::Last(_) => Accumulator::Last(Some(value)),
            Accumulator::And(acc) => {
                let v = value.as_bool();
                Accumulator::And(Some(acc.map_or(v, |a| a && v)))
            }
        }
    }

    pub fn finalize(self) -> StatValue {
        match self {
            Accumulator::Average(acc) => StatValue::Float(acc.finalize()),
            Accumulator::Sum(acc) => acc,
            Accumulator::Last(acc) => acc.unwrap_or(StatValue::Float(f64::NAN)),
            Accumulator::And(acc) => StatValue::Bool(acc.unwrap_or(false)),
        }
    }
}

/// Finalized values of one participant or of a whole experiment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SummaryRecord {
    values: BTreeMap<String, StatValue>,
    samples: usize,
}

impl SummaryRecord {
    pub fn from_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, StatValue)>,
        K: Into<String>,
    {
        Self {
            values: values.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            samples: 0,
        }
    }

    pub fn get(&self, name: &str) -> Option<StatValue> {
        self.values.get(name).copied()
    }

    pub fn ok(&self) -> bool {
        self.get(OK_FIELD).map(StatValue::as_bool).unwrap_or(false)
    }

    /// Number of samples (or participant records) folded into this record.
    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, StatValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

struct Fold<'r> {
    slots: Vec<(&'r FieldSpec, Accumulator)>,
    folded: usize,
}

impl<'r> Fold<'r> {
    fn new(registry: &'r FieldRegistry) -> Self {
        let slots = registry
            .reduced_fields()
            .filter_map(|spec| Accumulator::seed(spec).map(|acc| (spec, acc)))
            .collect();
        Self { slots, folded: 0 }
    }

    fn finish(self, validity_field: Option<&str>) -> SummaryRecord {
        let mut values = BTreeMap::new();
        let mut ok = None;
        for (spec, acc) in self.slots {
            if let (Some(name), Accumulator::Average(avg)) = (validity_field, &acc) {
                if spec.name == name {
                    ok = Some(avg.is_valid() && avg.count() > 0);
                }
            }
            values.insert(spec.name.to_string(), acc.finalize());
        }
        if let Some(ok) = ok {
            values.insert(OK_FIELD.to_string(), StatValue::Bool(ok));
        }
        SummaryRecord {
            values,
            samples: self.folded,
        }
    }
}

/// Reduces one participant's (already windowed) samples into a summary record.
///
/// Every declared column must be present in every sample; undeclared columns
/// are ignored. An empty input is not an error: averages finalize to NaN and
/// `ok` is false.
pub fn reduce<'a, I>(samples: I, registry: &FieldRegistry) -> StatsResult<SummaryRecord>
where
    I: IntoIterator<Item = &'a RawSample>,
{
    let mut fold = Fold::new(registry);
    for sample in samples {
        if let Some(missing) = registry
            .fields()
            .iter()
            .find(|spec| sample.get(spec.source).is_none())
        {
            return Err(StatsError::MissingColumn {
                column: missing.source.to_string(),
                row: sample.line(),
            });
        }
        for (spec, acc) in fold.slots.iter_mut() {
            let raw = sample.get(spec.source).unwrap_or_default();
            let value = spec.kind.parse(spec.source, raw)?;
            *acc = acc.fold(value);
        }
        fold.folded += 1;
    }
    Ok(fold.finish(registry.validity_field()))
}

/// Folds finalized per-participant records with the combining registry.
pub fn combine<'a, I>(records: I, registry: &FieldRegistry) -> StatsResult<SummaryRecord>
where
    I: IntoIterator<Item = &'a SummaryRecord>,
{
    let mut fold = Fold::new(registry);
    for record in records {
        for (spec, acc) in fold.slots.iter_mut() {
            let value = record
                .get(spec.source)
                .ok_or_else(|| StatsError::MissingField {
                    field: spec.source.to_string(),
                })?;
            *acc = acc.fold(value);
        }
        fold.folded += 1;
    }
    Ok(fold.finish(registry.validity_field()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::ValueKind;

    fn participant_registry() -> FieldRegistry {
        FieldRegistry::new(vec![
            FieldSpec::new("ts_s", "ts", ValueKind::Float, Strategy::None),
            FieldSpec::new("received_txs_count", "nrReceived", ValueKind::Int, Strategy::Sum),
            FieldSpec::new("tps", "tps", ValueKind::Float, Strategy::Average),
            FieldSpec::new("avg_latency_sec", "avgLatency", ValueKind::Float, Strategy::Average),
            FieldSpec::new("mem_sys", "memSys", ValueKind::Int, Strategy::Last),
        ])
        .expect("registry")
        .with_timestamp("ts_s")
        .expect("timestamp")
        .with_validity_field("avg_latency_sec")
        .expect("validity")
    }

    fn combined_registry() -> FieldRegistry {
        participant_registry()
            .derive()
            .overrides(&[("tps", Strategy::Sum), ("mem_sys", Strategy::Sum)])
            .with_field(FieldSpec::new(OK_FIELD, OK_FIELD, ValueKind::Bool, Strategy::And))
            .build()
            .expect("combined")
    }

    fn sample(line: usize, ts: &str, received: &str, tps: &str, latency: &str, mem: &str) -> RawSample {
        RawSample::from_pairs(
            line,
            [
                ("ts", ts),
                ("nrReceived", received),
                ("tps", tps),
                ("avgLatency", latency),
                ("memSys", mem),
            ],
        )
    }

    #[test]
    fn average_excludes_invalid_values_and_stays_invalid() {
        let acc = AverageAcc::default()
            .update(2.0)
            .update(-1.0)
            .update(f64::NAN)
            .update(4.0);
        assert_eq!(acc.count(), 2);
        assert_eq!(acc.finalize(), 3.0);
        assert!(!acc.is_valid());
    }

    #[test]
    fn average_of_nothing_is_nan() {
        let acc = AverageAcc::default();
        assert!(acc.finalize().is_nan());
        assert!(acc.is_valid());
    }

    #[test]
    fn integer_sum_is_exact() {
        let spec = FieldSpec::new("n", "n", ValueKind::Int, Strategy::Sum);
        let seed = Accumulator::seed(&spec).expect("sum seeds");
        let total = (0..1000).fold(seed, |acc, _| acc.fold(StatValue::Int(7)));
        assert_eq!(total.finalize(), StatValue::Int(7000));
    }

    #[test]
    fn last_value_overwrites_and_and_conjoins() {
        let last = Accumulator::Last(None)
            .fold(StatValue::Int(1))
            .fold(StatValue::Int(9));
        assert_eq!(last.finalize(), StatValue::Int(9));

        let and = Accumulator::And(None)
            .fold(StatValue::Bool(true))
            .fold(StatValue::Bool(false))
            .fold(StatValue::Bool(true));
        assert_eq!(and.finalize(), StatValue::Bool(false));
        assert!(Accumulator::seed(&FieldSpec::new("t", "t", ValueKind::Int, Strategy::None)).is_none());
    }

    #[test]
    fn reduce_applies_each_strategy() {
        let samples = vec![
            sample(2, "1.0", "3", "100", "0.01", "10"),
            sample(3, "2.0", "4", "200", "0.03", "20"),
        ];
        let record = reduce(&samples, &participant_registry()).expect("reduce");
        assert_eq!(record.get("received_txs_count"), Some(StatValue::Int(7)));
        assert_eq!(record.get("tps"), Some(StatValue::Float(150.0)));
        assert_eq!(record.get("mem_sys"), Some(StatValue::Int(20)));
        assert!(record.get("ts_s").is_none(), "timestamp is never reduced");
        assert!(record.ok());
        assert_eq!(record.samples(), 2);
    }

    #[test]
    fn negative_latency_clears_ok_but_average_uses_valid_samples() {
        let samples = vec![
            sample(2, "1.0", "1", "100", "0.02", "1"),
            sample(3, "2.0", "1", "100", "-1", "1"),
            sample(4, "3.0", "1", "100", "0.04", "1"),
        ];
        let record = reduce(&samples, &participant_registry()).expect("reduce");
        assert!(!record.ok());
        let latency = record.get("avg_latency_sec").expect("latency").as_f64();
        assert!((latency - 0.03).abs() < 1e-12, "latency {}", latency);
    }

    #[test]
    fn reduce_of_empty_window_is_nan_and_not_ok() {
        let record = reduce(std::iter::empty(), &participant_registry()).expect("empty must not fail");
        assert!(record.get("tps").expect("tps").is_nan());
        assert!(record.get("avg_latency_sec").expect("latency").is_nan());
        assert!(record.get("mem_sys").expect("mem").is_nan());
        assert_eq!(record.get("received_txs_count"), Some(StatValue::Int(0)));
        assert!(!record.ok());
        assert_eq!(record.samples(), 0);
    }

    #[test]
    fn unknown_columns_are_ignored_but_missing_columns_fail() {
        let mut extra = sample(2, "1.0", "1", "100", "0.01", "5");
        extra.insert("somethingElse", "abc");
        assert!(reduce([&extra], &participant_registry()).is_ok());

        let missing = RawSample::from_pairs(
            7,
            [("ts", "1.0"), ("nrReceived", "1"), ("tps", "100"), ("avgLatency", "0.01")],
        );
        let err = reduce([&missing], &participant_registry()).expect_err("memSys missing");
        match err {
            StatsError::MissingColumn { column, row } => {
                assert_eq!(column, "memSys");
                assert_eq!(row, 7);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn missing_timestamp_column_is_fatal() {
        let no_ts = RawSample::from_pairs(
            2,
            [("nrReceived", "1"), ("tps", "100"), ("avgLatency", "0.01"), ("memSys", "1")],
        );
        let err = reduce([&no_ts], &participant_registry()).expect_err("ts missing");
        assert!(matches!(err, StatsError::MissingColumn { ref column, .. } if column == "ts"));
    }

    #[test]
    fn unparsable_value_is_reported() {
        let bad = sample(5, "1.0", "x", "100", "0.01", "1");
        let err = reduce([&bad], &participant_registry()).expect_err("bad int");
        assert!(matches!(err, StatsError::InvalidValue { ref column, .. } if column == "nrReceived"));
    }

    #[test]
    fn combine_sums_overridden_fields_and_conjoins_ok() {
        let participants: Vec<SummaryRecord> = [(100.0, 0.01, true), (120.0, 0.03, false), (80.0, 0.02, true)]
            .iter()
            .map(|&(tps, lat, ok)| {
                SummaryRecord::from_values([
                    ("received_txs_count", StatValue::Int(10)),
                    ("tps", StatValue::Float(tps)),
                    ("avg_latency_sec", StatValue::Float(lat)),
                    ("mem_sys", StatValue::Int(1 << 20)),
                    (OK_FIELD, StatValue::Bool(ok)),
                ])
            })
            .collect();
        let combined = combine(&participants, &combined_registry()).expect("combine");
        assert_eq!(combined.get("tps"), Some(StatValue::Float(300.0)));
        assert_eq!(combined.get("mem_sys"), Some(StatValue::Int(3 << 20)));
        assert_eq!(combined.get("received_txs_count"), Some(StatValue::Int(30)));
        let latency = combined.get("avg_latency_sec").expect("latency").as_f64();
        assert!((latency - 0.02).abs() < 1e-12);
        assert!(!combined.ok());
        assert_eq!(combined.samples(), 3);
    }

    #[test]
    fn combine_skips_nan_participant_latency() {
        let participants = vec![
            SummaryRecord::from_values([
                ("received_txs_count", StatValue::Int(0)),
                ("tps", StatValue::Float(f64::NAN)),
                ("avg_latency_sec", StatValue::Float(f64::NAN)),
                ("mem_sys", StatValue::Int(1)),
                (OK_FIELD, StatValue::Bool(false)),
            ]),
            SummaryRecord::from_values([
                ("received_txs_count", StatValue::Int(5)),
                ("tps", StatValue::Float(50.0)),
                ("avg_latency_sec", StatValue::Float(0.5)),
                ("mem_sys", StatValue::Int(1)),
                (OK_FIELD, StatValue::Bool(true)),
            ]),
        ];
        let combined = combine(&participants, &combined_registry()).expect("combine");
        assert_eq!(combined.get("avg_latency_sec"), Some(StatValue::Float(0.5)));
        assert!(combined.get("tps").expect("tps").is_nan());
        assert!(!combined.ok());
    }

    #[test]
    fn combine_reports_missing_field() {
        let incomplete = SummaryRecord::from_values([("tps", StatValue::Float(1.0))]);
        let err = combine([&incomplete], &combined_registry()).expect_err("fields missing");
        assert!(matches!(err, StatsError::MissingField { .. }));
    }

    #[test]
    fn combine_of_no_participants_finalizes() {
        let combined = combine(std::iter::empty(), &combined_registry()).expect("combine");
        assert_eq!(combined.get("tps"), Some(StatValue::Float(0.0)));
        assert!(combined.get("avg_latency_sec").expect("latency").is_nan());
        assert!(!combined.ok());
    }
}
