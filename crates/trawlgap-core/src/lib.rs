use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use time::OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum QueryError {
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("operand kind mismatch for field {field}: expected {expected}, got {actual}")]
    OperandMismatch {
        field: String,
        expected: FieldKind,
        actual: FieldKind,
    },
    #[error("operand for field {0} MUST be finite")]
    NonFiniteOperand(String),
    #[error("membership predicate for field {0} MUST list at least one operand")]
    EmptyMembership(String),
    #[error("between predicate for field {0} MUST order its bounds as lower <= upper")]
    InvertedRange(String),
    #[error("malformed filter expression: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RecordError {
    #[error("field {0} is absent on this record")]
    FieldAbsent(&'static str),
    #[error("invalid timestamp: {0}")]
    Timestamp(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Int,
    Float,
    Text,
}

impl FieldKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
        }
    }
}

impl Display for FieldKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every queryable field of the upstream catch dataset, in flat output order.
pub const FIELD_NAMES: &[&str] = &[
    "year",
    "srvy",
    "survey",
    "survey_id",
    "cruise",
    "haul",
    "stratum",
    "station",
    "vessel_name",
    "vessel_id",
    "date_time",
    "latitude_dd",
    "longitude_dd",
    "species_code",
    "common_name",
    "scientific_name",
    "taxon_confidence",
    "cpue_kgha",
    "cpue_kgkm2",
    "cpue_kg1000km2",
    "cpue_noha",
    "cpue_nokm2",
    "cpue_no1000km2",
    "weight_kg",
    "count",
    "bottom_temperature_c",
    "surface_temperature_c",
    "depth_m",
    "distance_fished_km",
    "net_width_m",
    "net_height_m",
    "area_swept_ha",
    "duration_hr",
];

#[must_use]
pub fn field_kind(name: &str) -> Option<FieldKind> {
    match name {
        "year" | "survey_id" | "cruise" | "haul" | "stratum" | "vessel_id" | "species_code" => {
            Some(FieldKind::Int)
        }
        "latitude_dd" | "longitude_dd" | "cpue_kgha" | "cpue_kgkm2" | "cpue_kg1000km2"
        | "cpue_noha" | "cpue_nokm2" | "cpue_no1000km2" | "weight_kg" | "count"
        | "bottom_temperature_c" | "surface_temperature_c" | "depth_m" | "distance_fished_km"
        | "net_width_m" | "net_height_m" | "area_swept_ha" | "duration_hr" => {
            Some(FieldKind::Float)
        }
        "srvy" | "survey" | "station" | "vessel_name" | "date_time" | "common_name"
        | "scientific_name" | "taxon_confidence" => Some(FieldKind::Text),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Operand {
    #[must_use]
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Int(_) => FieldKind::Int,
            Self::Float(_) => FieldKind::Float,
            Self::Text(_) => FieldKind::Text,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Int(value) => Value::from(*value),
            Self::Float(value) => Number::from_f64(*value).map_or(Value::Null, Value::Number),
            Self::Text(value) => Value::String(value.clone()),
        }
    }

    fn from_json(value: &Value) -> Result<Self, QueryError> {
        match value {
            Value::Number(number) => number
                .as_i64()
                .map(Self::Int)
                .or_else(|| number.as_f64().map(Self::Float))
                .ok_or_else(|| {
                    QueryError::Malformed(format!("unsupported numeric literal: {number}"))
                }),
            Value::String(text) => Ok(Self::Text(text.clone())),
            other => Err(QueryError::Malformed(format!(
                "unsupported operand literal: {other}"
            ))),
        }
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Operand {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Operand {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// One field constraint. Between is inclusive at both ends.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Equals(Operand),
    NotEquals(Operand),
    LessThan(Operand),
    AtMost(Operand),
    GreaterThan(Operand),
    AtLeast(Operand),
    Between(Operand, Operand),
    AnyOf(Vec<Operand>),
}

impl Predicate {
    fn operands(&self) -> Vec<&Operand> {
        match self {
            Self::Equals(operand)
            | Self::NotEquals(operand)
            | Self::LessThan(operand)
            | Self::AtMost(operand)
            | Self::GreaterThan(operand)
            | Self::AtLeast(operand) => vec![operand],
            Self::Between(lower, upper) => vec![lower, upper],
            Self::AnyOf(operands) => operands.iter().collect(),
        }
    }
}

/// Validates one (field, predicate) pair against the field registry.
///
/// # Errors
/// Returns [`QueryError`] when the field is unknown, an operand kind does
/// not match the field's declared kind, a membership list is empty, or a
/// between range is inverted.
pub fn validate_predicate(field: &str, predicate: &Predicate) -> Result<(), QueryError> {
    let Some(expected) = field_kind(field) else {
        return Err(QueryError::UnknownField(field.to_string()));
    };

    for operand in predicate.operands() {
        if let Operand::Float(value) = operand {
            if !value.is_finite() {
                return Err(QueryError::NonFiniteOperand(field.to_string()));
            }
        }

        let actual = operand.kind();
        let coerces = expected == FieldKind::Float && actual == FieldKind::Int;
        if actual != expected && !coerces {
            return Err(QueryError::OperandMismatch {
                field: field.to_string(),
                expected,
                actual,
            });
        }
    }

    match predicate {
        Predicate::AnyOf(operands) if operands.is_empty() => {
            Err(QueryError::EmptyMembership(field.to_string()))
        }
        Predicate::Between(lower, upper) => {
            if compare_operands(lower, upper) == Some(Ordering::Greater) {
                Err(QueryError::InvertedRange(field.to_string()))
            } else {
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

/// A compiled wire query: the `q` filter expression plus its page window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    q: String,
    limit: u64,
    offset: u64,
}

impl CompiledQuery {
    #[must_use]
    pub fn q(&self) -> &str {
        &self.q
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn with_window(&self, offset: u64, limit: u64) -> Self {
        Self {
            q: self.q.clone(),
            limit,
            offset,
        }
    }

    /// Canonical request identity, usable as a downstream cache key.
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("q={}&limit={}&offset={}", self.q, self.limit, self.offset)
    }
}

/// Compiles a predicate set plus pagination parameters into a wire query.
///
/// Compilation is pure and deterministic: identical predicate sets always
/// produce identical `q` strings, regardless of insertion order.
///
/// # Errors
/// Returns [`QueryError`] when any (field, predicate) pair fails
/// validation. No partial query is produced.
pub fn compile_query(
    filters: &BTreeMap<String, Predicate>,
    limit: u64,
    offset: u64,
) -> Result<CompiledQuery, QueryError> {
    let mut object = Map::new();
    for (field, predicate) in filters {
        validate_predicate(field, predicate)?;
        object.insert(field.clone(), predicate_to_wire(predicate));
    }

    let q = serde_json::to_string(&Value::Object(object))
        .map_err(|err| QueryError::Malformed(format!("failed to encode filter expression: {err}")))?;

    Ok(CompiledQuery { q, limit, offset })
}

fn predicate_to_wire(predicate: &Predicate) -> Value {
    match predicate {
        Predicate::Equals(operand) => operand.to_json(),
        Predicate::NotEquals(operand) => operator_object("$ne", operand.to_json()),
        Predicate::LessThan(operand) => operator_object("$lt", operand.to_json()),
        Predicate::AtMost(operand) => operator_object("$lte", operand.to_json()),
        Predicate::GreaterThan(operand) => operator_object("$gt", operand.to_json()),
        Predicate::AtLeast(operand) => operator_object("$gte", operand.to_json()),
        Predicate::Between(lower, upper) => operator_object(
            "$between",
            Value::Array(vec![lower.to_json(), upper.to_json()]),
        ),
        Predicate::AnyOf(operands) => operator_object(
            "$in",
            Value::Array(operands.iter().map(Operand::to_json).collect()),
        ),
    }
}

fn operator_object(key: &str, value: Value) -> Value {
    let mut object = Map::new();
    object.insert(key.to_string(), value);
    Value::Object(object)
}

/// Re-parses the filter portion of a compiled query back into predicates.
///
/// Round-trips every operator [`compile_query`] emits; additionally folds
/// an explicit `{"$gte": a, "$lte": b}` comparison pair into the
/// equivalent inclusive between.
///
/// # Errors
/// Returns [`QueryError::Malformed`] for syntactically invalid
/// expressions, and the usual validation errors for semantically invalid
/// ones.
pub fn parse_query(q: &str) -> Result<BTreeMap<String, Predicate>, QueryError> {
    let value: Value = serde_json::from_str(q)
        .map_err(|err| QueryError::Malformed(format!("filter expression is not JSON: {err}")))?;
    let Value::Object(object) = value else {
        return Err(QueryError::Malformed(
            "filter expression MUST be a JSON object".to_string(),
        ));
    };

    let mut filters = BTreeMap::new();
    for (field, expr) in &object {
        let predicate = match expr {
            Value::Object(ops) => parse_operator_object(field, ops)?,
            literal => Predicate::Equals(Operand::from_json(literal)?),
        };
        validate_predicate(field, &predicate)?;
        filters.insert(field.clone(), predicate);
    }

    Ok(filters)
}

fn parse_operator_object(field: &str, ops: &Map<String, Value>) -> Result<Predicate, QueryError> {
    if ops.len() == 2 {
        if let (Some(lower), Some(upper)) = (ops.get("$gte"), ops.get("$lte")) {
            return Ok(Predicate::Between(
                Operand::from_json(lower)?,
                Operand::from_json(upper)?,
            ));
        }
    }

    if ops.len() != 1 {
        return Err(QueryError::Malformed(format!(
            "field {field} carries an unsupported operator combination"
        )));
    }

    let Some((key, value)) = ops.iter().next() else {
        return Err(QueryError::Malformed(format!(
            "field {field} carries an empty operator object"
        )));
    };

    match key.as_str() {
        "$ne" => Ok(Predicate::NotEquals(Operand::from_json(value)?)),
        "$lt" => Ok(Predicate::LessThan(Operand::from_json(value)?)),
        "$lte" => Ok(Predicate::AtMost(Operand::from_json(value)?)),
        "$gt" => Ok(Predicate::GreaterThan(Operand::from_json(value)?)),
        "$gte" => Ok(Predicate::AtLeast(Operand::from_json(value)?)),
        "$between" => match value.as_array().map(Vec::as_slice) {
            Some([lower, upper]) => Ok(Predicate::Between(
                Operand::from_json(lower)?,
                Operand::from_json(upper)?,
            )),
            _ => Err(QueryError::Malformed(format!(
                "between for field {field} MUST be a two-element array"
            ))),
        },
        "$in" => {
            let Some(values) = value.as_array() else {
                return Err(QueryError::Malformed(format!(
                    "membership for field {field} MUST be an array"
                )));
            };
            let operands = values
                .iter()
                .map(Operand::from_json)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Predicate::AnyOf(operands))
        }
        other => Err(QueryError::Malformed(format!(
            "unsupported operator {other} for field {field}"
        ))),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    Observed,
    Synthetic,
}

impl RecordOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Observed => "observed",
            Self::Synthetic => "synthetic",
        }
    }
}

/// One reference haul with its environmental covariates, as supplied by a
/// haul provider for a given (survey, year).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaulReference {
    pub year: i64,
    pub srvy: String,
    pub survey: String,
    pub survey_id: i64,
    pub cruise: i64,
    pub haul: i64,
    pub stratum: i64,
    pub station: String,
    pub vessel_name: String,
    pub vessel_id: i64,
    pub date_time: String,
    pub latitude_dd: f64,
    pub longitude_dd: f64,
    pub bottom_temperature_c: Option<f64>,
    pub surface_temperature_c: Option<f64>,
    pub depth_m: f64,
    pub distance_fished_km: f64,
    pub net_width_m: Option<f64>,
    pub net_height_m: Option<f64>,
    pub area_swept_ha: f64,
    pub duration_hr: f64,
}

/// Species identity observed during iteration, reused for synthesis.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct SpeciesRef {
    pub species_code: i64,
    pub scientific_name: String,
    pub common_name: String,
}

/// One catch record, either observed upstream or synthesized locally.
///
/// Required fields are plain values; optional fields carry an absence
/// sentinel and expose a maybe/strict accessor pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    origin: RecordOrigin,
    year: i64,
    srvy: String,
    survey: String,
    survey_id: i64,
    cruise: i64,
    haul: i64,
    stratum: i64,
    station: String,
    vessel_name: String,
    vessel_id: i64,
    date_time: String,
    latitude_dd: f64,
    longitude_dd: f64,
    species_code: i64,
    common_name: String,
    scientific_name: String,
    taxon_confidence: Option<String>,
    cpue_kgha: Option<f64>,
    cpue_kgkm2: Option<f64>,
    cpue_kg1000km2: Option<f64>,
    cpue_noha: Option<f64>,
    cpue_nokm2: Option<f64>,
    cpue_no1000km2: Option<f64>,
    weight_kg: Option<f64>,
    count: Option<f64>,
    bottom_temperature_c: Option<f64>,
    surface_temperature_c: Option<f64>,
    depth_m: f64,
    distance_fished_km: f64,
    net_width_m: Option<f64>,
    net_height_m: Option<f64>,
    area_swept_ha: f64,
    duration_hr: f64,
}

impl Record {
    /// Builds a synthetic zero-catch record for an unmatched
    /// (haul, species) pair. Catch metrics are zero, covariates come from
    /// the haul, and no taxon confidence is assigned.
    #[must_use]
    pub fn zero_catch(haul: &HaulReference, species: &SpeciesRef) -> Self {
        Self {
            origin: RecordOrigin::Synthetic,
            year: haul.year,
            srvy: haul.srvy.clone(),
            survey: haul.survey.clone(),
            survey_id: haul.survey_id,
            cruise: haul.cruise,
            haul: haul.haul,
            stratum: haul.stratum,
            station: haul.station.clone(),
            vessel_name: haul.vessel_name.clone(),
            vessel_id: haul.vessel_id,
            date_time: haul.date_time.clone(),
            latitude_dd: haul.latitude_dd,
            longitude_dd: haul.longitude_dd,
            species_code: species.species_code,
            common_name: species.common_name.clone(),
            scientific_name: species.scientific_name.clone(),
            taxon_confidence: None,
            cpue_kgha: Some(0.0),
            cpue_kgkm2: Some(0.0),
            cpue_kg1000km2: Some(0.0),
            cpue_noha: Some(0.0),
            cpue_nokm2: Some(0.0),
            cpue_no1000km2: Some(0.0),
            weight_kg: Some(0.0),
            count: Some(0.0),
            bottom_temperature_c: haul.bottom_temperature_c,
            surface_temperature_c: haul.surface_temperature_c,
            depth_m: haul.depth_m,
            distance_fished_km: haul.distance_fished_km,
            net_width_m: haul.net_width_m,
            net_height_m: haul.net_height_m,
            area_swept_ha: haul.area_swept_ha,
            duration_hr: haul.duration_hr,
        }
    }

    #[must_use]
    pub fn origin(&self) -> RecordOrigin {
        self.origin
    }

    #[must_use]
    pub fn year(&self) -> i64 {
        self.year
    }

    #[must_use]
    pub fn srvy(&self) -> &str {
        &self.srvy
    }

    #[must_use]
    pub fn survey(&self) -> &str {
        &self.survey
    }

    #[must_use]
    pub fn survey_id(&self) -> i64 {
        self.survey_id
    }

    #[must_use]
    pub fn cruise(&self) -> i64 {
        self.cruise
    }

    #[must_use]
    pub fn haul(&self) -> i64 {
        self.haul
    }

    #[must_use]
    pub fn stratum(&self) -> i64 {
        self.stratum
    }

    #[must_use]
    pub fn station(&self) -> &str {
        &self.station
    }

    #[must_use]
    pub fn vessel_name(&self) -> &str {
        &self.vessel_name
    }

    #[must_use]
    pub fn vessel_id(&self) -> i64 {
        self.vessel_id
    }

    /// Raw upstream timestamp string. See [`parse_timestamp`] for the
    /// canonical calendar form.
    #[must_use]
    pub fn date_time(&self) -> &str {
        &self.date_time
    }

    #[must_use]
    pub fn latitude_dd(&self) -> f64 {
        self.latitude_dd
    }

    #[must_use]
    pub fn longitude_dd(&self) -> f64 {
        self.longitude_dd
    }

    #[must_use]
    pub fn species_code(&self) -> i64 {
        self.species_code
    }

    #[must_use]
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    #[must_use]
    pub fn scientific_name(&self) -> &str {
        &self.scientific_name
    }

    #[must_use]
    pub fn depth_m(&self) -> f64 {
        self.depth_m
    }

    #[must_use]
    pub fn distance_fished_km(&self) -> f64 {
        self.distance_fished_km
    }

    #[must_use]
    pub fn area_swept_ha(&self) -> f64 {
        self.area_swept_ha
    }

    #[must_use]
    pub fn duration_hr(&self) -> f64 {
        self.duration_hr
    }

    #[must_use]
    pub fn taxon_confidence_maybe(&self) -> Option<&str> {
        self.taxon_confidence.as_deref()
    }

    /// # Errors
    /// Returns [`RecordError::FieldAbsent`] when no taxon confidence was
    /// assessed (always the case for synthetic records).
    pub fn taxon_confidence(&self) -> Result<&str, RecordError> {
        self.taxon_confidence
            .as_deref()
            .ok_or(RecordError::FieldAbsent("taxon_confidence"))
    }

    #[must_use]
    pub fn cpue_kgha_maybe(&self) -> Option<f64> {
        self.cpue_kgha
    }

    /// # Errors
    /// Returns [`RecordError::FieldAbsent`] when the field is absent.
    pub fn cpue_kgha(&self) -> Result<f64, RecordError> {
        self.cpue_kgha.ok_or(RecordError::FieldAbsent("cpue_kgha"))
    }

    #[must_use]
    pub fn cpue_kgkm2_maybe(&self) -> Option<f64> {
        self.cpue_kgkm2
    }

    /// # Errors
    /// Returns [`RecordError::FieldAbsent`] when the field is absent.
    pub fn cpue_kgkm2(&self) -> Result<f64, RecordError> {
        self.cpue_kgkm2
            .ok_or(RecordError::FieldAbsent("cpue_kgkm2"))
    }

    #[must_use]
    pub fn cpue_kg1000km2_maybe(&self) -> Option<f64> {
        self.cpue_kg1000km2
    }

    /// # Errors
    /// Returns [`RecordError::FieldAbsent`] when the field is absent.
    pub fn cpue_kg1000km2(&self) -> Result<f64, RecordError> {
        self.cpue_kg1000km2
            .ok_or(RecordError::FieldAbsent("cpue_kg1000km2"))
    }

    #[must_use]
    pub fn cpue_noha_maybe(&self) -> Option<f64> {
        self.cpue_noha
    }

    /// # Errors
    /// Returns [`RecordError::FieldAbsent`] when the field is absent.
    pub fn cpue_noha(&self) -> Result<f64, RecordError> {
        self.cpue_noha.ok_or(RecordError::FieldAbsent("cpue_noha"))
    }

    #[must_use]
    pub fn cpue_nokm2_maybe(&self) -> Option<f64> {
        self.cpue_nokm2
    }

    /// # Errors
    /// Returns [`RecordError::FieldAbsent`] when the field is absent.
    pub fn cpue_nokm2(&self) -> Result<f64, RecordError> {
        self.cpue_nokm2
            .ok_or(RecordError::FieldAbsent("cpue_nokm2"))
    }

    #[must_use]
    pub fn cpue_no1000km2_maybe(&self) -> Option<f64> {
        self.cpue_no1000km2
    }

    /// # Errors
    /// Returns [`RecordError::FieldAbsent`] when the field is absent.
    pub fn cpue_no1000km2(&self) -> Result<f64, RecordError> {
        self.cpue_no1000km2
            .ok_or(RecordError::FieldAbsent("cpue_no1000km2"))
    }

    #[must_use]
    pub fn weight_kg_maybe(&self) -> Option<f64> {
        self.weight_kg
    }

    /// # Errors
    /// Returns [`RecordError::FieldAbsent`] when the field is absent.
    pub fn weight_kg(&self) -> Result<f64, RecordError> {
        self.weight_kg.ok_or(RecordError::FieldAbsent("weight_kg"))
    }

    #[must_use]
    pub fn count_maybe(&self) -> Option<f64> {
        self.count
    }

    /// # Errors
    /// Returns [`RecordError::FieldAbsent`] when the field is absent.
    pub fn count(&self) -> Result<f64, RecordError> {
        self.count.ok_or(RecordError::FieldAbsent("count"))
    }

    #[must_use]
    pub fn bottom_temperature_c_maybe(&self) -> Option<f64> {
        self.bottom_temperature_c
    }

    /// # Errors
    /// Returns [`RecordError::FieldAbsent`] when the field is absent.
    pub fn bottom_temperature_c(&self) -> Result<f64, RecordError> {
        self.bottom_temperature_c
            .ok_or(RecordError::FieldAbsent("bottom_temperature_c"))
    }

    #[must_use]
    pub fn surface_temperature_c_maybe(&self) -> Option<f64> {
        self.surface_temperature_c
    }

    /// # Errors
    /// Returns [`RecordError::FieldAbsent`] when the field is absent.
    pub fn surface_temperature_c(&self) -> Result<f64, RecordError> {
        self.surface_temperature_c
            .ok_or(RecordError::FieldAbsent("surface_temperature_c"))
    }

    #[must_use]
    pub fn net_width_m_maybe(&self) -> Option<f64> {
        self.net_width_m
    }

    /// # Errors
    /// Returns [`RecordError::FieldAbsent`] when the field is absent.
    pub fn net_width_m(&self) -> Result<f64, RecordError> {
        self.net_width_m
            .ok_or(RecordError::FieldAbsent("net_width_m"))
    }

    #[must_use]
    pub fn net_height_m_maybe(&self) -> Option<f64> {
        self.net_height_m
    }

    /// # Errors
    /// Returns [`RecordError::FieldAbsent`] when the field is absent.
    pub fn net_height_m(&self) -> Result<f64, RecordError> {
        self.net_height_m
            .ok_or(RecordError::FieldAbsent("net_height_m"))
    }

    /// True iff every optional field is present and the timestamp parses
    /// to its canonical calendar form. Synthetic records are exempt from
    /// the taxon confidence requirement since no specimen was assessed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        let taxon_present =
            self.taxon_confidence.is_some() || self.origin == RecordOrigin::Synthetic;

        taxon_present
            && self.cpue_kgha.is_some()
            && self.cpue_kgkm2.is_some()
            && self.cpue_kg1000km2.is_some()
            && self.cpue_noha.is_some()
            && self.cpue_nokm2.is_some()
            && self.cpue_no1000km2.is_some()
            && self.weight_kg.is_some()
            && self.count.is_some()
            && self.bottom_temperature_c.is_some()
            && self.surface_temperature_c.is_some()
            && self.net_width_m.is_some()
            && self.net_height_m.is_some()
            && parse_timestamp(&self.date_time).is_ok()
    }

    /// Flat field-to-value mapping for downstream CSV/JSON rendering.
    /// Total and lossless: every declared field appears, absent optionals
    /// map to null, and the origin tag is carried as `record_origin`.
    #[must_use]
    pub fn to_flat(&self) -> BTreeMap<&'static str, Value> {
        let mut flat = BTreeMap::new();
        flat.insert("record_origin", Value::String(self.origin.as_str().to_string()));
        flat.insert("year", Value::from(self.year));
        flat.insert("srvy", Value::String(self.srvy.clone()));
        flat.insert("survey", Value::String(self.survey.clone()));
        flat.insert("survey_id", Value::from(self.survey_id));
        flat.insert("cruise", Value::from(self.cruise));
        flat.insert("haul", Value::from(self.haul));
        flat.insert("stratum", Value::from(self.stratum));
        flat.insert("station", Value::String(self.station.clone()));
        flat.insert("vessel_name", Value::String(self.vessel_name.clone()));
        flat.insert("vessel_id", Value::from(self.vessel_id));
        flat.insert("date_time", Value::String(self.date_time.clone()));
        flat.insert("latitude_dd", float_value(self.latitude_dd));
        flat.insert("longitude_dd", float_value(self.longitude_dd));
        flat.insert("species_code", Value::from(self.species_code));
        flat.insert("common_name", Value::String(self.common_name.clone()));
        flat.insert(
            "scientific_name",
            Value::String(self.scientific_name.clone()),
        );
        flat.insert(
            "taxon_confidence",
            self.taxon_confidence
                .clone()
                .map_or(Value::Null, Value::String),
        );
        flat.insert("cpue_kgha", optional_float_value(self.cpue_kgha));
        flat.insert("cpue_kgkm2", optional_float_value(self.cpue_kgkm2));
        flat.insert("cpue_kg1000km2", optional_float_value(self.cpue_kg1000km2));
        flat.insert("cpue_noha", optional_float_value(self.cpue_noha));
        flat.insert("cpue_nokm2", optional_float_value(self.cpue_nokm2));
        flat.insert("cpue_no1000km2", optional_float_value(self.cpue_no1000km2));
        flat.insert("weight_kg", optional_float_value(self.weight_kg));
        flat.insert("count", optional_float_value(self.count));
        flat.insert(
            "bottom_temperature_c",
            optional_float_value(self.bottom_temperature_c),
        );
        flat.insert(
            "surface_temperature_c",
            optional_float_value(self.surface_temperature_c),
        );
        flat.insert("depth_m", float_value(self.depth_m));
        flat.insert("distance_fished_km", float_value(self.distance_fished_km));
        flat.insert("net_width_m", optional_float_value(self.net_width_m));
        flat.insert("net_height_m", optional_float_value(self.net_height_m));
        flat.insert("area_swept_ha", float_value(self.area_swept_ha));
        flat.insert("duration_hr", float_value(self.duration_hr));
        flat
    }
}

/// Parses an upstream timestamp into its canonical RFC3339 calendar form.
///
/// # Errors
/// Returns [`RecordError::Timestamp`] when the value does not parse.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, RecordError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| RecordError::Timestamp(format!("{value}: {err}")))
}

/// One raw payload fragment the decoder rejected, with the reason.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Serialize)]
#[error("invalid entry: {reason}")]
pub struct InvalidEntry {
    pub reason: String,
    pub raw: Value,
}

/// Decodes one raw upstream payload entry into a typed record.
///
/// Total: every entry yields exactly one of record or invalid entry.
/// Required fields must parse to their declared kind or the whole entry
/// is rejected; optional fields that are missing, null, or mistyped
/// become the absence sentinel instead.
///
/// # Errors
/// Returns [`InvalidEntry`] carrying the rejection reason and the raw
/// fragment.
pub fn decode_record(raw: &Value) -> Result<Record, InvalidEntry> {
    let Some(entry) = raw.as_object() else {
        return Err(invalid_entry(raw, "entry MUST be a JSON object"));
    };

    Ok(Record {
        origin: RecordOrigin::Observed,
        year: require_int(entry, raw, "year")?,
        srvy: require_text(entry, raw, "srvy")?,
        survey: require_text(entry, raw, "survey")?,
        survey_id: require_int(entry, raw, "survey_id")?,
        cruise: require_int(entry, raw, "cruise")?,
        haul: require_int(entry, raw, "haul")?,
        stratum: require_int(entry, raw, "stratum")?,
        station: require_text(entry, raw, "station")?,
        vessel_name: require_text(entry, raw, "vessel_name")?,
        vessel_id: require_int(entry, raw, "vessel_id")?,
        date_time: require_text(entry, raw, "date_time")?,
        latitude_dd: require_float(entry, raw, "latitude_dd")?,
        longitude_dd: require_float(entry, raw, "longitude_dd")?,
        species_code: require_int(entry, raw, "species_code")?,
        common_name: require_text(entry, raw, "common_name")?,
        scientific_name: require_text(entry, raw, "scientific_name")?,
        taxon_confidence: optional_text(entry, "taxon_confidence"),
        cpue_kgha: optional_float(entry, "cpue_kgha"),
        cpue_kgkm2: optional_float(entry, "cpue_kgkm2"),
        cpue_kg1000km2: optional_float(entry, "cpue_kg1000km2"),
        cpue_noha: optional_float(entry, "cpue_noha"),
        cpue_nokm2: optional_float(entry, "cpue_nokm2"),
        cpue_no1000km2: optional_float(entry, "cpue_no1000km2"),
        weight_kg: optional_float(entry, "weight_kg"),
        count: optional_float(entry, "count"),
        bottom_temperature_c: optional_float(entry, "bottom_temperature_c"),
        surface_temperature_c: optional_float(entry, "surface_temperature_c"),
        depth_m: require_float(entry, raw, "depth_m")?,
        distance_fished_km: require_float(entry, raw, "distance_fished_km")?,
        net_width_m: optional_float(entry, "net_width_m"),
        net_height_m: optional_float(entry, "net_height_m"),
        area_swept_ha: require_float(entry, raw, "area_swept_ha")?,
        duration_hr: require_float(entry, raw, "duration_hr")?,
    })
}

fn invalid_entry(raw: &Value, reason: impl Into<String>) -> InvalidEntry {
    InvalidEntry {
        reason: reason.into(),
        raw: raw.clone(),
    }
}

fn require_int(
    entry: &Map<String, Value>,
    raw: &Value,
    field: &'static str,
) -> Result<i64, InvalidEntry> {
    let Some(value) = entry.get(field) else {
        return Err(invalid_entry(raw, format!("required field {field} is missing")));
    };
    as_int(value).ok_or_else(|| {
        invalid_entry(raw, format!("required field {field} MUST be an integer"))
    })
}

fn require_float(
    entry: &Map<String, Value>,
    raw: &Value,
    field: &'static str,
) -> Result<f64, InvalidEntry> {
    let Some(value) = entry.get(field) else {
        return Err(invalid_entry(raw, format!("required field {field} is missing")));
    };
    value.as_f64().ok_or_else(|| {
        invalid_entry(raw, format!("required field {field} MUST be a number"))
    })
}

fn require_text(
    entry: &Map<String, Value>,
    raw: &Value,
    field: &'static str,
) -> Result<String, InvalidEntry> {
    let Some(value) = entry.get(field) else {
        return Err(invalid_entry(raw, format!("required field {field} is missing")));
    };
    value.as_str().map(str::to_string).ok_or_else(|| {
        invalid_entry(raw, format!("required field {field} MUST be a string"))
    })
}

#[allow(clippy::cast_possible_truncation)]
fn as_int(value: &Value) -> Option<i64> {
    if let Some(int) = value.as_i64() {
        return Some(int);
    }
    // Upstream occasionally serializes integer columns as floats.
    value
        .as_f64()
        .filter(|float| float.is_finite() && float.fract() == 0.0)
        .map(|float| float as i64)
}

fn optional_float(entry: &Map<String, Value>, field: &str) -> Option<f64> {
    entry.get(field).and_then(Value::as_f64)
}

fn optional_text(entry: &Map<String, Value>, field: &str) -> Option<String> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

enum FieldValue<'a> {
    Int(i64),
    Float(f64),
    Text(&'a str),
}

fn record_field_value<'a>(record: &'a Record, field: &str) -> Option<FieldValue<'a>> {
    match field {
        "year" => Some(FieldValue::Int(record.year)),
        "srvy" => Some(FieldValue::Text(&record.srvy)),
        "survey" => Some(FieldValue::Text(&record.survey)),
        "survey_id" => Some(FieldValue::Int(record.survey_id)),
        "cruise" => Some(FieldValue::Int(record.cruise)),
        "haul" => Some(FieldValue::Int(record.haul)),
        "stratum" => Some(FieldValue::Int(record.stratum)),
        "station" => Some(FieldValue::Text(&record.station)),
        "vessel_name" => Some(FieldValue::Text(&record.vessel_name)),
        "vessel_id" => Some(FieldValue::Int(record.vessel_id)),
        "date_time" => Some(FieldValue::Text(&record.date_time)),
        "latitude_dd" => Some(FieldValue::Float(record.latitude_dd)),
        "longitude_dd" => Some(FieldValue::Float(record.longitude_dd)),
        "species_code" => Some(FieldValue::Int(record.species_code)),
        "common_name" => Some(FieldValue::Text(&record.common_name)),
        "scientific_name" => Some(FieldValue::Text(&record.scientific_name)),
        "taxon_confidence" => record.taxon_confidence.as_deref().map(FieldValue::Text),
        "cpue_kgha" => record.cpue_kgha.map(FieldValue::Float),
        "cpue_kgkm2" => record.cpue_kgkm2.map(FieldValue::Float),
        "cpue_kg1000km2" => record.cpue_kg1000km2.map(FieldValue::Float),
        "cpue_noha" => record.cpue_noha.map(FieldValue::Float),
        "cpue_nokm2" => record.cpue_nokm2.map(FieldValue::Float),
        "cpue_no1000km2" => record.cpue_no1000km2.map(FieldValue::Float),
        "weight_kg" => record.weight_kg.map(FieldValue::Float),
        "count" => record.count.map(FieldValue::Float),
        "bottom_temperature_c" => record.bottom_temperature_c.map(FieldValue::Float),
        "surface_temperature_c" => record.surface_temperature_c.map(FieldValue::Float),
        "depth_m" => Some(FieldValue::Float(record.depth_m)),
        "distance_fished_km" => Some(FieldValue::Float(record.distance_fished_km)),
        "net_width_m" => record.net_width_m.map(FieldValue::Float),
        "net_height_m" => record.net_height_m.map(FieldValue::Float),
        "area_swept_ha" => Some(FieldValue::Float(record.area_swept_ha)),
        "duration_hr" => Some(FieldValue::Float(record.duration_hr)),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn compare_operands(lower: &Operand, upper: &Operand) -> Option<Ordering> {
    match (lower, upper) {
        (Operand::Int(a), Operand::Int(b)) => Some(a.cmp(b)),
        (Operand::Int(a), Operand::Float(b)) => (*a as f64).partial_cmp(b),
        (Operand::Float(a), Operand::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Operand::Float(a), Operand::Float(b)) => a.partial_cmp(b),
        (Operand::Text(a), Operand::Text(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn compare_value(value: &FieldValue<'_>, operand: &Operand) -> Option<Ordering> {
    match (value, operand) {
        (FieldValue::Int(a), Operand::Int(b)) => Some(a.cmp(b)),
        (FieldValue::Int(a), Operand::Float(b)) => (*a as f64).partial_cmp(b),
        (FieldValue::Float(a), Operand::Int(b)) => a.partial_cmp(&(*b as f64)),
        (FieldValue::Float(a), Operand::Float(b)) => a.partial_cmp(b),
        (FieldValue::Text(a), Operand::Text(b)) => Some((*a).cmp(b.as_str())),
        _ => None,
    }
}

/// Evaluates one predicate against an in-memory record with the same
/// semantics the remote service applies to its own filters. A predicate
/// over an absent optional field never matches.
#[must_use]
pub fn predicate_matches(record: &Record, field: &str, predicate: &Predicate) -> bool {
    let Some(value) = record_field_value(record, field) else {
        return false;
    };

    match predicate {
        Predicate::Equals(operand) => compare_value(&value, operand) == Some(Ordering::Equal),
        Predicate::NotEquals(operand) => {
            matches!(compare_value(&value, operand), Some(ordering) if ordering != Ordering::Equal)
        }
        Predicate::LessThan(operand) => compare_value(&value, operand) == Some(Ordering::Less),
        Predicate::AtMost(operand) => matches!(
            compare_value(&value, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Predicate::GreaterThan(operand) => {
            compare_value(&value, operand) == Some(Ordering::Greater)
        }
        Predicate::AtLeast(operand) => matches!(
            compare_value(&value, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Predicate::Between(lower, upper) => {
            matches!(
                compare_value(&value, lower),
                Some(Ordering::Greater | Ordering::Equal)
            ) && matches!(
                compare_value(&value, upper),
                Some(Ordering::Less | Ordering::Equal)
            )
        }
        Predicate::AnyOf(operands) => operands
            .iter()
            .any(|operand| compare_value(&value, operand) == Some(Ordering::Equal)),
    }
}

/// Evaluates a whole predicate set against a record (conjunction).
#[must_use]
pub fn record_matches(record: &Record, filters: &BTreeMap<String, Predicate>) -> bool {
    filters
        .iter()
        .all(|(field, predicate)| predicate_matches(record, field, predicate))
}

fn float_value(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

fn optional_float_value(value: Option<f64>) -> Value {
    value.map_or(Value::Null, float_value)
}
