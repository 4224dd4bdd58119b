use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{json, Value};
use trawlgap_client::{
    FetchError, FixtureHaulProvider, PageFetcher, QueryBuilder, RawPage, RecordStream,
};
use trawlgap_core::{CompiledQuery, HaulReference, Operand, Predicate, Record, RecordOrigin};

fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

#[derive(Clone)]
struct UpstreamStub {
    items: Rc<Vec<Value>>,
    fetches: Rc<RefCell<usize>>,
}

impl UpstreamStub {
    fn new(items: Vec<Value>) -> Self {
        Self {
            items: Rc::new(items),
            fetches: Rc::new(RefCell::new(0)),
        }
    }

    fn fetches(&self) -> usize {
        *self.fetches.borrow()
    }
}

impl PageFetcher for UpstreamStub {
    fn fetch_page(&self, query: &CompiledQuery) -> Result<RawPage, FetchError> {
        *self.fetches.borrow_mut() += 1;
        let start = usize::try_from(query.offset())
            .unwrap_or(usize::MAX)
            .min(self.items.len());
        let end = start
            .saturating_add(usize::try_from(query.limit()).unwrap_or(usize::MAX))
            .min(self.items.len());
        Ok(RawPage {
            items: self.items[start..end].to_vec(),
            has_more: end < self.items.len(),
        })
    }
}

fn catch_entry(haul: i64, species_code: i64) -> Value {
    json!({
        "year": 2021,
        "srvy": "GOA",
        "survey": "Gulf of Alaska",
        "survey_id": 47,
        "cruise": 202101,
        "haul": haul,
        "stratum": 30,
        "station": "33-51",
        "vessel_name": "Ocean Explorer",
        "vessel_id": 148,
        "date_time": "2021-07-16T11:30:22Z",
        "latitude_dd": 56.82,
        "longitude_dd": -153.24,
        "species_code": species_code,
        "common_name": "Pacific cod",
        "scientific_name": "Gadus macrocephalus",
        "taxon_confidence": "high",
        "cpue_kgha": 12.7,
        "cpue_kgkm2": 1270.0,
        "cpue_kg1000km2": 1_270_000.0,
        "cpue_noha": 4.5,
        "cpue_nokm2": 450.0,
        "cpue_no1000km2": 450_000.0,
        "weight_kg": 31.5,
        "count": 11.0,
        "bottom_temperature_c": 4.1,
        "surface_temperature_c": 8.7,
        "depth_m": 92.0,
        "distance_fished_km": 1.52,
        "net_width_m": 16.3,
        "net_height_m": 6.9,
        "area_swept_ha": 2.48,
        "duration_hr": 0.27
    })
}

fn reference_haul(haul: i64) -> HaulReference {
    HaulReference {
        year: 2021,
        srvy: "GOA".to_string(),
        survey: "Gulf of Alaska".to_string(),
        survey_id: 47,
        cruise: 202101,
        haul,
        stratum: 30,
        station: format!("station-{haul}"),
        vessel_name: "Ocean Explorer".to_string(),
        vessel_id: 148,
        date_time: "2021-07-16T11:30:22Z".to_string(),
        latitude_dd: 56.82,
        longitude_dd: -153.24,
        bottom_temperature_c: Some(4.1),
        surface_temperature_c: Some(8.7),
        depth_m: 92.0,
        distance_fished_km: 1.52,
        net_width_m: Some(16.3),
        net_height_m: Some(6.9),
        area_swept_ha: 2.48,
        duration_hr: 0.27,
    }
}

fn open_session(upstream: &UpstreamStub, hauls: Vec<HaulReference>) -> RecordStream {
    must_ok(
        QueryBuilder::new()
            .filter("srvy", Predicate::Equals(Operand::from("GOA")))
            .filter("year", Predicate::Equals(Operand::from(2021)))
            .filter(
                "scientific_name",
                Predicate::Equals(Operand::from("Gadus macrocephalus")),
            )
            .page_size(2)
            .infer_absence(true)
            .build(
                Box::new(upstream.clone()),
                Some(Box::new(FixtureHaulProvider::new(hauls))),
            ),
    )
}

#[test]
fn full_session_yields_presence_then_inferred_absence() {
    let upstream = UpstreamStub::new(vec![
        catch_entry(2, 21720),
        catch_entry(4, 21720),
        json!({"corrupt": true}),
    ]);
    let hauls: Vec<HaulReference> = (1..=5).map(reference_haul).collect();
    let mut session = open_session(&upstream, hauls);

    let records: Vec<Record> = session.by_ref().map(must_ok).collect();
    assert_eq!(records.len(), 5);

    let origins: Vec<RecordOrigin> = records.iter().map(Record::origin).collect();
    assert_eq!(
        origins,
        vec![
            RecordOrigin::Observed,
            RecordOrigin::Observed,
            RecordOrigin::Synthetic,
            RecordOrigin::Synthetic,
            RecordOrigin::Synthetic,
        ]
    );

    let synthetic_hauls: Vec<i64> = records[2..].iter().map(Record::haul).collect();
    assert_eq!(synthetic_hauls, vec![1, 3, 5]);
    for record in &records[2..] {
        assert_eq!(must_ok(record.weight_kg()), 0.0);
        assert_eq!(must_ok(record.count()), 0.0);
        assert_eq!(record.depth_m(), 92.0);
    }

    // The corrupt fragment never surfaced as a record.
    let invalid = session.invalid_entries();
    assert_eq!(invalid.len(), 1);
    assert_eq!(invalid[0].raw, json!({"corrupt": true}));

    // Page size 2 over 3 items: two fetches, none repeated.
    assert_eq!(upstream.fetches(), 2);
}

#[test]
fn session_identity_is_stable_for_identical_queries() {
    let upstream = UpstreamStub::new(Vec::new());
    let first = open_session(&upstream, Vec::new());
    let second = open_session(&upstream, Vec::new());
    assert_eq!(first.compiled().cache_key(), second.compiled().cache_key());
}

#[test]
fn flat_serialization_covers_observed_and_synthetic_records() {
    let upstream = UpstreamStub::new(vec![catch_entry(2, 21720)]);
    let session = open_session(&upstream, vec![reference_haul(1), reference_haul(2)]);

    for record in session.map(must_ok) {
        let flat = record.to_flat();
        for field in trawlgap_core::FIELD_NAMES {
            assert!(flat.contains_key(field), "missing flat field {field}");
        }
        assert_eq!(
            flat["record_origin"],
            json!(record.origin().as_str()),
        );
    }
}
