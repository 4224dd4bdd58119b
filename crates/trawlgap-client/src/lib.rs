//! Lazy iteration over presence catch records with zero-catch inference.
//!
//! A session is opened through [`QueryBuilder`], which compiles the filter
//! set before any network traffic and returns a [`RecordStream`]: observed
//! records stream first, page by page, and once the upstream is exhausted
//! the stream optionally synthesizes zero-catch records for every
//! (reference haul, seen species) pair the upstream never reported.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::Rc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use trawlgap_core::{
    compile_query, decode_record, record_matches, CompiledQuery, HaulReference, InvalidEntry,
    Operand, Predicate, QueryError, Record, SpeciesRef,
};

pub const DEFAULT_PAGE_SIZE: u64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("query compilation failed: {0}")]
    Query(#[from] QueryError),
    #[error("page fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("reference haul provider failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("absence inference misconfigured: {0}")]
    Configuration(String),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {status} fetching {url}")]
    Status { status: u16, url: String },
    #[error("malformed page payload: {0}")]
    Payload(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {status} fetching {url}")]
    Status { status: u16, url: String },
    #[error("malformed haul snapshot: {0}")]
    Snapshot(String),
}

/// One decoded page payload: the raw item array plus the upstream's
/// more-pages indicator.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPage {
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(rename = "hasMore", default = "default_has_more")]
    pub has_more: bool,
}

// Some deployments omit hasMore; the short-page heuristic still terminates.
fn default_has_more() -> bool {
    true
}

/// One synchronous round trip per page window. Retry and backoff policy
/// belongs to the transport the implementation wraps, never here.
pub trait PageFetcher {
    /// # Errors
    /// Returns [`FetchError`] on transport failure, non-success status,
    /// or an undecodable response body.
    fn fetch_page(&self, query: &CompiledQuery) -> Result<RawPage, FetchError>;
}

/// [`PageFetcher`] backed by a blocking HTTP client.
pub struct HttpPageFetcher {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpPageFetcher {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::blocking::Client::new(), base_url)
    }

    /// Wraps a caller-configured client; timeouts, TLS, and pooling are
    /// the caller's concern.
    #[must_use]
    pub fn with_client(client: reqwest::blocking::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

impl PageFetcher for HttpPageFetcher {
    fn fetch_page(&self, query: &CompiledQuery) -> Result<RawPage, FetchError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("q", query.q())])
            .query(&[("limit", query.limit()), ("offset", query.offset())])
            .send()?;

        let status = response.status();
        let url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let page: RawPage = response
            .json()
            .map_err(|err| FetchError::Payload(format!("{url}: {err}")))?;
        debug!(
            offset = query.offset(),
            items = page.items.len(),
            has_more = page.has_more,
            "fetched page"
        );
        Ok(page)
    }
}

/// Append-only log of undecodable payload fragments, populated only while
/// the owning stream is consumed. The handle is cheap to clone and shares
/// the underlying log; it is deliberately not `Send` — a concurrent
/// consumer needs its own synchronization layer.
#[derive(Debug, Clone, Default)]
pub struct InvalidEntryLog {
    entries: Rc<RefCell<Vec<InvalidEntry>>>,
}

impl InvalidEntryLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, entry: InvalidEntry) {
        self.entries.borrow_mut().push(entry);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Contents accumulated so far, leaving the log intact.
    #[must_use]
    pub fn snapshot(&self) -> Vec<InvalidEntry> {
        self.entries.borrow().clone()
    }

    /// Removes and returns everything accumulated so far.
    pub fn drain(&self) -> Vec<InvalidEntry> {
        self.entries.borrow_mut().drain(..).collect()
    }
}

/// Supplies the universe of hauls for one (survey, year), with their
/// environmental covariates.
pub trait HaulProvider {
    /// # Errors
    /// Returns [`ProviderError`] when the backing snapshot cannot be
    /// reached or decoded.
    fn hauls(&self, srvy: &str, year: i64) -> Result<Vec<HaulReference>, ProviderError>;
}

/// [`HaulProvider`] backed by a remote flat-file snapshot endpoint.
pub struct HttpHaulProvider {
    client: reqwest::blocking::Client,
    snapshot_url: String,
}

impl HttpHaulProvider {
    #[must_use]
    pub fn new(snapshot_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::blocking::Client::new(), snapshot_url)
    }

    #[must_use]
    pub fn with_client(
        client: reqwest::blocking::Client,
        snapshot_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            snapshot_url: snapshot_url.into(),
        }
    }
}

impl HaulProvider for HttpHaulProvider {
    fn hauls(&self, srvy: &str, year: i64) -> Result<Vec<HaulReference>, ProviderError> {
        let response = self
            .client
            .get(&self.snapshot_url)
            .query(&[("srvy", srvy)])
            .query(&[("year", year)])
            .send()?;

        let status = response.status();
        let url = response.url().to_string();
        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                url,
            });
        }

        response
            .json()
            .map_err(|err| ProviderError::Snapshot(format!("{url}: {err}")))
    }
}

/// In-memory [`HaulProvider`] for tests and pre-joined snapshots.
#[derive(Debug, Clone, Default)]
pub struct FixtureHaulProvider {
    hauls: Vec<HaulReference>,
}

impl FixtureHaulProvider {
    #[must_use]
    pub fn new(hauls: Vec<HaulReference>) -> Self {
        Self { hauls }
    }
}

impl HaulProvider for FixtureHaulProvider {
    fn hauls(&self, srvy: &str, year: i64) -> Result<Vec<HaulReference>, ProviderError> {
        Ok(self
            .hauls
            .iter()
            .filter(|haul| haul.srvy == srvy && haul.year == year)
            .cloned()
            .collect())
    }
}

/// Session-scoped bookkeeping over yielded records: identifiers only,
/// never record bodies.
#[derive(Debug, Default)]
struct PresenceState {
    hauls_seen: HashSet<i64>,
    species_seen: HashMap<i64, SpeciesRef>,
    species_by_haul: HashMap<i64, HashSet<i64>>,
}

impl PresenceState {
    fn observe(&mut self, record: &Record) {
        self.hauls_seen.insert(record.haul());
        self.species_seen
            .entry(record.species_code())
            .or_insert_with(|| SpeciesRef {
                species_code: record.species_code(),
                scientific_name: record.scientific_name().to_string(),
                common_name: record.common_name().to_string(),
            });
        self.species_by_haul
            .entry(record.haul())
            .or_default()
            .insert(record.species_code());
    }
}

/// Emits one zero-catch record per pull for every unsatisfied
/// (reference haul, seen species) pair, ascending haul id then ascending
/// species code.
struct ZeroCatchSynthesizer {
    hauls: Vec<HaulReference>,
    species: Vec<SpeciesRef>,
    satisfied: HashMap<i64, HashSet<i64>>,
    haul_idx: usize,
    species_idx: usize,
}

impl ZeroCatchSynthesizer {
    fn new(mut hauls: Vec<HaulReference>, state: PresenceState) -> Self {
        hauls.sort_by_key(|haul| haul.haul);
        let mut species: Vec<SpeciesRef> = state.species_seen.into_values().collect();
        species.sort_by_key(|species| species.species_code);
        Self {
            hauls,
            species,
            satisfied: state.species_by_haul,
            haul_idx: 0,
            species_idx: 0,
        }
    }

    fn next_zero_catch(&mut self) -> Option<Record> {
        while self.haul_idx < self.hauls.len() {
            let haul = &self.hauls[self.haul_idx];
            while self.species_idx < self.species.len() {
                let species = &self.species[self.species_idx];
                self.species_idx += 1;
                let caught = self
                    .satisfied
                    .get(&haul.haul)
                    .is_some_and(|seen| seen.contains(&species.species_code));
                if !caught {
                    return Some(Record::zero_catch(haul, species));
                }
            }
            self.species_idx = 0;
            self.haul_idx += 1;
        }
        None
    }
}

/// Builder for one iteration session against the remote service.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    filters: BTreeMap<String, Predicate>,
    page_size: u64,
    require_complete: bool,
    infer_absence: bool,
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            filters: BTreeMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
            require_complete: false,
            infer_absence: false,
        }
    }

    #[must_use]
    pub fn filter(mut self, field: impl Into<String>, predicate: Predicate) -> Self {
        self.filters.insert(field.into(), predicate);
        self
    }

    #[must_use]
    pub fn page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    /// Opt-in: drop records failing [`Record::is_complete`] instead of
    /// yielding them.
    #[must_use]
    pub fn require_complete(mut self, require: bool) -> Self {
        self.require_complete = require;
        self
    }

    /// Opt-in: once presence is exhausted, synthesize zero-catch records
    /// from a reference haul provider.
    #[must_use]
    pub fn infer_absence(mut self, infer: bool) -> Self {
        self.infer_absence = infer;
        self
    }

    /// Compiles the filter set and opens an iteration session. The first
    /// page is not fetched until the stream is first pulled.
    ///
    /// # Errors
    /// Returns [`ClientError::Query`] for predicate compile failures, and
    /// [`ClientError::Configuration`] when absence inference is requested
    /// without a provider or without `srvy`/`year` equality filters —
    /// both before any network activity.
    pub fn build(
        self,
        fetcher: Box<dyn PageFetcher>,
        provider: Option<Box<dyn HaulProvider>>,
    ) -> Result<RecordStream, ClientError> {
        let base = compile_query(&self.filters, self.page_size, 0)?;

        let scope = if self.infer_absence {
            if provider.is_none() {
                return Err(ClientError::Configuration(
                    "absence inference requires a reference haul provider".to_string(),
                ));
            }
            Some(absence_scope(&self.filters)?)
        } else {
            None
        };

        Ok(RecordStream {
            fetcher,
            provider,
            filters: self.filters,
            base,
            page_size: self.page_size,
            next_offset: 0,
            pending: VecDeque::new(),
            upstream_exhausted: false,
            require_complete: self.require_complete,
            absence_scope: scope,
            presence: PresenceState::default(),
            invalid: InvalidEntryLog::new(),
            phase: StreamPhase::Presence,
        })
    }
}

fn absence_scope(filters: &BTreeMap<String, Predicate>) -> Result<(String, i64), ClientError> {
    let srvy = match filters.get("srvy") {
        Some(Predicate::Equals(Operand::Text(code))) => code.clone(),
        _ => {
            return Err(ClientError::Configuration(
                "absence inference requires an srvy equality filter".to_string(),
            ))
        }
    };
    let year = match filters.get("year") {
        Some(Predicate::Equals(Operand::Int(year))) => *year,
        _ => {
            return Err(ClientError::Configuration(
                "absence inference requires a year equality filter".to_string(),
            ))
        }
    };
    Ok((srvy, year))
}

enum StreamPhase {
    Presence,
    Synthesis(ZeroCatchSynthesizer),
    Exhausted,
}

/// Pull-based iteration session. Observed records are yielded strictly
/// before any synthetic record; synthetic records are gated through the
/// filter emulator so inferred data obeys the original predicates.
pub struct RecordStream {
    fetcher: Box<dyn PageFetcher>,
    provider: Option<Box<dyn HaulProvider>>,
    filters: BTreeMap<String, Predicate>,
    base: CompiledQuery,
    page_size: u64,
    next_offset: u64,
    pending: VecDeque<Value>,
    upstream_exhausted: bool,
    require_complete: bool,
    absence_scope: Option<(String, i64)>,
    presence: PresenceState,
    invalid: InvalidEntryLog,
    phase: StreamPhase,
}

impl std::fmt::Debug for RecordStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStream")
            .field("filters", &self.filters)
            .field("base", &self.base)
            .field("page_size", &self.page_size)
            .field("next_offset", &self.next_offset)
            .field("upstream_exhausted", &self.upstream_exhausted)
            .field("require_complete", &self.require_complete)
            .field("absence_scope", &self.absence_scope)
            .finish_non_exhaustive()
    }
}

impl RecordStream {
    /// Cloneable handle onto the session's invalid entry log.
    #[must_use]
    pub fn invalid_log(&self) -> InvalidEntryLog {
        self.invalid.clone()
    }

    /// Invalid entries accumulated so far, leaving the log intact.
    #[must_use]
    pub fn invalid_entries(&self) -> Vec<InvalidEntry> {
        self.invalid.snapshot()
    }

    /// The compiled query identity for this session at offset zero.
    #[must_use]
    pub fn compiled(&self) -> &CompiledQuery {
        &self.base
    }

    /// One bounded fetch+decode cycle at an arbitrary window. Does not
    /// advance the session iterator, touch its presence bookkeeping, or
    /// append to its invalid entry log; undecodable entries are counted
    /// and dropped.
    ///
    /// # Errors
    /// Returns [`ClientError::Fetch`] on transport or payload failure.
    pub fn get_page(&self, offset: u64, limit: u64) -> Result<Vec<Record>, ClientError> {
        let window = self.base.with_window(offset, limit);
        let page = self.fetcher.fetch_page(&window)?;

        let mut records = Vec::with_capacity(page.items.len());
        let mut dropped = 0_usize;
        for item in &page.items {
            match decode_record(item) {
                Ok(record) => records.push(record),
                Err(_) => dropped += 1,
            }
        }
        if dropped > 0 {
            debug!(offset, dropped, "dropped undecodable entries from random-access page");
        }
        Ok(records)
    }

    fn fetch_next_page(&mut self) -> Result<(), FetchError> {
        let window = self.base.with_window(self.next_offset, self.page_size);
        let page = self.fetcher.fetch_page(&window)?;

        let received = u64::try_from(page.items.len()).unwrap_or(u64::MAX);
        if !page.has_more || received == 0 || received < self.page_size {
            self.upstream_exhausted = true;
        }
        self.next_offset += self.page_size;
        self.pending.extend(page.items);
        Ok(())
    }

    fn begin_synthesis(&mut self) -> Result<StreamPhase, ClientError> {
        let Some((srvy, year)) = self.absence_scope.clone() else {
            return Ok(StreamPhase::Exhausted);
        };
        let Some(provider) = self.provider.as_deref() else {
            return Err(ClientError::Configuration(
                "absence inference requires a reference haul provider".to_string(),
            ));
        };

        let hauls = provider.hauls(&srvy, year)?;
        let state = std::mem::take(&mut self.presence);

        let known: HashSet<i64> = hauls.iter().map(|haul| haul.haul).collect();
        let unreferenced = state
            .hauls_seen
            .iter()
            .filter(|&haul| !known.contains(haul))
            .count();
        if unreferenced > 0 {
            warn!(
                unreferenced,
                "observed hauls missing from the reference snapshot"
            );
        }

        debug!(
            hauls = hauls.len(),
            species = state.species_seen.len(),
            "presence exhausted, synthesizing zero-catch records"
        );
        Ok(StreamPhase::Synthesis(ZeroCatchSynthesizer::new(
            hauls, state,
        )))
    }
}

impl Iterator for RecordStream {
    type Item = Result<Record, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.phase {
                StreamPhase::Presence => {
                    if let Some(raw) = self.pending.pop_front() {
                        match decode_record(&raw) {
                            Ok(record) => {
                                if record.longitude_dd() > 0.0 {
                                    warn!(
                                        haul = record.haul(),
                                        longitude = record.longitude_dd(),
                                        "positive longitude where negative expected, preserving raw value"
                                    );
                                }
                                self.presence.observe(&record);
                                if self.require_complete && !record.is_complete() {
                                    continue;
                                }
                                return Some(Ok(record));
                            }
                            Err(entry) => {
                                warn!(reason = entry.reason.as_str(), "rejected undecodable entry");
                                self.invalid.push(entry);
                                continue;
                            }
                        }
                    }

                    if !self.upstream_exhausted {
                        if let Err(err) = self.fetch_next_page() {
                            self.phase = StreamPhase::Exhausted;
                            return Some(Err(err.into()));
                        }
                        continue;
                    }

                    match self.begin_synthesis() {
                        Ok(phase) => self.phase = phase,
                        Err(err) => {
                            self.phase = StreamPhase::Exhausted;
                            return Some(Err(err));
                        }
                    }
                }
                StreamPhase::Synthesis(synthesizer) => {
                    while let Some(record) = synthesizer.next_zero_catch() {
                        if record_matches(&record, &self.filters) {
                            return Some(Ok(record));
                        }
                    }
                    self.phase = StreamPhase::Exhausted;
                }
                StreamPhase::Exhausted => return None,
            }
        }
    }
}
