//! Filter, sort and paginate a record set into the visible page.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ConfidenceTier, ParseLabelError, ProductRef, Record, RecordStatus};

pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Filter half of a query. Also the argument of the id-only enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    #[serde(default)]
    pub search_term: String,
    #[serde(default)]
    pub status: Option<RecordStatus>,
    #[serde(default)]
    pub confidence_tier: Option<ConfidenceTier>,
    #[serde(default)]
    pub source: Option<String>,
}

impl RecordFilter {
    pub fn matches(&self, record: &Record) -> bool {
        self.matches_search(record)
            && self.status.map_or(true, |status| record.status == status)
            && self
                .confidence_tier
                .map_or(true, |tier| ConfidenceTier::classify(record.confidence()) == tier)
            && self
                .source
                .as_deref()
                .map_or(true, |source| record.source.as_deref() == Some(source))
    }

    fn matches_search(&self, record: &Record) -> bool {
        let needle = self.search_term.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        let contains = |haystack: &str| haystack.to_lowercase().contains(&needle);
        if contains(record.original_name.as_str()) {
            return true;
        }
        let matched = record
            .selected_match
            .iter()
            .chain(record.best_candidate().map(|c| &c.product));
        matched.into_iter().any(|product| product_matches(product, &contains))
    }
}

fn product_matches(product: &ProductRef, contains: &impl Fn(&str) -> bool) -> bool {
    contains(product.name.as_str())
        || [&product.brand, &product.company, &product.code]
            .into_iter()
            .flatten()
            .any(|field| contains(field.as_str()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    ConfidenceDesc,
    ConfidenceAsc,
    PriceDesc,
    PriceAsc,
    NameAsc,
    NameDesc,
    Status,
}

impl SortKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::ConfidenceDesc => "confidence_desc",
            SortKey::ConfidenceAsc => "confidence_asc",
            SortKey::PriceDesc => "price_desc",
            SortKey::PriceAsc => "price_asc",
            SortKey::NameAsc => "name_asc",
            SortKey::NameDesc => "name_desc",
            SortKey::Status => "status",
        }
    }

    fn compare(&self, a: &Record, b: &Record) -> Ordering {
        match self {
            SortKey::ConfidenceDesc => b.confidence().total_cmp(&a.confidence()),
            SortKey::ConfidenceAsc => a.confidence().total_cmp(&b.confidence()),
            SortKey::PriceDesc => price_of(b).total_cmp(&price_of(a)),
            SortKey::PriceAsc => price_of(a).total_cmp(&price_of(b)),
            SortKey::NameAsc => cmp_ignore_case(&a.original_name, &b.original_name),
            SortKey::NameDesc => cmp_ignore_case(&b.original_name, &a.original_name),
            SortKey::Status => a.status.as_str().cmp(b.status.as_str()),
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortKey {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        [
            SortKey::ConfidenceDesc,
            SortKey::ConfidenceAsc,
            SortKey::PriceDesc,
            SortKey::PriceAsc,
            SortKey::NameAsc,
            SortKey::NameDesc,
            SortKey::Status,
        ]
        .into_iter()
        .find(|key| key.as_str() == needle)
        .ok_or_else(|| ParseLabelError {
            kind: "sort key",
            value: s.to_string(),
        })
    }
}

fn price_of(record: &Record) -> f64 {
    record.price.unwrap_or(0.0)
}

fn cmp_ignore_case(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

/// Filter, sort and page position. Mutators keep the page-reset invariant:
/// any filter or sort change moves back to page 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuerySpec {
    filter: RecordFilter,
    sort: SortKey,
    page: usize,
    page_size: usize,
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl QuerySpec {
    pub fn new(page_size: usize) -> Self {
        Self {
            filter: RecordFilter::default(),
            sort: SortKey::default(),
            page: 1,
            page_size: page_size.max(1),
        }
    }

    pub fn filter(&self) -> &RecordFilter {
        &self.filter
    }

    pub fn sort(&self) -> SortKey {
        self.sort
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Each `set_*` filter mutator returns whether the filter actually changed.
    pub fn set_search_term(&mut self, term: impl Into<String>) -> bool {
        let term = term.into();
        self.page = 1;
        replace_if_changed(&mut self.filter.search_term, term)
    }

    pub fn set_status_filter(&mut self, status: Option<RecordStatus>) -> bool {
        self.page = 1;
        replace_if_changed(&mut self.filter.status, status)
    }

    pub fn set_confidence_tier(&mut self, tier: Option<ConfidenceTier>) -> bool {
        self.page = 1;
        replace_if_changed(&mut self.filter.confidence_tier, tier)
    }

    pub fn set_source_filter(&mut self, source: Option<String>) -> bool {
        self.page = 1;
        replace_if_changed(&mut self.filter.source, source)
    }

    pub fn set_filter(&mut self, filter: RecordFilter) -> bool {
        self.page = 1;
        replace_if_changed(&mut self.filter, filter)
    }

    pub fn set_sort(&mut self, sort: SortKey) -> bool {
        self.page = 1;
        replace_if_changed(&mut self.sort, sort)
    }

    pub fn set_page_size(&mut self, page_size: usize) {
        self.page = 1;
        self.page_size = page_size.max(1);
    }

    /// Moves to `page` (1-indexed) without touching filters.
    pub fn set_page(&mut self, page: usize) {
        self.page = page.max(1);
    }

    /// Pulls the page back inside `1..=total_pages` after the data shrank.
    pub fn clamp_page(&mut self, total_pages: usize) {
        self.page = self.page.clamp(1, total_pages.max(1));
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

/// The page a reviewer sees plus the counts the pager and facets need.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageView {
    pub rows: Vec<Record>,
    pub page: usize,
    pub page_size: usize,
    pub total_count: usize,
    pub total_pages: usize,
    pub status_counts: BTreeMap<String, usize>,
    pub source_counts: BTreeMap<String, usize>,
}

impl PageView {
    pub fn row_ids(&self) -> Vec<crate::RecordId> {
        self.rows.iter().map(|r| r.id.clone()).collect()
    }
}

pub fn total_pages(total_count: usize, page_size: usize) -> usize {
    total_count.div_ceil(page_size.max(1))
}

/// 1-indexed page holding position `index` of the filtered order.
pub fn page_of_index(index: usize, page_size: usize) -> usize {
    index / page_size.max(1) + 1
}

/// Every record matching the filter, in sort order. Ties keep input order.
pub fn filtered_order<'a>(records: &'a [Record], query: &QuerySpec) -> Vec<&'a Record> {
    let mut ordered = records
        .iter()
        .filter(|r| query.filter.matches(r))
        .collect::<Vec<_>>();
    ordered.sort_by(|a, b| query.sort.compare(a, b));
    ordered
}

pub fn apply(records: &[Record], query: &QuerySpec) -> PageView {
    let ordered = filtered_order(records, query);
    let total_count = ordered.len();
    let start = (query.page - 1).saturating_mul(query.page_size);
    let rows = ordered
        .into_iter()
        .skip(start)
        .take(query.page_size)
        .cloned()
        .collect::<Vec<_>>();

    PageView {
        rows,
        page: query.page,
        page_size: query.page_size,
        total_count,
        total_pages: total_pages(total_count, query.page_size),
        status_counts: status_facets(records, &query.filter),
        source_counts: source_facets(records, &query.filter),
    }
}

fn status_facets(records: &[Record], filter: &RecordFilter) -> BTreeMap<String, usize> {
    let without_status = RecordFilter {
        status: None,
        ..filter.clone()
    };
    let mut counts = BTreeMap::new();
    for record in records.iter().filter(|r| without_status.matches(r)) {
        *counts.entry(record.status.as_str().to_string()).or_default() += 1;
    }
    counts
}

fn source_facets(records: &[Record], filter: &RecordFilter) -> BTreeMap<String, usize> {
    let without_source = RecordFilter {
        source: None,
        ..filter.clone()
    };
    let mut counts = BTreeMap::new();
    for record in records.iter().filter(|r| without_source.matches(r)) {
        if let Some(source) = &record.source {
            *counts.entry(source.clone()).or_default() += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Candidate, Score};

    fn scored(id: &str, name: &str, score: f64) -> Record {
        Record::new(id, name, RecordStatus::Pending).with_candidates(vec![Candidate::new(
            ProductRef::new(format!("p-{id}"), format!("{name} product")),
            Some(Score::Numeric(score)),
        )])
    }

    fn ids(rows: &[Record]) -> Vec<&str> {
        rows.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn confidence_tier_filter_boundaries() {
        let records = vec![scored("a", "A", 90.0), scored("b", "B", 70.0), scored("c", "C", 69.9)];
        let mut query = QuerySpec::default();

        query.set_confidence_tier(Some(ConfidenceTier::High));
        assert_eq!(ids(&apply(&records, &query).rows), vec!["a"]);
        query.set_confidence_tier(Some(ConfidenceTier::Medium));
        assert_eq!(ids(&apply(&records, &query).rows), vec!["b"]);
        query.set_confidence_tier(Some(ConfidenceTier::Low));
        assert_eq!(ids(&apply(&records, &query).rows), vec!["c"]);
    }

    #[test]
    fn records_without_candidates_are_low_confidence() {
        let records = vec![Record::new("x", "Unmatched", RecordStatus::Exception)];
        let mut query = QuerySpec::default();
        query.set_confidence_tier(Some(ConfidenceTier::Low));
        assert_eq!(apply(&records, &query).total_count, 1);
    }

    #[test]
    fn every_filter_or_sort_change_resets_page() {
        let mut query = QuerySpec::new(10);
        let changes: Vec<Box<dyn Fn(&mut QuerySpec)>> = vec![
            Box::new(|q| {
                q.set_search_term("cola");
            }),
            Box::new(|q| {
                q.set_status_filter(Some(RecordStatus::Exception));
            }),
            Box::new(|q| {
                q.set_confidence_tier(Some(ConfidenceTier::High));
            }),
            Box::new(|q| {
                q.set_source_filter(Some("upload-7".into()));
            }),
            Box::new(|q| {
                q.set_sort(SortKey::PriceAsc);
            }),
        ];
        for change in changes {
            query.set_page(4);
            change(&mut query);
            assert_eq!(query.page(), 1);
        }
    }

    #[test]
    fn page_change_keeps_filters() {
        let mut query = QuerySpec::new(10);
        query.set_search_term("cola");
        query.set_page(3);
        assert_eq!(query.page(), 3);
        assert_eq!(query.filter().search_term, "cola");
    }

    #[test]
    fn search_matches_name_brand_company_and_code() {
        let mut record = scored("a", "COLA 330ML", 80.0);
        record.candidates[0].product.brand = Some("Fizzco".into());
        record.candidates[0].product.company = Some("Bottlers Ltd".into());
        record.candidates[0].product.code = Some("SKU-991".into());
        let records = vec![record, scored("b", "Water 1L", 80.0)];

        for term in ["cola", "fizzco", "BOTTLERS", "sku-991"] {
            let mut query = QuerySpec::default();
            query.set_search_term(term);
            assert_eq!(ids(&apply(&records, &query).rows), vec!["a"], "term {term}");
        }
    }

    #[test]
    fn search_checks_selected_match() {
        let mut record = scored("a", "Item 1", 80.0);
        record.selected_match = Some(ProductRef::new("p-77", "Sparkling Lemonade"));
        let mut query = QuerySpec::default();
        query.set_search_term("lemonade");
        assert_eq!(apply(&[record], &query).total_count, 1);
    }

    #[test]
    fn filters_compose_with_and() {
        let records = vec![
            scored("a", "Cola", 95.0).with_source("s1"),
            scored("b", "Cola", 95.0).with_source("s2"),
            scored("c", "Cola", 50.0).with_source("s1"),
        ];
        let mut query = QuerySpec::default();
        query.set_search_term("cola");
        query.set_source_filter(Some("s1".into()));
        query.set_confidence_tier(Some(ConfidenceTier::High));
        assert_eq!(ids(&apply(&records, &query).rows), vec!["a"]);
    }

    #[test]
    fn sort_is_stable_for_equal_keys() {
        let records = vec![
            scored("a", "A", 80.0),
            scored("b", "B", 90.0),
            scored("c", "C", 80.0),
            scored("d", "D", 80.0),
        ];
        let query = QuerySpec::default();
        for _ in 0..3 {
            assert_eq!(ids(&apply(&records, &query).rows), vec!["b", "a", "c", "d"]);
        }
    }

    #[test]
    fn sorts_by_price_name_and_status() {
        let mut records = vec![
            scored("a", "banana", 10.0).with_price(3.5),
            scored("b", "Apple", 10.0),
            scored("c", "cherry", 10.0).with_price(1.25),
        ];
        records[1].status = RecordStatus::Exception;
        let mut query = QuerySpec::default();

        query.set_sort(SortKey::PriceDesc);
        assert_eq!(ids(&apply(&records, &query).rows), vec!["a", "c", "b"]);
        query.set_sort(SortKey::PriceAsc);
        assert_eq!(ids(&apply(&records, &query).rows), vec!["b", "c", "a"]);
        query.set_sort(SortKey::NameAsc);
        assert_eq!(ids(&apply(&records, &query).rows), vec!["b", "a", "c"]);
        query.set_sort(SortKey::NameDesc);
        assert_eq!(ids(&apply(&records, &query).rows), vec!["c", "a", "b"]);
        query.set_sort(SortKey::Status);
        assert_eq!(ids(&apply(&records, &query).rows), vec!["b", "a", "c"]);
    }

    #[test]
    fn empty_result_has_zero_pages() {
        let view = apply(&[], &QuerySpec::default());
        assert_eq!(view.total_count, 0);
        assert_eq!(view.total_pages, 0);
        assert!(view.rows.is_empty());
    }

    #[test]
    fn pagination_is_one_indexed_and_ceil_divided() {
        let records = (0..7)
            .map(|i| scored(&format!("r{i}"), "x", 50.0))
            .collect::<Vec<_>>();
        let mut query = QuerySpec::new(3);
        let first = apply(&records, &query);
        assert_eq!(first.total_pages, 3);
        assert_eq!(ids(&first.rows), vec!["r0", "r1", "r2"]);

        query.set_page(3);
        assert_eq!(ids(&apply(&records, &query).rows), vec!["r6"]);
        query.set_page(4);
        assert!(apply(&records, &query).rows.is_empty());
    }

    #[test]
    fn clamp_page_pulls_back_into_range() {
        let mut query = QuerySpec::new(10);
        query.set_page(6);
        query.clamp_page(2);
        assert_eq!(query.page(), 2);
        query.clamp_page(0);
        assert_eq!(query.page(), 1);
    }

    #[test]
    fn page_of_index_maps_positions() {
        assert_eq!(page_of_index(0, 10), 1);
        assert_eq!(page_of_index(9, 10), 1);
        assert_eq!(page_of_index(10, 10), 2);
    }

    #[test]
    fn facet_counts_ignore_their_own_filter() {
        let mut records = vec![
            scored("a", "Cola", 95.0).with_source("s1"),
            scored("b", "Cola", 95.0).with_source("s2"),
            scored("c", "Water", 95.0).with_source("s1"),
        ];
        records[1].status = RecordStatus::Confirmed;
        let mut query = QuerySpec::default();
        query.set_search_term("cola");
        query.set_status_filter(Some(RecordStatus::Pending));
        query.set_source_filter(Some("s1".into()));

        let view = apply(&records, &query);
        assert_eq!(view.total_count, 1);
        assert_eq!(view.status_counts.get("pending"), Some(&1));
        assert_eq!(view.status_counts.get("confirmed"), None);
        assert_eq!(view.source_counts.get("s1"), Some(&1));
        assert_eq!(view.source_counts.get("s2"), None);
    }

    #[test]
    fn sort_keys_round_trip_through_labels() {
        assert_eq!("price_desc".parse::<SortKey>().unwrap(), SortKey::PriceDesc);
        assert!("random".parse::<SortKey>().is_err());
    }
}
