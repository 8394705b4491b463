//! In-memory [`AggregateStore`] that evaluates grouping pipelines locally.
//!
//! Supports the stages this crate emits: `$match` (implicit equality,
//! `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$exists`, `$and`,
//! `$or`), `$unwind`, `$group` (`$sum`, `$avg`, `$min`, `$max`, `$first`,
//! `$last`, `$push`, `$count`) and `$sort`. Every `aggregate` call is counted,
//! and failures or latency can be injected.

use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::time::Duration;

use mongodb::bson::{Bson, Document};
use thiserror::Error;

use crate::store::{AggregateStore, ResultCursor};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MemoryStoreError {
    #[error("unsupported stage: {0}")]
    UnsupportedStage(String),

    #[error("invalid stage: {0}")]
    InvalidStage(String),

    #[error("{0}")]
    Injected(String),
}

type StoreResult<T> = std::result::Result<T, MemoryStoreError>;

fn invalid(msg: impl Into<String>) -> MemoryStoreError {
    MemoryStoreError::InvalidStage(msg.into())
}

// ---------------------------------------------------------------------------
// Store & cursor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    docs: Vec<Document>,
    calls: Arc<AtomicUsize>,
    latency: Option<Duration>,
    fail_aggregate: Option<String>,
    fail_drain: Option<String>,
}

impl MemoryStore {
    pub fn new(docs: Vec<Document>) -> Self {
        Self {
            docs,
            ..Self::default()
        }
    }

    /// Sleep this long inside every `aggregate` call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn failing_aggregate(mut self, msg: impl Into<String>) -> Self {
        self.fail_aggregate = Some(msg.into());
        self
    }

    pub fn failing_drain(mut self, msg: impl Into<String>) -> Self {
        self.fail_drain = Some(msg.into());
        self
    }

    /// Number of `aggregate` calls that reached the store.
    pub fn aggregate_calls(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }

    pub fn documents(&self) -> &[Document] {
        &self.docs
    }
}

impl AggregateStore for MemoryStore {
    type Cursor = MemoryCursor;
    type Error = MemoryStoreError;

    async fn aggregate(&self, pipeline: Vec<Document>) -> StoreResult<MemoryCursor> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(msg) = &self.fail_aggregate {
            return Err(MemoryStoreError::Injected(msg.clone()));
        }
        let docs = run_pipeline(self.docs.clone(), &pipeline)?;
        Ok(MemoryCursor {
            docs,
            fail: self.fail_drain.clone(),
        })
    }
}

#[derive(Debug)]
pub struct MemoryCursor {
    docs: Vec<Document>,
    fail: Option<String>,
}

impl ResultCursor for MemoryCursor {
    type Error = MemoryStoreError;

    async fn drain_all(self) -> StoreResult<Vec<Document>> {
        match self.fail {
            Some(msg) => Err(MemoryStoreError::Injected(msg)),
            None => Ok(self.docs),
        }
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn resolve_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        match current {
            Bson::Document(inner) => current = inner.get(part)?,
            _ => return None,
        }
    }
    Some(current)
}

fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(inner)) = doc.get_mut(head) {
                set_path(inner, rest, value);
            }
        }
    }
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(inner)) = doc.get_mut(head) {
                remove_path(inner, rest);
            }
        }
    }
}

fn field_ref(value: &Bson) -> Option<&str> {
    match value {
        Bson::String(s) if s.len() > 1 && s.starts_with('$') => Some(&s[1..]),
        _ => None,
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Cross-type ordering: null, numbers, strings, documents, arrays, booleans,
/// dates, everything else.
fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        _ => 10,
    }
}

fn compare(a: &Bson, b: &Bson) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Array(x), Bson::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let cmp = compare(l, r);
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

// ---------------------------------------------------------------------------
// $match
// ---------------------------------------------------------------------------

fn matches(doc: &Document, filter: &Document) -> StoreResult<bool> {
    for (key, cond) in filter {
        let ok = match key.as_str() {
            "$and" | "$or" => {
                let subs = match cond {
                    Bson::Array(arr) => arr,
                    _ => return Err(invalid(format!("{key} must be an array"))),
                };
                let mut results = Vec::with_capacity(subs.len());
                for sub in subs {
                    match sub {
                        Bson::Document(f) => results.push(matches(doc, f)?),
                        _ => return Err(invalid(format!("{key} entries must be documents"))),
                    }
                }
                if key == "$and" {
                    results.into_iter().all(|r| r)
                } else {
                    results.into_iter().any(|r| r)
                }
            }
            field => field_matches(resolve_path(doc, field), cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn field_matches(value: Option<&Bson>, cond: &Bson) -> StoreResult<bool> {
    let ops = match cond {
        Bson::Document(ops) if ops.keys().any(|k| k.starts_with('$')) => ops,
        _ => return Ok(eq_matches(value, cond)),
    };
    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => eq_matches(value, arg),
            "$ne" => !eq_matches(value, arg),
            "$gt" => value.is_some_and(|v| same_class(v, arg) && compare(v, arg).is_gt()),
            "$gte" => value.is_some_and(|v| same_class(v, arg) && compare(v, arg).is_ge()),
            "$lt" => value.is_some_and(|v| same_class(v, arg) && compare(v, arg).is_lt()),
            "$lte" => value.is_some_and(|v| same_class(v, arg) && compare(v, arg).is_le()),
            "$in" => match arg {
                Bson::Array(candidates) => candidates.iter().any(|c| eq_matches(value, c)),
                _ => return Err(invalid("$in must be an array")),
            },
            "$exists" => match arg {
                Bson::Boolean(wanted) => value.is_some() == *wanted,
                _ => return Err(invalid("$exists must be a boolean")),
            },
            other => return Err(MemoryStoreError::UnsupportedStage(format!("$match operator {other}"))),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn same_class(a: &Bson, b: &Bson) -> bool {
    type_rank(a) == type_rank(b)
}

/// Missing equals null; an array field matches if any element does.
fn eq_matches(value: Option<&Bson>, target: &Bson) -> bool {
    match value {
        None => matches!(target, Bson::Null),
        Some(Bson::Array(items)) if !matches!(target, Bson::Array(_)) => {
            items.iter().any(|item| values_equal(item, target))
        }
        Some(v) => values_equal(v, target),
    }
}

fn exec_match(docs: Vec<Document>, filter: &Document) -> StoreResult<Vec<Document>> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        if matches(&doc, filter)? {
            out.push(doc);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// $unwind
// ---------------------------------------------------------------------------

fn parse_unwind(body: &Bson) -> StoreResult<(String, bool)> {
    match body {
        Bson::String(_) => {
            let path = field_ref(body).ok_or_else(|| invalid("$unwind path must start with $"))?;
            Ok((path.to_string(), false))
        }
        Bson::Document(spec) => {
            let raw = spec
                .get("path")
                .ok_or_else(|| invalid("$unwind requires 'path' string"))?;
            let path = field_ref(raw).ok_or_else(|| invalid("$unwind path must start with $"))?;
            let preserve = spec
                .get_bool("preserveNullAndEmptyArrays")
                .unwrap_or(false);
            Ok((path.to_string(), preserve))
        }
        _ => Err(invalid("$unwind must be a string or document")),
    }
}

fn exec_unwind(docs: Vec<Document>, path: &str, preserve: bool) -> Vec<Document> {
    let mut out = Vec::new();
    for doc in docs {
        match resolve_path(&doc, path).cloned() {
            Some(Bson::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut unwound = doc.clone();
                    set_path(&mut unwound, path, item);
                    out.push(unwound);
                }
            }
            Some(Bson::Array(_)) => {
                // An empty array is dropped from the preserved document.
                if preserve {
                    let mut kept = doc;
                    remove_path(&mut kept, path);
                    out.push(kept);
                }
            }
            Some(Bson::Null) | None => {
                if preserve {
                    out.push(doc);
                }
            }
            // Scalars are treated as a single-element array.
            Some(_) => out.push(doc),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// $group
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expression {
    Literal(Bson),
    Field(String),
    Compound(Vec<(String, Expression)>),
}

impl Expression {
    fn parse(value: &Bson) -> Self {
        if let Some(path) = field_ref(value) {
            return Expression::Field(path.to_string());
        }
        match value {
            Bson::Document(fields) if !fields.keys().any(|k| k.starts_with('$')) => {
                Expression::Compound(
                    fields
                        .iter()
                        .map(|(k, v)| (k.clone(), Expression::parse(v)))
                        .collect(),
                )
            }
            other => Expression::Literal(other.clone()),
        }
    }

    fn eval(&self, doc: &Document) -> Bson {
        match self {
            Expression::Literal(v) => v.clone(),
            Expression::Field(path) => resolve_path(doc, path).cloned().unwrap_or(Bson::Null),
            Expression::Compound(fields) => {
                let mut out = Document::new();
                for (name, expr) in fields {
                    out.insert(name.clone(), expr.eval(doc));
                }
                Bson::Document(out)
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Accumulator {
    Sum(Expression),
    Avg(Expression),
    Min(Expression),
    Max(Expression),
    First(Expression),
    Last(Expression),
    Push(Expression),
    Count,
}

enum AccumulatorState {
    Sum { int: i64, float: f64, is_float: bool },
    Avg { sum: f64, count: u64 },
    Min(Option<Bson>),
    Max(Option<Bson>),
    First(Option<Bson>),
    Last(Option<Bson>),
    Push(Vec<Bson>),
    Count(i64),
}

impl Accumulator {
    fn parse(spec: &Bson) -> StoreResult<Self> {
        let obj = match spec {
            Bson::Document(obj) if obj.len() == 1 => obj,
            _ => return Err(invalid("accumulator must have exactly one operator")),
        };
        let Some((op, arg)) = obj.iter().next() else {
            return Err(invalid("accumulator must have exactly one operator"));
        };
        let expr = Expression::parse(arg);
        match op.as_str() {
            "$sum" => Ok(Accumulator::Sum(expr)),
            "$avg" => Ok(Accumulator::Avg(expr)),
            "$min" => Ok(Accumulator::Min(expr)),
            "$max" => Ok(Accumulator::Max(expr)),
            "$first" => Ok(Accumulator::First(expr)),
            "$last" => Ok(Accumulator::Last(expr)),
            "$push" => Ok(Accumulator::Push(expr)),
            "$count" => Ok(Accumulator::Count),
            other => Err(MemoryStoreError::UnsupportedStage(format!(
                "$group accumulator {other}"
            ))),
        }
    }

    fn initial(&self) -> AccumulatorState {
        match self {
            Accumulator::Sum(_) => AccumulatorState::Sum {
                int: 0,
                float: 0.0,
                is_float: false,
            },
            Accumulator::Avg(_) => AccumulatorState::Avg { sum: 0.0, count: 0 },
            Accumulator::Min(_) => AccumulatorState::Min(None),
            Accumulator::Max(_) => AccumulatorState::Max(None),
            Accumulator::First(_) => AccumulatorState::First(None),
            Accumulator::Last(_) => AccumulatorState::Last(None),
            Accumulator::Push(_) => AccumulatorState::Push(Vec::new()),
            Accumulator::Count => AccumulatorState::Count(0),
        }
    }
}

impl AccumulatorState {
    fn feed(&mut self, acc: &Accumulator, doc: &Document) {
        match (acc, self) {
            (Accumulator::Sum(expr), AccumulatorState::Sum { int, float, is_float }) => {
                let n = match expr.eval(doc) {
                    Bson::Int32(n) => Some(i64::from(n)),
                    Bson::Int64(n) => Some(n),
                    Bson::Double(n) => {
                        *float += n;
                        *is_float = true;
                        None
                    }
                    _ => None,
                };
                if let Some(n) = n {
                    match int.checked_add(n) {
                        Some(total) => *int = total,
                        // Overflow promotes the running sum to a double.
                        None => {
                            *float += *int as f64 + n as f64;
                            *int = 0;
                            *is_float = true;
                        }
                    }
                }
            }
            (Accumulator::Avg(expr), AccumulatorState::Avg { sum, count }) => {
                if let Some(n) = as_f64(&expr.eval(doc)) {
                    *sum += n;
                    *count += 1;
                }
            }
            (Accumulator::Min(expr), AccumulatorState::Min(current)) => {
                let v = expr.eval(doc);
                if !matches!(v, Bson::Null)
                    && current.as_ref().is_none_or(|c| compare(&v, c).is_lt())
                {
                    *current = Some(v);
                }
            }
            (Accumulator::Max(expr), AccumulatorState::Max(current)) => {
                let v = expr.eval(doc);
                if !matches!(v, Bson::Null)
                    && current.as_ref().is_none_or(|c| compare(&v, c).is_gt())
                {
                    *current = Some(v);
                }
            }
            (Accumulator::First(expr), AccumulatorState::First(current)) => {
                if current.is_none() {
                    *current = Some(expr.eval(doc));
                }
            }
            (Accumulator::Last(expr), AccumulatorState::Last(current)) => {
                *current = Some(expr.eval(doc));
            }
            (Accumulator::Push(expr), AccumulatorState::Push(items)) => {
                items.push(expr.eval(doc));
            }
            (Accumulator::Count, AccumulatorState::Count(n)) => *n += 1,
            _ => {}
        }
    }

    fn finish(self) -> Bson {
        match self {
            AccumulatorState::Sum { int, float, is_float } => {
                if is_float {
                    Bson::Double(float + int as f64)
                } else {
                    int_to_bson(int)
                }
            }
            AccumulatorState::Avg { sum, count } => {
                if count == 0 {
                    Bson::Null
                } else {
                    Bson::Double(sum / count as f64)
                }
            }
            AccumulatorState::Min(v)
            | AccumulatorState::Max(v)
            | AccumulatorState::First(v)
            | AccumulatorState::Last(v) => v.unwrap_or(Bson::Null),
            AccumulatorState::Push(items) => Bson::Array(items),
            AccumulatorState::Count(n) => int_to_bson(n),
        }
    }
}

fn int_to_bson(n: i64) -> Bson {
    match i32::try_from(n) {
        Ok(small) => Bson::Int32(small),
        Err(_) => Bson::Int64(n),
    }
}

fn exec_group(docs: Vec<Document>, body: &Document) -> StoreResult<Vec<Document>> {
    let key = Expression::parse(
        body.get("_id")
            .ok_or_else(|| invalid("$group requires '_id' field"))?,
    );
    let mut accumulators = Vec::new();
    for (name, spec) in body {
        if name != "_id" {
            accumulators.push((name.clone(), Accumulator::parse(spec)?));
        }
    }

    // Groups keep first-seen order.
    let mut groups: Vec<(Bson, Vec<AccumulatorState>)> = Vec::new();
    for doc in &docs {
        let key_val = key.eval(doc);
        let idx = match groups.iter().position(|(k, _)| values_equal(k, &key_val)) {
            Some(idx) => idx,
            None => {
                let states = accumulators.iter().map(|(_, acc)| acc.initial()).collect();
                groups.push((key_val, states));
                groups.len() - 1
            }
        };
        for ((_, acc), state) in accumulators.iter().zip(groups[idx].1.iter_mut()) {
            state.feed(acc, doc);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key_val, states)| {
            let mut out = Document::new();
            out.insert("_id", key_val);
            for ((name, _), state) in accumulators.iter().zip(states) {
                out.insert(name.clone(), state.finish());
            }
            out
        })
        .collect())
}

// ---------------------------------------------------------------------------
// $sort
// ---------------------------------------------------------------------------

static NULL: Bson = Bson::Null;

fn exec_sort(mut docs: Vec<Document>, spec: &Document) -> StoreResult<Vec<Document>> {
    let mut fields = Vec::with_capacity(spec.len());
    for (field, dir) in spec {
        let desc = match dir {
            Bson::Int32(1) | Bson::Int64(1) => false,
            Bson::Int32(-1) | Bson::Int64(-1) => true,
            _ => return Err(invalid("sort direction must be 1 or -1")),
        };
        fields.push((field.as_str(), desc));
    }
    if fields.is_empty() {
        return Err(invalid("$sort requires at least one field"));
    }

    docs.sort_by(|a, b| {
        for (field, desc) in &fields {
            let av = resolve_path(a, field).unwrap_or(&NULL);
            let bv = resolve_path(b, field).unwrap_or(&NULL);
            let cmp = compare(av, bv);
            let cmp = if *desc { cmp.reverse() } else { cmp };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    });
    Ok(docs)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

fn run_pipeline(mut docs: Vec<Document>, pipeline: &[Document]) -> StoreResult<Vec<Document>> {
    for stage in pipeline {
        if stage.len() != 1 {
            return Err(invalid("each pipeline stage must have exactly one key"));
        }
        let Some((name, body)) = stage.iter().next() else {
            return Err(invalid("each pipeline stage must have exactly one key"));
        };
        docs = match (name.as_str(), body) {
            ("$match", Bson::Document(filter)) => exec_match(docs, filter)?,
            ("$unwind", body) => {
                let (path, preserve) = parse_unwind(body)?;
                exec_unwind(docs, &path, preserve)
            }
            ("$group", Bson::Document(spec)) => exec_group(docs, spec)?,
            ("$sort", Bson::Document(spec)) => exec_sort(docs, spec)?,
            ("$match" | "$group" | "$sort", _) => {
                return Err(invalid(format!("{name} must be a document")));
            }
            (other, _) => return Err(MemoryStoreError::UnsupportedStage(other.to_string())),
        };
    }
    Ok(docs)
}
