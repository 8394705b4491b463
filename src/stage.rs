use std::fmt;

use mongodb::bson::{Bson, Document, doc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Name of the accumulator field added to a counted `$group` stage.
pub const COUNT_FIELD: &str = "count";

// ---------------------------------------------------------------------------
// $unwind
// ---------------------------------------------------------------------------

/// One `$unwind` step. `path` is a `$`-prefixed field path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unwind {
    pub path: String,
    #[serde(default)]
    pub preserve_null_and_empty_arrays: bool,
}

impl Unwind {
    /// Unwind `path`, dropping documents whose array is missing, null or empty.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            preserve_null_and_empty_arrays: false,
        }
    }

    /// Unwind `path`, keeping documents whose array is missing, null or empty.
    pub fn preserving(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            preserve_null_and_empty_arrays: true,
        }
    }

    fn to_body(&self) -> Document {
        doc! {
            "path": self.path.as_str(),
            "preserveNullAndEmptyArrays": self.preserve_null_and_empty_arrays,
        }
    }
}

// ---------------------------------------------------------------------------
// $group
// ---------------------------------------------------------------------------

/// The `$group` stage.
///
/// `Key` is the structured form: documents are grouped by `path` as `_id`,
/// optionally counting the members of each group into [`COUNT_FIELD`].
/// `Raw` passes an arbitrary grouping document through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Group {
    Key {
        path: String,
        #[serde(default)]
        count: bool,
    },
    Raw {
        raw: Document,
    },
}

impl Group {
    pub fn key(path: impl Into<String>) -> Self {
        Group::Key {
            path: path.into(),
            count: false,
        }
    }

    /// Group by `path` and add `count: {$sum: 1}`.
    pub fn counted(path: impl Into<String>) -> Self {
        Group::Key {
            path: path.into(),
            count: true,
        }
    }

    /// Escape hatch: emit `{"$group": body}` as given.
    pub fn raw(body: Document) -> Self {
        Group::Raw { raw: body }
    }

    fn to_body(&self) -> Document {
        match self {
            Group::Key { path, count } => {
                let mut body = doc! { "_id": path.as_str() };
                if *count {
                    body.insert(COUNT_FIELD, doc! { "$sum": 1 });
                }
                body
            }
            Group::Raw { raw } => raw.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// $sort
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_i32(self) -> i32 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }

    fn from_bson(value: &Bson) -> Option<Self> {
        let n = match value {
            Bson::Int32(n) => i64::from(*n),
            Bson::Int64(n) => *n,
            _ => return None,
        };
        match n {
            1 => Some(SortDirection::Asc),
            -1 => Some(SortDirection::Desc),
            _ => None,
        }
    }
}

/// Ordered field/direction list for the `$sort` stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Document", into = "Document")]
pub struct Sort {
    fields: Vec<(String, SortDirection)>,
}

impl Sort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.fields.push((field.into(), SortDirection::Asc));
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.fields.push((field.into(), SortDirection::Desc));
        self
    }

    pub fn fields(&self) -> &[(String, SortDirection)] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn to_body(&self) -> Document {
        let mut body = Document::new();
        for (field, direction) in &self.fields {
            body.insert(field.clone(), direction.as_i32());
        }
        body
    }
}

impl FromIterator<(String, SortDirection)> for Sort {
    fn from_iter<I: IntoIterator<Item = (String, SortDirection)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl TryFrom<Document> for Sort {
    type Error = Error;

    fn try_from(body: Document) -> Result<Self, Self::Error> {
        let mut fields = Vec::with_capacity(body.len());
        for (field, dir) in body {
            let direction = SortDirection::from_bson(&dir).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "sort direction for '{field}' must be 1 or -1"
                ))
            })?;
            fields.push((field, direction));
        }
        Ok(Self { fields })
    }
}

impl From<Sort> for Document {
    fn from(sort: Sort) -> Self {
        sort.to_body()
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Match,
    Unwind,
    Group,
    Sort,
}

impl StageKind {
    /// The operator key the stage is rendered under.
    pub fn operator(self) -> &'static str {
        match self {
            StageKind::Match => "$match",
            StageKind::Unwind => "$unwind",
            StageKind::Group => "$group",
            StageKind::Sort => "$sort",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operator())
    }
}

/// One typed aggregation stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Document),
    Unwind(Unwind),
    Group(Group),
    Sort(Sort),
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::Match(_) => StageKind::Match,
            Stage::Unwind(_) => StageKind::Unwind,
            Stage::Group(_) => StageKind::Group,
            Stage::Sort(_) => StageKind::Sort,
        }
    }

    /// Render as a single-key stage document, e.g. `{"$sort": {"count": -1}}`.
    pub fn to_document(&self) -> Document {
        let body = match self {
            Stage::Match(filter) => filter.clone(),
            Stage::Unwind(unwind) => unwind.to_body(),
            Stage::Group(group) => group.to_body(),
            Stage::Sort(sort) => sort.to_body(),
        };
        let mut stage = Document::new();
        stage.insert(self.kind().operator(), body);
        stage
    }
}
