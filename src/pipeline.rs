use std::path::Path;

use mongodb::bson::Document;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::stage::{Group, Sort, Stage, StageKind, Unwind};

// ---------------------------------------------------------------------------
// Grouping query
// ---------------------------------------------------------------------------

/// Declarative description of a grouping aggregation.
///
/// `filter` and `having` distinguish absence from an empty document: `None`
/// omits the stage, `Some(doc! {})` emits an unrestricted `$match`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Document>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unwinds: Vec<Unwind>,
    pub group: Group,
    /// Post-group filter, evaluated against the `$group` output shape.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub having: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Sort>,
}

impl GroupingQuery {
    pub fn new(group: Group) -> Self {
        Self {
            filter: None,
            unwinds: Vec::new(),
            group,
            having: None,
            sort: None,
        }
    }

    pub fn filter(mut self, filter: Document) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn unwind(mut self, unwind: Unwind) -> Self {
        self.unwinds.push(unwind);
        self
    }

    pub fn having(mut self, having: Document) -> Self {
        self.having = Some(having);
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Assemble the stage sequence: `$match`, each `$unwind` in declaration
    /// order, `$group`, the post-group `$match`, then `$sort`. Optional stages
    /// are omitted when absent; nothing is reordered or deduplicated.
    pub fn build(&self) -> Pipeline {
        let mut stages = Vec::with_capacity(self.unwinds.len() + 4);

        if let Some(filter) = &self.filter {
            stages.push(Stage::Match(filter.clone()));
        }

        stages.extend(self.unwinds.iter().cloned().map(Stage::Unwind));

        stages.push(Stage::Group(self.group.clone()));

        if let Some(having) = &self.having {
            stages.push(Stage::Match(having.clone()));
        }

        if let Some(sort) = &self.sort {
            stages.push(Stage::Sort(sort.clone()));
        }

        Pipeline { stages }
    }

    /// Opt-in sanity check. `build` never calls this; the store remains the
    /// authority on what it accepts.
    pub fn validate(&self) -> Result<()> {
        if let Group::Key { path, .. } = &self.group {
            if path.is_empty() {
                return Err(Error::InvalidConfig("group key path is empty".into()));
            }
        }

        for unwind in &self.unwinds {
            if unwind.path.len() < 2 || !unwind.path.starts_with('$') {
                return Err(Error::InvalidConfig(format!(
                    "unwind path must be a $-prefixed field path, got '{}'",
                    unwind.path
                )));
            }
        }

        if let Some(sort) = &self.sort {
            if sort.is_empty() {
                return Err(Error::InvalidConfig("sort has no fields".into()));
            }
            if sort.fields().iter().any(|(field, _)| field.is_empty()) {
                return Err(Error::InvalidConfig("sort field name is empty".into()));
            }
        }

        Ok(())
    }

    /// Parse and validate a JSON grouping description.
    pub fn from_json(text: &str) -> Result<Self> {
        let query: GroupingQuery = serde_json::from_str(text)?;
        query.validate()?;
        Ok(query)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Ordered stage sequence produced by [`GroupingQuery::build`].
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(Stage::kind).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Render every stage in order as a wire document.
    pub fn to_documents(&self) -> Vec<Document> {
        self.stages.iter().map(Stage::to_document).collect()
    }

    pub fn into_documents(self) -> Vec<Document> {
        self.to_documents()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn group_only() {
        let pipeline = GroupingQuery::new(Group::key("$genre")).build();
        assert_eq!(pipeline.kinds(), vec![StageKind::Group]);
        assert_eq!(pipeline.to_documents(), vec![doc! {"$group": {"_id": "$genre"}}]);
    }

    #[test]
    fn having_sits_between_group_and_sort() {
        let pipeline = GroupingQuery::new(Group::counted("$director"))
            .filter(doc! {"year": {"$gte": 2000}})
            .having(doc! {"count": {"$gt": 2}})
            .sort(Sort::new().desc("count"))
            .build();
        assert_eq!(
            pipeline.kinds(),
            vec![
                StageKind::Match,
                StageKind::Group,
                StageKind::Match,
                StageKind::Sort
            ]
        );
        let docs = pipeline.to_documents();
        assert_eq!(docs[0], doc! {"$match": {"year": {"$gte": 2000}}});
        assert_eq!(docs[2], doc! {"$match": {"count": {"$gt": 2}}});
    }

    #[test]
    fn filter_is_not_reapplied_after_group() {
        let pipeline = GroupingQuery::new(Group::counted("$director"))
            .filter(doc! {"year": 1999})
            .build();
        assert_eq!(pipeline.kinds(), vec![StageKind::Match, StageKind::Group]);
    }

    #[test]
    fn validate_rejects_empty_group_key() {
        let query = GroupingQuery::new(Group::key(""));
        assert!(matches!(query.validate(), Err(Error::InvalidConfig(_))));
        // build stays total
        assert_eq!(query.build().len(), 1);
    }

    #[test]
    fn validate_rejects_bare_unwind_path() {
        let query = GroupingQuery::new(Group::key("$stars")).unwind(Unwind::new("stars"));
        assert!(query.validate().is_err());
        let query = GroupingQuery::new(Group::key("$stars")).unwind(Unwind::new("$"));
        assert!(query.validate().is_err());
    }

    #[test]
    fn validate_accepts_raw_group() {
        let query = GroupingQuery::new(Group::raw(doc! {"_id": null}));
        assert!(query.validate().is_ok());
    }

    #[test]
    fn from_json_full_description() {
        let query = GroupingQuery::from_json(
            r#"{
                "filter": {},
                "unwinds": [{"path": "$stars"}],
                "group": {"path": "$stars", "count": true},
                "sort": {"count": -1, "_id": 1}
            }"#,
        )
        .unwrap();
        assert_eq!(query.filter, Some(Document::new()));
        assert_eq!(query.unwinds, vec![Unwind::new("$stars")]);
        assert_eq!(query.group, Group::counted("$stars"));
        assert_eq!(query.sort, Some(Sort::new().desc("count").asc("_id")));
        assert_eq!(query.having, None);
    }

    #[test]
    fn from_json_raw_group() {
        let query =
            GroupingQuery::from_json(r#"{"group": {"raw": {"_id": "$year", "n": {"$sum": 1}}}}"#)
                .unwrap();
        assert!(matches!(query.group, Group::Raw { .. }));
        assert_eq!(query.filter, None);
    }

    #[test]
    fn from_json_rejects_bad_sort() {
        let err = GroupingQuery::from_json(r#"{"group": {"path": "$a"}, "sort": {"a": 0}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn validate_rejects_empty_sort() {
        let query = GroupingQuery::new(Group::key("$genre")).sort(Sort::new());
        assert!(matches!(query.validate(), Err(Error::InvalidConfig(_))));
        let err = GroupingQuery::from_json(r#"{"group": {"path": "$genre"}, "sort": {}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn from_json_runs_validation() {
        let err = GroupingQuery::from_json(r#"{"group": {"path": ""}}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn serialize_then_parse_preserves_query() {
        let query = GroupingQuery::new(Group::counted("$director"))
            .filter(doc! {})
            .unwind(Unwind::preserving("$stars"))
            .sort(Sort::new().desc("count"));
        let text = serde_json::to_string(&query).unwrap();
        assert_eq!(GroupingQuery::from_json(&text).unwrap().build(), query.build());
    }
}
