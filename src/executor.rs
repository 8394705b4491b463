use mongodb::bson::{self, Document};
use serde::de::DeserializeOwned;

use crate::context::QueryContext;
use crate::error::{Error, Result};
use crate::pipeline::{GroupingQuery, Pipeline};
use crate::store::{AggregateStore, ResultCursor};

/// Submit `pipeline` to `store` and drain every result document.
///
/// A missing store fails before any I/O. A missing context runs unbounded.
/// Store failures are surfaced unchanged: submission errors as
/// [`Error::Execution`], drain errors as [`Error::Decode`]. Results are
/// returned in the order the store produced them, and only after a full drain.
pub async fn execute<S>(
    store: Option<&S>,
    ctx: Option<&QueryContext>,
    pipeline: &Pipeline,
) -> Result<Vec<Document>>
where
    S: AggregateStore,
{
    let store = store.ok_or_else(|| Error::Configuration("no collection given".into()))?;

    let background = QueryContext::background();
    let ctx = ctx.unwrap_or(&background);

    tracing::debug!(
        stages = pipeline.len(),
        kinds = ?pipeline.kinds(),
        "submitting aggregation"
    );

    let outcome = async {
        let cursor = ctx
            .run(store.aggregate(pipeline.to_documents()))
            .await?
            .map_err(Error::execution)?;
        ctx.run(cursor.drain_all()).await?.map_err(Error::decode)
    }
    .await;

    match &outcome {
        Ok(docs) => tracing::debug!(count = docs.len(), "aggregation drained"),
        Err(e @ (Error::Cancelled | Error::DeadlineExceeded)) => {
            tracing::warn!("aggregation aborted: {e}")
        }
        Err(_) => {}
    }

    outcome
}

/// Like [`execute`], decoding each result document into `T`.
pub async fn execute_as<S, T>(
    store: Option<&S>,
    ctx: Option<&QueryContext>,
    pipeline: &Pipeline,
) -> Result<Vec<T>>
where
    S: AggregateStore,
    T: DeserializeOwned,
{
    execute(store, ctx, pipeline)
        .await?
        .into_iter()
        .map(|doc| bson::from_document(doc).map_err(Error::decode))
        .collect()
}

impl GroupingQuery {
    /// Build this query and execute it against `store`.
    pub async fn run<S>(&self, store: Option<&S>, ctx: Option<&QueryContext>) -> Result<Vec<Document>>
    where
        S: AggregateStore,
    {
        execute(store, ctx, &self.build()).await
    }
}
