//! The two-call contract the executor needs from a document store:
//! submit a pipeline, then drain the returned cursor.

use std::future::Future;

use futures_util::TryStreamExt;
use mongodb::bson::Document;
use mongodb::{Collection, Cursor};

/// A collection that can run an aggregation pipeline.
pub trait AggregateStore {
    type Cursor: ResultCursor;
    type Error: std::error::Error + Send + Sync + 'static;

    fn aggregate(
        &self,
        pipeline: Vec<Document>,
    ) -> impl Future<Output = Result<Self::Cursor, Self::Error>> + Send;
}

/// A server-side result set that can be materialized in full.
pub trait ResultCursor {
    type Error: std::error::Error + Send + Sync + 'static;

    fn drain_all(self) -> impl Future<Output = Result<Vec<Document>, Self::Error>> + Send;
}

impl AggregateStore for Collection<Document> {
    type Cursor = Cursor<Document>;
    type Error = mongodb::error::Error;

    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Self::Cursor, Self::Error> {
        Collection::aggregate(self, pipeline).await
    }
}

impl ResultCursor for Cursor<Document> {
    type Error = mongodb::error::Error;

    async fn drain_all(self) -> Result<Vec<Document>, Self::Error> {
        self.try_collect().await
    }
}
