use mongist::bson::doc;
use mongist::{Group, GroupingQuery, QueryContext, Sort, StoreConfig, Unwind};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> mongist::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mongist=debug")),
        )
        .init();

    let collection = StoreConfig::from_env()?.connect().await?;
    let ctx = QueryContext::background().with_timeout(Duration::from_secs(10));

    println!("=== Films per director ===");
    let directors = GroupingQuery::new(Group::counted("$director"))
        .filter(doc! {})
        .sort(Sort::new().desc("count"));
    for doc in directors.run(Some(&collection), Some(&ctx)).await? {
        println!("  {}", doc);
    }

    println!("\n=== Films per star ===");
    let stars = GroupingQuery::new(Group::counted("$stars"))
        .filter(doc! {})
        .unwind(Unwind::new("$stars"))
        .sort(Sort::new().desc("count"));
    for doc in stars.run(Some(&collection), Some(&ctx)).await? {
        println!("  {}", doc);
    }

    Ok(())
}
