use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scene_similarity::{
    db::{create_pool, run_migrations, PgDatabase},
    models::SceneId,
    services::{Progress, SimilarityCalculator, SimilarityJob},
    Config,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Optional first argument restricts the run to one scene
    let scene_id = std::env::args()
        .nth(1)
        .map(|arg| arg.parse::<i32>().map(SceneId))
        .transpose()
        .context("scene id must be an integer")?;

    let config = Config::from_env()?;
    let weights = config.weights()?;
    let plan = config.batch_plan()?;

    let pool = create_pool(&config.database_url, config.max_connections).await?;
    run_migrations(&pool).await?;

    let db = PgDatabase::new(pool);
    let calculator = SimilarityCalculator::new(Arc::new(db.clone()), Arc::new(db.clone()), weights)
        .with_batch_plan(plan);

    let job = SimilarityJob::new(scene_id);
    tracing::info!(job = %job.description(), "Starting job");

    let progress = Progress::new();
    job.execute(&calculator, &db, &progress).await?;

    tracing::info!(
        processed = progress.processed(),
        total = progress.total(),
        "Job finished"
    );

    Ok(())
}
