//! PostgreSQL storage for dynamic clusters
//!
//! Records live in the `k8s_clusters` table, keyed by a unique cluster name.
//! [`migrate`] creates the table; [`PgClusterStore`] implements the core
//! `ClusterStore` trait on top of a connection pool.

pub mod clusters;

pub use clusters::PgClusterStore;

use sqlx::PgPool;
use tracing::info;

/// Apply the embedded migrations
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    info!("Applying cluster store migrations");
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Cluster store migrations applied");
    Ok(())
}
