use async_trait::async_trait;
use console_api::ConnectionParameters;
use console_core::{ClusterStore, PersistedClusterRecord, StoreError};
use sqlx::{FromRow, PgExecutor, PgPool};
use tracing::debug;

#[derive(Debug, FromRow)]
struct ClusterRow {
    cluster_name: String,
    host: String,
    bearer_token: Option<String>,
    insecure: bool,
    cert_data: Option<String>,
    key_data: Option<String>,
    ca_data: Option<String>,
}

impl From<ClusterRow> for PersistedClusterRecord {
    fn from(row: ClusterRow) -> Self {
        PersistedClusterRecord::new(
            row.cluster_name,
            ConnectionParameters {
                host: row.host,
                bearer_token: row.bearer_token,
                tls_insecure: row.insecure,
                cert_data: row.cert_data,
                key_data: row.key_data,
                ca_data: row.ca_data,
            },
        )
    }
}

pub async fn find_all_clusters<'c, E>(executor: E) -> sqlx::Result<Vec<PersistedClusterRecord>>
where
    E: PgExecutor<'c>,
{
    let rows: Vec<ClusterRow> = sqlx::query_as(
        r#"
        select cluster_name, host, bearer_token, insecure, cert_data, key_data, ca_data
        from k8s_clusters
        order by id
        "#,
    )
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn create_cluster<'c, E>(executor: E, record: &PersistedClusterRecord) -> sqlx::Result<i64>
where
    E: PgExecutor<'c>,
{
    let params = &record.params;
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into k8s_clusters (cluster_name, host, bearer_token, insecure, cert_data, key_data, ca_data)
        values ($1, $2, $3, $4, $5, $6, $7)
        returning id
        "#,
    )
    .bind(&record.cluster_name)
    .bind(&params.host)
    .bind(&params.bearer_token)
    .bind(params.tls_insecure)
    .bind(&params.cert_data)
    .bind(&params.key_data)
    .bind(&params.ca_data)
    .fetch_one(executor)
    .await?;

    Ok(id)
}

/// Returns the number of rows changed
pub async fn update_cluster<'c, E>(executor: E, record: &PersistedClusterRecord) -> sqlx::Result<u64>
where
    E: PgExecutor<'c>,
{
    let params = &record.params;
    let result = sqlx::query(
        r#"
        update k8s_clusters
        set host = $2, bearer_token = $3, insecure = $4, cert_data = $5, key_data = $6, ca_data = $7,
            updated_at = now()
        where cluster_name = $1
        "#,
    )
    .bind(&record.cluster_name)
    .bind(&params.host)
    .bind(&params.bearer_token)
    .bind(params.tls_insecure)
    .bind(&params.cert_data)
    .bind(&params.key_data)
    .bind(&params.ca_data)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

pub async fn rename_cluster<'c, E>(executor: E, name: &str, new_name: &str) -> sqlx::Result<u64>
where
    E: PgExecutor<'c>,
{
    let result = sqlx::query(
        r#"
        update k8s_clusters
        set cluster_name = $2, updated_at = now()
        where cluster_name = $1
        "#,
    )
    .bind(name)
    .bind(new_name)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

pub async fn delete_cluster_by_name<'c, E>(executor: E, name: &str) -> sqlx::Result<u64>
where
    E: PgExecutor<'c>,
{
    let result = sqlx::query(
        r#"
        delete from k8s_clusters
        where cluster_name = $1
        "#,
    )
    .bind(name)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

pub fn is_unique_constraint_violation_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            // 23505 is Postgres's unique constraint violation code.
            db_err.code().as_deref() == Some("23505")
        }
        _ => false,
    }
}

/// Cluster store backed by the `k8s_clusters` table
#[derive(Clone, Debug)]
pub struct PgClusterStore {
    pool: PgPool,
}

impl PgClusterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ClusterStore for PgClusterStore {
    async fn find_all(&self) -> Result<Vec<PersistedClusterRecord>, StoreError> {
        find_all_clusters(&self.pool)
            .await
            .map_err(|e| StoreError::with_source("failed to read cluster records", e))
    }

    async fn create(&self, record: &PersistedClusterRecord) -> Result<(), StoreError> {
        match create_cluster(&self.pool, record).await {
            Ok(id) => {
                debug!("Created cluster record {} ({})", record.cluster_name, id);
                Ok(())
            }
            Err(e) if is_unique_constraint_violation_error(&e) => Err(StoreError::with_source(
                format!("duplicate cluster name: {}", record.cluster_name),
                e,
            )),
            Err(e) => Err(StoreError::with_source("failed to create cluster record", e)),
        }
    }

    async fn update(&self, record: &PersistedClusterRecord) -> Result<(), StoreError> {
        let updated = update_cluster(&self.pool, record)
            .await
            .map_err(|e| StoreError::with_source("failed to update cluster record", e))?;
        if updated == 0 {
            return Err(StoreError::new(format!(
                "no cluster record named {}",
                record.cluster_name
            )));
        }
        Ok(())
    }

    async fn rename(&self, name: &str, new_name: &str) -> Result<(), StoreError> {
        let renamed = rename_cluster(&self.pool, name, new_name)
            .await
            .map_err(|e| StoreError::with_source("failed to rename cluster record", e))?;
        debug!("Renamed {} cluster records from {} to {}", renamed, name, new_name);
        Ok(())
    }

    async fn delete_by_name(&self, name: &str) -> Result<(), StoreError> {
        let deleted = delete_cluster_by_name(&self.pool, name)
            .await
            .map_err(|e| StoreError::with_source("failed to delete cluster record", e))?;
        debug!("Deleted {} cluster records named {}", deleted, name);
        Ok(())
    }
}
