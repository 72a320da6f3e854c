//! Durable delta cursors, one per (resource_type, partition).
//!
//! Tokens are opaque upstream links; the worker stores and replays them
//! without interpretation. A cursor is only written after every row derived
//! from it has been committed.

use anyhow::Result;
use sqlx::PgPool;

pub async fn get_delta_link(
    pool: &PgPool,
    resource_type: &str,
    partition_key: &str,
) -> Result<Option<String>> {
    let link: Option<String> = sqlx::query_scalar(
        r#"
        SELECT delta_link
        FROM msgraph_delta_state
        WHERE resource_type = $1 AND partition_key = $2
        "#,
    )
    .bind(resource_type)
    .bind(partition_key)
    .fetch_optional(pool)
    .await?;

    Ok(link)
}

pub async fn set_delta_link(
    pool: &PgPool,
    resource_type: &str,
    partition_key: &str,
    delta_link: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO msgraph_delta_state (resource_type, partition_key, delta_link, last_synced_at)
        VALUES ($1, $2, $3, now())
        ON CONFLICT (resource_type, partition_key)
        DO UPDATE SET delta_link = EXCLUDED.delta_link, last_synced_at = EXCLUDED.last_synced_at
        "#,
    )
    .bind(resource_type)
    .bind(partition_key)
    .bind(delta_link)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn clear_delta_link(
    pool: &PgPool,
    resource_type: &str,
    partition_key: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM msgraph_delta_state
        WHERE resource_type = $1 AND partition_key = $2
        "#,
    )
    .bind(resource_type)
    .bind(partition_key)
    .execute(pool)
    .await?;

    Ok(())
}
