//! Audit trail of successful mutations.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::debug;

/// Mutation recorded in `records.action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Create,
    Update,
    Destroy,
    DestroyPermanent,
    Restore,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Destroy => "destroy",
            AuditAction::DestroyPermanent => "destroyPermanent",
            AuditAction::Restore => "restore",
        }
    }
}

/// Write one audit record.
pub async fn record(
    pool: &PgPool,
    user_id: Option<&str>,
    model: &str,
    element_id: &str,
    action: AuditAction,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO records (user_id, element_id, action, model, created_at, updated_at)
        VALUES ($1, $2, $3, $4, NOW(), NOW())
        "#,
    )
    .bind(user_id)
    .bind(element_id)
    .bind(action.as_str())
    .bind(model)
    .execute(pool)
    .await
    .context("failed to write audit record")?;

    debug!(model = %model, id = %element_id, action = action.as_str(), "audit record written");
    Ok(())
}
