//! Built-in hooks: target table backup before full syncs and backup
//! retention afterwards.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use naked_pineapple_core::SyncType;
use tracing::info;

use super::{Hook, HookContext, HookError, HookPhase, HookRegistration, HookRegistry};
use crate::store::TargetConnector;
use crate::store::sql::{qualified_table, split_table};

/// Backups kept per table by default.
pub const DEFAULT_BACKUPS_KEPT: usize = 3;

fn backup_prefix(table_name: &str) -> String {
    format!("{table_name}_backup_")
}

/// Copies the target table to `<table>_backup_<yyyymmddhhmmss>`.
pub struct TableBackupHook {
    connector: Arc<dyn TargetConnector>,
}

impl TableBackupHook {
    #[must_use]
    pub fn new(connector: Arc<dyn TargetConnector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl Hook for TableBackupHook {
    async fn run(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        if ctx.dry_run {
            return Ok(());
        }
        let table = &ctx.mapping.target_table;
        let (schema, name) = split_table(table);
        let backup = format!(
            "{schema}.{}{}",
            backup_prefix(name),
            Utc::now().format("%Y%m%d%H%M%S")
        );
        let sql = format!(
            "CREATE TABLE {} AS TABLE {}",
            qualified_table(&backup)?,
            qualified_table(table)?
        );
        self.connector.execute(&sql, &[]).await?;
        info!(mapping_id = %ctx.mapping.id, %backup, "Target table backed up");
        Ok(())
    }
}

/// Drops all but the newest backups of the target table.
pub struct BackupRetentionHook {
    connector: Arc<dyn TargetConnector>,
    keep: usize,
}

impl BackupRetentionHook {
    #[must_use]
    pub fn new(connector: Arc<dyn TargetConnector>, keep: usize) -> Self {
        Self { connector, keep }
    }
}

#[async_trait]
impl Hook for BackupRetentionHook {
    async fn run(&self, ctx: &HookContext<'_>) -> Result<(), HookError> {
        if ctx.dry_run {
            return Ok(());
        }
        let (schema, name) = split_table(&ctx.mapping.target_table);
        let prefix = backup_prefix(name);

        let mut backups: Vec<String> = self
            .connector
            .introspect_schema()
            .await?
            .into_iter()
            .filter(|t| t.schema == schema && t.name.starts_with(&prefix))
            .map(|t| t.name)
            .collect();
        // Timestamp suffixes sort chronologically.
        backups.sort_unstable_by(|a, b| b.cmp(a));

        for stale in backups.iter().skip(self.keep) {
            let sql = format!(
                "DROP TABLE IF EXISTS {}",
                qualified_table(&format!("{schema}.{stale}"))?
            );
            self.connector.execute(&sql, &[]).await?;
            info!(mapping_id = %ctx.mapping.id, table = %stale, "Old backup dropped");
        }
        Ok(())
    }
}

/// Register the backup and retention hooks.
pub fn register_builtin_hooks(
    registry: &HookRegistry,
    connector: &Arc<dyn TargetConnector>,
    keep: usize,
) {
    registry.register(
        HookRegistration::new(
            "table-backup",
            HookPhase::PreSync,
            Arc::new(TableBackupHook::new(connector.clone())),
        )
        .priority(10)
        .for_sync_types(vec![SyncType::Full]),
    );
    registry.register(
        HookRegistration::new(
            "backup-retention",
            HookPhase::PostSync,
            Arc::new(BackupRetentionHook::new(connector.clone(), keep)),
        )
        .priority(100)
        .for_sync_types(vec![SyncType::Full]),
    );
}
