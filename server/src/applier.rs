//! Applies operations that run alone in an exclusive transaction.

use crate::backend::ExclusiveTransaction;
use crate::error::ApplyError;
use crate::executor::NamespaceJobExecutor;
use async_trait::async_trait;
use oplog_engine::{
    ChangeOperation, CommandOp, NamespaceJob, Namespace, Reducer, ReplicationContext,
};

/// Index and capped-collection maintenance. Secondary indexes are not
/// replicated, so these are accepted and ignored.
const IGNORED_COMMANDS: [&str; 6] = [
    "createIndexes",
    "dropIndexes",
    "deleteIndexes",
    "collMod",
    "emptycapped",
    "convertToCapped",
];

const APPLIED_COMMANDS: [&str; 3] = ["drop", "dropDatabase", "create"];

const INDEX_CATALOG: &str = "system.indexes";

/// Executes the operation of a single-op batch.
#[async_trait]
pub trait OperationApplier: Send + Sync + 'static {
    async fn apply(
        &self,
        op: &ChangeOperation,
        tx: &mut dyn ExclusiveTransaction,
        ctx: &ReplicationContext,
    ) -> Result<(), ApplyError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultOperationApplier;

impl DefaultOperationApplier {
    async fn apply_command(
        &self,
        command: &CommandOp,
        tx: &mut dyn ExclusiveTransaction,
    ) -> Result<(), ApplyError> {
        // option fields sit next to the command name in no particular order
        let name = command
            .find_name(&APPLIED_COMMANDS)
            .or_else(|| command.find_name(&IGNORED_COMMANDS))
            .or_else(|| command.name())
            .ok_or_else(|| ApplyError::MalformedCommand("empty command document".to_string()))?;

        match name {
            "drop" => {
                let collection = command
                    .command
                    .get("drop")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        ApplyError::MalformedCommand("drop without collection name".to_string())
                    })?;
                let namespace = Namespace::new(&command.database, collection);
                let removed = tx.drop_collection(&namespace).await?;
                tracing::info!(%namespace, removed, "Dropped collection");
            }
            "dropDatabase" => {
                let removed = tx.drop_database(&command.database).await?;
                tracing::info!(database = %command.database, removed, "Dropped database");
            }
            // collections exist implicitly
            "create" => {
                tracing::debug!(database = %command.database, "Create command accepted");
            }
            name if IGNORED_COMMANDS.contains(&name) => {
                tracing::debug!(database = %command.database, command = name, "Ignoring maintenance command");
            }
            other => return Err(ApplyError::UnknownCommand(other.to_string())),
        }
        Ok(())
    }
}

#[async_trait]
impl OperationApplier for DefaultOperationApplier {
    async fn apply(
        &self,
        op: &ChangeOperation,
        tx: &mut dyn ExclusiveTransaction,
        ctx: &ReplicationContext,
    ) -> Result<(), ApplyError> {
        match op {
            ChangeOperation::Command(command) => self.apply_command(command, tx).await,
            ChangeOperation::Noop(_) => Ok(()),
            ChangeOperation::Insert(insert) if insert.collection == INDEX_CATALOG => {
                tracing::debug!(database = %insert.database, "Ignoring index catalog insert");
                Ok(())
            }
            _ => {
                let Some(namespace) = op.namespace() else {
                    return Ok(());
                };
                let table = Reducer::new(*ctx).reduce(std::iter::once(op))?;
                let job = NamespaceJob::new(namespace, table.into_values().collect());
                NamespaceJobExecutor::apply(&job, tx.as_write(), false).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use oplog_engine::{as_document, DeleteOp, InsertOp};
    use serde_json::{json, Value};

    fn command(database: &str, value: Value) -> ChangeOperation {
        ChangeOperation::Command(CommandOp::new(1, 0, database, as_document(value).unwrap()))
    }

    async fn apply(backend: &MemoryBackend, op: &ChangeOperation) -> Result<(), ApplyError> {
        let mut tx = backend.begin_exclusive().await.unwrap();
        DefaultOperationApplier
            .apply(op, tx.as_mut(), &ReplicationContext::default())
            .await?;
        tx.commit().await?;
        Ok(())
    }

    fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        for (db, coll) in [("shop", "orders"), ("shop", "users"), ("crm", "leads")] {
            backend
                .seed(
                    &Namespace::new(db, coll),
                    vec![as_document(json!({"_id": 1})).unwrap()],
                )
                .unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn drop_removes_one_collection() {
        let backend = seeded();
        apply(&backend, &command("shop", json!({"drop": "orders"})))
            .await
            .unwrap();

        assert!(backend.documents(&Namespace::new("shop", "orders")).is_empty());
        assert_eq!(backend.documents(&Namespace::new("shop", "users")).len(), 1);
    }

    #[tokio::test]
    async fn drop_database_removes_every_collection() {
        let backend = seeded();
        apply(&backend, &command("shop", json!({"dropDatabase": 1})))
            .await
            .unwrap();

        assert!(backend.documents(&Namespace::new("shop", "orders")).is_empty());
        assert!(backend.documents(&Namespace::new("shop", "users")).is_empty());
        assert_eq!(backend.documents(&Namespace::new("crm", "leads")).len(), 1);
    }

    #[tokio::test]
    async fn maintenance_commands_are_ignored() {
        let backend = seeded();
        apply(&backend, &command("shop", json!({"createIndexes": "orders"})))
            .await
            .unwrap();
        apply(&backend, &command("shop", json!({"create": "invoices"})))
            .await
            .unwrap();
        assert_eq!(backend.documents(&Namespace::new("shop", "orders")).len(), 1);
    }

    #[tokio::test]
    async fn commands_with_option_fields() {
        let backend = seeded();
        apply(
            &backend,
            &command("shop", json!({"create": "invoices", "capped": true, "size": 4096})),
        )
        .await
        .unwrap();
        apply(
            &backend,
            &command("shop", json!({"createIndexes": "orders", "indexes": [], "commitQuorum": 1})),
        )
        .await
        .unwrap();
        assert_eq!(backend.documents(&Namespace::new("shop", "orders")).len(), 1);

        apply(
            &backend,
            &command("shop", json!({"drop": "orders", "$db": "shop", "comment": "cleanup"})),
        )
        .await
        .unwrap();
        assert!(backend.documents(&Namespace::new("shop", "orders")).is_empty());
        assert_eq!(backend.documents(&Namespace::new("shop", "users")).len(), 1);

        apply(&backend, &command("shop", json!({"dropDatabase": 1, "$db": "shop"})))
            .await
            .unwrap();
        assert!(backend.documents(&Namespace::new("shop", "users")).is_empty());
    }

    #[tokio::test]
    async fn unknown_and_malformed_commands_fail() {
        let backend = seeded();
        let err = apply(&backend, &command("shop", json!({"shutdown": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::UnknownCommand(name) if name == "shutdown"));

        let err = apply(&backend, &command("shop", json!({"drop": 7})))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::MalformedCommand(_)));
    }

    #[tokio::test]
    async fn protected_namespace_writes_apply_one_by_one() {
        let backend = MemoryBackend::new();
        let js = Namespace::new("shop", "system.js");
        let insert = ChangeOperation::Insert(InsertOp::new(
            1,
            0,
            "shop",
            "system.js",
            as_document(json!({"_id": "f", "value": "code"})).unwrap(),
        ));
        apply(&backend, &insert).await.unwrap();
        assert_eq!(backend.documents(&js).len(), 1);

        let delete = ChangeOperation::Delete(DeleteOp::new(
            2,
            0,
            "shop",
            "system.js",
            as_document(json!({"_id": "f"})).unwrap(),
        ));
        apply(&backend, &delete).await.unwrap();
        assert!(backend.documents(&js).is_empty());

        let index = ChangeOperation::Insert(InsertOp::new(
            3,
            0,
            "shop",
            "system.indexes",
            as_document(json!({"_id": "idx", "key": {"a": 1}})).unwrap(),
        ));
        apply(&backend, &index).await.unwrap();
        assert!(backend
            .documents(&Namespace::new("shop", "system.indexes"))
            .is_empty());
    }
}
