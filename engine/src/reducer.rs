//! Folding of raw operations into one net effect per document.

use crate::analyzed::AnalyzedOp;
use crate::context::ReplicationContext;
use crate::document::DocumentKey;
use crate::operation::ChangeOperation;
use crate::Result;
use std::collections::BTreeMap;

/// Net effects of a run of operations on one namespace, keyed by document.
pub type EffectTable = BTreeMap<DocumentKey, AnalyzedOp>;

/// Folds change operations into analyzed ops, in stream order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reducer {
    ctx: ReplicationContext,
    track_provenance: bool,
}

impl Reducer {
    pub fn new(ctx: ReplicationContext) -> Self {
        Self {
            ctx,
            track_provenance: false,
        }
    }

    /// Also record, per key, the raw operations folded into each effect.
    pub fn with_provenance(mut self) -> Self {
        self.track_provenance = true;
        self
    }

    pub fn context(&self) -> &ReplicationContext {
        &self.ctx
    }

    /// Fold one operation into `table`.
    ///
    /// Fails without touching `table` when the operation has no document key.
    pub fn reduce_one(&self, table: &mut EffectTable, op: &ChangeOperation) -> Result<()> {
        let key = op.document_key()?;
        let next = match table.get(&key) {
            Some(current) => current.and_then(op, &self.ctx)?,
            None => AnalyzedOp::seed(key.clone(), self.track_provenance).and_then(op, &self.ctx)?,
        };
        table.insert(key, next);
        Ok(())
    }

    /// Fold every operation of `ops` into `table`.
    pub fn reduce_into<'a, I>(&self, table: &mut EffectTable, ops: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a ChangeOperation>,
    {
        for op in ops {
            self.reduce_one(table, op)?;
        }
        Ok(())
    }

    /// Fold `ops` into a fresh table.
    pub fn reduce<'a, I>(&self, ops: I) -> Result<EffectTable>
    where
        I: IntoIterator<Item = &'a ChangeOperation>,
    {
        let mut table = EffectTable::new();
        self.reduce_into(&mut table, ops)?;
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::as_document;
    use crate::effect::NetEffectKind;
    use crate::operation::{DeleteOp, InsertOp, UpdateOp};
    use crate::Error;
    use serde_json::json;

    fn insert(id: &str) -> ChangeOperation {
        ChangeOperation::Insert(InsertOp::new(
            1,
            0,
            "d",
            "c",
            as_document(json!({"_id": id})).unwrap(),
        ))
    }

    fn delete(id: &str) -> ChangeOperation {
        ChangeOperation::Delete(DeleteOp::new(
            2,
            0,
            "d",
            "c",
            as_document(json!({"_id": id})).unwrap(),
        ))
    }

    #[test]
    fn one_effect_per_key() {
        let ops = vec![insert("a"), insert("b"), delete("a")];
        let table = Reducer::default().reduce(&ops).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table[&DocumentKey::from("a")].kind(), NetEffectKind::Delete);
        assert_eq!(
            table[&DocumentKey::from("b")].kind(),
            NetEffectKind::DeleteCreate
        );
    }

    #[test]
    fn reduce_into_continues_existing_table() {
        let reducer = Reducer::default();
        let mut table = reducer.reduce(&[insert("a")]).unwrap();
        reducer.reduce_into(&mut table, &[delete("a")]).unwrap();
        assert_eq!(table[&DocumentKey::from("a")].kind(), NetEffectKind::Delete);
    }

    #[test]
    fn missing_key_fails_fast() {
        let keyless = ChangeOperation::Update(UpdateOp::new(
            1,
            0,
            "d",
            "c",
            as_document(json!({"status": "old"})).unwrap(),
            as_document(json!({"$set": {"status": "new"}})).unwrap(),
            false,
        ));
        let mut table = EffectTable::new();
        let err = Reducer::default()
            .reduce_into(&mut table, &[insert("a"), keyless, insert("b")])
            .unwrap_err();

        assert!(matches!(err, Error::MissingDocumentKey { kind: "update", .. }));
        assert!(table.contains_key(&DocumentKey::from("a")));
        assert!(!table.contains_key(&DocumentKey::from("b")));
    }

    #[test]
    fn provenance_is_per_key() {
        let ops = vec![insert("a"), insert("b"), delete("a")];
        let table = Reducer::default().with_provenance().reduce(&ops).unwrap();

        let a = table[&DocumentKey::from("a")].provenance().unwrap();
        assert_eq!(a, &[ops[0].clone(), ops[2].clone()][..]);
        let b = table[&DocumentKey::from("b")].provenance().unwrap();
        assert_eq!(b, &[ops[1].clone()][..]);
    }
}
