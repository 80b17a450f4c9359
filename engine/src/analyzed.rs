//! Per-document accumulator of the net effect of several operations.
//!
//! An [`AnalyzedOp`] pairs a [`NetEffectKind`] with a deferred [`Producer`]
//! that, given the stored document (when one had to be fetched), yields the
//! document to insert. Values are immutable: every transition returns a new
//! op and leaves the previous one untouched.

use crate::context::ReplicationContext;
use crate::document::{Document, DocumentKey};
use crate::effect::{IncomingKind, NetEffectKind};
use crate::operation::ChangeOperation;
use crate::update::UpdateAction;
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;

/// Deferred production of the document to insert.
///
/// An `AnalyzedOp` without a producer produces nothing at all ("no
/// production"). A producer may still yield `None` ("production of none")
/// when it depends on a stored document that does not exist.
#[derive(Debug, Clone, PartialEq)]
pub enum Producer {
    /// A document known at analysis time.
    Constant(Arc<Document>),
    /// Field operators applied to the stored document, or to `seed` when
    /// nothing was stored.
    Modify {
        seed: Option<Arc<Document>>,
        mods: Vec<Arc<UpdateAction>>,
    },
}

impl Producer {
    /// Compute the document to insert.
    pub fn produce(&self, fetched: Option<&Document>) -> Result<Option<Document>> {
        match self {
            Producer::Constant(doc) => Ok(Some(doc.as_ref().clone())),
            Producer::Modify { seed, mods } => {
                let Some(base) = fetched.or(seed.as_deref()) else {
                    return Ok(None);
                };
                let mut doc = base.clone();
                for action in mods {
                    doc = action.apply(&doc)?;
                }
                Ok(Some(doc))
            }
        }
    }

    /// Whether the producer ignores the stored document.
    pub fn is_constant(&self) -> bool {
        matches!(self, Producer::Constant(_))
    }
}

/// A document that was expected to exist but was not found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub key: DocumentKey,
    pub kind: NetEffectKind,
    pub message: String,
}

/// The net effect of every operation seen so far on one document.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzedOp {
    key: DocumentKey,
    kind: NetEffectKind,
    producer: Option<Producer>,
    provenance: Option<Vec<ChangeOperation>>,
}

/// Payload of an incoming operation relevant to production.
enum Payload<'a> {
    Document(&'a Document),
    Action(UpdateAction),
    Nothing,
}

impl AnalyzedOp {
    /// A fresh `Noop` op for a key. With `track_provenance` the op also keeps
    /// the raw operations folded into it.
    pub fn seed(key: DocumentKey, track_provenance: bool) -> Self {
        Self {
            key,
            kind: NetEffectKind::Noop,
            producer: None,
            provenance: track_provenance.then(Vec::new),
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> NetEffectKind {
        self.kind
    }

    pub fn producer(&self) -> Option<&Producer> {
        self.producer.as_ref()
    }

    /// Raw operations folded into this op, when provenance is tracked.
    pub fn provenance(&self) -> Option<&[ChangeOperation]> {
        self.provenance.as_deref()
    }

    /// Fold one more operation on the same document.
    pub fn and_then(&self, op: &ChangeOperation, ctx: &ReplicationContext) -> Result<Self> {
        let (incoming, payload) = match op {
            ChangeOperation::Insert(insert) => {
                (IncomingKind::Insert, Payload::Document(&insert.document))
            }
            ChangeOperation::Update(update) => {
                let action = update.action()?;
                let upsert = update.upsert || ctx.treat_update_as_upsert;
                (IncomingKind::of_update(upsert, &action), Payload::Action(action))
            }
            ChangeOperation::Delete(_) => (IncomingKind::Delete, Payload::Nothing),
            ChangeOperation::Command(_) | ChangeOperation::Noop(_) => {
                return Err(Error::NotReducible(op.kind_name()))
            }
        };

        let kind = self.kind.and_then(incoming);
        let producer = self.next_producer(kind, incoming, payload)?;
        let provenance = self.provenance.as_ref().map(|ops| {
            let mut ops = ops.clone();
            ops.push(op.clone());
            ops
        });

        Ok(Self {
            key: self.key.clone(),
            kind,
            producer,
            provenance,
        })
    }

    fn next_producer(
        &self,
        kind: NetEffectKind,
        incoming: IncomingKind,
        payload: Payload<'_>,
    ) -> Result<Option<Producer>> {
        if matches!(
            kind,
            NetEffectKind::Noop
                | NetEffectKind::Delete
                | NetEffectKind::UpdateDelete
                | NetEffectKind::Error
        ) {
            return Ok(None);
        }

        let action = match payload {
            Payload::Document(doc) => return Ok(Some(Producer::Constant(Arc::new(doc.clone())))),
            Payload::Nothing => return Ok(None),
            Payload::Action(action) if action.is_set_modification() => {
                let doc = action.apply_as_upsert(&self.key)?;
                return Ok(Some(Producer::Constant(Arc::new(doc))));
            }
            Payload::Action(action) => action,
        };

        let producer = match &self.producer {
            Some(Producer::Constant(base)) => Producer::Constant(Arc::new(action.apply(base)?)),
            Some(Producer::Modify { seed, mods }) => {
                let mut mods = mods.clone();
                mods.push(Arc::new(action));
                Producer::Modify {
                    seed: seed.clone(),
                    mods,
                }
            }
            // Nothing is stored after a delete, so the upsert starts from `{_id}`.
            None if matches!(self.kind, NetEffectKind::Delete | NetEffectKind::UpdateDelete) => {
                Producer::Constant(Arc::new(action.apply_as_upsert(&self.key)?))
            }
            None => Producer::Modify {
                seed: (incoming == IncomingKind::UpsertMod)
                    .then(|| Arc::new(self.key.seed_document())),
                mods: vec![Arc::new(action)],
            },
        };
        Ok(Some(producer))
    }

    /// Compute the document to insert, if any.
    pub fn produce(&self, fetched: Option<&Document>) -> Result<Option<Document>> {
        match &self.producer {
            Some(producer) => producer.produce(fetched),
            None => Ok(None),
        }
    }

    /// Describe why this op cannot be applied without a stored document.
    ///
    /// `None` when the kind does not require a match.
    pub fn mismatch(&self) -> Option<Mismatch> {
        if !self.kind.requires_match() {
            return None;
        }
        let message = match self.kind {
            NetEffectKind::UpdateMod | NetEffectKind::UpdateSet => {
                format!("update of document {} that does not exist", self.key)
            }
            NetEffectKind::UpdateDelete => {
                format!("update then delete of document {} that does not exist", self.key)
            }
            _ => format!(
                "inconsistent operation sequence on document {}: update after delete",
                self.key
            ),
        };
        Some(Mismatch {
            key: self.key.clone(),
            kind: self.kind,
            message,
        })
    }
}
