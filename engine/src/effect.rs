//! Net-effect lattice.
//!
//! A [`NetEffectKind`] summarises what a sequence of operations on one
//! document does to the store, without replaying every intermediate state.
//! Folding a new operation into a kind is a lookup in a fixed transition
//! table, so the whole lattice is exhaustively testable.

use crate::context::ReplicationContext;
use crate::operation::ChangeOperation;
use crate::update::UpdateAction;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Net effect of a sequence of operations on one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetEffectKind {
    /// Nothing happened yet.
    Noop,
    /// Whatever was stored is replaced by a known document.
    DeleteCreate,
    /// The stored document is modified by field operators.
    UpdateMod,
    /// The stored document is replaced; it must exist.
    UpdateSet,
    /// Field operators applied to the stored document or to `{_id}`.
    UpsertMod,
    /// The document is removed.
    Delete,
    /// The stored document was updated and then removed; it must exist.
    UpdateDelete,
    /// The sequence is inconsistent unless the document exists.
    Error,
}

/// Classification of one incoming CUD operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncomingKind {
    Insert,
    UpdateMod,
    UpdateSet,
    UpsertMod,
    UpsertSet,
    Delete,
}

impl NetEffectKind {
    /// All kinds, in declaration order.
    pub const ALL: [NetEffectKind; 8] = [
        NetEffectKind::Noop,
        NetEffectKind::DeleteCreate,
        NetEffectKind::UpdateMod,
        NetEffectKind::UpdateSet,
        NetEffectKind::UpsertMod,
        NetEffectKind::Delete,
        NetEffectKind::UpdateDelete,
        NetEffectKind::Error,
    ];

    /// `(requires_match, requires_fetch, deletes)`
    const fn flags(self) -> (bool, bool, bool) {
        match self {
            NetEffectKind::Noop => (false, false, false),
            NetEffectKind::DeleteCreate => (false, false, true),
            NetEffectKind::UpdateMod => (true, true, true),
            NetEffectKind::UpdateSet => (true, false, true),
            NetEffectKind::UpsertMod => (false, true, true),
            NetEffectKind::Delete => (false, false, true),
            NetEffectKind::UpdateDelete => (true, false, true),
            NetEffectKind::Error => (true, false, true),
        }
    }

    /// The document must already exist in the store.
    pub const fn requires_match(self) -> bool {
        self.flags().0
    }

    /// The stored document is needed to compute the result.
    pub const fn requires_fetch(self) -> bool {
        self.flags().1
    }

    /// Any stored version of the document is removed.
    pub const fn deletes(self) -> bool {
        self.flags().2
    }

    /// The internal identity of the stored document must be resolved.
    pub const fn requires_identity(self) -> bool {
        self.requires_match() || self.requires_fetch() || self.deletes()
    }

    /// Transition table.
    pub const fn and_then(self, incoming: IncomingKind) -> NetEffectKind {
        use IncomingKind as In;
        use NetEffectKind as K;

        match (self, incoming) {
            (K::Noop, In::Insert) => K::DeleteCreate,
            (K::Noop, In::UpdateMod) => K::UpdateMod,
            (K::Noop, In::UpdateSet) => K::UpdateSet,
            (K::Noop, In::UpsertMod) => K::UpsertMod,
            (K::Noop, In::UpsertSet) => K::DeleteCreate,
            (K::Noop, In::Delete) => K::Delete,

            (K::DeleteCreate, In::Delete) => K::Delete,
            (K::DeleteCreate, _) => K::DeleteCreate,

            (K::UpdateMod, In::Insert) => K::UpdateSet,
            (K::UpdateMod, In::UpdateMod) => K::UpdateMod,
            (K::UpdateMod, In::UpdateSet) => K::UpdateSet,
            (K::UpdateMod, In::UpsertMod) => K::UpdateMod,
            (K::UpdateMod, In::UpsertSet) => K::UpdateSet,
            (K::UpdateMod, In::Delete) => K::UpdateDelete,

            (K::UpdateSet, In::Delete) => K::UpdateDelete,
            (K::UpdateSet, _) => K::UpdateSet,

            (K::UpsertMod, In::Insert) => K::DeleteCreate,
            (K::UpsertMod, In::UpdateMod) => K::UpdateMod,
            (K::UpsertMod, In::UpdateSet) => K::DeleteCreate,
            (K::UpsertMod, In::UpsertMod) => K::UpsertMod,
            (K::UpsertMod, In::UpsertSet) => K::DeleteCreate,
            (K::UpsertMod, In::Delete) => K::Delete,

            (K::Delete, In::Insert) => K::DeleteCreate,
            (K::Delete, In::UpdateMod) => K::Error,
            (K::Delete, In::UpdateSet) => K::Error,
            (K::Delete, In::UpsertMod) => K::DeleteCreate,
            (K::Delete, In::UpsertSet) => K::DeleteCreate,
            (K::Delete, In::Delete) => K::Delete,

            (K::UpdateDelete, In::Insert) => K::UpdateSet,
            (K::UpdateDelete, In::UpdateMod) => K::Error,
            (K::UpdateDelete, In::UpdateSet) => K::Error,
            (K::UpdateDelete, In::UpsertMod) => K::UpdateSet,
            (K::UpdateDelete, In::UpsertSet) => K::UpdateSet,
            (K::UpdateDelete, In::Delete) => K::UpdateDelete,

            (K::Error, _) => K::Error,
        }
    }
}

impl fmt::Display for NetEffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetEffectKind::Noop => "noop",
            NetEffectKind::DeleteCreate => "delete-create",
            NetEffectKind::UpdateMod => "update-mod",
            NetEffectKind::UpdateSet => "update-set",
            NetEffectKind::UpsertMod => "upsert-mod",
            NetEffectKind::Delete => "delete",
            NetEffectKind::UpdateDelete => "update-delete",
            NetEffectKind::Error => "error",
        };
        f.write_str(name)
    }
}

impl IncomingKind {
    pub const ALL: [IncomingKind; 6] = [
        IncomingKind::Insert,
        IncomingKind::UpdateMod,
        IncomingKind::UpdateSet,
        IncomingKind::UpsertMod,
        IncomingKind::UpsertSet,
        IncomingKind::Delete,
    ];

    /// Classify a CUD operation. Returns `None` for commands and no-ops.
    ///
    /// An update counts as an upsert when its own flag is set or when the
    /// context treats every update as an upsert.
    pub fn classify(op: &ChangeOperation, ctx: &ReplicationContext) -> Result<Option<Self>> {
        let kind = match op {
            ChangeOperation::Insert(_) => IncomingKind::Insert,
            ChangeOperation::Delete(_) => IncomingKind::Delete,
            ChangeOperation::Update(update) => {
                Self::of_update(update.upsert || ctx.treat_update_as_upsert, &update.action()?)
            }
            ChangeOperation::Command(_) | ChangeOperation::Noop(_) => return Ok(None),
        };
        Ok(Some(kind))
    }

    /// Classify an already parsed update.
    pub fn of_update(upsert: bool, action: &UpdateAction) -> Self {
        match (upsert, action.is_set_modification()) {
            (true, true) => IncomingKind::UpsertSet,
            (true, false) => IncomingKind::UpsertMod,
            (false, true) => IncomingKind::UpdateSet,
            (false, false) => IncomingKind::UpdateMod,
        }
    }

    /// Whether the operation replaces the document with a known one.
    pub fn is_set_style(self) -> bool {
        matches!(
            self,
            IncomingKind::Insert | IncomingKind::UpdateSet | IncomingKind::UpsertSet
        )
    }
}
