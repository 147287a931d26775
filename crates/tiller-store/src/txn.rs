//! Conditional transactions.
//!
//! A transaction is an ordered list of [`Op`]s, each pairing an assertion
//! over a document's current state with a mutation. The store applies a
//! transaction atomically: all assertions are checked against pre-commit
//! state first, and only if every one holds are the mutations applied.
//! An assertion that fails against an existing document surfaces as
//! [`StoreError::Aborted`] so callers can distinguish a concurrent-writer
//! race from an I/O failure; an assertion against a missing document
//! surfaces as [`StoreError::NotFound`].

use std::sync::Arc;

use serde_json::Value;
use tiller_core::Life;

use crate::document::{Document, Fields};
use crate::error::{Result, StoreError};
use crate::schema::Collection;
use crate::DocumentStore;

/// Maximum attempts made by [`Runner::run_with_retry`] before the abort
/// is surfaced to the caller.
pub const MAX_TXN_ATTEMPTS: usize = 3;

/// A predicate over a document's current state that must hold for the
/// transaction to commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assert {
    /// The document must not exist (insert guard).
    DocMissing,
    /// The document must exist.
    Exists,
    /// The document must exist with `life != Dead`.
    NotDead,
    /// The document must exist with `life` strictly below the target.
    LifeBelow(Life),
    /// The document must exist with exactly this `life`.
    LifeIs(Life),
    /// The document must exist at exactly this revision
    /// (compare-and-swap).
    RevnoIs(u64),
}

impl Assert {
    /// Check the predicate against the document's current state.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if the predicate references a document that
    /// does not exist; `StoreError::Aborted` if the document exists but
    /// the predicate does not hold.
    pub fn check(&self, doc: Option<&Document>) -> Result<()> {
        match (self, doc) {
            (Self::DocMissing, None) => Ok(()),
            (Self::DocMissing, Some(_)) => Err(StoreError::Aborted),
            (_, None) => Err(StoreError::NotFound),
            (Self::Exists, Some(_)) => Ok(()),
            (Self::NotDead, Some(d)) if !d.life.is_dead() => Ok(()),
            (Self::LifeBelow(target), Some(d)) if d.life < *target => Ok(()),
            (Self::LifeIs(life), Some(d)) if d.life == *life => Ok(()),
            (Self::RevnoIs(revno), Some(d)) if d.txn_revno == *revno => Ok(()),
            _ => Err(StoreError::Aborted),
        }
    }
}

/// The write half of an op.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Create the document with the given fields, Alive at revision 1.
    Insert(Fields),
    /// Merge the given fields into the document's field bag.
    SetFields(Fields),
    /// Append a value to an array field, creating the array if the field
    /// is absent. Values already present are not duplicated.
    Push(String, Value),
    /// Set the lifecycle value.
    SetLife(Life),
    /// Delete the document.
    Remove,
    /// Change nothing: the op contributes only its assertion.
    Noop,
}

impl Mutation {
    /// Apply the mutation to the document's staged state, returning the
    /// new state (`None` means the document is removed).
    pub(crate) fn apply(&self, id: &str, existing: Option<Document>) -> Result<Option<Document>> {
        match self {
            Self::Insert(fields) => Ok(Some(Document::new(id, fields.clone()))),
            Self::SetFields(fields) => {
                let mut doc = existing.ok_or(StoreError::NotFound)?;
                for (name, value) in fields {
                    doc.fields.insert(name.clone(), value.clone());
                }
                doc.txn_revno += 1;
                Ok(Some(doc))
            }
            Self::Push(field, value) => {
                let mut doc = existing.ok_or(StoreError::NotFound)?;
                let slot = doc
                    .fields
                    .entry(field.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                let Value::Array(items) = slot else {
                    return Err(StoreError::InvalidOp(format!(
                        "field {field:?} of document {id:?} is not an array"
                    )));
                };
                if !items.contains(value) {
                    items.push(value.clone());
                }
                doc.txn_revno += 1;
                Ok(Some(doc))
            }
            Self::SetLife(life) => {
                let mut doc = existing.ok_or(StoreError::NotFound)?;
                doc.life = *life;
                doc.txn_revno += 1;
                Ok(Some(doc))
            }
            Self::Remove => Ok(None),
            Self::Noop => Ok(existing),
        }
    }
}

/// One conditional operation of a transaction.
#[derive(Debug, Clone)]
pub struct Op {
    /// The collection the document lives in.
    pub collection: Collection,
    /// The document id.
    pub id: String,
    /// The assertion that must hold for the transaction to commit.
    pub assert: Assert,
    /// The mutation applied once every assertion in the transaction
    /// holds.
    pub mutation: Mutation,
}

impl Op {
    /// An insert op guarded by the document not existing yet.
    #[must_use]
    pub fn insert(collection: Collection, id: impl Into<String>, fields: Fields) -> Self {
        Self {
            collection,
            id: id.into(),
            assert: Assert::DocMissing,
            mutation: Mutation::Insert(fields),
        }
    }

    /// A field update guarded by the entity not being Dead.
    #[must_use]
    pub fn set_fields(collection: Collection, id: impl Into<String>, fields: Fields) -> Self {
        Self {
            collection,
            id: id.into(),
            assert: Assert::NotDead,
            mutation: Mutation::SetFields(fields),
        }
    }

    /// A lifecycle advance: assert `life < target`, set `life = target`.
    #[must_use]
    pub fn advance_life(collection: Collection, id: impl Into<String>, target: Life) -> Self {
        Self {
            collection,
            id: id.into(),
            assert: Assert::LifeBelow(target),
            mutation: Mutation::SetLife(target),
        }
    }

    /// A removal guarded by the document existing.
    #[must_use]
    pub fn remove(collection: Collection, id: impl Into<String>) -> Self {
        Self {
            collection,
            id: id.into(),
            assert: Assert::Exists,
            mutation: Mutation::Remove,
        }
    }

    /// An assertion-only op: the entity must exist and not be Dead, but
    /// nothing about it changes.
    #[must_use]
    pub fn assert_not_dead(collection: Collection, id: impl Into<String>) -> Self {
        Self {
            collection,
            id: id.into(),
            assert: Assert::NotDead,
            mutation: Mutation::Noop,
        }
    }
}

/// Stage a transaction's ops against a snapshot of current state.
///
/// `fetch` reads a document's pre-transaction state; each op's assertion
/// is checked against the staged state (pre-transaction for the first op
/// touching a document, the prior op's result after that) and its
/// mutation applied in memory. Nothing is written until the caller
/// commits the returned staged states, so a failure at any op leaves the
/// store untouched.
///
/// Returns the final state of every document the transaction actually
/// changed, in first-touch order (`None` means removed). Documents only
/// asserted on do not appear.
pub(crate) fn stage_ops<F>(
    ops: &[Op],
    mut fetch: F,
) -> Result<Vec<(Collection, String, Option<Document>)>>
where
    F: FnMut(Collection, &str) -> Result<Option<Document>>,
{
    let mut order: Vec<(Collection, String)> = Vec::new();
    let mut initial: std::collections::HashMap<(Collection, String), Option<Document>> =
        std::collections::HashMap::new();
    let mut staged: std::collections::HashMap<(Collection, String), Option<Document>> =
        std::collections::HashMap::new();

    for op in ops {
        let key = (op.collection, op.id.clone());
        if !staged.contains_key(&key) {
            let doc = fetch(op.collection, &op.id)?;
            initial.insert(key.clone(), doc.clone());
            staged.insert(key.clone(), doc);
            order.push(key.clone());
        }
        let current = staged.get(&key).expect("staged above");
        op.assert.check(current.as_ref())?;
        let next = op.mutation.apply(&op.id, current.clone())?;
        staged.insert(key, next);
    }

    Ok(order
        .into_iter()
        .filter_map(|(collection, id)| {
            let key = (collection, id.clone());
            let doc = staged.remove(&key).expect("staged");
            if initial.remove(&key).expect("fetched") == doc {
                return None;
            }
            Some((collection, id, doc))
        })
        .collect())
}

/// Executes conditional transactions against a document store.
///
/// `run` is a single attempt; `run_with_retry` is the bounded-retry
/// wrapper for idempotent mutation patterns, where the op list is
/// recomputed from freshly-fetched state on every attempt. Callers with
/// non-idempotent intent must supply their own reconciliation instead of
/// relying on blind retry.
#[derive(Clone)]
pub struct Runner {
    store: Arc<dyn DocumentStore>,
}

impl Runner {
    /// Create a runner over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Apply one transaction.
    ///
    /// # Errors
    ///
    /// `StoreError::Aborted` if an assertion failed, `StoreError::NotFound`
    /// if an assertion referenced a missing document, or a database error.
    pub fn run(&self, ops: Vec<Op>) -> Result<()> {
        self.store.apply(ops)
    }

    /// Apply a transaction recomputed from fresh state on each attempt,
    /// retrying on abort up to [`MAX_TXN_ATTEMPTS`] times.
    ///
    /// # Errors
    ///
    /// `StoreError::Aborted` once the attempts are exhausted; any other
    /// error from `build` or the store is returned immediately.
    pub fn run_with_retry<F>(&self, mut build: F) -> Result<()>
    where
        F: FnMut() -> Result<Vec<Op>>,
    {
        for attempt in 1..=MAX_TXN_ATTEMPTS {
            match self.store.apply(build()?) {
                Ok(()) => return Ok(()),
                Err(StoreError::Aborted) if attempt < MAX_TXN_ATTEMPTS => {
                    tracing::debug!(attempt, "transaction aborted, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::Aborted)
    }
}
