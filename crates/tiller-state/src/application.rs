//! The application entity handle.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tiller_core::{ApplicationName, Life, UnitName};
use tiller_store::{Collection, Document, Op};

use crate::error::{Result, ResultExt, StateError};
use crate::lifecycle::{ensure_life, Lifecycle};
use crate::relation::Relation;
use crate::unit::Unit;
use crate::{decode_fields, StateInner};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ApplicationFields {
    #[serde(default)]
    pub(crate) remote: bool,
}

/// A handle on one application, local or remote.
///
/// Remote applications are offered by another controller; they share the
/// collection and the whole lifecycle contract with local ones.
pub struct Application {
    st: Arc<StateInner>,
    name: ApplicationName,
    life: Life,
    doc: ApplicationFields,
}

impl Application {
    pub(crate) fn from_document(st: Arc<StateInner>, doc: &Document) -> Result<Self> {
        let name = ApplicationName::new(&doc.id)?;
        Ok(Self {
            st,
            name,
            life: doc.life,
            doc: decode_fields(doc)?,
        })
    }

    /// The application name.
    #[must_use]
    pub fn name(&self) -> &ApplicationName {
        &self.name
    }

    /// Whether the application lives in another controller's model.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.doc.remote
    }

    /// Add a principal unit to the application, named
    /// `<application>/<ordinal>` from the application's own sequence.
    ///
    /// # Errors
    ///
    /// Returns a conflict error if the application is Dead and a
    /// not-found error if it has been removed.
    pub fn add_unit(&self) -> Result<Unit> {
        self.insert_unit(None)
            .op_context(|| format!("add unit to application {}", self.name))
    }

    /// Add a subordinate unit to the application, following the given
    /// principal unit. The principal must not be Dead.
    ///
    /// # Errors
    ///
    /// Returns a conflict error if the application or the principal is
    /// Dead, and a not-found error if either has been removed.
    pub fn add_subordinate_unit(&self, principal: &UnitName) -> Result<Unit> {
        self.insert_unit(Some(principal))
            .op_context(|| format!("add subordinate unit to application {}", self.name))
    }

    fn insert_unit(&self, principal: Option<&UnitName>) -> Result<Unit> {
        let ordinal = self
            .st
            .store
            .next_sequence(&format!("application-{}", self.name))?;
        let name = UnitName::from_parts(&self.name, ordinal);

        let mut fields = tiller_store::Fields::new();
        fields.insert("application".into(), json!(self.name.as_str()));
        if let Some(principal) = principal {
            fields.insert("principal".into(), json!(principal.as_str()));
        }

        let mut ops = vec![Op::assert_not_dead(
            Collection::Applications,
            self.name.as_str(),
        )];
        if let Some(principal) = principal {
            ops.push(Op::assert_not_dead(Collection::Units, principal.as_str()));
        }
        ops.push(Op::insert(Collection::Units, name.as_str(), fields));

        crate::run_entity_ops(&self.st, ops, || format!("application {}", self.name))?;
        tracing::info!(application = %self.name, unit = %name, "added unit");

        let doc = self
            .st
            .store
            .find_by_id(Collection::Units, name.as_str())?
            .ok_or_else(|| StateError::not_found(format!("unit {name}")))?;
        Unit::from_document(Arc::clone(&self.st), &doc)
    }

    /// All relations the application is currently part of.
    ///
    /// The result is a fresh query relative to call time; it may be
    /// stale by the time the caller acts on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub fn relations(&self) -> Result<Vec<Relation>> {
        let inner = || -> Result<Vec<Relation>> {
            let mut relations = Vec::new();
            for id in self.st.store.ids(Collection::Relations)? {
                let Some(doc) = self.st.store.find_by_id(Collection::Relations, &id)? else {
                    continue;
                };
                let relation = Relation::from_document(Arc::clone(&self.st), &doc)?;
                if relation.involves(&self.name) {
                    relations.push(relation);
                }
            }
            Ok(relations)
        };
        inner().op_context(|| format!("get relations of application {}", self.name))
    }

    fn fetch(&self) -> Result<Document> {
        self.st
            .store
            .find_by_id(Collection::Applications, self.name.as_str())?
            .ok_or_else(|| StateError::not_found(format!("application {}", self.name)))
    }
}

impl Lifecycle for Application {
    fn life(&self) -> Life {
        self.life
    }

    fn global_key(&self) -> String {
        self.name.global_key()
    }

    fn refresh(&mut self) -> Result<()> {
        let doc = self.fetch()?;
        self.life = doc.life;
        self.doc = decode_fields(&doc)?;
        Ok(())
    }

    fn ensure_dying(&mut self) -> Result<()> {
        self.life = ensure_life(
            &self.st,
            Collection::Applications,
            self.name.as_str(),
            Life::Dying,
            &format!("application {}", self.name),
        )?;
        Ok(())
    }

    fn ensure_dead(&mut self) -> Result<()> {
        self.life = ensure_life(
            &self.st,
            Collection::Applications,
            self.name.as_str(),
            Life::Dead,
            &format!("application {}", self.name),
        )?;
        Ok(())
    }
}

impl fmt::Display for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("life", &self.life)
            .field("remote", &self.doc.remote)
            .finish_non_exhaustive()
    }
}
