//! The relation entity handle.
//!
//! A relation connects two application endpoints. Each unit that has
//! entered the relation keeps a settings document in the settings
//! collection, keyed `r#<relation-id>#<unit>`; the settings document's
//! revision counter doubles as the settings version watchers report.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tiller_core::{ApplicationName, Life, RelationId, UnitName};
use tiller_store::{Collection, Document, Fields, Op, StoreError};

use crate::error::{Result, ResultExt, StateError};
use crate::lifecycle::{ensure_life, Lifecycle};
use crate::{decode_fields, StateInner};

/// Which side of a relation an application provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRole {
    /// The application provides the interface.
    Provider,
    /// The application requires the interface.
    Requirer,
}

/// One application's side of a relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// The application providing this side.
    pub application: ApplicationName,
    /// The endpoint name, shared by both sides of the relation.
    pub name: String,
    /// The role this side plays.
    pub role: EndpointRole,
}

impl Endpoint {
    /// Create an endpoint.
    #[must_use]
    pub fn new(application: ApplicationName, name: impl Into<String>, role: EndpointRole) -> Self {
        Self {
            application,
            name: name.into(),
            role,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.application, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RelationFields {
    pub(crate) key: String,
    pub(crate) endpoints: Vec<Endpoint>,
}

/// The canonical id of a relation's settings document for one unit.
pub(crate) fn settings_key(relation: RelationId, unit: &UnitName) -> String {
    format!("r#{}#{}", relation.as_u64(), unit)
}

/// The unit-name part of a settings document id, if the id belongs to
/// the given relation.
pub(crate) fn unit_from_settings_key(key: &str, relation: RelationId) -> Option<&str> {
    key.strip_prefix(&format!("r#{}#", relation.as_u64()))
}

/// A handle on one relation.
pub struct Relation {
    st: Arc<StateInner>,
    id: RelationId,
    life: Life,
    doc: RelationFields,
}

impl Relation {
    pub(crate) fn from_document(st: Arc<StateInner>, doc: &Document) -> Result<Self> {
        let id: RelationId = doc
            .id
            .parse()
            .map_err(|_| StateError::not_valid(format!("relation id {:?}", doc.id)))?;
        Ok(Self {
            st,
            id,
            life: doc.life,
            doc: decode_fields(doc)?,
        })
    }

    /// The relation id.
    #[must_use]
    pub fn id(&self) -> RelationId {
        self.id
    }

    /// The canonical endpoint-pair key, e.g.
    /// `mysql:db wordpress:db`.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.doc.key
    }

    /// The relation's endpoints.
    #[must_use]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.doc.endpoints
    }

    /// Whether the relation involves the given application.
    #[must_use]
    pub fn involves(&self, application: &ApplicationName) -> bool {
        self.doc
            .endpoints
            .iter()
            .any(|ep| ep.application == *application)
    }

    /// The settings a unit holds in this relation.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the unit has no settings in this
    /// relation.
    pub fn unit_settings(&self, unit: &UnitName) -> Result<serde_json::Map<String, serde_json::Value>> {
        let key = settings_key(self.id, unit);
        let doc = self
            .st
            .store
            .find_by_id(Collection::Settings, &key)?
            .ok_or_else(|| {
                StateError::not_found(format!("settings for unit {unit} in relation {self}"))
            })?;
        match doc.field("settings") {
            Some(serde_json::Value::Object(map)) => Ok(map.clone()),
            _ => Ok(serde_json::Map::new()),
        }
    }

    /// Replace a unit's settings in this relation, creating them on
    /// first write. The transaction asserts the relation is not Dead.
    ///
    /// # Errors
    ///
    /// Returns a conflict error if the relation is Dead, or a not-found
    /// error if it has been removed.
    pub fn set_unit_settings(
        &self,
        unit: &UnitName,
        settings: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let op = || format!("set settings for unit {unit} in relation {self}");
        let key = settings_key(self.id, unit);
        let result = self.st.runner.run_with_retry(|| {
            let guard = Op::assert_not_dead(Collection::Relations, self.id.to_string());
            let op = if self
                .st
                .store
                .find_by_id(Collection::Settings, &key)?
                .is_some()
            {
                let mut fields = Fields::new();
                fields.insert("settings".into(), serde_json::Value::Object(settings.clone()));
                Op::set_fields(Collection::Settings, key.clone(), fields)
            } else {
                let mut fields = Fields::new();
                fields.insert("relation_id".into(), json!(self.id.as_u64()));
                fields.insert("unit".into(), json!(unit.as_str()));
                fields.insert("settings".into(), serde_json::Value::Object(settings.clone()));
                Op::insert(Collection::Settings, key.clone(), fields)
            };
            Ok(vec![guard, op])
        });
        match result {
            Ok(()) => {
                tracing::debug!(relation = %self.id, unit = %unit, "set relation unit settings");
                Ok(())
            }
            Err(StoreError::Aborted) => Err(StateError::conflict("not alive")).op_context(op),
            Err(StoreError::NotFound) => {
                Err(StateError::not_found(format!("relation {self}"))).op_context(op)
            }
            Err(err) => Err(err.into()).op_context(op),
        }
    }

    fn fetch(&self) -> Result<Document> {
        self.st
            .store
            .find_by_id(Collection::Relations, &self.id.to_string())?
            .ok_or_else(|| StateError::not_found(format!("relation {self}")))
    }

    /// Remove every settings document belonging to this relation.
    /// Idempotent: racing cleaners and repeated calls are fine.
    fn clean_up_settings(&self) -> Result<()> {
        let docs = self.st.store.find_by_field(
            Collection::Settings,
            "relation_id",
            &json!(self.id.as_u64()),
        )?;
        for doc in docs {
            match self.st.runner.run(vec![Op::remove(Collection::Settings, doc.id)]) {
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

impl Lifecycle for Relation {
    fn life(&self) -> Life {
        self.life
    }

    fn global_key(&self) -> String {
        self.id.global_key()
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
            Collection::Relations,
            &self.id.to_string(),
            Life::Dying,
            &format!("relation {self}"),
        )?;
        Ok(())
    }

    fn ensure_dead(&mut self) -> Result<()> {
        self.life = ensure_life(
            &self.st,
            Collection::Relations,
            &self.id.to_string(),
            Life::Dead,
            &format!("relation {self}"),
        )?;
        // Dead relations keep no unit settings.
        self.clean_up_settings()
            .op_context(|| format!("clean up settings of relation {self}"))?;
        Ok(())
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("id", &self.id)
            .field("key", &self.doc.key)
            .field("life", &self.life)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PresenceConfig, State};
    use serde_json::Map;
    use tiller_store::MemStore;

    async fn relation_fixture() -> (State, Relation, UnitName) {
        let st = State::new(Arc::new(MemStore::new()), PresenceConfig::default());
        let wordpress = st.add_application("wordpress", false).unwrap();
        let mysql = st.add_application("mysql", false).unwrap();
        let relation = st
            .add_relation(
                Endpoint::new(wordpress.name().clone(), "db", EndpointRole::Requirer),
                Endpoint::new(mysql.name().clone(), "db", EndpointRole::Provider),
            )
            .unwrap();
        let unit = wordpress.add_unit().unwrap();
        (st, relation, unit.name().clone())
    }

    fn settings(pairs: &[(&str, &str)]) -> Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), json!(v)))
            .collect()
    }

    #[tokio::test]
    async fn relation_key_is_canonical() {
        let (_st, relation, _unit) = relation_fixture().await;
        assert_eq!(relation.key(), "mysql:db wordpress:db");
        assert_eq!(relation.global_key(), "r#0");
    }

    #[tokio::test]
    async fn unit_settings_roundtrip() {
        let (_st, relation, unit) = relation_fixture().await;

        assert!(relation.unit_settings(&unit).unwrap_err().is_not_found());

        relation
            .set_unit_settings(&unit, settings(&[("host", "10.0.0.7")]))
            .unwrap();
        assert_eq!(
            relation.unit_settings(&unit).unwrap(),
            settings(&[("host", "10.0.0.7")])
        );

        // Second write replaces the settings.
        relation
            .set_unit_settings(&unit, settings(&[("host", "10.0.0.8")]))
            .unwrap();
        assert_eq!(
            relation.unit_settings(&unit).unwrap(),
            settings(&[("host", "10.0.0.8")])
        );
    }

    #[tokio::test]
    async fn dead_relation_rejects_settings_writes() {
        let (st, relation, unit) = relation_fixture().await;

        let mut dying = st.relation(relation.id()).unwrap();
        dying.ensure_dead().unwrap();

        let err = relation
            .set_unit_settings(&unit, settings(&[("host", "x")]))
            .unwrap_err();
        assert!(err.is_conflict(), "got {err}");
    }

    #[tokio::test]
    async fn dead_relation_cleans_up_settings() {
        let (st, relation, unit) = relation_fixture().await;
        relation
            .set_unit_settings(&unit, settings(&[("host", "10.0.0.7")]))
            .unwrap();

        let mut handle = st.relation(relation.id()).unwrap();
        handle.ensure_dead().unwrap();
        assert!(relation.unit_settings(&unit).unwrap_err().is_not_found());

        // Cleanup is idempotent across repeated deaths.
        handle.ensure_dead().unwrap();
        assert!(relation.unit_settings(&unit).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn settings_key_parsing() {
        let relation = RelationId::new(4);
        let unit = UnitName::new("wordpress/1").unwrap();
        let key = settings_key(relation, &unit);
        assert_eq!(key, "r#4#wordpress/1");
        assert_eq!(unit_from_settings_key(&key, relation), Some("wordpress/1"));
        assert_eq!(unit_from_settings_key(&key, RelationId::new(5)), None);
    }
}
