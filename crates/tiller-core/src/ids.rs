//! Core identifier types for tiller.
//!
//! This module provides strongly-typed identifiers for machines, units,
//! applications and relations. Name-shaped identifiers are validated on
//! construction so malformed caller input is rejected before any store
//! access; numeric identifiers parse strictly from decimal.
//!
//! Every identifier derives a *global key*, the namespacing string under
//! which the entity's presence state is tracked. Keys use a one-letter
//! kind prefix (`m#`, `u#`, `a#`, `r#`) so no two entities of different
//! kinds can ever collide.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A numeric machine identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(u64);

impl MachineId {
    /// Create a machine id from its numeric value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Return the numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The global presence key for this machine.
    #[must_use]
    pub fn global_key(self) -> String {
        format!("m#{}", self.0)
    }

    /// A name identifying the machine that is safe to use as a file name,
    /// distinct from the path keys of all other entities.
    #[must_use]
    pub fn path_key(self) -> String {
        format!("machine-{}", self.0)
    }
}

impl fmt::Debug for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachineId({})", self.0)
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MachineId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_decimal(s)
            .map(Self)
            .ok_or_else(|| IdError::InvalidNumericId(s.to_string()))
    }
}

/// A numeric relation identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationId(u64);

impl RelationId {
    /// Create a relation id from its numeric value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Return the numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The global presence key for this relation.
    #[must_use]
    pub fn global_key(self) -> String {
        format!("r#{}", self.0)
    }
}

impl fmt::Debug for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelationId({})", self.0)
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RelationId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_decimal(s)
            .map(Self)
            .ok_or_else(|| IdError::InvalidNumericId(s.to_string()))
    }
}

/// A validated application name.
///
/// Names are lowercase alphanumeric segments separated by single hyphens.
/// The name must start with a letter, and every segment after the first
/// must contain at least one letter, so `wordpress` and `ha-proxy2` are
/// valid while `2fast`, `-x`, `app-` and `app-0` are not.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ApplicationName(String);

impl ApplicationName {
    /// Validate and construct an application name.
    ///
    /// # Errors
    ///
    /// Returns `IdError::InvalidApplicationName` if the name does not
    /// satisfy the naming rule.
    pub fn new(name: &str) -> Result<Self, IdError> {
        if is_valid_application(name) {
            Ok(Self(name.to_string()))
        } else {
            Err(IdError::InvalidApplicationName(name.to_string()))
        }
    }

    /// Return the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The global presence key for this application.
    #[must_use]
    pub fn global_key(&self) -> String {
        format!("a#{}", self.0)
    }
}

impl fmt::Debug for ApplicationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApplicationName({})", self.0)
    }
}

impl fmt::Display for ApplicationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ApplicationName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ApplicationName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ApplicationName> for String {
    fn from(name: ApplicationName) -> Self {
        name.0
    }
}

/// A validated unit name of the form `<application>/<ordinal>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitName(String);

impl UnitName {
    /// Validate and construct a unit name.
    ///
    /// # Errors
    ///
    /// Returns `IdError::InvalidUnitName` if the name is not a valid
    /// application name followed by `/` and a decimal ordinal.
    pub fn new(name: &str) -> Result<Self, IdError> {
        let invalid = || IdError::InvalidUnitName(name.to_string());
        let (app, ordinal) = name.split_once('/').ok_or_else(invalid)?;
        if !is_valid_application(app) || parse_decimal(ordinal).is_none() {
            return Err(invalid());
        }
        Ok(Self(name.to_string()))
    }

    /// Build a unit name from its parts.
    #[must_use]
    pub fn from_parts(application: &ApplicationName, ordinal: u64) -> Self {
        Self(format!("{application}/{ordinal}"))
    }

    /// Return the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The application this unit belongs to.
    #[must_use]
    pub fn application(&self) -> ApplicationName {
        let (app, _) = self.0.split_once('/').expect("validated on construction");
        ApplicationName(app.to_string())
    }

    /// The ordinal within the application.
    #[must_use]
    pub fn ordinal(&self) -> u64 {
        let (_, ordinal) = self.0.split_once('/').expect("validated on construction");
        parse_decimal(ordinal).expect("validated on construction")
    }

    /// The global presence key for this unit.
    #[must_use]
    pub fn global_key(&self) -> String {
        format!("u#{}", self.0)
    }
}

impl fmt::Debug for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitName({})", self.0)
    }
}

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UnitName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for UnitName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<UnitName> for String {
    fn from(name: UnitName) -> Self {
        name.0
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input is not a valid application name.
    #[error("application name {0:?} not valid")]
    InvalidApplicationName(String),

    /// The input is not a valid unit name.
    #[error("unit name {0:?} not valid")]
    InvalidUnitName(String),

    /// The input is not a decimal numeric id.
    #[error("numeric id {0:?} not valid")]
    InvalidNumericId(String),
}

/// Strict decimal parse: non-empty, digits only, no sign or whitespace.
fn parse_decimal(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn is_valid_application(name: &str) -> bool {
    let mut segments = name.split('-');
    let Some(first) = segments.next() else {
        return false;
    };
    if !first.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
        return false;
    }
    if !first.chars().all(is_name_char) {
        return false;
    }
    // Later segments may start with a digit but must contain a letter,
    // so a name can never be confused with a unit ordinal suffix.
    segments.all(|seg| {
        !seg.is_empty()
            && seg.chars().all(is_name_char)
            && seg.chars().any(|c| c.is_ascii_lowercase())
    })
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_application_names() {
        for name in ["wordpress", "ha-proxy", "ha-proxy2", "app-v2", "a", "a0-b1"] {
            assert!(ApplicationName::new(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn invalid_application_names() {
        for name in [
            "", "2fast", "-x", "app-", "app--x", "app-0", "App", "my_app", "app name",
        ] {
            assert!(
                matches!(
                    ApplicationName::new(name),
                    Err(IdError::InvalidApplicationName(_))
                ),
                "{name} should be invalid"
            );
        }
    }

    #[test]
    fn unit_name_parts() {
        let unit = UnitName::new("wordpress/12").unwrap();
        assert_eq!(unit.application().as_str(), "wordpress");
        assert_eq!(unit.ordinal(), 12);
        assert_eq!(unit.global_key(), "u#wordpress/12");
    }

    #[test]
    fn unit_name_from_parts_roundtrip() {
        let app = ApplicationName::new("mysql").unwrap();
        let unit = UnitName::from_parts(&app, 3);
        assert_eq!(unit.as_str(), "mysql/3");
        assert_eq!(UnitName::new(unit.as_str()).unwrap(), unit);
    }

    #[test]
    fn invalid_unit_names() {
        for name in ["wordpress", "wordpress/", "/0", "wordpress/x", "wordpress/0/1", "Word/0"] {
            assert!(
                matches!(UnitName::new(name), Err(IdError::InvalidUnitName(_))),
                "{name} should be invalid"
            );
        }
    }

    #[test]
    fn machine_id_keys() {
        let id = MachineId::new(7);
        assert_eq!(id.global_key(), "m#7");
        assert_eq!(id.path_key(), "machine-7");
        assert_eq!(id.to_string(), "7");
    }

    #[test]
    fn machine_id_parse_strict() {
        assert_eq!("42".parse::<MachineId>().unwrap(), MachineId::new(42));
        for bad in ["", "-1", "+1", " 1", "4x", "0x4"] {
            assert!(matches!(
                bad.parse::<MachineId>(),
                Err(IdError::InvalidNumericId(_))
            ));
        }
    }

    #[test]
    fn global_keys_are_distinct_across_kinds() {
        let keys = [
            MachineId::new(0).global_key(),
            RelationId::new(0).global_key(),
            ApplicationName::new("app").unwrap().global_key(),
            UnitName::new("app/0").unwrap().global_key(),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn application_name_serde_roundtrip() {
        let name = ApplicationName::new("ha-proxy").unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"ha-proxy\"");
        let parsed: ApplicationName = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn application_name_serde_rejects_invalid() {
        let result: Result<ApplicationName, _> = serde_json::from_str("\"Not-Valid\"");
        assert!(result.is_err());
    }
}
