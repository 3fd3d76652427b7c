//! Names of managed objects
//!
//! An object name is a domain followed by an unordered list of key
//! properties: `domain:key=value,key2=value2`. Two names are equal when their
//! canonical forms (keys sorted) are equal.
//!
//! # Patterns
//! - `*` and `?` in the domain match any run of characters / one character
//! - `*` and `?` in a property value match the same way
//! - a trailing `,*` (or a property list of just `*`) matches names carrying
//!   any further properties
//!
//! `*:*` matches every name.

use remoting_proto::{Fault, FaultKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObjectNameError {
    #[error("Object name '{0}' has no domain separator")]
    MissingDomain(String),

    #[error("Object name '{0}' has no key properties")]
    NoProperties(String),

    #[error("Malformed key property '{0}'")]
    MalformedProperty(String),

    #[error("Key '{0}' appears more than once")]
    DuplicateKey(String),

    #[error("Domain '{0}' contains an illegal character")]
    IllegalDomain(String),
}

impl From<ObjectNameError> for Fault {
    fn from(err: ObjectNameError) -> Self {
        Fault::new(FaultKind::MalformedObjectName, err.to_string())
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectName {
    domain: String,
    properties: BTreeMap<String, String>,
    /// Matches names carrying properties beyond the listed ones
    property_list_pattern: bool,
    canonical: String,
}

impl ObjectName {
    pub fn parse(name: &str) -> Result<Self, ObjectNameError> {
        let (domain, list) = name
            .split_once(':')
            .ok_or_else(|| ObjectNameError::MissingDomain(name.to_string()))?;

        if domain.contains(['=', ',', '\n']) {
            return Err(ObjectNameError::IllegalDomain(domain.to_string()));
        }
        if list.is_empty() {
            return Err(ObjectNameError::NoProperties(name.to_string()));
        }

        let mut properties = BTreeMap::new();
        let mut property_list_pattern = false;

        for part in list.split(',') {
            if part == "*" {
                if property_list_pattern {
                    return Err(ObjectNameError::MalformedProperty(part.to_string()));
                }
                property_list_pattern = true;
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| ObjectNameError::MalformedProperty(part.to_string()))?;
            if key.is_empty()
                || value.is_empty()
                || key.contains(['*', '?', ':', '='])
                || value.contains([':', '='])
            {
                return Err(ObjectNameError::MalformedProperty(part.to_string()));
            }
            if properties
                .insert(key.to_string(), value.to_string())
                .is_some()
            {
                return Err(ObjectNameError::DuplicateKey(key.to_string()));
            }
        }

        Ok(Self::build(
            domain.to_string(),
            properties,
            property_list_pattern,
        ))
    }

    /// Name with a single key property
    pub fn with_property(domain: &str, key: &str, value: &str) -> Result<Self, ObjectNameError> {
        Self::parse(&format!("{}:{}={}", domain, key, value))
    }

    /// The pattern matching every name
    pub fn wildcard() -> Self {
        Self::build("*".to_string(), BTreeMap::new(), true)
    }

    fn build(
        domain: String,
        properties: BTreeMap<String, String>,
        property_list_pattern: bool,
    ) -> Self {
        let mut canonical = format!("{}:", domain);
        let list: Vec<String> = properties
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        canonical.push_str(&list.join(","));
        if property_list_pattern {
            if !properties.is_empty() {
                canonical.push(',');
            }
            canonical.push('*');
        }

        Self {
            domain,
            properties,
            property_list_pattern,
            canonical,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Domain, then key properties sorted by key
    pub fn canonical_name(&self) -> &str {
        &self.canonical
    }

    pub fn is_domain_pattern(&self) -> bool {
        self.domain.contains(['*', '?'])
    }

    pub fn is_property_value_pattern(&self) -> bool {
        self.properties.values().any(|v| v.contains(['*', '?']))
    }

    pub fn is_property_list_pattern(&self) -> bool {
        self.property_list_pattern
    }

    pub fn is_pattern(&self) -> bool {
        self.is_domain_pattern()
            || self.is_property_list_pattern()
            || self.is_property_value_pattern()
    }

    /// The same name in another domain
    pub fn in_domain(&self, domain: &str) -> Self {
        Self::build(
            domain.to_string(),
            self.properties.clone(),
            self.property_list_pattern,
        )
    }

    /// Whether `name` is selected by this name used as a pattern
    ///
    /// A name that is not a pattern only matches itself.
    pub fn matches(&self, name: &ObjectName) -> bool {
        if !wildcard_match(&self.domain, &name.domain) {
            return false;
        }

        for (key, pattern) in &self.properties {
            match name.properties.get(key) {
                Some(value) if wildcard_match(pattern, value) => {}
                _ => return false,
            }
        }

        self.property_list_pattern || self.properties.len() == name.properties.len()
    }
}

/// Glob match supporting `*` (any run) and `?` (one character)
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

impl FromStr for ObjectName {
    type Err = ObjectNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ObjectName {
    type Error = ObjectNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ObjectName> for String {
    fn from(name: ObjectName) -> Self {
        name.canonical
    }
}

impl PartialEq for ObjectName {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for ObjectName {}

impl Hash for ObjectName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for ObjectName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl fmt::Debug for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectName({})", self.canonical)
    }
}
