use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

const ANONYMOUS_ACTOR: &str = "anonymous";

/// Deterministic identity of a logically unique operation.
///
/// Built from the operation name, its parameters (sorted by name) and the acting
/// user, so two calls with the same semantics always collide and two users never do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn builder(operation: impl Into<String>) -> RequestKeyBuilder {
        RequestKeyBuilder {
            operation: operation.into(),
            params: BTreeMap::new(),
            actor: None,
        }
    }

    /// Wraps an already-composed key verbatim.
    pub fn raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestKey {
    fn from(value: &str) -> Self {
        Self::raw(value)
    }
}

#[derive(Debug, Clone)]
pub struct RequestKeyBuilder {
    operation: String,
    params: BTreeMap<String, String>,
    actor: Option<String>,
}

impl RequestKeyBuilder {
    pub fn param(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn actor(mut self, user_id: impl fmt::Display) -> Self {
        self.actor = Some(user_id.to_string());
        self
    }

    pub fn build(self) -> RequestKey {
        let params = self
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k), escape(v)))
            .collect::<Vec<_>>()
            .join("&");
        let actor = self.actor.as_deref().unwrap_or(ANONYMOUS_ACTOR);
        RequestKey(format!(
            "{}|{}|actor={}",
            escape(&self.operation),
            params,
            escape(actor)
        ))
    }
}

/// Percent-escapes the separators used by the key layout.
fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '|' => out.push_str("%7C"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            _ => out.push(c),
        }
    }
    out
}
