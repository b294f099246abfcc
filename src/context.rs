//! Variable context threaded through a flow run.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Flat variable store for one run.
///
/// Keys are user variable names or the synthetic `API[n]` keys that
/// hold the parsed response body of the n-th executed step.
/// Serializes as a plain JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    vars: Map<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key under which step `index` (1-based) stores its response.
    pub fn api_key(index: usize) -> String {
        format!("API[{index}]")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Like [`Context::get`], but a stored `null` counts as missing.
    pub fn resolve(&self, key: &str) -> Option<&Value> {
        self.vars.get(key).filter(|value| !value.is_null())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    /// Overlay `vars` on the context; later keys win.
    pub fn extend<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        for (key, value) in vars {
            self.vars.insert(key, value);
        }
    }

    /// Response body recorded for step `index`, if that step ran.
    pub fn response(&self, index: usize) -> Option<&Value> {
        self.vars.get(&Self::api_key(index))
    }

    pub fn record_response(&mut self, index: usize, body: Value) {
        self.vars.insert(Self::api_key(index), body);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars.iter()
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.vars
    }
}

impl From<Map<String, Value>> for Context {
    fn from(vars: Map<String, Value>) -> Self {
        Self { vars }
    }
}

impl FromIterator<(String, Value)> for Context {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}
