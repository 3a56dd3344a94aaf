use std::collections::BTreeMap;

use crate::{eventually::Eventually, scope::Scope, value::Value};

/// The caller's data for one render: named values visible to the template
/// after its own local bindings.
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(transparent))]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Context {
    data: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<N: AsRef<str>, V: Into<Value>>(&mut self, name: N, value: V) -> &mut Self {
        self.data.insert(name.as_ref().to_string(), value.into());
        self
    }

    /// Builder form of [`Context::insert`].
    #[must_use]
    pub fn with<N: AsRef<str>, V: Into<Value>>(mut self, name: N, value: V) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get<N: AsRef<str>>(&self, name: N) -> Option<&Value> {
        self.data.get(name.as_ref())
    }

    pub fn contains<N: AsRef<str>>(&self, name: N) -> bool {
        self.data.contains_key(name.as_ref())
    }

    /// A new scope frame holding a copy of every value.
    pub fn to_scope(&self) -> Scope {
        self.data
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

impl<N: Into<String>, V: Into<Value>> FromIterator<(N, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            data: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

/// `BloxInterface` is the engine-level surface of blox: a registry of named
/// templates rendered on demand.
pub trait BloxInterface {
    /// `add_template` parses `content` and makes it available as `name`.
    ///
    /// # Errors
    /// - If the template name is a duplicate.
    /// - If the content does not parse.
    fn add_template<N: AsRef<str>, C: AsRef<str>>(
        &mut self,
        name: N,
        content: C,
    ) -> crate::BloxResult<()>;

    /// `render` starts rendering the named template with the given context.
    /// The returned value is ready at once unless the template reads a
    /// deferred value.
    ///
    /// # Errors
    /// - If the template name is not found.
    fn render<N: AsRef<str>>(
        &self,
        template_name: N,
        context: Option<&Context>,
    ) -> crate::BloxResult<Eventually<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_context_builder() {
        let mut context = Context::new().with("name", "Fred").with("age", 30);
        context.insert("items", vec![1, 2]);

        assert!(context.contains("name"));
        assert_eq!(context.get("age"), Some(&Value::from(30)));
        assert_eq!(context.get("items"), Some(&Value::array([1, 2])));
        assert_eq!(context.get("missing"), None);

        let scope = context.to_scope();
        assert_eq!(scope.get("name"), Some(Value::from("Fred")));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_context_from_iter() {
        let context: Context = [("a", 1), ("b", 2)].into_iter().collect();
        assert_eq!(context.get("b"), Some(&Value::from(2)));
    }
}
