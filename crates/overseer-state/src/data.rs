use crate::StateError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Keyed bag of serializable values.
///
/// Values are held as `serde_json::Value`, a tagged union over strings,
/// numbers, booleans, lists and nested maps. Typed reads fail with
/// [`StateError::NoState`] when the key is absent and with
/// [`StateError::WrongType`] when it is present but does not decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataBag(BTreeMap<String, serde_json::Value>);

impl DataBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        let raw = self
            .0
            .get(key)
            .ok_or_else(|| StateError::NoState(key.to_owned()))?;
        T::deserialize(raw).map_err(|source| StateError::WrongType {
            key: key.to_owned(),
            source,
        })
    }

    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        let raw = serde_json::to_value(value)?;
        self.0.insert(key.to_owned(), raw);
        Ok(())
    }

    /// Raw access for callers that inspect the value shape themselves.
    pub fn get_raw(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.0.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Setup {
        name: String,
        revision: u32,
    }

    #[test]
    fn nested_record_roundtrip() {
        let mut bag = DataBag::new();
        let setup = Setup {
            name: "foo".to_owned(),
            revision: 33,
        };
        bag.set("snap-setup", &setup).unwrap();
        let back: Setup = bag.get("snap-setup").unwrap();
        assert_eq!(back, setup);
    }

    #[test]
    fn missing_key_is_no_state() {
        let bag = DataBag::new();
        let err = bag.get::<String>("absent").unwrap_err();
        assert!(matches!(err, StateError::NoState(ref k) if k == "absent"));
    }

    #[test]
    fn type_mismatch_is_distinguishable() {
        let mut bag = DataBag::new();
        bag.set("count", &3_u32).unwrap();
        let err = bag.get::<Vec<String>>("count").unwrap_err();
        assert!(matches!(err, StateError::WrongType { ref key, .. } if key == "count"));
        assert!(!err.is_no_state());
    }

    #[test]
    fn maps_lists_and_scalars() {
        let mut bag = DataBag::new();
        let mut attrs = HashMap::new();
        attrs.insert("path".to_owned(), serde_json::json!(["/dev/a", "/dev/b"]));
        bag.set("attrs", &attrs).unwrap();
        bag.set("auto", &true).unwrap();
        bag.set("summary", "hello").unwrap();

        let back: HashMap<String, serde_json::Value> = bag.get("attrs").unwrap();
        assert_eq!(back["path"][1], "/dev/b");
        assert!(bag.get::<bool>("auto").unwrap());
        assert_eq!(bag.get::<String>("summary").unwrap(), "hello");
        assert_eq!(bag.keys().collect::<Vec<_>>(), vec!["attrs", "auto", "summary"]);
    }

    #[test]
    fn remove_reports_presence() {
        let mut bag = DataBag::new();
        bag.set("k", &1).unwrap();
        assert!(bag.contains("k"));
        assert!(bag.remove("k"));
        assert!(!bag.remove("k"));
        assert!(bag.is_empty());
    }
}
