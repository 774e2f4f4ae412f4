//! String interning.
//!
//! Ref `0` is always the empty string and doubles as "no string" for
//! optional fields such as a prototype's symbol.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StringRef(pub u32);

impl StringRef {
    pub const EMPTY: StringRef = StringRef(0);

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

/// Interned strings, serialized as a plain list.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct StringTable {
    strings: Vec<String>,
    index: HashMap<String, StringRef>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::from(Vec::new())
    }

    /// Intern `s`, returning the existing ref if it was seen before.
    pub fn intern(&mut self, s: &str) -> StringRef {
        if let Some(r) = self.index.get(s) {
            return *r;
        }
        let r = StringRef(self.strings.len() as u32);
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), r);
        r
    }

    pub fn get(&self, r: StringRef) -> Option<&str> {
        self.strings.get(r.0 as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.len() <= 1
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<String>> for StringTable {
    fn from(mut strings: Vec<String>) -> Self {
        if strings.first().map_or(true, |s| !s.is_empty()) {
            strings.insert(0, String::new());
        }
        let index = strings
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), StringRef(i as u32)))
            .collect();
        Self { strings, index }
    }
}

impl From<StringTable> for Vec<String> {
    fn from(table: StringTable) -> Self {
        table.strings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_deduplicates() {
        let mut st = StringTable::new();
        let a = st.intern("alpha");
        let b = st.intern("beta");
        assert_ne!(a, b);
        assert_eq!(st.intern("alpha"), a);
        assert_eq!(st.get(a), Some("alpha"));
        assert_eq!(st.len(), 3);
    }

    #[test]
    fn test_empty_string_is_ref_zero() {
        let mut st = StringTable::new();
        assert!(st.is_empty());
        assert_eq!(st.intern(""), StringRef::EMPTY);
        assert_eq!(st.get(StringRef::EMPTY), Some(""));
        assert_eq!(st.get(StringRef(42)), None);
    }

    #[test]
    fn test_rebuilt_table_keeps_refs() {
        let mut st = StringTable::new();
        let r = st.intern("kept");
        let strings: Vec<String> = st.into();
        let mut rebuilt = StringTable::from(strings);
        assert_eq!(rebuilt.get(r), Some("kept"));
        assert_eq!(rebuilt.intern("kept"), r);
    }
}
