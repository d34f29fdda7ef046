//! # String Interning
//!
//! Identifiers in the Snap tree are interned so that symbol-table keys,
//! mangled names and member names compare and hash as small integers.
//!
//! A single process-wide interner backs every [`InternedString`]. Passes run
//! sequentially, so the mutex is effectively uncontended; it exists so that
//! trees can be deserialized without threading an arena through serde.

use std::fmt;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use string_interner::{DefaultBackend, StringInterner, Symbol as SymbolTrait};

/// Symbol type used for string interning
pub type Symbol = string_interner::DefaultSymbol;

static GLOBAL_INTERNER: Lazy<Mutex<StringInterner<DefaultBackend>>> =
    Lazy::new(|| Mutex::new(StringInterner::new()));

/// An interned identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InternedString(Symbol);

impl InternedString {
    /// Intern a string in the global interner
    pub fn new_global(s: &str) -> Self {
        let mut interner = GLOBAL_INTERNER
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        InternedString(interner.get_or_intern(s))
    }

    /// Resolve this InternedString to its text using the global interner
    pub fn resolve_global(&self) -> Option<String> {
        let interner = GLOBAL_INTERNER
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        interner.resolve(self.0).map(|s| s.to_string())
    }

    /// Resolve to text, falling back to the raw symbol index
    pub fn as_string(&self) -> String {
        self.resolve_global()
            .unwrap_or_else(|| format!("<sym{}>", self.0.to_usize()))
    }

    /// Get the underlying symbol
    pub fn symbol(&self) -> Symbol {
        self.0
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.as_string().starts_with(prefix)
    }
}

impl From<&str> for InternedString {
    fn from(s: &str) -> Self {
        InternedString::new_global(s)
    }
}

impl From<String> for InternedString {
    fn from(s: String) -> Self {
        InternedString::new_global(&s)
    }
}

impl PartialEq<&str> for InternedString {
    fn eq(&self, other: &&str) -> bool {
        self.resolve_global().as_deref() == Some(*other)
    }
}

impl fmt::Display for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl fmt::Debug for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_string())
    }
}

// Serialized as text so dumps are readable and survive a fresh interner.
impl Serialize for InternedString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for InternedString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        Ok(InternedString::new_global(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_interning() {
        let a = InternedString::new_global("hello");
        let b = InternedString::from("hello");
        let c = InternedString::from("world");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.resolve_global().as_deref(), Some("hello"));
        assert!(a == "hello");
    }

    #[test]
    fn test_serializes_as_text() {
        let name = InternedString::from("__temp0");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"__temp0\"");

        let back: InternedString = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
        assert!(back.starts_with("__temp"));
    }
}
