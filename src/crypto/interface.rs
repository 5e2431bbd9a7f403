//! Versioned interface descriptors.
//!
//! Every pluggable component (cipher algorithm, name codec, file I/O layer)
//! is identified by an [`Interface`]: a name plus a semantic version with a
//! backwards-compatibility window. Serialized configurations carry these
//! descriptors so a mount can refuse data written by an incompatible
//! implementation instead of producing garbage.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A named, versioned component identity.
///
/// `current` is the implemented revision, `revision` a minor counter with no
/// compatibility meaning, and `age` how many prior revisions of `current`
/// this implementation can still serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(rename = "major")]
    pub current: u32,
    #[serde(rename = "minor")]
    pub revision: u32,
    #[serde(default)]
    pub age: u32,
}

impl Interface {
    pub fn new(name: &str, current: u32, revision: u32, age: u32) -> Self {
        Interface {
            name: name.to_owned(),
            current,
            revision,
            age,
        }
    }

    /// Whether an implementation of `self` can serve a consumer that was
    /// built against `required`.
    ///
    /// The compatibility window is `[current - age, current]`: the consumer's
    /// version must fall inside it and the names must match.
    pub fn supports(&self, required: &Interface) -> bool {
        self.name == required.name
            && self.current.saturating_sub(self.age) <= required.current
            && required.current <= self.current
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.name, self.current, self.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supports_within_window() {
        let provider = Interface::new("cipher/aes", 3, 0, 2);
        assert!(provider.supports(&Interface::new("cipher/aes", 3, 0, 0)));
        assert!(provider.supports(&Interface::new("cipher/aes", 2, 5, 0)));
        assert!(provider.supports(&Interface::new("cipher/aes", 1, 0, 0)));
        assert!(!provider.supports(&Interface::new("cipher/aes", 0, 0, 0)));
        assert!(!provider.supports(&Interface::new("cipher/aes", 4, 0, 0)));
    }

    #[test]
    fn supports_requires_matching_name() {
        let provider = Interface::new("cipher/aes", 3, 0, 2);
        assert!(!provider.supports(&Interface::new("cipher/blowfish", 3, 0, 0)));
    }

    #[test]
    fn display_format() {
        let iface = Interface::new("nameio/block", 4, 0, 2);
        assert_eq!(iface.to_string(), "nameio/block:4:0");
    }
}
