//! Short identifiers for processes and tasks.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default identifier length in hex characters.
pub const DEFAULT_ID_LEN: usize = 8;

/// Produces short random identifiers, retrying while a candidate is taken.
#[derive(Debug, Clone, Copy)]
pub struct IdGenerator {
    len: usize,
}

impl IdGenerator {
    /// `len` is clamped to `1..=32` (the length of a simple-form UUID).
    pub fn new(len: usize) -> Self {
        Self {
            len: len.clamp(1, 32),
        }
    }

    /// Generate a candidate, retrying while `is_taken` reports a collision.
    ///
    /// The caller must guarantee the registry leaves at least one free id.
    pub fn next_unique(&self, is_taken: impl Fn(&str) -> bool) -> String {
        loop {
            let candidate = self.candidate();
            if !is_taken(&candidate) {
                return candidate;
            }
            tracing::trace!(candidate = %candidate, "identifier collision, retrying");
        }
    }

    fn candidate(&self) -> String {
        let mut simple = Uuid::new_v4().simple().to_string();
        simple.truncate(self.len);
        simple
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_ID_LEN)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a live worker process.
    ProcessId
);

string_id!(
    /// Identifier of a submitted task.
    TaskId
);
