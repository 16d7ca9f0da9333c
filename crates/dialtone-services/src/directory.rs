//! Screen-name directory — read-only lookups against the account store.

use std::collections::HashMap;

use serde::Serialize;

use crate::connection::normalize_screen_name;

/// What the directory knows about a screen name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScreenNameRecord {
    /// Display form, as registered.
    pub screen_name: String,
}

pub trait Directory: Send + Sync {
    fn lookup(&self, screen_name: &str) -> Option<ScreenNameRecord>;
}

/// Directory backed by a fixed list. An empty list admits every name.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    names: HashMap<String, ScreenNameRecord>,
}

impl StaticDirectory {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names
            .into_iter()
            .map(Into::into)
            .filter(|n: &String| !normalize_screen_name(n).is_empty())
            .map(|n| {
                (
                    normalize_screen_name(&n),
                    ScreenNameRecord { screen_name: n },
                )
            })
            .collect();
        Self { names }
    }

    /// Directory that admits any non-empty screen name.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.names.is_empty()
    }
}

impl Directory for StaticDirectory {
    fn lookup(&self, screen_name: &str) -> Option<ScreenNameRecord> {
        let key = normalize_screen_name(screen_name);
        if key.is_empty() {
            return None;
        }
        if self.is_open() {
            return Some(ScreenNameRecord {
                screen_name: screen_name.trim().to_string(),
            });
        }
        self.names.get(&key).cloned()
    }
}
