// Copyright (c) 2024 Graphcore Ltd. All rights reserved.

//! Named simulation options.
//!
//! A [`Config`] holds the options a driver wants to override; components read
//! them with a per-option default. Boolean options are stored as integers so
//! that drivers can flip them from the same table.

use std::collections::HashMap;
use std::fmt;

use itertools::Itertools;

/// A table of named integer and string options.
#[derive(Clone, Debug, Default)]
pub struct Config {
    ints: HashMap<String, i64>,
    strs: HashMap<String, String>,
}

impl Config {
    /// Create an empty configuration; every read returns its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an integer option.
    pub fn set_int(&mut self, name: &str, value: i64) -> &mut Self {
        self.ints.insert(name.to_owned(), value);
        self
    }

    /// Set a string option.
    pub fn set_str(&mut self, name: &str, value: &str) -> &mut Self {
        self.strs.insert(name.to_owned(), value.to_owned());
        self
    }

    /// Read an integer option, falling back to `default`.
    pub fn int_or(&self, name: &str, default: i64) -> i64 {
        self.ints.get(name).copied().unwrap_or(default)
    }

    /// Read a boolean option stored as an integer, falling back to `default`.
    pub fn bool_or(&self, name: &str, default: bool) -> bool {
        self.ints
            .get(name)
            .map(|&v| v != 0)
            .unwrap_or(default)
    }

    /// Read a string option, falling back to `default`.
    pub fn str_or(&self, name: &str, default: &str) -> String {
        self.strs
            .get(name)
            .cloned()
            .unwrap_or_else(|| default.to_owned())
    }
}

/// The overridden options, sorted by name, one `name=value` per entry.
impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let options = self
            .ints
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .chain(self.strs.iter().map(|(name, value)| format!("{name}={value}")))
            .sorted()
            .join(" ");
        write!(f, "{options}")
    }
}
