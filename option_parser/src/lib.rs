// Copyright © 2024 The vmcli Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Parsing of comma separated `key=value` clauses such as
//! `type=linux,kernel=/path/to/kernel,initialRamdisk=/path/to/initrd`.
//!
//! Keys and values are taken verbatim. There is no quoting or escaping, so a
//! value can contain `=` or `"` but never `,`.

use std::collections::HashMap;

use log::{debug, warn};

/// A clause segment split on its first `=`.
pub type Clause = (String, String);

/// Splits `input` into ordered `(key, value)` pairs.
///
/// Segments are separated by `,` and split on their first `=` only, so values
/// may contain further `=` characters. Empty segments are skipped, as are
/// segments without a `=` or with an empty key.
pub fn parse_clause(input: &str) -> Vec<Clause> {
    let mut clauses = Vec::new();

    for segment in input.trim().split(',') {
        if segment.is_empty() {
            continue;
        }

        match segment.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                clauses.push((key.to_owned(), value.to_owned()))
            }
            _ => warn!("Ignoring \"{segment}\": expected key=value"),
        }
    }

    clauses
}

#[derive(Default)]
pub struct OptionParser {
    options: HashMap<String, Option<String>>,
}

impl OptionParser {
    pub fn new() -> Self {
        Self {
            options: HashMap::new(),
        }
    }

    pub fn parse(&mut self, input: &str) -> &mut Self {
        for (key, value) in parse_clause(input) {
            match self.options.get_mut(&key) {
                Some(slot) => *slot = Some(value),
                None => debug!("Ignoring unknown option \"{key}\""),
            }
        }

        self
    }

    pub fn add(&mut self, option: &str) -> &mut Self {
        assert!(
            !option.is_empty() && !option.contains(['=', ',']),
            "forbidden character in option name"
        );
        self.options.insert(option.to_owned(), None);

        self
    }

    pub fn get(&self, option: &str) -> Option<String> {
        self.options
            .get(option)
            .and_then(|v| v.clone())
            .filter(|s| !s.is_empty())
    }

    pub fn is_set(&self, option: &str) -> bool {
        self.options
            .get(option)
            .is_some_and(|v| v.is_some())
    }
}
