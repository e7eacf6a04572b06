// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Prefix strip + ordered regex rewrite pipeline applied to raw OAI
//! identifiers.

use anyhow::{Context, Result};
use regex::Regex;

use crate::cfg::config::IdRewriteRule;

/// A compiled, position-correlated rewrite pipeline.
pub struct IdNormalizer {
    prefix: String,
    rules: Vec<(Regex, String)>,
}

impl IdNormalizer {
    pub fn compile(prefix: &str, rules: &[IdRewriteRule]) -> Result<Self> {
        let compiled = rules
            .iter()
            .map(|r| {
                Regex::new(&r.search)
                    .map(|re| (re, r.replace.clone()))
                    .with_context(|| format!("invalid idSearch pattern {:?}", r.search))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { prefix: prefix.to_string(), rules: compiled })
    }

    /// Strips the configured prefix (if present) then applies every rewrite
    /// rule in order.
    pub fn normalize(&self, raw_id: &str) -> String {
        let stripped = raw_id.strip_prefix(self.prefix.as_str()).unwrap_or(raw_id);
        self.rules
            .iter()
            .fold(stripped.to_string(), |acc, (re, replace)| {
                re.replace_all(&acc, replace.as_str()).into_owned()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_prefix_and_applies_rewrite() {
        let rules = vec![IdRewriteRule { search: "^abc".to_string(), replace: "xyz".to_string() }];
        let norm = IdNormalizer::compile("oai:foo.org:", &rules).unwrap();
        assert_eq!(norm.normalize("oai:foo.org:abc123"), "xyz123");
    }

    #[test]
    fn leaves_id_unchanged_without_rules() {
        let norm = IdNormalizer::compile("oai:foo.org:", &[]).unwrap();
        assert_eq!(norm.normalize("oai:foo.org:abc123"), "abc123");
    }

    #[test]
    fn rules_apply_in_order() {
        let rules = vec![
            IdRewriteRule { search: "a".to_string(), replace: "b".to_string() },
            IdRewriteRule { search: "b".to_string(), replace: "c".to_string() },
        ];
        let norm = IdNormalizer::compile("", &rules).unwrap();
        // "a" -> "b" -> every "b" (including the one just produced) -> "c"
        assert_eq!(norm.normalize("a"), "c");
    }

    #[test]
    fn prefix_mismatch_leaves_id_untouched() {
        let norm = IdNormalizer::compile("oai:bar.org:", &[]).unwrap();
        assert_eq!(norm.normalize("oai:foo.org:abc123"), "oai:foo.org:abc123");
    }
}
