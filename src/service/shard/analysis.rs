// Copyright 2024 Quiver Labs Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Text analysis: a named analyzer turns field text into a stream of
//! normalized terms with positions. The same analyzer is used at index and
//! search time for a field, resolved through the index mappings.

use std::{str::FromStr, sync::Arc};

use config::RwHashMap;
use infra::errors::{Error, Result};

/// English stop words, the classic Lucene list.
const ENGLISH_STOP_WORDS: [&str; 33] = [
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub term: String,
    pub position: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Analyzer {
    /// Split on non-alphanumeric, lowercase.
    Standard,
    /// Split on non-letter, lowercase.
    Simple,
    /// Split on whitespace, keep case.
    Whitespace,
    /// The whole input as a single term.
    Keyword,
    /// Standard plus stop-word removal and light suffix stripping.
    English,
    /// CJK unigrams; latin runs fall back to standard behavior.
    Chinese,
    /// Standard for latin script plus CJK unigrams.
    Multilingual,
}

impl FromStr for Analyzer {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "standard" => Ok(Analyzer::Standard),
            "simple" => Ok(Analyzer::Simple),
            "whitespace" => Ok(Analyzer::Whitespace),
            "keyword" => Ok(Analyzer::Keyword),
            "english" => Ok(Analyzer::English),
            "chinese" => Ok(Analyzer::Chinese),
            "multilingual" => Ok(Analyzer::Multilingual),
            _ => Err(Error::InvalidArgument(format!("unknown analyzer: {s}"))),
        }
    }
}

impl Analyzer {
    pub fn analyze(&self, text: &str) -> Vec<Token> {
        match self {
            Analyzer::Standard => split_tokens(text, |c| c.is_alphanumeric(), true),
            Analyzer::Simple => split_tokens(text, |c| c.is_alphabetic(), true),
            Analyzer::Whitespace => split_tokens(text, |c| !c.is_whitespace(), false),
            Analyzer::Keyword => {
                if text.is_empty() {
                    vec![]
                } else {
                    vec![Token {
                        term: text.to_string(),
                        position: 0,
                    }]
                }
            }
            Analyzer::English => {
                let mut out = Vec::new();
                let mut position = 0;
                for token in split_tokens(text, |c| c.is_alphanumeric(), true) {
                    if ENGLISH_STOP_WORDS.contains(&token.term.as_str()) {
                        position += 1;
                        continue;
                    }
                    out.push(Token {
                        term: strip_english_suffix(&token.term),
                        position,
                    });
                    position += 1;
                }
                out
            }
            Analyzer::Chinese | Analyzer::Multilingual => cjk_tokens(text),
        }
    }
}

fn split_tokens(text: &str, keep: fn(char) -> bool, lowercase: bool) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut position = 0;
    for c in text.chars() {
        if keep(c) {
            if lowercase {
                current.extend(c.to_lowercase());
            } else {
                current.push(c);
            }
        } else if !current.is_empty() {
            tokens.push(Token {
                term: std::mem::take(&mut current),
                position,
            });
            position += 1;
        }
    }
    if !current.is_empty() {
        tokens.push(Token {
            term: current,
            position,
        });
    }
    tokens
}

/// Light s-stemmer: plural and common verb suffixes only.
fn strip_english_suffix(term: &str) -> String {
    let stripped = if term.len() > 4 && term.ends_with("ies") {
        format!("{}y", &term[..term.len() - 3])
    } else if term.len() > 4 && (term.ends_with("ing") || term.ends_with("ed")) {
        let cut = if term.ends_with("ing") { 3 } else { 2 };
        term[..term.len() - cut].to_string()
    } else if term.len() > 3 && term.ends_with('s') && !term.ends_with("ss") {
        term[..term.len() - 1].to_string()
    } else {
        term.to_string()
    };
    stripped
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{3040}'..='\u{30FF}'
        | '\u{AC00}'..='\u{D7AF}')
}

/// CJK characters become unigrams; everything else is tokenized like the
/// standard analyzer.
fn cjk_tokens(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut position = 0;
    let mut flush = |current: &mut String, position: &mut u32, tokens: &mut Vec<Token>| {
        if !current.is_empty() {
            tokens.push(Token {
                term: std::mem::take(current),
                position: *position,
            });
            *position += 1;
        }
    };
    for c in text.chars() {
        if is_cjk(c) {
            flush(&mut current, &mut position, &mut tokens);
            tokens.push(Token {
                term: c.to_string(),
                position,
            });
            position += 1;
        } else if c.is_alphanumeric() {
            current.extend(c.to_lowercase());
        } else {
            flush(&mut current, &mut position, &mut tokens);
        }
    }
    flush(&mut current, &mut position, &mut tokens);
    tokens
}

/// Per-shard analyzer cache keyed by name.
#[derive(Default)]
pub struct AnalyzerRegistry {
    cached: RwHashMap<String, Arc<Analyzer>>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Result<Arc<Analyzer>> {
        if let Some(analyzer) = self.cached.get(name) {
            return Ok(analyzer.clone());
        }
        let analyzer = Arc::new(Analyzer::from_str(name)?);
        self.cached.insert(name.to_string(), analyzer.clone());
        Ok(analyzer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(analyzer: Analyzer, text: &str) -> Vec<String> {
        analyzer
            .analyze(text)
            .into_iter()
            .map(|t| t.term)
            .collect()
    }

    #[test]
    fn test_standard() {
        assert_eq!(
            terms(Analyzer::Standard, "Quick Brown-Fox, v2!"),
            vec!["quick", "brown", "fox", "v2"]
        );
    }

    #[test]
    fn test_simple_drops_digits() {
        assert_eq!(
            terms(Analyzer::Simple, "Quick2 Fox"),
            vec!["quick", "fox"]
        );
    }

    #[test]
    fn test_whitespace_keeps_case() {
        assert_eq!(
            terms(Analyzer::Whitespace, "Quick  Brown-Fox"),
            vec!["Quick", "Brown-Fox"]
        );
    }

    #[test]
    fn test_keyword() {
        assert_eq!(
            terms(Analyzer::Keyword, "Quick Brown Fox"),
            vec!["Quick Brown Fox"]
        );
        assert!(terms(Analyzer::Keyword, "").is_empty());
    }

    #[test]
    fn test_english_stop_words_and_stemming() {
        let out = terms(Analyzer::English, "The quick foxes are running");
        assert_eq!(out, vec!["quick", "foxe", "runn"]);
    }

    #[test]
    fn test_english_positions_skip_stop_words() {
        let tokens = Analyzer::English.analyze("the fox");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].position, 1);
    }

    #[test]
    fn test_chinese_unigrams() {
        let out = terms(Analyzer::Chinese, "你好rust");
        assert_eq!(out, vec!["你", "好", "rust"]);
    }

    #[test]
    fn test_positions_increase() {
        let tokens = Analyzer::Standard.analyze("a b c");
        let positions: Vec<u32> = tokens.iter().map(|t| t.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[test]
    fn test_registry_caches() {
        let registry = AnalyzerRegistry::new();
        let a = registry.get("standard").unwrap();
        let b = registry.get("standard").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("klingon").is_err());
    }
}
