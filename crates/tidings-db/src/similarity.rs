//! Trigram similarity for user search.
//!
//! Registered on every connection as `strict_word_similarity(query, text)`.
//! Words are maximal runs of alphanumerics, lowercased and padded with two
//! leading blanks and one trailing blank before being cut into trigrams. The
//! score is the best Jaccard overlap between the query trigrams and the
//! trigrams of any contiguous run of whole words in `text`, so a query never
//! gets credit for matching half a word.

use std::collections::HashSet;

use rusqlite::Connection;
use rusqlite::functions::FunctionFlags;

/// Minimum score for a search hit.
pub const SEARCH_THRESHOLD: f64 = 0.5;

type Trigram = [char; 3];

pub fn register(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "strict_word_similarity",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let query: String = ctx.get(0)?;
            let text: String = ctx.get(1)?;
            Ok(strict_word_similarity(&query, &text))
        },
    )
}

pub fn strict_word_similarity(query: &str, text: &str) -> f64 {
    let mut wanted = HashSet::new();
    for word in words(query) {
        word_trigrams(&word, &mut wanted);
    }
    if wanted.is_empty() {
        return 0.0;
    }

    let words = words(text);
    let mut best = 0.0_f64;
    for start in 0..words.len() {
        let mut extent = HashSet::new();
        for word in &words[start..] {
            word_trigrams(word, &mut extent);
            let shared = wanted.intersection(&extent).count();
            let union = wanted.len() + extent.len() - shared;
            best = best.max(shared as f64 / union as f64);
        }
    }
    best
}

fn words(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn word_trigrams(word: &str, out: &mut HashSet<Trigram>) {
    let padded: Vec<char> = "  ".chars().chain(word.chars()).chain([' ']).collect();
    for w in padded.windows(3) {
        out.insert([w[0], w[1], w[2]]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_word_scores_one() {
        assert_eq!(strict_word_similarity("alice", "Alice Smith"), 1.0);
        assert_eq!(strict_word_similarity("Smith", "alice smith"), 1.0);
    }

    #[test]
    fn prefix_clears_threshold() {
        // "alic" shares 4 of 7 distinct trigrams with "alice".
        let score = strict_word_similarity("alic", "alice");
        assert!((score - 4.0 / 7.0).abs() < 1e-9);
        assert!(score >= SEARCH_THRESHOLD);
    }

    #[test]
    fn unrelated_text_scores_zero() {
        assert_eq!(strict_word_similarity("bob", "alice smith"), 0.0);
        assert_eq!(strict_word_similarity("", "alice"), 0.0);
        assert_eq!(strict_word_similarity("alice", ""), 0.0);
    }

    #[test]
    fn emails_split_on_punctuation() {
        assert_eq!(
            strict_word_similarity("alice@example.com", "Alice@Example.com"),
            1.0
        );
        assert!(strict_word_similarity("example", "alice@example.com") >= SEARCH_THRESHOLD);
    }

    #[test]
    fn usable_from_sql() {
        let conn = Connection::open_in_memory().unwrap();
        register(&conn).unwrap();
        let score: f64 = conn
            .query_row("SELECT strict_word_similarity('alice', 'Alice Smith')", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(score, 1.0);
    }
}
