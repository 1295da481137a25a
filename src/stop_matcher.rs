//! Token index for linking free-text stop names to reference stops.
//!
//! Names are lowercased, split on everything that is not alphanumeric and
//! every token is replaced by the key of its synonym class, so that
//! `"nám. Míru"` and `"Náměstí Míru"` end up with the same tokens. Candidates
//! are retrieved from an inverted index and ranked by the share of their own
//! tokens that the query covers.

use std::collections::{HashMap, HashSet};

use ustr::{ustr, Ustr};

/// Abbreviations common in Czech stop names. The first entry is the class key.
const CZECH_SYNONYMS: &[&[&str]] = &[
    &["náměstí", "nám"],
    &["hlavní", "hl"],
    &["nádraží", "nádr", "n"],
    &["železniční", "žel"],
    &["stanice", "st"],
    &["zastávka", "zast"],
    &["nástupiště", "nást"],
    &["ulice", "ul"],
    &["sídliště", "sídl"],
    &["rozcestí", "rozc"],
    &["autobusové", "aut"],
    &["křižovatka", "křiž"],
    &["nemocnice", "nem"],
    &["svatý", "svatého", "svaté", "sv"],
    &["horní", "hor"],
    &["dolní", "dol"],
];

/// How many ranked candidates `best_match` looks at.
const BEST_MATCH_POOL: usize = 10;

#[derive(Debug, Clone)]
pub struct SynonymTable {
    class_key: HashMap<Ustr, Ustr>,
}

impl SynonymTable {
    /// Each inner list is one equivalence class; its first word becomes the class key.
    pub fn new<'a, C>(classes: impl IntoIterator<Item = C>) -> Self
    where
        C: IntoIterator<Item = &'a str>,
    {
        let mut class_key = HashMap::new();
        for class in classes {
            let mut members = class.into_iter().map(|word| ustr(&word.to_lowercase()));
            let Some(key) = members.next() else {
                continue;
            };
            class_key.insert(key, key);
            for member in members {
                class_key.insert(member, key);
            }
        }
        SynonymTable { class_key }
    }

    pub fn empty() -> Self {
        SynonymTable {
            class_key: HashMap::new(),
        }
    }

    pub fn class_of(&self, token: Ustr) -> Ustr {
        self.class_key.get(&token).copied().unwrap_or(token)
    }
}

impl Default for SynonymTable {
    fn default() -> Self {
        Self::new(CZECH_SYNONYMS.iter().map(|class| class.iter().copied()))
    }
}

pub fn tokenize(name: &str) -> Vec<Ustr> {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(ustr)
        .collect()
}

#[derive(Debug, Clone)]
pub struct Candidate<P> {
    pub name: String,
    pub payload: P,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopMatch<'a, P> {
    pub name: &'a str,
    pub payload: &'a P,
    /// Share of the candidate's tokens covered by the query, in `[0, 1]`.
    pub score: f64,
}

struct IndexedCandidate<P> {
    name: String,
    payload: P,
    tokens: Vec<Ustr>,
}

/// Immutable after `build`, so one matcher can serve any number of threads.
pub struct StopMatcher<P> {
    candidates: Vec<IndexedCandidate<P>>,
    postings: HashMap<Ustr, Vec<u32>>,
    synonyms: SynonymTable,
}

struct Hit {
    candidate: u32,
    query_tokens_hit: usize,
    relevance: f64,
}

impl<P> StopMatcher<P> {
    pub fn build(candidates: Vec<Candidate<P>>) -> Self {
        Self::build_with_synonyms(candidates, SynonymTable::default())
    }

    pub fn build_with_synonyms(candidates: Vec<Candidate<P>>, synonyms: SynonymTable) -> Self {
        let mut postings: HashMap<Ustr, Vec<u32>> = HashMap::new();
        let mut indexed = Vec::with_capacity(candidates.len());
        for (i, candidate) in candidates.into_iter().enumerate() {
            let tokens: Vec<Ustr> = tokenize(&candidate.name)
                .into_iter()
                .map(|token| synonyms.class_of(token))
                .collect();
            let distinct: HashSet<Ustr> = tokens.iter().copied().collect();
            for token in distinct {
                postings.entry(token).or_default().push(i as u32);
            }
            indexed.push(IndexedCandidate {
                name: candidate.name,
                payload: candidate.payload,
                tokens,
            });
        }
        log::debug!(
            "Indexed {} stop names under {} distinct tokens",
            indexed.len(),
            postings.len()
        );
        StopMatcher {
            candidates: indexed,
            postings,
            synonyms,
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Returns up to `top_n` candidates, best score first.
    ///
    /// Candidates containing every query token are preferred; only if there are
    /// none do candidates sharing some of the tokens qualify. They are ordered
    /// by the share of their own tokens the query covers, then by query tokens
    /// hit and by how rare those tokens are. No match is a normal outcome and
    /// yields an empty list.
    pub fn query(&self, name: &str, top_n: usize) -> Vec<StopMatch<'_, P>> {
        let query_tokens: HashSet<Ustr> = tokenize(name)
            .into_iter()
            .map(|token| self.synonyms.class_of(token))
            .collect();
        if query_tokens.is_empty() || top_n == 0 || self.candidates.is_empty() {
            return vec![];
        }

        let candidate_count = self.candidates.len() as f64;
        let mut hits: HashMap<u32, Hit> = HashMap::new();
        for token in &query_tokens {
            let Some(posting) = self.postings.get(token) else {
                continue;
            };
            let idf = (1.0 + candidate_count / posting.len() as f64).ln();
            for &candidate in posting {
                let hit = hits.entry(candidate).or_insert(Hit {
                    candidate,
                    query_tokens_hit: 0,
                    relevance: 0.0,
                });
                hit.query_tokens_hit += 1;
                hit.relevance += idf;
            }
        }

        let mut ranked: Vec<Hit> = hits.into_values().collect();
        if ranked
            .iter()
            .any(|hit| hit.query_tokens_hit == query_tokens.len())
        {
            ranked.retain(|hit| hit.query_tokens_hit == query_tokens.len());
        }

        // Scored before truncating, so a short exact name is never pushed out
        // by longer names sharing the same tokens.
        let mut scored: Vec<(f64, Hit)> = ranked
            .into_iter()
            .map(|hit| {
                let tokens = &self.candidates[hit.candidate as usize].tokens;
                let matched = tokens
                    .iter()
                    .filter(|token| query_tokens.contains(token))
                    .count();
                (matched as f64 / tokens.len() as f64, hit)
            })
            .collect();
        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .total_cmp(score_a)
                .then(b.query_tokens_hit.cmp(&a.query_tokens_hit))
                .then(b.relevance.total_cmp(&a.relevance))
                .then(a.candidate.cmp(&b.candidate))
        });
        scored.truncate(top_n);

        scored
            .into_iter()
            .map(|(score, hit)| {
                let candidate = &self.candidates[hit.candidate as usize];
                StopMatch {
                    name: &candidate.name,
                    payload: &candidate.payload,
                    score,
                }
            })
            .collect()
    }

    pub fn best_match(&self, name: &str, min_score: f64) -> Option<StopMatch<'_, P>> {
        self.query(name, BEST_MATCH_POOL)
            .into_iter()
            .next()
            .filter(|found| found.score >= min_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn matcher(names: &[&str]) -> StopMatcher<usize> {
        StopMatcher::build(
            names
                .iter()
                .enumerate()
                .map(|(i, name)| Candidate {
                    name: name.to_string(),
                    payload: i,
                })
                .collect(),
        )
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Praha hl.n., nást. 1"),
            vec![ustr("praha"), ustr("hl"), ustr("n"), ustr("nást"), ustr("1")]
        );
        assert!(tokenize(" .,- ").is_empty());
    }

    #[test]
    fn test_abbreviation_matches_full_word() {
        let matcher = matcher(&["Náměstí Míru", "Míru", "Náměstí Republiky"]);

        let results = matcher.query("nám. Míru", 5);

        assert_eq!(*results[0].payload, 0);
        assert_relative_eq!(results[0].score, 1.0);
    }

    #[test]
    fn test_identical_name_scores_one() {
        let names = ["Liberec, Fügnerova", "Praha hl.n.", "Brno, Hlavní nádraží"];
        let matcher = matcher(&names);
        for (i, name) in names.iter().enumerate() {
            let results = matcher.query(name, 3);
            let own = results.iter().find(|m| *m.payload == i).unwrap();
            assert_relative_eq!(own.score, 1.0);
        }
        let results = matcher.query("praha hlavní nádraží", 3);
        assert_eq!(*results[0].payload, 1);
        assert_relative_eq!(results[0].score, 1.0);
    }

    #[test]
    fn test_partial_match_and_score_bounds() {
        let matcher = matcher(&["Jablonec nad Nisou, aut. st.", "Jablonec nad Jizerou"]);

        let results = matcher.query("Jablonec nad Nisou", 10);

        assert_eq!(results.len(), 1);
        assert_eq!(*results[0].payload, 0);
        assert_relative_eq!(results[0].score, 3.0 / 5.0);
        for found in &results {
            assert!((0.0..=1.0).contains(&found.score));
        }
    }

    #[test]
    fn test_falls_back_to_partial_token_overlap() {
        let matcher = matcher(&["Turnov, Výšinka", "Turnov, žel. st."]);

        let results = matcher.query("Turnov, centrum", 10);

        assert_eq!(results.len(), 2);
        assert_relative_eq!(results[0].score, 0.5);
        assert_eq!(*results[0].payload, 0);
        assert_relative_eq!(results[1].score, 1.0 / 3.0);
    }

    #[test]
    fn test_top_n_limits_results() {
        let matcher = matcher(&["Most", "Most, nádraží", "Most, Velebudice"]);
        assert_eq!(matcher.query("Most", 2).len(), 2);
        assert!(matcher.query("Most", 0).is_empty());
    }

    #[test]
    fn test_exact_name_survives_many_longer_names() {
        let mut names: Vec<String> = (0..12).map(|i| format!("Most, zastávka {i}")).collect();
        names.push("Most".to_string());
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let matcher = matcher(&names);

        let results = matcher.query("Most", 3);
        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].payload, 12);
        assert_relative_eq!(results[0].score, 1.0);

        let found = matcher.best_match("Most", 0.8).unwrap();
        assert_eq!(*found.payload, 12);
    }

    #[test]
    fn test_no_candidates_or_no_match() {
        let empty: StopMatcher<()> = StopMatcher::build(vec![]);
        assert!(empty.query("Praha", 5).is_empty());

        let matcher = matcher(&["Praha"]);
        assert!(matcher.query("Ostrava", 5).is_empty());
        assert!(matcher.query("", 5).is_empty());
        assert!(matcher.best_match("Ostrava", 0.0).is_none());
    }

    #[test]
    fn test_best_match_respects_min_score() {
        let matcher = matcher(&["Kolín, Zengrova", "Kolín"]);
        let found = matcher.best_match("Kolín", 0.9).unwrap();
        assert_eq!(*found.payload, 1);
        assert!(matcher.best_match("Zengrova", 0.9).is_none());
        assert_relative_eq!(matcher.best_match("Zengrova", 0.5).unwrap().score, 0.5);
    }

    #[test]
    fn test_custom_synonyms() {
        let synonyms = SynonymTable::new([["street", "st"]]);
        let matcher = StopMatcher::build_with_synonyms(
            vec![Candidate {
                name: "Main Street".to_string(),
                payload: (),
            }],
            synonyms,
        );
        assert_relative_eq!(matcher.query("main st", 1)[0].score, 1.0);
        assert!(SynonymTable::empty().class_of(ustr("st")) == ustr("st"));
    }
}
