//! One block's inverted index.

use std::collections::{BTreeMap, HashMap};

use chainsift_core::query::{QueryNode, TermValue};
use chainsift_core::{Document, ParsedQuery, SearchMatch};

/// Position-independent document identity within a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocEntry {
    pub trx_id_prefix: String,
    pub trx_index: u32,
}

/// Immutable inverted index over the documents of exactly one block.
///
/// Postings map `field → term → sorted positions` into the document list,
/// which is kept in `(trx_index asc)` order so evaluation output is already
/// in block order.
#[derive(Debug, Clone)]
pub struct SingleIndex {
    block_num: u64,
    block_id: String,
    previous_id: String,
    lib_num: u64,
    docs: Vec<DocEntry>,
    postings: HashMap<String, BTreeMap<String, Vec<u32>>>,
}

impl SingleIndex {
    pub fn build(
        block_num: u64,
        block_id: impl Into<String>,
        previous_id: impl Into<String>,
        lib_num: u64,
        mut documents: Vec<Document>,
    ) -> Self {
        documents.sort_by_key(|d| d.trx_index);

        let mut docs = Vec::with_capacity(documents.len());
        let mut postings: HashMap<String, BTreeMap<String, Vec<u32>>> = HashMap::new();

        for (pos, doc) in documents.into_iter().enumerate() {
            let pos = pos as u32;
            for (field, term) in &doc.terms {
                let terms = postings.entry(field.clone()).or_default();
                let positions = terms.entry(term.clone()).or_default();
                if positions.last() != Some(&pos) {
                    positions.push(pos);
                }
            }
            docs.push(DocEntry {
                trx_id_prefix: doc.trx_id_prefix,
                trx_index: doc.trx_index,
            });
        }

        Self {
            block_num,
            block_id: block_id.into(),
            previous_id: previous_id.into(),
            lib_num,
            docs,
            postings,
        }
    }

    pub fn block_num(&self) -> u64 {
        self.block_num
    }

    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    pub fn previous_id(&self) -> &str {
        &self.previous_id
    }

    pub fn lib_num(&self) -> u64 {
        self.lib_num
    }

    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    pub fn docs(&self) -> &[DocEntry] {
        &self.docs
    }

    /// Every `(field, term, positions)` triple, for serialization.
    pub fn postings(&self) -> impl Iterator<Item = (&str, &str, &[u32])> {
        self.postings.iter().flat_map(|(field, terms)| {
            terms
                .iter()
                .map(move |(term, positions)| (field.as_str(), term.as_str(), positions.as_slice()))
        })
    }

    /// Run a boolean query, producing matches in `trx_index` order.
    pub fn run_query(&self, query: &ParsedQuery) -> Vec<SearchMatch> {
        self.eval(&query.root)
            .into_iter()
            .map(|pos| {
                let doc = &self.docs[pos as usize];
                SearchMatch {
                    block_num: self.block_num,
                    block_id: self.block_id.clone(),
                    trx_id_prefix: doc.trx_id_prefix.clone(),
                    trx_index: doc.trx_index,
                    undo: false,
                    irr_block_num: self.lib_num,
                }
            })
            .collect()
    }

    /// Evaluate to a sorted set of document positions.
    fn eval(&self, node: &QueryNode) -> Vec<u32> {
        match node {
            QueryNode::Term { field, value } => self.eval_term(field, value),
            QueryNode::And(children) => {
                let mut iter = children.iter().map(|c| self.eval(c));
                let Some(first) = iter.next() else {
                    return Vec::new();
                };
                iter.fold(first, |acc, next| intersect(&acc, &next))
            }
            QueryNode::Or(children) => {
                children.iter().fold(Vec::new(), |acc, child| {
                    union(&acc, &self.eval(child))
                })
            }
            QueryNode::Not(child) => {
                let inner = self.eval(child);
                (0..self.docs.len() as u32)
                    .filter(|pos| inner.binary_search(pos).is_err())
                    .collect()
            }
        }
    }

    fn eval_term(&self, field: &str, value: &TermValue) -> Vec<u32> {
        let Some(terms) = self.postings.get(field) else {
            return Vec::new();
        };
        match value {
            TermValue::Exact(term) | TermValue::Phrase(term) => {
                terms.get(term).cloned().unwrap_or_default()
            }
            TermValue::Prefix(prefix) => {
                let mut out = Vec::new();
                for (term, positions) in terms.range(prefix.clone()..) {
                    if !term.starts_with(prefix.as_str()) {
                        break;
                    }
                    out = union(&out, positions);
                }
                out
            }
        }
    }
}

fn intersect(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn union(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsift_core::ParsedQuery;

    fn doc(prefix: &str, index: u32, terms: &[(&str, &str)]) -> Document {
        let mut d = Document::new(prefix, index);
        for (f, t) in terms {
            d = d.with_term(*f, *t);
        }
        d
    }

    fn index() -> SingleIndex {
        SingleIndex::build(
            100,
            "aabb",
            "0099",
            99,
            vec![
                doc("1111111111111111", 0, &[("account", "alice"), ("action", "transfer")]),
                doc("2222222222222222", 1, &[("account", "bob"), ("action", "transfer")]),
                doc("3333333333333333", 2, &[("account", "alice"), ("action", "vote")]),
                doc("4444444444444444", 3, &[("data.memo", "pay day")]),
            ],
        )
    }

    fn run(q: &str) -> Vec<u32> {
        index()
            .run_query(&ParsedQuery::parse(q).unwrap())
            .iter()
            .map(|m| m.trx_index)
            .collect()
    }

    #[test]
    fn exact_term() {
        assert_eq!(run("account:alice"), vec![0, 2]);
        assert_eq!(run("account:carol"), Vec::<u32>::new());
    }

    #[test]
    fn and_or_not() {
        assert_eq!(run("account:alice AND action:transfer"), vec![0]);
        assert_eq!(run("account:bob OR action:vote"), vec![1, 2]);
        assert_eq!(run("action:transfer AND NOT account:alice"), vec![1]);
        assert_eq!(run("NOT action:transfer"), vec![2, 3]);
    }

    #[test]
    fn prefix_and_phrase() {
        assert_eq!(run("account:ali*"), vec![0, 2]);
        assert_eq!(run("account:a*"), vec![0, 2]);
        assert_eq!(run(r#"data.memo:"pay day""#), vec![3]);
        assert_eq!(run("data.memo:pay"), Vec::<u32>::new());
    }

    #[test]
    fn matches_carry_block_metadata() {
        let matches = index()
            .run_query(&ParsedQuery::parse("account:bob").unwrap());
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.block_num, 100);
        assert_eq!(m.block_id, "aabb");
        assert_eq!(m.trx_id_prefix, "2222222222222222");
        assert_eq!(m.irr_block_num, 99);
        assert!(!m.undo);
    }

    #[test]
    fn unsorted_documents_are_reordered() {
        let idx = SingleIndex::build(
            5,
            "cc",
            "bb",
            4,
            vec![
                doc("bbbbbbbbbbbbbbbb", 7, &[("a", "x")]),
                doc("aaaaaaaaaaaaaaaa", 2, &[("a", "x")]),
            ],
        );
        let matches = idx.run_query(&ParsedQuery::parse("a:x").unwrap());
        let indexes: Vec<u32> = matches.iter().map(|m| m.trx_index).collect();
        assert_eq!(indexes, vec![2, 7]);
    }
}
