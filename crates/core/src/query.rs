//! Boolean keyword query grammar.
//!
//! `field:term` atoms combined with `AND`, `OR`, `NOT` and parentheses;
//! adjacent atoms are an implicit `AND`. Values may be quoted phrases
//! (`data.to:"some exact value"`) or trailing-`*` prefixes. Precedence is
//! `NOT` over `AND` over `OR`.
//!
//! Only the parsed shape is consumed by the engines; evaluation against an
//! index lives next to the index implementation.

use serde::{Deserialize, Serialize};

use crate::error::{SearchError, SearchResult};

/// How a term value matches against indexed terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TermValue {
    /// Exact term equality.
    Exact(String),
    /// Quoted phrase, matched as one exact term (terms may contain spaces).
    Phrase(String),
    /// Trailing-`*` prefix match.
    Prefix(String),
}

/// One node of the boolean expression tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryNode {
    Term { field: String, value: TermValue },
    And(Vec<QueryNode>),
    Or(Vec<QueryNode>),
    Not(Box<QueryNode>),
}

/// A validated query, carrying its raw text for logging and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub raw: String,
    pub root: QueryNode,
}

impl ParsedQuery {
    pub fn parse(raw: &str) -> SearchResult<Self> {
        let tokens = tokenize(raw)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
        };
        let root = parser.parse_or()?;
        if parser.pos != tokens.len() {
            return Err(SearchError::invalid_argument(format!(
                "unexpected trailing input in query: {:?}",
                tokens[parser.pos]
            )));
        }
        Ok(Self {
            raw: raw.to_string(),
            root,
        })
    }

    /// Every field referenced by the query, deduplicated, in first-seen order.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_fields(&self.root, &mut out);
        out
    }
}

fn collect_fields<'a>(node: &'a QueryNode, out: &mut Vec<&'a str>) {
    match node {
        QueryNode::Term { field, .. } => {
            if !out.contains(&field.as_str()) {
                out.push(field);
            }
        }
        QueryNode::And(children) | QueryNode::Or(children) => {
            for child in children {
                collect_fields(child, out);
            }
        }
        QueryNode::Not(child) => collect_fields(child, out),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Atom { field: String, value: TermValue },
}

fn tokenize(raw: &str) -> SearchResult<Vec<Token>> {
    let mut out = Vec::new();
    let mut chars = raw.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                out.push(Token::LParen);
            }
            ')' => {
                chars.next();
                out.push(Token::RParen);
            }
            _ => {
                let word = read_bare(&mut chars, raw, start)?;
                match word.as_str() {
                    "AND" => out.push(Token::And),
                    "OR" => out.push(Token::Or),
                    "NOT" => out.push(Token::Not),
                    _ => out.push(parse_atom(&word, &mut chars, raw)?),
                }
            }
        }
    }
    if out.is_empty() {
        return Err(SearchError::invalid_argument("empty query"));
    }
    Ok(out)
}

/// Read up to (not including) whitespace, parens, or a colon.
fn read_bare(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    raw: &str,
    start: usize,
) -> SearchResult<String> {
    let mut end = start;
    while let Some(&(i, c)) = chars.peek() {
        if c.is_whitespace() || c == '(' || c == ')' || c == ':' {
            end = i;
            break;
        }
        chars.next();
        end = i + c.len_utf8();
    }
    if end == start {
        return Err(SearchError::invalid_argument(format!(
            "unexpected character at offset {start} in query"
        )));
    }
    Ok(raw[start..end].to_string())
}

/// After reading a bare word that is a field name, expect `:` then a value.
fn parse_atom(
    field: &str,
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    raw: &str,
) -> SearchResult<Token> {
    match chars.peek() {
        Some(&(_, ':')) => {
            chars.next();
        }
        _ => {
            return Err(SearchError::invalid_argument(format!(
                "expected `field:term`, got bare word {field:?}"
            )));
        }
    }

    let value = match chars.peek() {
        Some(&(start, '"')) => {
            chars.next();
            let mut end = None;
            for (i, c) in chars.by_ref() {
                if c == '"' {
                    end = Some(i);
                    break;
                }
            }
            let end = end.ok_or_else(|| {
                SearchError::invalid_argument("unterminated phrase in query")
            })?;
            TermValue::Phrase(raw[start + 1..end].to_string())
        }
        Some(&(start, _)) => {
            let word = read_bare(chars, raw, start)?;
            match word.strip_suffix('*') {
                Some(prefix) if !prefix.is_empty() => TermValue::Prefix(prefix.to_string()),
                Some(_) => {
                    return Err(SearchError::invalid_argument(format!(
                        "prefix match on field {field:?} needs at least one character"
                    )));
                }
                None => TermValue::Exact(word),
            }
        }
        None => {
            return Err(SearchError::invalid_argument(format!(
                "field {field:?} has no value"
            )));
        }
    };

    Ok(Token::Atom {
        field: field.to_string(),
        value,
    })
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> SearchResult<QueryNode> {
        let mut children = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            children.push(self.parse_and()?);
        }
        Ok(flatten(children, QueryNode::Or))
    }

    fn parse_and(&mut self) -> SearchResult<QueryNode> {
        let mut children = vec![self.parse_not()?];
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.pos += 1;
                    children.push(self.parse_not()?);
                }
                // adjacency is an implicit AND
                Some(Token::Atom { .. }) | Some(Token::Not) | Some(Token::LParen) => {
                    children.push(self.parse_not()?);
                }
                _ => break,
            }
        }
        Ok(flatten(children, QueryNode::And))
    }

    fn parse_not(&mut self) -> SearchResult<QueryNode> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(QueryNode::Not(Box::new(self.parse_not()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> SearchResult<QueryNode> {
        match self.peek().cloned() {
            Some(Token::Atom { field, value }) => {
                self.pos += 1;
                Ok(QueryNode::Term { field, value })
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(SearchError::invalid_argument(
                        "unbalanced parenthesis in query",
                    ));
                }
                self.pos += 1;
                Ok(inner)
            }
            other => Err(SearchError::invalid_argument(format!(
                "expected a term or `(`, got {other:?}"
            ))),
        }
    }
}

fn flatten(mut children: Vec<QueryNode>, combine: fn(Vec<QueryNode>) -> QueryNode) -> QueryNode {
    if children.len() == 1 {
        children.pop().unwrap()
    } else {
        combine(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(field: &str, value: &str) -> QueryNode {
        QueryNode::Term {
            field: field.into(),
            value: TermValue::Exact(value.into()),
        }
    }

    #[test]
    fn single_atom() {
        let q = ParsedQuery::parse("account:alice").unwrap();
        assert_eq!(q.root, term("account", "alice"));
    }

    #[test]
    fn implicit_and() {
        let q = ParsedQuery::parse("account:alice action:transfer").unwrap();
        assert_eq!(
            q.root,
            QueryNode::And(vec![term("account", "alice"), term("action", "transfer")])
        );
    }

    #[test]
    fn precedence_not_and_or() {
        let q = ParsedQuery::parse("a:1 AND NOT b:2 OR c:3").unwrap();
        assert_eq!(
            q.root,
            QueryNode::Or(vec![
                QueryNode::And(vec![
                    term("a", "1"),
                    QueryNode::Not(Box::new(term("b", "2")))
                ]),
                term("c", "3"),
            ])
        );
    }

    #[test]
    fn parens_override_precedence() {
        let q = ParsedQuery::parse("a:1 AND (b:2 OR c:3)").unwrap();
        assert_eq!(
            q.root,
            QueryNode::And(vec![
                term("a", "1"),
                QueryNode::Or(vec![term("b", "2"), term("c", "3")]),
            ])
        );
    }

    #[test]
    fn phrase_and_prefix_values() {
        let q = ParsedQuery::parse(r#"data.memo:"pay day" receiver:eosio*"#).unwrap();
        assert_eq!(
            q.root,
            QueryNode::And(vec![
                QueryNode::Term {
                    field: "data.memo".into(),
                    value: TermValue::Phrase("pay day".into()),
                },
                QueryNode::Term {
                    field: "receiver".into(),
                    value: TermValue::Prefix("eosio".into()),
                },
            ])
        );
    }

    #[test]
    fn fields_are_deduplicated_in_order() {
        let q = ParsedQuery::parse("b:1 a:2 b:3").unwrap();
        assert_eq!(q.fields(), vec!["b", "a"]);
    }

    #[test]
    fn malformed_queries_are_rejected() {
        for bad in [
            "",
            "   ",
            "bareword",
            "field:",
            "a:1 AND",
            "(a:1",
            "a:1)",
            r#"memo:"unterminated"#,
            "field:*",
        ] {
            assert!(
                matches!(
                    ParsedQuery::parse(bad),
                    Err(SearchError::InvalidArgument(_))
                ),
                "expected parse failure for {bad:?}"
            );
        }
    }
}
