//! Token fragments with positional parameters.

use super::SqlError;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};
use std::fmt;

/// How bound-parameter slots are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `%s` for every slot.
    Percent,
    /// `$1`, `$2`, ... in textual order (PostgreSQL wire protocol).
    Numbered,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Piece {
    Token(Token),
    Param,
}

/// An ordered run of SQL tokens and parameter slots.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fragment {
    pieces: Vec<Piece>,
}

pub(crate) fn tokenize(sql: &str) -> Result<Vec<Token>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| SqlError::Tokenize(e.to_string()))?;

    let mut out = Vec::with_capacity(tokens.len());
    for token in tokens {
        match token {
            Token::EOF => {}
            Token::Placeholder(p) => return Err(SqlError::EmbeddedPlaceholder(p)),
            other => out.push(other),
        }
    }
    Ok(out)
}

pub(crate) fn is_whitespace(token: &Token) -> bool {
    matches!(token, Token::Whitespace(_))
}

pub(crate) fn is_keyword(token: &Token, keyword: Keyword) -> bool {
    matches!(token, Token::Word(w) if w.quote_style.is_none() && w.keyword == keyword)
}

/// Parenthesis depth of every token; a parenthesis carries the depth of its enclosing scope.
pub(crate) fn depths(tokens: &[Token]) -> Vec<usize> {
    let mut depth = 0usize;
    tokens
        .iter()
        .map(|t| match t {
            Token::LParen | Token::LBracket => {
                let current = depth;
                depth += 1;
                current
            }
            Token::RParen | Token::RBracket => {
                depth = depth.saturating_sub(1);
                depth
            }
            _ => depth,
        })
        .collect()
}

impl Fragment {
    /// Tokenizes a free-standing SQL fragment such as `area > 1000000`.
    pub fn parse(sql: &str) -> Result<Self, SqlError> {
        Ok(Self::from_tokens(tokenize(sql)?))
    }

    pub fn from_tokens(tokens: Vec<Token>) -> Self {
        Self {
            pieces: tokens.into_iter().map(Piece::Token).collect(),
        }
    }

    pub fn param() -> Self {
        Self {
            pieces: vec![Piece::Param],
        }
    }

    /// `name(arg,arg,...)`
    pub fn call(name: &str, args: &[Fragment]) -> Self {
        let mut f = Self::default();
        f.push_token(Token::make_word(name, None));
        f.push_token(Token::LParen);
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                f.push_token(Token::Comma);
            }
            f.append(arg);
        }
        f.push_token(Token::RParen);
        f
    }

    pub fn push_token(&mut self, token: Token) {
        self.pieces.push(Piece::Token(token));
    }

    pub fn push_param(&mut self) {
        self.pieces.push(Piece::Param);
    }

    pub fn append(&mut self, other: &Fragment) {
        self.pieces.extend(other.pieces.iter().cloned());
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn param_count(&self) -> usize {
        self.pieces.iter().filter(|p| matches!(p, Piece::Param)).count()
    }

    pub fn is_blank(&self) -> bool {
        self.pieces
            .iter()
            .all(|p| matches!(p, Piece::Token(t) if is_whitespace(t)))
    }

    /// Copy without leading and trailing whitespace.
    pub fn trimmed(&self) -> Fragment {
        let is_ws = |p: &Piece| matches!(p, Piece::Token(t) if is_whitespace(t));
        let start = self.pieces.iter().position(|p| !is_ws(p));
        let end = self.pieces.iter().rposition(|p| !is_ws(p));
        match (start, end) {
            (Some(s), Some(e)) => Fragment {
                pieces: self.pieces[s..=e].to_vec(),
            },
            _ => Fragment::default(),
        }
    }

    /// Removes trailing whitespace and returns it as its own fragment.
    pub(crate) fn split_trailing_whitespace(&mut self) -> Fragment {
        let keep = self
            .pieces
            .iter()
            .rposition(|p| !matches!(p, Piece::Token(t) if is_whitespace(t)))
            .map(|i| i + 1)
            .unwrap_or(0);
        Fragment {
            pieces: self.pieces.split_off(keep),
        }
    }

    /// True when `keyword` occurs outside any parenthesis.
    pub fn has_top_level_keyword(&self, keyword: Keyword) -> bool {
        let mut depth = 0usize;
        for piece in &self.pieces {
            if let Piece::Token(t) = piece {
                match t {
                    Token::LParen | Token::LBracket => depth += 1,
                    Token::RParen | Token::RBracket => depth = depth.saturating_sub(1),
                    _ if depth == 0 && is_keyword(t, keyword) => return true,
                    _ => {}
                }
            }
        }
        false
    }

    pub(crate) fn render(&self, style: PlaceholderStyle, counter: &mut usize, out: &mut String) {
        for piece in &self.pieces {
            match piece {
                Piece::Token(t) => out.push_str(&t.to_string()),
                Piece::Param => {
                    *counter += 1;
                    match style {
                        PlaceholderStyle::Percent => out.push_str("%s"),
                        PlaceholderStyle::Numbered => {
                            out.push('$');
                            out.push_str(&counter.to_string());
                        }
                    }
                }
            }
        }
    }

    pub fn to_sql(&self, style: PlaceholderStyle) -> String {
        let mut out = String::new();
        let mut counter = 0;
        self.render(style, &mut counter, &mut out);
        out
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql(PlaceholderStyle::Percent))
    }
}

pub(crate) fn space() -> Token {
    Token::Whitespace(Whitespace::Space)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_renders_without_spaces() {
        let f = Fragment::call(
            "ST_Transform",
            &[Fragment::parse("geom").unwrap(), Fragment::param()],
        );
        assert_eq!(f.to_string(), "ST_Transform(geom,%s)");
        assert_eq!(f.param_count(), 1);
    }

    #[test]
    fn numbered_placeholders_count_in_text_order() {
        let mut f = Fragment::parse("a = ").unwrap();
        f.push_param();
        f.append(&Fragment::parse(" and b = ").unwrap());
        f.push_param();
        assert_eq!(f.to_sql(PlaceholderStyle::Numbered), "a = $1 and b = $2");
    }

    #[test]
    fn top_level_or_ignores_parenthesised_or() {
        assert!(Fragment::parse("a = 1 or b = 2")
            .unwrap()
            .has_top_level_keyword(Keyword::OR));
        assert!(!Fragment::parse("(a = 1 or b = 2) and c")
            .unwrap()
            .has_top_level_keyword(Keyword::OR));
    }

    #[test]
    fn embedded_placeholders_are_rejected() {
        assert!(matches!(
            Fragment::parse("id = $1"),
            Err(SqlError::EmbeddedPlaceholder(_))
        ));
    }
}
