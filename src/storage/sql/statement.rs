use super::fragment::{depths, is_keyword, is_whitespace, space, tokenize, Piece, PlaceholderStyle};
use super::{Fragment, SqlError};
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Word};
use std::fmt;

/// Keywords that end the FROM / WHERE region of a SELECT.
const CLAUSE_TERMINATORS: &[Keyword] = &[
    Keyword::GROUP,
    Keyword::HAVING,
    Keyword::WINDOW,
    Keyword::ORDER,
    Keyword::LIMIT,
    Keyword::OFFSET,
    Keyword::FETCH,
    Keyword::UNION,
    Keyword::INTERSECT,
    Keyword::EXCEPT,
    Keyword::FOR,
];

#[derive(Debug, Clone, PartialEq)]
pub struct Alias {
    lead: Fragment,
    name: Word,
}

/// One select-list entry: an expression with an optional alias.
#[derive(Debug, Clone, PartialEq)]
pub struct Identifier {
    expr: Fragment,
    alias: Option<Alias>,
}

impl Identifier {
    fn from_tokens(tokens: Vec<Token>) -> Result<Self, SqlError> {
        if tokens.iter().all(is_whitespace) {
            return Err(SqlError::EmptySelectItem);
        }
        let depth = depths(&tokens);
        let last = tokens.len() - 1;

        let explicit = (0..tokens.len())
            .rev()
            .find(|&i| depth[i] == 0 && is_keyword(&tokens[i], Keyword::AS));
        if let Some(at) = explicit {
            let after: Vec<usize> = (at + 1..tokens.len())
                .filter(|&i| !is_whitespace(&tokens[i]))
                .collect();
            if let [name_at] = after.as_slice() {
                if let Token::Word(name) = &tokens[*name_at] {
                    let mut expr_tokens = tokens[..at].to_vec();
                    let keep = expr_tokens
                        .iter()
                        .rposition(|t| !is_whitespace(t))
                        .map(|i| i + 1)
                        .unwrap_or(0);
                    let mut lead = Fragment::from_tokens(expr_tokens.split_off(keep));
                    lead.append(&Fragment::from_tokens(tokens[at..*name_at].to_vec()));
                    return Ok(Self {
                        expr: Fragment::from_tokens(expr_tokens),
                        alias: Some(Alias {
                            lead,
                            name: name.clone(),
                        }),
                    });
                }
            }
        }

        // `expr name`, accepted only when `expr` itself has no top-level whitespace.
        if let Token::Word(name) = &tokens[last] {
            let ws_start = (0..last)
                .rev()
                .take_while(|&i| is_whitespace(&tokens[i]))
                .last();
            if let Some(ws_start) = ws_start {
                let expr_has_gap = (0..ws_start).any(|i| depth[i] == 0 && is_whitespace(&tokens[i]));
                if ws_start > 0 && !expr_has_gap {
                    return Ok(Self {
                        expr: Fragment::from_tokens(tokens[..ws_start].to_vec()),
                        alias: Some(Alias {
                            lead: Fragment::from_tokens(tokens[ws_start..last].to_vec()),
                            name: name.clone(),
                        }),
                    });
                }
            }
        }

        Ok(Self {
            expr: Fragment::from_tokens(tokens),
            alias: None,
        })
    }

    /// The expression without its alias.
    pub fn bare(&self) -> &Fragment {
        &self.expr
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_ref().map(|a| a.name.value.as_str())
    }

    /// Output name: the alias, or the last part of a plain column reference.
    pub fn name(&self) -> Option<&str> {
        if let Some(alias) = &self.alias {
            return Some(&alias.name.value);
        }
        self.column_word().map(|w| w.value.as_str())
    }

    fn column_word(&self) -> Option<&Word> {
        let mut last = None;
        for piece in self.expr.pieces() {
            match piece {
                Piece::Token(Token::Word(w)) => last = Some(w),
                Piece::Token(Token::Period) => {}
                _ => return None,
            }
        }
        last
    }

    /// Unquoted names compare case-insensitively, quoted names exactly.
    pub fn matches(&self, name: &str) -> bool {
        let word = match &self.alias {
            Some(alias) => Some(&alias.name),
            None => self.column_word(),
        };
        match word {
            Some(w) if w.quote_style.is_some() => w.value == name,
            Some(w) => w.value.eq_ignore_ascii_case(name),
            None => false,
        }
    }

    fn render(&self, style: PlaceholderStyle, counter: &mut usize, out: &mut String) {
        self.expr.render(style, counter, out);
        if let Some(alias) = &self.alias {
            alias.lead.render(style, counter, out);
            out.push_str(&alias.name.to_string());
        }
    }

    pub fn param_count(&self) -> usize {
        self.expr.param_count()
    }

    /// The same expression, output as `name`.
    pub fn with_alias(mut self, name: &str) -> Self {
        self.alias = Some(Alias {
            lead: as_lead(),
            name: Word {
                value: name.to_string(),
                quote_style: None,
                keyword: Keyword::NoKeyword,
            },
        });
        self
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.render(PlaceholderStyle::Percent, &mut 0, &mut out);
        f.write_str(&out)
    }
}

/// Anything that can be appended to a WHERE clause.
#[derive(Debug, Clone)]
pub enum Condition {
    Expr(Fragment),
    Sql(String),
}

impl From<Fragment> for Condition {
    fn from(f: Fragment) -> Self {
        Condition::Expr(f)
    }
}

impl From<Identifier> for Condition {
    fn from(ident: Identifier) -> Self {
        Condition::Expr(ident.expr)
    }
}

impl From<&str> for Condition {
    fn from(s: &str) -> Self {
        Condition::Sql(s.to_string())
    }
}

impl From<String> for Condition {
    fn from(s: String) -> Self {
        Condition::Sql(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct WhereClause {
    keyword: Fragment,
    predicates: Vec<Fragment>,
}

impl WhereClause {
    fn render(&self, style: PlaceholderStyle, counter: &mut usize, out: &mut String) {
        self.keyword.render(style, counter, out);
        let wrap = self.predicates.len() > 1;
        for (i, predicate) in self.predicates.iter().enumerate() {
            if i > 0 {
                out.push_str(" and ");
            }
            if wrap && predicate.has_top_level_keyword(Keyword::OR) {
                out.push('(');
                predicate.render(style, counter, out);
                out.push(')');
            } else {
                predicate.render(style, counter, out);
            }
        }
    }
}

/// A parsed SELECT split into the parts the augmentation engine rewrites.
///
/// Everything outside the select list and the WHERE predicates is kept as the
/// original token run, so the printed statement differs from the input only
/// where it was edited.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    head: Fragment,
    items: Vec<Identifier>,
    separators: Vec<Fragment>,
    from: Fragment,
    where_clause: Option<WhereClause>,
    tail: Fragment,
}

fn skip_whitespace(tokens: &[Token], mut i: usize) -> usize {
    while i < tokens.len() && is_whitespace(&tokens[i]) {
        i += 1;
    }
    i
}

fn split_whitespace(chunk: &[Token]) -> (Vec<Token>, Vec<Token>, Vec<Token>) {
    let start = chunk.iter().position(|t| !is_whitespace(t)).unwrap_or(chunk.len());
    let end = chunk
        .iter()
        .rposition(|t| !is_whitespace(t))
        .map(|i| i + 1)
        .unwrap_or(start)
        .max(start);
    (
        chunk[..start].to_vec(),
        chunk[start..end].to_vec(),
        chunk[end..].to_vec(),
    )
}

/// Drops one trailing `;` and rejects scripts with more than one statement.
fn single_statement(tokens: Vec<Token>) -> Result<Vec<Token>, SqlError> {
    let depth = depths(&tokens);
    let mut groups: Vec<&[Token]> = Vec::new();
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        if depth[i] == 0 && *token == Token::SemiColon {
            groups.push(&tokens[start..i]);
            start = i + 1;
        }
    }
    groups.push(&tokens[start..]);

    let statements = groups.iter().filter(|g| !g.iter().all(is_whitespace)).count();
    match statements {
        0 => Err(SqlError::Empty),
        1 => {
            let end = tokens
                .iter()
                .enumerate()
                .position(|(i, t)| depth[i] == 0 && *t == Token::SemiColon)
                .unwrap_or(tokens.len());
            Ok(tokens[..end].to_vec())
        }
        n => Err(SqlError::MultipleStatements(n)),
    }
}

impl SelectStatement {
    /// Parses exactly one SELECT statement (optionally led by a WITH clause).
    pub fn parse(sql: &str) -> Result<Self, SqlError> {
        let tokens = single_statement(tokenize(sql)?)?;
        let n = tokens.len();
        let depth = depths(&tokens);
        let top = |i: usize, kw: Keyword| depth[i] == 0 && is_keyword(&tokens[i], kw);
        let top_any = |i: usize, kws: &[Keyword]| kws.iter().any(|kw| top(i, *kw));

        let first = skip_whitespace(&tokens, 0);
        if first >= n || !(top(first, Keyword::SELECT) || top(first, Keyword::WITH)) {
            return Err(SqlError::NotASelect);
        }
        let select_at = (first..n)
            .find(|&i| top(i, Keyword::SELECT))
            .ok_or(SqlError::NotASelect)?;

        let mut j = skip_whitespace(&tokens, select_at + 1);
        if j < n && (top(j, Keyword::DISTINCT) || top(j, Keyword::ALL)) {
            let distinct = top(j, Keyword::DISTINCT);
            j = skip_whitespace(&tokens, j + 1);
            if distinct && j < n && top(j, Keyword::ON) {
                j = skip_whitespace(&tokens, j + 1);
                if j < n && tokens[j] == Token::LParen {
                    while j < n && !(depth[j] == 0 && tokens[j] == Token::RParen) {
                        j += 1;
                    }
                    j = skip_whitespace(&tokens, j + 1);
                }
            }
        }
        let head = Fragment::from_tokens(tokens[..j.min(n)].to_vec());

        let list_end = (j..n)
            .find(|&i| top(i, Keyword::FROM) || top(i, Keyword::WHERE) || top_any(i, CLAUSE_TERMINATORS))
            .unwrap_or(n);

        let mut items = Vec::new();
        let mut separators = Vec::new();
        let mut pending: Vec<Token> = Vec::new();
        let mut start = j;
        let commas = (j..list_end).filter(|&i| depth[i] == 0 && tokens[i] == Token::Comma);
        for boundary in commas.chain(std::iter::once(list_end)) {
            let (lead, core, trail) = split_whitespace(&tokens[start..boundary]);
            if !items.is_empty() {
                pending.extend(lead);
                separators.push(Fragment::from_tokens(std::mem::take(&mut pending)));
            }
            items.push(Identifier::from_tokens(core)?);
            pending = trail;
            if boundary < list_end {
                pending.push(Token::Comma);
            }
            start = boundary + 1;
        }

        let clause_end = (list_end..n)
            .find(|&i| top_any(i, CLAUSE_TERMINATORS))
            .unwrap_or(n);
        let where_at = (list_end..clause_end).find(|&i| top(i, Keyword::WHERE));

        let mut from = Fragment::from_tokens(pending);
        let (where_clause, tail) = match where_at {
            Some(w) => {
                from.append(&Fragment::from_tokens(tokens[list_end..w].to_vec()));
                let body_start = skip_whitespace(&tokens, w + 1).min(clause_end);
                let mut body = Fragment::from_tokens(tokens[body_start..clause_end].to_vec());
                let mut tail = body.split_trailing_whitespace();
                if body.is_blank() {
                    return Err(SqlError::EmptyCondition);
                }
                tail.append(&Fragment::from_tokens(tokens[clause_end..].to_vec()));
                let clause = WhereClause {
                    keyword: Fragment::from_tokens(tokens[w..body_start].to_vec()),
                    predicates: vec![body],
                };
                (Some(clause), tail)
            }
            None => {
                from.append(&Fragment::from_tokens(tokens[list_end..clause_end].to_vec()));
                let mut tail = from.split_trailing_whitespace();
                tail.append(&Fragment::from_tokens(tokens[clause_end..].to_vec()));
                (None, tail)
            }
        };

        Ok(Self {
            head,
            items,
            separators,
            from,
            where_clause,
            tail,
        })
    }

    pub fn identifiers(&self) -> &[Identifier] {
        &self.items
    }

    /// First select-list entry whose output name matches `name`.
    pub fn find_identifier(&self, name: &str) -> Result<&Identifier, SqlError> {
        self.items
            .iter()
            .find(|i| i.matches(name))
            .ok_or_else(|| SqlError::IdentifierNotFound(name.to_string()))
    }

    /// Swaps `original` for `replacement` in the select list.
    pub fn replace_identifier(
        &mut self,
        original: &Identifier,
        replacement: Identifier,
    ) -> Result<(), SqlError> {
        let slot = self
            .items
            .iter_mut()
            .find(|i| *i == original)
            .ok_or_else(|| SqlError::IdentifierNotFound(original.to_string()))?;
        *slot = replacement;
        Ok(())
    }

    /// ANDs a predicate onto the WHERE clause, creating the clause when absent.
    pub fn add_condition(&mut self, condition: impl Into<Condition>) -> Result<(), SqlError> {
        let fragment = match condition.into() {
            Condition::Expr(f) => f.trimmed(),
            Condition::Sql(s) => Fragment::parse(&s)?.trimmed(),
        };
        if fragment.is_blank() {
            return Err(SqlError::EmptyCondition);
        }

        match &mut self.where_clause {
            Some(clause) => clause.predicates.push(fragment),
            None => {
                let mut keyword = Fragment::default();
                keyword.push_token(space());
                keyword.push_token(Token::make_keyword("where"));
                keyword.push_token(space());
                self.where_clause = Some(WhereClause {
                    keyword,
                    predicates: vec![fragment],
                });
            }
        }
        Ok(())
    }

    pub fn param_count(&self) -> usize {
        let mut count = self.head.param_count() + self.from.param_count() + self.tail.param_count();
        count += self.items.iter().map(Identifier::param_count).sum::<usize>();
        if let Some(clause) = &self.where_clause {
            count += clause.predicates.iter().map(Fragment::param_count).sum::<usize>();
        }
        count
    }

    pub fn to_sql(&self, style: PlaceholderStyle) -> String {
        let mut out = String::new();
        let mut counter = 0;
        self.head.render(style, &mut counter, &mut out);
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                self.separators[i - 1].render(style, &mut counter, &mut out);
            }
            item.render(style, &mut counter, &mut out);
        }
        self.from.render(style, &mut counter, &mut out);
        if let Some(clause) = &self.where_clause {
            clause.render(style, &mut counter, &mut out);
        }
        self.tail.render(style, &mut counter, &mut out);
        out
    }
}

impl fmt::Display for SelectStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql(PlaceholderStyle::Percent))
    }
}

fn as_lead() -> Fragment {
    let mut lead = Fragment::default();
    lead.push_token(space());
    lead.push_token(Token::make_keyword("AS"));
    lead.push_token(space());
    lead
}

/// `name(bare(ident)[,%s]*)`, re-aliased to the original alias when `keep_alias`.
pub fn build_function_call(
    name: &str,
    ident: &Identifier,
    extra_params: usize,
    keep_alias: bool,
) -> Identifier {
    let mut args = vec![ident.bare().clone()];
    args.extend((0..extra_params).map(|_| Fragment::param()));
    let expr = Fragment::call(name, &args);

    let alias = match (&ident.alias, keep_alias) {
        (Some(alias), true) => Some(Alias {
            lead: as_lead(),
            name: alias.name.clone(),
        }),
        _ => None,
    };
    Identifier { expr, alias }
}

/// `bare(ident) {op} %s`
pub fn build_comparison(ident: &Identifier, operator: &str) -> Result<Fragment, SqlError> {
    let op = Fragment::parse(operator)?.trimmed();
    if op.is_blank() {
        return Err(SqlError::EmptyCondition);
    }
    let mut f = ident.bare().clone();
    f.push_token(space());
    f.append(&op);
    f.push_token(space());
    f.push_param();
    Ok(f)
}
