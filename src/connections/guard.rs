//! Read-only SQL guard.
//!
//! Statements are tokenized with `sqlparser` so keywords inside string
//! literals, quoted identifiers and comments never trigger a rejection, while
//! any bare mutating keyword anywhere in the statement does. The guard is a
//! first line of defense; handles are also opened read-only.

use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

use super::errors::ConnectionError;

/// Keywords that must not appear as bare words in a query.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "MERGE", "UPSERT",
    "GRANT", "REVOKE", "ATTACH", "DETACH", "VACUUM", "REINDEX", "COPY", "CALL", "EXEC",
    "EXECUTE", "PRAGMA",
];

/// Words a query may start with.
const ALLOWED_LEADING: &[&str] = &["SELECT", "WITH", "VALUES"];

/// Keywords that close a `FROM` list.
const FROM_LIST_END: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "FETCH", "UNION", "EXCEPT",
    "INTERSECT", "ON", "USING", "WINDOW",
];

fn keyword(token: &Token) -> Option<String> {
    match token {
        Token::Word(word) if word.quote_style.is_none() => Some(word.value.to_uppercase()),
        _ => None,
    }
}

fn reject(reason: impl Into<String>) -> ConnectionError {
    ConnectionError::UnsafeSqlRejected {
        reason: reason.into(),
    }
}

/// Check that `sql` is a single read-only query.
///
/// Returns the statement with any trailing semicolon removed, ready to run.
pub fn ensure_read_only(sql: &str) -> Result<String, ConnectionError> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| reject(format!("statement could not be tokenized: {e}")))?;

    let significant: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();

    let Some(first) = significant.first() else {
        return Err(reject("empty statement"));
    };

    // A trailing semicolon is tolerated; anything after one is a second statement.
    if let Some(pos) = significant.iter().position(|t| matches!(t, Token::SemiColon)) {
        if significant[pos + 1..]
            .iter()
            .any(|t| !matches!(t, Token::SemiColon))
        {
            return Err(reject("multiple statements are not allowed"));
        }
    }

    for token in &significant {
        if let Token::Word(word) = token {
            if word.quote_style.is_none() {
                let upper = word.value.to_uppercase();
                if FORBIDDEN_KEYWORDS.contains(&upper.as_str()) {
                    return Err(reject(format!("{upper} is not allowed in a read-only query")));
                }
            }
        }
    }

    let leads_with_query = match first {
        Token::Word(word) if word.quote_style.is_none() => {
            ALLOWED_LEADING.contains(&word.value.to_uppercase().as_str())
        }
        Token::LParen => true,
        _ => false,
    };
    if !leads_with_query {
        return Err(reject("only SELECT queries are allowed"));
    }

    Ok(sql.trim().trim_end_matches(';').trim_end().to_string())
}

/// Table names a query reads from, lowercased, in order of appearance.
///
/// Names come from `FROM` lists and `JOIN` clauses; schema-qualified names
/// keep their qualifier. CTE names are included like any other table.
pub fn referenced_tables(sql: &str) -> Vec<String> {
    let dialect = GenericDialect {};
    let Ok(tokens) = Tokenizer::new(&dialect, sql).tokenize() else {
        return Vec::new();
    };
    let significant: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();

    let mut names: Vec<String> = Vec::new();
    let mut in_from = false;
    let mut expect_name = false;
    let mut i = 0;
    while i < significant.len() {
        let upper = keyword(significant[i]);
        match (significant[i], upper.as_deref()) {
            (_, Some("FROM" | "JOIN")) => {
                in_from = true;
                expect_name = true;
            }
            (_, Some(kw)) if FROM_LIST_END.contains(&kw) => {
                in_from = false;
                expect_name = false;
            }
            (Token::Word(word), _) if expect_name => {
                let mut name = word.value.clone();
                while let (Some(Token::Period), Some(Token::Word(part))) =
                    (significant.get(i + 1), significant.get(i + 2))
                {
                    name.push('.');
                    name.push_str(&part.value);
                    i += 2;
                }
                let name = name.to_lowercase();
                if !names.contains(&name) {
                    names.push(name);
                }
                expect_name = false;
            }
            (Token::Comma, _) if in_from => expect_name = true,
            (Token::LParen, _) => expect_name = false,
            _ => {}
        }
        i += 1;
    }
    names
}

/// Pull the SQL statement out of a model reply.
///
/// Accepts a bare statement or one wrapped in a ```sql fenced block.
pub fn extract_sql(reply: &str) -> String {
    let trimmed = reply.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip the language tag line, if any.
        let body = match after.find('\n') {
            Some(nl) if !after[..nl].trim().contains(' ') => &after[nl + 1..],
            _ => after,
        };
        let body = match body.find("```") {
            Some(end) => &body[..end],
            None => body,
        };
        return body.trim().to_string();
    }
    trimmed.to_string()
}
