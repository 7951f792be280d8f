//! Lightweight SQL inspection done before a statement reaches the engine.
//!
//! Counts bind parameters the way SQLite numbers them and finds the leading
//! keyword, skipping string literals, quoted identifiers and comments.

use std::collections::HashMap;

/// Coarse classification by leading keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Begin,
    Commit,
    Rollback,
    Savepoint,
    Release,
    Insert,
    Update,
    Delete,
    Other,
}

impl StatementKind {
    pub fn is_transaction_control(self) -> bool {
        matches!(
            self,
            StatementKind::Begin
                | StatementKind::Commit
                | StatementKind::Rollback
                | StatementKind::Savepoint
                | StatementKind::Release
        )
    }

    /// Statements whose row changes the engine counts.
    pub fn is_dml(self) -> bool {
        matches!(
            self,
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete
        )
    }

    /// Statements that would open a nested transaction scope.
    pub fn opens_transaction(self) -> bool {
        matches!(self, StatementKind::Begin | StatementKind::Savepoint)
    }
}

/// Number of parameters SQLite will expect for `sql`.
///
/// This mirrors `sqlite3_bind_parameter_count`: the largest parameter index,
/// where `?` takes the next index, `?NNN` sets it explicitly, and a named
/// parameter (`:a`, `@a`, `$a`) takes the next index on first use.
pub fn placeholder_count(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut named: HashMap<&str, usize> = HashMap::new();
    let mut max_index = 0usize;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => i = skip_quoted(bytes, i, quote),
            b'[' => i = skip_until(bytes, i + 1, b"]"),
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_until(bytes, i + 2, b"\n"),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_until(bytes, i + 2, b"*/"),
            b'?' => {
                let start = i + 1;
                let end = scan_while(bytes, start, |b| b.is_ascii_digit());
                if end > start {
                    let index = sql[start..end].parse::<usize>().unwrap_or(0);
                    max_index = max_index.max(index);
                } else {
                    max_index += 1;
                }
                i = end;
            }
            // `$` is also legal inside identifiers, e.g. `a$b`.
            b':' | b'@' | b'$' if i > 0 && is_ident_byte(bytes[i - 1]) => i += 1,
            b':' | b'@' | b'$' => {
                let start = i + 1;
                let end = scan_while(bytes, start, |b| b.is_ascii_alphanumeric() || b == b'_');
                if end > start {
                    let name = &sql[i..end];
                    if !named.contains_key(name) {
                        max_index += 1;
                        named.insert(name, max_index);
                    }
                }
                i = end.max(i + 1);
            }
            _ => i += 1,
        }
    }
    max_index
}

/// Classify `sql` by its first keyword, looking past a leading `WITH`
/// clause to the statement it qualifies.
pub fn statement_kind(sql: &str) -> StatementKind {
    let (start, keyword) = leading_keyword(sql);
    let keyword = if keyword.eq_ignore_ascii_case("WITH") {
        main_keyword(sql, start + keyword.len())
    } else {
        keyword
    };
    match keyword.to_ascii_uppercase().as_str() {
        "BEGIN" => StatementKind::Begin,
        "COMMIT" | "END" => StatementKind::Commit,
        "ROLLBACK" => StatementKind::Rollback,
        "SAVEPOINT" => StatementKind::Savepoint,
        "RELEASE" => StatementKind::Release,
        "INSERT" | "REPLACE" => StatementKind::Insert,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        _ => StatementKind::Other,
    }
}

/// First statement keyword outside parentheses after the CTE list that
/// starts at `i`.
fn main_keyword(sql: &str, mut i: usize) -> &str {
    let bytes = sql.as_bytes();
    let mut depth = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => i = skip_quoted(bytes, i, quote),
            b'[' => i = skip_until(bytes, i + 1, b"]"),
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_until(bytes, i + 2, b"\n"),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_until(bytes, i + 2, b"*/"),
            b'(' => {
                depth += 1;
                i += 1;
            }
            b')' => {
                depth = depth.saturating_sub(1);
                i += 1;
            }
            b if b.is_ascii_alphabetic() || b == b'_' => {
                let end = scan_while(bytes, i, is_ident_byte);
                let word = &sql[i..end];
                if depth == 0
                    && ["SELECT", "VALUES", "INSERT", "REPLACE", "UPDATE", "DELETE"]
                        .iter()
                        .any(|k| word.eq_ignore_ascii_case(k))
                {
                    return word;
                }
                i = end;
            }
            _ => i += 1,
        }
    }
    ""
}

fn leading_keyword(sql: &str) -> (usize, &str) {
    let bytes = sql.as_bytes();
    let mut i = 0;
    loop {
        while i < bytes.len() && (bytes[i].is_ascii_whitespace() || bytes[i] == b';') {
            i += 1;
        }
        if bytes[i..].starts_with(b"--") {
            i = skip_until(bytes, i + 2, b"\n");
        } else if bytes[i..].starts_with(b"/*") {
            i = skip_until(bytes, i + 2, b"*/");
        } else {
            break;
        }
    }
    let end = scan_while(bytes, i, |b| b.is_ascii_alphabetic());
    (i, &sql[i..end])
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

fn scan_while(bytes: &[u8], mut i: usize, pred: impl Fn(u8) -> bool) -> usize {
    while i < bytes.len() && pred(bytes[i]) {
        i += 1;
    }
    i
}

// A doubled quote inside a quoted run is an escaped quote.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_until(bytes: &[u8], start: usize, terminator: &[u8]) -> usize {
    let mut i = start;
    while i < bytes.len() {
        if bytes[i..].starts_with(terminator) {
            return i + terminator.len();
        }
        i += 1;
    }
    bytes.len()
}
