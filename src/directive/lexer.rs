use crate::core::{ProxyError, Result};

/// One `;`-terminated clause of a function body, comments removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub text: String,
    pub line: usize,
}

impl Statement {
    /// Leading keyword of the clause, uppercased.
    pub fn keyword(&self) -> String {
        self.text
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Ident(String),
    Str(String),
    Number(u64),
    Param(u64),
    LParen,
    RParen,
    Comma,
}

impl Token {
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Ident(ident) if ident.eq_ignore_ascii_case(keyword))
    }

    pub fn describe(&self) -> String {
        match self {
            Token::Ident(ident) => format!("'{}'", ident),
            Token::Str(s) => format!("string '{}'", s),
            Token::Number(n) => format!("number {}", n),
            Token::Param(n) => format!("${}", n),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Comma => "','".to_string(),
        }
    }
}

fn syntax_error(line: usize, message: impl AsRef<str>) -> ProxyError {
    ProxyError::DirectiveSyntax(format!("line {}: {}", line, message.as_ref()))
}

/// Length in chars of the dollar-quote delimiter (`$$` or `$tag$`) opening
/// at `i`, if one does.
///
/// A `$` continuing an identifier (`a$b`) or followed by a digit (`$1`)
/// does not open a quote.
pub(crate) fn dollar_quote_at(chars: &[char], i: usize) -> Option<usize> {
    if chars.get(i) != Some(&'$') {
        return None;
    }
    if i > 0 && (chars[i - 1].is_alphanumeric() || chars[i - 1] == '_') {
        return None;
    }
    let mut end = i + 1;
    while let Some(&c) = chars.get(end) {
        if c == '$' {
            return Some(end - i + 1);
        }
        let valid = if end == i + 1 {
            c.is_alphabetic() || c == '_'
        } else {
            c.is_alphanumeric() || c == '_'
        };
        if !valid {
            return None;
        }
        end += 1;
    }
    None
}

/// Index just past the delimiter closing the dollar quote whose opening
/// delimiter spans `start..start + len`.
pub(crate) fn dollar_quote_end(chars: &[char], start: usize, len: usize) -> Option<usize> {
    let delimiter = &chars[start..start + len];
    let mut i = start + len;
    while i + len <= chars.len() {
        if &chars[i..i + len] == delimiter {
            return Some(i + len);
        }
        i += 1;
    }
    None
}

/// Splits a function body into clauses.
///
/// Quoted strings, dollar-quoted strings and quoted identifiers are copied
/// verbatim (a `;` inside them does not terminate the clause). `--` and
/// `/* */` comments are dropped. A final clause without a terminating `;`
/// is accepted.
pub fn split_statements(body: &str) -> Result<Vec<Statement>> {
    let chars: Vec<char> = body.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut line = 1usize;
    let mut start_line = 1usize;
    let mut i = 0usize;

    let mut flush = |current: &mut String, start_line: usize| {
        let text = current.trim();
        if !text.is_empty() {
            statements.push(Statement {
                text: text.to_string(),
                line: start_line,
            });
        }
        current.clear();
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                current.push(c);
                i += 1;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let opened_at = line;
                i += 2;
                loop {
                    match chars.get(i) {
                        None => return Err(syntax_error(opened_at, "unterminated comment")),
                        Some('*') if chars.get(i + 1) == Some(&'/') => {
                            i += 2;
                            break;
                        }
                        Some('\n') => {
                            line += 1;
                            i += 1;
                        }
                        Some(_) => i += 1,
                    }
                }
                current.push(' ');
            }
            '\'' | '"' => {
                let opened_at = line;
                current.push(c);
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(syntax_error(opened_at, "unterminated quoted text"));
                        }
                        Some(&q) if q == c => {
                            current.push(q);
                            i += 1;
                            // doubled quote is an escaped quote
                            if chars.get(i) == Some(&c) {
                                current.push(c);
                                i += 1;
                            } else {
                                break;
                            }
                        }
                        Some(&other) => {
                            if other == '\n' {
                                line += 1;
                            }
                            current.push(other);
                            i += 1;
                        }
                    }
                }
            }
            '$' => {
                if current.trim().is_empty() {
                    start_line = line;
                }
                match dollar_quote_at(&chars, i) {
                    Some(len) => {
                        let end = dollar_quote_end(&chars, i, len).ok_or_else(|| {
                            syntax_error(line, "unterminated dollar-quoted text")
                        })?;
                        for &quoted in &chars[i..end] {
                            if quoted == '\n' {
                                line += 1;
                            }
                            current.push(quoted);
                        }
                        i = end;
                    }
                    None => {
                        current.push(c);
                        i += 1;
                    }
                }
            }
            ';' => {
                flush(&mut current, start_line);
                i += 1;
                start_line = line;
            }
            _ => {
                if current.trim().is_empty() {
                    start_line = line;
                }
                current.push(c);
                i += 1;
            }
        }
    }
    flush(&mut current, start_line);

    Ok(statements)
}

/// Tokenizes a non-query clause (`CLUSTER`, `RUN ON`, `TARGET`).
pub fn tokenize(statement: &Statement) -> Result<Vec<Token>> {
    let chars: Vec<char> = statement.text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                while i < chars.len() {
                    if chars[i] == '\'' {
                        if chars.get(i + 1) == Some(&'\'') {
                            value.push('\'');
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    value.push(chars[i]);
                    i += 1;
                }
                i += 1;
                tokens.push(Token::Str(value));
            }
            '"' => {
                let mut value = String::new();
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    value.push(chars[i]);
                    i += 1;
                }
                i += 1;
                tokens.push(Token::Ident(value));
            }
            '$' if dollar_quote_at(&chars, i).is_some() => {
                let len = dollar_quote_at(&chars, i).unwrap_or_default();
                let end = dollar_quote_end(&chars, i, len).ok_or_else(|| {
                    syntax_error(statement.line, "unterminated dollar-quoted text")
                })?;
                tokens.push(Token::Str(chars[i + len..end - len].iter().collect()));
                i = end;
            }
            '$' => {
                let digits: String = chars[i + 1..]
                    .iter()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                if digits.is_empty() {
                    return Err(syntax_error(statement.line, "expected argument number after '$'"));
                }
                i += 1 + digits.len();
                tokens.push(Token::Param(parse_number(&digits, statement.line)?));
            }
            c if c.is_ascii_digit() => {
                let digits: String = chars[i..]
                    .iter()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                i += digits.len();
                tokens.push(Token::Number(parse_number(&digits, statement.line)?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let ident: String = chars[i..]
                    .iter()
                    .take_while(|c| c.is_alphanumeric() || **c == '_' || **c == '.')
                    .collect();
                i += ident.chars().count();
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(syntax_error(
                    statement.line,
                    format!("unexpected character '{}'", other),
                ));
            }
        }
    }

    Ok(tokens)
}

fn parse_number(digits: &str, line: usize) -> Result<u64> {
    digits
        .parse::<u64>()
        .map_err(|_| syntax_error(line, format!("number '{}' is too large", digits)))
}
