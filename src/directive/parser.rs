use super::lexer::{self, Statement, Token};
use super::{ClusterExpr, FunctionDef, RemoteQuery, RoutingDirective, TargetMode};
use crate::core::{ProxyError, Result};

/// Compiles the routing directive embedded in a function body.
///
/// Pure: the same definition always yields the same plan.
pub fn compile(func: &FunctionDef) -> Result<RoutingDirective> {
    let statements = lexer::split_statements(&func.body)?;

    let mut cluster: Option<ClusterExpr> = None;
    let mut target: Option<TargetMode> = None;
    let mut select: Option<RemoteQuery> = None;
    let mut target_function: Option<String> = None;

    for statement in &statements {
        let keyword = statement.keyword();
        match keyword.as_str() {
            "CLUSTER" => {
                ensure_unset(cluster.is_some(), statement, "CLUSTER")?;
                cluster = Some(parse_cluster(func, statement)?);
            }
            "RUN" => {
                ensure_unset(target.is_some(), statement, "RUN ON")?;
                target = Some(parse_run_on(func, statement)?);
            }
            "SELECT" => {
                ensure_unset(select.is_some(), statement, "SELECT")?;
                select = Some(rewrite_query(func, &statement.text)?);
            }
            "TARGET" => {
                ensure_unset(target_function.is_some(), statement, "TARGET")?;
                target_function = Some(parse_target(statement)?);
            }
            "" => {
                return Err(syntax_error(
                    statement,
                    format!("unexpected text '{}'", statement.text),
                ));
            }
            other => {
                return Err(syntax_error(statement, format!("unknown clause '{}'", other)));
            }
        }
    }

    let cluster = cluster.ok_or_else(|| {
        ProxyError::DirectiveSyntax("CLUSTER statement is required".into())
    })?;
    let target = target.ok_or_else(|| {
        ProxyError::DirectiveSyntax("RUN ON statement is required".into())
    })?;
    if select.is_some() && target_function.is_some() {
        return Err(ProxyError::DirectiveSyntax(
            "TARGET cannot be combined with SELECT".into(),
        ));
    }

    let query = match select {
        Some(query) => query,
        None => default_query(func, target_function.as_deref()),
    };

    Ok(RoutingDirective {
        function_name: func.name.clone(),
        arg_types: func.args.iter().map(|a| a.data_type).collect(),
        arg_sql_types: func.args.iter().map(|a| a.sql_type.clone()).collect(),
        cluster,
        target,
        query,
        target_function,
        returns_set: func.returns_set,
        result_columns: func.result_columns,
    })
}

fn syntax_error(statement: &Statement, message: impl AsRef<str>) -> ProxyError {
    ProxyError::DirectiveSyntax(format!("line {}: {}", statement.line, message.as_ref()))
}

fn ensure_unset(already: bool, statement: &Statement, clause: &str) -> Result<()> {
    if already {
        return Err(syntax_error(
            statement,
            format!("{} may only be given once", clause),
        ));
    }
    Ok(())
}

/// Cursor over the tokens of one clause.
struct Tokens<'a> {
    statement: &'a Statement,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(statement: &'a Statement) -> Result<Self> {
        Ok(Self {
            statement,
            tokens: lexer::tokenize(statement)?,
            pos: 0,
        })
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        match self.next() {
            Some(token) if token.is_keyword(keyword) => Ok(()),
            Some(token) => Err(syntax_error(
                self.statement,
                format!("expected {}, found {}", keyword, token.describe()),
            )),
            None => Err(syntax_error(
                self.statement,
                format!("expected {}", keyword),
            )),
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(syntax_error(
                self.statement,
                format!("expected {}, found {}", expected.describe(), token.describe()),
            )),
            None => Err(syntax_error(
                self.statement,
                format!("expected {}", expected.describe()),
            )),
        }
    }

    fn require(&mut self, what: &str) -> Result<Token> {
        self.next()
            .ok_or_else(|| syntax_error(self.statement, format!("expected {}", what)))
    }

    fn finish(&mut self) -> Result<()> {
        match self.next() {
            None => Ok(()),
            Some(token) => Err(syntax_error(
                self.statement,
                format!("unexpected {}", token.describe()),
            )),
        }
    }
}

fn parse_cluster(func: &FunctionDef, statement: &Statement) -> Result<ClusterExpr> {
    let mut tokens = Tokens::new(statement)?;
    tokens.expect_keyword("CLUSTER")?;
    let expr = match tokens.require("cluster name")? {
        Token::Str(name) if !name.trim().is_empty() => ClusterExpr::Static(name),
        Token::Param(n) => ClusterExpr::Argument(param_index(func, statement, n)?),
        Token::Ident(ident) => match func.arg_position(&ident) {
            Some(index) => ClusterExpr::Argument(index),
            None => ClusterExpr::Static(ident),
        },
        other => {
            return Err(syntax_error(
                statement,
                format!("expected cluster name, found {}", other.describe()),
            ));
        }
    };
    tokens.finish()?;
    Ok(expr)
}

fn parse_run_on(func: &FunctionDef, statement: &Statement) -> Result<TargetMode> {
    let mut tokens = Tokens::new(statement)?;
    tokens.expect_keyword("RUN")?;
    tokens.expect_keyword("ON")?;

    let mode = match tokens.require("ALL, ANY or a routing argument")? {
        token if token.is_keyword("ALL") => TargetMode::All,
        token if token.is_keyword("ANY") => TargetMode::Any,
        Token::Param(n) => TargetMode::Hash(param_index(func, statement, n)?),
        Token::Number(n) => TargetMode::Hash(param_index(func, statement, n)?),
        Token::Ident(ident) => {
            if let Some(index) = func.arg_position(&ident) {
                TargetMode::Hash(index)
            } else if is_hash_function(&ident) {
                tokens.expect(Token::LParen)?;
                let index = match tokens.require("routing argument")? {
                    Token::Param(n) => param_index(func, statement, n)?,
                    Token::Ident(arg) => func.arg_position(&arg).ok_or_else(|| {
                        syntax_error(statement, format!("unknown argument '{}'", arg))
                    })?,
                    other => {
                        return Err(syntax_error(
                            statement,
                            format!("expected routing argument, found {}", other.describe()),
                        ));
                    }
                };
                tokens.expect(Token::RParen)?;
                TargetMode::Hash(index)
            } else {
                return Err(syntax_error(
                    statement,
                    format!("unknown argument or routing function '{}'", ident),
                ));
            }
        }
        other => {
            return Err(syntax_error(
                statement,
                format!("unexpected {} after RUN ON", other.describe()),
            ));
        }
    };
    tokens.finish()?;
    Ok(mode)
}

fn is_hash_function(ident: &str) -> bool {
    ident.eq_ignore_ascii_case("hash") || ident.eq_ignore_ascii_case("hashtext")
}

fn parse_target(statement: &Statement) -> Result<String> {
    let mut tokens = Tokens::new(statement)?;
    tokens.expect_keyword("TARGET")?;
    let name = match tokens.require("target function name")? {
        Token::Ident(name) => name,
        other => {
            return Err(syntax_error(
                statement,
                format!("expected function name, found {}", other.describe()),
            ));
        }
    };
    tokens.finish()?;
    Ok(name)
}

/// Converts a 1-based `$n` reference into a checked 0-based argument index.
fn param_index(func: &FunctionDef, statement: &Statement, n: u64) -> Result<usize> {
    let arity = func.arity();
    if n == 0 || n as usize > arity {
        return Err(syntax_error(
            statement,
            format!(
                "argument ${} is out of range, function has {} argument(s)",
                n, arity
            ),
        ));
    }
    Ok(n as usize - 1)
}

/// Renumbers `$n` references of an explicit SELECT densely in order of first
/// use, casting each to the declared argument type.
fn rewrite_query(func: &FunctionDef, sql: &str) -> Result<RemoteQuery> {
    let arity = func.arity();
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len() + 16);
    let mut params: Vec<usize> = Vec::new();
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                out.push(c);
                i += 1;
                while i < chars.len() {
                    out.push(chars[i]);
                    if chars[i] == c {
                        if chars.get(i + 1) == Some(&c) {
                            out.push(c);
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            '$' if lexer::dollar_quote_at(&chars, i).is_some() => {
                let len = lexer::dollar_quote_at(&chars, i).unwrap_or_default();
                let end = lexer::dollar_quote_end(&chars, i, len).ok_or_else(|| {
                    ProxyError::DirectiveSyntax("unterminated dollar-quoted text".into())
                })?;
                out.extend(&chars[i..end]);
                i = end;
            }
            '$' if chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()) => {
                let digits: String = chars[i + 1..]
                    .iter()
                    .take_while(|d| d.is_ascii_digit())
                    .collect();
                i += 1 + digits.len();

                let n: usize = digits.parse().unwrap_or(0);
                if n == 0 || n > arity {
                    return Err(ProxyError::DirectiveSyntax(format!(
                        "SELECT references ${} but function has {} argument(s)",
                        digits, arity
                    )));
                }
                let arg = n - 1;
                let slot = match params.iter().position(|p| *p == arg) {
                    Some(existing) => existing,
                    None => {
                        params.push(arg);
                        params.len() - 1
                    }
                };
                out.push_str(&format!("${}::{}", slot + 1, func.args[arg].sql_type));
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok(RemoteQuery { sql: out, params })
}

/// `SELECT * FROM target($1::type, ...)` passing every argument through.
fn default_query(func: &FunctionDef, target_function: Option<&str>) -> RemoteQuery {
    let name = target_function.unwrap_or(&func.name);
    let placeholders = func
        .args
        .iter()
        .enumerate()
        .map(|(idx, arg)| format!("${}::{}", idx + 1, arg.sql_type))
        .collect::<Vec<_>>()
        .join(", ");
    RemoteQuery {
        sql: format!("SELECT * FROM {}({})", name, placeholders),
        params: (0..func.arity()).collect(),
    }
}
