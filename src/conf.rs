//! Parsing and representation of the `redis.conf` dialect.
//!
//! A config file is an ordered sequence of directives, one per line. Blank
//! lines and `#` comments are skipped. Arguments are whitespace-separated and
//! may be quoted with `'` or `"`; there are no escape sequences beyond the
//! quote characters themselves.

use std::path::Path;

use crate::error::ConfError;
use crate::server::RedisServer;

const KEYWORD_PORT: &str = "port";
const KEYWORD_BIND: &str = "bind";

/// A single `keyword argument...` line of a Redis config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    keyword: String,
    arguments: Vec<String>,
}

impl Directive {
    pub fn new(
        keyword: impl Into<String>,
        arguments: Vec<String>,
    ) -> Result<Self, ConfError> {
        let keyword = keyword.into();
        if keyword.is_empty() {
            return Err(ConfError::BlankKeyword);
        }
        if !keyword
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfError::IllegalKeyword { keyword });
        }
        if arguments.is_empty() {
            return Err(ConfError::NoDirectiveArguments);
        }
        Ok(Self { keyword, arguments })
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }
}

/// Parsed representation of a `redis.conf` file.
///
/// Directives keep their source order; duplicates are retained since the
/// server itself resolves them (generally last one wins).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RedisConf {
    directives: Vec<Directive>,
}

impl RedisConf {
    pub fn parse(text: &str) -> Result<Self, ConfError> {
        Self::parse_lines(text.lines())
    }

    pub fn parse_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Result<Self, ConfError> {
        let mut directives = Vec::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            directives.push(parse_directive(line)?);
        }
        Ok(Self { directives })
    }

    pub async fn parse_file(path: &Path) -> crate::error::Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(Self::parse(&text)?)
    }

    /// All `port` directives, first argument each.
    pub fn ports(&self) -> Vec<u16> {
        self.directives(KEYWORD_PORT)
            .iter()
            .filter_map(|d| d.arguments().first())
            .filter_map(|a| a.parse().ok())
            .collect()
    }

    /// All `bind` directives, first argument each.
    pub fn binds(&self) -> Vec<&str> {
        self.directives(KEYWORD_BIND)
            .iter()
            .filter_map(|d| d.arguments().first())
            .map(String::as_str)
            .collect()
    }

    /// All directives with the given keyword, in source order.
    pub fn directives(&self, keyword: &str) -> Vec<&Directive> {
        self.directives
            .iter()
            .filter(|d| d.keyword() == keyword)
            .collect()
    }

    pub fn all(&self) -> &[Directive] {
        &self.directives
    }
}

/// Returns the config file backing a launched server.
///
/// The launcher writes every config file itself and records the path on the
/// handle, so this is a plain lookup rather than a probe of the running
/// process.
pub fn locate(server: &RedisServer) -> &Path {
    server.conf_path()
}

fn parse_directive(line: &str) -> Result<Directive, ConfError> {
    let Some((keyword, rest)) = line.split_once(char::is_whitespace) else {
        return Err(ConfError::NoArguments {
            line: line.to_string(),
        });
    };
    let arguments = parse_arguments(rest.trim_start())?;
    Directive::new(keyword, arguments)
}

#[derive(PartialEq)]
enum ArgsParseState {
    Unescaped,
    SingleQuoted,
    DoubleQuoted,
}

fn parse_arguments(raw: &str) -> Result<Vec<String>, ConfError> {
    use ArgsParseState::*;

    let mut arguments = Vec::new();
    let mut current = String::new();
    let mut state = Unescaped;
    for ch in raw.chars() {
        match (ch, &state) {
            ('"', Unescaped) => state = DoubleQuoted,
            ('\'', Unescaped) => state = SingleQuoted,
            ('"', DoubleQuoted) => state = Unescaped,
            ('\'', SingleQuoted) => state = Unescaped,
            (' ', Unescaped) => arguments.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    if state != Unescaped {
        return Err(ConfError::UnbalancedQuotes {
            arguments: raw.to_string(),
        });
    }
    arguments.push(current);
    Ok(arguments)
}
