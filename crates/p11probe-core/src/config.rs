//! Provider configuration files.
//!
//! The format follows the SunPKCS11 provider configuration: one `key = value`
//! entry per keyword, `#` comments, double-quoted strings and `{ ... }` lists
//! that may span several lines. `${VAR}` references are expanded from the
//! process environment.

use std::{
    collections::{BTreeSet, HashSet},
    fs,
    iter::Peekable,
    path::{Path, PathBuf},
    str::Chars,
    vec::IntoIter,
};

use cryptoki_sys::{CK_MECHANISM_TYPE, CK_SLOT_ID};
use tracing::debug;

use crate::{
    error::{ProbeError, ProbeResult},
    mechanism::parse_mechanism,
};

pub const DEFAULT_CONFIG_FILE: &str = "pkcs11.cfg";
pub const DEFAULT_FUNCTION_LIST: &str = "C_GetFunctionList";

/// How the token slot is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSelector {
    /// A specific slot ID.
    Id(CK_SLOT_ID),
    /// An index into the list of slots with a token present.
    ListIndex(usize),
}

impl Default for SlotSelector {
    fn default() -> Self {
        SlotSelector::ListIndex(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub name: String,
    pub library: PathBuf,
    pub description: Option<String>,
    pub slot: SlotSelector,
    /// When set, only these mechanisms may be used.
    pub enabled_mechanisms: Option<BTreeSet<CK_MECHANISM_TYPE>>,
    pub disabled_mechanisms: BTreeSet<CK_MECHANISM_TYPE>,
    pub show_info: bool,
    pub omit_initialize: bool,
    pub function_list: String,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, library: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            library: library.into(),
            description: None,
            slot: SlotSelector::default(),
            enabled_mechanisms: None,
            disabled_mechanisms: BTreeSet::new(),
            show_info: false,
            omit_initialize: false,
            function_list: DEFAULT_FUNCTION_LIST.to_string(),
        }
    }

    /// Reads and parses a configuration file.
    pub fn load(path: &Path) -> ProbeResult<Self> {
        let text = fs::read_to_string(path).map_err(|err| {
            ProbeError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        let config = Self::parse(&text).map_err(|err| match err {
            ProbeError::Config(message) => {
                ProbeError::Config(format!("{}: {message}", path.display()))
            }
            other => other,
        })?;
        debug!(path = %path.display(), name = %config.name, "loaded provider configuration");
        Ok(config)
    }

    pub fn parse(text: &str) -> ProbeResult<Self> {
        Self::parse_with(text, |name| std::env::var(name).ok())
    }

    /// Parses configuration text, resolving `${VAR}` references with `lookup`.
    pub fn parse_with<F>(text: &str, lookup: F) -> ProbeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut parser = Parser {
            tokens: tokenize(text)?.into_iter().peekable(),
            lookup,
            seen: HashSet::new(),
            name: None,
            library: None,
            slot_id: None,
            slot_list_index: None,
            config: ProviderConfig::new(String::new(), PathBuf::new()),
        };
        parser.run()
    }

    pub fn mechanism_allowed(&self, mechanism: CK_MECHANISM_TYPE) -> bool {
        let enabled = self
            .enabled_mechanisms
            .as_ref()
            .map_or(true, |set| set.contains(&mechanism));
        enabled && !self.disabled_mechanisms.contains(&mechanism)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Equals,
    Open,
    Close,
}

#[derive(Debug)]
struct Lexeme {
    token: Token,
    line: usize,
}

fn syntax(line: usize, message: impl std::fmt::Display) -> ProbeError {
    ProbeError::Config(format!("line {line}: {message}"))
}

fn tokenize(text: &str) -> ProbeResult<Vec<Lexeme>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1;

    while let Some(c) = chars.next() {
        let token = match c {
            '\n' => {
                line += 1;
                continue;
            }
            c if c.is_whitespace() => continue,
            '#' => {
                while chars.peek().is_some_and(|next| *next != '\n') {
                    chars.next();
                }
                continue;
            }
            '=' => Token::Equals,
            '{' => Token::Open,
            '}' => Token::Close,
            '"' => Token::Quoted(quoted(&mut chars, line)?),
            first => {
                let mut word = String::from(first);
                while let Some(&next) = chars.peek() {
                    if next == '{' && word.ends_with('$') {
                        word.push_str(&reference(&mut chars, line)?);
                        continue;
                    }
                    if next.is_whitespace() || matches!(next, '=' | '{' | '}' | '"' | '#') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                Token::Word(word)
            }
        };
        tokens.push(Lexeme { token, line });
    }
    Ok(tokens)
}

/// Reads a `{NAME}` reference following a `$` in a bare word.
fn reference(chars: &mut Peekable<Chars<'_>>, line: usize) -> ProbeResult<String> {
    let mut text = String::new();
    for c in chars.by_ref() {
        text.push(c);
        match c {
            '}' => return Ok(text),
            '\n' => break,
            _ => {}
        }
    }
    Err(syntax(line, "unterminated ${...} reference"))
}

fn quoted(chars: &mut Peekable<Chars<'_>>, line: usize) -> ProbeResult<String> {
    let mut value = String::new();
    loop {
        match chars.next() {
            Some('"') => return Ok(value),
            Some('\\') => match chars.next() {
                Some(escaped @ ('"' | '\\')) => value.push(escaped),
                Some(other) => {
                    value.push('\\');
                    value.push(other);
                }
                None => return Err(syntax(line, "unterminated string")),
            },
            Some('\n') | None => return Err(syntax(line, "unterminated string")),
            Some(c) => value.push(c),
        }
    }
}

enum Value {
    Scalar(String),
    List(Vec<String>),
}

struct Parser<F> {
    tokens: Peekable<IntoIter<Lexeme>>,
    lookup: F,
    seen: HashSet<String>,
    name: Option<String>,
    library: Option<PathBuf>,
    slot_id: Option<CK_SLOT_ID>,
    slot_list_index: Option<usize>,
    config: ProviderConfig,
}

impl<F> Parser<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn run(mut self) -> ProbeResult<ProviderConfig> {
        while let Some(Lexeme { token, line }) = self.tokens.next() {
            let key = match token {
                Token::Word(word) => word,
                other => return Err(syntax(line, format!("expected keyword, found {other:?}"))),
            };
            match self.tokens.next() {
                Some(Lexeme {
                    token: Token::Equals,
                    ..
                }) => {}
                _ => return Err(syntax(line, format!("expected '=' after {key}"))),
            }
            let value = self.value(line)?;
            if !self.seen.insert(key.clone()) {
                return Err(syntax(line, format!("duplicate keyword {key}")));
            }
            self.apply(&key, value, line)?;
        }

        let mut config = self.config;
        config.name = self
            .name
            .ok_or_else(|| ProbeError::config("missing required keyword name"))?;
        config.library = self
            .library
            .ok_or_else(|| ProbeError::config("missing required keyword library"))?;
        config.slot = match (self.slot_id, self.slot_list_index) {
            (Some(_), Some(_)) => {
                return Err(ProbeError::config(
                    "slot and slotListIndex cannot both be specified",
                ))
            }
            (Some(id), None) => SlotSelector::Id(id),
            (None, Some(index)) => SlotSelector::ListIndex(index),
            (None, None) => SlotSelector::default(),
        };
        Ok(config)
    }

    fn value(&mut self, line: usize) -> ProbeResult<Value> {
        match self.tokens.next() {
            Some(Lexeme {
                token: Token::Word(word) | Token::Quoted(word),
                line,
            }) => Ok(Value::Scalar(self.expand(&word, line)?)),
            Some(Lexeme {
                token: Token::Open, ..
            }) => {
                let mut items = Vec::new();
                loop {
                    match self.tokens.next() {
                        Some(Lexeme {
                            token: Token::Close,
                            ..
                        }) => return Ok(Value::List(items)),
                        Some(Lexeme {
                            token: Token::Word(item) | Token::Quoted(item),
                            line,
                        }) => items.push(self.expand(&item, line)?),
                        Some(Lexeme { token, line }) => {
                            return Err(syntax(line, format!("unexpected {token:?} in list")))
                        }
                        None => return Err(syntax(line, "unterminated list")),
                    }
                }
            }
            Some(Lexeme { token, line }) => {
                Err(syntax(line, format!("expected value, found {token:?}")))
            }
            None => Err(syntax(line, "missing value")),
        }
    }

    fn expand(&self, raw: &str, line: usize) -> ProbeResult<String> {
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| syntax(line, format!("unterminated variable reference in {raw}")))?;
            let name = &after[..end];
            let value = (self.lookup)(name)
                .ok_or_else(|| syntax(line, format!("variable {name} is not set")))?;
            out.push_str(&value);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn apply(&mut self, key: &str, value: Value, line: usize) -> ProbeResult<()> {
        match key {
            "name" => self.name = Some(scalar(key, value, line)?),
            "library" => self.library = Some(PathBuf::from(scalar(key, value, line)?)),
            "description" => self.config.description = Some(scalar(key, value, line)?),
            "slot" => {
                let text = scalar(key, value, line)?;
                let id = text
                    .parse()
                    .map_err(|_| syntax(line, format!("invalid slot {text}")))?;
                self.slot_id = Some(id);
            }
            "slotListIndex" => {
                let text = scalar(key, value, line)?;
                let index = text
                    .parse()
                    .map_err(|_| syntax(line, format!("invalid slotListIndex {text}")))?;
                self.slot_list_index = Some(index);
            }
            "enabledMechanisms" => {
                self.config.enabled_mechanisms = Some(mechanisms(key, value, line)?);
            }
            "disabledMechanisms" => {
                self.config.disabled_mechanisms = mechanisms(key, value, line)?;
            }
            "showInfo" => self.config.show_info = boolean(key, value, line)?,
            "omitInitialize" => self.config.omit_initialize = boolean(key, value, line)?,
            "functionList" => self.config.function_list = scalar(key, value, line)?,
            other => return Err(syntax(line, format!("unsupported keyword {other}"))),
        }
        Ok(())
    }
}

fn scalar(key: &str, value: Value, line: usize) -> ProbeResult<String> {
    match value {
        Value::Scalar(text) => Ok(text),
        Value::List(_) => Err(syntax(line, format!("{key} takes a single value"))),
    }
}

fn boolean(key: &str, value: Value, line: usize) -> ProbeResult<bool> {
    let text = scalar(key, value, line)?;
    match text.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(syntax(line, format!("{key} expects true or false, found {text}"))),
    }
}

fn mechanisms(key: &str, value: Value, line: usize) -> ProbeResult<BTreeSet<CK_MECHANISM_TYPE>> {
    let items = match value {
        Value::List(items) => items,
        Value::Scalar(_) => return Err(syntax(line, format!("{key} expects a {{ ... }} list"))),
    };
    items
        .iter()
        .map(|item| {
            parse_mechanism(item).ok_or_else(|| syntax(line, format!("unknown mechanism {item}")))
        })
        .collect()
}
