//! Parser for `.rules` files.
//!
//! ```text
//! import org.example.*          // ignored
//! var counter                   // writable, starts unset
//! var Number threshold = 10     // optional type, literal initializer
//! val greeting = "hello"        // read-only
//!
//! rule "Increment counter"
//! when
//!     Item Switch changed or
//!     Time cron "0 * * * * *"
//! then
//!     counter = counter + 1;
//! end
//! ```
//!
//! Rule bodies are kept verbatim as rhai source.

use crate::error::{Result, RuleError};
use crate::model::{RuleDefinition, RuleModel, RuleTrigger, Variable};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

const MIDNIGHT: &str = "0 0 0 * * *";
const NOON: &str = "0 0 12 * * *";

/// 解析规则文件文本
pub fn parse_rules(model_name: &str, source: Option<PathBuf>, text: &str) -> Result<Arc<RuleModel>> {
    let mut parser = Parser::new(model_name);
    for (index, line) in text.lines().enumerate() {
        parser.line = index + 1;
        parser.feed(line)?;
    }
    parser.finish(source)
}

enum State {
    TopLevel,
    ExpectWhen { name: String },
    When { name: String, triggers: Vec<RuleTrigger> },
    Then { name: String, triggers: Vec<RuleTrigger>, body: Vec<String> },
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
}

struct Parser<'a> {
    model: &'a str,
    line: usize,
    state: State,
    in_comment: bool,
    variables: Vec<Variable>,
    rules: Vec<RuleDefinition>,
    rule_names: HashSet<String>,
}

impl<'a> Parser<'a> {
    fn new(model: &'a str) -> Self {
        Self {
            model,
            line: 0,
            state: State::TopLevel,
            in_comment: false,
            variables: Vec::new(),
            rules: Vec::new(),
            rule_names: HashSet::new(),
        }
    }

    fn error(&self, message: impl Into<String>) -> RuleError {
        RuleError::Parse {
            model: self.model.to_string(),
            line: self.line,
            message: message.into(),
        }
    }

    fn feed(&mut self, raw: &str) -> Result<()> {
        // rule bodies are passed through untouched
        if let State::Then { body, .. } = &mut self.state {
            if strip_comments(raw, &mut false).trim() != "end" {
                body.push(raw.to_string());
                return Ok(());
            }
        }

        let code = strip_comments(raw, &mut self.in_comment);
        let line = code.trim();
        if line.is_empty() {
            return Ok(());
        }

        match std::mem::replace(&mut self.state, State::TopLevel) {
            State::TopLevel => self.top_level(line),
            State::ExpectWhen { name } => {
                if line != "when" {
                    return Err(self.error(format!("expected 'when' after rule '{}'", name)));
                }
                self.state = State::When {
                    name,
                    triggers: Vec::new(),
                };
                Ok(())
            }
            State::When { name, mut triggers } => {
                if line == "then" {
                    if triggers.is_empty() {
                        return Err(self.error(format!("rule '{}' has no triggers", name)));
                    }
                    if self.in_comment {
                        return Err(self.error("block comment must be closed before the rule body"));
                    }
                    self.state = State::Then {
                        name,
                        triggers,
                        body: Vec::new(),
                    };
                    return Ok(());
                }
                triggers.extend(self.triggers(line)?);
                self.state = State::When { name, triggers };
                Ok(())
            }
            State::Then { name, triggers, body } => {
                let script = body.join("\n").trim().to_string();
                self.rules.push(RuleDefinition::new(name, triggers, script));
                Ok(())
            }
        }
    }

    fn top_level(&mut self, line: &str) -> Result<()> {
        if line.starts_with("import ") {
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix("var ") {
            return self.variable(rest, true);
        }
        if let Some(rest) = line.strip_prefix("val ") {
            return self.variable(rest, false);
        }
        if let Some(rest) = line.strip_prefix("rule ") {
            let name = self.rule_name(rest.trim())?;
            if !self.rule_names.insert(name.clone()) {
                return Err(self.error(format!("duplicate rule '{}'", name)));
            }
            self.state = State::ExpectWhen { name };
            return Ok(());
        }
        Err(self.error(format!("unexpected input '{}'", line)))
    }

    fn variable(&mut self, declaration: &str, writable: bool) -> Result<()> {
        let (left, initializer) = match declaration.split_once('=') {
            Some((left, right)) => (left, Some(right.trim().trim_end_matches(';').trim())),
            None => (declaration.trim_end_matches(';'), None),
        };

        let words: Vec<&str> = left.split_whitespace().collect();
        let (type_name, name) = match words.as_slice() {
            [name] => (None, *name),
            [type_name, name] => (Some(type_name.to_string()), *name),
            _ => return Err(self.error(format!("malformed variable declaration '{}'", declaration))),
        };

        if !is_identifier(name) {
            return Err(self.error(format!("invalid variable name '{}'", name)));
        }
        if self.variables.iter().any(|v| v.name == name) {
            return Err(self.error(format!("duplicate variable '{}'", name)));
        }

        let initial = match initializer {
            Some(text) => Some(self.literal(text)?),
            None if !writable => {
                return Err(self.error(format!("val '{}' requires an initializer", name)));
            }
            None => None,
        };

        self.variables.push(Variable {
            name: name.to_string(),
            type_name,
            writable,
            initial,
        });
        Ok(())
    }

    fn literal(&self, text: &str) -> Result<Value> {
        if let Some(inner) = text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
            return Ok(Value::String(inner.to_string()));
        }
        serde_json::from_str(text)
            .map_err(|_| self.error(format!("initializer '{}' is not a literal", text)))
    }

    fn rule_name(&self, text: &str) -> Result<String> {
        let name = match text.strip_prefix('"') {
            Some(rest) => match rest.strip_suffix('"') {
                Some(name) => name,
                None => return Err(self.error("unterminated rule name")),
            },
            None if !text.contains(char::is_whitespace) => text,
            None => return Err(self.error(format!("rule name '{}' must be quoted", text))),
        };
        if name.is_empty() {
            return Err(self.error("empty rule name"));
        }
        Ok(name.to_string())
    }

    fn triggers(&self, line: &str) -> Result<Vec<RuleTrigger>> {
        let tokens = self.tokenize(line)?;
        tokens
            .split(|t| matches!(t, Token::Word(w) if w == "or"))
            .filter(|group| !group.is_empty())
            .map(|group| self.trigger(group))
            .collect()
    }

    fn trigger(&self, tokens: &[Token]) -> Result<RuleTrigger> {
        use Token::{Quoted, Word};

        let words: Vec<&str> = tokens
            .iter()
            .map(|t| match t {
                Word(w) => w.as_str(),
                Quoted(q) => q.as_str(),
            })
            .collect();

        let trigger = match (tokens, words.as_slice()) {
            (_, ["System", "started"]) => RuleTrigger::SystemStarted,
            (_, ["System", "shuts", "down"]) => RuleTrigger::SystemShutdown,
            ([_, Word(_), _], ["Item", item, "changed"]) => RuleTrigger::ItemChanged {
                item: item.to_string(),
            },
            ([_, Word(_), _, _], ["Item", item, "received", "update"]) => RuleTrigger::ItemUpdated {
                item: item.to_string(),
            },
            ([_, Word(_), _, _], ["Item", item, "received", "command"]) => RuleTrigger::ItemCommand {
                item: item.to_string(),
            },
            ([_, _, Quoted(_)], ["Time", "cron", expression]) => RuleTrigger::Cron {
                expression: expression.to_string(),
            },
            (_, ["Time", "is", "midnight"]) => RuleTrigger::Cron {
                expression: MIDNIGHT.to_string(),
            },
            (_, ["Time", "is", "noon"]) => RuleTrigger::Cron {
                expression: NOON.to_string(),
            },
            _ => return Err(self.error(format!("unsupported trigger '{}'", words.join(" ")))),
        };
        Ok(trigger)
    }

    fn tokenize(&self, line: &str) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        let mut chars = line.chars().peekable();

        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                chars.next();
            } else if c == '"' {
                chars.next();
                let mut quoted = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(ch) => quoted.push(ch),
                        None => return Err(self.error("unterminated string in trigger")),
                    }
                }
                tokens.push(Token::Quoted(quoted));
            } else {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || ch == '"' {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
        Ok(tokens)
    }

    fn finish(self, source: Option<PathBuf>) -> Result<Arc<RuleModel>> {
        match &self.state {
            State::TopLevel => {}
            State::ExpectWhen { name } | State::When { name, .. } | State::Then { name, .. } => {
                return Err(self.error(format!("rule '{}' is not terminated with 'end'", name)));
            }
        }
        if self.in_comment {
            return Err(self.error("unterminated block comment"));
        }
        Ok(RuleModel::build(self.model, source, self.variables, self.rules))
    }
}

/// Removes `//` and `/* */` comments outside of quotes. `in_comment`
/// carries an open block comment across lines.
fn strip_comments(line: &str, in_comment: &mut bool) -> String {
    let mut code = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if *in_comment {
            if c == '*' && chars.peek() == Some(&'/') {
                chars.next();
                *in_comment = false;
            }
            continue;
        }

        if let Some(q) = quote {
            code.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    code.push(escaped);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }

        let next = chars.peek().copied();
        match (c, next) {
            ('/', Some('/')) => break,
            ('/', Some('*')) => {
                chars.next();
                *in_comment = true;
                code.push(' ');
            }
            ('"' | '\'', _) => {
                quote = Some(c);
                code.push(c);
            }
            _ => code.push(c),
        }
    }
    code
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}
