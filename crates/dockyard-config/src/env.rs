//! Dotenv-style environment parsing.
//!
//! Service environments are stored as text and parsed into an ordered list
//! of key/value pairs:
//!
//! ```text
//! # comment
//! export DATABASE_HOST=db
//! DATABASE_URL="postgres://${DATABASE_HOST}/app"
//! GREETING='literal ${NOT_EXPANDED}'
//! ```
//!
//! `${NAME}` expands to a previously defined key (or the empty string) in
//! unquoted and double-quoted values. A key defined twice keeps its first
//! position and its last value.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::{ConfigError, ConfigResult};

static KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").unwrap());

static VAR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.]*)\}").unwrap());

/// Parse dotenv text into ordered key/value pairs.
pub fn parse_env(text: &str) -> ConfigResult<Vec<(String, String)>> {
    let mut entries: Vec<(String, String)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (number, raw) in text.lines().enumerate() {
        let line_no = number + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

        let (key, rest) = line.split_once('=').ok_or_else(|| ConfigError::InvalidEnvironment {
            line: line_no,
            message: "expected KEY=VALUE".to_string(),
        })?;
        let key = key.trim();
        if !KEY_REGEX.is_match(key) {
            return Err(ConfigError::InvalidEnvironment {
                line: line_no,
                message: format!("invalid key '{}'", key),
            });
        }

        let value = parse_value(rest.trim(), line_no, &entries, &index)?;

        match index.get(key) {
            Some(&pos) => entries[pos].1 = value,
            None => {
                index.insert(key.to_string(), entries.len());
                entries.push((key.to_string(), value));
            }
        }
    }

    Ok(entries)
}

fn parse_value(
    raw: &str,
    line: usize,
    entries: &[(String, String)],
    index: &HashMap<String, usize>,
) -> ConfigResult<String> {
    let unterminated = |quote: char| ConfigError::InvalidEnvironment {
        line,
        message: format!("unterminated {} quote", quote),
    };

    if let Some(body) = raw.strip_prefix('\'') {
        let end = body.find('\'').ok_or_else(|| unterminated('\''))?;
        check_trailing(&body[end + 1..], line)?;
        return Ok(body[..end].to_string());
    }

    if let Some(body) = raw.strip_prefix('"') {
        let mut value = String::new();
        let mut chars = body.char_indices();
        let mut closed_at = None;
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, '"')) => value.push('"'),
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, other)) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => return Err(unterminated('"')),
                },
                '"' => {
                    closed_at = Some(i);
                    break;
                }
                c => value.push(c),
            }
        }
        let end = closed_at.ok_or_else(|| unterminated('"'))?;
        check_trailing(&body[end + 1..], line)?;
        return Ok(interpolate(&value, entries, index));
    }

    // Unquoted: an inline comment starts at " #".
    let value = match raw.find(" #") {
        Some(pos) => raw[..pos].trim_end(),
        None => raw,
    };
    Ok(interpolate(value, entries, index))
}

fn check_trailing(rest: &str, line: usize) -> ConfigResult<()> {
    let rest = rest.trim();
    if rest.is_empty() || rest.starts_with('#') {
        Ok(())
    } else {
        Err(ConfigError::InvalidEnvironment {
            line,
            message: format!("unexpected text after closing quote: {}", rest),
        })
    }
}

fn interpolate(value: &str, entries: &[(String, String)], index: &HashMap<String, usize>) -> String {
    VAR_REGEX
        .replace_all(value, |caps: &regex::Captures| {
            index
                .get(&caps[1])
                .map(|&pos| entries[pos].1.clone())
                .unwrap_or_default()
        })
        .to_string()
}
