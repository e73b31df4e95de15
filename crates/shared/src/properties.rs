//! `key=value` property line parsing.
//!
//! Property lines are the runtime overrides merged on top of a configuration
//! resource. The accepted syntax is the common subset of Java properties:
//! `#` and `!` start comments, the first `=` or `:` separates key from value,
//! and surrounding whitespace is ignored.

use crate::error::{PersistError, PersistResult};

/// Parses property lines into ordered `(key, value)` pairs.
///
/// Later lines win when a key repeats; the caller applies pairs in order.
///
/// # Errors
///
/// Returns `PersistError::Configuration` for a line with no separator or an
/// empty key.
pub fn parse_property_lines<I, S>(lines: I) -> PersistResult<Vec<(String, String)>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut pairs = Vec::new();

    for (idx, raw) in lines.into_iter().enumerate() {
        // A single caller entry may itself hold several newline-joined lines.
        for line in raw.as_ref().lines() {
            if let Some(pair) = parse_line(line, idx + 1)? {
                pairs.push(pair);
            }
        }
    }

    Ok(pairs)
}

fn parse_line(line: &str, number: usize) -> PersistResult<Option<(String, String)>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        return Ok(None);
    }

    let Some(split) = line.find(['=', ':']) else {
        return Err(PersistError::configuration(format!(
            "property line {number} has no '=' or ':' separator: {line}"
        )));
    };

    let key = line[..split].trim();
    let value = line[split + 1..].trim();

    if key.is_empty() {
        return Err(PersistError::configuration(format!(
            "property line {number} has an empty key"
        )));
    }

    Ok(Some((key.to_string(), value.to_string())))
}

#[cfg(test)]
#[path = "properties_tests.rs"]
mod tests;
