//! Labels and label sets identifying a series.

use crate::{RelabelError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Label holding the metric name of a series.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A time-series label.
/// A label with missing name or value is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    /// Creates a new label.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Checks if the label is valid (legal name and non-empty value).
    pub fn is_valid(&self) -> bool {
        is_valid_label_name(&self.name) && !self.value.is_empty()
    }
}

impl Ord for Label {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.name.cmp(&other.name) {
            Ordering::Equal => self.value.cmp(&other.value),
            other => other,
        }
    }
}

impl PartialOrd for Label {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Returns true if `name` matches `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// A label set: labels sorted by name, each name at most once.
///
/// Ordering compares label by label, which is the order series are stored in
/// a block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Vec<Label>", into = "Vec<Label>")]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Creates an empty label set.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Returns the value of the label `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|idx| self.0[idx].value.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Label] {
        &self.0
    }

    /// Parses a label set from the start of `input` and returns the rest.
    pub fn parse_prefix(input: &str) -> Result<(Labels, &str)> {
        let mut parser = LabelsParser { input, pos: 0 };
        let labels = parser.parse()?;
        Ok((labels, &input[parser.pos..]))
    }
}

impl From<Vec<Label>> for Labels {
    fn from(mut labels: Vec<Label>) -> Self {
        // Empty values mean "absent"; on duplicate names the last one wins.
        labels.retain(|l| !l.value.is_empty());
        labels.reverse();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        labels.dedup_by(|a, b| a.name == b.name);
        Self(labels)
    }
}

impl From<Labels> for Vec<Label> {
    fn from(labels: Labels) -> Self {
        labels.0
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Label> for Labels {
    fn from_iter<I: IntoIterator<Item = Label>>(iter: I) -> Self {
        Labels::from(iter.into_iter().collect::<Vec<_>>())
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}=\"", label.name)?;
            for c in label.value.chars() {
                match c {
                    '\\' => f.write_str("\\\\")?,
                    '"' => f.write_str("\\\"")?,
                    '\n' => f.write_str("\\n")?,
                    c => write!(f, "{c}")?,
                }
            }
            f.write_str("\"")?;
        }
        f.write_str("}")
    }
}

impl FromStr for Labels {
    type Err = RelabelError;

    fn from_str(s: &str) -> Result<Self> {
        let (labels, rest) = Labels::parse_prefix(s.trim_start())?;
        if !rest.trim().is_empty() {
            return Err(RelabelError::InvalidConfiguration(format!(
                "trailing input after label set: {rest:?}"
            )));
        }
        Ok(labels)
    }
}

struct LabelsParser<'a> {
    input: &'a str,
    pos: usize,
}

impl LabelsParser<'_> {
    fn parse(&mut self) -> Result<Labels> {
        self.expect('{')?;
        let mut labels = Vec::new();
        self.skip_spaces();
        if self.peek() == Some('}') {
            self.pos += 1;
            return Ok(Labels(labels));
        }

        loop {
            self.skip_spaces();
            let name = self.parse_name()?;
            self.expect('=')?;
            let value = self.parse_quoted()?;
            labels.push(Label::new(name, value));

            self.skip_spaces();
            match self.next() {
                Some(',') => continue,
                Some('}') => break,
                other => return Err(self.error(&format!("expected ',' or '}}', got {other:?}"))),
            }
        }

        Ok(Labels::from(labels))
    }

    fn parse_name(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let name = &self.input[start..self.pos];
        if !is_valid_label_name(name) {
            return Err(self.error(&format!("invalid label name {name:?}")));
        }
        Ok(name.to_string())
    }

    fn parse_quoted(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut value = String::new();
        loop {
            match self.next() {
                Some('"') => return Ok(value),
                Some('\\') => match self.next() {
                    Some('n') => value.push('\n'),
                    Some(c @ ('\\' | '"')) => value.push(c),
                    other => return Err(self.error(&format!("invalid escape {other:?}"))),
                },
                Some(c) => value.push(c),
                None => return Err(self.error("unterminated label value")),
            }
        }
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(' ') {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: char) -> Result<()> {
        match self.next() {
            Some(c) if c == want => Ok(()),
            other => Err(self.error(&format!("expected {want:?}, got {other:?}"))),
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn error(&self, msg: &str) -> RelabelError {
        RelabelError::InvalidConfiguration(format!(
            "malformed label set at byte {}: {msg}",
            self.pos
        ))
    }
}

/// Incrementally modifies a label set.
#[derive(Debug, Clone)]
pub struct LabelsBuilder {
    labels: Vec<Label>,
}

impl LabelsBuilder {
    pub fn new(base: &Labels) -> Self {
        Self {
            labels: base.0.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Sets `name` to `value`; an empty value deletes the label.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        if value.is_empty() {
            return self.del(&name);
        }
        match self.labels.iter_mut().find(|l| l.name == name) {
            Some(existing) => existing.value = value,
            None => self.labels.push(Label::new(name, value)),
        }
        self
    }

    pub fn del(&mut self, name: &str) -> &mut Self {
        self.labels.retain(|l| l.name != name);
        self
    }

    /// Keeps only labels for which `keep` returns true.
    pub fn retain(&mut self, keep: impl FnMut(&Label) -> bool) -> &mut Self {
        self.labels.retain(keep);
        self
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn build(self) -> Labels {
        Labels::from(self.labels)
    }
}
