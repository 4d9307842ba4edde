//! Provenance-tagged strings.
//!
//! A [`JinjaString`] is an ordered list of [`StringPart`]s. Each part records
//! whether its text came from the input document (`is_input = true`) or from
//! the template itself. Transformations propagate the flag as follows:
//!
//! - one-to-one (upper, lower, strip, ...): each part keeps its flag;
//! - one-to-many (split): each fragment takes the flag of the part(s) it was
//!   cut from;
//! - many-to-one (replace, slice): the single result part is input only if
//!   every contributing part was.
//!
//! The flag is metadata only: equality and hashing look at the text.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringPart {
    pub text: String,
    pub is_input: bool,
}

impl StringPart {
    pub fn new(text: impl Into<String>, is_input: bool) -> Self {
        Self {
            text: text.into(),
            is_input,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JinjaString {
    parts: Vec<StringPart>,
}

impl PartialEq for JinjaString {
    fn eq(&self, other: &Self) -> bool {
        self.chars().eq(other.chars())
    }
}

impl fmt::Display for JinjaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.parts {
            f.write_str(&part.text)?;
        }
        Ok(())
    }
}

impl From<&str> for JinjaString {
    fn from(text: &str) -> Self {
        JinjaString::template(text)
    }
}

impl From<String> for JinjaString {
    fn from(text: String) -> Self {
        JinjaString::template(text)
    }
}

impl JinjaString {
    pub fn new(text: impl Into<String>, is_input: bool) -> Self {
        Self {
            parts: vec![StringPart::new(text, is_input)],
        }
    }

    /// Template-authored text.
    pub fn template(text: impl Into<String>) -> Self {
        Self::new(text, false)
    }

    /// Text supplied by the input document.
    pub fn input(text: impl Into<String>) -> Self {
        Self::new(text, true)
    }

    pub fn from_parts(parts: Vec<StringPart>) -> Self {
        Self { parts }
    }

    pub fn parts(&self) -> &[StringPart] {
        &self.parts
    }

    pub fn into_parts(self) -> Vec<StringPart> {
        self.parts
    }

    /// Parts with adjacent runs of equal provenance joined and empty parts
    /// dropped.
    pub fn merged_parts(&self) -> Vec<StringPart> {
        let mut merged: Vec<StringPart> = Vec::new();
        for part in self.parts.iter().filter(|p| !p.text.is_empty()) {
            match merged.last_mut() {
                Some(last) if last.is_input == part.is_input => last.text.push_str(&part.text),
                _ => merged.push(part.clone()),
            }
        }
        merged
    }

    pub fn chars(&self) -> impl Iterator<Item = char> + '_ {
        self.parts.iter().flat_map(|p| p.text.chars())
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.parts.iter().map(|p| p.text.chars().count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|p| p.text.is_empty())
    }

    /// True when every part came from the input document.
    pub fn is_input(&self) -> bool {
        self.parts.iter().all(|p| p.is_input)
    }

    pub fn mark_input(&mut self) {
        for part in &mut self.parts {
            part.is_input = true;
        }
    }

    pub fn push_str(&mut self, text: &str, is_input: bool) {
        self.parts.push(StringPart::new(text, is_input));
    }

    /// Concatenation: parts are appended in order, flags untouched.
    pub fn append(&mut self, other: &JinjaString) {
        self.parts.extend(other.parts.iter().cloned());
    }

    pub fn concat(mut self, other: &JinjaString) -> JinjaString {
        self.append(other);
        self
    }

    /// Many-to-one: collapse `text` into a single part whose flag is the
    /// conjunction of this string's flags.
    pub fn derived(&self, text: impl Into<String>) -> JinjaString {
        JinjaString::new(text, self.is_input())
    }

    fn map_parts(&self, f: impl Fn(&str) -> String) -> JinjaString {
        JinjaString {
            parts: self
                .parts
                .iter()
                .map(|p| StringPart::new(f(&p.text), p.is_input))
                .collect(),
        }
    }

    pub fn upper(&self) -> JinjaString {
        self.map_parts(|s| s.to_uppercase())
    }

    pub fn lower(&self) -> JinjaString {
        self.map_parts(|s| s.to_lowercase())
    }

    /// First character upper-cased, the rest lower-cased, across parts.
    pub fn capitalize(&self) -> JinjaString {
        let mut first = true;
        let parts = self
            .parts
            .iter()
            .map(|p| {
                let mut out = String::with_capacity(p.text.len());
                for c in p.text.chars() {
                    if first {
                        out.extend(c.to_uppercase());
                        first = false;
                    } else {
                        out.extend(c.to_lowercase());
                    }
                }
                StringPart::new(out, p.is_input)
            })
            .collect();
        JinjaString { parts }
    }

    /// Every word starts upper-case; word boundaries carry across parts.
    pub fn title(&self) -> JinjaString {
        let mut capitalize_next = true;
        let parts = self
            .parts
            .iter()
            .map(|p| {
                let mut out = String::with_capacity(p.text.len());
                for c in p.text.chars() {
                    if c.is_whitespace() {
                        capitalize_next = true;
                        out.push(c);
                    } else if capitalize_next {
                        out.extend(c.to_uppercase());
                        capitalize_next = false;
                    } else {
                        out.extend(c.to_lowercase());
                    }
                }
                StringPart::new(out, p.is_input)
            })
            .collect();
        JinjaString { parts }
    }

    /// Strip characters matching `pred` from the requested ends. Parts that
    /// become empty at an edge are removed; interior parts are untouched.
    pub fn strip_by(&self, left: bool, right: bool, pred: impl Fn(char) -> bool) -> JinjaString {
        let mut parts = self.parts.clone();
        if left {
            while let Some(first) = parts.first_mut() {
                first.text = first.text.trim_start_matches(&pred).to_string();
                if first.text.is_empty() {
                    parts.remove(0);
                } else {
                    break;
                }
            }
        }
        if right {
            while let Some(last) = parts.last_mut() {
                last.text = last.text.trim_end_matches(&pred).to_string();
                if last.text.is_empty() {
                    parts.pop();
                } else {
                    break;
                }
            }
        }
        JinjaString { parts }
    }

    pub fn strip(&self, left: bool, right: bool) -> JinjaString {
        self.strip_by(left, right, char::is_whitespace)
    }

    /// Flag for the byte range `start..end` of the flattened text: true only
    /// if every part overlapping the range is input. An empty range takes the
    /// flag of the part it sits in.
    pub(crate) fn range_is_input(&self, start: usize, end: usize) -> bool {
        let mut pos = 0;
        let mut touched = false;
        for part in &self.parts {
            let part_end = pos + part.text.len();
            let overlaps = if start == end {
                start >= pos && start <= part_end && !part.text.is_empty()
            } else {
                start < part_end && end > pos
            };
            if overlaps {
                touched = true;
                if !part.is_input {
                    return false;
                }
            }
            pos = part_end;
        }
        touched || self.is_input()
    }

    /// A fragment of the flattened text with provenance from the range it was
    /// cut from.
    pub(crate) fn fragment(&self, flat: &str, start: usize, end: usize) -> JinjaString {
        JinjaString::new(&flat[start..end], self.range_is_input(start, end))
    }

    fn has_lower(&self) -> bool {
        self.chars().any(char::is_lowercase)
    }

    fn has_upper(&self) -> bool {
        self.chars().any(char::is_uppercase)
    }

    pub fn is_lowercase(&self) -> bool {
        !self.has_upper()
    }

    pub fn is_uppercase(&self) -> bool {
        !self.has_lower()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeting() -> JinjaString {
        JinjaString::template("Hello, ").concat(&JinjaString::input("Bob"))
    }

    #[test]
    fn upper_keeps_each_flag() {
        let upper = greeting().upper();
        assert_eq!(
            upper.parts(),
            &[StringPart::new("HELLO, ", false), StringPart::new("BOB", true)]
        );
    }

    #[test]
    fn concat_with_empty_template_is_not_input() {
        let all_input = JinjaString::input("Bob");
        assert!(all_input.is_input());
        let joined = all_input.concat(&JinjaString::template(""));
        assert!(!joined.is_input());
        assert_eq!(joined.to_string(), "Bob");
    }

    #[test]
    fn strip_drops_empty_edge_parts() {
        let s = JinjaString::template("  ")
            .concat(&JinjaString::input(" hi "))
            .concat(&JinjaString::template("\n"));
        let stripped = s.strip(true, true);
        assert_eq!(stripped.parts(), &[StringPart::new("hi", true)]);
    }

    #[test]
    fn range_provenance_spans_parts() {
        let s = greeting();
        assert!(!s.range_is_input(0, 3));
        assert!(s.range_is_input(7, 10));
        assert!(!s.range_is_input(5, 9));
    }

    #[test]
    fn title_carries_word_state_across_parts() {
        let s = JinjaString::template("hello wo").concat(&JinjaString::input("RLD again"));
        assert_eq!(s.title().to_string(), "Hello World Again");
    }

    #[test]
    fn merged_parts_coalesce_runs() {
        let s = JinjaString::template("a")
            .concat(&JinjaString::template("b"))
            .concat(&JinjaString::input(""))
            .concat(&JinjaString::input("c"));
        assert_eq!(
            s.merged_parts(),
            vec![StringPart::new("ab", false), StringPart::new("c", true)]
        );
    }

    #[test]
    fn equality_ignores_provenance() {
        assert_eq!(JinjaString::input("x"), JinjaString::template("x"));
    }
}
