use std::borrow::Cow;
use std::ops::Range;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// How strictly the title inside `[[...]]` must match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleMatching {
    /// `[[Title]]` only.
    Strict,
    /// Spaces, tabs and form feeds may pad the title: `[[ Title\t|text]]`.
    #[default]
    WhitespaceTolerant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewritePolicy {
    pub matching: TitleMatching,
    /// Rewrite bare `[[Old]]` as `[[New|Old]]` instead of `[[New]]`.
    pub keep_display_text: bool,
}

/// One `[[old|display]]` link found in a page body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOccurrence<'a> {
    pub span: Range<usize>,
    pub display_text: Option<&'a str>,
}

/// Finds and repoints wiki links to a single target title.
#[derive(Debug, Clone)]
pub struct LinkRewriter {
    pattern: Regex,
    old_title: String,
    new_title: String,
    keep_display_text: bool,
}

impl LinkRewriter {
    pub fn new(
        old_title: &str,
        new_title: &str,
        policy: RewritePolicy,
    ) -> Result<Self, regex::Error> {
        let padding = match policy.matching {
            TitleMatching::Strict => "",
            TitleMatching::WhitespaceTolerant => r"[\t\f ]*",
        };
        let pattern = Regex::new(&format!(
            r"\[\[{padding}{title}{padding}(?:\|([^\[\]]+))?\]\]",
            title = regex::escape(old_title),
        ))?;
        Ok(Self {
            pattern,
            old_title: old_title.to_string(),
            new_title: new_title.to_string(),
            keep_display_text: policy.keep_display_text,
        })
    }

    pub fn occurrences<'a>(&self, body: &'a str) -> Vec<LinkOccurrence<'a>> {
        self.pattern
            .captures_iter(body)
            .filter_map(|captures| {
                let full = captures.get(0)?;
                Some(LinkOccurrence {
                    span: full.range(),
                    display_text: captures.get(1).map(|display| display.as_str()),
                })
            })
            .collect()
    }

    /// Rewrite every link to the old title. Text outside matched links is copied
    /// byte for byte; malformed or unterminated links are left alone.
    pub fn rewrite<'a>(&self, body: &'a str) -> Cow<'a, str> {
        let occurrences = self.occurrences(body);
        if occurrences.is_empty() {
            return Cow::Borrowed(body);
        }

        let mut output = String::with_capacity(body.len());
        let mut cursor = 0usize;
        for occurrence in &occurrences {
            output.push_str(&body[cursor..occurrence.span.start]);
            output.push_str(&self.replacement(occurrence.display_text));
            cursor = occurrence.span.end;
        }
        output.push_str(&body[cursor..]);
        Cow::Owned(output)
    }

    fn replacement(&self, display_text: Option<&str>) -> String {
        match display_text {
            // `[[Old|New]]` already shows the new title; never emit `[[New|New]]`.
            Some(text) if text == self.new_title => format!("[[{}]]", self.new_title),
            Some(text) => format!("[[{}|{}]]", self.new_title, text),
            None if self.keep_display_text => format!("[[{}|{}]]", self.new_title, self.old_title),
            None => format!("[[{}]]", self.new_title),
        }
    }
}
