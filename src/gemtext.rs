//! Gemtext line parsing: the plain-text line format carried in `text/gemini`
//! response bodies.
//!
//! Kept deliberately minimal — a line-oriented scanner plus a small stateful
//! reader folding the preformat-toggle across a stream. No document
//! *builder*; composing gemtext is an application concern, not this
//! crate's.

use std::fmt;

/// One parsed line of a gemtext document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// An ordinary text line.
    Text(String),
    /// A `=>` link line: the target (verbatim, unresolved) and an optional
    /// human-readable label.
    Link {
        /// The link target as written, not yet resolved against a base URL.
        url: String,
        /// The label following the target, if the line supplied one.
        name: Option<String>,
    },
    /// A `#`/`##`/`###` heading line, `level` in `1..=3`.
    Heading {
        /// Heading level: 1 for `#`, 2 for `##`, 3 for `###`.
        level: u8,
        /// The heading text, with leading `#`s and whitespace stripped.
        text: String,
    },
    /// A `*` unordered list item line.
    ListItem(String),
    /// A `>` quote line.
    Quote(String),
    /// A `\`\`\`` fence line toggling preformatted mode, carrying the
    /// optional alt-text that followed the fence when opening.
    PreformatToggle(Option<String>),
    /// A line inside a preformatted block, taken verbatim.
    Preformatted(String),
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Line::Text(text) => write!(f, "{}", text),
            Line::Link { url, name: Some(name) } => write!(f, "=> {} {}", url, name),
            Line::Link { url, name: None } => write!(f, "=> {}", url),
            Line::Heading { level, text } => write!(f, "{} {}", "#".repeat(*level as usize), text),
            Line::ListItem(text) => write!(f, "* {}", text),
            Line::Quote(text) => write!(f, "> {}", text),
            Line::PreformatToggle(Some(alt)) => write!(f, "```{}", alt),
            Line::PreformatToggle(None) => write!(f, "```"),
            Line::Preformatted(text) => write!(f, "{}", text),
        }
    }
}

/// Parses one line **outside** of a preformatted block. Callers inside a
/// preformatted block should instead check for the closing fence and
/// otherwise treat the line as [`Line::Preformatted`] verbatim — see
/// [`GemtextReader`], which does this folding for a whole stream.
pub fn parse_line(line: &str) -> Line {
    if let Some(rest) = line.strip_prefix("```") {
        let alt = if rest.is_empty() { None } else { Some(rest.to_string()) };
        return Line::PreformatToggle(alt);
    }

    if let Some(rest) = line.strip_prefix("=>") {
        return parse_link(rest.trim_start());
    }

    if let Some(rest) = line.strip_prefix("###") {
        return Line::Heading { level: 3, text: rest.trim_start().to_string() };
    }
    if let Some(rest) = line.strip_prefix("##") {
        return Line::Heading { level: 2, text: rest.trim_start().to_string() };
    }
    if let Some(rest) = line.strip_prefix('#') {
        return Line::Heading { level: 1, text: rest.trim_start().to_string() };
    }

    if let Some(rest) = line.strip_prefix('*') {
        if rest.is_empty() || rest.starts_with(' ') {
            return Line::ListItem(rest.trim_start().to_string());
        }
    }

    if let Some(rest) = line.strip_prefix('>') {
        return Line::Quote(rest.trim_start().to_string());
    }

    Line::Text(line.to_string())
}

fn parse_link(rest: &str) -> Line {
    match rest.split_once(char::is_whitespace) {
        Some((url, name)) => Line::Link { url: url.to_string(), name: Some(name.trim_start().to_string()) },
        None => Line::Link { url: rest.to_string(), name: None },
    }
}

/// Folds the preformat-toggle state across a sequence of lines, so a line
/// inside an open `\`\`\`` fence is always reported as [`Line::Preformatted`]
/// rather than reparsed as a heading, link, or quote.
#[derive(Debug, Default)]
pub struct GemtextReader {
    preformatted: bool,
}

impl GemtextReader {
    /// A fresh reader, starting outside any preformatted block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the reader is currently inside a preformatted block.
    pub fn is_preformatted(&self) -> bool {
        self.preformatted
    }

    /// Parses the next line, updating the toggle state first.
    pub fn parse(&mut self, line: &str) -> Line {
        if self.preformatted {
            if let Some(rest) = line.strip_prefix("```") {
                self.preformatted = false;
                let alt = if rest.is_empty() { None } else { Some(rest.to_string()) };
                return Line::PreformatToggle(alt);
            }
            return Line::Preformatted(line.to_string());
        }

        let parsed = parse_line(line);
        if let Line::PreformatToggle(_) = &parsed {
            self.preformatted = true;
        }
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_link_with_and_without_a_label() {
        assert_eq!(parse_line("=> gemini://example.com/ Example"), Line::Link {
            url: "gemini://example.com/".to_string(),
            name: Some("Example".to_string()),
        });
        assert_eq!(parse_line("=>gemini://example.com/"), Line::Link {
            url: "gemini://example.com/".to_string(),
            name: None,
        });
    }

    #[test]
    fn parses_headings_by_level() {
        assert_eq!(parse_line("# One"), Line::Heading { level: 1, text: "One".to_string() });
        assert_eq!(parse_line("## Two"), Line::Heading { level: 2, text: "Two".to_string() });
        assert_eq!(parse_line("### Three"), Line::Heading { level: 3, text: "Three".to_string() });
    }

    #[test]
    fn parses_list_items_and_quotes() {
        assert_eq!(parse_line("* item"), Line::ListItem("item".to_string()));
        assert_eq!(parse_line("> quoted"), Line::Quote("quoted".to_string()));
    }

    #[test]
    fn asterisk_without_space_is_plain_text() {
        assert_eq!(parse_line("*bold*"), Line::Text("*bold*".to_string()));
    }

    #[test]
    fn reader_folds_preformatted_block() {
        let mut reader = GemtextReader::new();
        assert_eq!(reader.parse("```alt text"), Line::PreformatToggle(Some("alt text".to_string())));
        assert!(reader.is_preformatted());
        assert_eq!(reader.parse("# not a heading"), Line::Preformatted("# not a heading".to_string()));
        assert_eq!(reader.parse("```"), Line::PreformatToggle(None));
        assert!(!reader.is_preformatted());
        assert_eq!(reader.parse("# a heading now"), Line::Heading { level: 1, text: "a heading now".to_string() });
    }
}
