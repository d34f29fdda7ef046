//! Source anchors attached to tree nodes and diagnostics

use serde::{Deserialize, Serialize};

/// A Snap source file, indexed by line for diagnostic rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub text: String,
    line_starts: Vec<usize>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let line_starts = std::iter::once(0)
            .chain(
                text.bytes()
                    .enumerate()
                    .filter(|(_, b)| *b == b'\n')
                    .map(|(i, _)| i + 1),
            )
            .collect();
        Self {
            name: name.into(),
            text,
            line_starts,
        }
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// 1-based line and column of a byte offset
    pub fn location(&self, offset: usize) -> Location {
        let line = self
            .line_starts
            .binary_search(&offset)
            .unwrap_or_else(|i| i.saturating_sub(1));
        Location {
            line: line + 1,
            column: offset - self.line_starts[line] + 1,
            offset,
        }
    }

    /// Text of a 1-based line, without the trailing newline
    pub fn line(&self, line_number: usize) -> Option<&str> {
        if line_number == 0 || line_number > self.line_count() {
            return None;
        }
        let start = self.line_starts[line_number - 1];
        let end = self
            .line_starts
            .get(line_number)
            .map(|next| next - 1)
            .unwrap_or(self.text.len());
        self.text.get(start..end)
    }
}

/// Byte range in the source a node was parsed from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn merge(&self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Union of two optional anchors
    pub fn union(a: Option<Span>, b: Option<Span>) -> Option<Span> {
        match (a, b) {
            (Some(a), Some(b)) => Some(a.merge(b)),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_file_location() {
        let file = SourceFile::new("main.snap", "var a = 1\nlet b = a\n");
        assert_eq!(file.location(0), Location { line: 1, column: 1, offset: 0 });
        assert_eq!(file.location(14), Location { line: 2, column: 5, offset: 14 });
        assert_eq!(file.line(2), Some("let b = a"));
        assert_eq!(file.line(9), None);
    }

    #[test]
    fn test_span_union() {
        let a = Some(Span::new(5, 10));
        let b = Some(Span::new(8, 15));
        assert_eq!(Span::union(a, b), Some(Span::new(5, 15)));
        assert_eq!(Span::union(None, b), b);
        assert_eq!(Span::union(None, None), None);
    }
}
