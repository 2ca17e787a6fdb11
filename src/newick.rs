//! Reading and writing phylogenetic trees in Newick format.
//!
//! A parsed tree is a recursive [`NewickNode`] with a name, a branch
//! length to its parent, and child subtrees. Names containing structural
//! characters or whitespace are single-quoted on output.

use crate::utils;

use std::fmt;
use std::io::Read;
use std::path::Path;

//-----------------------------------------------------------------------------

/// Characters that cannot appear in an unquoted Newick name.
pub const INVALID_CHARS: &str = "(){};,";

/// Returns `true` if the name must be quoted on output.
pub(crate) fn needs_quotes(name: &str) -> bool {
    name.chars().any(|ch| ch.is_whitespace() || INVALID_CHARS.contains(ch))
}

/// Writes a name, quoting it if necessary.
pub(crate) fn write_name(out: &mut String, name: &str) {
    if needs_quotes(name) {
        out.push('\'');
        out.push_str(name);
        out.push('\'');
    } else {
        out.push_str(name);
    }
}

//-----------------------------------------------------------------------------

/// A node of a rooted tree parsed from Newick format.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct NewickNode {
    /// Node label; may be empty.
    pub name: String,
    /// Branch length to the parent; `0.0` when absent.
    pub length: f64,
    /// Child subtrees, in input order.
    pub children: Vec<NewickNode>,
}

impl NewickNode {
    /// Parses a tree from Newick text ending in `;`.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut parser = Parser { bytes: text.as_bytes(), offset: 0 };
        let tree = parser.subtree()?;
        parser.skip_whitespace();
        if parser.next_byte() != Some(b';') {
            return Err(String::from("Expected ; at the end of the tree"));
        }
        parser.offset += 1;
        parser.skip_whitespace();
        if parser.offset != parser.bytes.len() {
            return Err(String::from("Trailing characters after the tree"));
        }
        Ok(tree)
    }

    /// Reads a tree from a file, which may be gzip-compressed.
    pub fn read<P: AsRef<Path>>(filename: P) -> Result<Self, String> {
        let mut reader = utils::open_file(&filename)?;
        let mut text = String::new();
        reader.read_to_string(&mut text).map_err(|err| {
            format!("Failed to read {}: {}", filename.as_ref().display(), err)
        })?;
        Self::parse(&text)
    }

    /// Returns `true` if this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Returns the tree in Newick format, including the final `;`.
    pub fn to_newick(&self) -> String {
        format!("{};", self)
    }
}

impl fmt::Display for NewickNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        write_subtree(&mut out, self, true);
        f.write_str(&out)
    }
}

fn write_subtree(out: &mut String, node: &NewickNode, is_root: bool) {
    if !node.children.is_empty() {
        out.push('(');
        for (i, child) in node.children.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_subtree(out, child, false);
        }
        out.push(')');
    }
    write_name(out, &node.name);
    if !is_root && node.length > 0.0 {
        out.push(':');
        out.push_str(&format!("{}", node.length));
    }
}

//-----------------------------------------------------------------------------

struct Parser<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Parser<'a> {
    fn next_byte(&self) -> Option<u8> {
        self.bytes.get(self.offset).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.next_byte().map_or(false, |b| b.is_ascii_whitespace()) {
            self.offset += 1;
        }
    }

    fn subtree(&mut self) -> Result<NewickNode, String> {
        self.skip_whitespace();
        let mut node = NewickNode::default();
        if self.next_byte() == Some(b'(') {
            self.offset += 1;
            loop {
                node.children.push(self.subtree()?);
                self.skip_whitespace();
                match self.next_byte() {
                    Some(b',') => self.offset += 1,
                    Some(b')') => {
                        self.offset += 1;
                        break;
                    }
                    _ => return Err(String::from("Expected , or ) in a group")),
                }
            }
        }
        self.skip_whitespace();
        node.name = self.name()?;
        self.skip_whitespace();
        if self.next_byte() == Some(b':') {
            self.offset += 1;
            node.length = self.length()?;
        }
        Ok(node)
    }

    fn name(&mut self) -> Result<String, String> {
        if self.next_byte() == Some(b'\'') {
            self.offset += 1;
            let start = self.offset;
            while let Some(b) = self.next_byte() {
                if b == b'\'' {
                    let name = String::from_utf8_lossy(&self.bytes[start..self.offset]).into_owned();
                    self.offset += 1;
                    return Ok(name);
                }
                self.offset += 1;
            }
            Err(String::from("Unterminated quoted name"))
        } else {
            let start = self.offset;
            while let Some(b) = self.next_byte() {
                let ch = char::from(b);
                if ch.is_whitespace() || INVALID_CHARS.contains(ch) || b == b':' {
                    break;
                }
                self.offset += 1;
            }
            Ok(String::from_utf8_lossy(&self.bytes[start..self.offset]).into_owned())
        }
    }

    fn length(&mut self) -> Result<f64, String> {
        self.skip_whitespace();
        let start = self.offset;
        while let Some(b) = self.next_byte() {
            if b.is_ascii_digit() || b == b'.' || b == b'-' || b == b'+' || b == b'e' || b == b'E' {
                self.offset += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.offset]).map_err(|_| {
            String::from("Invalid branch length")
        })?;
        text.parse().map_err(|_| format!("Invalid branch length: {}", text))
    }
}

//-----------------------------------------------------------------------------


//-----------------------------------------------------------------------------
