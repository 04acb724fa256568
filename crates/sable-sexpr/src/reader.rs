//! Textual reader for the tree notation
//!
//! Reads trees like `(class A Object (defm x () (return 1)))` into [`Sexp`]
//! nodes, attaching `file:line:col` positions to every list. Atoms are
//! integers, symbols (including `:symbols`, `@ivars` and operator names
//! such as `[]=` or `<<`), and double-quoted byte strings.
//!
//! Float syntax is accepted but truncated to an integer, matching the
//! compiler's argument resolution.

use crate::sexp::{List, Pos, Sexp};
use thiserror::Error;

/// Errors produced while reading tree notation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("{file}:{line}:{col}: unexpected end of input")]
    UnexpectedEof { file: String, line: u32, col: u32 },

    #[error("{file}:{line}:{col}: unexpected character '{ch}'")]
    UnexpectedChar {
        file: String,
        line: u32,
        col: u32,
        ch: char,
    },

    #[error("{file}:{line}:{col}: unterminated string literal")]
    UnterminatedString { file: String, line: u32, col: u32 },

    #[error("{file}:{line}:{col}: malformed number '{text}'")]
    BadNumber {
        file: String,
        line: u32,
        col: u32,
        text: String,
    },
}

/// Parse every top-level form in `src`.
pub fn parse(src: &str, file: &str) -> Result<Vec<Sexp>, ReadError> {
    Reader::new(src, file).read_all()
}

/// Character-walking reader with line/column tracking.
pub struct Reader<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    file: String,
    line: u32,
    col: u32,
}

impl<'a> Reader<'a> {
    pub fn new(src: &'a str, file: &str) -> Self {
        Self {
            chars: src.chars().peekable(),
            file: file.to_string(),
            line: 1,
            col: 1,
        }
    }

    /// Read forms until end of input.
    pub fn read_all(&mut self) -> Result<Vec<Sexp>, ReadError> {
        let mut forms = Vec::new();
        loop {
            self.skip_trivia();
            if self.chars.peek().is_none() {
                return Ok(forms);
            }
            forms.push(self.read_form()?);
        }
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn skip_trivia(&mut self) {
        while let Some(&ch) = self.chars.peek() {
            if ch.is_whitespace() {
                self.bump();
            } else if ch == ';' {
                while let Some(&c) = self.chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.bump();
                }
            } else {
                break;
            }
        }
    }

    fn pos(&self) -> Pos {
        Pos::new(self.file.clone(), self.line, self.col)
    }

    fn eof(&self) -> ReadError {
        ReadError::UnexpectedEof {
            file: self.file.clone(),
            line: self.line,
            col: self.col,
        }
    }

    fn read_form(&mut self) -> Result<Sexp, ReadError> {
        self.skip_trivia();
        match self.chars.peek() {
            None => Err(self.eof()),
            Some('(') => self.read_list(),
            Some(')') => Err(ReadError::UnexpectedChar {
                file: self.file.clone(),
                line: self.line,
                col: self.col,
                ch: ')',
            }),
            Some('"') => self.read_string(),
            Some(&ch) if ch.is_ascii_digit() => self.read_number(),
            Some('-') => {
                // A '-' is a number only when a digit follows; otherwise it
                // is an operator symbol.
                let mut lookahead = self.chars.clone();
                lookahead.next();
                match lookahead.peek() {
                    Some(c) if c.is_ascii_digit() => self.read_number(),
                    _ => self.read_symbol(),
                }
            }
            Some(_) => self.read_symbol(),
        }
    }

    fn read_list(&mut self) -> Result<Sexp, ReadError> {
        let pos = self.pos();
        self.bump(); // '('
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            match self.chars.peek() {
                None => return Err(self.eof()),
                Some(')') => {
                    self.bump();
                    return Ok(Sexp::List(List::with_pos(items, pos)));
                }
                Some(_) => items.push(self.read_form()?),
            }
        }
    }

    fn read_string(&mut self) -> Result<Sexp, ReadError> {
        let start = self.pos();
        self.bump(); // '"'
        let mut bytes = Vec::new();
        loop {
            match self.bump() {
                None => {
                    return Err(ReadError::UnterminatedString {
                        file: start.file,
                        line: start.line,
                        col: start.col,
                    })
                }
                Some('"') => return Ok(Sexp::Str(bytes)),
                Some('\\') => match self.bump() {
                    None => {
                        return Err(ReadError::UnterminatedString {
                            file: start.file,
                            line: start.line,
                            col: start.col,
                        })
                    }
                    Some('n') => bytes.push(b'\n'),
                    Some('t') => bytes.push(b'\t'),
                    Some('r') => bytes.push(b'\r'),
                    Some('0') => bytes.push(0),
                    Some('\\') => bytes.push(b'\\'),
                    Some('"') => bytes.push(b'"'),
                    Some(other) => {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                    }
                },
                Some(ch) => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
    }

    fn read_number(&mut self) -> Result<Sexp, ReadError> {
        let pos = self.pos();
        let mut text = String::new();
        if self.chars.peek() == Some(&'-') {
            text.push('-');
            self.bump();
        }
        while let Some(&ch) = self.chars.peek() {
            if ch.is_ascii_digit() || ch == '.' {
                text.push(ch);
                self.bump();
            } else {
                break;
            }
        }
        // Float literals truncate to their integer part.
        let int_part = match text.split_once('.') {
            Some((head, _)) => head,
            None => text.as_str(),
        };
        int_part
            .parse::<i64>()
            .map(Sexp::Int)
            .map_err(|_| ReadError::BadNumber {
                file: pos.file,
                line: pos.line,
                col: pos.col,
                text,
            })
    }

    fn read_symbol(&mut self) -> Result<Sexp, ReadError> {
        let mut name = String::new();
        while let Some(&ch) = self.chars.peek() {
            if ch.is_whitespace() || ch == '(' || ch == ')' || ch == ';' || ch == '"' {
                break;
            }
            name.push(ch);
            self.bump();
        }
        debug_assert!(!name.is_empty());
        Ok(Sexp::Sym(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(src: &str) -> Sexp {
        let forms = parse(src, "test.sx").expect("parse");
        assert_eq!(forms.len(), 1, "expected one form in {:?}", src);
        forms.into_iter().next().unwrap()
    }

    #[test]
    fn test_atoms() {
        assert_eq!(one("42"), Sexp::Int(42));
        assert_eq!(one("-7"), Sexp::Int(-7));
        assert_eq!(one("foo"), Sexp::sym("foo"));
        assert_eq!(one(":sym"), Sexp::sym(":sym"));
        assert_eq!(one("@ivar"), Sexp::sym("@ivar"));
        assert_eq!(one("[]="), Sexp::sym("[]="));
        assert_eq!(one("<<"), Sexp::sym("<<"));
        assert_eq!(one("-"), Sexp::sym("-"));
    }

    #[test]
    fn test_float_truncates() {
        assert_eq!(one("3.99"), Sexp::Int(3));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(one(r#""a\nb""#), Sexp::str_lit(*b"a\nb"));
        assert_eq!(one(r#""q\"q""#), Sexp::str_lit(*b"q\"q"));
    }

    #[test]
    fn test_nested_lists() {
        let e = one("(if (eq x 1) (return 2))");
        assert!(e.is_form("if"));
        let l = e.as_list().unwrap();
        assert_eq!(l.items.len(), 3);
        assert!(l.items[1].is_form("eq"));
    }

    #[test]
    fn test_positions_attached() {
        let forms = parse("(do\n  (assign x 1))", "input.sx").unwrap();
        let outer = forms[0].as_list().unwrap();
        let outer_pos = outer.pos.as_ref().unwrap();
        assert_eq!((outer_pos.line, outer_pos.col), (1, 1));
        let inner = outer.items[1].as_list().unwrap();
        let inner_pos = inner.pos.as_ref().unwrap();
        assert_eq!(inner_pos.file, "input.sx");
        assert_eq!((inner_pos.line, inner_pos.col), (2, 3));
    }

    #[test]
    fn test_comments_skipped() {
        let forms = parse("; leading\n(do 1) ; trailing", "t.sx").unwrap();
        assert_eq!(forms.len(), 1);
    }

    #[test]
    fn test_unterminated_string() {
        let err = parse("\"abc", "t.sx").unwrap_err();
        assert!(matches!(err, ReadError::UnterminatedString { .. }));
    }

    #[test]
    fn test_stray_close_paren() {
        let err = parse(")", "t.sx").unwrap_err();
        assert!(matches!(err, ReadError::UnexpectedChar { ch: ')', .. }));
    }
}
