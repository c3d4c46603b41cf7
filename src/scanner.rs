use crate::error::LinkError;

/// Characters a token may be pushed back through; overflow is fatal.
pub const PUSHBACK_CAPACITY: usize = 100;

/// Radix selector characters accepted after a leading `0` in a number.
const RADIX_CHARACTERS: &[u8] = b"bB@oOqQdDxXhH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Operator,
    Identifier,
    Number,
    /// A body consisting only of hex-digit letters; may be either an
    /// identifier or a number depending on context.
    IdOrNumber,
    Newline,
    StreamEnd,
    Comment,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Assign,
    Plus,
    Minus,
    Times,
    Div,
    Mod,
    ShiftLeft,
    ShiftRight,
    Or,
    And,
    Complement,
    Other,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub operator: Option<Operator>,
}

impl Token {
    fn from_char(kind: TokenKind, ch: u8) -> Self {
        Self {
            kind,
            text: (ch as char).to_string(),
            operator: None,
        }
    }

    #[must_use]
    pub fn is_identifier(&self) -> bool {
        matches!(self.kind, TokenKind::Identifier | TokenKind::IdOrNumber)
    }

    #[must_use]
    pub fn is_number(&self) -> bool {
        matches!(self.kind, TokenKind::Number | TokenKind::IdOrNumber)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharKind {
    WhiteSpace,
    Digit,
    /// `A`-`F` / `a`-`f`: hex digit or identifier letter.
    DigitOrLetter,
    Letter,
    Operator,
    Newline,
    Comment,
    Other,
}

fn char_kind(ch: u8) -> CharKind {
    match ch {
        b' ' | b'\t' | b'\x0c' => CharKind::WhiteSpace,
        b'0'..=b'9' => CharKind::Digit,
        b'A'..=b'F' | b'a'..=b'f' => CharKind::DigitOrLetter,
        b'G'..=b'Z' | b'g'..=b'z' | b'_' | b'.' | b'$' => CharKind::Letter,
        b'=' | b'+' | b'-' | b'*' | b'/' | b'%' | b'<' | b'>' | b'|' | b'&' | b'^' => {
            CharKind::Operator
        }
        b'\n' => CharKind::Newline,
        b';' => CharKind::Comment,
        _ => CharKind::Other,
    }
}

/// Pluggable character input for the scanner.
pub trait CharSource {
    /// Next raw character, or `None` at end of the whole stream.
    fn next_char(&mut self) -> Result<Option<u8>, LinkError>;
}

/// Character source over a single in-memory line (no trailing newline).
#[derive(Debug)]
pub struct StringSource {
    bytes: Vec<u8>,
    position: usize,
}

impl StringSource {
    #[must_use]
    pub fn new(text: &str) -> Self {
        Self {
            bytes: text.as_bytes().to_vec(),
            position: 0,
        }
    }
}

impl CharSource for StringSource {
    fn next_char(&mut self) -> Result<Option<u8>, LinkError> {
        let ch = self.bytes.get(self.position).copied();
        if ch.is_some() {
            self.position += 1;
        }
        Ok(ch)
    }
}

/// Tokenizer over a [`CharSource`] with a bounded character pushback stack.
#[derive(Debug)]
pub struct Scanner<S> {
    source: S,
    pushback: Vec<u8>,
}

impl<S: CharSource> Scanner<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            pushback: Vec::new(),
        }
    }

    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    fn get_char(&mut self) -> Result<Option<u8>, LinkError> {
        match self.pushback.pop() {
            Some(ch) => Ok(Some(ch)),
            None => self.source.next_char(),
        }
    }

    fn unget_char(&mut self, ch: u8) -> Result<(), LinkError> {
        if self.pushback.len() == PUSHBACK_CAPACITY {
            return Err(LinkError::PushbackOverflow);
        }
        self.pushback.push(ch);
        Ok(())
    }

    /// Un-reads a whole token by pushing its characters back.
    pub fn unget_token(&mut self, token: &Token) -> Result<(), LinkError> {
        for &ch in token.text.as_bytes().iter().rev() {
            self.unget_char(ch)?;
        }
        Ok(())
    }

    pub fn next_token(&mut self) -> Result<Token, LinkError> {
        loop {
            let Some(ch) = self.get_char()? else {
                return Ok(Token {
                    kind: TokenKind::StreamEnd,
                    text: String::new(),
                    operator: None,
                });
            };

            return Ok(match char_kind(ch) {
                CharKind::WhiteSpace => continue,
                CharKind::Digit => {
                    self.unget_char(ch)?;
                    self.scan_number()?
                }
                CharKind::Letter => {
                    self.unget_char(ch)?;
                    self.scan_identifier()?
                }
                CharKind::DigitOrLetter => {
                    self.unget_char(ch)?;
                    self.scan_ambiguous()?
                }
                CharKind::Operator => {
                    self.unget_char(ch)?;
                    self.scan_operator()?
                }
                CharKind::Newline => Token::from_char(TokenKind::Newline, ch),
                CharKind::Comment => Token::from_char(TokenKind::Comment, ch),
                CharKind::Other => Token::from_char(TokenKind::Other, ch),
            });
        }
    }

    fn scan_identifier(&mut self) -> Result<Token, LinkError> {
        let mut text = String::new();
        loop {
            match self.get_char()? {
                Some(ch)
                    if matches!(
                        char_kind(ch),
                        CharKind::Letter | CharKind::DigitOrLetter | CharKind::Digit
                    ) =>
                {
                    text.push(ch as char);
                }
                Some(ch) => {
                    self.unget_char(ch)?;
                    break;
                }
                None => break,
            }
        }
        Ok(Token {
            kind: TokenKind::Identifier,
            text,
            operator: None,
        })
    }

    fn scan_number(&mut self) -> Result<Token, LinkError> {
        let first = self.get_char()?.unwrap_or(b'0');
        let mut text = String::new();
        text.push(first as char);

        if first == b'0' {
            // A radix selector may follow a leading zero.
            match self.get_char()? {
                Some(ch) if RADIX_CHARACTERS.contains(&ch) => {
                    text.push(ch.to_ascii_uppercase() as char);
                }
                Some(ch) => self.unget_char(ch)?,
                None => {}
            }
        }

        loop {
            match self.get_char()? {
                Some(ch) if matches!(char_kind(ch), CharKind::Digit | CharKind::DigitOrLetter) => {
                    text.push(ch as char);
                }
                Some(ch) => {
                    self.unget_char(ch)?;
                    break;
                }
                None => break,
            }
        }
        Ok(Token {
            kind: TokenKind::Number,
            text,
            operator: None,
        })
    }

    fn scan_ambiguous(&mut self) -> Result<Token, LinkError> {
        let mut kind = TokenKind::IdOrNumber;
        let mut text = String::new();
        loop {
            match self.get_char()? {
                Some(ch) if char_kind(ch) == CharKind::Letter => {
                    kind = TokenKind::Identifier;
                    text.push(ch as char);
                }
                Some(ch) if matches!(char_kind(ch), CharKind::Digit | CharKind::DigitOrLetter) => {
                    text.push(ch as char);
                }
                Some(ch) => {
                    self.unget_char(ch)?;
                    break;
                }
                None => break,
            }
        }
        Ok(Token {
            kind,
            text,
            operator: None,
        })
    }

    fn scan_operator(&mut self) -> Result<Token, LinkError> {
        let ch = self.get_char()?.unwrap_or(b' ');
        let mut text = String::new();
        text.push(ch as char);

        if ch == b'<' || ch == b'>' {
            // No relational operators in this language; only doubled shifts.
            match self.get_char()? {
                Some(next) if next == ch => text.push(next as char),
                Some(next) => {
                    self.unget_char(next)?;
                    return Ok(Token {
                        kind: TokenKind::Other,
                        text,
                        operator: None,
                    });
                }
                None => {
                    return Ok(Token {
                        kind: TokenKind::Other,
                        text,
                        operator: None,
                    });
                }
            }
        }

        let operator = match ch {
            b'=' => Operator::Assign,
            b'+' => Operator::Plus,
            b'-' => Operator::Minus,
            b'*' => Operator::Times,
            b'/' => Operator::Div,
            b'%' => Operator::Mod,
            b'<' => Operator::ShiftLeft,
            b'>' => Operator::ShiftRight,
            b'|' => Operator::Or,
            b'&' => Operator::And,
            b'^' => Operator::Complement,
            _ => Operator::Other,
        };
        Ok(Token {
            kind: TokenKind::Operator,
            text,
            operator: Some(operator),
        })
    }
}

/// Tokenizes a single line, excluding the terminating `StreamEnd` token.
pub fn tokenize_line(line: &str) -> Result<Vec<Token>, LinkError> {
    let mut scanner = Scanner::new(StringSource::new(line));
    let mut tokens = Vec::new();
    loop {
        let token = scanner.next_token()?;
        if token.kind == TokenKind::StreamEnd {
            return Ok(tokens);
        }
        tokens.push(token);
    }
}

#[test]
fn test_basic_tokens() {
    let tokens = tokenize_line("A _CODE size 1F flags 0").unwrap();
    let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TokenKind::Identifier,
            TokenKind::Identifier,
            TokenKind::Identifier,
            TokenKind::Number,
            TokenKind::Identifier,
            TokenKind::Number,
        ]
    );
    assert_eq!(tokens[1].text, "_CODE");
    assert_eq!(tokens[3].text, "1F");
}

#[test]
fn test_radix_prefix_is_normalized() {
    let tokens = tokenize_line("0x1f 0B101 0q17").unwrap();
    assert_eq!(tokens[0].text, "0X1f");
    assert_eq!(tokens[1].text, "0B101");
    assert_eq!(tokens[2].text, "0Q17");
    assert!(tokens.iter().all(|t| t.kind == TokenKind::Number));
}

#[test]
fn test_ambiguous_becomes_identifier() {
    let tokens = tokenize_line("face facet").unwrap();
    assert_eq!(tokens[0].kind, TokenKind::IdOrNumber);
    assert_eq!(tokens[1].kind, TokenKind::Identifier);
}

#[test]
fn test_shift_operators_must_be_doubled() {
    let tokens = tokenize_line("a << b < c").unwrap();
    assert_eq!(tokens[1].kind, TokenKind::Operator);
    assert_eq!(tokens[1].operator, Some(Operator::ShiftLeft));
    assert_eq!(tokens[3].kind, TokenKind::Other);
}

#[test]
fn test_unget_token_replays_characters() {
    let mut scanner = Scanner::new(StringSource::new("hello= 12"));
    let first = scanner.next_token().unwrap();
    assert_eq!(first.text, "hello");
    scanner.unget_token(&first).unwrap();
    let again = scanner.next_token().unwrap();
    assert_eq!(again.text, "hello");
    assert_eq!(scanner.next_token().unwrap().kind, TokenKind::Operator);
    assert_eq!(scanner.next_token().unwrap().text, "12");
}

#[test]
fn test_pushback_overflow_is_fatal() {
    let mut scanner = Scanner::new(StringSource::new(""));
    for i in 0..PUSHBACK_CAPACITY {
        assert!(scanner.unget_char(b'a' + (i % 26) as u8).is_ok());
    }
    assert!(matches!(
        scanner.unget_char(b'z'),
        Err(LinkError::PushbackOverflow)
    ));
}

#[test]
fn test_comment_and_newline() {
    let mut scanner = Scanner::new(StringSource::new("; remark\nX"));
    assert_eq!(scanner.next_token().unwrap().kind, TokenKind::Comment);
    // the comment body is left on the stream; the parser skips to newline
    while scanner.next_token().unwrap().kind != TokenKind::Newline {}
    assert_eq!(scanner.next_token().unwrap().text, "X");
}
