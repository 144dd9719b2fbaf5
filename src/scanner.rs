use hexponent::FloatLiteral;
use std::collections::HashMap;
use std::fmt;

#[derive(Eq, PartialEq, Debug, Copy, Clone, Hash)]
pub enum TokenType {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Plus,
    Minus,
    Percent,
    Semicolon,
    Colon,
    Question,
    Slash,
    Star,

    // https://developer.fastly.com/reference/vcl/operators/
    // Conditional Operators
    Bang,
    And,
    Or,
    EqualEqual,
    BangEqual,
    Tilde,
    BangTilde,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // Assignment operators
    Equal,
    Addition,
    Subtraction,
    Multiplication,
    Division,
    Modulus,
    BitwiseOr,
    BitwiseAnd,
    BitwiseXor,
    LeftShift,
    RightShift,
    LeftRotate,
    RightRotate,
    LogicalAnd,
    LogicalOr,

    // Literals.
    Identifier,
    String,
    Integer,
    Float,
    AclEntry,

    // Keywords.
    Add,
    Synthetic,
    SyntheticBase64,
    Restart,
    Log,
    Remove,
    Esi,
    Error,
    Call,
    Else,
    ElseIf,
    False,
    Sub,
    If,
    Set,
    Unset,
    Return,
    True,
    Declare,
    Goto,
    HashData,
    Eof,
    Acl,
    Backend,
    Director,
    Include,
    Import,
    Table,
    Pragma,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Identifier(String),
    Str(String),
    Float(f64),
    Integer(i64),
    AclEntry(String, u8),
}

/// A lexed token. `col` is the 1-based column of the first character and
/// `offset` its byte offset into the source.
#[derive(Clone, PartialEq)]
pub struct Token {
    pub ty: TokenType,
    pub lexeme: String,
    pub literal: Option<Literal>,
    pub line: usize,
    pub col: usize,
    pub offset: usize,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token {{ ty: {:?}, lexeme: \"{}\", literal: {:?}, line: {:?}, col: {:?}}}",
            self.ty, self.lexeme, self.literal, self.line, self.col
        )
    }
}

/// Tokenizes VCL source. Lexing is total: characters the scanner does not
/// understand are dropped and malformed input surfaces later as a parse error.
/// The returned stream always ends with an `Eof` token.
pub fn scan_tokens(input: &str) -> Vec<Token> {
    let mut scanner = Scanner::new(input);
    scanner.scan_tokens();
    scanner.tokens
}

lazy_static::lazy_static! {
    static ref KEYWORDS: HashMap<&'static str, TokenType> = vec![
        ("add", TokenType::Add),
        ("call", TokenType::Call),
        ("declare", TokenType::Declare),
        ("error", TokenType::Error),
        ("esi", TokenType::Esi),
        ("else", TokenType::Else),
        ("elseif", TokenType::ElseIf),
        ("elsif", TokenType::ElseIf),
        ("false", TokenType::False),
        ("goto", TokenType::Goto),
        ("hash_data", TokenType::HashData),
        ("if", TokenType::If),
        ("import", TokenType::Import),
        ("include", TokenType::Include),
        ("log", TokenType::Log),
        ("remove", TokenType::Remove),
        ("restart", TokenType::Restart),
        ("return", TokenType::Return),
        ("set", TokenType::Set),
        ("synthetic.base64", TokenType::SyntheticBase64),
        ("synthetic", TokenType::Synthetic),
        ("sub", TokenType::Sub),
        ("unset", TokenType::Unset),
        ("true", TokenType::True),
        ("acl", TokenType::Acl),
        ("backend", TokenType::Backend),
        ("director", TokenType::Director),
        ("table", TokenType::Table),
        ("pragma", TokenType::Pragma),
    ]
    .into_iter()
    .collect();
}

struct Scanner<'a> {
    text: &'a str,
    source: &'a [u8],
    tokens: Vec<Token>,
    start: usize,
    current: usize,
    line: usize,
    line_start: usize,
    start_line: usize,
    start_col: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            source: text.as_bytes(),
            tokens: Vec::new(),
            start: 0,
            current: 0,
            line: 1,
            line_start: 0,
            start_line: 1,
            start_col: 1,
        }
    }

    fn scan_tokens(&mut self) {
        while !self.is_at_end() {
            self.start = self.current;
            self.start_line = self.line;
            self.start_col = self.current - self.line_start + 1;
            self.scan_token();
        }

        self.tokens.push(Token {
            ty: TokenType::Eof,
            lexeme: String::new(),
            literal: None,
            line: self.line,
            col: self.current - self.line_start + 1,
            offset: self.current,
        })
    }

    fn advance(&mut self) -> char {
        let c = char::from(self.source[self.current]);
        self.current += 1;
        if c == '\n' {
            self.line += 1;
            self.line_start = self.current;
        }
        c
    }

    fn scan_token(&mut self) {
        let c = self.advance();

        match c {
            '(' => self.add_token(TokenType::LeftParen),
            ')' => self.add_token(TokenType::RightParen),
            '{' => {
                if self.matches('"') {
                    self.long_string()
                } else if self.previous_token_is(TokenType::Synthetic) {
                    self.raw_block()
                } else {
                    self.add_token(TokenType::LeftBrace)
                }
            }
            '}' => self.add_token(TokenType::RightBrace),
            '[' => self.add_token(TokenType::LeftBracket),
            ']' => self.add_token(TokenType::RightBracket),
            ',' => self.add_token(TokenType::Comma),
            '.' => self.add_token(TokenType::Dot),
            '?' => self.add_token(TokenType::Question),
            '-' => {
                if self.matches('=') {
                    self.add_token(TokenType::Subtraction)
                } else {
                    self.add_token(TokenType::Minus)
                }
            }
            '%' => {
                if self.matches('=') {
                    self.add_token(TokenType::Modulus)
                } else {
                    self.add_token(TokenType::Percent)
                }
            }
            '^' => {
                if self.matches('=') {
                    self.add_token(TokenType::BitwiseXor)
                }
            }
            '+' => {
                if self.matches('=') {
                    self.add_token(TokenType::Addition)
                } else {
                    self.add_token(TokenType::Plus)
                }
            }
            ';' => self.add_token(TokenType::Semicolon),
            ':' => self.add_token(TokenType::Colon),
            '*' => {
                if self.matches('=') {
                    self.add_token(TokenType::Multiplication)
                } else {
                    self.add_token(TokenType::Star)
                }
            }
            '~' => self.add_token(TokenType::Tilde),
            '!' => {
                if self.matches('=') {
                    self.add_token(TokenType::BangEqual)
                } else if self.matches('~') {
                    self.add_token(TokenType::BangTilde)
                } else {
                    self.add_token(TokenType::Bang)
                }
            }
            '=' => {
                let matches_eq = self.matches('=');
                self.add_token(if matches_eq {
                    TokenType::EqualEqual
                } else {
                    TokenType::Equal
                })
            }
            '|' => {
                if self.matches('|') {
                    if self.matches('=') {
                        self.add_token(TokenType::LogicalOr)
                    } else {
                        self.add_token(TokenType::Or)
                    }
                } else if self.matches('=') {
                    self.add_token(TokenType::BitwiseOr)
                }
            }
            '&' => {
                if self.matches('&') {
                    if self.matches('=') {
                        self.add_token(TokenType::LogicalAnd)
                    } else {
                        self.add_token(TokenType::And)
                    }
                } else if self.matches('=') {
                    self.add_token(TokenType::BitwiseAnd)
                }
            }
            '<' => {
                if self.matches('=') {
                    self.add_token(TokenType::LessEqual)
                } else if self.peek() == '<' && self.peek_next() == '=' {
                    self.advance();
                    self.advance();
                    self.add_token(TokenType::LeftShift)
                } else {
                    self.add_token(TokenType::Less)
                }
            }
            '>' => {
                if self.matches('=') {
                    self.add_token(TokenType::GreaterEqual)
                } else if self.peek() == '>' && self.peek_next() == '=' {
                    self.advance();
                    self.advance();
                    self.add_token(TokenType::RightShift)
                } else {
                    self.add_token(TokenType::Greater)
                }
            }
            '/' => {
                if self.matches('=') {
                    self.add_token(TokenType::Division)
                } else if self.matches('/') {
                    self.skip_line();
                } else if self.matches('*') {
                    while !self.is_at_end() && !(self.peek() == '*' && self.peek_next() == '/') {
                        self.advance();
                    }
                    if !self.is_at_end() {
                        self.advance();
                        self.advance();
                    }
                } else {
                    self.add_token(TokenType::Slash)
                }
            }
            '#' => self.skip_line(),
            '"' => {
                if self.peek() == '"' && self.peek_next() == '"' {
                    self.advance();
                    self.advance();
                    self.triple_quoted_string()
                } else {
                    self.quoted_string('"')
                }
            }
            '\'' => self.quoted_string('\''),
            _ => {
                if Self::is_decimal_digit(c) {
                    self.number_or_duration()
                } else if Self::is_identifier_start(c) {
                    self.identifier_or_keyword()
                }
                // whitespace and anything unrecognised is dropped
            }
        }
    }

    fn is_identifier_start(c: char) -> bool {
        c.is_ascii_alphabetic() || c == '_'
    }

    fn is_decimal_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    fn is_hex_digit(c: char) -> bool {
        c.is_ascii_hexdigit()
    }

    fn is_alphanumericunderscoredash(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_' || c == '-'
    }

    fn skip_line(&mut self) {
        while self.peek() != '\n' && !self.is_at_end() {
            self.advance();
        }
    }

    fn previous_token_is(&self, ty: TokenType) -> bool {
        matches!(self.tokens.last(), Some(token) if token.ty == ty)
    }

    /// Identifiers absorb `.segment` and `:segment` continuations so that
    /// `req.http.X-Header` and `req.http.Cookie:session` are single tokens.
    fn identifier_or_keyword(&mut self) {
        loop {
            while Self::is_alphanumericunderscoredash(self.peek()) {
                self.advance();
            }
            let next = self.peek_next();
            let continues = match self.peek() {
                '.' => next.is_ascii_alphanumeric() || next == '_',
                ':' => Self::is_identifier_start(next),
                _ => false,
            };
            if !continues {
                break;
            }
            self.advance();
        }

        let literal_val = self.text_between(self.start, self.current);

        // a dotted member after a lone `.` is always a property name
        let token_type = if self.previous_token_is(TokenType::Dot) {
            TokenType::Identifier
        } else {
            match KEYWORDS.get(literal_val.as_str()) {
                Some(kw_token_type) => *kw_token_type,
                None if literal_val == "LF" => TokenType::String,
                None => match literal_val.as_str() {
                    "rol" | "ror" if self.peek() == '=' => {
                        self.advance();
                        if literal_val == "rol" {
                            TokenType::LeftRotate
                        } else {
                            TokenType::RightRotate
                        }
                    }
                    _ => TokenType::Identifier,
                },
            }
        };

        match token_type {
            TokenType::Identifier => self.add_token_literal(
                TokenType::Identifier,
                Some(Literal::Identifier(literal_val)),
            ),
            TokenType::String => {
                self.add_token_literal(TokenType::String, Some(Literal::Str("\n".to_string())))
            }
            _ => self.add_token(token_type),
        }
    }

    fn duration_unit_len(&self) -> usize {
        let unit_len = match (self.peek(), self.peek_next()) {
            ('m', 's') => 2,
            ('s' | 'm' | 'h' | 'd' | 'w' | 'y', _) => 1,
            _ => return 0,
        };
        if Self::is_alphanumericunderscoredash(self.peek_at(unit_len)) {
            return 0;
        }
        unit_len
    }

    /// Numbers directly followed by a time unit are re-emitted as string
    /// tokens carrying the literal text, e.g. `5m` becomes the string `"5m"`.
    fn number_or_duration(&mut self) {
        let is_hex = self.previous() == '0' && (self.peek() == 'x' || self.peek() == 'X');
        if is_hex {
            self.advance();
            while Self::is_hex_digit(self.peek()) {
                self.advance();
            }
        } else {
            while Self::is_decimal_digit(self.peek()) {
                self.advance();
            }
        }

        let mut is_float = false;
        if self.peek() == '.'
            && (Self::is_decimal_digit(self.peek_next())
                || (is_hex && Self::is_hex_digit(self.peek_next())))
        {
            is_float = true;
            self.advance();
            while Self::is_decimal_digit(self.peek()) || (is_hex && Self::is_hex_digit(self.peek()))
            {
                self.advance();
            }
        }

        if !is_hex {
            let unit_len = self.duration_unit_len();
            if unit_len > 0 {
                for _ in 0..unit_len {
                    self.advance();
                }
                let text = self.text_between(self.start, self.current);
                return self.add_token_literal(TokenType::String, Some(Literal::Str(text)));
            }
        }

        let exponent = if is_hex { 'p' } else { 'e' };
        if self.peek().to_ascii_lowercase() == exponent
            && (Self::is_decimal_digit(self.peek_next())
                || ((self.peek_next() == '-' || self.peek_next() == '+')
                    && Self::is_decimal_digit(self.peek_at(2))))
        {
            is_float = true;
            self.advance();
            if self.peek() == '-' || self.peek() == '+' {
                self.advance();
            }
            while Self::is_decimal_digit(self.peek()) {
                self.advance();
            }
        }

        let lit = self.text_between(self.start, self.current);
        if is_float {
            let num = if is_hex {
                match lit.parse::<FloatLiteral>() {
                    Ok(float_repr) => float_repr.convert::<f64>().inner(),
                    Err(_) => f64::NAN,
                }
            } else {
                lit.parse::<f64>().unwrap_or(f64::NAN)
            };
            return self.add_token_literal(TokenType::Float, Some(Literal::Float(num)));
        }

        let parsed = if is_hex {
            i64::from_str_radix(lit.trim_start_matches("0x").trim_start_matches("0X"), 16)
        } else {
            lit.parse::<i64>()
        };
        match parsed {
            Ok(num) => self.add_token_literal(TokenType::Integer, Some(Literal::Integer(num))),
            // too wide for an INTEGER, degrade to FLOAT
            Err(_) => {
                let num = lit.parse::<f64>().unwrap_or(f64::INFINITY);
                self.add_token_literal(TokenType::Float, Some(Literal::Float(num)))
            }
        }
    }

    fn quoted_string(&mut self, quote: char) {
        let mut value = String::new();
        let mut segment_start = self.current;
        while self.peek() != quote && !self.is_at_end() {
            if self.peek() == '\\' && self.current + 1 < self.source.len() {
                value.push_str(&self.text_between(segment_start, self.current));
                self.advance();
                let escaped = self.advance();
                match escaped {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '0' => value.push('\0'),
                    '"' | '\'' | '\\' => value.push(escaped),
                    // unknown escapes stay verbatim so regex classes like \d survive
                    _ => {
                        value.push('\\');
                        let ch = self
                            .text
                            .get(self.current - 1..)
                            .and_then(|rest| rest.chars().next())
                            .unwrap_or(char::REPLACEMENT_CHARACTER);
                        value.push(ch);
                        self.current += ch.len_utf8().saturating_sub(1);
                    }
                }
                segment_start = self.current;
                continue;
            }
            self.advance();
        }
        value.push_str(&self.text_between(segment_start, self.current));

        // an unterminated string runs to the end of input
        if !self.is_at_end() {
            self.advance();
        }

        if quote == '"' && self.peek() == '/' && Self::is_decimal_digit(self.peek_next()) {
            self.advance();
            let range_start = self.current;
            while Self::is_decimal_digit(self.peek()) {
                self.advance();
            }
            let range = self
                .text_between(range_start, self.current)
                .parse::<u8>()
                .unwrap_or(u8::MAX);
            return self.add_token_literal(TokenType::AclEntry, Some(Literal::AclEntry(value, range)));
        }

        self.add_token_literal(TokenType::String, Some(Literal::Str(value)))
    }

    fn triple_quoted_string(&mut self) {
        let content_start = self.current;
        while !self.is_at_end()
            && !(self.peek() == '"' && self.peek_next() == '"' && self.peek_at(2) == '"')
        {
            self.advance();
        }
        let value = self.text_between(content_start, self.current);
        for _ in 0..3 {
            if !self.is_at_end() {
                self.advance();
            }
        }
        self.add_token_literal(TokenType::String, Some(Literal::Str(value)))
    }

    fn long_string(&mut self) {
        let content_start = self.current;
        while !self.is_at_end() && !(self.peek() == '"' && self.peek_next() == '}') {
            self.advance();
        }
        let value = self.text_between(content_start, self.current);
        if !self.is_at_end() {
            self.advance();
            self.advance();
        }
        self.add_token_literal(TokenType::String, Some(Literal::Str(value)))
    }

    /// `synthetic { ... }` captures everything up to the matching brace.
    fn raw_block(&mut self) {
        let content_start = self.current;
        let mut depth = 1;
        while !self.is_at_end() {
            match self.peek() {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            self.advance();
        }
        let value = self.text_between(content_start, self.current).trim().to_string();
        if !self.is_at_end() {
            self.advance();
        }
        self.add_token_literal(TokenType::String, Some(Literal::Str(value)))
    }

    fn text_between(&self, from: usize, to: usize) -> String {
        match self.text.get(from..to) {
            Some(text) => text.to_string(),
            None => String::from_utf8_lossy(&self.source[from..to]).into_owned(),
        }
    }

    fn peek_next(&self) -> char {
        self.peek_at(1)
    }

    fn peek_at(&self, count: usize) -> char {
        if self.current + count >= self.source.len() {
            '\0'
        } else {
            char::from(self.source[self.current + count])
        }
    }

    fn peek(&self) -> char {
        self.peek_at(0)
    }

    fn previous(&self) -> char {
        if self.current == 0 {
            '\0'
        } else {
            char::from(self.source[self.current - 1])
        }
    }

    fn matches(&mut self, c: char) -> bool {
        if self.is_at_end() || self.peek() != c {
            return false;
        }
        self.advance();
        true
    }

    fn add_token(&mut self, token_type: TokenType) {
        self.add_token_literal(token_type, None)
    }

    fn add_token_literal(&mut self, token_type: TokenType, literal: Option<Literal>) {
        let text = self.text_between(self.start, self.current);

        self.tokens.push(Token {
            ty: token_type,
            lexeme: text,
            literal,
            line: self.start_line,
            col: self.start_col,
            offset: self.start,
        })
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(input: &str) -> Vec<TokenType> {
        scan_tokens(input).into_iter().map(|t| t.ty).collect()
    }

    #[test]
    fn test_single_tokens() {
        let cases = vec![
            ("(", TokenType::LeftParen),
            (")", TokenType::RightParen),
            (",", TokenType::Comma),
            ("{", TokenType::LeftBrace),
            ("}", TokenType::RightBrace),
            (".", TokenType::Dot),
            ("+", TokenType::Plus),
            ("-", TokenType::Minus),
            ("*", TokenType::Star),
            (";", TokenType::Semicolon),
            ("/", TokenType::Slash),
            ("!", TokenType::Bang),
            (":", TokenType::Colon),
            ("?", TokenType::Question),
            ("%", TokenType::Percent),
            ("-=", TokenType::Subtraction),
            ("%=", TokenType::Modulus),
            ("^=", TokenType::BitwiseXor),
            ("+=", TokenType::Addition),
            ("*=", TokenType::Multiplication),
            ("/=", TokenType::Division),
            ("~", TokenType::Tilde),
            ("!~", TokenType::BangTilde),
            ("!=", TokenType::BangEqual),
            ("=", TokenType::Equal),
            ("==", TokenType::EqualEqual),
            ("||=", TokenType::LogicalOr),
            ("||", TokenType::Or),
            ("|=", TokenType::BitwiseOr),
            ("&&=", TokenType::LogicalAnd),
            ("&&", TokenType::And),
            ("&=", TokenType::BitwiseAnd),
            (">=", TokenType::GreaterEqual),
            (">>=", TokenType::RightShift),
            ("<=", TokenType::LessEqual),
            ("<<=", TokenType::LeftShift),
            ("rol=", TokenType::LeftRotate),
            ("ror=", TokenType::RightRotate),
        ];
        for (input, expected) in cases {
            assert_eq!(types(input), vec![expected, TokenType::Eof], "input: {}", input);
        }
    }

    #[test]
    fn test_token_positions() {
        let tokens = scan_tokens("sub vcl_recv {\n  set req.http.a = \"test\";\n}");
        assert_eq!(
            tokens,
            vec![
                Token {
                    ty: TokenType::Sub,
                    lexeme: "sub".to_string(),
                    literal: None,
                    line: 1,
                    col: 1,
                    offset: 0,
                },
                Token {
                    ty: TokenType::Identifier,
                    lexeme: "vcl_recv".to_string(),
                    literal: Some(Literal::Identifier("vcl_recv".to_string())),
                    line: 1,
                    col: 5,
                    offset: 4,
                },
                Token {
                    ty: TokenType::LeftBrace,
                    lexeme: "{".to_string(),
                    literal: None,
                    line: 1,
                    col: 14,
                    offset: 13,
                },
                Token {
                    ty: TokenType::Set,
                    lexeme: "set".to_string(),
                    literal: None,
                    line: 2,
                    col: 3,
                    offset: 17,
                },
                Token {
                    ty: TokenType::Identifier,
                    lexeme: "req.http.a".to_string(),
                    literal: Some(Literal::Identifier("req.http.a".to_string())),
                    line: 2,
                    col: 7,
                    offset: 21,
                },
                Token {
                    ty: TokenType::Equal,
                    lexeme: "=".to_string(),
                    literal: None,
                    line: 2,
                    col: 18,
                    offset: 32,
                },
                Token {
                    ty: TokenType::String,
                    lexeme: "\"test\"".to_string(),
                    literal: Some(Literal::Str("test".to_string())),
                    line: 2,
                    col: 20,
                    offset: 34,
                },
                Token {
                    ty: TokenType::Semicolon,
                    lexeme: ";".to_string(),
                    literal: None,
                    line: 2,
                    col: 26,
                    offset: 40,
                },
                Token {
                    ty: TokenType::RightBrace,
                    lexeme: "}".to_string(),
                    literal: None,
                    line: 3,
                    col: 1,
                    offset: 42,
                },
                Token {
                    ty: TokenType::Eof,
                    lexeme: "".to_string(),
                    literal: None,
                    line: 3,
                    col: 2,
                    offset: 43,
                },
            ]
        );
    }

    #[test]
    fn test_hyphenated_and_namespaced_identifiers() {
        let tokens = scan_tokens("req.http.X-Forwarded-For req.http.Cookie:session std.director.select_backend");
        let literals: Vec<_> = tokens.iter().filter_map(|t| t.literal.clone()).collect();
        assert_eq!(
            literals,
            vec![
                Literal::Identifier("req.http.X-Forwarded-For".to_string()),
                Literal::Identifier("req.http.Cookie:session".to_string()),
                Literal::Identifier("std.director.select_backend".to_string()),
            ]
        );
    }

    #[test]
    fn test_label_colon_is_not_absorbed() {
        assert_eq!(
            types("done:\n"),
            vec![TokenType::Identifier, TokenType::Colon, TokenType::Eof]
        );
        assert_eq!(
            types("re.group.0"),
            vec![TokenType::Identifier, TokenType::Eof]
        );
    }

    #[test]
    fn test_durations_become_strings() {
        for (input, text) in [("5m", "5m"), ("3600s", "3600s"), ("250ms", "250ms"), ("1.5h", "1.5h"), ("2w", "2w"), ("1y", "1y")] {
            let tokens = scan_tokens(input);
            assert_eq!(tokens[0].ty, TokenType::String);
            assert_eq!(tokens[0].literal, Some(Literal::Str(text.to_string())));
        }
    }

    #[test]
    fn test_numbers() {
        assert_eq!(scan_tokens("42")[0].literal, Some(Literal::Integer(42)));
        assert_eq!(scan_tokens("0x1F")[0].literal, Some(Literal::Integer(31)));
        assert_eq!(scan_tokens("1.25")[0].literal, Some(Literal::Float(1.25)));
        assert_eq!(scan_tokens("1e3")[0].literal, Some(Literal::Float(1000.0)));
        assert_eq!(scan_tokens("0x1.8p1")[0].literal, Some(Literal::Float(3.0)));
        assert_eq!(
            types("-5"),
            vec![TokenType::Minus, TokenType::Integer, TokenType::Eof]
        );
    }

    #[test]
    fn test_strings() {
        assert_eq!(
            scan_tokens(r#""a\"b\n""#)[0].literal,
            Some(Literal::Str("a\"b\n".to_string()))
        );
        assert_eq!(
            scan_tokens(r#""^/api/\d+$""#)[0].literal,
            Some(Literal::Str("^/api/\\d+$".to_string()))
        );
        assert_eq!(
            scan_tokens("'single'")[0].literal,
            Some(Literal::Str("single".to_string()))
        );
        assert_eq!(
            scan_tokens(r#""""raw \n "quoted" text""""#)[0].literal,
            Some(Literal::Str("raw \\n \"quoted\" text".to_string()))
        );
        assert_eq!(
            scan_tokens(r#"{"long "string""}"#)[0].literal,
            Some(Literal::Str("long \"string\"".to_string()))
        );
        assert_eq!(
            scan_tokens("\"unterminated")[0].literal,
            Some(Literal::Str("unterminated".to_string()))
        );
    }

    #[test]
    fn test_unknown_escape_keeps_multibyte_char() {
        let tokens = scan_tokens("\"a\\é\\日b\" x");
        assert_eq!(tokens[0].literal, Some(Literal::Str("a\\é\\日b".to_string())));
        assert_eq!(tokens[1].lexeme, "x");
    }

    #[test]
    fn test_acl_entry() {
        assert_eq!(
            scan_tokens("\"192.168.0.0\"/24;")[0].literal,
            Some(Literal::AclEntry("192.168.0.0".to_string(), 24))
        );
    }

    #[test]
    fn test_synthetic_raw_block() {
        let tokens = scan_tokens("synthetic {<h1>{nested}</h1>};");
        assert_eq!(tokens[0].ty, TokenType::Synthetic);
        assert_eq!(tokens[1].ty, TokenType::String);
        assert_eq!(
            tokens[1].literal,
            Some(Literal::Str("<h1>{nested}</h1>".to_string()))
        );
        assert_eq!(tokens[2].ty, TokenType::Semicolon);
    }

    #[test]
    fn test_comments_and_unknown_characters_are_skipped() {
        assert_eq!(
            types("# comment\n// another\n/* block */ set @ $ x;"),
            vec![
                TokenType::Set,
                TokenType::Identifier,
                TokenType::Semicolon,
                TokenType::Eof
            ]
        );
    }

    #[test]
    fn test_keywords() {
        assert_eq!(types("synthetic.base64"), vec![TokenType::SyntheticBase64, TokenType::Eof]);
        assert_eq!(types("hash_data"), vec![TokenType::HashData, TokenType::Eof]);
        assert_eq!(
            types("declare local var.x STRING;"),
            vec![
                TokenType::Declare,
                TokenType::Identifier,
                TokenType::Identifier,
                TokenType::Identifier,
                TokenType::Semicolon,
                TokenType::Eof
            ]
        );
        assert_eq!(types("LF")[0], TokenType::String);
    }
}
