use std::sync::Arc;

use regex::Regex;

use crate::diagnostics::{CodeError, ErrorKind, Position, SourceSpan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Var,
    Function,
    Class,
    Extends,
    Constructor,
    Static,
    Operator,
    New,
    This,
    If,
    Else,
    While,
    Break,
    Continue,
    Return,
    True,
    False,
    Null,
}

impl Keyword {
    pub const ALL: [Keyword; 18] = [
        Keyword::Var,
        Keyword::Function,
        Keyword::Class,
        Keyword::Extends,
        Keyword::Constructor,
        Keyword::Static,
        Keyword::Operator,
        Keyword::New,
        Keyword::This,
        Keyword::If,
        Keyword::Else,
        Keyword::While,
        Keyword::Break,
        Keyword::Continue,
        Keyword::Return,
        Keyword::True,
        Keyword::False,
        Keyword::Null,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::Var => "var",
            Keyword::Function => "function",
            Keyword::Class => "class",
            Keyword::Extends => "extends",
            Keyword::Constructor => "constructor",
            Keyword::Static => "static",
            Keyword::Operator => "operator",
            Keyword::New => "new",
            Keyword::This => "this",
            Keyword::If => "if",
            Keyword::Else => "else",
            Keyword::While => "while",
            Keyword::Break => "break",
            Keyword::Continue => "continue",
            Keyword::Return => "return",
            Keyword::True => "true",
            Keyword::False => "false",
            Keyword::Null => "null",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Identifier,
    Number,
    String,
    Keyword(Keyword),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Ellipsis,
    Colon,
    Semicolon,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    DoubleAmpersand,
    DoublePipe,
    Bang,
    BangEqual,
    EqualEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Whitespace,
    Comment,
    Eof,
}

impl TokenKind {
    /// Human-readable form used in "expected ..." messages.
    pub fn describe(self) -> &'static str {
        match self {
            TokenKind::Identifier => "identifier",
            TokenKind::Number => "number",
            TokenKind::String => "string",
            TokenKind::Keyword(keyword) => keyword.as_str(),
            TokenKind::LParen => "`(`",
            TokenKind::RParen => "`)`",
            TokenKind::LBrace => "`{`",
            TokenKind::RBrace => "`}`",
            TokenKind::LBracket => "`[`",
            TokenKind::RBracket => "`]`",
            TokenKind::Comma => "`,`",
            TokenKind::Dot => "`.`",
            TokenKind::Ellipsis => "`...`",
            TokenKind::Colon => "`:`",
            TokenKind::Semicolon => "`;`",
            TokenKind::Assign => "`=`",
            TokenKind::Plus => "`+`",
            TokenKind::Minus => "`-`",
            TokenKind::Star => "`*`",
            TokenKind::Slash => "`/`",
            TokenKind::Percent => "`%`",
            TokenKind::Caret => "`^`",
            TokenKind::DoubleAmpersand => "`&&`",
            TokenKind::DoublePipe => "`||`",
            TokenKind::Bang => "`!`",
            TokenKind::BangEqual => "`!=`",
            TokenKind::EqualEqual => "`==`",
            TokenKind::Less => "`<`",
            TokenKind::LessEqual => "`<=`",
            TokenKind::Greater => "`>`",
            TokenKind::GreaterEqual => "`>=`",
            TokenKind::Whitespace => "whitespace",
            TokenKind::Comment => "comment",
            TokenKind::Eof => "end of input",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub span: SourceSpan,
}

/// How a rule recognises its token at the current position.
#[derive(Debug, Clone)]
pub enum Matcher {
    Literal(&'static str),
    Pattern(Regex),
    /// Opening and closing delimiters with an optional escape character.
    Delimited {
        open: &'static str,
        close: &'static str,
        escape: Option<char>,
    },
}

enum Measure {
    NoMatch,
    Length(usize),
    Unterminated,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub kind: TokenKind,
    pub matcher: Matcher,
    pub priority: u8,
    pub discard: bool,
}

impl Rule {
    pub fn literal(kind: TokenKind, text: &'static str) -> Self {
        Self::with_matcher(kind, Matcher::Literal(text))
    }

    pub fn pattern(kind: TokenKind, pattern: &str) -> Result<Self, regex::Error> {
        let anchored = Regex::new(&format!("^(?:{pattern})"))?;
        Ok(Self::with_matcher(kind, Matcher::Pattern(anchored)))
    }

    pub fn delimited(
        kind: TokenKind,
        open: &'static str,
        close: &'static str,
        escape: Option<char>,
    ) -> Self {
        Self::with_matcher(
            kind,
            Matcher::Delimited {
                open,
                close,
                escape,
            },
        )
    }

    fn with_matcher(kind: TokenKind, matcher: Matcher) -> Self {
        Self {
            kind,
            matcher,
            priority: 0,
            discard: false,
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Matched text is consumed but produces no token.
    pub fn discard(mut self) -> Self {
        self.discard = true;
        self
    }

    fn measure(&self, rest: &str) -> Measure {
        match &self.matcher {
            Matcher::Literal(text) => {
                if rest.starts_with(text) {
                    Measure::Length(text.len())
                } else {
                    Measure::NoMatch
                }
            }
            Matcher::Pattern(regex) => match regex.find(rest) {
                Some(found) if found.start() == 0 && !found.is_empty() => {
                    Measure::Length(found.end())
                }
                _ => Measure::NoMatch,
            },
            Matcher::Delimited {
                open,
                close,
                escape,
            } => {
                if !rest.starts_with(open) {
                    return Measure::NoMatch;
                }
                let mut offset = open.len();
                let mut chars = rest[offset..].chars();
                loop {
                    if rest[offset..].starts_with(close) {
                        return Measure::Length(offset + close.len());
                    }
                    let Some(ch) = chars.next() else {
                        return Measure::Unterminated;
                    };
                    offset += ch.len_utf8();
                    if Some(ch) == *escape {
                        match chars.next() {
                            Some(escaped) => offset += escaped.len_utf8(),
                            None => return Measure::Unterminated,
                        }
                    }
                }
            }
        }
    }
}

/// A table-driven tokenizer.
///
/// Rules are tried in groups of descending priority; inside a group the
/// longest match wins and ties go to the rule declared first.
#[derive(Debug, Clone)]
pub struct Lexer {
    rules: Vec<Rule>,
    groups: Vec<Vec<usize>>,
}

impl Lexer {
    /// The quill token table.
    pub fn new() -> Result<Self, regex::Error> {
        let mut rules = vec![
            Rule::pattern(TokenKind::Whitespace, r"\s+")?.discard(),
            Rule::pattern(TokenKind::Comment, r"//[^\n]*")?.discard(),
            Rule::delimited(TokenKind::Comment, "/*", "*/", None).discard(),
            Rule::delimited(TokenKind::String, "\"", "\"", Some('\\')),
            Rule::pattern(TokenKind::Number, r"[0-9]+(?:\.[0-9]+)?(?:[eE][+-]?[0-9]+)?")?,
        ];
        rules.extend(
            Keyword::ALL
                .iter()
                .map(|keyword| Rule::literal(TokenKind::Keyword(*keyword), keyword.as_str())),
        );
        rules.push(Rule::pattern(TokenKind::Identifier, r"[A-Za-z_][A-Za-z0-9_]*")?);
        rules.extend([
            Rule::literal(TokenKind::LParen, "("),
            Rule::literal(TokenKind::RParen, ")"),
            Rule::literal(TokenKind::LBrace, "{"),
            Rule::literal(TokenKind::RBrace, "}"),
            Rule::literal(TokenKind::LBracket, "["),
            Rule::literal(TokenKind::RBracket, "]"),
            Rule::literal(TokenKind::Comma, ","),
            Rule::literal(TokenKind::Ellipsis, "..."),
            Rule::literal(TokenKind::Dot, "."),
            Rule::literal(TokenKind::Colon, ":"),
            Rule::literal(TokenKind::Semicolon, ";"),
            Rule::literal(TokenKind::EqualEqual, "=="),
            Rule::literal(TokenKind::Assign, "="),
            Rule::literal(TokenKind::BangEqual, "!="),
            Rule::literal(TokenKind::Bang, "!"),
            Rule::literal(TokenKind::LessEqual, "<="),
            Rule::literal(TokenKind::Less, "<"),
            Rule::literal(TokenKind::GreaterEqual, ">="),
            Rule::literal(TokenKind::Greater, ">"),
            Rule::literal(TokenKind::Plus, "+"),
            Rule::literal(TokenKind::Minus, "-"),
            Rule::literal(TokenKind::Star, "*"),
            Rule::literal(TokenKind::Slash, "/"),
            Rule::literal(TokenKind::Percent, "%"),
            Rule::literal(TokenKind::Caret, "^"),
            Rule::literal(TokenKind::DoubleAmpersand, "&&"),
            Rule::literal(TokenKind::DoublePipe, "||"),
        ]);
        Ok(Self::with_rules(rules))
    }

    pub fn with_rules(rules: Vec<Rule>) -> Self {
        let mut priorities: Vec<u8> = rules.iter().map(|rule| rule.priority).collect();
        priorities.sort_unstable_by(|a, b| b.cmp(a));
        priorities.dedup();
        let groups = priorities
            .into_iter()
            .map(|priority| {
                rules
                    .iter()
                    .enumerate()
                    .filter(|(_, rule)| rule.priority == priority)
                    .map(|(index, _)| index)
                    .collect()
            })
            .collect();
        Self { rules, groups }
    }

    pub fn tokenize(&self, source: &str, source_name: &Arc<str>) -> Result<Vec<Token>, CodeError> {
        let mut tokens = Vec::new();
        let mut position = Position::start();
        while position.offset < source.len() {
            let rest = &source[position.offset..];
            let (rule, length) = self.select(rest, source_name, position)?;
            let lexeme = &rest[..length];
            let start = position;
            for ch in lexeme.chars() {
                position.advance(ch);
            }
            if !rule.discard {
                tokens.push(Token {
                    kind: rule.kind,
                    lexeme: lexeme.to_string(),
                    span: SourceSpan::new(Arc::clone(source_name), start, position),
                });
            }
        }
        tokens.push(Token {
            kind: TokenKind::Eof,
            lexeme: String::new(),
            span: SourceSpan::new(Arc::clone(source_name), position, position),
        });
        Ok(tokens)
    }

    fn select(
        &self,
        rest: &str,
        source_name: &Arc<str>,
        position: Position,
    ) -> Result<(&Rule, usize), CodeError> {
        for group in &self.groups {
            let mut best: Option<(&Rule, usize)> = None;
            for &index in group {
                let rule = &self.rules[index];
                match rule.measure(rest) {
                    Measure::NoMatch => {}
                    Measure::Length(length) => {
                        if best.is_none_or(|(_, current)| length > current) {
                            best = Some((rule, length));
                        }
                    }
                    Measure::Unterminated => {
                        let end = end_of(rest, position);
                        return Err(CodeError::new(
                            ErrorKind::IllegalChar,
                            format!("unterminated {}", rule.kind.describe()),
                        )
                        .with_span(SourceSpan::new(Arc::clone(source_name), position, end)));
                    }
                }
            }
            if let Some(found) = best {
                return Ok(found);
            }
        }
        let ch = rest.chars().next().unwrap_or('\0');
        let mut end = position;
        end.advance(ch);
        Err(
            CodeError::new(ErrorKind::IllegalChar, format!("unexpected character `{ch}`"))
                .with_span(SourceSpan::new(Arc::clone(source_name), position, end)),
        )
    }
}

fn end_of(rest: &str, mut position: Position) -> Position {
    for ch in rest.chars() {
        position.advance(ch);
    }
    position
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<Token> {
        Lexer::new()
            .unwrap()
            .tokenize(source, &Arc::from("test"))
            .unwrap()
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).into_iter().map(|token| token.kind).collect()
    }

    #[test]
    fn keywords_beat_identifiers_on_ties_only() {
        assert_eq!(
            kinds("if iffy"),
            vec![
                TokenKind::Keyword(Keyword::If),
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn longest_operator_wins() {
        assert_eq!(
            kinds("a <= b == c ...d"),
            vec![
                TokenKind::Identifier,
                TokenKind::LessEqual,
                TokenKind::Identifier,
                TokenKind::EqualEqual,
                TokenKind::Identifier,
                TokenKind::Ellipsis,
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn comments_and_whitespace_are_discarded() {
        assert_eq!(
            kinds("1 // line\n/* block\n */ 2"),
            vec![TokenKind::Number, TokenKind::Number, TokenKind::Eof]
        );
    }

    #[test]
    fn strings_honor_escapes() {
        let tokens = lex(r#""say \"hi\"""#);
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].lexeme, r#""say \"hi\"""#);
    }

    #[test]
    fn spans_track_lines_and_columns() {
        let tokens = lex("var x\n  = 10;");
        let ten = &tokens[3];
        assert_eq!(ten.lexeme, "10");
        assert_eq!(ten.span.start.line, 2);
        assert_eq!(ten.span.start.column, 5);
        assert_eq!(ten.span.end.offset, 11);
    }

    #[test]
    fn token_spans_tile_the_source_in_order() {
        let source = "var total = 1.5 * (x + 2); // done";
        let tokens = lex(source);
        let mut last_end = 0;
        for token in &tokens {
            assert!(token.span.start.offset >= last_end);
            assert!(token.span.end.offset <= source.len());
            if token.kind != TokenKind::Eof {
                assert_eq!(&source[token.span.start.offset..token.span.end.offset], token.lexeme);
            }
            last_end = token.span.end.offset;
        }
    }

    #[test]
    fn unterminated_string_is_illegal_char() {
        let error = Lexer::new()
            .unwrap()
            .tokenize("\"abc", &Arc::from("test"))
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::IllegalChar);
        assert!(error.message.contains("unterminated"));
    }

    #[test]
    fn unknown_character_is_illegal_char() {
        let error = Lexer::new()
            .unwrap()
            .tokenize("var @", &Arc::from("test"))
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::IllegalChar);
        assert_eq!(error.span.unwrap().start.column, 5);
    }

    #[test]
    fn higher_priority_group_is_tried_first() {
        let lexer = Lexer::with_rules(vec![
            Rule::pattern(TokenKind::Identifier, "[a-z]+").unwrap(),
            Rule::literal(TokenKind::Keyword(Keyword::If), "if").priority(1),
        ]);
        let tokens = lexer.tokenize("iffy", &Arc::from("test")).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Keyword(Keyword::If));
        assert_eq!(tokens[1].lexeme, "fy");
    }
}
