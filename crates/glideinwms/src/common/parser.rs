use std::fmt::{Debug, Display, Formatter};

use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not};
use nom::character::complete::{char, multispace0, satisfy};
use nom::combinator::{map, recognize, value};
use nom::error::{ErrorKind, FromExternalError, ParseError};
use nom::multi::many0;
use nom::sequence::{delimited, pair, preceded};

pub enum ParserError<I> {
    Custom(anyhow::Error),
    Nom(I, ErrorKind),
}

impl<I: Debug> Debug for ParserError<I> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Custom(error) => f.write_fmt(format_args!("Semantic error at {error}")),
            Self::Nom(input, error) => f.write_fmt(format_args!(
                "Parser error at '{input:?}': expecting {error:?}"
            )),
        }
    }
}

impl<I> ParseError<I> for ParserError<I> {
    fn from_error_kind(input: I, kind: ErrorKind) -> Self {
        ParserError::Nom(input, kind)
    }

    fn append(_: I, _: ErrorKind, other: Self) -> Self {
        other
    }
}

impl<I: Display, E: Into<anyhow::Error>> FromExternalError<I, E> for ParserError<I> {
    fn from_external_error(input: I, _: ErrorKind, error: E) -> Self {
        ParserError::Custom(anyhow::anyhow!("'{}': {}", input, error.into()))
    }
}

pub(crate) fn format_parse_error<I: Debug>(error: nom::Err<ParserError<I>>) -> anyhow::Error {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => anyhow::anyhow!("{:?}", e),
        _ => anyhow::anyhow!(error.to_string()),
    }
}

pub type NomResult<'a, Ret> = IResult<&'a str, Ret, ParserError<&'a str>>;

/// Wraps `parser` so that it skips surrounding whitespace.
pub fn ws<'a, O, F>(parser: F) -> impl FnMut(&'a str) -> NomResult<'a, O>
where
    F: FnMut(&'a str) -> NomResult<'a, O>,
{
    delimited(multispace0, parser, multispace0)
}

pub fn p_identifier(input: &str) -> NomResult<&str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        many0(satisfy(|c| c.is_ascii_alphanumeric() || c == '_')),
    ))(input)
}

fn p_quoted(quote: char) -> impl FnMut(&str) -> NomResult<String> {
    move |input| {
        let stop = if quote == '"' { "\"\\" } else { "'\\" };
        let content = escaped_transform(
            is_not(stop),
            '\\',
            alt((
                value("\\", char('\\')),
                value("\"", char('"')),
                value("'", char('\'')),
                value("\n", char('n')),
                value("\t", char('t')),
            )),
        );
        alt((
            map(pair(char(quote), char(quote)), |_| String::new()),
            delimited(char(quote), content, char(quote)),
        ))(input)
    }
}

/// Single- or double-quoted string literal with backslash escapes.
pub fn p_string_literal(input: &str) -> NomResult<String> {
    alt((p_quoted('"'), p_quoted('\'')))(input)
}

/// Keyword that is not a prefix of a longer identifier.
pub fn p_keyword<'a>(keyword: &'static str) -> impl FnMut(&'a str) -> NomResult<'a, &'a str> {
    move |input| {
        let (rest, ident) = p_identifier(input)?;
        if ident == keyword {
            Ok((rest, ident))
        } else {
            Err(nom::Err::Error(ParserError::Nom(input, ErrorKind::Tag)))
        }
    }
}

pub fn p_symbol<'a>(symbol: char) -> impl FnMut(&'a str) -> NomResult<'a, char> {
    preceded(multispace0, char(symbol))
}
