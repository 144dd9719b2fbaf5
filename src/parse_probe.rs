use http_types::Method;
use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, tag_no_case},
    character::complete::multispace0,
    error::{context, ErrorKind, ParseError, VerboseError},
    multi::{many0, many1},
    sequence::{delimited, terminated, tuple},
    AsChar, Err as NomErr, InputTakeAtPosition,
};

use crate::expr::{Probe, Scheme};

type IResult<I, O, E = (I, ErrorKind)> = Result<(I, O), NomErr<E>>;
type Res<T, U> = IResult<T, U, VerboseError<T>>;

fn alphanumerichyphen1<T>(i: T) -> Res<T, T>
where
    T: InputTakeAtPosition,
    <T as InputTakeAtPosition>::Item: AsChar,
{
    i.split_at_position1_complete(
        |item| {
            let char_item = item.as_char();
            char_item != '-' && !char_item.is_alphanum()
        },
        ErrorKind::AlphaNumeric,
    )
}

fn header_value1<T>(i: T) -> Res<T, T>
where
    T: InputTakeAtPosition,
    <T as InputTakeAtPosition>::Item: AsChar,
{
    i.split_at_position1_complete(
        |item| {
            let char_item = item.as_char();
            char_item == '\r' || char_item == '\n'
        },
        ErrorKind::AlphaNumeric,
    )
}

fn header(input: &str) -> Res<&str, (String, String)> {
    context(
        "header",
        tuple((
            terminated(many1(alphanumerichyphen1), tag(": ")),
            header_value1,
        )),
    )(input)
    .map(|(next_input, res)| (next_input, (res.0.join(""), res.1.trim().to_string())))
}

fn path(input: &str) -> Res<&str, String> {
    context("path", delimited(multispace0, is_not(" \r\n"), multispace0))(input)
        .map(|(next_input, res)| (next_input, res.to_string()))
}

fn scheme(input: &str) -> Res<&str, Scheme> {
    context(
        "scheme",
        alt((tag_no_case("HTTP/1.1"), tag_no_case("HTTP/1.0"))),
    )(input)
    .map(|(next_input, res)| (next_input, res.into()))
}

fn method(input: &str) -> Res<&str, Method> {
    context(
        "method",
        alt((tag_no_case("HEAD"), tag_no_case("GET"), tag_no_case("OPTIONS"))),
    )(input)
    .map(|(next_input, res)| {
        let method = match res.to_ascii_uppercase().as_str() {
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            _ => Method::Get,
        };
        (next_input, method)
    })
}

/// A combinator that takes a parser `inner` and produces a parser that also consumes both leading and
/// trailing whitespace, returning the output of `inner`.
fn ws<'a, F: 'a, O, E: ParseError<&'a str>>(
    inner: F,
) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where
    F: Fn(&'a str) -> IResult<&'a str, O, E>,
{
    delimited(multispace0, inner, multispace0)
}

/// Parses a probe's `.request` text: a request line followed by header lines.
pub fn parse_probe(input: &str) -> Res<&str, Probe> {
    context(
        "parse_probe",
        tuple((ws(method), ws(path), ws(scheme), many0(ws(header)))),
    )(input)
    .map(|(next_input, res)| {
        let (method, path, scheme, headers) = res;
        (
            next_input,
            Probe {
                method,
                scheme,
                path,
                headers,
            },
        )
    })
}
