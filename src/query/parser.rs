//! Key pattern parser
//!
//! # Supported Syntax
//!
//! ```text
//! pattern     := [type '@'] element+
//! element     := '*' | '\d' | '[' range ']' | '[' alts ']' | literal
//! range       := number '-' number
//! alts        := element+ (',' element+)*
//! literal     := (plain char | '\' char)+
//! ```
//!
//! A backslash escapes any special character (`* [ ] , \`); `\d` alone
//! stands for a decimal number.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{alpha1, char, digit1, satisfy},
    combinator::{map, map_res, opt, peek, recognize, value},
    multi::{fold_many1, many1, separated_list1},
    sequence::{delimited, pair, preceded, separated_pair, terminated},
    IResult,
};

use crate::query::ast::{Element, KeyPattern, TypeFilter};
use crate::query::error::{QueryError, QueryResult};

const SPECIAL: &[char] = &['*', '[', ']', ',', '\\'];

/// Parse a pattern string into a KeyPattern
pub fn parse_pattern(input: &str) -> QueryResult<KeyPattern> {
    let input = input.trim();

    let (remaining, (type_name, elements)) = match parse_full_pattern(input) {
        Ok(parsed) => parsed,
        Err(e) => return Err(QueryError::Parse(format!("'{}': {:?}", input, e))),
    };
    if !remaining.is_empty() {
        return Err(QueryError::Parse(format!(
            "Unexpected input after pattern: '{}'",
            remaining
        )));
    }

    validate_ranges(&elements)?;
    let data_type = type_name.map(TypeFilter::from_name).transpose()?;
    Ok(KeyPattern {
        data_type,
        elements,
    })
}

fn validate_ranges(elements: &[Element]) -> QueryResult<()> {
    for element in elements {
        match element {
            Element::IntRange { start, end } if start > end => {
                return Err(QueryError::InvalidRange(format!(
                    "start {} comes after end {}",
                    start, end
                )))
            }
            Element::FloatRange { start, end } if start > end => {
                return Err(QueryError::InvalidRange(format!(
                    "start {} comes after end {}",
                    start, end
                )))
            }
            Element::Alternatives(alts) => {
                for alt in alts {
                    validate_ranges(alt)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_full_pattern(input: &str) -> IResult<&str, (Option<&str>, Vec<Element>)> {
    pair(opt(parse_type_prefix), many1(parse_element))(input)
}

/// Parse a data type prefix like `TimeSeries@`
fn parse_type_prefix(input: &str) -> IResult<&str, &str> {
    terminated(alpha1, char('@'))(input)
}

fn parse_element(input: &str) -> IResult<&str, Element> {
    alt((
        value(Element::Any, char('*')),
        value(Element::Digits, tag("\\d")),
        parse_bracket,
        map(parse_literal, Element::Literal),
    ))(input)
}

/// Parse a run of plain or escaped characters
fn parse_literal(input: &str) -> IResult<&str, String> {
    fold_many1(
        alt((
            map(take_while1(|c: char| !SPECIAL.contains(&c)), str::to_string),
            map(preceded(char('\\'), satisfy(|c| c != 'd')), String::from),
        )),
        String::new,
        |mut acc, piece| {
            acc.push_str(&piece);
            acc
        },
    )(input)
}

fn parse_bracket(input: &str) -> IResult<&str, Element> {
    delimited(
        char('['),
        alt((terminated(parse_range, peek(char(']'))), parse_alternatives)),
        char(']'),
    )(input)
}

fn parse_number(input: &str) -> IResult<&str, &str> {
    recognize(pair(digit1, opt(pair(char('.'), digit1))))(input)
}

/// Parse `1-84` or `0.5-2.5`
fn parse_range(input: &str) -> IResult<&str, Element> {
    map_res(
        separated_pair(parse_number, char('-'), parse_number),
        |(start, end): (&str, &str)| -> Result<Element, String> {
            if start.contains('.') || end.contains('.') {
                Ok(Element::FloatRange {
                    start: start.parse::<f64>().map_err(|e| e.to_string())?,
                    end: end.parse::<f64>().map_err(|e| e.to_string())?,
                })
            } else {
                Ok(Element::IntRange {
                    start: start.parse::<i64>().map_err(|e| e.to_string())?,
                    end: end.parse::<i64>().map_err(|e| e.to_string())?,
                })
            }
        },
    )(input)
}

fn parse_alternatives(input: &str) -> IResult<&str, Element> {
    map(
        separated_list1(char(','), many1(parse_element)),
        Element::Alternatives,
    )(input)
}
