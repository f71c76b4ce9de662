use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take,
    character::complete::{char, digit1},
    combinator::{opt, recognize},
    error::{Error as NomError, ErrorKind},
    multi::many_till,
    sequence::{delimited, pair, preceded, terminated},
};
use std::collections::BTreeMap;

use crate::bencode_parser::errors::BencodeError;

type BenResult<'a> = IResult<&'a [u8], Value>;

/// Deepest list/dictionary nesting accepted before decoding gives up.
pub const MAX_DEPTH: usize = 64;

/// A decoded bencode value.
///
/// Dictionaries are kept in a `BTreeMap` so that re-encoding always emits
/// keys in the sorted order the format requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Integer(i64),
    List(Vec<Value>),
    Dictionary(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dictionary(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up `key` when this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|entries| entries.get(key))
    }

    fn parse_integer(start_inp: &[u8]) -> BenResult<'_> {
        let (inp, digits) = delimited(
            char('i'),
            recognize(pair(opt(char('-')), digit1)),
            char('e'),
        )
        .parse(start_inp)?;

        // digit1 only accepts ASCII digits, so this cannot fail
        let value_str = std::str::from_utf8(digits)
            .map_err(|_| failure(start_inp, ErrorKind::Digit))?;

        if value_str.starts_with("-0") || (value_str.starts_with('0') && value_str.len() > 1) {
            return Err(failure(start_inp, ErrorKind::Verify));
        }

        let value: i64 = value_str
            .parse()
            .map_err(|_| failure(start_inp, ErrorKind::TooLarge))?;

        Ok((inp, Value::Integer(value)))
    }

    fn parse_bytes(start_inp: &[u8]) -> BenResult<'_> {
        let (inp, length) = terminated(digit1, char(':')).parse(start_inp)?;

        let length: usize = std::str::from_utf8(length)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| failure(start_inp, ErrorKind::TooLarge))?;

        if length > inp.len() {
            return Err(failure(inp, ErrorKind::Eof));
        }

        let (inp, characters) = take(length).parse(inp)?;

        Ok((inp, Value::Bytes(characters.to_vec())))
    }

    fn parse_list(start_inp: &[u8], depth: usize) -> BenResult<'_> {
        let (inp, (items, _)) = preceded(
            char('l'),
            many_till(|i| Self::parse_value(i, depth + 1), char('e')),
        )
        .parse(start_inp)?;

        Ok((inp, Value::List(items)))
    }

    fn parse_dict(start_inp: &[u8], depth: usize) -> BenResult<'_> {
        let (inp, (pairs, _)) = preceded(
            char('d'),
            many_till(
                pair(Self::parse_bytes, |i| Self::parse_value(i, depth + 1)),
                char('e'),
            ),
        )
        .parse(start_inp)?;

        let entries = pairs
            .into_iter()
            .filter_map(|(key, value)| match key {
                // Keys are always byte strings
                Value::Bytes(key) => Some((key, value)),
                _ => None,
            })
            .collect();

        Ok((inp, Value::Dictionary(entries)))
    }

    fn parse_value(inp: &[u8], depth: usize) -> BenResult<'_> {
        if depth > MAX_DEPTH && matches!(inp.first(), Some(b'l' | b'd')) {
            return Err(failure(inp, ErrorKind::Count));
        }
        alt((
            Self::parse_bytes,
            Self::parse_integer,
            |i| Self::parse_list(i, depth),
            |i| Self::parse_dict(i, depth),
        ))
        .parse(inp)
    }
}

fn failure(input: &[u8], kind: ErrorKind) -> nom::Err<NomError<&[u8]>> {
    nom::Err::Failure(NomError::new(input, kind))
}

/// Parses exactly one bencoded value from `source`.
///
/// # Errors
/// Returns `Err` if `source` is not a single well-formed value, including when
/// bytes remain after it.
pub fn parse(source: &[u8]) -> Result<Value, BencodeError> {
    match Value::parse_value(source, 0) {
        Ok((rest, value)) if rest.is_empty() => Ok(value),
        Ok((rest, _)) => Err(BencodeError::TrailingData {
            offset: source.len() - rest.len(),
        }),
        Err(nom::Err::Incomplete(_)) => Err(BencodeError::UnexpectedEnd),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => {
            let offset = source.len() - e.input.len();
            Err(match e.code {
                _ if e.input.is_empty() => BencodeError::UnexpectedEnd,
                ErrorKind::Eof => BencodeError::UnexpectedEnd,
                ErrorKind::Verify => BencodeError::InvalidInteger { offset },
                ErrorKind::TooLarge => BencodeError::OutOfRange { offset },
                ErrorKind::Count => BencodeError::TooDeep { offset },
                _ => BencodeError::Syntax { offset },
            })
        }
    }
}
