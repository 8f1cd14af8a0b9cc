//! Client wire format
//!
//! Requests are single text lines (`PUT user:1 alice EX 60`); double quotes
//! group an argument containing spaces. Replies use RESP framing.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Option<String>),
    Array(Vec<RespValue>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RespCommand {
    pub command: String,
    pub args: Vec<String>,
}

impl RespValue {
    pub fn ok() -> RespValue {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn null() -> RespValue {
        RespValue::BulkString(None)
    }

    pub fn bulk(s: impl Into<String>) -> RespValue {
        RespValue::BulkString(Some(s.into()))
    }

    pub fn error(e: impl Into<String>) -> RespValue {
        RespValue::Error(e.into())
    }

    pub fn from_option(value: Option<String>) -> RespValue {
        RespValue::BulkString(value)
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "+{}\r\n", s),
            RespValue::Error(e) => write!(f, "-{}\r\n", e),
            RespValue::Integer(i) => write!(f, ":{}\r\n", i),
            RespValue::BulkString(Some(s)) => write!(f, "${}\r\n{}\r\n", s.len(), s),
            RespValue::BulkString(None) => write!(f, "$-1\r\n"),
            RespValue::Array(items) => {
                write!(f, "*{}\r\n", items.len())?;
                for item in items {
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
        }
    }
}

impl RespCommand {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into().to_uppercase(),
            args,
        }
    }
}

/// Split a request line into a command and its arguments
pub fn parse_command(input: &str) -> Result<RespCommand, String> {
    let mut parts = tokenize(input.trim())?;
    if parts.is_empty() {
        return Err("empty command".to_string());
    }
    let command = parts.remove(0);
    Ok(RespCommand::new(command, parts))
}

fn tokenize(input: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                quoted = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() || quoted {
                    tokens.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err("unterminated quote".to_string());
    }
    if !current.is_empty() || quoted {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Decodes RESP replies; used by the interactive client
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_value(src, 0)? {
            Some((value, consumed)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = io::Error;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(item.to_string().as_bytes());
        Ok(())
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Parse one value starting at `start`. Returns the value and the offset just
/// past it, or `None` if more bytes are needed.
fn parse_value(src: &[u8], start: usize) -> Result<Option<(RespValue, usize)>, io::Error> {
    if src.len() <= start {
        return Ok(None);
    }
    let Some(line_end) = find_crlf(src, start + 1) else {
        return Ok(None);
    };
    let line = String::from_utf8_lossy(&src[start + 1..line_end]).to_string();
    let next = line_end + 2;

    match src[start] {
        b'+' => Ok(Some((RespValue::SimpleString(line), next))),
        b'-' => Ok(Some((RespValue::Error(line), next))),
        b':' => {
            let value = line.parse::<i64>().map_err(|_| invalid("invalid integer"))?;
            Ok(Some((RespValue::Integer(value), next)))
        }
        b'$' => {
            let len = line.parse::<i64>().map_err(|_| invalid("invalid bulk string length"))?;
            if len == -1 {
                return Ok(Some((RespValue::BulkString(None), next)));
            }
            if len < 0 {
                return Err(invalid("invalid bulk string length"));
            }
            let data_end = next + len as usize;
            if src.len() < data_end + 2 {
                return Ok(None);
            }
            if &src[data_end..data_end + 2] != b"\r\n" {
                return Err(invalid("invalid bulk string format"));
            }
            let data = String::from_utf8_lossy(&src[next..data_end]).to_string();
            Ok(Some((RespValue::BulkString(Some(data)), data_end + 2)))
        }
        b'*' => {
            let len = line.parse::<i64>().map_err(|_| invalid("invalid array length"))?;
            if len < 0 {
                return Ok(Some((RespValue::Array(Vec::new()), next)));
            }
            let mut items = Vec::with_capacity(len as usize);
            let mut pos = next;
            for _ in 0..len {
                match parse_value(src, pos)? {
                    Some((item, end)) => {
                        items.push(item);
                        pos = end;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(items), pos)))
        }
        _ => Err(invalid("unknown RESP type")),
    }
}

fn find_crlf(src: &[u8], start: usize) -> Option<usize> {
    if src.len() < 2 {
        return None;
    }
    (start..src.len() - 1).find(|&i| src[i] == b'\r' && src[i + 1] == b'\n')
}
