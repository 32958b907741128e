use btoi::btou;
use nom::{
    bytes::complete::{tag, take_while1},
    bytes::streaming::{take, take_until},
    character::complete::{char, digit1},
    character::streaming::crlf,
    combinator::{all_consuming, map_res, opt},
    sequence::{preceded, terminated, tuple},
    IResult,
};

use super::{ErrorKind, Response, Status, Value};

/// Splits one `\r\n`-terminated line off the front of `buf`.
fn line(buf: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(take_until("\r\n"), crlf)(buf)
}

fn status_line(line: &[u8]) -> Option<Status> {
    let status = match line {
        b"STORED" => Status::Stored,
        b"NOT_STORED" => Status::NotStored,
        b"DELETED" => Status::Deleted,
        b"NOT_FOUND" => Status::NotFound,
        b"ERROR" => Status::Error(ErrorKind::NonexistentCommand),
        _ => {
            if let Some(msg) = line.strip_prefix(b"CLIENT_ERROR ") {
                Status::Error(ErrorKind::Client(String::from_utf8_lossy(msg).into_owned()))
            } else if let Some(msg) = line.strip_prefix(b"SERVER_ERROR ") {
                Status::Error(ErrorKind::Server(String::from_utf8_lossy(msg).into_owned()))
            } else {
                return None;
            }
        }
    };
    Some(status)
}

fn is_key_char(chr: u8) -> bool {
    chr > 32 && chr < 127
}

struct ValueHeader<'a> {
    key: &'a [u8],
    flags: u32,
    len: usize,
    cas: Option<u64>,
}

// VALUE <key> <flags> <bytes> [<cas unique>]
fn value_header(line: &[u8]) -> IResult<&[u8], ValueHeader<'_>> {
    let (rest, (key, flags, len, cas)) = all_consuming(tuple((
        preceded(tag("VALUE "), take_while1(is_key_char)),
        preceded(char(' '), map_res(digit1, btou::<u32>)),
        preceded(char(' '), map_res(digit1, btou::<usize>)),
        opt(preceded(char(' '), map_res(digit1, btou::<u64>))),
    )))(line)?;

    Ok((
        rest,
        ValueHeader {
            key,
            flags,
            len,
            cas,
        },
    ))
}

fn reply(buf: &[u8]) -> IResult<&[u8], Response> {
    let (mut rest, mut current) = line(buf)?;
    if let Some(status) = status_line(current) {
        return Ok((rest, Response::Status(status)));
    }

    // Zero or more value blocks closed by END.
    let mut values = Vec::new();
    while current != b"END" {
        let (_, header) = value_header(current)?;
        let (after, data) = terminated(take(header.len), crlf)(rest)?;
        values.push(Value {
            key: header.key.to_vec(),
            cas: header.cas,
            flags: header.flags,
            data: data.to_vec(),
        });
        (rest, current) = line(after)?;
    }

    let values = if values.is_empty() { None } else { Some(values) };
    Ok((rest, Response::Data(values)))
}

/// Parses one complete reply from the front of `buf`.
///
/// Returns the number of bytes consumed alongside the reply, `None` when more data is needed.
pub(crate) fn parse_ascii_response(buf: &[u8]) -> Result<Option<(usize, Response)>, ErrorKind> {
    match reply(buf) {
        Ok((remaining, response)) => Ok(Some((buf.len() - remaining.len(), response))),
        Err(nom::Err::Incomplete(_)) => Ok(None),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            Err(ErrorKind::Protocol(Some(e.code.description().to_string())))
        }
    }
}
