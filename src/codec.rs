//! The wire protocol codec: request/response framing with strict length and
//! terminator rules.
//!
//! This module is a pure transformer over byte streams; it does no I/O
//! scheduling, deadline enforcement, or dispatch of its own; those belong to
//! [`crate::server`] and [`crate::client`].

use std::convert::TryFrom;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uriparse::URIReference;

use crate::error::Error;
use crate::types::{Meta, Status};

/// Maximum length, in bytes, of a request URL (excluding the `CRLF`
/// terminator).
pub const REQUEST_URI_MAX_LEN: usize = 1024;

async fn read_byte<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Option<u8>, Error> {
    let mut byte = [0u8; 1];
    let n = stream.read(&mut byte).await?;
    Ok((n != 0).then_some(byte[0]))
}

/// Reads one `CRLF`-terminated line, enforcing `max_len` on the bytes before
/// the terminator.
///
/// A bare EOF at any point (including right after a lone `CR`, before the
/// `LF` arrives) is reported as [`Error::Eof`]; a `CR` immediately followed
/// by a present byte other than `LF` is [`Error::InvalidRequest`] /
/// [`Error::InvalidResponse`] depending on `on_too_long`/`on_bad_terminator`.
async fn read_crlf_line<R: AsyncRead + Unpin>(
    stream: &mut R,
    max_len: usize,
    on_too_long: impl Fn() -> Error,
    on_bad_terminator: impl Fn() -> Error,
) -> Result<Vec<u8>, Error> {
    let mut line = Vec::new();

    loop {
        if line.len() > max_len {
            return Err(on_too_long());
        }

        match read_byte(stream).await? {
            None => return Err(Error::Eof),
            Some(b'\r') => match read_byte(stream).await? {
                None => return Err(Error::Eof),
                Some(b'\n') => return Ok(line),
                Some(_) => return Err(on_bad_terminator()),
            },
            Some(byte) => line.push(byte),
        }
    }
}

/// Reads a request frame: `<absolute-URL> CR LF`.
///
/// Returns the parsed, owned [`URIReference`]. Fails with
/// [`Error::InvalidRequest`] if the URL is malformed, over-length, contains
/// userinfo, or the terminator is wrong; fails with [`Error::Eof`] if the
/// peer closed before a complete frame arrived.
pub async fn read_request_uri<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<URIReference<'static>, Error> {
    let line = read_crlf_line(
        stream,
        REQUEST_URI_MAX_LEN,
        || Error::InvalidRequest(format!("request URI exceeds {} bytes", REQUEST_URI_MAX_LEN)),
        || Error::InvalidRequest("CR in request line not followed by LF".into()),
    )
    .await?;

    let uri = URIReference::try_from(&*line)
        .map_err(|err| Error::InvalidRequest(format!("malformed request URI: {}", err)))?
        .into_owned();

    let has_userinfo = uri
        .authority()
        .map(|authority| authority.username().is_some() || authority.password().is_some())
        .unwrap_or(false);

    if has_userinfo {
        return Err(Error::InvalidRequest("request URI must not contain userinfo".into()));
    }

    Ok(uri)
}

/// Writes a request frame.
///
/// Returns [`Error::InvalidRequest`] without writing any bytes if `uri`
/// contains userinfo or its serialized form exceeds
/// [`REQUEST_URI_MAX_LEN`] bytes.
pub async fn write_request_uri<W: AsyncWrite + Unpin>(
    stream: &mut W,
    uri: &URIReference<'_>,
) -> Result<(), Error> {
    let has_userinfo = uri
        .authority()
        .map(|authority| authority.username().is_some() || authority.password().is_some())
        .unwrap_or(false);

    if has_userinfo {
        return Err(Error::InvalidRequest("request URI must not contain userinfo".into()));
    }

    let rendered = uri.to_string();
    if rendered.len() > REQUEST_URI_MAX_LEN {
        return Err(Error::InvalidRequest(format!("request URI exceeds {} bytes", REQUEST_URI_MAX_LEN)));
    }

    stream.write_all(rendered.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await?;

    Ok(())
}

/// The default media type substituted for an empty `meta` on a class-2
/// response.
pub const DEFAULT_SUCCESS_META: &str = "text/gemini; charset=utf-8";

/// Reads a response header: `<2-digit-status> SP <meta> CR LF`.
///
/// Substitutes [`DEFAULT_SUCCESS_META`] when the status is class 2 and
/// `meta` is empty.
pub async fn read_response_header<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<(Status, Meta), Error> {
    let d1 = read_byte(stream).await?.ok_or(Error::Eof)?;
    let d2 = read_byte(stream).await?.ok_or(Error::Eof)?;

    if !d1.is_ascii_digit() || !d2.is_ascii_digit() {
        return Err(Error::InvalidResponse("status must be two ASCII digits".into()));
    }

    let code = (d1 - b'0') * 10 + (d2 - b'0');
    let status = Status::new(code)?;

    match read_byte(stream).await? {
        None => return Err(Error::Eof),
        Some(b' ') => {}
        Some(_) => return Err(Error::InvalidResponse("expected a single space after status".into())),
    }

    let meta_bytes = read_crlf_line(
        stream,
        Meta::MAX_LEN,
        || Error::InvalidResponse(format!("meta exceeds {} bytes", Meta::MAX_LEN)),
        || Error::InvalidResponse("CR in response header not followed by LF".into()),
    )
    .await?;

    let mut meta_str = String::from_utf8(meta_bytes)
        .map_err(|_| Error::InvalidResponse("meta is not valid UTF-8".into()))?;

    if status.class() == 2 && meta_str.is_empty() {
        meta_str = DEFAULT_SUCCESS_META.to_string();
    }

    let meta = Meta::from_wire(meta_str)?;

    Ok((status, meta))
}

/// Writes a response header: `<2-digit-status> SP <meta> CR LF`.
pub async fn write_response_header<W: AsyncWrite + Unpin>(
    stream: &mut W,
    status: Status,
    meta: &Meta,
) -> Result<(), Error> {
    let line = format!("{:02} {}\r\n", status.code(), meta.as_str());
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn status(code: u8) -> Status {
        Status::new(code).unwrap()
    }

    #[tokio::test]
    async fn reject_empty_response_as_eof() {
        let mut cursor = Cursor::new(b"".to_vec());
        let err = read_response_header(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::Eof));
    }

    #[tokio::test]
    async fn reject_bare_crlf_response() {
        let mut cursor = Cursor::new(b"\r\n".to_vec());
        let err = read_response_header(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn reject_single_digit_status() {
        let mut cursor = Cursor::new(b"1 bad\r\n".to_vec());
        let err = read_response_header(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn reject_truncated_after_cr() {
        let mut cursor = Cursor::new(b"20 text/gemini\r".to_vec());
        let err = read_response_header(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::Eof));
    }

    #[tokio::test]
    async fn reject_cr_without_lf() {
        let mut cursor = Cursor::new(b"20 text/gemini\rHello".to_vec());
        let err = read_response_header(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn default_meta_substituted_for_empty_success() {
        let mut cursor = Cursor::new(b"20 \r\n".to_vec());
        let (status, meta) = read_response_header(&mut cursor).await.unwrap();
        assert_eq!(status.code(), 20);
        assert_eq!(meta.as_str(), DEFAULT_SUCCESS_META);
    }

    #[tokio::test]
    async fn round_trips_header() {
        let mut buf = Vec::new();
        write_response_header(&mut buf, status(51), &Meta::new_lossy("Not found")).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let (status, meta) = read_response_header(&mut cursor).await.unwrap();
        assert_eq!(status.code(), 51);
        assert_eq!(meta.as_str(), "Not found");
    }

    #[tokio::test]
    async fn reject_oversized_request_uri() {
        let mut line: Vec<u8> = b"gemini://example.com/".to_vec();
        line.extend(std::iter::repeat(b'a').take(REQUEST_URI_MAX_LEN));
        line.extend_from_slice(b"\r\n");

        let mut cursor = Cursor::new(line);
        let err = read_request_uri(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn reject_request_with_userinfo() {
        let mut cursor = Cursor::new(b"gemini://user@example.com/\r\n".to_vec());
        let err = read_request_uri(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn round_trips_request_uri() {
        let mut buf = Vec::new();
        let uri = URIReference::try_from("gemini://example.com/foo").unwrap().into_owned();
        write_request_uri(&mut buf, &uri).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let read_back = read_request_uri(&mut cursor).await.unwrap();
        assert_eq!(read_back.to_string(), uri.to_string());
    }
}
