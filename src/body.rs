// mitm_injector::body
//
// Byte-level edges of the pipeline.  Turns a response body into text
// (content-encoding, charset) and turns mutated text back into a body with
// matching framing headers.
//
// Supported content encodings: identity, gzip / x-gzip, deflate (zlib or
// raw), br.  Anything else is a decode failure and the response is left
// alone.

use std::borrow::Cow;
use std::io::{Cursor, Read};

use brotli::Decompressor;
use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue};
use mime::Mime;

use crate::error::{Error, Result};

/// Decoded body text plus the charset it was read with.
#[derive(Debug)]
pub struct Decoded {
    pub text: String,
    pub encoding: &'static Encoding,
}

/// Undo the content encoding and decode the charset.
pub fn decode(headers: &HeaderMap, body: &[u8]) -> Result<Decoded> {
    let plain = decompress(headers, body)?;
    let declared = declared_charset(headers);

    let (text, encoding, had_errors) = declared.decode(&plain);
    if had_errors {
        return Err(Error::DecodeFailure(format!(
            "malformed {} data",
            encoding.name()
        )));
    }
    if encoding.output_encoding() != encoding {
        return Err(Error::DecodeFailure(format!(
            "{} is not ASCII compatible",
            encoding.name()
        )));
    }

    Ok(Decoded {
        text: text.into_owned(),
        encoding,
    })
}

/// Encode mutated text and fix up the framing headers: the body is written
/// uncompressed and whole, so `Content-Encoding` and `Transfer-Encoding` go
/// and `Content-Length` is reset.
pub fn encode(headers: &mut HeaderMap, text: &str, encoding: &'static Encoding) -> Result<Bytes> {
    let (bytes, _, unmappable) = encoding.encode(text);
    if unmappable {
        return Err(Error::SerializeFailure(format!(
            "document has characters {} cannot represent",
            encoding.name()
        )));
    }
    let body = Bytes::from(bytes.into_owned());

    headers.remove(CONTENT_ENCODING);
    headers.remove(TRANSFER_ENCODING);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    Ok(body)
}

fn declared_charset(headers: &HeaderMap) -> &'static Encoding {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<Mime>().ok())
        .and_then(|parsed| {
            parsed
                .get_param(mime::CHARSET)
                .and_then(|charset| Encoding::for_label(charset.as_str().as_bytes()))
        })
        .unwrap_or(UTF_8)
}

fn decompress<'a>(headers: &HeaderMap, body: &'a [u8]) -> Result<Cow<'a, [u8]>> {
    let coding = match headers.get(CONTENT_ENCODING) {
        Some(value) => value
            .to_str()
            .map_err(|_| Error::DecodeFailure("unreadable content-encoding".into()))?
            .trim()
            .to_ascii_lowercase(),
        None => return Ok(Cow::Borrowed(body)),
    };

    match coding.as_str() {
        "" | "identity" => Ok(Cow::Borrowed(body)),
        "gzip" | "x-gzip" => read_all(MultiGzDecoder::new(body)).map(Cow::Owned),
        "deflate" => read_all(ZlibDecoder::new(body))
            .or_else(|_| read_all(DeflateDecoder::new(body)))
            .map(Cow::Owned),
        "br" => read_all(Decompressor::new(Cursor::new(body), 4096)).map(Cow::Owned),
        other => Err(Error::DecodeFailure(format!(
            "unsupported content-encoding {}",
            other
        ))),
    }
}

fn read_all<R: Read>(mut reader: R) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .read_to_end(&mut out)
        .map_err(|e| Error::DecodeFailure(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(*v));
        }
        map
    }

    #[test]
    fn plain_utf8() {
        let h = headers(&[("content-type", "text/html")]);
        let decoded = decode(&h, "<p>héllo</p>".as_bytes()).unwrap();
        assert_eq!(decoded.text, "<p>héllo</p>");
        assert_eq!(decoded.encoding, UTF_8);
    }

    #[test]
    fn declared_latin1() {
        let h = headers(&[("content-type", "text/html; charset=ISO-8859-1")]);
        let decoded = decode(&h, b"caf\xe9").unwrap();
        assert_eq!(decoded.text, "café");
        assert_eq!(decoded.encoding.name(), "windows-1252");

        let mut out = HeaderMap::new();
        let body = encode(&mut out, &decoded.text, decoded.encoding).unwrap();
        assert_eq!(&body[..], b"caf\xe9");
    }

    #[test]
    fn malformed_utf8_is_decode_failure() {
        let h = headers(&[("content-type", "text/html; charset=utf-8")]);
        let err = decode(&h, b"<p>\xff\xfe\xfd</p>").unwrap_err();
        assert!(matches!(err, Error::DecodeFailure(_)));
    }

    #[test]
    fn gzip_body() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"<html>gz</html>").unwrap();
        let compressed = enc.finish().unwrap();

        let h = headers(&[("content-type", "text/html"), ("content-encoding", "gzip")]);
        assert_eq!(decode(&h, &compressed).unwrap().text, "<html>gz</html>");
    }

    #[test]
    fn deflate_body() {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"<html>z</html>").unwrap();
        let compressed = enc.finish().unwrap();

        let h = headers(&[("content-encoding", "deflate")]);
        assert_eq!(decode(&h, &compressed).unwrap().text, "<html>z</html>");
    }

    #[test]
    fn brotli_body() {
        let mut enc = brotli::CompressorWriter::new(Vec::new(), 4096, 5, 22);
        enc.write_all("<html>br é</html>".as_bytes()).unwrap();
        let compressed = enc.into_inner();

        let h = headers(&[("content-type", "text/html"), ("content-encoding", "br")]);
        assert_eq!(decode(&h, &compressed).unwrap().text, "<html>br é</html>");
    }

    #[test]
    fn unknown_encoding_unsupported() {
        let h = headers(&[("content-encoding", "compress")]);
        let err = decode(&h, b"\x1f\x9d").unwrap_err();
        assert_eq!(err, Error::DecodeFailure("unsupported content-encoding compress".into()));
    }

    #[test]
    fn encode_fixes_framing_headers() {
        let mut h = headers(&[
            ("content-encoding", "gzip"),
            ("content-length", "3"),
            ("transfer-encoding", "chunked"),
        ]);
        let body = encode(&mut h, "<p>abcdef</p>", UTF_8).unwrap();
        assert_eq!(body.len(), 13);
        assert!(!h.contains_key(CONTENT_ENCODING));
        assert!(!h.contains_key(TRANSFER_ENCODING));
        assert_eq!(h.get(CONTENT_LENGTH).unwrap(), "13");
    }

    #[test]
    fn unmappable_is_serialize_failure() {
        let latin1 = Encoding::for_label(b"latin1").unwrap();
        let mut h = HeaderMap::new();
        let err = encode(&mut h, "snowman ☃", latin1).unwrap_err();
        assert!(matches!(err, Error::SerializeFailure(_)));
        assert!(h.is_empty());
    }
}
