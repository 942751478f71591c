//! Raw RFC 822 bytes to `MessageRecord`.
//!
//! Parsing is total: malformed input degrades to empty fields instead of
//! failing. Text in a missing, ASCII or unknown charset is read as lossy UTF-8,
//! for bodies and RFC 2047 encoded words alike.

use crate::MessageRecord;

use base64::Engine as _;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use encoding_rs::Encoding;
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};

/// Encoded words in the wild drop or mangle padding.
const ENCODED_WORD_BASE64: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Parse raw message bytes into a record.
pub fn parse_message(raw: &[u8]) -> MessageRecord {
    let parsed = match mailparse::parse_mail(raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            tracing::debug!(%error, "unparseable MIME message, keeping raw text as body");
            return MessageRecord {
                subject: Some(String::new()),
                sender: String::new(),
                recipient: None,
                date: None,
                body: String::from_utf8_lossy(raw).into_owned(),
            };
        }
    };

    let headers = parsed.headers.as_slice();

    let header = |name: &str| {
        headers
            .get_first_header(name)
            .map(|header| decode_header_value(header.get_value_raw()))
    };

    MessageRecord {
        subject: Some(header("Subject").unwrap_or_default()),
        sender: header("From").unwrap_or_default(),
        recipient: header("To"),
        date: header("Date"),
        body: extract_body(&parsed),
    }
}

/// Unfold a raw header value and decode its RFC 2047 encoded words.
///
/// Whitespace between adjacent encoded words is dropped. Anything that does
/// not parse as an encoded word is kept as literal text.
fn decode_header_value(raw: &[u8]) -> String {
    let unfolded: String = String::from_utf8_lossy(raw)
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n'))
        .collect();

    let mut decoded = String::with_capacity(unfolded.len());
    let mut rest = unfolded.as_str();
    let mut after_encoded_word = false;

    while let Some(start) = rest.find("=?") {
        let (literal, candidate) = rest.split_at(start);
        match decode_encoded_word(candidate) {
            Some((text, consumed)) => {
                if !(after_encoded_word && literal.trim().is_empty()) {
                    decoded.push_str(literal);
                }
                decoded.push_str(&text);
                rest = &candidate[consumed..];
                after_encoded_word = true;
            }
            None => {
                decoded.push_str(literal);
                decoded.push_str("=?");
                rest = &candidate[2..];
                after_encoded_word = false;
            }
        }
    }
    decoded.push_str(rest);

    decoded.trim().to_string()
}

/// Decode one `=?charset?encoding?text?=` at the start of `input`, returning
/// the text and the number of bytes consumed. A malformed payload decodes to
/// an empty fragment.
fn decode_encoded_word(input: &str) -> Option<(String, usize)> {
    let inner = input.strip_prefix("=?")?;
    let (charset, after_charset) = inner.split_once('?')?;
    let (encoding, after_encoding) = after_charset.split_once('?')?;
    let text_len = after_encoding.find("?=")?;
    let text = &after_encoding[..text_len];

    if charset.is_empty()
        || charset.contains(char::is_whitespace)
        || text.contains(char::is_whitespace)
    {
        return None;
    }

    let bytes = match encoding {
        "B" | "b" => ENCODED_WORD_BASE64.decode(text).unwrap_or_default(),
        "Q" | "q" => decode_q(text),
        _ => return None,
    };

    // `=?` + charset + `?` + encoding + `?` + text + `?=`
    let consumed = 2 + charset.len() + 1 + encoding.len() + 1 + text_len + 2;
    // RFC 2231 language suffix, e.g. `utf-8*tr`.
    let label = charset.split('*').next().unwrap_or(charset);
    Some((decode_text(Some(label), &bytes), consumed))
}

/// RFC 2047 "Q" encoding: `_` is a space, `=XX` a hex byte.
fn decode_q(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'_' => decoded.push(b' '),
            b'=' => {
                let hex = bytes
                    .get(index + 1..index + 3)
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                if let Some(byte) = hex {
                    decoded.push(byte);
                    index += 2;
                } else {
                    decoded.push(b'=');
                }
            }
            byte => decoded.push(byte),
        }
        index += 1;
    }

    decoded
}

/// Decode with a declared charset when it is known and not plain ASCII,
/// otherwise as lossy UTF-8.
fn decode_text(charset: Option<&str>, bytes: &[u8]) -> String {
    let encoding = charset
        .map(str::trim)
        .filter(|label| {
            !label.eq_ignore_ascii_case("us-ascii") && !label.eq_ignore_ascii_case("ascii")
        })
        .and_then(|label| Encoding::for_label(label.as_bytes()));

    match encoding {
        Some(encoding) => encoding.decode_with_bom_removal(bytes).0.into_owned(),
        None => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// First inline `text/plain` part of a multipart message, or the single payload.
fn extract_body(parsed: &ParsedMail<'_>) -> String {
    if !is_multipart(parsed) {
        return decode_payload(parsed);
    }

    first_plain_text_part(parsed)
        .map(decode_payload)
        .unwrap_or_default()
}

fn is_multipart(part: &ParsedMail<'_>) -> bool {
    part.ctype.mimetype.to_ascii_lowercase().starts_with("multipart/")
}

/// Pre-order walk, the container itself included.
fn first_plain_text_part<'a>(part: &'a ParsedMail<'a>) -> Option<&'a ParsedMail<'a>> {
    let is_attachment = matches!(
        part.get_content_disposition().disposition,
        DispositionType::Attachment
    );

    if part.ctype.mimetype.eq_ignore_ascii_case("text/plain") && !is_attachment {
        return Some(part);
    }

    part.subparts.iter().find_map(first_plain_text_part)
}

/// Transfer-decode, then apply the declared charset (see `decode_text`).
fn decode_payload(part: &ParsedMail<'_>) -> String {
    match part.get_body_raw() {
        Ok(bytes) => decode_text(part.ctype.params.get("charset").map(String::as_str), &bytes),
        Err(error) => {
            tracing::debug!(%error, "undecodable transfer encoding, dropping body");
            String::new()
        }
    }
}
