//! Receiver metadata stream parsing
//!
//! The receiver writes a stream of XML-ish items to its metadata pipe:
//!
//! ```text
//! <item><type>636f7265</type><code>6d696e6d</code><length>9</length>
//! <data encoding="base64">
//! VGVzdCBTb25n</data></item>
//! ```
//!
//! `type` and `code` are four ASCII characters, hex encoded. Track fields
//! arrive as separate `core` items and a `ssnc`/`mden` item closes the bundle.

use base64::Engine;
use thiserror::Error;

use crate::protocol::TrackMetadata;

/// Drop buffered text past this size without a closing tag
const MAX_PENDING_BYTES: usize = 256 * 1024;

const ITEM_OPEN: &str = "<item>";
const ITEM_CLOSE: &str = "</item>";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataParseError {
    #[error("missing <{0}> tag")]
    MissingTag(&'static str),

    #[error("invalid four-character code {0:?}")]
    InvalidCode(String),

    #[error("invalid base64 payload: {0}")]
    InvalidPayload(String),

    #[error("unterminated item discarded after {0} bytes")]
    Overflow(usize),
}

/// One decoded item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataItem {
    pub kind: [u8; 4],
    pub code: [u8; 4],
    pub data: Vec<u8>,
}

impl MetadataItem {
    pub fn is(&self, kind: &[u8; 4], code: &[u8; 4]) -> bool {
        &self.kind == kind && &self.code == code
    }

    fn text(&self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.data).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// Incremental item parser; feed it text as it arrives
#[derive(Debug, Default)]
pub struct MetadataParser {
    pending: String,
}

impl MetadataParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every complete item in the buffered text
    pub fn feed(&mut self, chunk: &str) -> Vec<Result<MetadataItem, MetadataParseError>> {
        self.pending.push_str(chunk);
        let mut out = Vec::new();

        while let Some(end) = self.pending.find(ITEM_CLOSE) {
            let block: String = self.pending.drain(..end + ITEM_CLOSE.len()).collect();
            let body = match block.rfind(ITEM_OPEN) {
                Some(start) => &block[start + ITEM_OPEN.len()..block.len() - ITEM_CLOSE.len()],
                None => continue,
            };
            out.push(parse_item(body));
        }

        if self.pending.len() > MAX_PENDING_BYTES {
            let dropped = self.pending.len();
            self.pending.clear();
            out.push(Err(MetadataParseError::Overflow(dropped)));
        }

        out
    }
}

fn parse_item(body: &str) -> Result<MetadataItem, MetadataParseError> {
    let kind = decode_code(tag_text(body, "type").ok_or(MetadataParseError::MissingTag("type"))?)?;
    let code = decode_code(tag_text(body, "code").ok_or(MetadataParseError::MissingTag("code"))?)?;

    let data = match tag_text(body, "data") {
        Some(encoded) => {
            let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact.as_bytes())
                .map_err(|e| MetadataParseError::InvalidPayload(e.to_string()))?
        }
        None => Vec::new(),
    };

    Ok(MetadataItem { kind, code, data })
}

/// Text between `<tag ...>` and `</tag>`
fn tag_text<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);

    let start = body.find(&open)?;
    let content_start = start + body[start..].find('>')? + 1;
    let content_end = content_start + body[content_start..].find(&close)?;
    Some(&body[content_start..content_end])
}

fn decode_code(hex_text: &str) -> Result<[u8; 4], MetadataParseError> {
    let trimmed = hex_text.trim();
    let bytes = hex::decode(trimmed).map_err(|_| MetadataParseError::InvalidCode(trimmed.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| MetadataParseError::InvalidCode(trimmed.to_string()))
}

/// Collects track fields until the end-of-bundle marker
#[derive(Debug, Default)]
pub struct TrackAssembler {
    current: TrackMetadata,
}

impl TrackAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an item; returns the finished bundle on `ssnc`/`mden`
    pub fn apply(&mut self, item: &MetadataItem) -> Option<TrackMetadata> {
        match (&item.kind, &item.code) {
            (b"core", b"minm") => self.current.title = item.text(),
            (b"core", b"asar") => self.current.artist = item.text(),
            (b"core", b"asal") => self.current.album = item.text(),
            (b"ssnc", b"mdst") => self.current = TrackMetadata::default(),
            (b"ssnc", b"mden") => {
                let finished = std::mem::take(&mut self.current);
                return (!finished.is_empty()).then_some(finished);
            }
            _ => {}
        }
        None
    }
}
