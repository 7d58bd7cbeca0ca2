//! Tag-stack driven event dispatch over a quick-xml token stream.
//!
//! The tokenizer lowercases every element and attribute name (namespace
//! prefixes are dropped, so `itunes:image` arrives as `image`), keeps a stack
//! of open elements, and forwards three callbacks to a [`TagHandler`]:
//! open, close and text. Each callback carries the element's parent, which
//! is what lets the feed builder tell a channel-level `title` apart from an
//! item-level one.
//!
//! The stack check is ours rather than quick-xml's: end names are compared
//! after lowercasing, so `<Item>...</item>` is accepted while `<item>...</channel>`
//! is rejected as malformed.

use std::collections::HashMap;
use std::io::BufRead;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// SEC-003: Maximum element nesting depth accepted from a feed document.
pub const MAX_TAG_DEPTH: usize = 64;

/// Errors raised while tokenizing or dispatching a feed document.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Structurally invalid document: mismatched or unbalanced tags, tokenizer
    /// failures, or builder callbacks arriving outside their container.
    #[error("Malformed XML: {0}")]
    Malformed(String),

    /// The underlying reader failed.
    #[error("Failed to read feed document: {0}")]
    Io(String),
}

impl ParseError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

impl From<quick_xml::Error> for ParseError {
    fn from(err: quick_xml::Error) -> Self {
        match err {
            quick_xml::Error::Io(e) => ParseError::Io(e.to_string()),
            other => ParseError::Malformed(other.to_string()),
        }
    }
}

/// Lowercased attribute name to unescaped value.
pub type Attributes = HashMap<String, String>;

/// Where a callback happens: the element itself, its parent, and the
/// document encoding as detected so far.
#[derive(Debug, Clone, Copy)]
pub struct TagContext<'a> {
    pub tag: &'a str,
    pub parent: Option<&'a str>,
    pub encoding: &'static str,
}

impl TagContext<'_> {
    /// True when the element's nearest enclosing element is `parent`.
    pub fn parent_is(&self, parent: &str) -> bool {
        self.parent == Some(parent)
    }
}

/// Receiver of tag events.
///
/// Any error returned aborts the parse; it is surfaced unchanged to the caller.
pub trait TagHandler {
    fn open_tag(&mut self, ctx: TagContext<'_>, attributes: &Attributes) -> Result<(), ParseError>;
    fn close_tag(&mut self, ctx: TagContext<'_>) -> Result<(), ParseError>;
    fn tag_text(&mut self, ctx: TagContext<'_>, text: &str) -> Result<(), ParseError>;
}

/// Stack of currently open element names.
///
/// Backed by a `Vec` so the parent is an index lookup instead of a
/// pop/peek/push sequence.
#[derive(Debug, Default, Clone)]
pub struct TagStack {
    tags: Vec<String>,
}

impl TagStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tag: String) {
        self.tags.push(tag);
    }

    pub fn pop(&mut self) -> Option<String> {
        self.tags.pop()
    }

    /// The innermost open element.
    pub fn current(&self) -> Option<&str> {
        self.tags.last().map(String::as_str)
    }

    /// The element enclosing the innermost one.
    pub fn parent(&self) -> Option<&str> {
        let len = self.tags.len();
        if len < 2 {
            return None;
        }
        self.tags.get(len - 2).map(String::as_str)
    }

    pub fn depth(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// Tokenizes `input` and drives `handler` until end of document.
///
/// Adjacent text and CDATA chunks inside one element are coalesced into a
/// single `tag_text` call, delivered before the next open/close event.
/// Returns the encoding name detected from the BOM or XML declaration
/// (`UTF-8` when neither is present).
pub fn parse_tags<R: BufRead, H: TagHandler>(
    input: R,
    handler: &mut H,
) -> Result<&'static str, ParseError> {
    let mut reader = Reader::from_reader(input);
    {
        let config = reader.config_mut();
        config.expand_empty_elements = true;
        config.check_end_names = false;
        config.trim_text(false);
    }

    let mut stack = TagStack::new();
    let mut pending_text = String::new();
    let mut buf = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf)?;
        let encoding = reader.decoder().encoding().name();

        match event {
            Event::Start(e) => {
                flush_text(&stack, encoding, &mut pending_text, handler)?;

                let tag = lowercase_name(e.local_name().as_ref());
                let attributes = collect_attributes(&e, &reader);
                stack.push(tag);
                // SEC-003: Reject pathologically nested documents
                if stack.depth() > MAX_TAG_DEPTH {
                    return Err(ParseError::malformed(format!(
                        "nesting depth exceeds {MAX_TAG_DEPTH} levels"
                    )));
                }

                let ctx = context(&stack, encoding);
                handler.open_tag(ctx, &attributes)?;
            }
            Event::End(e) => {
                flush_text(&stack, encoding, &mut pending_text, handler)?;

                let got = lowercase_name(e.local_name().as_ref());
                match stack.current() {
                    Some(expected) if expected == got => {}
                    Some(expected) => {
                        return Err(ParseError::malformed(format!(
                            "Closing tag {got}, expected closing {expected}"
                        )));
                    }
                    None => {
                        return Err(ParseError::malformed(format!(
                            "Closing tag {got} without matching opening tag"
                        )));
                    }
                }

                let ctx = context(&stack, encoding);
                handler.close_tag(ctx)?;
                stack.pop();
            }
            Event::Text(e) => {
                let text = match e.unescape() {
                    Ok(text) => text.into_owned(),
                    Err(err) => {
                        // Unknown entities (HTML-isms like &nbsp;) keep their raw form
                        tracing::debug!(error = %err, "Keeping unescaped feed text");
                        reader
                            .decoder()
                            .decode(&e)
                            .map_err(|err| ParseError::malformed(err.to_string()))?
                            .into_owned()
                    }
                };
                pending_text.push_str(&text);
            }
            Event::CData(e) => {
                let text = reader
                    .decoder()
                    .decode(&e)
                    .map_err(|err| ParseError::malformed(err.to_string()))?;
                pending_text.push_str(&text);
            }
            Event::Eof => {
                if let Some(open) = stack.current() {
                    return Err(ParseError::malformed(format!(
                        "Unexpected end of document, {open} still open"
                    )));
                }
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(reader.decoder().encoding().name())
}

fn context<'a>(stack: &'a TagStack, encoding: &'static str) -> TagContext<'a> {
    TagContext {
        tag: stack.current().unwrap_or_default(),
        parent: stack.parent(),
        encoding,
    }
}

fn flush_text<H: TagHandler>(
    stack: &TagStack,
    encoding: &'static str,
    pending: &mut String,
    handler: &mut H,
) -> Result<(), ParseError> {
    if pending.is_empty() {
        return Ok(());
    }
    let text = std::mem::take(pending);
    // Text outside the root element has nobody to receive it
    if stack.is_empty() {
        return Ok(());
    }
    handler.tag_text(context(stack, encoding), &text)
}

fn lowercase_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_lowercase()
}

fn collect_attributes<R>(e: &BytesStart<'_>, reader: &Reader<R>) -> Attributes {
    let mut attributes = Attributes::new();
    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(err) => {
                tracing::warn!(error = %err, "Skipping malformed feed attribute");
                continue;
            }
        };
        let name = lowercase_name(attr.key.local_name().as_ref());
        match attr.decode_and_unescape_value(reader.decoder()) {
            Ok(value) => {
                attributes.insert(name, value.into_owned());
            }
            Err(err) => {
                tracing::warn!(attribute = %name, error = %err, "Skipping undecodable attribute");
            }
        }
    }
    attributes
}
