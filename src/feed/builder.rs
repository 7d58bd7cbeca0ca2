//! Builds [`Feed`]/[`Episode`] values from tag events.
//!
//! The builder is an explicit state machine: a finished-feed list plus an
//! optional in-progress feed and an optional in-progress episode. A fresh
//! builder is created for every parse call, so independent documents can be
//! parsed concurrently on separate threads.

use std::io::BufRead;

use super::model::{Episode, Feed, FetchInfo};
use super::tags::{parse_tags, Attributes, ParseError, TagContext, TagHandler};

const FEED_TAG: &str = "channel";
const EPISODE_TAG: &str = "item";
const TITLE_TAG: &str = "title";
const DESCRIPTION_TAG: &str = "description";
const GUID_TAG: &str = "guid";
const CONTENT_TAG: &str = "encoded";
const IMAGE_TAG: &str = "image";
const ENCLOSURE_TAG: &str = "enclosure";
const LINK_TAG: &str = "link";

const LOCATION_ATTRIBUTE: &str = "href";
const URL_ATTRIBUTE: &str = "url";
const REL_ATTRIBUTE: &str = "rel";
const PAYMENT_REL: &str = "payment";

/// Substring a payment link must contain to be recorded.
pub const PAYMENT_PROVIDER_MARKER: &str = "flattr";

/// Result of parsing one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDocument {
    /// Every channel in document order.
    pub feeds: Vec<Feed>,
    /// Encoding detected by the tokenizer.
    pub encoding: String,
}

/// Parses a feed document.
///
/// Fails with [`ParseError::Malformed`] on any structural fault. Feeds
/// completed before the fault are discarded together with the rest: a
/// document either parses completely or not at all.
pub fn parse_feed<R: BufRead>(input: R, info: &FetchInfo) -> Result<ParsedDocument, ParseError> {
    let mut builder = FeedBuilder::new(info);
    let encoding = parse_tags(input, &mut builder)?;
    let feeds = builder.finish()?;
    tracing::debug!(
        feed = %info.feed_url,
        feeds = feeds.len(),
        encoding,
        "Parsed feed document"
    );
    Ok(ParsedDocument {
        feeds,
        encoding: encoding.to_string(),
    })
}

/// Convenience wrapper over [`parse_feed`] for an in-memory body.
pub fn parse_feed_bytes(bytes: &[u8], info: &FetchInfo) -> Result<ParsedDocument, ParseError> {
    parse_feed(bytes, info)
}

/// Tag handler that assembles feeds.
pub struct FeedBuilder<'a> {
    info: &'a FetchInfo,
    feeds: Vec<Feed>,
    feed: Option<Feed>,
    episode: Option<Episode>,
}

impl<'a> FeedBuilder<'a> {
    pub fn new(info: &'a FetchInfo) -> Self {
        Self {
            info,
            feeds: Vec::new(),
            feed: None,
            episode: None,
        }
    }

    /// Returns the completed feeds. The tokenizer already guarantees every
    /// element was closed, so a dangling builder here is an internal fault.
    pub fn finish(self) -> Result<Vec<Feed>, ParseError> {
        if self.feed.is_some() || self.episode.is_some() {
            return Err(ParseError::malformed("document ended inside a channel"));
        }
        Ok(self.feeds)
    }

    fn feed_mut(&mut self, tag: &str) -> Result<&mut Feed, ParseError> {
        self.feed
            .as_mut()
            .ok_or_else(|| ParseError::malformed(format!("<{tag}> outside of <{FEED_TAG}>")))
    }

    fn episode_mut(&mut self, tag: &str) -> Result<&mut Episode, ParseError> {
        self.episode
            .as_mut()
            .ok_or_else(|| ParseError::malformed(format!("<{tag}> outside of <{EPISODE_TAG}>")))
    }

    fn start_feed(&mut self, encoding: &str) -> Result<(), ParseError> {
        if self.feed.is_some() {
            return Err(ParseError::malformed("nested <channel>"));
        }
        self.feed = Some(Feed {
            feed_url: self.info.feed_url.clone(),
            encoding: encoding.to_string(),
            last_updated: self.info.fetched_at,
            etag: self.info.etag.clone(),
            ..Feed::default()
        });
        Ok(())
    }

    fn start_episode(&mut self) -> Result<(), ParseError> {
        if self.feed.is_none() {
            return Err(ParseError::malformed("<item> outside of <channel>"));
        }
        if self.episode.is_some() {
            return Err(ParseError::malformed("nested <item>"));
        }
        self.episode = Some(Episode {
            feed_url: self.info.feed_url.clone(),
            ..Episode::default()
        });
        Ok(())
    }
}

impl TagHandler for FeedBuilder<'_> {
    fn open_tag(&mut self, ctx: TagContext<'_>, attributes: &Attributes) -> Result<(), ParseError> {
        match ctx.tag {
            FEED_TAG => self.start_feed(ctx.encoding)?,
            EPISODE_TAG => self.start_episode()?,
            IMAGE_TAG => {
                if let Some(location) = attributes.get(LOCATION_ATTRIBUTE) {
                    if ctx.parent_is(FEED_TAG) {
                        self.feed_mut(IMAGE_TAG)?.image_url = Some(location.clone());
                    } else if ctx.parent_is(EPISODE_TAG) {
                        self.episode_mut(IMAGE_TAG)?.image_url = Some(location.clone());
                    }
                }
            }
            ENCLOSURE_TAG if ctx.parent_is(EPISODE_TAG) => {
                self.episode_mut(ENCLOSURE_TAG)?.data_url = attributes.get(URL_ATTRIBUTE).cloned();
            }
            LINK_TAG if ctx.parent_is(EPISODE_TAG) => {
                let is_payment = attributes.get(REL_ATTRIBUTE).map(String::as_str) == Some(PAYMENT_REL);
                if is_payment {
                    if let Some(location) = attributes.get(LOCATION_ATTRIBUTE) {
                        if location.contains(PAYMENT_PROVIDER_MARKER) {
                            self.episode_mut(LINK_TAG)?.payment_url = Some(location.clone());
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn close_tag(&mut self, ctx: TagContext<'_>) -> Result<(), ParseError> {
        match ctx.tag {
            FEED_TAG => {
                let feed = self
                    .feed
                    .take()
                    .ok_or_else(|| ParseError::malformed("</channel> without open channel"))?;
                self.feeds.push(feed);
            }
            EPISODE_TAG => {
                let episode = self
                    .episode
                    .take()
                    .ok_or_else(|| ParseError::malformed("</item> without open item"))?;
                self.feed_mut(EPISODE_TAG)?.episodes.push(episode);
            }
            _ => {}
        }
        Ok(())
    }

    fn tag_text(&mut self, ctx: TagContext<'_>, text: &str) -> Result<(), ParseError> {
        let in_episode = ctx.parent_is(EPISODE_TAG);
        let in_feed = ctx.parent_is(FEED_TAG);
        let value = Some(text.to_string());

        match ctx.tag {
            TITLE_TAG if in_episode => self.episode_mut(TITLE_TAG)?.title = value,
            GUID_TAG if in_episode => self.episode_mut(GUID_TAG)?.guid = value,
            CONTENT_TAG if in_episode => self.episode_mut(CONTENT_TAG)?.content = value,
            DESCRIPTION_TAG if in_episode => {
                self.episode_mut(DESCRIPTION_TAG)?.description = value
            }
            TITLE_TAG if in_feed => self.feed_mut(TITLE_TAG)?.title = value,
            DESCRIPTION_TAG if in_feed => self.feed_mut(DESCRIPTION_TAG)?.description = value,
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FEED_URL: &str = "http://example.com/feed.xml";

    fn info() -> FetchInfo {
        FetchInfo::new(FEED_URL, 1_700_000_000_000, Some("\"abc\"".to_string()))
    }

    fn parse(xml: &str) -> Result<ParsedDocument, ParseError> {
        parse_feed_bytes(xml.as_bytes(), &info())
    }

    const PODCAST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd"
     xmlns:content="http://purl.org/rss/1.0/modules/content/"
     xmlns:atom="http://www.w3.org/2005/Atom">
  <channel>
    <title>Example Cast</title>
    <description>A show about examples</description>
    <itunes:image href="http://example.com/show.png"/>
    <image><url>http://example.com/ignored.png</url><title>ignored</title></image>
    <item>
      <title>Episode 3</title>
      <guid>ep-3</guid>
      <description>Third</description>
      <content:encoded><![CDATA[<p>Show notes</p>]]></content:encoded>
      <itunes:image href="http://example.com/ep3.png"/>
      <enclosure url="http://example.com/ep3.mp3" length="3" type="audio/mpeg"/>
      <atom:link rel="payment" href="https://flattr.com/thing/3" type="text/html"/>
    </item>
    <item>
      <title>Episode 2</title>
      <guid>ep-2</guid>
      <enclosure url="http://example.com/ep2.mp3"/>
      <atom:link rel="payment" href="https://example.com/donate"/>
    </item>
    <item>
      <title>Episode 1</title>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn test_parse_full_feed() {
        let doc = parse(PODCAST).unwrap();
        assert_eq!(doc.encoding, "UTF-8");
        assert_eq!(doc.feeds.len(), 1);

        let feed = &doc.feeds[0];
        assert_eq!(feed.feed_url, FEED_URL);
        assert_eq!(feed.title.as_deref(), Some("Example Cast"));
        assert_eq!(feed.description.as_deref(), Some("A show about examples"));
        assert_eq!(feed.image_url.as_deref(), Some("http://example.com/show.png"));
        assert_eq!(feed.last_updated, 1_700_000_000_000);
        assert_eq!(feed.etag.as_deref(), Some("\"abc\""));
        assert_eq!(feed.encoding, "UTF-8");

        let titles: Vec<_> = feed.episodes.iter().map(|e| e.title.as_deref()).collect();
        assert_eq!(titles, vec![Some("Episode 3"), Some("Episode 2"), Some("Episode 1")]);

        let ep3 = &feed.episodes[0];
        assert_eq!(
            ep3,
            &Episode {
                feed_url: FEED_URL.to_string(),
                guid: Some("ep-3".to_string()),
                title: Some("Episode 3".to_string()),
                description: Some("Third".to_string()),
                content: Some("<p>Show notes</p>".to_string()),
                data_url: Some("http://example.com/ep3.mp3".to_string()),
                image_url: Some("http://example.com/ep3.png".to_string()),
                payment_url: Some("https://flattr.com/thing/3".to_string()),
            }
        );
    }

    #[test]
    fn test_payment_link_requires_provider_marker() {
        let doc = parse(PODCAST).unwrap();
        assert_eq!(doc.feeds[0].episodes[1].payment_url, None);
    }

    #[test]
    fn test_missing_guid_stays_absent() {
        let doc = parse(PODCAST).unwrap();
        assert_eq!(doc.feeds[0].episodes[2].guid, None);
        assert_eq!(doc.feeds[0].episodes[2].data_url, None);
    }

    #[test]
    fn test_image_context_feed_vs_episode() {
        let xml = r#"<rss><channel>
            <image href="http://a/feed.png"/>
            <item><image href="http://a/item.png"/></item>
        </channel></rss>"#;
        let doc = parse(xml).unwrap();
        let feed = &doc.feeds[0];
        assert_eq!(feed.image_url.as_deref(), Some("http://a/feed.png"));
        assert_eq!(feed.episodes[0].image_url.as_deref(), Some("http://a/item.png"));
    }

    #[test]
    fn test_nested_image_title_does_not_override_feed_title() {
        let doc = parse(PODCAST).unwrap();
        assert_eq!(doc.feeds[0].title.as_deref(), Some("Example Cast"));
    }

    #[test]
    fn test_enclosure_outside_item_ignored() {
        let xml = r#"<rss><channel><enclosure url="http://a/x.mp3"/><item/></channel></rss>"#;
        let doc = parse(xml).unwrap();
        assert_eq!(doc.feeds[0].episodes[0].data_url, None);
    }

    #[test]
    fn test_multiple_channels_in_one_stream() {
        let xml = r#"<rss>
            <channel><title>One</title><item><guid>a</guid></item></channel>
            <channel><title>Two</title></channel>
        </rss>"#;
        let doc = parse(xml).unwrap();
        assert_eq!(doc.feeds.len(), 2);
        assert_eq!(doc.feeds[0].title.as_deref(), Some("One"));
        assert_eq!(doc.feeds[0].episodes.len(), 1);
        assert_eq!(doc.feeds[1].title.as_deref(), Some("Two"));
        assert!(doc.feeds[1].episodes.is_empty());
    }

    #[test]
    fn test_item_closed_as_channel_is_malformed() {
        let xml = "<rss><channel><item><title>x</title></channel></rss>";
        assert!(matches!(parse(xml), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_fault_after_complete_channel_discards_everything() {
        let xml = "<rss><channel><title>ok</title></channel><channel><item></channel></rss>";
        assert!(matches!(parse(xml), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_item_outside_channel_is_malformed() {
        let xml = "<rss><item><title>x</title></item></rss>";
        let err = parse(xml).unwrap_err();
        assert!(err.to_string().contains("outside of <channel>"));
    }

    #[test]
    fn test_nested_channel_is_malformed() {
        let xml = "<rss><channel><channel></channel></channel></rss>";
        assert!(matches!(parse(xml), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_not_xml_is_malformed() {
        assert!(parse("<not valid xml").is_err());
    }

    #[test]
    fn test_empty_channel() {
        let doc = parse(r#"<?xml version="1.0"?><rss version="2.0"><channel></channel></rss>"#)
            .unwrap();
        assert_eq!(doc.feeds.len(), 1);
        assert!(doc.feeds[0].episodes.is_empty());
        assert_eq!(doc.feeds[0].title, None);
    }

    #[test]
    fn test_reparse_is_identical() {
        let first = parse(PODCAST).unwrap();
        let second = parse(PODCAST).unwrap();
        assert_eq!(first, second);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        fn escape(s: &str) -> String {
            s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
        }

        proptest! {
            #[test]
            fn parsing_is_deterministic(
                titles in proptest::collection::vec("[a-zA-Z0-9 &<>]{1,20}", 0..8),
                etag in proptest::option::of("[a-z0-9]{1,8}"),
            ) {
                let mut xml = String::from("<rss><channel><title>Show</title>");
                for (i, title) in titles.iter().enumerate() {
                    xml.push_str(&format!(
                        "<item><guid>g{i}</guid><title>{}</title></item>",
                        escape(title)
                    ));
                }
                xml.push_str("</channel></rss>");

                let info = FetchInfo::new("http://p/feed", 42, etag);
                let a = parse_feed_bytes(xml.as_bytes(), &info).unwrap();
                let b = parse_feed_bytes(xml.as_bytes(), &info).unwrap();
                prop_assert_eq!(&a, &b);

                let parsed: Vec<_> = a.feeds[0]
                    .episodes
                    .iter()
                    .map(|e| e.title.clone().unwrap_or_default())
                    .collect();
                prop_assert_eq!(parsed, titles);
            }
        }
    }
}
