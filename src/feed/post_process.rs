use url::Url;

use super::model::{Episode, Feed};

/// Normalization pass run over freshly parsed feeds before reconciliation.
///
/// Runs before any identity lookup, so it may rewrite fields used for
/// matching.
pub trait FeedPostProcessor: Send + Sync {
    fn process(&self, feeds: &mut [Feed]);
}

/// Default post-processor.
///
/// - trims surrounding whitespace and strips control characters from text
/// - turns empty values into `None`
/// - resolves relative image, media and payment URLs against the feed URL
///
/// GUIDs are normalized but never invented: an item without one stays
/// unmatchable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NormalizingPostProcessor;

impl FeedPostProcessor for NormalizingPostProcessor {
    fn process(&self, feeds: &mut [Feed]) {
        for feed in feeds.iter_mut() {
            let base = Url::parse(&feed.feed_url).ok();

            normalize_text(&mut feed.title);
            normalize_text(&mut feed.description);
            normalize_url(&mut feed.image_url, base.as_ref());

            for episode in feed.episodes.iter_mut() {
                normalize_episode(episode, base.as_ref());
            }
        }
    }
}

fn normalize_episode(episode: &mut Episode, base: Option<&Url>) {
    normalize_text(&mut episode.guid);
    normalize_text(&mut episode.title);
    normalize_text(&mut episode.description);
    normalize_text(&mut episode.content);
    normalize_url(&mut episode.data_url, base);
    normalize_url(&mut episode.image_url, base);
    normalize_url(&mut episode.payment_url, base);
}

fn normalize_text(field: &mut Option<String>) {
    if let Some(value) = field.take() {
        let cleaned = strip_control_chars(value.trim());
        if !cleaned.is_empty() {
            *field = Some(cleaned);
        }
    }
}

fn normalize_url(field: &mut Option<String>, base: Option<&Url>) {
    normalize_text(field);
    let (Some(value), Some(base)) = (field.as_ref(), base) else {
        return;
    };
    if Url::parse(value).is_ok() {
        return;
    }
    match base.join(value) {
        Ok(resolved) => *field = Some(resolved.to_string()),
        Err(e) => {
            tracing::debug!(url = %value, error = %e, "Leaving unresolvable URL as-is");
        }
    }
}

/// Drops C0 controls (other than tab/newline/CR) and DEL.
fn strip_control_chars(s: &str) -> String {
    s.chars()
        .filter(|&c| !(c.is_control() && !matches!(c, '\t' | '\n' | '\r')))
        .collect()
}
