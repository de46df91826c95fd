//! Reference listing extractor. Pulls listing cards and the next-page link
//! out of HTML with regexes — good enough for the card markup the
//! marketplaces render server-side, and cheap to swap for a source-specific
//! implementation behind the same trait.

use chrono::{DateTime, Utc};
use regex::Regex;

use dealscout_common::Listing;

use crate::fetch::FetchedPage;

/// Turns a page body into listings plus follow-up URLs. Implementations are
/// source-specific and explicitly swappable.
pub trait ListingExtractor: Send + Sync {
    fn extract(&self, html: &str, base_url: &str) -> FetchedPage;
}

/// Max follow-up URLs taken from a single page.
const MAX_NEXT_URLS: usize = 20;

pub struct CardExtractor {
    card_open: Regex,
    title: Regex,
    price: Regex,
    price_number: Regex,
    description: Regex,
    location: Regex,
    link: Regex,
    published: Regex,
    next_link: Regex,
}

impl CardExtractor {
    pub fn new() -> Self {
        Self {
            card_open: Regex::new(r#"<div[^>]+class="[^"]*\blisting\b[^"]*""#)
                .expect("valid card regex"),
            title: Regex::new(r"(?s)<h2[^>]*>(.*?)</h2>").expect("valid title regex"),
            price: Regex::new(r#"(?s)class="[^"]*\bprice\b[^"]*"[^>]*>(.*?)<"#)
                .expect("valid price regex"),
            price_number: Regex::new(r"\d[\d.]*").expect("valid price number regex"),
            description: Regex::new(r#"(?s)<p[^>]+class="[^"]*\bdescription\b[^"]*"[^>]*>(.*?)</p>"#)
                .expect("valid description regex"),
            location: Regex::new(r#"(?s)class="[^"]*\blocation\b[^"]*"[^>]*>(.*?)<"#)
                .expect("valid location regex"),
            link: Regex::new(r#"<a[^>]+href\s*=\s*["']([^"']+)["']"#).expect("valid link regex"),
            published: Regex::new(r#"<time[^>]+datetime\s*=\s*["']([^"']+)["']"#)
                .expect("valid time regex"),
            next_link: Regex::new(
                r#"<a[^>]+(?:class="[^"]*\bnext\b[^"]*"|rel="next")[^>]*href\s*=\s*["']([^"']+)["']"#,
            )
            .expect("valid next regex"),
        }
    }

    fn extract_card(&self, chunk: &str, base: Option<&url::Url>) -> Option<Listing> {
        let title = self
            .title
            .captures(chunk)
            .map(|c| strip_tags(&c[1]))
            .filter(|t| !t.is_empty())?;

        let price = self
            .price
            .captures(chunk)
            .and_then(|c| self.price_number.find(&strip_tags(&c[1])).map(|m| m.as_str().to_string()))
            .and_then(|n| n.parse::<f64>().ok())
            .unwrap_or(0.0);

        let url = self
            .link
            .captures(chunk)
            .and_then(|c| resolve_url(&c[1], base))?;

        let description = self
            .description
            .captures(chunk)
            .map(|c| strip_tags(&c[1]))
            .filter(|d| !d.is_empty());

        let location = self
            .location
            .captures(chunk)
            .map(|c| strip_tags(&c[1]))
            .filter(|l| !l.is_empty());

        let published_at = self.published.captures(chunk).and_then(|c| {
            DateTime::parse_from_rfc3339(&c[1])
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        });

        Some(Listing {
            title,
            price,
            description,
            location,
            url,
            image_urls: extract_image_urls(chunk, base),
            published_at,
        })
    }
}

impl Default for CardExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ListingExtractor for CardExtractor {
    fn extract(&self, html: &str, base_url: &str) -> FetchedPage {
        let base = url::Url::parse(base_url).ok();
        let base_ref = base.as_ref();

        // Card boundaries: everything between one opening card div and the
        // next. Regex carries us far enough for flat card markup.
        let starts: Vec<usize> = self.card_open.find_iter(html).map(|m| m.start()).collect();
        let mut listings = Vec::new();
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(html.len());
            if let Some(listing) = self.extract_card(&html[start..end], base_ref) {
                listings.push(listing);
            }
        }

        let mut next_urls = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for cap in self.next_link.captures_iter(html) {
            if let Some(resolved) = resolve_url(&cap[1], base_ref) {
                if seen.insert(resolved.clone()) {
                    next_urls.push(resolved);
                    if next_urls.len() >= MAX_NEXT_URLS {
                        break;
                    }
                }
            }
        }

        FetchedPage { listings, next_urls }
    }
}

fn resolve_url(raw: &str, base: Option<&url::Url>) -> Option<String> {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Some(raw.to_string());
    }
    base.and_then(|b| b.join(raw).ok()).map(|u| u.to_string())
}

fn extract_image_urls(chunk: &str, base: Option<&url::Url>) -> Vec<String> {
    let img_re = Regex::new(r#"<img[^>]+src\s*=\s*["']([^"']+)["']"#).expect("valid img regex");
    img_re
        .captures_iter(chunk)
        .filter_map(|c| resolve_url(&c[1], base))
        .collect()
}

fn strip_tags(s: &str) -> String {
    let tag_re = Regex::new(r"<[^>]*>").expect("valid tag regex");
    tag_re.replace_all(s, "").trim().to_string()
}
