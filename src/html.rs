//! Best-effort field extraction from site pages
//!
//! Pages are matched with a handful of regexes rather than parsed; anything
//! that does not match is skipped, never guessed.

use regex::Regex;
use std::collections::HashMap;

use crate::types::{Owner, TradeHistoryEntry, TradeStatus};

/// Prefix of at most `max` bytes, cut on a char boundary
fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// An opening tag with its attributes
#[derive(Debug, Clone)]
struct Tag {
    start: usize,
    attrs: HashMap<String, String>,
}

impl Tag {
    fn has_class(&self, class: &str) -> bool {
        self.attrs
            .get("class")
            .is_some_and(|c| c.split_whitespace().any(|token| token == class))
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// Compiled patterns for every page the runner reads
pub struct PageParser {
    tag: Regex,
    attr: Regex,
    anchor: Regex,
    clickable: Regex,
    markup: Regex,
    users_link: Regex,
    cards_link: Regex,
    ratio: Regex,
    donations_rule: Regex,
}

impl PageParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            tag: Regex::new(r"<([a-zA-Z][a-zA-Z0-9]*)\b([^>]*)>")?,
            attr: Regex::new(r#"([a-zA-Z_:][-a-zA-Z0-9_:.]*)\s*=\s*"([^"]*)""#)?,
            anchor: Regex::new(r"(?s)<a\b([^>]*)>(.*?)</a>")?,
            clickable: Regex::new(r"(?s)<(?:a|button)\b([^>]*)>(.*?)</(?:a|button)>")?,
            markup: Regex::new(r"(?s)<[^>]*>")?,
            users_link: Regex::new(r"/users/(\d+)")?,
            cards_link: Regex::new(r"/cards/(\d+)")?,
            ratio: Regex::new(r"(\d+)\s*/\s*(\d+)")?,
            donations_rule: Regex::new(r"до\s+(\d+)/(\d+)\s+карт")?,
        })
    }

    fn tags(&self, html: &str) -> Vec<Tag> {
        self.tag
            .captures_iter(html)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                Some(Tag {
                    start: whole.start(),
                    attrs: self.parse_attrs(caps.get(2).map_or("", |m| m.as_str())),
                })
            })
            .collect()
    }

    fn parse_attrs(&self, raw: &str) -> HashMap<String, String> {
        self.attr
            .captures_iter(raw)
            .map(|caps| (caps[1].to_ascii_lowercase(), caps[2].to_string()))
            .collect()
    }

    /// Visible text with markup removed and whitespace collapsed
    pub fn text(&self, fragment: &str) -> String {
        self.markup
            .replace_all(fragment, " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn first_id(re: &Regex, haystack: &str) -> Option<u64> {
        re.captures(haystack).and_then(|caps| caps[1].parse().ok())
    }

    /// Tradeable owners on one listing page.
    ///
    /// Offline owners and owners with a trade lock are dropped, and the
    /// first `skip` entries of page 1 are ignored.
    pub fn owners(&self, html: &str, page: u32, skip: usize) -> Vec<Owner> {
        let mut owners = Vec::new();
        let mut index = 0;

        for caps in self.anchor.captures_iter(html) {
            let attrs = self.parse_attrs(&caps[1]);
            let classes: Vec<&str> = attrs
                .get("class")
                .map(|c| c.split_whitespace().collect())
                .unwrap_or_default();
            if !classes.contains(&"card-show__owner") {
                continue;
            }

            let position = index;
            index += 1;
            if page == 1 && position < skip {
                continue;
            }

            let body = &caps[2];
            if !classes.contains(&"card-show__owner--online") || body.contains("icon-lock") {
                continue;
            }

            let Some(owner_id) = attrs
                .get("href")
                .and_then(|href| Self::first_id(&self.users_link, href))
            else {
                continue;
            };

            owners.push(Owner::new(owner_id, &self.owner_name(body)));
        }

        owners
    }

    fn owner_name(&self, body: &str) -> String {
        let marker = "card-show__owner-name";
        body.find(marker)
            .and_then(|pos| body[pos..].find('>').map(|gt| pos + gt + 1))
            .map(|from| {
                let rest = &body[from..];
                let until = rest.find("</").unwrap_or(rest.len());
                self.text(&rest[..until])
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    /// Ids of every owner entry on a listing page, offline ones included
    pub fn owner_ids(&self, html: &str) -> Vec<u64> {
        self.tags(html)
            .iter()
            .filter(|tag| tag.has_class("card-show__owner"))
            .filter_map(|tag| tag.attr("href").and_then(|h| Self::first_id(&self.users_link, h)))
            .collect()
    }

    /// Whether the pager offers a "next" link
    pub fn has_next_page(&self, html: &str) -> bool {
        self.anchor
            .captures_iter(html)
            .any(|caps| self.text(&caps[2]) == "Вперёд")
    }

    /// Highest page number shown by the pager, at least 1
    pub fn max_page(&self, html: &str) -> u32 {
        let Some(from) = html.find("paginat") else {
            return 1;
        };
        let pager = &html[from..];

        let mut max = 1;
        for caps in self.clickable.captures_iter(pager) {
            if let Ok(number) = self.text(&caps[2]).parse::<u32>() {
                max = max.max(number);
            }
        }
        // Pagers rendered as list items without links
        for tag in self.tags(pager) {
            if tag.has_class("pagination__button") {
                let rest = &pager[tag.start..];
                if let Some(gt) = rest.find('>') {
                    let inner = &rest[gt + 1..];
                    let until = inner.find("</").unwrap_or(inner.len());
                    if let Ok(number) = self.text(&inner[..until]).parse::<u32>() {
                        max = max.max(number);
                    }
                }
            }
        }
        max
    }

    /// Number of elements carrying any of `classes`
    pub fn count_with_class(&self, html: &str, classes: &[&str]) -> usize {
        self.tags(html)
            .iter()
            .filter(|tag| classes.iter().any(|class| tag.has_class(class)))
            .count()
    }

    /// Resource id behind the club page's main card button
    pub fn target_card_id(&self, html: &str) -> Option<u64> {
        self.tags(html)
            .iter()
            .filter(|tag| tag.has_class("button") && tag.has_class("button--block"))
            .find_map(|tag| tag.attr("href").and_then(|h| Self::first_id(&self.cards_link, h)))
    }

    /// Whether the club page shows a contribute button
    pub fn has_contribute_button(&self, html: &str) -> bool {
        let by_class = self
            .tags(html)
            .iter()
            .any(|tag| tag.has_class("club_boost-btn") || tag.has_class("club-boost-btn"));

        by_class
            || self.clickable.captures_iter(html).any(|caps| {
                let text = self.text(&caps[2]);
                text.contains("Пожертвовать") || text.contains("пожертвовать")
            })
    }

    /// `(used, max)` replacement counter from the club page
    pub fn replacement_counts(&self, html: &str) -> Option<(u32, u32)> {
        let pos = html.find("club-boost__change")?;
        let rest = &html[pos..];
        let text = self.text(clip(rest, 600));
        let caps = self.ratio.captures(&text)?;
        Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
    }

    /// `(used, max)` donation counter from the club rules
    pub fn donation_counts(&self, html: &str) -> Option<(u32, u32)> {
        let text = self.text(html);
        let caps = self.donations_rule.captures(&text)?;
        Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
    }

    /// Entries of a trade history page. Rows without lost items are dropped.
    pub fn trade_history(&self, html: &str) -> Vec<TradeHistoryEntry> {
        let rows: Vec<(usize, u64, bool, bool)> = self
            .tags(html)
            .iter()
            .filter(|tag| tag.has_class("history__item"))
            .filter_map(|tag| {
                let trade_id = tag.attr("data-id")?.parse().ok()?;
                Some((
                    tag.start,
                    trade_id,
                    tag.has_class("history__item--completed"),
                    tag.has_class("history__item--cancelled"),
                ))
            })
            .collect();

        let mut entries = Vec::new();
        for (i, (start, trade_id, completed, cancelled)) in rows.iter().enumerate() {
            let end = rows.get(i + 1).map_or(html.len(), |next| next.0);
            let segment = &html[*start..end];

            let status = if *completed || segment.contains("history__item--completed") {
                TradeStatus::Completed
            } else if *cancelled || segment.contains("history__item--cancelled") {
                TradeStatus::Cancelled
            } else {
                self.status_from_text(segment)
            };

            let (lost, gained) = self.split_history_body(segment);
            if lost.is_empty() {
                continue;
            }

            entries.push(TradeHistoryEntry {
                trade_id: *trade_id,
                status,
                lost_items: lost,
                gained_items: gained,
            });
        }
        entries
    }

    fn status_from_text(&self, segment: &str) -> TradeStatus {
        let Some(pos) = segment.find("history__status") else {
            return TradeStatus::Pending;
        };
        let text = self.text(clip(&segment[pos..], 400)).to_lowercase();
        if text.contains("отменен") || text.contains("отклонен") {
            TradeStatus::Cancelled
        } else if text.contains("завершен") || text.contains("принят") {
            TradeStatus::Completed
        } else {
            TradeStatus::Pending
        }
    }

    fn split_history_body(&self, segment: &str) -> (Vec<u64>, Vec<u64>) {
        let lost_at = segment.find("history__body--lost");
        let gained_at = segment.find("history__body--gained");

        let ids = |part: &str| -> Vec<u64> {
            self.cards_link
                .captures_iter(part)
                .filter_map(|caps| caps[1].parse().ok())
                .collect()
        };

        let lost = match (lost_at, gained_at) {
            (Some(l), Some(g)) if g > l => ids(&segment[l..g]),
            (Some(l), _) => ids(&segment[l..]),
            _ => Vec::new(),
        };
        let gained = match (gained_at, lost_at) {
            (Some(g), Some(l)) if l > g => ids(&segment[g..l]),
            (Some(g), _) => ids(&segment[g..]),
            _ => Vec::new(),
        };
        (lost, gained)
    }

    /// Club members listed as already holding the target, deduplicated
    pub fn club_member_ids(&self, html: &str) -> Vec<u64> {
        let Some(pos) = html.find("club-boost__owners-list") else {
            return Vec::new();
        };
        let rest = &html[pos..];
        let end = ["</ul>", "</section>"]
            .iter()
            .filter_map(|closing| rest.find(closing))
            .min()
            .unwrap_or(rest.len());

        let mut ids = Vec::new();
        for caps in self.users_link.captures_iter(&rest[..end]) {
            if let Ok(id) = caps[1].parse::<u64>() {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    /// Display name on a profile page
    pub fn profile_name(&self, html: &str) -> Option<String> {
        let tags = self.tags(html);
        if let Some(name) = tags
            .iter()
            .find_map(|tag| tag.attr("data-name").map(str::trim).filter(|n| !n.is_empty()))
        {
            return Some(name.to_string());
        }

        for class in ["profile__name", "profile-name", "user-name", "username"] {
            if let Some(tag) = tags.iter().find(|tag| tag.has_class(class)) {
                let rest = &html[tag.start..];
                let inner = &rest[rest.find('>').map_or(0, |gt| gt + 1)..];
                let until = inner.find("</").unwrap_or(inner.len());
                let name = self.text(&inner[..until]);
                if !name.is_empty() {
                    return Some(name);
                }
            }
        }
        None
    }
}
