//! Site collaborators backed by HTTP
//!
//! Implements `Extractor`, `TradeApi` and `ClubActions` over any
//! `Transport`. Records are validated here: entries missing an id or a rank
//! are dropped instead of being passed on half-filled.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{RemoteError, RemoteResult};
use crate::html::PageParser;
use crate::site::{ClubActions, Extractor, OwnersPage, PartnerItem, TradeApi};
use crate::transport::{HttpResponse, Transport};
use crate::types::{ClubMember, Item, QuotaCounts, TargetResource, TradeHistoryEntry};

/// Entries per page of the inventory endpoint
const INVENTORY_PAGE_SIZE: usize = 60;
/// Upper bound on inventory pages walked while looking up the target
const MAX_LOOKUP_PAGES: usize = 50;

/// Pagination-based estimate of a listing's length
#[derive(Debug, Clone, Copy)]
struct ListingShape {
    per_page: u32,
    /// From this many pages on, the last page is estimated instead of loaded
    approximate_from: u32,
    last_page_estimate: u32,
}

const OWNERS_LISTING: ListingShape = ListingShape {
    per_page: 36,
    approximate_from: 11,
    last_page_estimate: 18,
};

const WANTS_LISTING: ListingShape = ListingShape {
    per_page: 60,
    approximate_from: 5,
    last_page_estimate: 30,
};

const WANTS_CLASSES: &[&str] = &["profile__friends-item", "users-list__item", "user-card"];
const OWNER_CLASSES: &[&str] = &["card-show__owner"];

/// HTTP implementation of every site collaborator
pub struct HttpSite {
    transport: Arc<dyn Transport>,
    parser: PageParser,
    csrf_token: String,
    replacement_threshold: u32,
    first_page_skip: usize,
    default_donations_max: u32,
    default_replacements_max: u32,
}

impl HttpSite {
    pub fn new(transport: Arc<dyn Transport>, settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            transport,
            parser: PageParser::new()?,
            csrf_token: settings.session.csrf_token.clone().unwrap_or_default(),
            replacement_threshold: settings.runner.replacement_threshold,
            first_page_skip: settings.trade.first_page_skip,
            default_donations_max: settings.quota.default_donations_max,
            default_replacements_max: settings.quota.default_replacements_max,
        })
    }

    async fn page(&self, path: &str) -> RemoteResult<String> {
        Ok(self.transport.get(path).await?.ensure_success()?.body)
    }

    /// Raw card objects of one inventory page
    async fn inventory_page(&self, user_id: u64, offset: u64) -> RemoteResult<Vec<Value>> {
        let path = format!("/trades/{}/availableCardsLoad", user_id);
        let form = vec![("offset".to_string(), offset.to_string())];
        let response = self.transport.post_form(&path, &form).await?.ensure_success()?;
        let data: Value = response.json()?;

        Ok(data
            .get("cards")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Listing length from the pager: exact for short listings, estimated
    /// for long ones or when the last page cannot be loaded
    async fn count_listing(
        &self,
        path: &str,
        classes: &[&str],
        shape: ListingShape,
    ) -> RemoteResult<u32> {
        let first = self.page(path).await?;
        let max_page = self.parser.max_page(&first);

        if max_page == 1 {
            return Ok(self.parser.count_with_class(&first, classes) as u32);
        }

        let full_pages = (max_page - 1) * shape.per_page;
        if max_page >= shape.approximate_from {
            return Ok(full_pages + shape.last_page_estimate);
        }

        match self.page(&format!("{}?page={}", path, max_page)).await {
            Ok(last) => Ok(full_pages + self.parser.count_with_class(&last, classes) as u32),
            Err(e) => {
                debug!("Last page of {} unavailable ({}), estimating", path, e);
                Ok(full_pages + shape.last_page_estimate)
            }
        }
    }

    /// Name, rank and instance of `resource_id`, looked up in the inventory of
    /// the last owner on the first listing page
    async fn lookup_resource(
        &self,
        resource_id: u64,
    ) -> RemoteResult<Option<(String, String, u64)>> {
        let listing = self.page(&format!("/cards/{}/users", resource_id)).await?;
        let Some(owner_id) = self.parser.owner_ids(&listing).last().copied() else {
            warn!("No owners listed for resource {}", resource_id);
            return Ok(None);
        };

        let mut offset = 0u64;
        for _ in 0..MAX_LOOKUP_PAGES {
            let cards = self.inventory_page(owner_id, offset).await?;
            for card in &cards {
                if let Some(item) = item_from_card(card) {
                    if item.item_id == resource_id {
                        return Ok(Some((item.name, item.rank, item.instance_id)));
                    }
                }
            }
            if cards.len() < INVENTORY_PAGE_SIZE {
                break;
            }
            offset += cards.len() as u64;
        }

        warn!("Resource {} not found in inventory of owner {}", resource_id, owner_id);
        Ok(None)
    }

    async fn club_members(&self, boost_page: &str) -> Vec<ClubMember> {
        let mut members = Vec::new();
        for user_id in self.parser.club_member_ids(boost_page) {
            let username = match self.page(&format!("/users/{}", user_id)).await {
                Ok(profile) => self.parser.profile_name(&profile),
                Err(e) => {
                    debug!("Profile {} unavailable: {}", user_id, e);
                    None
                }
            };
            members.push(ClubMember {
                user_id,
                username: username.unwrap_or_else(|| format!("User{}", user_id)),
            });
        }
        members
    }
}

#[async_trait]
impl Extractor for HttpSite {
    async fn list_owners(&self, resource_id: u64, page: u32) -> RemoteResult<OwnersPage> {
        let path = if page > 1 {
            format!("/cards/{}/users?page={}", resource_id, page)
        } else {
            format!("/cards/{}/users", resource_id)
        };
        let html = self.page(&path).await?;

        Ok(OwnersPage {
            owners: self.parser.owners(&html, page, self.first_page_skip),
            has_next: self.parser.has_next_page(&html),
        })
    }

    async fn item_demand(&self, item_id: u64) -> RemoteResult<u32> {
        self.count_listing(&format!("/cards/{}/offers/want", item_id), WANTS_CLASSES, WANTS_LISTING)
            .await
    }

    async fn target_resource(&self, url: &str) -> RemoteResult<Option<TargetResource>> {
        let boost_page = self.page(url).await?;
        let Some(resource_id) = self.parser.target_card_id(&boost_page) else {
            warn!("Club page carries no target resource");
            return Ok(None);
        };

        let (name, rank, instance_id) = match self.lookup_resource(resource_id).await? {
            Some(found) => found,
            None => {
                warn!("Could not resolve name/rank of resource {}", resource_id);
                (String::new(), "?".to_string(), 0)
            }
        };

        let owner_count = self
            .count_listing(&format!("/cards/{}/users", resource_id), OWNER_CLASSES, OWNERS_LISTING)
            .await?;
        let demand_count = self.item_demand(resource_id).await?;
        let members = self.club_members(&boost_page).await;

        info!(
            "Target resource {} ({}) rank {}: {} owners, {} wanting",
            resource_id, name, rank, owner_count, demand_count
        );

        Ok(Some(
            TargetResource::new(
                resource_id,
                instance_id,
                &rank,
                demand_count,
                owner_count,
                self.replacement_threshold,
            )
            .with_name(&name)
            .with_members(members),
        ))
    }

    async fn current_target_id(&self, url: &str) -> RemoteResult<Option<u64>> {
        Ok(self.parser.target_card_id(&self.page(url).await?))
    }

    async fn acquisition_available(&self, url: &str) -> RemoteResult<bool> {
        Ok(self.parser.has_contribute_button(&self.page(url).await?))
    }

    async fn my_inventory(&self, user_id: u64) -> RemoteResult<Vec<Item>> {
        let mut items = Vec::new();
        let mut dropped = 0usize;
        let mut offset = 0u64;

        loop {
            let cards = self.inventory_page(user_id, offset).await?;
            for card in &cards {
                match item_from_card(card) {
                    Some(item) => items.push(item),
                    None => dropped += 1,
                }
            }
            if cards.len() < INVENTORY_PAGE_SIZE {
                break;
            }
            offset += cards.len() as u64;
        }

        if dropped > 0 {
            warn!("Dropped {} inventory entries without id or rank", dropped);
        }
        Ok(items)
    }

    async fn trade_history(&self, user_id: u64) -> RemoteResult<Vec<TradeHistoryEntry>> {
        let html = self.page(&format!("/users/{}/trades", user_id)).await?;
        Ok(self.parser.trade_history(&html))
    }

    async fn quota_counts(&self, url: &str) -> RemoteResult<QuotaCounts> {
        let html = self.page(url).await?;
        let (replacements_used, replacements_max) = self
            .parser
            .replacement_counts(&html)
            .unwrap_or((0, self.default_replacements_max));
        let (donations_used, donations_max) = self
            .parser
            .donation_counts(&html)
            .unwrap_or((0, self.default_donations_max));

        Ok(QuotaCounts {
            donations_used,
            donations_max,
            replacements_used,
            replacements_max,
        })
    }
}

#[async_trait]
impl TradeApi for HttpSite {
    async fn partner_items(&self, owner_id: u64, offset: u64) -> RemoteResult<Vec<PartnerItem>> {
        let cards = self.inventory_page(owner_id, offset).await?;
        Ok(cards.iter().filter_map(partner_item_from_card).collect())
    }

    async fn create_trade(
        &self,
        owner_id: u64,
        my_instance_id: u64,
        their_instance_id: u64,
    ) -> RemoteResult<Option<u64>> {
        let form = vec![
            ("receiver_id".to_string(), owner_id.to_string()),
            ("creator_card_ids[]".to_string(), my_instance_id.to_string()),
            ("receiver_card_ids[]".to_string(), their_instance_id.to_string()),
        ];
        let response = self.transport.post_form("/trades/create", &form).await?;

        match response.status {
            429 => Err(RemoteError::Throttled),
            422 => Err(RemoteError::Conflict(format!(
                "instance {} already in a trade",
                my_instance_id
            ))),
            status => trade_created(&response).ok_or(RemoteError::Status { status }),
        }
    }

    async fn cancel_all(&self) -> RemoteResult<()> {
        self.transport
            .get("/trades/rejectAll?type_trade=sender")
            .await?
            .ensure_success()
            .map(|_| ())
    }
}

#[async_trait]
impl ClubActions for HttpSite {
    async fn contribute(&self, instance_id: u64) -> RemoteResult<()> {
        let form = vec![
            ("card_id".to_string(), instance_id.to_string()),
            ("_token".to_string(), self.csrf_token.clone()),
        ];
        self.transport
            .post_form("/clubs/boost", &form)
            .await?
            .ensure_success()
            .map(|_| ())
    }

    async fn replace_target(&self) -> RemoteResult<()> {
        let form = vec![("_token".to_string(), self.csrf_token.clone())];
        self.transport
            .post_form("/clubs/replace", &form)
            .await?
            .ensure_success()
            .map(|_| ())
    }
}

/// Numeric id that may arrive as a JSON number or string
fn id_of(value: Option<&Value>) -> Option<u64> {
    let id = match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    id.filter(|id| *id > 0)
}

fn text_of(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty() && s != "0" && s != "false",
        _ => false,
    }
}

/// Inventory entry → `Item`; the kind id and rank may sit on a nested `card`
pub(crate) fn item_from_card(card: &Value) -> Option<Item> {
    let nested = card.get("card").filter(|c| c.is_object());

    let item_id = id_of(card.get("card_id")).or_else(|| {
        nested.and_then(|n| id_of(n.get("id")).or_else(|| id_of(n.get("card_id"))))
    })?;
    let rank = text_of(card.get("rank"))
        .or_else(|| text_of(card.get("grade")))
        .or_else(|| {
            nested.and_then(|n| text_of(n.get("rank")).or_else(|| text_of(n.get("grade"))))
        })?;
    let instance_id = id_of(card.get("id"))?;
    let name = text_of(card.get("name"))
        .or_else(|| text_of(card.get("title")))
        .or_else(|| nested.and_then(|n| text_of(n.get("name")).or_else(|| text_of(n.get("title")))))
        .unwrap_or_default();

    Some(Item::new(item_id, instance_id, rank).with_name(name))
}

fn partner_item_from_card(card: &Value) -> Option<PartnerItem> {
    let nested = card.get("card").filter(|c| c.is_object());
    let item_id = id_of(card.get("card_id")).or_else(|| {
        nested.and_then(|n| id_of(n.get("id")).or_else(|| id_of(n.get("card_id"))))
    })?;
    let instance_id = id_of(card.get("id"))?;

    Some(PartnerItem {
        item_id,
        instance_id,
        locked: ["locked", "is_locked", "lock"].iter().any(|k| truthy(card.get(*k))),
        in_trade: ["in_trade", "is_in_trade", "trading"]
            .iter()
            .any(|k| truthy(card.get(*k))),
    })
}

/// `Some(offer_id)` when a create response confirms the trade
fn trade_created(response: &HttpResponse) -> Option<Option<u64>> {
    let from_location = response.location.as_deref().and_then(|location| {
        location
            .split("/trades/")
            .nth(1)
            .and_then(|rest| rest.split(|c: char| !c.is_ascii_digit()).next())
            .and_then(|digits| digits.parse::<u64>().ok())
    });

    let json: Option<Value> = serde_json::from_str(&response.body).ok();
    let from_json = json
        .as_ref()
        .and_then(|data| data.get("trade"))
        .and_then(|trade| id_of(trade.get("id")));

    let offer_id = from_json.or(from_location);

    if response.status == 200 {
        return Some(offer_id);
    }
    if matches!(response.status, 301 | 302)
        && response.location.as_deref().is_some_and(|l| l.contains("/trades/"))
    {
        return Some(offer_id);
    }
    if let Some(data) = json.as_ref().filter(|d| d.is_object()) {
        if truthy(data.get("success")) || truthy(data.get("ok")) || from_json.is_some() {
            return Some(offer_id);
        }
    }

    let body = response.body.to_lowercase();
    if ["успеш", "отправ", "создан"].iter().any(|w| body.contains(w)) {
        return Some(offer_id);
    }
    None
}
