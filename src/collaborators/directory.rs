//! In-memory advisor and content directory
//!
//! Stands in for the CRUD services that own advisor and content records.
//! Can be seeded from a JSON file:
//!
//! ```json
//! {
//!   "advisors": [
//!     { "id": "adv-1", "tier": "pro", "phone_number": "+14155550100" }
//!   ],
//!   "content": [
//!     { "advisor_id": "adv-1", "delivery_date": "2025-03-10",
//!       "variants": { "en": "Markets opened higher." } }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::debug;

use super::{AdvisorRepository, CollaboratorError, ContentRepository};
use crate::{Advisor, Content, ContentForDelivery, ContentSource, NewContent};

#[derive(Debug, Deserialize)]
struct Seed {
    #[serde(default)]
    advisors: Vec<Advisor>,
    #[serde(default)]
    content: Vec<SeedContent>,
}

#[derive(Debug, Deserialize)]
struct SeedContent {
    advisor_id: String,
    delivery_date: NaiveDate,
    variants: BTreeMap<String, String>,
}

#[derive(Default)]
struct State {
    advisors: Vec<Advisor>,
    /// Advisors that turned the channel off; their content is still listed
    disabled: HashSet<String>,
    content: HashMap<String, Content>,
}

#[derive(Default)]
pub struct InMemoryDirectory {
    state: RwLock<State>,
    next_id: AtomicU64,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading directory seed {}", path.display()))?;
        let seed: Seed = serde_json::from_str(&raw).context("invalid directory seed file")?;

        let directory = Self::new();
        for advisor in seed.advisors {
            directory.add_advisor(advisor);
        }
        for item in seed.content {
            directory.insert_content(
                item.advisor_id,
                item.delivery_date,
                item.variants,
                ContentSource::Submitted,
            );
        }
        debug!("loaded directory seed from {}", path.display());
        Ok(directory)
    }

    pub fn add_advisor(&self, advisor: Advisor) {
        let mut state = self.state.write();
        state.advisors.retain(|a| a.id != advisor.id);
        state.advisors.push(advisor);
    }

    /// Stop delivering to `advisor_id` without forgetting them.
    pub fn disable_channel(&self, advisor_id: &str) {
        self.state.write().disabled.insert(advisor_id.to_string());
    }

    /// Record content an advisor submitted for `date`.
    pub fn submit_content(
        &self,
        advisor_id: &str,
        date: NaiveDate,
        variants: BTreeMap<String, String>,
    ) -> Content {
        self.insert_content(
            advisor_id.to_string(),
            date,
            variants,
            ContentSource::Submitted,
        )
    }

    fn insert_content(
        &self,
        advisor_id: String,
        delivery_date: NaiveDate,
        variants: BTreeMap<String, String>,
        source: ContentSource,
    ) -> Content {
        let id = format!("content-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let content = Content {
            id: id.clone(),
            advisor_id,
            delivery_date,
            variants,
            source,
        };
        self.state.write().content.insert(id, content.clone());
        content
    }
}

#[async_trait]
impl ContentRepository for InMemoryDirectory {
    async fn content_for_delivery(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<ContentForDelivery>, CollaboratorError> {
        let state = self.state.read();
        let mut rows: Vec<ContentForDelivery> = state
            .content
            .values()
            .filter(|c| c.delivery_date == date)
            .filter_map(|c| {
                // Unknown advisors have no tier to schedule with
                let advisor = state.advisors.iter().find(|a| a.id == c.advisor_id)?;
                Some(ContentForDelivery {
                    advisor_id: c.advisor_id.clone(),
                    content_id: c.id.clone(),
                    language: advisor.language.clone(),
                    tier: advisor.tier,
                })
            })
            .collect();
        rows.sort_by(|a, b| a.advisor_id.cmp(&b.advisor_id));
        Ok(rows)
    }

    async fn advisor_has_content_for_date(
        &self,
        advisor_id: &str,
        date: NaiveDate,
    ) -> Result<bool, CollaboratorError> {
        let state = self.state.read();
        Ok(state
            .content
            .values()
            .any(|c| c.advisor_id == advisor_id && c.delivery_date == date))
    }

    async fn create_content(&self, content: NewContent) -> Result<Content, CollaboratorError> {
        if content.variants.is_empty() {
            return Err(CollaboratorError::Rejected(
                "content needs at least one language variant".to_string(),
            ));
        }
        Ok(self.insert_content(
            content.advisor_id,
            content.delivery_date,
            content.variants,
            content.source,
        ))
    }

    async fn get_content(&self, content_id: &str) -> Result<Option<Content>, CollaboratorError> {
        Ok(self.state.read().content.get(content_id).cloned())
    }

    async fn delete_content(&self, content_id: &str) -> Result<bool, CollaboratorError> {
        Ok(self.state.write().content.remove(content_id).is_some())
    }
}

#[async_trait]
impl AdvisorRepository for InMemoryDirectory {
    async fn list_active_channel_enabled(&self) -> Result<Vec<Advisor>, CollaboratorError> {
        let state = self.state.read();
        let mut advisors: Vec<Advisor> = state
            .advisors
            .iter()
            .filter(|a| !state.disabled.contains(&a.id))
            .cloned()
            .collect();
        advisors.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(advisors)
    }
}
