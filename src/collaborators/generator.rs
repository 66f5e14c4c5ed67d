//! Pre-approved boilerplate content
//!
//! Produces compliant generic text without calling out to a model: each
//! (category, risk level) pair maps to a vetted sentence, and emergency
//! content is a neutral daily note addressed to the advisor's clients.

use async_trait::async_trait;
use rand::seq::SliceRandom;

use super::{CollaboratorError, ContentGenerator, GeneratedContent, GeneratedFallback};
use crate::{Advisor, RiskLevel, Tier};

const MARKET_FOCUSES: [&str; 4] = ["equity", "fixed_income", "hybrid", "general"];

#[derive(Debug, Clone)]
pub struct TemplateContentGenerator {
    language: String,
}

impl TemplateContentGenerator {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
        }
    }

    fn fallback_text(category: &str, risk_level: RiskLevel, focus: &str) -> String {
        let stance = match risk_level {
            RiskLevel::Conservative => "capital preservation and steady income",
            RiskLevel::Moderate => "a balance between growth and stability",
            RiskLevel::Aggressive => "long-term growth while accepting higher volatility",
        };
        let focus = focus.replace('_', " ");
        match category {
            "market_update" => format!(
                "Today's {focus} markets remain in focus. For investors prioritising {stance}, \
                 staying disciplined matters more than reacting to daily moves."
            ),
            "educational" => format!(
                "Did you know? A {focus} allocation aligned with {stance} works best when it is \
                 reviewed periodically rather than changed on headlines."
            ),
            _ => format!(
                "Portfolio tip: keep your {focus} holdings in line with a plan built around \
                 {stance}. Rebalancing keeps risk where you intended it."
            ),
        }
    }
}

impl Default for TemplateContentGenerator {
    fn default() -> Self {
        Self::new("en")
    }
}

#[async_trait]
impl ContentGenerator for TemplateContentGenerator {
    async fn generate_emergency_content(
        &self,
        advisor: &Advisor,
    ) -> Result<GeneratedContent, CollaboratorError> {
        let greeting = if advisor.name.is_empty() {
            "Your advisor".to_string()
        } else {
            advisor.name.clone()
        };
        Ok(GeneratedContent {
            text: format!(
                "{greeting} shares today's reminder: markets move daily, goals do not. \
                 Stay invested according to your plan and reach out with any questions."
            ),
            language: self.language.clone(),
        })
    }

    async fn generate_fallback_content(
        &self,
        category: &str,
        tier: Tier,
        risk_level: RiskLevel,
    ) -> Result<GeneratedFallback, CollaboratorError> {
        if category.is_empty() {
            return Err(CollaboratorError::Rejected("empty category".to_string()));
        }
        let focus = MARKET_FOCUSES
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or("general");

        let mut text = Self::fallback_text(category, risk_level, focus);
        if tier == Tier::Pro {
            text.push_str(" Reply to this message to schedule a one-on-one review.");
        }

        Ok(GeneratedFallback {
            text,
            market_focus: focus.to_string(),
        })
    }
}
