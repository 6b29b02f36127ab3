//! # Router
//!
//! Deterministic decision table from [`InputDescriptor`] to [`Route`].
//! Rules are evaluated in order and the first match wins:
//!
//! 1. explicit mode override
//! 2. repository source + hybrid signal phrase → `Hybrid`
//! 3. repository source → `InternalRepo`
//! 4. existing work-order file → `WebResearch` (reusing the file)
//! 5. anything else → `WebResearch`
//!
//! Rule 5 is the catch-all, so the table is total.

use serde::{Deserialize, Serialize};

use crate::models::{InputDescriptor, Route};

/// Phrases in the domain text that ask for external research alongside a repository
pub const HYBRID_SIGNALS: &[&str] = &[
    "industry",
    "industry standard",
    "standard",
    "standards",
    "best practice",
    "best practices",
    "state of the art",
    "current practices",
    "conventions",
];

/// Which table row matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteRule {
    ExplicitOverride,
    RepoWithHybridSignal,
    RepoSource,
    ExistingPromptFile,
    Default,
}

impl RouteRule {
    /// 1-based row number in the decision table
    pub fn number(&self) -> u8 {
        match self {
            Self::ExplicitOverride => 1,
            Self::RepoWithHybridSignal => 2,
            Self::RepoSource => 3,
            Self::ExistingPromptFile => 4,
            Self::Default => 5,
        }
    }
}

/// The router's answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub route: Route,
    pub rule: RouteRule,
    /// The request's existing work-order file is used instead of synthesizing one
    pub uses_existing_prompt: bool,
}

/// Whether `text` contains a hybrid signal phrase (whole words, case-insensitive)
pub fn has_hybrid_signal(text: &str) -> bool {
    let words: Vec<String> = text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
        .collect();
    let haystack = format!(" {} ", words.join(" "));
    HYBRID_SIGNALS
        .iter()
        .any(|phrase| haystack.contains(&format!(" {} ", phrase)))
}

/// Apply the decision table
pub fn route(descriptor: &InputDescriptor) -> RouteDecision {
    let signals = &descriptor.source_signals;

    let (route, rule) = match signals.explicit_mode_override {
        Some(over) if over != Route::Unresolved => (over, RouteRule::ExplicitOverride),
        _ if signals.has_repo_source() && has_hybrid_signal(&descriptor.domain_text) => {
            (Route::Hybrid, RouteRule::RepoWithHybridSignal)
        }
        _ if signals.has_repo_source() => (Route::InternalRepo, RouteRule::RepoSource),
        _ if signals.has_existing_prompt_file => {
            (Route::WebResearch, RouteRule::ExistingPromptFile)
        }
        _ => (Route::WebResearch, RouteRule::Default),
    };

    let decision = RouteDecision {
        route,
        rule,
        uses_existing_prompt: signals.has_existing_prompt_file && route.needs_work_order(),
    };
    tracing::info!(
        "Routed '{}' to {} (rule {})",
        descriptor.target_name,
        decision.route,
        decision.rule.number()
    );
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceSignals;
    use crate::tools::classifier::classify;

    fn descriptor(signals: SourceSignals, domain_text: &str) -> InputDescriptor {
        InputDescriptor {
            raw_request: domain_text.to_string(),
            target_name: "target".to_string(),
            target_purpose: domain_text.to_string(),
            source_signals: signals,
            local_path: None,
            remote_url: None,
            prompt_file: None,
            domain_text: domain_text.to_string(),
            classifier_version: 1,
        }
    }

    /// Reference table written independently of the `match` above
    fn expected(signals: &SourceSignals, hybrid: bool) -> (Route, RouteRule) {
        if let Some(r) = signals.explicit_mode_override.filter(|r| *r != Route::Unresolved) {
            return (r, RouteRule::ExplicitOverride);
        }
        let repo = signals.has_local_path || signals.has_remote_url;
        if repo && hybrid {
            (Route::Hybrid, RouteRule::RepoWithHybridSignal)
        } else if repo {
            (Route::InternalRepo, RouteRule::RepoSource)
        } else if signals.has_existing_prompt_file {
            (Route::WebResearch, RouteRule::ExistingPromptFile)
        } else {
            (Route::WebResearch, RouteRule::Default)
        }
    }

    #[test]
    fn test_router_is_total_over_all_signal_combinations() {
        let overrides = [
            None,
            Some(Route::Unresolved),
            Some(Route::WebResearch),
            Some(Route::InternalRepo),
            Some(Route::Hybrid),
        ];
        let mut checked = 0;
        for bits in 0u8..16 {
            for over in overrides {
                for text in ["pod security", "follow industry best practices"] {
                    let signals = SourceSignals {
                        has_local_path: bits & 1 != 0,
                        has_remote_url: bits & 2 != 0,
                        has_existing_prompt_file: bits & 4 != 0,
                        has_free_text_domain: bits & 8 != 0,
                        explicit_mode_override: over,
                    };
                    let want = expected(&signals, has_hybrid_signal(text));
                    let decision = route(&descriptor(signals, text));

                    assert_ne!(decision.route, Route::Unresolved);
                    assert_eq!((decision.route, decision.rule), want);
                    checked += 1;
                }
            }
        }
        assert_eq!(checked, 16 * 5 * 2);
    }

    #[test]
    fn test_hybrid_signal_is_word_based() {
        assert!(has_hybrid_signal("Current Best-Practices for pods"));
        assert!(has_hybrid_signal("state of the art tooling"));
        assert!(!has_hybrid_signal("standardize the config"));
        assert!(!has_hybrid_signal(""));
    }

    #[test]
    fn test_scenario_routes_from_classified_requests() {
        assert_eq!(
            route(&classify("create agent for kubernetes-security")).route,
            Route::WebResearch
        );
        assert_eq!(
            route(&classify("create agent from ./my-repo")).route,
            Route::InternalRepo
        );
        assert_eq!(
            route(&classify(
                "create agent from https://github.com/org/repo with current best practices"
            ))
            .route,
            Route::Hybrid
        );
    }

    #[test]
    fn test_existing_prompt_file_is_reused() {
        let decision = route(&classify("use ./k8s.prompt.md for kubernetes-security"));
        assert_eq!(decision.route, Route::WebResearch);
        assert_eq!(decision.rule, RouteRule::ExistingPromptFile);
        assert!(decision.uses_existing_prompt);

        let decision = route(&classify("agent for kubernetes-security"));
        assert!(!decision.uses_existing_prompt);
    }
}
