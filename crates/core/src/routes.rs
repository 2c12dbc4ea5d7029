//! Ordered route table.
//!
//! Rules are plain records evaluated by a pure matching function: the first
//! rule whose predicate accepts the request decides the strategy and the
//! target compartment. A request no rule accepts passes straight through to
//! the network.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::manifest::is_precache_compartment;
use crate::request::{Destination, Request};
use crate::url::has_file_extension;

/// Which requests a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "kebab-case")]
pub enum Predicate {
    /// Request destination is one of the listed classes.
    Destination { destinations: Vec<Destination> },
    /// Full-document navigation to an application route (no file extension,
    /// not under a reserved prefix).
    Navigation,
    /// Every request.
    Any,
}

/// How a matched request is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    CacheFirst,
    StaleWhileRevalidate,
    /// Serve the precached application shell.
    NavigationFallback,
    /// Go to the network, never cache.
    NetworkOnly,
}

impl StrategyKind {
    /// Whether the strategy writes into a runtime compartment.
    pub fn needs_compartment(&self) -> bool {
        matches!(self, StrategyKind::CacheFirst | StrategyKind::StaleWhileRevalidate)
    }
}

/// One (predicate, strategy, compartment) binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub name: String,
    pub predicate: Predicate,
    pub strategy: StrategyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compartment: Option<String>,
}

impl RouteRule {
    pub fn new(name: &str, predicate: Predicate, strategy: StrategyKind, compartment: Option<&str>) -> Self {
        Self { name: name.to_string(), predicate, strategy, compartment: compartment.map(str::to_string) }
    }
}

/// Configuration errors found by [`RouteTable::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("destination {destination} is claimed by both `{first}` and `{second}`")]
    OverlappingDestination { destination: Destination, first: String, second: String },

    #[error("rule `{rule}` can never match: `{shadowed_by}` matches every request")]
    Unreachable { rule: String, shadowed_by: String },

    #[error("navigation is claimed by both `{first}` and `{second}`")]
    DuplicateNavigation { first: String, second: String },

    #[error("rule name `{0}` is used more than once")]
    DuplicateName(String),

    #[error("rule `{0}` needs a compartment")]
    MissingCompartment(String),

    #[error("rule `{rule}` targets reserved precache compartment `{compartment}`")]
    ReservedCompartment { rule: String, compartment: String },

    #[error("rule `{0}` uses navigation-fallback without the navigation predicate")]
    FallbackWithoutNavigation(String),
}

/// Ordered list of route rules plus the navigation predicate's parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
    reserved_prefixes: Vec<String>,
}

impl RouteTable {
    pub fn new(rules: Vec<RouteRule>, reserved_prefixes: Vec<String>) -> Self {
        Self { rules, reserved_prefixes }
    }

    /// The stock table: images and fonts cache-first, scripts and styles
    /// stale-while-revalidate, navigations to the application shell.
    pub fn default_rules() -> Vec<RouteRule> {
        vec![
            RouteRule::new(
                "images",
                Predicate::Destination { destinations: vec![Destination::Image] },
                StrategyKind::CacheFirst,
                Some("images"),
            ),
            RouteRule::new(
                "fonts",
                Predicate::Destination { destinations: vec![Destination::Font] },
                StrategyKind::CacheFirst,
                Some("fonts"),
            ),
            RouteRule::new(
                "static-resources",
                Predicate::Destination { destinations: vec![Destination::Script, Destination::Style] },
                StrategyKind::StaleWhileRevalidate,
                Some("static-resources"),
            ),
            RouteRule::new("navigation", Predicate::Navigation, StrategyKind::NavigationFallback, None),
        ]
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn reserved_prefixes(&self) -> &[String] {
        &self.reserved_prefixes
    }

    /// First rule accepting `request`, or None for network pass-through.
    ///
    /// Only GET requests are ever routed.
    pub fn find(&self, request: &Request) -> Option<&RouteRule> {
        if !request.is_cacheable_method() {
            return None;
        }
        self.rules.iter().find(|rule| self.matches(&rule.predicate, request))
    }

    pub fn matches(&self, predicate: &Predicate, request: &Request) -> bool {
        match predicate {
            Predicate::Destination { destinations } => destinations.contains(&request.destination),
            Predicate::Navigation => self.is_app_navigation(request),
            Predicate::Any => true,
        }
    }

    /// A page load for an application route rather than a static file.
    pub fn is_app_navigation(&self, request: &Request) -> bool {
        if !request.navigate {
            return false;
        }
        let path = request.url.path();
        if self.reserved_prefixes.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            return false;
        }
        !has_file_extension(&request.url)
    }

    /// Distinct runtime compartments written by the table, in rule order.
    pub fn runtime_compartments(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.rules
            .iter()
            .filter_map(|rule| rule.compartment.as_deref())
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Check that every rule is reachable and predicates do not overlap.
    pub fn validate(&self) -> Result<(), RouteError> {
        let mut names = BTreeSet::new();
        let mut claimed: HashMap<Destination, &str> = HashMap::new();
        let mut navigation: Option<&str> = None;
        let mut catch_all: Option<&str> = None;

        for rule in &self.rules {
            if !names.insert(rule.name.as_str()) {
                return Err(RouteError::DuplicateName(rule.name.clone()));
            }
            if let Some(shadow) = catch_all {
                return Err(RouteError::Unreachable { rule: rule.name.clone(), shadowed_by: shadow.to_string() });
            }

            match &rule.predicate {
                Predicate::Destination { destinations } => {
                    for destination in destinations {
                        if let Some(first) = claimed.insert(*destination, rule.name.as_str()) {
                            return Err(RouteError::OverlappingDestination {
                                destination: *destination,
                                first: first.to_string(),
                                second: rule.name.clone(),
                            });
                        }
                    }
                }
                Predicate::Navigation => {
                    if let Some(first) = navigation.replace(rule.name.as_str()) {
                        return Err(RouteError::DuplicateNavigation {
                            first: first.to_string(),
                            second: rule.name.clone(),
                        });
                    }
                }
                Predicate::Any => catch_all = Some(rule.name.as_str()),
            }

            if rule.strategy == StrategyKind::NavigationFallback && rule.predicate != Predicate::Navigation {
                return Err(RouteError::FallbackWithoutNavigation(rule.name.clone()));
            }

            match rule.compartment.as_deref() {
                None if rule.strategy.needs_compartment() => {
                    return Err(RouteError::MissingCompartment(rule.name.clone()));
                }
                Some(compartment) if is_precache_compartment(compartment) => {
                    return Err(RouteError::ReservedCompartment {
                        rule: rule.name.clone(),
                        compartment: compartment.to_string(),
                    });
                }
                _ => {}
            }
        }

        Ok(())
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(Self::default_rules(), vec!["/_".to_string()])
    }
}
