//! User-defined rules: the stored tree, its runtime snapshot and the storage
//! operations that keep the two in step.

pub mod engine;
pub mod model;
pub mod service;

pub use engine::{MatchInput, MatchedRule, MockResponse, RequestMutations, ResponseMutations, RuleEngine, RulePlan, RuleSnapshot};
pub use model::{RuleAction, RuleData, RuleGroup, RuleMatch, RuleNode, RuleStorage};
pub use service::{AddRuleOptions, RuleService};
