//! PAC rule engine.
//!
//! ```text
//! rule text ──► PacRuleSet::parse ──► evaluate()         (local decision)
//!                                  └► generate_script()  (served script)
//! ```
//!
//! Successful regenerations land in [`LastGoodPac`], which is what the
//! evaluator and the PAC server read.

pub mod evaluator;
pub mod last_good;
pub mod rules;
pub mod script;

pub use evaluator::{
    domain_matches, evaluate, glob_to_regex, is_private_ipv4, normalize_input, proxy_directive,
    PacAction, PacEvaluation, RuleCheck, PRECEDENCE,
};
pub use last_good::{LastGoodPac, PacArtifacts, FALLBACK_PAC_SCRIPT};
pub use rules::PacRuleSet;
pub use script::{generate_script, js_string};
