//! Built-in MALTOPUFT target catalogues
//!
//! Targets are listed leaves first. Unique constraint names follow the
//! PostgreSQL default `{table}_{columns}_key` naming.

use super::{LoadPlan, Stage, TargetDescriptor, UniqueConstraint};

/// Stage name for MeerTRAP observation metadata
pub const OBSERVATION_STAGE: &str = "observation";
/// Stage name for MeerTRAP single pulse candidates
pub const CANDIDATE_STAGE: &str = "candidate";
/// Stage name for the ATNF pulsar catalogue
pub const ATNF_STAGE: &str = "atnf";

fn unique(table: &str, columns: &[&str]) -> UniqueConstraint {
    UniqueConstraint::new(format!("{}_{}_key", table, columns.join("_")), columns)
}

fn target(table: &str, prefix: &str, foreign_keys: &[&str], unique_on: &[&str]) -> TargetDescriptor {
    TargetDescriptor::for_table(table)
        .with_prefix(prefix)
        .with_foreign_keys(foreign_keys)
        .with_unique_constraint(unique(table, unique_on))
}

/// Observation metadata targets
pub fn observation_targets() -> Vec<TargetDescriptor> {
    vec![
        target("schedule_block", "sb.", &[], &["start_at"]),
        target(
            "meerkat_schedule_block",
            "mk_sb.",
            &["schedule_block_id"],
            &["meerkat_id"],
        ),
        target("host", "host.", &[], &["ip_address", "hostname", "port"]),
        target(
            "coherent_beam_config",
            "cb.",
            &[],
            &["angle", "fraction_overlap", "x", "y"],
        ),
        // t_max is estimated from the candidates seen so far and changes
        // between runs over the same observation.
        target(
            "observation",
            "obs.",
            &["coherent_beam_config_id", "schedule_block_id"],
            &["schedule_block_id", "t_min"],
        )
        .excluding_from_match("t_max"),
        target("tiling_config", "tiling.", &["observation_id"], &["observation_id"]),
        target(
            "beam",
            "beam.",
            &["observation_id", "host_id"],
            &["observation_id", "number"],
        ),
    ]
}

/// Single pulse candidate targets
pub fn candidate_targets() -> Vec<TargetDescriptor> {
    vec![
        target(
            "candidate",
            "cand.",
            &["beam_id"],
            &["beam_id", "dm", "snr", "ra", "dec", "width"],
        ),
        target("sp_candidate", "sp_cand.", &["candidate_id"], &["candidate_id"]),
    ]
}

/// ATNF pulsar catalogue targets
pub fn atnf_targets() -> Vec<TargetDescriptor> {
    vec![
        target("catalogue", "cat.", &[], &["name"]),
        target(
            "catalogue_visit",
            "cat_visit.",
            &["catalogue_id"],
            &["catalogue_id", "visited_at"],
        ),
        target("known_pulsar", "known_ps.", &["catalogue_id"], &["name"]),
    ]
}

impl LoadPlan {
    /// Observation metadata followed by candidates
    pub fn meertrap() -> Self {
        Self::new(vec![
            Stage::new(OBSERVATION_STAGE, observation_targets()),
            Stage::new(CANDIDATE_STAGE, candidate_targets()),
        ])
    }

    /// ATNF pulsar catalogue
    pub fn atnf() -> Self {
        Self::new(vec![Stage::new(ATNF_STAGE, atnf_targets())])
    }

    /// Look up a built-in plan by name
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "meertrap" => Some(Self::meertrap()),
            "atnf" => Some(Self::atnf()),
            _ => None,
        }
    }
}
