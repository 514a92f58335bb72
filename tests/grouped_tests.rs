//! Integration tests for per-observation (grouped) loads

mod common;

use common::*;
use maltopuft_loader::target::catalogue::{CANDIDATE_STAGE, OBSERVATION_STAGE};
use maltopuft_loader::{LoadError, LoadPlan, LoadStrategy, RowBatch, load_batches};
use std::collections::BTreeMap;

fn by_observation() -> LoadStrategy {
    LoadStrategy::Grouped {
        column: "observation_id".to_string(),
    }
}

fn meertrap_batches(observations: i64, beams: i64) -> BTreeMap<String, RowBatch> {
    BTreeMap::from([
        (
            OBSERVATION_STAGE.to_string(),
            observation_batch(observations, beams, "2024-01-01T04:00:00"),
        ),
        (
            CANDIDATE_STAGE.to_string(),
            candidate_batch(observations * beams, 3),
        ),
    ])
}

#[tokio::test]
async fn test_grouped_load_keeps_references_intact() {
    let mut conn = seeded_db().await;
    let mut batches = meertrap_batches(3, 2);

    let report = load_batches(&mut conn, &LoadPlan::meertrap(), &mut batches, &by_observation())
        .await
        .unwrap();
    assert_eq!(report.strategy, "grouped");

    assert_eq!(count(&mut conn, "observation").await, 3);
    assert_eq!(count(&mut conn, "host").await, 3);
    assert_eq!(count(&mut conn, "beam").await, 6);
    assert_eq!(count(&mut conn, "candidate").await, 18);
    assert_eq!(count(&mut conn, "sp_candidate").await, 18);

    // Hosts are shared between observations and staged once
    assert_eq!(report.target("host").unwrap().staged, 2);

    let observations = &batches[OBSERVATION_STAGE];
    assert_beams_follow_observations(&mut conn, observations).await;
    assert_candidates_follow_beams(&mut conn, observations, &batches[CANDIDATE_STAGE]).await;
}

#[tokio::test]
async fn test_grouped_and_bulk_loads_agree() {
    let mut grouped_conn = seeded_db().await;
    let mut grouped = meertrap_batches(3, 2);
    load_batches(&mut grouped_conn, &LoadPlan::meertrap(), &mut grouped, &by_observation())
        .await
        .unwrap();

    let mut bulk_conn = seeded_db().await;
    let mut bulk = meertrap_batches(3, 2);
    load_batches(&mut bulk_conn, &LoadPlan::meertrap(), &mut bulk, &LoadStrategy::Bulk)
        .await
        .unwrap();

    for (stage, batch) in &grouped {
        assert_eq!(batch.to_records(), bulk[stage].to_records(), "stage {}", stage);
    }
}

#[tokio::test]
async fn test_grouped_reload_is_idempotent() {
    let mut conn = seeded_db().await;
    let mut first = meertrap_batches(2, 2);
    load_batches(&mut conn, &LoadPlan::meertrap(), &mut first, &by_observation())
        .await
        .unwrap();

    let mut second = meertrap_batches(2, 2);
    let report = load_batches(&mut conn, &LoadPlan::meertrap(), &mut second, &by_observation())
        .await
        .unwrap();

    assert_eq!(count(&mut conn, "candidate").await, 12);
    assert_eq!(report.target("candidate").unwrap().fetched, 12);
    for (stage, batch) in &first {
        assert_eq!(batch.to_records(), second[stage].to_records(), "stage {}", stage);
    }
}

#[tokio::test]
async fn test_candidates_load_after_observations_in_separate_runs() {
    let mut conn = seeded_db().await;
    let mut observations = BTreeMap::from([(
        OBSERVATION_STAGE.to_string(),
        observation_batch(1, 2, "2024-01-01T04:00:00"),
    )]);
    load_batches(&mut conn, &LoadPlan::meertrap(), &mut observations, &by_observation())
        .await
        .unwrap();

    // The candidate run carries the observation batch again to resolve beams
    let mut batches = meertrap_batches(1, 2);
    load_batches(&mut conn, &LoadPlan::meertrap(), &mut batches, &by_observation())
        .await
        .unwrap();

    assert_eq!(count(&mut conn, "beam").await, 2);
    assert_eq!(count(&mut conn, "candidate").await, 6);
    assert_candidates_follow_beams(
        &mut conn,
        &batches[OBSERVATION_STAGE],
        &batches[CANDIDATE_STAGE],
    )
    .await;
}

#[tokio::test]
async fn test_grouped_load_needs_first_stage_batch() {
    let mut conn = fresh_db().await;
    let mut batches = BTreeMap::from([(CANDIDATE_STAGE.to_string(), candidate_batch(1, 1))]);
    let err = load_batches(&mut conn, &LoadPlan::meertrap(), &mut batches, &by_observation())
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::InvalidPlan(_)));
}
