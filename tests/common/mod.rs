//! Shared fixtures: a MeerTRAP-like SQLite schema and batch builders

#![allow(dead_code)]

use maltopuft_loader::batch::key_of;
use maltopuft_loader::{Key, LoadConnection, RowBatch, SqliteConnection};
use serde_json::{Map, Value, json};

pub const SCHEMA: &str = r#"
CREATE TABLE schedule_block (
    id INTEGER PRIMARY KEY,
    start_at TEXT NOT NULL,
    est_end_at TEXT,
    CONSTRAINT schedule_block_start_at_key UNIQUE (start_at)
);
CREATE TABLE meerkat_schedule_block (
    id INTEGER PRIMARY KEY,
    meerkat_id INTEGER NOT NULL,
    meerkat_id_code TEXT,
    proposal_id TEXT,
    schedule_block_id INTEGER NOT NULL REFERENCES schedule_block (id),
    CONSTRAINT meerkat_schedule_block_meerkat_id_key UNIQUE (meerkat_id)
);
CREATE TABLE host (
    id INTEGER PRIMARY KEY,
    ip_address TEXT NOT NULL,
    hostname TEXT NOT NULL,
    port INTEGER NOT NULL,
    CONSTRAINT host_ip_address_hostname_port_key UNIQUE (ip_address, hostname, port)
);
CREATE TABLE coherent_beam_config (
    id INTEGER PRIMARY KEY,
    angle REAL NOT NULL,
    fraction_overlap REAL NOT NULL,
    x REAL NOT NULL,
    y REAL NOT NULL,
    CONSTRAINT coherent_beam_config_angle_fraction_overlap_x_y_key
        UNIQUE (angle, fraction_overlap, x, y)
);
CREATE TABLE observation (
    id INTEGER PRIMARY KEY,
    t_min TEXT NOT NULL,
    t_max TEXT,
    nbeam INTEGER,
    coherent_beam_config_id INTEGER NOT NULL REFERENCES coherent_beam_config (id),
    schedule_block_id INTEGER NOT NULL REFERENCES schedule_block (id),
    CONSTRAINT observation_schedule_block_id_t_min_key UNIQUE (schedule_block_id, t_min)
);
CREATE TABLE tiling_config (
    id INTEGER PRIMARY KEY,
    target TEXT,
    ra TEXT,
    dec TEXT,
    observation_id INTEGER NOT NULL REFERENCES observation (id),
    CONSTRAINT tiling_config_observation_id_key UNIQUE (observation_id)
);
CREATE TABLE beam (
    id INTEGER PRIMARY KEY,
    number INTEGER NOT NULL,
    coherent INTEGER,
    observation_id INTEGER NOT NULL REFERENCES observation (id),
    host_id INTEGER NOT NULL REFERENCES host (id),
    CONSTRAINT beam_observation_id_number_key UNIQUE (observation_id, number)
);
CREATE TABLE candidate (
    id INTEGER PRIMARY KEY,
    dm REAL NOT NULL,
    snr REAL NOT NULL,
    ra TEXT,
    dec TEXT,
    width REAL NOT NULL,
    beam_id INTEGER NOT NULL REFERENCES beam (id),
    CONSTRAINT candidate_beam_id_dm_snr_ra_dec_width_key
        UNIQUE (beam_id, dm, snr, ra, dec, width)
);
CREATE TABLE sp_candidate (
    id INTEGER PRIMARY KEY,
    observed_at TEXT NOT NULL,
    plot_path TEXT,
    candidate_id INTEGER NOT NULL REFERENCES candidate (id),
    CONSTRAINT sp_candidate_candidate_id_key UNIQUE (candidate_id)
);
"#;

/// Rows already in the database before the pipeline runs, so database
/// keys are offset from the local keys
pub const PREEXISTING: &str = r#"
INSERT INTO schedule_block (start_at) VALUES ('1999-01-01T00:00:00');
INSERT INTO host (ip_address, hostname, port) VALUES ('10.0.0.1', 'legacy', 1);
INSERT INTO coherent_beam_config (angle, fraction_overlap, x, y) VALUES (0.0, 0.0, 0.0, 0.0);
"#;

pub async fn fresh_db() -> SqliteConnection {
    let mut conn = SqliteConnection::in_memory().unwrap();
    conn.execute_batch(SCHEMA).await.unwrap();
    conn
}

pub async fn seeded_db() -> SqliteConnection {
    let mut conn = fresh_db().await;
    conn.execute_batch(PREEXISTING).await.unwrap();
    conn
}

fn record(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => unreachable!("records are objects"),
    }
}

/// One row per beam; observation `k` has schedule block, config and tiling
/// keyed `k`; beam number `n` runs on host `n + 1` in every observation
pub fn observation_batch(observations: i64, beams: i64, t_max: &str) -> RowBatch {
    let mut records = Vec::new();
    for k in 1..=observations {
        let start_at = format!("2024-01-{:02}T00:00:00", k);
        for n in 0..beams {
            records.push(record(json!({
                "schedule_block_id": k,
                "sb.start_at": start_at,
                "sb.est_end_at": format!("2024-01-{:02}T04:00:00", k),
                "meerkat_schedule_block_id": k,
                "mk_sb.meerkat_id": 1000 + k,
                "mk_sb.meerkat_id_code": format!("20240101-{:04}", k),
                "mk_sb.proposal_id": "SCI-20200703-MK-01",
                "host_id": n + 1,
                "host.ip_address": format!("10.8.{}.1", n),
                "host.hostname": format!("tpn-0-{}", n),
                "host.port": 7148,
                "coherent_beam_config_id": k,
                "cb.angle": k as f64,
                "cb.fraction_overlap": 0.25,
                "cb.x": 54.5,
                "cb.y": 16.2,
                "observation_id": k,
                "obs.t_min": start_at,
                "obs.t_max": t_max,
                "obs.nbeam": beams,
                "tiling_config_id": k,
                "tiling.target": format!("J{:04}-3000", k),
                "tiling.ra": "00:00:00",
                "tiling.dec": "-30:00:00",
                "beam_id": (k - 1) * beams + n + 1,
                "beam.number": n,
                "beam.coherent": true,
            })));
        }
    }
    RowBatch::from_records(records)
}

/// `per_beam` candidates for each of beams `1..=beams`
pub fn candidate_batch(beams: i64, per_beam: i64) -> RowBatch {
    let mut records = Vec::new();
    let mut id = 0;
    for beam in 1..=beams {
        for i in 0..per_beam {
            id += 1;
            records.push(record(json!({
                "candidate_id": id,
                "sp_candidate_id": id,
                "beam_id": beam,
                "cand.dm": 100.0 + i as f64,
                "cand.snr": 10.5,
                "cand.ra": "00:00:00",
                "cand.dec": "-30:00:00",
                "cand.width": 2.0,
                "sp_cand.observed_at": format!("2024-01-01T00:{:02}:{:02}", beam, i),
                "sp_cand.plot_path": format!("/plots/{}_{}.jpg", beam, i),
            })));
        }
    }
    RowBatch::from_records(records)
}

pub fn cell_key(batch: &RowBatch, row: usize, column: &str) -> Key {
    key_of(batch.value(row, column).unwrap()).unwrap()
}

pub fn original_key(batch: &RowBatch, row: usize, column: &str) -> Key {
    let col = batch.column_index(column).unwrap();
    key_of(batch.original(row, col)).unwrap()
}

pub async fn count(conn: &mut SqliteConnection, table: &str) -> i64 {
    conn.count_rows(table).await.unwrap()
}

/// Whether `table` has a row with this id and these attributes
pub async fn row_exists(
    conn: &mut SqliteConnection,
    table: &str,
    id: Key,
    attributes: &[(&str, Value)],
) -> bool {
    let mut predicate = vec![("id".to_string(), json!(id))];
    predicate.extend(attributes.iter().map(|(c, v)| (c.to_string(), v.clone())));
    conn.find_id(table, "id", &predicate).await.unwrap() == Some(id)
}

/// Every candidate points at the beam its original beam key named
pub async fn assert_candidates_follow_beams(
    conn: &mut SqliteConnection,
    observations: &RowBatch,
    candidates: &RowBatch,
) {
    for row in 0..candidates.len() {
        let original_beam = original_key(candidates, row, "beam_id");
        let beam_row = (0..observations.len())
            .find(|&r| original_key(observations, r, "beam_id") == original_beam)
            .unwrap();
        let beam = cell_key(observations, beam_row, "beam_id");
        assert_eq!(cell_key(candidates, row, "beam_id"), beam);

        let candidate = cell_key(candidates, row, "candidate_id");
        assert!(row_exists(conn, "candidate", candidate, &[("beam_id", json!(beam))]).await);
        assert!(
            row_exists(
                conn,
                "sp_candidate",
                cell_key(candidates, row, "sp_candidate_id"),
                &[("candidate_id", json!(candidate))],
            )
            .await
        );
    }
}

/// Every beam row in the database matches its observation batch row
pub async fn assert_beams_follow_observations(conn: &mut SqliteConnection, observations: &RowBatch) {
    for row in 0..observations.len() {
        let beam = cell_key(observations, row, "beam_id");
        let attributes = [
            ("number", observations.value(row, "beam.number").unwrap().clone()),
            ("observation_id", json!(cell_key(observations, row, "observation_id"))),
            ("host_id", json!(cell_key(observations, row, "host_id"))),
        ];
        assert!(row_exists(conn, "beam", beam, &attributes).await);
    }
}
