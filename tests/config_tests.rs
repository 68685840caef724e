use std::fs;

use swarm::config::Consistency;
use swarm::SwarmConfig;

mod helpers;
use helpers::{unique_test_temp_dir, EnvVarGuard};

fn write_config(body: &str) -> std::path::PathBuf {
    let dir = unique_test_temp_dir("config");
    fs::create_dir_all(&dir).expect("create dir");
    let path = dir.join("swarm.yaml");
    fs::write(&path, body).expect("write config");
    path
}

#[test]
fn env_override_wins_over_file() {
    let path = write_config("memory:\n  consistency: eventual\n");
    let _env = EnvVarGuard::set("SWARM_CONSISTENCY", "Strong");
    let cfg = SwarmConfig::load_from_file(&path).expect("load");
    assert_eq!(cfg.memory.consistency, Consistency::Strong);
}

#[test]
fn run_dir_comes_from_env() {
    let run_dir = unique_test_temp_dir("run-dir");
    let _env = EnvVarGuard::set("SWARM_RUN_DIR", &run_dir);
    let mut cfg = SwarmConfig::default();
    cfg.apply_env_overrides().expect("overrides");
    assert_eq!(cfg.coordinator.run_dir, Some(run_dir));
}

#[test]
fn bad_env_value_is_reported_with_its_name() {
    let _env = EnvVarGuard::set("SWARM_TICK_MS", "0");
    let err = SwarmConfig::default().apply_env_overrides().unwrap_err();
    assert!(err.to_string().contains("SWARM_TICK_MS"), "{err:#}");
}

#[test]
fn invalid_file_is_rejected_with_context() {
    let path = write_config("memory:\n  replication_factor: 0\n");
    let _env = EnvVarGuard::set("SWARM_MAX_RETRIES", "2");
    let err = SwarmConfig::load_from_file(&path).unwrap_err();
    let chain = format!("{err:#}");
    assert!(chain.contains("validate swarm config"), "{chain}");
    assert!(chain.contains("replication_factor"), "{chain}");
}

#[test]
fn empty_file_means_defaults() {
    let path = write_config("");
    let _env = EnvVarGuard::set("SWARM_MAX_RETRIES", "7");
    let cfg = SwarmConfig::load_from_file(&path).expect("load");
    assert_eq!(cfg.coordinator.max_retries, 7);
    assert_eq!(cfg.memory.replication_factor, 3);
}
