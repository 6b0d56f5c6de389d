use std::io::Write;

use super::*;

fn valid_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.cluster.node_id = 1;
    config.cluster.initial_members = vec![
        MemberEntry {
            id: 1,
            address: "127.0.0.1:9001".into(),
        },
        MemberEntry {
            id: 2,
            address: "127.0.0.1:9002".into(),
        },
    ];
    config
}

#[test]
fn test_default_config_validates() {
    assert!(NodeConfig::default().validate().is_ok());
}

#[test]
fn test_rejects_zero_node_id() {
    let mut config = valid_config();
    config.cluster.node_id = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_rejects_duplicate_member_ids() {
    let mut config = valid_config();
    config.cluster.initial_members.push(MemberEntry {
        id: 2,
        address: "127.0.0.1:9003".into(),
    });
    assert!(config.validate().is_err());
}

#[test]
fn test_rejects_inverted_election_range() {
    let mut config = valid_config();
    config.raft.election.election_timeout_min = 300;
    config.raft.election.election_timeout_max = 150;
    assert!(config.validate().is_err());
}

#[test]
fn test_rejects_heartbeat_threshold_out_of_range() {
    let mut config = valid_config();
    config.raft.heartbeat_threshold = 0.0;
    assert!(config.validate().is_err());

    config.raft.heartbeat_threshold = 1.5;
    assert!(config.validate().is_err());
}

#[test]
fn test_rejects_drift_bound_below_one() {
    let mut config = valid_config();
    config.raft.clock_drift_bound = 0.9;
    assert!(config.validate().is_err());
}

#[test]
fn test_heartbeat_period_scales_with_threshold() {
    let mut config = valid_config();
    config.raft.election.election_timeout_min = 200;
    config.raft.heartbeat_threshold = 0.25;
    assert_eq!(
        config.raft.heartbeat_period(),
        std::time::Duration::from_millis(50)
    );
}

#[test]
fn test_initial_configuration_maps_members() {
    let config = valid_config();
    let initial = config.initial_configuration();
    assert_eq!(initial.len(), 2);
    assert_eq!(initial.endpoint_of(2), Some("127.0.0.1:9002"));
}

#[test]
fn test_from_file_parses_toml() {
    let mut file = tempfile::NamedTempFile::with_suffix(".toml").expect("temp file");
    write!(
        file,
        r#"
[cluster]
node_id = 7
address = "127.0.0.1:9007"

[[cluster.initial_members]]
id = 7
address = "127.0.0.1:9007"

[raft]
heartbeat_threshold = 0.3

[raft.election]
election_timeout_min = 100
election_timeout_max = 200
"#
    )
    .expect("write config");

    let config = NodeConfig::from_file(file.path()).expect("load config");
    assert_eq!(config.cluster.node_id, 7);
    assert_eq!(config.raft.heartbeat_threshold, 0.3);
    assert_eq!(config.raft.election.election_timeout_min, 100);
}
