mod helpers;

use grove::store::records::BulletKind;
use helpers::Project;

#[test]
fn live_view_follows_add_update_delete() {
    let project = Project::new();
    let id = project.add("t", "x");

    project.store.update(&id, "y").unwrap();
    let node = project.store.get("t").unwrap().unwrap();
    let live: Vec<_> = node.live_bullets().collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].text, "y");

    project.store.delete(&id).unwrap();
    let node = project.store.get("t").unwrap().unwrap();
    assert_eq!(node.live_bullets().count(), 0);
}

#[test]
fn records_are_append_only() {
    let project = Project::new();
    let id = project.add("t", "first");
    project.store.update(&id, "second").unwrap();
    project.store.delete(&id).unwrap();

    // Three records on disk: the log keeps full history.
    let log = std::fs::read_to_string(
        project.store.nodes_dir().join("t").join("node.jsonl"),
    )
    .unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("\"op\":\"add\""));
    assert!(lines[1].contains("\"op\":\"update\""));
    assert!(lines[2].contains("\"op\":\"delete\""));
}

#[test]
fn ids_are_unique_within_a_node() {
    let project = Project::new();
    let mut ids = std::collections::HashSet::new();
    for i in 0..50 {
        let id = project.add("t", &format!("bullet {i}"));
        assert!(ids.insert(id), "duplicate bullet ID generated");
    }
}

#[test]
fn kinds_roundtrip_through_the_log() {
    let project = Project::new();
    for kind in [
        BulletKind::Fact,
        BulletKind::Gotcha,
        BulletKind::Decision,
        BulletKind::Task,
        BulletKind::Note,
        BulletKind::Success,
        BulletKind::Failure,
    ] {
        project.store.add("kinds", kind.as_str(), kind).unwrap();
    }
    let node = project.store.get("kinds").unwrap().unwrap();
    for bullet in node.live_bullets() {
        assert_eq!(bullet.kind.as_str(), bullet.text);
    }
}

#[test]
fn meta_log_is_separate_from_node_log() {
    let project = Project::new();
    let id = project.add("t", "voted");
    project.store.vote(&id, true).unwrap();
    project.store.mark_reviewed("t").unwrap();

    let node_dir = project.store.nodes_dir().join("t");
    let node_log = std::fs::read_to_string(node_dir.join("node.jsonl")).unwrap();
    let meta_log = std::fs::read_to_string(node_dir.join("meta.jsonl")).unwrap();

    assert!(!node_log.contains("vote"));
    assert!(meta_log.contains("\"op\":\"vote\""));
    assert!(meta_log.contains("\"op\":\"reviewed\""));
}

#[test]
fn unknown_ops_survive_reads() {
    let project = Project::new();
    project.add("t", "real bullet");

    // A future record type must be preserved, not dropped or fatal.
    let path = project.store.nodes_dir().join("t").join("node.jsonl");
    let mut content = std::fs::read_to_string(&path).unwrap();
    content.push_str("{\"op\":\"merge\",\"id\":\"b-future00\",\"ts\":\"2026-01-01T00:00:00Z\"}\n");
    std::fs::write(&path, &content).unwrap();

    let node = project.store.get("t").unwrap().unwrap();
    assert_eq!(node.live_bullets().count(), 1);
    // The unknown line is still on disk untouched.
    let after = std::fs::read_to_string(&path).unwrap();
    assert!(after.contains("\"op\":\"merge\""));
}
