mod helpers;

use grove::rank::context::is_flagged;
use grove::review::{accrue_served, review_list, served_budget};
use helpers::Project;

#[test]
fn node_flags_when_per_bullet_budget_exceeds_threshold() {
    let project = Project::new();
    for i in 0..3 {
        project.add("t", &format!("bullet {i}"));
    }
    let mut conn = project.open_rw();
    project.reindex_all(&mut conn);

    accrue_served(&conn, &[("t".into(), 10_000)]).unwrap();

    // 10000 / 3 > 3000 → flagged
    assert!(is_flagged(&conn, "t", 3000.0).unwrap());
    let entries = review_list(&conn, 3000.0, 20).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].slug, "t");
    assert_eq!(entries[0].live_bullets, 3);
}

#[test]
fn reviewed_record_resets_the_counter() {
    let project = Project::new();
    project.add("t", "bullet");
    let mut conn = project.open_rw();
    project.reindex_all(&mut conn);
    accrue_served(&conn, &[("t".into(), 9_000)]).unwrap();
    assert!(served_budget(&conn, "t").unwrap() > 0.0);

    project.store.mark_reviewed("t").unwrap();
    project.reindex(&mut conn, "t");

    assert_eq!(served_budget(&conn, "t").unwrap(), 0.0);
    assert!(!is_flagged(&conn, "t", 3000.0).unwrap());
    assert!(review_list(&conn, 3000.0, 20).unwrap().is_empty());
}

#[test]
fn reset_is_not_reapplied_to_later_accruals() {
    let project = Project::new();
    project.add("t", "bullet");
    let mut conn = project.open_rw();
    project.reindex_all(&mut conn);

    project.store.mark_reviewed("t").unwrap();
    project.reindex(&mut conn, "t");

    // Budget accrued after the review must survive further reindexes of
    // the same (already-applied) reviewed marker.
    accrue_served(&conn, &[("t".into(), 500)]).unwrap();
    project.reindex(&mut conn, "t");
    assert_eq!(served_budget(&conn, "t").unwrap(), 500.0);
}

#[test]
fn budget_survives_full_rebuild_but_not_review() {
    let project = Project::new();
    project.add("t", "bullet");
    let mut conn = project.open_rw();
    project.reindex_all(&mut conn);
    accrue_served(&conn, &[("t".into(), 4_000)]).unwrap();

    project.reindex_all(&mut conn);
    assert_eq!(served_budget(&conn, "t").unwrap(), 4_000.0);

    project.store.mark_reviewed("t").unwrap();
    project.reindex_all(&mut conn);
    assert_eq!(served_budget(&conn, "t").unwrap(), 0.0);
}
