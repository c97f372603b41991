//! Branch naming and URL normalization determinism.

use gbos::api::types::Task;
use gbos::workspace::{branch_for_task, normalize_repo_url, slugify};

fn task(id: &str, key: Option<&str>, title: &str) -> Task {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "task_key": key,
        "title": title,
    }))
    .unwrap()
}

#[test]
fn messy_title_produces_clean_branch() {
    let t = task("42", Some("ABC-1"), "Add  *SHINY*  feature!");
    assert_eq!(branch_for_task(&t), "task/ABC-1-add-shiny-feature");
}

#[test]
fn slug_shape_holds_for_awkward_titles() {
    for title in [
        "Fix: crash on empty input (urgent!!)",
        "  leading and trailing  ",
        "ümlaut / unicode — dashes",
        "UPPER lower 123",
        "a-very-very-very-long-title-that-exceeds-the-cap-by-far",
    ] {
        let slug = slugify(title);
        assert!(slug.len() <= 30, "{title:?} -> {slug:?}");
        assert!(
            slug.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'),
            "{title:?} -> {slug:?}"
        );
        assert!(!slug.starts_with('-') && !slug.ends_with('-'), "{slug:?}");
    }
}

#[test]
fn branch_is_stable_across_calls() {
    let t = task("7", Some("KEY-9"), "Stable Title");
    assert_eq!(branch_for_task(&t), branch_for_task(&t));
}

#[test]
fn ssh_and_https_remotes_compare_equal() {
    assert_eq!(
        normalize_repo_url("git@gitlab.com:acme/shop.git"),
        normalize_repo_url("https://gitlab.com/acme/shop")
    );
    assert_eq!(
        normalize_repo_url("HTTPS://GitLab.com/Acme/Shop.git"),
        normalize_repo_url("git@gitlab.com:acme/shop")
    );
}

#[test]
fn different_repos_stay_different() {
    assert_ne!(
        normalize_repo_url("https://gitlab.com/acme/shop"),
        normalize_repo_url("https://gitlab.com/acme/shop-api")
    );
    assert_ne!(
        normalize_repo_url("https://gitlab.com/acme/shop"),
        normalize_repo_url("https://example.com/acme/shop")
    );
}
