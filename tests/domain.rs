use reelsync::domain::{AssetDescriptor, DownloadTask, TaskKind, UrlTask, resolve_title_collisions};

fn asset(key: &str, title: &str, date: &str) -> AssetDescriptor {
    AssetDescriptor::new("Xpv", format!("https://www.xpicvid.com/showinfo-{key}.html"), title)
        .with_author("maker")
        .with_updated_at(date)
}

#[test]
fn colliding_titles_fall_back_to_undated_names() {
    let mut assets = vec![
        asset("1", "morning walk", "2024-05-01"),
        asset("2", "morning walk", "2024-05-01"),
        asset("3", "evening walk", "2024-05-01"),
    ];
    assert_eq!(resolve_title_collisions(&mut assets), 2);
    assert_eq!(assets[0].normalized_title, "morning walk");
    assert_eq!(assets[1].normalized_title, "morning walk");
    assert_eq!(assets[2].normalized_title, "[2024-05-01]evening walk");
}

#[test]
fn same_key_twice_is_not_a_collision() {
    let mut assets = vec![
        asset("1", "morning walk", "2024-05-01"),
        asset("1", "morning walk", "2024-05-01"),
    ];
    assert_eq!(resolve_title_collisions(&mut assets), 0);
    assert_eq!(assets[0].normalized_title, "[2024-05-01]morning walk");
}

#[test]
fn collisions_are_scoped_per_author() {
    let mut assets = vec![
        asset("1", "clip", "2024-05-01"),
        asset("2", "clip", "2024-05-01").with_author("someone else"),
    ];
    assert_eq!(resolve_title_collisions(&mut assets), 0);
}

#[test]
fn task_accessors() {
    let from_asset = DownloadTask::from(asset("9", "clip", "").with_kind(TaskKind::Pic));
    assert_eq!(from_asset.source(), Some("Xpv"));
    assert_eq!(from_asset.kind(), TaskKind::Pic);
    assert_eq!(from_asset.label(), "Xpv:clip");

    let raw = DownloadTask::from(UrlTask::new("  https://hanime1.me/watch?v=1 ").with_source("Hanime1"));
    assert_eq!(raw.url(), "https://hanime1.me/watch?v=1");
    assert_eq!(raw.kind(), TaskKind::Custom);
    assert!(raw.as_asset().is_none());
}

#[test]
fn sorting_key_prefers_known_dates() {
    let newer = asset("1", "a", "2024-06-01");
    let older = asset("2", "b", "2023-06-01");
    let unknown = asset("3", "c", "");
    assert!(newer.updated_timestamp() > older.updated_timestamp());
    assert_eq!(unknown.updated_timestamp(), 0);
}
