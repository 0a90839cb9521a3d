use portal_chat::conversation::{Conversation, HistoryStore};
use portal_chat::Role;

#[test]
fn conversations_are_merged_into_one_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("history.json");
    let store = HistoryStore::new(&path);

    let mut first = Conversation::new("conv_1", "first");
    first.append_user("hi");
    first.append_assistant("hello");
    store.save(&first).unwrap();

    let mut second = Conversation::new("conv_2", "second");
    second.append_user("bye");
    store.save(&second).unwrap();

    first.append_user("again");
    store.save(&first).unwrap();

    let all = store.load_all();
    assert_eq!(all.keys().collect::<Vec<_>>(), vec!["conv_1", "conv_2"]);
    assert_eq!(all["conv_1"].len(), 3);
    assert_eq!(all["conv_2"].turns()[0].role, Role::User);

    let names: Vec<String> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["history.json"]);
}

#[test]
fn corrupt_document_reads_as_empty_and_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.json");
    std::fs::write(&path, "{ not json").unwrap();
    let store = HistoryStore::new(&path);

    assert!(store.load_all().is_empty());

    let mut conv = Conversation::new("conv_3", "t");
    conv.append_user("q");
    store.save(&conv).unwrap();
    assert_eq!(store.load("conv_3").unwrap().turns()[0].content, "q");
}

#[test]
fn missing_document_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = HistoryStore::new(dir.path().join("none.json"));
    assert!(store.load_all().is_empty());
    assert!(store.load("conv_1").is_none());
}
