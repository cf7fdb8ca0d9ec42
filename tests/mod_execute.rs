use bson::{Bson, Document, doc};
use flexdoc::filter::{eq, gte};
use flexdoc::{
    Connection, ConnectionConfig, DbError, DocumentStore, ExecResult, FieldNaming, MemoryStore,
    Params, Query, SaveMode,
};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;

fn with_config(config: ConnectionConfig) -> (Arc<MemoryStore>, Connection) {
    let mem = Arc::new(MemoryStore::new());
    for (id, name, dept, age) in [(1, "alice", "ops", 30), (2, "bob", "dev", 41), (3, "carol", "ops", 25)] {
        mem.insert_one(None, "staff", &doc! {"_id": id, "name": name, "dept": dept, "age": age})
            .unwrap();
    }
    let store: Arc<dyn DocumentStore> = mem.clone();
    (mem, Connection::new(store, config))
}

fn setup() -> (Arc<MemoryStore>, Connection) {
    with_config(ConnectionConfig::default())
}

fn by_id(mem: &MemoryStore, id: i32) -> Document {
    mem.documents("staff")
        .into_iter()
        .find(|d| d.get_i32("_id").ok() == Some(id))
        .unwrap()
}

#[test]
fn insert_writes_generated_identifier_back() {
    let (mem, conn) = setup();
    let out = conn
        .execute(&Query::from("staff").insert(), Params::new().document(doc! {"name": "dave"}))
        .unwrap();
    let stored = out.into_document().unwrap();
    assert!(matches!(stored.get("_id"), Some(Bson::ObjectId(_))));
    assert_eq!(mem.documents("staff").len(), 4);
}

#[test]
fn insert_serializes_typed_payloads() {
    #[derive(Serialize)]
    struct NewHire<'a> {
        name: &'a str,
        age: i32,
    }
    let (mem, conn) = setup();
    let params = Params::new().data(&NewHire { name: "erin", age: 22 }).unwrap();
    conn.execute(&Query::from("staff").insert(), params).unwrap();
    assert!(mem.documents("staff").iter().any(|d| d.get_str("name").is_ok_and(|n| n == "erin")));
}

#[test]
fn update_without_where_is_rejected_before_any_call() {
    let (mem, conn) = setup();
    let before = mem.operation_count();
    let err = conn
        .execute(&Query::from("staff").update(Vec::<String>::new()), Params::new().document(doc! {"age": 1}))
        .unwrap_err();
    assert!(err.is_precondition());
    assert_eq!(err.to_string(), "update need to have where clause");
    assert_eq!(mem.operation_count(), before);
}

#[test]
fn delete_without_where_is_rejected_before_any_call() {
    let (mem, conn) = setup();
    let before = mem.operation_count();
    let err = conn.execute(&Query::from("staff").delete(), Params::new()).unwrap_err();
    assert!(err.is_precondition());
    assert!(err.to_string().contains("use drop_collection instead of delete"));
    assert_eq!(mem.operation_count(), before);
    assert_eq!(mem.documents("staff").len(), 3);
}

#[test]
fn save_without_identifier_is_rejected_before_any_call() {
    let (mem, conn) = setup();
    let before = mem.operation_count();
    for payload in [doc! {"name": "x"}, doc! {"_id": "", "name": "x"}] {
        let err = conn
            .execute(&Query::from("staff").save(), Params::new().document(payload))
            .unwrap_err();
        assert_eq!(err.to_string(), "_id field is required");
    }
    assert_eq!(mem.operation_count(), before);
}

#[test]
fn update_honors_allow_list_case_insensitively() {
    let (mem, conn) = setup();
    let out = conn
        .execute(
            &Query::from("staff").filter(eq("dept", "ops")).update(["AGE"]),
            Params::new().document(doc! {"_id": 99, "name": "mallory", "age": 50}),
        )
        .unwrap();
    let ExecResult::Updated(report) = out else { panic!("expected an update report") };
    assert_eq!(report.matched, 2);
    let alice = by_id(&mem, 1);
    assert_eq!(alice.get_i32("age").unwrap(), 50);
    assert_eq!(alice.get_str("name").unwrap(), "alice");
    assert_eq!(by_id(&mem, 2).get_i32("age").unwrap(), 41);
}

#[test]
fn update_with_nothing_allowed_is_a_precondition_error() {
    let (_, conn) = setup();
    let err = conn
        .execute(
            &Query::from("staff").filter(eq("_id", 1)).update(["salary"]),
            Params::new().document(doc! {"_id": 1, "name": "x"}),
        )
        .unwrap_err();
    assert!(err.is_precondition());
}

#[test]
fn single_update_touches_one_document() {
    let (mem, conn) = setup();
    let out = conn
        .execute(
            &Query::from("staff").filter(eq("dept", "ops")).update(["age"]),
            Params::new().document(doc! {"name": "renamed"}).single_update(true),
        )
        .unwrap();
    let ExecResult::Updated(report) = out else { panic!("expected an update report") };
    assert_eq!((report.matched, report.modified), (1, 1));
    let renamed = mem.documents("staff").iter().filter(|d| d.get_str("name").is_ok_and(|n| n == "renamed")).count();
    assert_eq!(renamed, 1);
}

#[test]
fn delete_removes_matches_and_reports_count() {
    let (mem, conn) = setup();
    let out = conn.execute(&Query::from("staff").filter(gte("age", 30)).delete(), Params::new()).unwrap();
    let ExecResult::Deleted(report) = out else { panic!("expected a delete report") };
    assert_eq!(report.deleted, 2);
    assert_eq!(mem.documents("staff").len(), 1);
}

#[test]
fn save_replaces_whole_document_by_default() {
    let (mem, conn) = setup();
    conn.execute(&Query::from("staff").save(), Params::new().document(doc! {"_id": 1, "name": "alicia"}))
        .unwrap();
    assert_eq!(by_id(&mem, 1), doc! {"_id": 1, "name": "alicia"});

    let out = conn
        .execute(&Query::from("staff").save(), Params::new().document(doc! {"_id": 9, "name": "new"}))
        .unwrap();
    let ExecResult::Updated(report) = out else { panic!("expected an update report") };
    assert!(report.upserted);
    assert_eq!(by_id(&mem, 9).get_str("name").unwrap(), "new");
}

#[test]
fn merge_save_keeps_unmentioned_fields() {
    let config = ConnectionConfig { save_mode: SaveMode::Merge, ..ConnectionConfig::default() };
    let (mem, conn) = with_config(config);
    conn.execute(&Query::from("staff").save(), Params::new().document(doc! {"_id": 1, "name": "alicia"}))
        .unwrap();
    let alice = by_id(&mem, 1);
    assert_eq!(alice.get_str("name").unwrap(), "alicia");
    assert_eq!(alice.get_i32("age").unwrap(), 30);
}

#[test]
fn field_naming_applies_to_written_keys() {
    let config = ConnectionConfig { field_naming: FieldNaming::SnakeCase, ..ConnectionConfig::default() };
    let (mem, conn) = with_config(config);
    conn.execute(
        &Query::from("staff").insert(),
        Params::new().document(doc! {"_id": 10, "firstName": "zed", "homeTown": "kano"}),
    )
    .unwrap();
    assert_eq!(by_id(&mem, 10), doc! {"_id": 10, "first_name": "zed", "home_town": "kano"});
}

#[test]
fn distinct_values_with_filter() {
    let (_, conn) = setup();
    let values = conn
        .execute(&Query::from("staff").command("distinct", "dept"), Params::new())
        .unwrap()
        .into_values()
        .unwrap();
    assert_eq!(values.len(), 2);
    assert!(values.contains(&Bson::from("ops")) && values.contains(&Bson::from("dev")));

    let values = conn
        .execute(
            &Query::from("staff").filter(gte("age", 30)).command("distinct", doc! {"field": "name"}),
            Params::new(),
        )
        .unwrap()
        .into_values()
        .unwrap();
    assert_eq!(values.len(), 2);

    let err = conn
        .execute(&Query::from("staff").command("distinct", doc! {"field": ""}), Params::new())
        .unwrap_err();
    assert_eq!(err.to_string(), "field attribute is mandatory");
}

#[test]
fn raw_commands_return_the_reply() {
    let (_, conn) = setup();
    let reply = conn
        .execute(&Query::from("staff").command("command", doc! {"ping": 1}), Params::new())
        .unwrap()
        .into_document()
        .unwrap();
    assert_eq!(reply, doc! {"ok": 1});

    let reply = conn
        .execute(
            &Query::from("staff").command("command", doc! {"count": "staff", "query": {"dept": "ops"}}),
            Params::new(),
        )
        .unwrap()
        .into_document()
        .unwrap();
    assert_eq!(reply.get_i64("n").unwrap(), 2);

    let err = conn
        .execute(&Query::from("staff").command("command", doc! {"shutdown": 1}), Params::new())
        .unwrap_err();
    assert!(err.to_string().starts_with("unable to run command."));
}

#[test]
fn unknown_command_names_are_dispatch_errors() {
    let (_, conn) = setup();
    let err = conn
        .execute(&Query::from("staff").command("reindex", Bson::Null), Params::new())
        .unwrap_err();
    assert!(matches!(err, DbError::Dispatch(_)));
}

#[test]
fn store_failures_carry_the_operation_prefix() {
    let (mem, conn) = setup();
    mem.fail_next("delete_many");
    let err = conn.execute(&Query::from("staff").filter(eq("_id", 1)).delete(), Params::new()).unwrap_err();
    assert_eq!(err.to_string(), "unable to delete. injected failure in delete_many");
}

fn blob(conn: &Connection, cmd: &str, opts: Document, params: Params<'_>) -> Result<ExecResult, DbError> {
    conn.execute(&Query::from("docs").command(cmd, opts), params)
}

#[test]
fn blob_write_read_remove_truncate() {
    let (mem, conn) = setup();
    let mut src: &[u8] = b"hello blob";
    let id = blob(&conn, "gfswrite", doc! {"id": "f1", "name": "hello.txt", "metadata": {"k": 1}}, Params::new().source(&mut src))
        .unwrap();
    assert!(matches!(id, ExecResult::Id(Bson::String(ref s)) if s == "f1"));
    assert_eq!(mem.blob_files("docs"), vec![(Bson::from("f1"), "hello.txt".to_string())]);
    let meta = mem.blob_metadata("docs", &Bson::from("f1")).unwrap();
    assert_eq!(meta.get_i32("k").unwrap(), 1);
    assert_eq!(meta.get_i64("chunkSize").unwrap(), 1024);

    let mut out = Vec::new();
    let copied = blob(&conn, "gfsread", doc! {"id": "f1"}, Params::new().output(&mut out)).unwrap();
    assert!(matches!(copied, ExecResult::Copied(10)));
    assert_eq!(out, b"hello blob");
    assert_eq!(mem.closed_downloads(), 1);

    let mut out = Vec::new();
    blob(&conn, "gfsread", doc! {"name": "hello.txt"}, Params::new().output(&mut out)).unwrap();
    assert_eq!(out, b"hello blob");

    blob(&conn, "gfsdelete", doc! {"id": "f1"}, Params::new()).unwrap();
    assert!(mem.blob_files("docs").is_empty());

    let mut src: &[u8] = b"x";
    blob(&conn, "gfswrite", doc! {"name": "a"}, Params::new().source(&mut src)).unwrap();
    blob(&conn, "gfstruncate", Document::new(), Params::new()).unwrap();
    assert!(mem.blob_files("docs").is_empty());
}

#[test]
fn blob_rewrite_under_same_id_replaces() {
    let (mem, conn) = setup();
    for body in [&b"one"[..], &b"two"[..]] {
        let mut src = body;
        blob(&conn, "gfswrite", doc! {"id": "same", "size": 512}, Params::new().source(&mut src)).unwrap();
    }
    let files = mem.blob_files("docs");
    assert_eq!(files, vec![(Bson::from("same"), "same".to_string())]);
    assert_eq!(mem.blob_metadata("docs", &Bson::from("same")).unwrap().get_i64("chunkSize").unwrap(), 512);
    let mut out = Vec::new();
    blob(&conn, "gfsread", doc! {"id": "same"}, Params::new().output(&mut out)).unwrap();
    assert_eq!(out, b"two");
}

#[test]
fn blob_without_name_gets_random_name() {
    let (mem, conn) = setup();
    let mut src: &[u8] = b"anon";
    blob(&conn, "gfswrite", Document::new(), Params::new().source(&mut src)).unwrap();
    let files = mem.blob_files("docs");
    assert_eq!(files.len(), 1);
    assert!(matches!(files[0].0, Bson::ObjectId(_)));
    assert_eq!(files[0].1.len(), 32);
}

#[test]
fn blob_preconditions() {
    let (_, conn) = setup();
    let err = blob(&conn, "gfswrite", doc! {"name": "a"}, Params::new()).unwrap_err();
    assert_eq!(err.to_string(), "invalid reader");
    let err = blob(&conn, "gfsread", doc! {"id": "a"}, Params::new()).unwrap_err();
    assert_eq!(err.to_string(), "invalid writer");
    let mut out = Vec::new();
    let err = blob(&conn, "gfsread", Document::new(), Params::new().output(&mut out)).unwrap_err();
    assert!(err.is_precondition());
    let err = blob(&conn, "gfsremove", Document::new(), Params::new()).unwrap_err();
    assert!(err.is_precondition());
    let err = conn.execute(&Query::from("docs").command("gfswrite", "opts"), Params::new()).unwrap_err();
    assert!(matches!(err, DbError::Dispatch(_)));
    let err = blob(&conn, "gfsmirror", Document::new(), Params::new()).unwrap_err();
    assert_eq!(err.to_string(), "dispatch error: invalid command: gfsmirror");
}

#[test]
fn blob_read_of_missing_object_names_it() {
    let (_, conn) = setup();
    let mut out = Vec::new();
    let err = blob(&conn, "gfsread", doc! {"id": "nope"}, Params::new().output(&mut out)).unwrap_err();
    assert!(err.to_string().starts_with("unable to open blob docs-nope."));
}

struct BrokenSink;

impl Write for BrokenSink {
    fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::other("disk full"))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn blob_download_is_closed_when_copy_fails() {
    let (mem, conn) = setup();
    let mut src: &[u8] = b"payload";
    blob(&conn, "gfswrite", doc! {"id": "f"}, Params::new().source(&mut src)).unwrap();
    let mut sink = BrokenSink;
    let err = blob(&conn, "gfsread", doc! {"id": "f"}, Params::new().output(&mut sink)).unwrap_err();
    assert!(err.to_string().starts_with("unable to read blob docs-f."));
    assert_eq!(mem.closed_downloads(), 1);
}
