//! # Integration Test Suite for Realtime Chat Core
//!
//! Unit tests for each layer live next to the code. This module drives the
//! layers together, the way an application does.
//!
//! ## Test Categories
//!
//! ### 1. Server Function Tests
//! - The create, list, update, remove round trip through `MessageServer::call`
//! - The 100-message window and newest-first ordering
//! - Rejections: duplicate identifiers, missing records, unknown fields
//!
//! ### 2. Concurrency Tests
//! - Racing creates with the same `localId`: exactly one wins
//! - Racing updates of one record: last write wins, nothing is lost or duplicated
//!
//! ### 3. FFI Function Tests
//! - Every `chat_*` entry point with success and error scenarios
//! - Null pointers, invalid UTF-8, malformed JSON
//!
//! ### 4. Sync Tests
//! - Two clients over push and poll transports see each other's writes
//! - Local cache persistence and replay of pending writes
//!
//! ### 5. Chat Room Tests
//! - Sending, editing, deleting and leaving
//!
//! ## Running the Tests
//!
//! ```bash
//! cargo test
//! cargo test test_ffi_           # FFI tests
//! cargo test test_concurrent_    # Concurrency tests
//! RUST_LOG=debug cargo test      # with logs
//! ```

#[cfg(test)]
pub mod tests {
    use std::collections::HashSet;
    use std::ffi::{CStr, CString};
    use std::os::raw::c_char;
    use std::sync::Arc;
    use std::thread;

    use log::info;
    use serde_json::{json, Value as JsonValue};
    use tempfile::TempDir;

    use crate::app_response::AppResponse;
    use crate::chat::ChatRoom;
    use crate::config::{PersistConfig, StoreConfig, SyncConfig};
    use crate::crud::{CrudOp, SyncMode};
    use crate::error::ChatError;
    use crate::functions::api;
    use crate::local_cache::{LocalCache, PendingWrite};
    use crate::message_model::{CreateArgs, UpdateArgs};
    use crate::server::{MessageServer, RECENT_MESSAGE_LIMIT};
    use crate::sync_session::{SessionConfig, SyncSession};
    use crate::synced_chat::{synced_chat, SyncedChatProps};
    use crate::transport::{connect, TransportKind};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn unique_name(dir: &TempDir, prefix: &str) -> String {
        dir.path().join(prefix).to_string_lossy().to_string()
    }

    fn open_server(prefix: &str) -> (TempDir, Arc<MessageServer>) {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let server = MessageServer::open(&StoreConfig::named(unique_name(&dir, prefix))).unwrap();
        (dir, server)
    }

    fn create_args(local_id: &str, local_created_at: f64, body: &str) -> CreateArgs {
        CreateArgs {
            local_id: local_id.to_string(),
            local_created_at,
            author: "alice".to_string(),
            body: body.to_string(),
        }
    }

    fn session_for(
        server: &Arc<MessageServer>,
        kind: TransportKind,
        mode: SyncMode,
        persist: Option<PersistConfig>,
    ) -> SyncSession {
        let config = SyncConfig {
            transport: kind,
            mode,
            ..Default::default()
        };
        let backend = synced_chat(SyncedChatProps::messages(connect(kind, Arc::clone(server)), &config)).unwrap();
        SyncSession::init(Arc::new(backend), SessionConfig { persist, on_error: None }).unwrap()
    }

    // ===============================
    // SERVER FUNCTION TESTS
    // ===============================

    #[test]
    fn test_message_lifecycle() {
        let (_dir, server) = open_server("lifecycle");

        let created = server
            .call(
                api::messages::CREATE,
                json!({"localId": "a1", "localCreatedAt": 1_700_000_000_000.0_f64, "author": "alice", "body": "hi"}),
            )
            .unwrap();
        assert_eq!(created["localId"], json!("a1"));
        assert!(created["serverCreatedAt"].as_f64().is_some());

        let listed = server.call(api::messages::LIST, json!({})).unwrap();
        let listed = listed.as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["author"], json!("alice"));
        assert_eq!(listed[0]["body"], json!("hi"));
        assert_eq!(listed[0]["localCreatedAt"], json!(1_700_000_000_000.0_f64));
        assert!(listed[0].get("_id").is_none());
        assert!(listed[0].get("_creationTime").is_none());

        server
            .call(api::messages::UPDATE, json!({"localId": "a1", "body": "hello"}))
            .unwrap();
        let listed = server.call(api::messages::LIST, JsonValue::Null).unwrap();
        assert_eq!(listed[0]["body"], json!("hello"));
        assert_eq!(listed[0]["author"], json!("alice"));
        assert_eq!(listed[0]["serverCreatedAt"], created["serverCreatedAt"]);

        let removed = server.call(api::messages::REMOVE, json!({"localId": "a1"})).unwrap();
        assert_eq!(removed["body"], json!("hello"));
        let listed = server.call(api::messages::LIST, json!({})).unwrap();
        assert!(listed.as_array().unwrap().is_empty());
    }

    #[test]
    fn test_list_returns_most_recent_window() {
        let (_dir, server) = open_server("window");
        let total = RECENT_MESSAGE_LIMIT + 5;
        for i in 0..total {
            // Client timestamps run backwards to show ordering ignores them.
            server
                .create(create_args(&format!("m{i}"), (total - i) as f64, "x"))
                .unwrap();
        }

        let listed = server.list(Default::default()).unwrap();
        assert_eq!(listed.len(), RECENT_MESSAGE_LIMIT);
        assert_eq!(listed[0].local_id, format!("m{}", total - 1));
        assert_eq!(listed[RECENT_MESSAGE_LIMIT - 1].local_id, "m5");
        assert_eq!(server.store().count().unwrap(), total);
    }

    #[test]
    fn test_duplicate_create_leaves_store_unchanged() {
        let (_dir, server) = open_server("duplicate");
        server.create(create_args("a1", 1.0, "first")).unwrap();

        let err = server.create(create_args("a1", 2.0, "second")).unwrap_err();
        assert!(matches!(err, ChatError::DuplicateIdentifier(ref id) if id == "a1"));
        assert_eq!(err.to_string(), "Document a1 already exists.");

        let listed = server.list(Default::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].body, "first");
        assert_eq!(listed[0].local_created_at, 1.0);
    }

    #[test]
    fn test_missing_record_is_not_found() {
        let (_dir, server) = open_server("missing");

        let err = server
            .call(api::messages::UPDATE, json!({"localId": "zz", "body": "x"}))
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert_eq!(err.to_string(), "Document zz does not exist.");

        let err = server.call(api::messages::REMOVE, json!({"localId": "zz"})).unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[test]
    fn test_partial_update_keeps_other_fields() {
        let (_dir, server) = open_server("partial");
        server.create(create_args("a1", 5.0, "hi")).unwrap();

        let updated = server
            .update(UpdateArgs {
                local_id: "a1".to_string(),
                author: Some("bob".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(updated.author, "bob");
        assert_eq!(updated.body, "hi");
        assert_eq!(updated.local_created_at, 5.0);

        // An update carrying only the identifier changes nothing.
        let unchanged = server
            .call(api::messages::UPDATE, json!({"localId": "a1"}))
            .unwrap();
        assert_eq!(unchanged["author"], json!("bob"));
    }

    #[test]
    fn test_mutations_reject_bookkeeping_fields() {
        let (_dir, server) = open_server("bookkeeping");
        server.create(create_args("a1", 1.0, "hi")).unwrap();

        for field in ["_id", "_creationTime", "serverCreatedAt"] {
            let mut args = json!({"localId": "a1", "body": "changed"});
            args[field] = json!(1);
            let err = server.call(api::messages::UPDATE, args).unwrap_err();
            assert!(matches!(err, ChatError::BadRequest(_)), "{field} should be rejected");
        }
        assert_eq!(server.list(Default::default()).unwrap()[0].body, "hi");
    }

    #[test]
    fn test_create_accepts_any_local_id() {
        let (_dir, server) = open_server("any_id");
        let long_id = "x".repeat(600);

        for id in ["", long_id.as_str()] {
            server
                .call(
                    api::messages::CREATE,
                    json!({"localId": id, "localCreatedAt": 1, "author": "alice", "body": "hi"}),
                )
                .unwrap();
        }
        let listed = server.call(api::messages::LIST, json!({})).unwrap();
        let ids: HashSet<&str> = listed
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["localId"].as_str().unwrap())
            .collect();
        assert_eq!(ids, HashSet::from(["", long_id.as_str()]));

        let err = server.create(create_args("", 2.0, "again")).unwrap_err();
        assert!(matches!(err, ChatError::DuplicateIdentifier(_)));
        server
            .call(api::messages::UPDATE, json!({"localId": long_id, "body": "edited"}))
            .unwrap();
        server.call(api::messages::REMOVE, json!({"localId": ""})).unwrap();

        let listed = server.list(Default::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].body, "edited");
    }

    // ===============================
    // CONCURRENCY TESTS
    // ===============================

    #[test]
    fn test_concurrent_creates_with_same_local_id() {
        let (_dir, server) = open_server("race_create");

        let mut handles = vec![];
        for thread_id in 0..8 {
            let server = Arc::clone(&server);
            handles.push(thread::spawn(move || {
                server.create(CreateArgs {
                    local_id: "same".to_string(),
                    local_created_at: thread_id as f64,
                    author: format!("writer{thread_id}"),
                    body: "race".to_string(),
                })
            }));
        }

        let results: Vec<Result<_, ChatError>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Err(ChatError::DuplicateIdentifier(_))))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(duplicates, 7);
        assert_eq!(server.store().count().unwrap(), 1);
    }

    #[test]
    fn test_concurrent_updates_last_write_wins() {
        let (_dir, server) = open_server("race_update");
        server.create(create_args("a1", 1.0, "start")).unwrap();

        let mut handles = vec![];
        for thread_id in 0..6 {
            let server = Arc::clone(&server);
            handles.push(thread::spawn(move || {
                for round in 0..10 {
                    server
                        .update(UpdateArgs {
                            local_id: "a1".to_string(),
                            body: Some(format!("t{thread_id}-r{round}")),
                            ..Default::default()
                        })
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let listed = server.list(Default::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].body.ends_with("-r9"), "unexpected body {}", listed[0].body);
        assert_eq!(listed[0].author, "alice");
    }

    #[test]
    fn test_concurrent_writers_leave_sessions_current() {
        for kind in [TransportKind::Push, TransportKind::Poll] {
            let (_dir, server) = open_server("race_sessions");
            let watcher = session_for(&server, kind, SyncMode::Set, None);

            let mut handles = vec![];
            for thread_id in 0..4 {
                let server = Arc::clone(&server);
                handles.push(thread::spawn(move || {
                    for i in 0..10 {
                        server
                            .create(create_args(&format!("t{thread_id}-{i}"), i as f64, "x"))
                            .unwrap();
                    }
                }));
            }
            for handle in handles {
                handle.join().unwrap();
            }

            // The last delivery was fetched after the last commit.
            assert_eq!(watcher.get().len(), 40, "{kind:?}");
            watcher.dispose();
        }
    }

    // ===============================
    // FFI FUNCTION TESTS
    // ===============================

    fn take_response(ptr: *const c_char) -> AppResponse {
        use crate::chat_free_string;

        assert!(!ptr.is_null(), "Result should not be null");
        let raw = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string();
        chat_free_string(ptr);
        serde_json::from_str(&raw).unwrap()
    }

    fn ok_json(response: AppResponse) -> JsonValue {
        match response {
            AppResponse::Ok(json) => serde_json::from_str(&json).unwrap(),
            other => panic!("expected Ok, got {other}"),
        }
    }

    #[test]
    fn test_ffi_round_trip() {
        use crate::{chat_close, chat_create, chat_list, chat_open, chat_remove, chat_update};

        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let name = CString::new(unique_name(&dir, "ffi")).unwrap();
        let backend = chat_open(name.as_ptr());
        assert!(!backend.is_null(), "Backend pointer should not be null");

        let json = CString::new(r#"{"localId":"a1","localCreatedAt":1,"author":"alice","body":"hi"}"#).unwrap();
        let created = ok_json(take_response(chat_create(backend, json.as_ptr())));
        assert_eq!(created["localId"], json!("a1"));

        let duplicate = take_response(chat_create(backend, json.as_ptr()));
        assert!(matches!(duplicate, AppResponse::DuplicateIdentifier(_)));

        let update = CString::new(r#"{"localId":"a1","body":"hello"}"#).unwrap();
        let updated = ok_json(take_response(chat_update(backend, update.as_ptr())));
        assert_eq!(updated["body"], json!("hello"));

        let listed = ok_json(take_response(chat_list(backend)));
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let remove = CString::new(r#"{"localId":"a1"}"#).unwrap();
        ok_json(take_response(chat_remove(backend, remove.as_ptr())));
        let missing = take_response(chat_remove(backend, remove.as_ptr()));
        assert!(matches!(missing, AppResponse::NotFound(_)));

        assert!(take_response(chat_close(backend)).is_ok());
    }

    #[test]
    fn test_ffi_call_by_name() {
        use crate::{chat_call, chat_close, chat_open};

        let dir = tempfile::tempdir().unwrap();
        let name = CString::new(unique_name(&dir, "ffi_call")).unwrap();
        let backend = chat_open(name.as_ptr());

        let create = CString::new("messages:create").unwrap();
        let args = CString::new(r#"{"localId":"b1","localCreatedAt":2,"author":"bob","body":"yo"}"#).unwrap();
        ok_json(take_response(chat_call(backend, create.as_ptr(), args.as_ptr())));

        let list = CString::new("messages:list").unwrap();
        let empty = CString::new("{}").unwrap();
        let listed = ok_json(take_response(chat_call(backend, list.as_ptr(), empty.as_ptr())));
        assert_eq!(listed[0]["author"], json!("bob"));

        let unknown = CString::new("messages:nope").unwrap();
        let response = take_response(chat_call(backend, unknown.as_ptr(), empty.as_ptr()));
        assert!(matches!(response, AppResponse::BadRequest(_)));

        let response = take_response(chat_call(backend, std::ptr::null(), empty.as_ptr()));
        assert!(matches!(response, AppResponse::BadRequest(_)));

        take_response(chat_close(backend));
    }

    #[test]
    fn test_ffi_clear_all_records() {
        use crate::{chat_clear_all_records, chat_close, chat_create, chat_list, chat_open};

        let dir = tempfile::tempdir().unwrap();
        let name = CString::new(unique_name(&dir, "ffi_clear")).unwrap();
        let backend = chat_open(name.as_ptr());

        for i in 0..3 {
            let json = CString::new(format!(
                r#"{{"localId":"c{i}","localCreatedAt":{i},"author":"alice","body":"x"}}"#
            ))
            .unwrap();
            ok_json(take_response(chat_create(backend, json.as_ptr())));
        }

        let cleared = take_response(chat_clear_all_records(backend));
        assert_eq!(cleared, AppResponse::Ok("3 records cleared".to_string()));
        let listed = ok_json(take_response(chat_list(backend)));
        assert!(listed.as_array().unwrap().is_empty());

        // The store stays usable after clearing.
        let json = CString::new(r#"{"localId":"c0","localCreatedAt":0,"author":"alice","body":"again"}"#).unwrap();
        ok_json(take_response(chat_create(backend, json.as_ptr())));

        take_response(chat_close(backend));
    }

    #[test]
    fn test_ffi_open_null_pointer() {
        use crate::chat_open;

        assert!(chat_open(std::ptr::null()).is_null(), "Should return null for null input");
    }

    #[test]
    fn test_ffi_open_invalid_utf8() {
        use crate::chat_open;

        let invalid_bytes = [0xFF_u8, 0xFE, 0xFD, 0x00];
        let backend = chat_open(invalid_bytes.as_ptr() as *const c_char);
        assert!(backend.is_null(), "Should return null for invalid UTF-8");
    }

    #[test]
    fn test_ffi_null_pointers() {
        use crate::{
            chat_clear_all_records, chat_close, chat_create, chat_free_string, chat_list, chat_open, chat_remove,
            chat_update,
        };

        let json = CString::new(r#"{"localId":"a1"}"#).unwrap();
        let null_state = std::ptr::null_mut();

        for response in [
            take_response(chat_list(null_state)),
            take_response(chat_create(null_state, json.as_ptr())),
            take_response(chat_update(null_state, json.as_ptr())),
            take_response(chat_remove(null_state, json.as_ptr())),
            take_response(chat_clear_all_records(null_state)),
            take_response(chat_close(null_state)),
        ] {
            assert!(matches!(response, AppResponse::BadRequest(_)), "got {response}");
        }

        let dir = tempfile::tempdir().unwrap();
        let name = CString::new(unique_name(&dir, "ffi_null")).unwrap();
        let backend = chat_open(name.as_ptr());
        let response = take_response(chat_create(backend, std::ptr::null()));
        assert!(matches!(response, AppResponse::BadRequest(_)));
        take_response(chat_close(backend));

        chat_free_string(std::ptr::null());
    }

    #[test]
    fn test_ffi_invalid_json() {
        use crate::{chat_close, chat_create, chat_open, chat_update};

        let dir = tempfile::tempdir().unwrap();
        let name = CString::new(unique_name(&dir, "ffi_json")).unwrap();
        let backend = chat_open(name.as_ptr());

        let malformed = CString::new(r#"{"localId": "a1""#).unwrap();
        let response = take_response(chat_create(backend, malformed.as_ptr()));
        assert!(matches!(response, AppResponse::SerializationError(_)));

        // Well-formed JSON with missing required fields is a bad request.
        let incomplete = CString::new(r#"{"localId":"a1"}"#).unwrap();
        let response = take_response(chat_create(backend, incomplete.as_ptr()));
        assert!(matches!(response, AppResponse::BadRequest(_)));

        let extra = CString::new(r#"{"localId":"a1","_id":3}"#).unwrap();
        let response = take_response(chat_update(backend, extra.as_ptr()));
        assert!(matches!(response, AppResponse::BadRequest(_)));

        take_response(chat_close(backend));
    }

    // ===============================
    // SYNC TESTS
    // ===============================

    #[test]
    fn test_two_clients_see_each_other() {
        for kind in [TransportKind::Push, TransportKind::Poll] {
            let (_dir, server) = open_server("two_clients");
            let alice = session_for(&server, kind, SyncMode::Set, None);
            let bob = session_for(&server, kind, SyncMode::Set, None);
            let bob_updates = bob.watch();

            let confirmed = alice
                .assign("a1", json!({"localCreatedAt": 1.0, "author": "alice", "body": "hi"}))
                .unwrap();
            assert!(confirmed["serverCreatedAt"].as_f64().is_some(), "{kind:?}");
            assert_eq!(bob.get_by_id("a1").unwrap()["body"], json!("hi"), "{kind:?}");
            assert!(bob_updates.try_recv().is_ok(), "{kind:?}");

            bob.assign("a1", json!({"body": "hi alice"})).unwrap();
            let seen = alice.get_by_id("a1").unwrap();
            assert_eq!(seen["body"], json!("hi alice"), "{kind:?}");
            assert_eq!(seen["author"], json!("alice"), "{kind:?}");

            alice.delete("a1").unwrap();
            assert!(bob.get().is_empty(), "{kind:?}");
            assert_eq!(server.store().count().unwrap(), 0, "{kind:?}");

            alice.dispose();
            bob.dispose();
            info!("{kind:?} clients in sync");
        }
    }

    #[test]
    fn test_merge_mode_keeps_records_deleted_elsewhere() {
        let (_dir, server) = open_server("merge_mode");
        let alice = session_for(&server, TransportKind::Push, SyncMode::Merge, None);
        let bob = session_for(&server, TransportKind::Push, SyncMode::Merge, None);

        alice
            .assign("a1", json!({"localCreatedAt": 1.0, "author": "alice", "body": "hi"}))
            .unwrap();
        assert!(bob.get_by_id("a1").is_some());

        alice.delete("a1").unwrap();
        assert!(alice.get_by_id("a1").is_none());
        // Merge only adds and updates; bob keeps the record until a Set snapshot.
        assert!(bob.get_by_id("a1").is_some());
    }

    #[test]
    fn test_rejected_write_rolls_back_and_reports() {
        let (_dir, server) = open_server("rollback");
        server.create(create_args("a1", 1.0, "theirs")).unwrap();

        let errors = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let config = SyncConfig::default();
        let backend = synced_chat(SyncedChatProps::messages(
            connect(TransportKind::Poll, Arc::clone(&server)),
            &config,
        ))
        .unwrap();
        let session = SyncSession::init(
            Arc::new(backend),
            SessionConfig::default().with_error_handler(Arc::new(move |e: &ChatError| {
                sink.lock().unwrap().push(e.to_string());
            })),
        )
        .unwrap();

        // Someone else removes the record before our edit arrives.
        server.store().delete_by_local_id("a1").unwrap();
        let err = session.assign("a1", json!({"body": "mine"})).unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert_eq!(session.get_by_id("a1").unwrap()["body"], json!("theirs"));
        assert_eq!(session.pending_count(), 0);
        assert_eq!(errors.lock().unwrap().as_slice(), ["Document a1 does not exist."]);
    }

    #[test]
    fn test_clear_reaches_subscribed_sessions() {
        for kind in [TransportKind::Push, TransportKind::Poll] {
            let (_dir, server) = open_server("clear_live");
            let session = session_for(&server, kind, SyncMode::Set, None);
            session
                .assign("a1", json!({"localCreatedAt": 1.0, "author": "alice", "body": "hi"}))
                .unwrap();
            assert_eq!(session.get().len(), 1);

            assert_eq!(server.clear_all_records().unwrap(), 1);
            assert!(session.get().is_empty(), "{kind:?}");
            session.refresh().unwrap();
            assert!(session.get().is_empty(), "{kind:?}");
        }
    }

    #[test]
    fn test_pending_writes_replayed_on_start() {
        let (dir, server) = open_server("replay");
        let persist = PersistConfig::named(unique_name(&dir, "replay_cache"));

        {
            let cache = LocalCache::open(&persist).unwrap();
            cache
                .put_pending(&PendingWrite {
                    op: 1,
                    kind: CrudOp::Create,
                    record_id: "a1".to_string(),
                    value: json!({"localId": "a1", "localCreatedAt": 1.0, "author": "alice", "body": "offline"}),
                })
                .unwrap();
        }

        let session = session_for(&server, TransportKind::Push, SyncMode::Merge, Some(persist.clone()));
        assert_eq!(session.pending_count(), 0);
        assert_eq!(server.store().get_by_local_id("a1").unwrap().unwrap().body, "offline");
        assert!(session.get_by_id("a1").unwrap()["serverCreatedAt"].as_f64().is_some());
        session.dispose();
        drop(session);

        let cache = LocalCache::open(&persist).unwrap();
        assert!(cache.load_pending().unwrap().is_empty());
        assert!(cache.load_confirmed().unwrap().contains_key("a1"));
    }

    #[test]
    fn test_pending_writes_kept_without_retry() {
        let (dir, server) = open_server("no_replay");
        let persist = PersistConfig {
            retry_sync: false,
            ..PersistConfig::named(unique_name(&dir, "no_replay_cache"))
        };

        {
            let cache = LocalCache::open(&persist).unwrap();
            cache
                .put_pending(&PendingWrite {
                    op: 4,
                    kind: CrudOp::Create,
                    record_id: "a1".to_string(),
                    value: json!({"localId": "a1", "localCreatedAt": 1.0, "author": "alice", "body": "offline"}),
                })
                .unwrap();
        }

        let session = session_for(&server, TransportKind::Poll, SyncMode::Merge, Some(persist));
        assert_eq!(session.pending_count(), 1);
        assert_eq!(session.get_by_id("a1").unwrap()["body"], json!("offline"));
        assert!(server.store().get_by_local_id("a1").unwrap().is_none());

        assert_eq!(session.retry_pending(), 1);
        assert_eq!(session.pending_count(), 0);
        assert!(server.store().get_by_local_id("a1").unwrap().is_some());
    }

    #[test]
    fn test_confirmed_records_survive_restart() {
        let (dir, server) = open_server("restart");
        let persist = PersistConfig::named(unique_name(&dir, "restart_cache"));

        let session = session_for(&server, TransportKind::Push, SyncMode::Merge, Some(persist.clone()));
        session
            .assign("a1", json!({"localCreatedAt": 1.0, "author": "alice", "body": "hi"}))
            .unwrap();
        session.dispose();
        drop(session);

        // The server loses the record while the client is away.
        server.store().clear_all_records().unwrap();

        let restarted = session_for(&server, TransportKind::Push, SyncMode::Merge, Some(persist));
        assert_eq!(restarted.get_by_id("a1").unwrap()["body"], json!("hi"));
    }

    // ===============================
    // CHAT ROOM TESTS
    // ===============================

    fn room_config(dir: &TempDir, kind: TransportKind) -> SyncConfig {
        SyncConfig {
            store: StoreConfig::named(unique_name(dir, "room")),
            transport: kind,
            mode: SyncMode::Set,
            ..Default::default()
        }
    }

    #[test]
    fn test_chat_room_conversation() {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let config = room_config(&dir, TransportKind::Push);
        let (server, alice) = ChatRoom::open(&config, "alice").unwrap();
        let bob = ChatRoom::join(Arc::clone(&server), &config, SessionConfig::default(), "bob").unwrap();
        assert_eq!(bob.viewer(), "bob");

        let hello = alice.send("hello").unwrap();
        assert_eq!(hello.author, "alice");
        assert!(hello.server_created_at.is_some());
        let reply = bob.send("hi alice").unwrap();

        let seen: HashSet<String> = alice.messages().unwrap().into_iter().map(|m| m.body).collect();
        assert_eq!(seen, HashSet::from(["hello".to_string(), "hi alice".to_string()]));

        let edited = bob.edit(&reply.local_id, "hey alice").unwrap();
        assert_eq!(edited.author, "bob");
        assert!(alice
            .messages()
            .unwrap()
            .iter()
            .any(|m| m.local_id == reply.local_id && m.body == "hey alice"));

        alice.delete(&hello.local_id).unwrap();
        let remaining = bob.messages().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].local_id, reply.local_id);

        bob.leave();
        alice.send("anyone?").unwrap();
        assert_eq!(server.list(Default::default()).unwrap().len(), 2);
    }

    #[test]
    fn test_chat_room_rejects_empty_body() {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let (server, room) = ChatRoom::open(&room_config(&dir, TransportKind::Poll), "alice").unwrap();

        assert!(matches!(room.send(""), Err(ChatError::BadRequest(_))));
        assert!(room.messages().unwrap().is_empty());
        assert_eq!(server.store().count().unwrap(), 0);
    }

    #[test]
    fn test_chat_room_edit_missing_is_not_found() {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let (server, room) = ChatRoom::open(&room_config(&dir, TransportKind::Push), "alice").unwrap();

        assert!(matches!(room.edit("never-sent", "x"), Err(ChatError::NotFound(_))));

        let sent = room.send("hello").unwrap();
        room.delete(&sent.local_id).unwrap();
        assert!(matches!(room.edit(&sent.local_id, "too late"), Err(ChatError::NotFound(_))));
        assert_eq!(server.store().count().unwrap(), 0);
    }

    #[test]
    fn test_chat_room_orders_newest_first() {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let (_server, room) = ChatRoom::open(&room_config(&dir, TransportKind::Push), "alice").unwrap();

        for (id, at) in [("early", 10.0), ("late", 30.0), ("middle", 20.0)] {
            room.session()
                .assign(id, json!({"localCreatedAt": at, "author": "alice", "body": id}))
                .unwrap();
        }
        let order: Vec<String> = room.messages().unwrap().into_iter().map(|m| m.local_id).collect();
        assert_eq!(order, vec!["late", "middle", "early"]);

        room.leave();
    }

    #[test]
    fn test_disposed_session_releases_watcher() {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let config = room_config(&dir, TransportKind::Push);
        let (server, room) = ChatRoom::open(&config, "alice").unwrap();
        assert_eq!(server.hub().watcher_count(), 1);

        let other = SyncSession::init(
            Arc::new(
                synced_chat(SyncedChatProps::messages(
                    connect(TransportKind::Push, Arc::clone(&server)),
                    &config,
                ))
                .unwrap(),
            ),
            SessionConfig::default(),
        )
        .unwrap();
        assert_eq!(server.hub().watcher_count(), 2);
        other.dispose();

        assert!(matches!(
            other.assign("x", json!({"body": "late"})),
            Err(ChatError::SessionDisposed)
        ));
        room.send("still here").unwrap();
        assert_eq!(server.hub().watcher_count(), 1);
    }
}
