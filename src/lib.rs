//! # Realtime Chat Core
//!
//! A realtime chat backend and its client-side sync layer, built on LMDB.
//!
//! ## Layers
//!
//! - [`message_store`]: LMDB record store with a `localId` secondary index and
//!   a newest-first listing.
//! - [`server`]: the `messages:list`, `messages:create`, `messages:update` and
//!   `messages:remove` functions, callable by name, with live query watchers.
//! - [`transport`]: push and poll client transports behind [`transport::SyncTransport`].
//! - [`synced_chat`]: adapter from the server functions to the generic
//!   [`crud::CrudBackend`] contract.
//! - [`sync_session`]: optimistic local session with an explicit lifecycle and
//!   optional [`local_cache`] persistence.
//! - [`chat`]: a room bound to one viewer.
//!
//! ## Quick Start
//!
//! ```no_run
//! use realtime_chat_core::chat::ChatRoom;
//! use realtime_chat_core::config::SyncConfig;
//!
//! let config = SyncConfig::default();
//! let (_server, room) = ChatRoom::open(&config, "alice")?;
//! room.send("hi")?;
//! for message in room.messages()? {
//!     println!("{}: {}", message.author, message.body);
//! }
//! # Ok::<(), realtime_chat_core::error::ChatError>(())
//! ```
//!
//! ## FFI Functions
//!
//! The server functions are also exposed as C-compatible functions that take
//! and return JSON. Every result is an [`app_response::AppResponse`] envelope
//! and must be released with [`chat_free_string`].
//!
//! - [`chat_open`] - Open a message store
//! - [`chat_list`] - Most recent messages
//! - [`chat_create`] - Create a message
//! - [`chat_update`] - Update a message
//! - [`chat_remove`] - Remove a message
//! - [`chat_call`] - Call any server function by name
//! - [`chat_clear_all_records`] - Remove every message
//! - [`chat_close`] - Close the store

pub mod app_response;
pub mod chat;
pub mod config;
pub mod crud;
pub mod error;
pub mod functions;
pub mod live;
pub mod local_cache;
pub mod message_model;
pub mod message_store;
pub mod server;
pub mod sync_session;
pub mod synced_chat;
pub mod transport;
mod test;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::app_response::AppResponse;
use crate::error::ChatError;
use crate::functions::api;
use crate::server::MessageServer;

/// Handle returned by [`chat_open`].
pub struct ChatBackend {
    server: Arc<MessageServer>,
}

impl ChatBackend {
    pub fn server(&self) -> &Arc<MessageServer> {
        &self.server
    }
}

/// Opens (creating if needed) the message store `<name>.lmdb`.
///
/// The store is an LMDB environment holding the messages, the `localId`
/// index and the id sequence. Live queries registered on the returned
/// handle are refreshed after every write made through it.
///
/// # Parameters
///
/// * `name` - A null-terminated C string containing the store name
///
/// # Returns
///
/// Returns a pointer to the [`ChatBackend`] on success, or a null pointer on failure.
/// Release the handle with [`chat_close`].
///
/// # Safety
///
/// `name` must be null or point to a null-terminated string that stays
/// valid for the duration of the call.
///
/// # Errors
///
/// Returns a null pointer if:
/// - `name` is null
/// - `name` contains invalid UTF-8
/// - the LMDB environment cannot be created or opened
///
/// # Examples
///
/// ```no_run
/// use std::ffi::CString;
/// use realtime_chat_core::{chat_close, chat_open};
///
/// let name = CString::new("chat").unwrap();
/// let backend = chat_open(name.as_ptr());
/// assert!(!backend.is_null());
/// chat_close(backend);
/// ```
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn chat_open(name: *const c_char) -> *mut ChatBackend {
    if name.is_null() {
        warn!("Null name pointer passed to chat_open");
        return std::ptr::null_mut();
    }

    let name_str = match unsafe { CStr::from_ptr(name).to_str() } {
        Ok(s) => s,
        Err(e) => {
            warn!("Invalid UTF-8 in name parameter: {e}");
            return std::ptr::null_mut();
        }
    };

    match MessageServer::open(&config::StoreConfig::named(name_str)) {
        Ok(server) => {
            info!("Message store {name_str} opened");
            Box::into_raw(Box::new(ChatBackend { server }))
        }
        Err(e) => {
            warn!("Failed to open message store {name_str}: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Returns the most recent messages.
///
/// # Parameters
///
/// * `state` - Pointer returned by [`chat_open`]
///
/// # Returns
///
/// An `Ok` envelope whose payload is a JSON array of at most 100 messages,
/// newest first. The returned string must be freed with [`chat_free_string`].
///
/// # Safety
///
/// `state` must be null or a live pointer returned by [`chat_open`].
///
/// # Errors
///
/// `BadRequest` for a null `state`, `DatabaseError` if the read fails.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn chat_list(state: *mut ChatBackend) -> *const c_char {
    let backend = match backend_ref(state, "chat_list") {
        Ok(backend) => backend,
        Err(error_ptr) => return error_ptr,
    };
    respond(backend.server.call(api::messages::LIST, JsonValue::Null))
}

/// Creates a message.
///
/// # Parameters
///
/// * `state` - Pointer returned by [`chat_open`]
/// * `json_ptr` - Null-terminated C string with the create arguments
///
/// # Returns
///
/// An `Ok` envelope with the stored message, including `serverCreatedAt`.
/// The returned string must be freed with [`chat_free_string`].
///
/// # Safety
///
/// Both pointers must be null or valid for the duration of the call;
/// `state` must come from [`chat_open`].
///
/// # Errors
///
/// - `DuplicateIdentifier` when the `localId` is already stored
/// - `SerializationError` for malformed JSON
/// - `BadRequest` for null pointers, missing fields or unknown fields
///
/// # JSON Format
///
/// ```json
/// {
///   "localId": "client generated identifier",
///   "localCreatedAt": 1700000000000,
///   "author": "alice",
///   "body": "hi"
/// }
/// ```
///
/// # Examples
///
/// ```no_run
/// use std::ffi::CString;
/// use realtime_chat_core::{chat_create, chat_open};
///
/// let name = CString::new("chat").unwrap();
/// let backend = chat_open(name.as_ptr());
/// let json = CString::new(r#"{"localId":"a1","localCreatedAt":1,"author":"alice","body":"hi"}"#).unwrap();
/// let result = chat_create(backend, json.as_ptr());
/// ```
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn chat_create(state: *mut ChatBackend, json_ptr: *const c_char) -> *const c_char {
    call_with_json(state, json_ptr, "chat_create", |server, args| {
        server.call(api::messages::CREATE, args)
    })
}

/// Merges the provided fields into the message with the given `localId`.
///
/// # Parameters
///
/// * `state` - Pointer returned by [`chat_open`]
/// * `json_ptr` - `{"localId", "localCreatedAt"?, "author"?, "body"?}`
///
/// # Returns
///
/// An `Ok` envelope with the updated message. Fields left out keep their value.
///
/// # Safety
///
/// Both pointers must be null or valid for the duration of the call.
///
/// # Errors
///
/// `NotFound` for an unknown `localId`; `BadRequest` or `SerializationError`
/// for bad input, as in [`chat_create`].
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn chat_update(state: *mut ChatBackend, json_ptr: *const c_char) -> *const c_char {
    call_with_json(state, json_ptr, "chat_update", |server, args| {
        server.call(api::messages::UPDATE, args)
    })
}

/// Removes the message `{"localId"}`.
///
/// # Returns
///
/// An `Ok` envelope with the removed message.
///
/// # Safety
///
/// Both pointers must be null or valid for the duration of the call.
///
/// # Errors
///
/// `NotFound` for an unknown `localId`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn chat_remove(state: *mut ChatBackend, json_ptr: *const c_char) -> *const c_char {
    call_with_json(state, json_ptr, "chat_remove", |server, args| {
        server.call(api::messages::REMOVE, args)
    })
}

/// Calls a server function by name, e.g. `messages:list`.
///
/// # Parameters
///
/// * `state` - Pointer returned by [`chat_open`]
/// * `name_ptr` - Function name such as `messages:create`
/// * `json_ptr` - Arguments as a JSON object (`{}` for `messages:list`)
///
/// # Safety
///
/// All pointers must be null or valid for the duration of the call.
///
/// # Errors
///
/// `BadRequest` for an unknown function name, plus the errors of the called function.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn chat_call(
    state: *mut ChatBackend,
    name_ptr: *const c_char,
    json_ptr: *const c_char,
) -> *const c_char {
    let name = match c_ptr_to_string(name_ptr, "function name") {
        Ok(name) => name,
        Err(error_ptr) => return error_ptr,
    };
    call_with_json(state, json_ptr, "chat_call", move |server, args| {
        server.call_by_name(&name, args)
    })
}

/// Removes every message. The store stays usable and live queries are refreshed.
///
/// # Returns
///
/// `Ok("<n> records cleared")`.
///
/// # Safety
///
/// `state` must be null or a live pointer returned by [`chat_open`].
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn chat_clear_all_records(state: *mut ChatBackend) -> *const c_char {
    let backend = match backend_ref(state, "chat_clear_all_records") {
        Ok(backend) => backend,
        Err(error_ptr) => return error_ptr,
    };
    match backend.server.clear_all_records() {
        Ok(count) => response_to_c_string(&AppResponse::success(format!("{count} records cleared"))),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Closes the store and frees the handle.
///
/// # Safety
///
/// `state` must be null or a pointer returned by [`chat_open`] that has not
/// been closed yet. The pointer must not be used afterwards.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn chat_close(state: *mut ChatBackend) -> *const c_char {
    if state.is_null() {
        let error = AppResponse::BadRequest("Null state pointer passed to chat_close".to_string());
        return response_to_c_string(&error);
    }

    let backend = unsafe { Box::from_raw(state) };
    let watchers = backend.server.hub().watcher_count();
    if watchers > 0 {
        warn!("Closing message store with {watchers} live watchers");
    }
    drop(backend);
    response_to_c_string(&AppResponse::success("Database connection closed successfully"))
}

/// Frees a string returned by any `chat_*` function.
///
/// # Safety
///
/// `ptr` must be null or a string returned by this library that has not been
/// freed yet.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn chat_free_string(ptr: *const c_char) {
    if ptr.is_null() {
        return;
    }
    drop(unsafe { CString::from_raw(ptr as *mut c_char) });
}

fn backend_ref<'a>(state: *mut ChatBackend, caller: &str) -> Result<&'a ChatBackend, *const c_char> {
    match unsafe { state.as_ref() } {
        Some(backend) => Ok(backend),
        None => {
            let error = AppResponse::BadRequest(format!("Null state pointer passed to {caller}"));
            Err(response_to_c_string(&error))
        }
    }
}

fn call_with_json<F>(state: *mut ChatBackend, json_ptr: *const c_char, caller: &str, call: F) -> *const c_char
where
    F: FnOnce(&MessageServer, JsonValue) -> Result<JsonValue, ChatError>,
{
    let backend = match backend_ref(state, caller) {
        Ok(backend) => backend,
        Err(error_ptr) => return error_ptr,
    };

    let json_str = match c_ptr_to_string(json_ptr, "JSON") {
        Ok(json) => json,
        Err(error_ptr) => return error_ptr,
    };

    let args: JsonValue = match serde_json::from_str(&json_str) {
        Ok(args) => args,
        Err(e) => {
            let error = AppResponse::SerializationError(format!("Invalid JSON: {e}"));
            return response_to_c_string(&error);
        }
    };

    respond(call(backend.server.as_ref(), args))
}

fn respond<T: Serialize>(result: Result<T, ChatError>) -> *const c_char {
    match result {
        Ok(value) => match serde_json::to_string(&value) {
            Ok(json) => response_to_c_string(&AppResponse::Ok(json)),
            Err(e) => {
                let error = AppResponse::SerializationError(format!("Failed to serialize result: {e}"));
                response_to_c_string(&error)
            }
        },
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Serializes `response` to a heap-allocated C string, or null if that fails.
fn response_to_c_string(response: &AppResponse) -> *const c_char {
    let json = match serde_json::to_string(response) {
        Ok(j) => j,
        Err(e) => {
            warn!("Error serializing response: {e}");
            return std::ptr::null();
        }
    };

    match CString::new(json) {
        Ok(c_str) => c_str.into_raw(),
        Err(e) => {
            warn!("Error creating CString: {e}");
            std::ptr::null()
        }
    }
}

/// Reads a C string argument, turning null pointers and invalid UTF-8 into
/// an error envelope.
fn c_ptr_to_string(ptr: *const c_char, field_name: &str) -> Result<String, *const c_char> {
    if ptr.is_null() {
        let error = AppResponse::BadRequest(format!("Null {field_name} pointer"));
        return Err(response_to_c_string(&error));
    }

    match unsafe { CStr::from_ptr(ptr).to_str() } {
        Ok(s) => Ok(s.to_string()),
        Err(e) => {
            let error = AppResponse::BadRequest(format!("Invalid UTF-8 in {field_name}: {e}"));
            Err(response_to_c_string(&error))
        }
    }
}
