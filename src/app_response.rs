use std::fmt::{Display, Formatter};

use lmdb::Error as LmdbError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeError;

use crate::error::ChatError;

/// JSON envelope returned by every FFI entry point.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub enum AppResponse {
    DatabaseError(String),
    SerializationError(String),
    NotFound(String),
    DuplicateIdentifier(String),
    BadRequest(String),
    TransportError(String),
    Ok(String),
}

impl Display for AppResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AppResponse::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            AppResponse::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            AppResponse::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppResponse::DuplicateIdentifier(msg) => write!(f, "Duplicate identifier: {}", msg),
            AppResponse::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            AppResponse::TransportError(msg) => write!(f, "Transport error: {}", msg),
            AppResponse::Ok(msg) => write!(f, "Ok: {}", msg),
        }
    }
}

impl From<LmdbError> for AppResponse {
    fn from(err: LmdbError) -> Self {
        match err {
            LmdbError::NotFound => AppResponse::NotFound("Key not found in database".to_string()),
            LmdbError::Corrupted => AppResponse::DatabaseError("Database is corrupted".to_string()),
            LmdbError::MapFull => AppResponse::DatabaseError("Database map is full".to_string()),
            _ => AppResponse::DatabaseError(format!("Database error: {:?}", err)),
        }
    }
}

impl From<SerdeError> for AppResponse {
    fn from(err: SerdeError) -> Self {
        AppResponse::SerializationError(format!("JSON serialization error: {}", err))
    }
}

impl From<ChatError> for AppResponse {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::DuplicateIdentifier(_) => AppResponse::DuplicateIdentifier(err.to_string()),
            ChatError::NotFound(_) => AppResponse::NotFound(err.to_string()),
            ChatError::BadRequest(msg) => AppResponse::BadRequest(msg),
            ChatError::Database(e) => AppResponse::from(e),
            ChatError::Serialization(e) => AppResponse::from(e),
            ChatError::Io(e) => AppResponse::DatabaseError(format!("IO error: {}", e)),
            ChatError::Transport(msg) => AppResponse::TransportError(msg),
            ChatError::SessionDisposed => AppResponse::BadRequest(err.to_string()),
        }
    }
}

impl AppResponse {
    pub fn success(msg: impl Into<String>) -> Self {
        AppResponse::Ok(msg.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, AppResponse::Ok(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_errors_map_to_matching_envelopes() {
        assert!(matches!(
            AppResponse::from(ChatError::DuplicateIdentifier("a1".to_string())),
            AppResponse::DuplicateIdentifier(msg) if msg == "Document a1 already exists."
        ));
        assert_eq!(
            AppResponse::from(ChatError::Transport("offline".to_string())),
            AppResponse::TransportError("offline".to_string())
        );
        assert!(matches!(AppResponse::from(ChatError::SessionDisposed), AppResponse::BadRequest(_)));
        assert!(matches!(
            AppResponse::from(ChatError::Database(LmdbError::MapFull)),
            AppResponse::DatabaseError(_)
        ));
    }

    #[test]
    fn test_envelope_json_shape() {
        let json = serde_json::to_string(&AppResponse::success("done")).unwrap();
        assert_eq!(json, r#"{"Ok":"done"}"#);
        assert!(AppResponse::success("done").is_ok());
    }
}
