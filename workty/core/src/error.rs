use serde_json::Value;
use workty_protocol::{error_codes, ErrorObject};

pub type Result<T> = core::result::Result<T, Error>;

/// Failure taxonomy for the orchestration core.
///
/// Every variant maps onto a stable numeric code from
/// [`workty_protocol::error_codes`]; the rendered [`ErrorObject`] is what
/// crosses the channel boundary, never the raw error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{entity} not found: {id}")]
    EntityNotFound { entity: &'static str, id: String },

    #[error("invalid request: {message}")]
    BadDigest { message: String, input: Option<Value> },

    #[error("operation forbidden: {resource}.{permission}")]
    OperationForbidden {
        resource: &'static str,
        permission: &'static str,
    },

    #[error("store failure: {0}")]
    Store(String),

    #[error("no device available for borrow")]
    DeviceUnavailable,

    #[error("device offline: {0}")]
    DeviceOffline(String),

    #[error("unknown context name: {0}")]
    UnknownContext(String),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::EntityNotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn bad_digest(message: impl Into<String>) -> Self {
        Error::BadDigest {
            message: message.into(),
            input: None,
        }
    }

    pub fn bad_input(message: impl Into<String>, input: Value) -> Self {
        Error::BadDigest {
            message: message.into(),
            input: Some(input),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Error::EntityNotFound { .. } => error_codes::ENTITY_NOT_FOUND,
            Error::BadDigest { .. } => error_codes::BAD_DIGEST,
            Error::OperationForbidden { .. } => error_codes::OPERATION_FORBIDDEN,
            Error::Store(_) => error_codes::STORE_ERROR,
            Error::DeviceUnavailable => error_codes::DEVICE_UNAVAILABLE,
            Error::DeviceOffline(_) => error_codes::DEVICE_OFFLINE,
            Error::UnknownContext(_) => error_codes::INTERNAL,
        }
    }

    /// Render into the structured shape broadcast to clients
    pub fn to_object(&self) -> ErrorObject {
        let input = match self {
            Error::BadDigest { input, .. } => input.clone(),
            _ => None,
        };
        ErrorObject {
            code: self.code(),
            message: self.to_string(),
            link: None,
            input,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::not_found("workflow", "x").code(), 1);
        assert_eq!(Error::bad_digest("missing field").code(), 2);
        assert_eq!(
            Error::OperationForbidden {
                resource: "devices",
                permission: "update"
            }
            .code(),
            3
        );
        assert_eq!(Error::Store("boom".into()).code(), 4);
        assert_eq!(Error::DeviceUnavailable.code(), 5);
        assert_eq!(Error::DeviceOffline("gone".into()).code(), 6);
    }

    #[test]
    fn bad_input_echoes_offending_payload() {
        let err = Error::bad_input("name is required", json!({ "desc": "no name" }));
        let object = err.to_object();
        assert_eq!(object.code, 2);
        assert_eq!(object.input.unwrap()["desc"], "no name");
    }
}
