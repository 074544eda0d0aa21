use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duplicate {kind} name `{name}`")]
    DuplicateName { kind: &'static str, name: String },

    #[error("tracking instance `{tracking_instance}` references unknown connection `{connection}`")]
    UnknownConnection {
        tracking_instance: String,
        connection: String,
    },

    #[error("receiver `{receiver}` references unknown tracking instance `{tracking_instance}`")]
    UnknownTrackingInstance {
        receiver: String,
        tracking_instance: String,
    },

    #[error("`{field}` of {owner} cannot be zero")]
    ZeroValue { owner: String, field: &'static str },

    #[error("`{field}` of {owner} cannot be empty")]
    EmptyValue { owner: String, field: &'static str },

    #[error("Invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,
}
