use crate::RecipientId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Recipient address must carry at least one identifier")]
    EmptyAddress,

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Unknown recipient: {0}")]
    UnknownRecipient(RecipientId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Merge of {absorbed} into {surviving} failed in {store}: {message}")]
    Cascade {
        store: &'static str,
        surviving: RecipientId,
        absorbed: RecipientId,
        message: String,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Uuid(#[from] uuid::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, Error>;
