//! Client for the destination system's automation API.
//!
//! This crate provides:
//! - The [`Destination`] trait the migration engine calls through
//! - An HTTP implementation that posts operation calls and uploads attachments
//! - Bearer token providers, including an OpenID Connect password grant

mod auth;
mod call;
mod client;
mod error;

pub use auth::{Credentials, KeycloakConfig, KeycloakTokens, StaticToken, TokenProvider};
pub use call::{Destination, FileAttachment, OperationCall, OperationReply};
pub use client::{DestinationClient, DestinationConfig};
pub use error::DestinationError;
