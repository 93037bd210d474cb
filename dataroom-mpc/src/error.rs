use dataroom_core::{DatasetError, OrganizationId};
use thiserror::Error;

use crate::room::RoomStatus;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid RSA private key: {0}")]
    InvalidPrivateKey(String),
    #[error("invalid RSA public key: {0}")]
    InvalidPublicKey(String),
    #[error("key generation failed: {0}")]
    Generation(String),
    #[error("could not read key file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("decrypted payload has {0} bytes, expected 8")]
    Payload(usize),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RoomError {
    #[error("organization {0} already participates in this room")]
    AlreadyParticipant(OrganizationId),
    #[error("organization {0} is not a participant")]
    UnknownParticipant(OrganizationId),
    #[error("no invitation with token {0}")]
    UnknownInvitation(String),
    #[error("invitation {token} is already {status}")]
    InvitationClosed { token: String, status: String },
    #[error("invitation {0} has expired")]
    InvitationExpired(String),
    #[error("organization {0} declined to participate")]
    Declined(OrganizationId),
    #[error("room is {0:?} and can no longer change membership")]
    Locked(RoomStatus),
}

#[derive(Debug, Error)]
pub enum MpcError {
    #[error("need at least {required} parties, got {actual}")]
    NotEnoughParties { required: usize, actual: usize },
    #[error("share value must be finite (got {0})")]
    NonFinite(f64),
    #[error("cannot reconstruct from zero shares")]
    NoShares,
    #[error("{name} must be strictly positive (got {value})")]
    NonPositive { name: &'static str, value: f64 },
    #[error("room is {0:?}; execution needs an attested room")]
    InvalidRoomState(RoomStatus),
    #[error("participants declined: {}", join_orgs(.0))]
    Declined(Vec<OrganizationId>),
    #[error("participants have not attested: {}", join_orgs(.0))]
    NotAttested(Vec<OrganizationId>),
    #[error("schema check failed: {}", .0.join("; "))]
    Schema(Vec<String>),
    #[error("participant computation failed for {}", describe_failures(.0))]
    ParticipantsFailed(Vec<(OrganizationId, String)>),
    #[error("average over zero records")]
    EmptyAverage,
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Room(#[from] RoomError),
}

fn join_orgs(orgs: &[OrganizationId]) -> String {
    orgs.iter()
        .map(OrganizationId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_failures(failures: &[(OrganizationId, String)]) -> String {
    failures
        .iter()
        .map(|(org, error)| format!("{org} ({error})"))
        .collect::<Vec<_>>()
        .join(", ")
}
