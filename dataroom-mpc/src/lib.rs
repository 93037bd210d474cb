//! Multi-party aggregates over data rooms.
//!
//! Each participating organization evaluates the room's aggregate on its own
//! dataset, masks the result with random noise and hands the coordinator only
//! the masked share plus the noise encrypted under the coordinator's public
//! key. The coordinator reconstructs the masked total, decrypts and subtracts
//! the noise, optionally adds a Laplace layer, and never sees a per-party
//! value in the clear alongside its owner.

pub mod coordinator;
pub mod engine;
pub mod error;
pub mod keys;
pub mod participant;
pub mod room;
pub mod schema;

pub use coordinator::{MpcConfig, MpcCoordinator, MpcResult};
pub use engine::MpcEngine;
pub use error::{KeyError, MpcError, RoomError};
pub use keys::{decrypt_number, encrypt_number, public_key_from_pem, CoordinatorKeyPair, PRIVATE_KEY_ENV};
pub use participant::{ComputationRequest, LocalComputationParticipant, LocalContribution, MaskedValue};
pub use room::{
    DataRoom, DataRoomInvitation, DataRoomParticipant, InvitationStatus, ParticipantStatus,
    QueryType, RoomStatus,
};
pub use schema::{CompatibilityReport, SchemaCompatibilityChecker};
