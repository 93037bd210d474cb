//! Data rooms: the membership and lifecycle state of one multi-party query.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use dataroom_core::{random_id, Actor, AggregateFunction, DatasetId, FilterPredicate, OrganizationId};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::RoomError;

pub const DEFAULT_ROOM_EPSILON: f64 = 0.1;
pub const DEFAULT_ROOM_SENSITIVITY: f64 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Sum,
    Count,
    Avg,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Sum => "sum",
            QueryType::Count => "count",
            QueryType::Avg => "avg",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [QueryType::Sum, QueryType::Count, QueryType::Avg]
            .into_iter()
            .find(|query_type| query_type.as_str().eq_ignore_ascii_case(name))
    }

    /// Aggregate each participant evaluates locally. AVG is assembled from a
    /// SUM and a COUNT.
    pub fn local_aggregate(&self) -> AggregateFunction {
        match self {
            QueryType::Count => AggregateFunction::Count,
            QueryType::Sum | QueryType::Avg => AggregateFunction::Sum,
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Pending,
    Attested,
    Executing,
    Completed,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Invited,
    Attested,
    Computed,
    Declined,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
}

impl fmt::Display for InvitationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Declined => "declined",
            InvitationStatus::Expired => "expired",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataRoomParticipant {
    pub organization: OrganizationId,
    pub dataset: DatasetId,
    pub status: ParticipantStatus,
    /// Masked share, encrypted noise, SQL and timing once computed.
    pub metadata: Value,
    pub error: Option<String>,
    pub attested_at: Option<DateTime<Utc>>,
    pub computed_at: Option<DateTime<Utc>>,
}

impl DataRoomParticipant {
    fn new(organization: OrganizationId, dataset: DatasetId) -> Self {
        Self {
            organization,
            dataset,
            status: ParticipantStatus::Invited,
            metadata: Value::Null,
            error: None,
            attested_at: None,
            computed_at: None,
        }
    }

    pub(crate) fn mark_computed(&mut self, metadata: Value) {
        self.status = ParticipantStatus::Computed;
        self.metadata = metadata;
        self.error = None;
        self.computed_at = Some(Utc::now());
    }

    pub(crate) fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = ParticipantStatus::Failed;
        self.error = Some(error.into());
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataRoomInvitation {
    pub token: String,
    pub organization: OrganizationId,
    pub status: InvitationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DataRoomInvitation {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataRoom {
    id: String,
    pub name: String,
    pub query_type: QueryType,
    pub column: String,
    pub filters: Vec<FilterPredicate>,
    pub epsilon: f64,
    pub sensitivity: f64,
    pub apply_dp_noise: bool,
    pub creator: Actor,
    status: RoomStatus,
    participants: Vec<DataRoomParticipant>,
    invitations: Vec<DataRoomInvitation>,
    result: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DataRoom {
    pub fn new(
        name: impl Into<String>,
        query_type: QueryType,
        column: impl Into<String>,
        creator: Actor,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: random_id("room"),
            name: name.into(),
            query_type,
            column: column.into(),
            filters: Vec::new(),
            epsilon: DEFAULT_ROOM_EPSILON,
            sensitivity: DEFAULT_ROOM_SENSITIVITY,
            apply_dp_noise: true,
            creator,
            status: RoomStatus::Pending,
            participants: Vec::new(),
            invitations: Vec::new(),
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_filters(mut self, filters: Vec<FilterPredicate>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_sensitivity(mut self, sensitivity: f64) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn with_dp_noise(mut self, apply: bool) -> Self {
        self.apply_dp_noise = apply;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> RoomStatus {
        self.status
    }

    pub fn participants(&self) -> &[DataRoomParticipant] {
        &self.participants
    }

    pub fn participant(&self, organization: &OrganizationId) -> Option<&DataRoomParticipant> {
        self.participants
            .iter()
            .find(|participant| &participant.organization == organization)
    }

    pub fn invitations(&self) -> &[DataRoomInvitation] {
        &self.invitations
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Organizations whose participant has neither attested nor declined.
    pub fn unattested(&self) -> Vec<OrganizationId> {
        self.organizations_where(|status| {
            !matches!(status, ParticipantStatus::Attested | ParticipantStatus::Declined)
        })
    }

    pub fn declined(&self) -> Vec<OrganizationId> {
        self.organizations_where(|status| status == ParticipantStatus::Declined)
    }

    fn organizations_where(&self, keep: impl Fn(ParticipantStatus) -> bool) -> Vec<OrganizationId> {
        self.participants
            .iter()
            .filter(|participant| keep(participant.status))
            .map(|participant| participant.organization.clone())
            .collect()
    }

    /// Issues an invitation with a random 128-bit hex token.
    pub fn invite(
        &mut self,
        organization: OrganizationId,
        ttl: Duration,
    ) -> Result<&DataRoomInvitation, RoomError> {
        self.ensure_open()?;
        if self.participant(&organization).is_some() {
            return Err(RoomError::AlreadyParticipant(organization));
        }
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let now = Utc::now();
        self.invitations.push(DataRoomInvitation {
            token: hex::encode(bytes),
            organization,
            status: InvitationStatus::Pending,
            created_at: now,
            expires_at: now + ttl,
        });
        self.touch();
        Ok(&self.invitations[self.invitations.len() - 1])
    }

    /// Accepts a pending invitation and enrolls `dataset` for the invited
    /// organization. An invitation past its expiry is marked expired.
    pub fn accept_invitation(
        &mut self,
        token: &str,
        dataset: DatasetId,
        now: DateTime<Utc>,
    ) -> Result<&DataRoomParticipant, RoomError> {
        self.ensure_open()?;
        let index = self.pending_invitation(token)?;
        if self.invitations[index].is_expired_at(now) {
            self.invitations[index].status = InvitationStatus::Expired;
            self.touch();
            return Err(RoomError::InvitationExpired(token.to_owned()));
        }
        let organization = self.invitations[index].organization.clone();
        self.add_participant(organization, dataset)?;
        self.invitations[index].status = InvitationStatus::Accepted;
        Ok(&self.participants[self.participants.len() - 1])
    }

    pub fn decline_invitation(&mut self, token: &str) -> Result<(), RoomError> {
        let index = self.pending_invitation(token)?;
        self.invitations[index].status = InvitationStatus::Declined;
        self.touch();
        Ok(())
    }

    /// Marks every pending invitation past its expiry; returns how many.
    pub fn expire_invitations(&mut self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for invitation in &mut self.invitations {
            if invitation.status == InvitationStatus::Pending && invitation.is_expired_at(now) {
                invitation.status = InvitationStatus::Expired;
                expired += 1;
            }
        }
        if expired > 0 {
            self.touch();
        }
        expired
    }

    /// Enrolls an organization directly. A new member reopens an attested
    /// room until it attests as well.
    pub fn add_participant(
        &mut self,
        organization: OrganizationId,
        dataset: DatasetId,
    ) -> Result<(), RoomError> {
        self.ensure_open()?;
        if self.participant(&organization).is_some() {
            return Err(RoomError::AlreadyParticipant(organization));
        }
        self.participants
            .push(DataRoomParticipant::new(organization, dataset));
        self.status = RoomStatus::Pending;
        self.touch();
        Ok(())
    }

    /// Records an organization's attestation. Returns `true` when this call
    /// moved the room to attested.
    pub fn attest(&mut self, organization: &OrganizationId) -> Result<bool, RoomError> {
        self.ensure_open()?;
        let participant = self
            .participants
            .iter_mut()
            .find(|participant| &participant.organization == organization)
            .ok_or_else(|| RoomError::UnknownParticipant(organization.clone()))?;
        match participant.status {
            ParticipantStatus::Attested => {}
            ParticipantStatus::Declined => {
                return Err(RoomError::Declined(organization.clone()));
            }
            _ => {
                participant.status = ParticipantStatus::Attested;
                participant.attested_at = Some(Utc::now());
            }
        }
        self.touch();
        let ready = self.participants.len() >= 2
            && self
                .participants
                .iter()
                .all(|participant| participant.status == ParticipantStatus::Attested);
        if ready && self.status == RoomStatus::Pending {
            self.status = RoomStatus::Attested;
            info!(room = %self.id, participants = self.participants.len(), "data room attested");
            return Ok(true);
        }
        Ok(false)
    }

    /// Records that an enrolled organization will not contribute. An
    /// attested room drops back to pending and cannot execute.
    pub fn decline(&mut self, organization: &OrganizationId) -> Result<(), RoomError> {
        self.ensure_open()?;
        let participant = self
            .participants
            .iter_mut()
            .find(|participant| &participant.organization == organization)
            .ok_or_else(|| RoomError::UnknownParticipant(organization.clone()))?;
        participant.status = ParticipantStatus::Declined;
        participant.attested_at = None;
        self.status = RoomStatus::Pending;
        self.touch();
        info!(room = %self.id, organization = %organization, "participant declined");
        Ok(())
    }

    pub(crate) fn participants_mut(&mut self) -> &mut [DataRoomParticipant] {
        &mut self.participants
    }

    pub(crate) fn mark_executing(&mut self) {
        self.status = RoomStatus::Executing;
        self.touch();
    }

    pub(crate) fn mark_completed(&mut self, result: Value) {
        self.status = RoomStatus::Completed;
        self.result = Some(result);
        self.touch();
    }

    pub(crate) fn mark_failed(&mut self, error: &str) {
        self.status = RoomStatus::Failed;
        self.result = Some(serde_json::json!({ "error": error }));
        self.touch();
    }

    fn ensure_open(&self) -> Result<(), RoomError> {
        match self.status {
            RoomStatus::Pending | RoomStatus::Attested => Ok(()),
            other => Err(RoomError::Locked(other)),
        }
    }

    fn pending_invitation(&self, token: &str) -> Result<usize, RoomError> {
        let index = self
            .invitations
            .iter()
            .position(|invitation| invitation.token == token)
            .ok_or_else(|| RoomError::UnknownInvitation(token.to_owned()))?;
        let invitation = &self.invitations[index];
        if invitation.status != InvitationStatus::Pending {
            return Err(RoomError::InvitationClosed {
                token: token.to_owned(),
                status: invitation.status.to_string(),
            });
        }
        Ok(index)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> DataRoom {
        DataRoom::new("revenue", QueryType::Sum, "revenue", Actor::from("analyst"))
    }

    #[test]
    fn defaults_follow_room_contract() {
        let room = room();
        assert!(room.id().starts_with("room-"));
        assert_eq!(room.status(), RoomStatus::Pending);
        assert_eq!(room.epsilon, 0.1);
        assert_eq!(room.sensitivity, 1.0);
        assert!(room.apply_dp_noise);
        assert_eq!(QueryType::from_name("AVG"), Some(QueryType::Avg));
        assert_eq!(QueryType::Avg.local_aggregate(), AggregateFunction::Sum);
    }

    #[test]
    fn invitation_lifecycle() {
        let mut room = room();
        let token = room
            .invite("org-b".into(), Duration::hours(1))
            .unwrap()
            .token
            .clone();
        assert_eq!(token.len(), 32);

        let participant = room
            .accept_invitation(&token, "ds-b".into(), Utc::now())
            .unwrap();
        assert_eq!(participant.status, ParticipantStatus::Invited);
        assert_eq!(room.invitations()[0].status, InvitationStatus::Accepted);

        assert_eq!(
            room.decline_invitation(&token),
            Err(RoomError::InvitationClosed {
                token: token.clone(),
                status: "accepted".into()
            })
        );
        assert!(matches!(
            room.invite("org-b".into(), Duration::hours(1)),
            Err(RoomError::AlreadyParticipant(_))
        ));
    }

    #[test]
    fn expired_invitations_cannot_be_accepted() {
        let mut room = room();
        let token = room
            .invite("org-c".into(), Duration::minutes(5))
            .unwrap()
            .token
            .clone();
        room.invite("org-d".into(), Duration::minutes(5)).unwrap();
        let later = Utc::now() + Duration::minutes(10);
        assert_eq!(
            room.accept_invitation(&token, "ds-c".into(), later).err(),
            Some(RoomError::InvitationExpired(token.clone()))
        );
        assert_eq!(room.expire_invitations(later), 1);
        assert!(room
            .invitations()
            .iter()
            .all(|invitation| invitation.status == InvitationStatus::Expired));
        assert!(room.participants().is_empty());
    }

    #[test]
    fn room_attests_once_every_member_has() {
        let mut room = room();
        room.add_participant("org-a".into(), "ds-a".into()).unwrap();
        assert!(!room.attest(&"org-a".into()).unwrap());
        room.add_participant("org-b".into(), "ds-b".into()).unwrap();
        assert_eq!(room.unattested(), vec![OrganizationId::from("org-b")]);
        assert!(room.attest(&"org-b".into()).unwrap());
        assert_eq!(room.status(), RoomStatus::Attested);
        assert!(!room.attest(&"org-b".into()).unwrap());

        room.add_participant("org-c".into(), "ds-c".into()).unwrap();
        assert_eq!(room.status(), RoomStatus::Pending);
        assert_eq!(
            room.attest(&"org-z".into()),
            Err(RoomError::UnknownParticipant("org-z".into()))
        );
    }

    #[test]
    fn declined_member_blocks_attestation() {
        let mut room = room();
        room.add_participant("org-a".into(), "ds-a".into()).unwrap();
        room.add_participant("org-b".into(), "ds-b".into()).unwrap();
        room.attest(&"org-a".into()).unwrap();
        assert!(room.attest(&"org-b".into()).unwrap());

        room.decline(&"org-b".into()).unwrap();
        assert_eq!(room.status(), RoomStatus::Pending);
        assert_eq!(room.declined(), vec![OrganizationId::from("org-b")]);
        assert!(room.unattested().is_empty());
        assert_eq!(
            room.participant(&"org-b".into()).map(|p| p.status),
            Some(ParticipantStatus::Declined)
        );
        assert_eq!(
            room.attest(&"org-b".into()),
            Err(RoomError::Declined("org-b".into()))
        );
        assert!(!room.attest(&"org-a".into()).unwrap());
        assert_eq!(
            room.decline(&"org-z".into()),
            Err(RoomError::UnknownParticipant("org-z".into()))
        );
    }

    #[test]
    fn terminal_rooms_are_locked() {
        let mut room = room();
        room.mark_failed("boom");
        assert_eq!(
            room.add_participant("org-a".into(), "ds-a".into()),
            Err(RoomError::Locked(RoomStatus::Failed))
        );
        assert_eq!(room.result(), Some(&serde_json::json!({"error": "boom"})));
    }
}
