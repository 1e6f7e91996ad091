use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::types::{Sequence, SequenceStatus, SequenceTrigger};

/// A mutation on a contact that may enroll it somewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactEvent {
    pub client_id: Uuid,
    pub contact_id: Uuid,
    pub kind: ContactEventKind,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ContactEventKind {
    TagAdded { tag: String },
    ExternalCampaignJoined { campaign_id: String },
}

/// A (sequence, contact) pair the trigger path wants enrolled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentRequest {
    pub sequence_id: Uuid,
    pub contact_id: Uuid,
    pub at: DateTime<Utc>,
}

/// Matches contact events against sequence triggers. Holds no state and never
/// looks at enrollments; deduplication is the enrollment manager's job.
#[derive(Debug, Clone, Default)]
pub struct TriggerEvaluator;

impl TriggerEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Emits one request per active sequence of the event's client whose
    /// trigger matches the event exactly.
    pub fn evaluate<'a>(
        &self,
        event: &ContactEvent,
        sequences: impl IntoIterator<Item = &'a Sequence>,
    ) -> Vec<EnrollmentRequest> {
        let requests: Vec<EnrollmentRequest> = sequences
            .into_iter()
            .filter(|seq| seq.status == SequenceStatus::Active)
            .filter(|seq| seq.client_id == event.client_id)
            .filter(|seq| Self::matches(&seq.trigger, &event.kind))
            .map(|seq| EnrollmentRequest {
                sequence_id: seq.id,
                contact_id: event.contact_id,
                at: event.occurred_at,
            })
            .collect();

        debug!(
            contact_id = %event.contact_id,
            kind = ?event.kind,
            matched = requests.len(),
            "Evaluated contact event against sequence triggers"
        );
        requests
    }

    /// Exact, case-sensitive equality on the trigger parameter.
    pub fn matches(trigger: &SequenceTrigger, kind: &ContactEventKind) -> bool {
        match (trigger, kind) {
            (SequenceTrigger::TagAdded { tag }, ContactEventKind::TagAdded { tag: added }) => {
                tag == added
            }
            (
                SequenceTrigger::ExternalCampaign { campaign_id },
                ContactEventKind::ExternalCampaignJoined { campaign_id: joined },
            ) => campaign_id == joined,
            (SequenceTrigger::Manual, _)
            | (SequenceTrigger::TagAdded { .. }, ContactEventKind::ExternalCampaignJoined { .. })
            | (SequenceTrigger::ExternalCampaign { .. }, ContactEventKind::TagAdded { .. }) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Tz;

    fn sequence(client_id: Uuid, trigger: SequenceTrigger, status: SequenceStatus) -> Sequence {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Sequence {
            id: Uuid::new_v4(),
            client_id,
            name: "seq".to_string(),
            status,
            trigger,
            steps: vec![],
            preferred_time: None,
            timezone: Tz::UTC,
            sender: None,
            total_enrolled: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn tag_event(client_id: Uuid, tag: &str) -> ContactEvent {
        ContactEvent {
            client_id,
            contact_id: Uuid::new_v4(),
            kind: ContactEventKind::TagAdded {
                tag: tag.to_string(),
            },
            occurred_at: Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_tag_trigger_matches_exactly() {
        let client = Uuid::new_v4();
        let webinar = sequence(
            client,
            SequenceTrigger::TagAdded {
                tag: "Webinar 2025".into(),
            },
            SequenceStatus::Active,
        );
        let other = sequence(
            client,
            SequenceTrigger::TagAdded {
                tag: "Web Order".into(),
            },
            SequenceStatus::Active,
        );
        let evaluator = TriggerEvaluator::new();
        let event = tag_event(client, "Webinar 2025");

        let requests = evaluator.evaluate(&event, [&webinar, &other]);
        assert_eq!(
            requests,
            vec![EnrollmentRequest {
                sequence_id: webinar.id,
                contact_id: event.contact_id,
                at: event.occurred_at,
            }]
        );

        assert!(evaluator
            .evaluate(&tag_event(client, "webinar 2025"), [&webinar])
            .is_empty());
        assert!(evaluator.evaluate(&tag_event(client, "Webinar"), [&webinar]).is_empty());
    }

    #[test]
    fn test_only_active_sequences_of_same_client() {
        let client = Uuid::new_v4();
        let trigger = SequenceTrigger::TagAdded { tag: "CIP2021".into() };
        let draft = sequence(client, trigger.clone(), SequenceStatus::Draft);
        let paused = sequence(client, trigger.clone(), SequenceStatus::Paused);
        let foreign = sequence(Uuid::new_v4(), trigger.clone(), SequenceStatus::Active);
        let active = sequence(client, trigger, SequenceStatus::Active);

        let requests = TriggerEvaluator::new().evaluate(
            &tag_event(client, "CIP2021"),
            [&draft, &paused, &foreign, &active],
        );
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].sequence_id, active.id);
    }

    #[test]
    fn test_external_campaign_trigger() {
        let client = Uuid::new_v4();
        let seq = sequence(
            client,
            SequenceTrigger::ExternalCampaign {
                campaign_id: "701Hs00000ABC".into(),
            },
            SequenceStatus::Active,
        );
        let joined = ContactEvent {
            client_id: client,
            contact_id: Uuid::new_v4(),
            kind: ContactEventKind::ExternalCampaignJoined {
                campaign_id: "701Hs00000ABC".into(),
            },
            occurred_at: Utc::now(),
        };
        assert_eq!(TriggerEvaluator::new().evaluate(&joined, [&seq]).len(), 1);

        // A tag with the same text as the campaign id is a different kind.
        let tagged = tag_event(client, "701Hs00000ABC");
        assert!(TriggerEvaluator::new().evaluate(&tagged, [&seq]).is_empty());
    }

    #[test]
    fn test_manual_sequences_never_match() {
        assert!(!TriggerEvaluator::matches(
            &SequenceTrigger::Manual,
            &ContactEventKind::TagAdded { tag: "x".into() }
        ));
    }
}
