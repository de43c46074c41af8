use crate::error::{Result, VerifyError};
use crate::store::{ScanEvent, ScanRecord, ScanStore};
use crate::verify::FaceComparisonResult;
use std::path::{Path, PathBuf};

/// Progress of one attendance-verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingCard,
    CardReceived,
    FaceCapturing,
    FaceVerifying,
    Verified,
    Rejected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One attendance check for one expected person.
///
/// Confirmation requires the card scan for the expected citizen id and a
/// successful face comparison against that scan, in that order. Sessions
/// are not persisted; they live for the duration of the dialog or attempt.
pub struct VerificationSession {
    expected_citizen_id: String,
    expected_user: String,
    exam_reference: Option<String>,
    cccd_verified: bool,
    face_verified: bool,
    scan_image_path: Option<PathBuf>,
    captured_face_path: Option<PathBuf>,
    state: SessionState,
}

impl VerificationSession {
    pub fn new(
        expected_citizen_id: impl Into<String>,
        expected_user: impl Into<String>,
        exam_reference: Option<String>,
    ) -> Self {
        Self {
            expected_citizen_id: expected_citizen_id.into(),
            expected_user: expected_user.into(),
            exam_reference,
            cccd_verified: false,
            face_verified: false,
            scan_image_path: None,
            captured_face_path: None,
            state: SessionState::Idle,
        }
    }

    /// Starts waiting for the card. A scan that arrived before the session
    /// started still counts: the store is consulted and the session moves
    /// straight to `CardReceived` if a record for the expected id exists.
    pub fn begin(&mut self, store: &ScanStore) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(VerifyError::InvalidTransition {
                from: self.state,
                action: "begin session",
            });
        }

        self.state = SessionState::AwaitingCard;
        if let Some(record) = store.get(&self.expected_citizen_id) {
            tracing::debug!(
                "Adopting existing scan record for {}",
                self.expected_citizen_id
            );
            self.accept_card(record.image_path);
        }
        Ok(())
    }

    /// Feeds a store notification into the session. A mismatched citizen
    /// id is ignored here; it may satisfy a different concurrent session.
    /// Returns whether the event was consumed.
    pub fn observe_scan(&mut self, event: &ScanEvent) -> bool {
        if event.citizen_id != self.expected_citizen_id {
            return false;
        }
        if self.state != SessionState::AwaitingCard {
            return false;
        }

        self.accept_card(event.image_path.clone());
        true
    }

    fn accept_card(&mut self, image_path: PathBuf) {
        self.cccd_verified = true;
        self.scan_image_path = Some(image_path);
        self.state = SessionState::CardReceived;
    }

    /// Fetches the scan record to compare against, distinguishing "no scan
    /// yet" from a record whose image has gone missing on disk.
    pub fn reference_scan(&self, store: &ScanStore) -> Result<ScanRecord> {
        let record = store
            .get(&self.expected_citizen_id)
            .ok_or_else(|| VerifyError::CardNotReceived(self.expected_citizen_id.clone()))?;

        if !record.image_path.exists() {
            return Err(VerifyError::Storage(format!(
                "CCCD image missing on disk: {}",
                record.image_path.display()
            )));
        }
        Ok(record)
    }

    /// Comparing against another identity's scan is a protocol error, not
    /// a timing issue; callers holding an explicit record check it here.
    pub fn ensure_expected_identity(&self, record: &ScanRecord) -> Result<()> {
        if record.citizen_id != self.expected_citizen_id {
            return Err(VerifyError::IdentityMismatch {
                expected: self.expected_citizen_id.clone(),
                scanned: record.citizen_id.clone(),
            });
        }
        Ok(())
    }

    /// The capture collaborator hands over a candidate face image.
    /// Allowed again after a rejection; retries are unlimited.
    pub fn begin_capture(&mut self, captured: &Path) -> Result<()> {
        match self.state {
            SessionState::CardReceived | SessionState::FaceCapturing | SessionState::Rejected => {
                self.captured_face_path = Some(captured.to_path_buf());
                self.state = SessionState::FaceCapturing;
                Ok(())
            }
            from => Err(VerifyError::InvalidTransition {
                from,
                action: "begin face capture",
            }),
        }
    }

    pub fn begin_verification(&mut self) -> Result<()> {
        if self.state != SessionState::FaceCapturing {
            return Err(VerifyError::InvalidTransition {
                from: self.state,
                action: "begin face verification",
            });
        }
        self.state = SessionState::FaceVerifying;
        Ok(())
    }

    /// Applies the engine's verdict. The session is only mutated here,
    /// once the result is known; a caller that discards an in-flight
    /// comparison leaves the session untouched.
    pub fn record_comparison(&mut self, result: &FaceComparisonResult) -> Result<()> {
        if self.state != SessionState::FaceVerifying {
            return Err(VerifyError::InvalidTransition {
                from: self.state,
                action: "record comparison result",
            });
        }

        if result.is_match {
            self.face_verified = true;
            self.state = SessionState::Verified;
        } else {
            self.state = SessionState::Rejected;
        }
        Ok(())
    }

    /// Attendance confirmation is permitted from `Verified` only.
    pub fn confirm(&self) -> Result<()> {
        if self.state != SessionState::Verified {
            return Err(VerifyError::NotVerified(self.state));
        }
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn expected_citizen_id(&self) -> &str {
        &self.expected_citizen_id
    }

    pub fn expected_user(&self) -> &str {
        &self.expected_user
    }

    pub fn exam_reference(&self) -> Option<&str> {
        self.exam_reference.as_deref()
    }

    pub fn cccd_verified(&self) -> bool {
        self.cccd_verified
    }

    pub fn face_verified(&self) -> bool {
        self.face_verified
    }

    pub fn scan_image_path(&self) -> Option<&Path> {
        self.scan_image_path.as_deref()
    }

    pub fn captured_face_path(&self) -> Option<&Path> {
        self.captured_face_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::MatchOutcome;
    use chrono::Local;

    const EXPECTED_ID: &str = "001204038012";

    fn record(citizen_id: &str) -> ScanRecord {
        ScanRecord {
            citizen_id: citizen_id.to_string(),
            image_path: PathBuf::from(format!("cccd_{citizen_id}.jpg")),
            received_at: Local::now(),
            raw_payload: serde_json::json!({ "citizenId": citizen_id }),
        }
    }

    fn event(citizen_id: &str) -> ScanEvent {
        ScanEvent {
            citizen_id: citizen_id.to_string(),
            image_path: PathBuf::from(format!("cccd_{citizen_id}.jpg")),
            raw_payload: serde_json::json!({ "citizenId": citizen_id }),
        }
    }

    fn match_result(confidence: f32) -> FaceComparisonResult {
        FaceComparisonResult {
            is_match: true,
            confidence,
            outcome: if confidence >= 0.75 {
                MatchOutcome::HighConfidenceMatch
            } else {
                MatchOutcome::MediumConfidenceMatch
            },
        }
    }

    fn mismatch_result() -> FaceComparisonResult {
        FaceComparisonResult {
            is_match: false,
            confidence: 0.3,
            outcome: MatchOutcome::Mismatch,
        }
    }

    fn started_session() -> VerificationSession {
        let store = ScanStore::new();
        let mut session = VerificationSession::new(EXPECTED_ID, "Nguyen Van A", None);
        session.begin(&store).unwrap();
        session
    }

    #[test]
    fn full_attendance_flow() {
        let mut session = started_session();
        assert_eq!(session.state(), SessionState::AwaitingCard);

        // A scan for somebody else does not move this session.
        assert!(!session.observe_scan(&event("999999999999")));
        assert_eq!(session.state(), SessionState::AwaitingCard);

        assert!(session.observe_scan(&event(EXPECTED_ID)));
        assert_eq!(session.state(), SessionState::CardReceived);
        assert!(session.cccd_verified());

        session.begin_capture(Path::new("face_1.jpg")).unwrap();
        session.begin_verification().unwrap();
        session.record_comparison(&match_result(0.81)).unwrap();

        assert_eq!(session.state(), SessionState::Verified);
        assert!(session.face_verified());
        session.confirm().unwrap();
    }

    #[test]
    fn stale_record_is_adopted_at_begin() {
        let store = ScanStore::new();
        store.put(record(EXPECTED_ID));

        let mut session = VerificationSession::new(EXPECTED_ID, "Nguyen Van A", None);
        session.begin(&store).unwrap();

        assert_eq!(session.state(), SessionState::CardReceived);
        assert!(session.cccd_verified());
        assert!(session.scan_image_path().is_some());
    }

    #[test]
    fn confirm_before_verified_fails_with_not_verified() {
        let session = started_session();
        match session.confirm() {
            Err(VerifyError::NotVerified(state)) => {
                assert_eq!(state, SessionState::AwaitingCard)
            }
            other => panic!("expected NotVerified, got {other:?}"),
        }
    }

    #[test]
    fn capture_requires_card_first() {
        let mut session = started_session();
        match session.begin_capture(Path::new("face.jpg")) {
            Err(VerifyError::InvalidTransition { from, .. }) => {
                assert_eq!(from, SessionState::AwaitingCard)
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
    }

    #[test]
    fn rejection_allows_unlimited_retries() {
        let mut session = started_session();
        session.observe_scan(&event(EXPECTED_ID));

        for _ in 0..3 {
            session.begin_capture(Path::new("face.jpg")).unwrap();
            session.begin_verification().unwrap();
            session.record_comparison(&mismatch_result()).unwrap();
            assert_eq!(session.state(), SessionState::Rejected);
            assert!(session.confirm().is_err());
        }

        session.begin_capture(Path::new("face.jpg")).unwrap();
        session.begin_verification().unwrap();
        session.record_comparison(&match_result(0.6)).unwrap();
        assert_eq!(session.state(), SessionState::Verified);
        session.confirm().unwrap();
    }

    #[test]
    fn mismatched_event_can_satisfy_a_different_session() {
        let mut first = started_session();
        let mut second = {
            let store = ScanStore::new();
            let mut session = VerificationSession::new("999999999999", "Tran Thi B", None);
            session.begin(&store).unwrap();
            session
        };

        let scan = event("999999999999");
        assert!(!first.observe_scan(&scan));
        assert!(second.observe_scan(&scan));
        assert_eq!(first.state(), SessionState::AwaitingCard);
        assert_eq!(second.state(), SessionState::CardReceived);
    }

    #[test]
    fn no_scan_yet_is_card_not_received() {
        let store = ScanStore::new();
        let session = started_session();
        match session.reference_scan(&store) {
            Err(VerifyError::CardNotReceived(id)) => assert_eq!(id, EXPECTED_ID),
            other => panic!("expected CardNotReceived, got {other:?}"),
        }
    }

    #[test]
    fn foreign_record_is_identity_mismatch() {
        let session = started_session();
        match session.ensure_expected_identity(&record("999999999999")) {
            Err(VerifyError::IdentityMismatch { expected, scanned }) => {
                assert_eq!(expected, EXPECTED_ID);
                assert_eq!(scanned, "999999999999");
            }
            other => panic!("expected IdentityMismatch, got {other:?}"),
        }
    }

    #[test]
    fn comparison_result_is_only_accepted_while_verifying() {
        let mut session = started_session();
        session.observe_scan(&event(EXPECTED_ID));
        assert!(session.record_comparison(&match_result(0.9)).is_err());
        assert_eq!(session.state(), SessionState::CardReceived);
        assert!(!session.face_verified());
    }
}
