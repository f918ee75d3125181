//! Enrollment and recognition orchestration.
//!
//! Ties the engine thread, the store and the matcher together and maps every
//! failure onto [`ServiceError`]. Nothing is written until extraction has
//! succeeded, so a timed-out or cancelled request leaves no partial state.

use crate::engine::{EngineError, EngineHandle};
use chrono::Utc;
use presence_core::{
    AttendanceEvent, AttendanceRecord, CosineMatcher, EventKind, ExtractError, Identity,
    IdentityPatch, Matcher, NewIdentity, Stats,
};
use presence_store::{Store, StoreError};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Largest page the listing calls will return.
pub const MAX_PAGE: u32 = 1000;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("an identity with email {0:?} is already enrolled")]
    DuplicateIdentity(String),
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("face not recognized")]
    NoMatch,
    #[error("identity {0} not found")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("embedding extraction failed: {0}")]
    Extraction(String),
    #[error("embedding extraction timed out after {0:?}")]
    Timeout(Duration),
    #[error("extraction engine unavailable")]
    EngineUnavailable,
    #[error("storage error: {0}")]
    Storage(StoreError),
}

impl ServiceError {
    /// Outcomes a caller is expected to handle; everything else is a fault.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ServiceError::DuplicateIdentity(_)
                | ServiceError::NoFaceDetected
                | ServiceError::NoMatch
                | ServiceError::NotFound(_)
                | ServiceError::InvalidArgument(_)
        )
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateIdentity(email) => ServiceError::DuplicateIdentity(email),
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            StoreError::InvalidEmbedding(msg) => ServiceError::Extraction(msg),
            other => ServiceError::Storage(other),
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Extract(ExtractError::NoFaceDetected) => ServiceError::NoFaceDetected,
            EngineError::Extract(other) => ServiceError::Extraction(other.to_string()),
            EngineError::ChannelClosed => ServiceError::EngineUnavailable,
        }
    }
}

/// Result of a successful recognition.
#[derive(Debug, Clone)]
pub struct Recognition {
    pub identity: Identity,
    pub event: AttendanceEvent,
    pub distance: f64,
}

pub struct AttendanceService<M: Matcher = CosineMatcher> {
    store: Store,
    engine: EngineHandle,
    matcher: M,
    extract_timeout: Duration,
}

impl<M: Matcher> AttendanceService<M> {
    pub fn new(store: Store, engine: EngineHandle, matcher: M, extract_timeout: Duration) -> Self {
        Self {
            store,
            engine,
            matcher,
            extract_timeout,
        }
    }

    pub fn model_version(&self) -> &str {
        self.engine.model_version()
    }

    /// Enroll a new identity from a photo.
    pub async fn enroll(
        &self,
        new: NewIdentity,
        image: Vec<u8>,
    ) -> Result<Identity, ServiceError> {
        if new.display_name.is_empty() {
            return Err(ServiceError::InvalidArgument("name must not be empty".into()));
        }
        if !looks_like_email(&new.email) {
            return Err(ServiceError::InvalidArgument(format!(
                "invalid email {:?}",
                new.email
            )));
        }
        // Checked up front to skip a wasted extraction; the unique index
        // still decides races.
        if self.store.contains_email(&new.email).await? {
            return Err(ServiceError::DuplicateIdentity(new.email));
        }

        let embedding = self.extract(image).await?;
        let identity = self.store.insert_identity(new, embedding).await?;
        tracing::info!(id = %identity.id, email = %identity.email, "enrolled");
        Ok(identity)
    }

    /// Identify the person in the photo and record an attendance event.
    pub async fn recognize(
        &self,
        kind: EventKind,
        image: Vec<u8>,
    ) -> Result<Recognition, ServiceError> {
        let probe = self.extract(image).await?;
        let gallery = self.store.scan_all().await?;

        let (identity, distance) = match self.matcher.best_match(&probe, &gallery) {
            Some(m) => (m.identity.clone(), m.distance),
            None => {
                tracing::info!(gallery = gallery.len(), "no match");
                return Err(ServiceError::NoMatch);
            }
        };

        let event = self.record_with_retry(&identity.id, kind).await?;
        tracing::info!(
            id = %identity.id,
            name = %identity.display_name,
            %kind,
            distance,
            "attendance marked"
        );
        Ok(Recognition {
            identity,
            event,
            distance,
        })
    }

    pub async fn list_attendance(
        &self,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<AttendanceRecord>, ServiceError> {
        Ok(self
            .store
            .list_attendance(offset, limit.min(MAX_PAGE))
            .await?)
    }

    /// Delete an identity and all of its events. Returns the event count.
    pub async fn delete_identity(&self, id: &str) -> Result<usize, ServiceError> {
        Ok(self.store.remove_identity(id).await?)
    }

    pub async fn list_identities(
        &self,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Identity>, ServiceError> {
        Ok(self
            .store
            .list_identities(offset, limit.min(MAX_PAGE))
            .await?)
    }

    pub async fn update_identity(
        &self,
        id: &str,
        patch: IdentityPatch,
    ) -> Result<Identity, ServiceError> {
        if patch.display_name.as_deref() == Some("") {
            return Err(ServiceError::InvalidArgument("name must not be empty".into()));
        }
        if patch.is_empty() {
            return Ok(self.store.get_identity(id).await?);
        }
        Ok(self.store.update_identity(id, patch).await?)
    }

    pub async fn stats(&self) -> Result<Stats, ServiceError> {
        Ok(self.store.stats(Utc::now()).await?)
    }

    /// Number of enrolled identities whose embedding came from a different
    /// model than the one loaded. Those entries can never match.
    pub async fn check_gallery_model(&self) -> Result<usize, ServiceError> {
        let current = self.engine.model_version();
        let gallery = self.store.scan_all().await?;
        Ok(gallery
            .iter()
            .filter(|i| {
                i.embedding
                    .model_version
                    .as_deref()
                    .is_some_and(|v| v != current)
            })
            .count())
    }

    async fn extract(&self, image: Vec<u8>) -> Result<presence_core::Embedding, ServiceError> {
        if image.is_empty() {
            return Err(ServiceError::InvalidArgument("image is empty".into()));
        }
        match tokio::time::timeout(self.extract_timeout, self.engine.extract(image)).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!(timeout = ?self.extract_timeout, "extraction timed out");
                Err(ServiceError::Timeout(self.extract_timeout))
            }
        }
    }

    async fn record_with_retry(
        &self,
        identity_id: &str,
        kind: EventKind,
    ) -> Result<AttendanceEvent, ServiceError> {
        retry_once(|| self.store.record(identity_id, kind)).await
    }
}

/// Run a storage operation, repeating it once if it fails with SQLITE_BUSY or
/// SQLITE_LOCKED. A second failure is surfaced as is.
async fn retry_once<T, F, Fut>(mut op: F) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            tracing::warn!(error = %e, "transient storage error, retrying once");
            Ok(op().await?)
        }
        other => Ok(other?),
    }
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::engine::testing::ScriptedExtractor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Unit vectors at a chosen cosine distance from `alice`.
    fn alice() -> Vec<f32> {
        vec![1.0, 0.0, 0.0]
    }

    fn bob() -> Vec<f32> {
        vec![0.0, 1.0, 0.0]
    }

    fn at_distance(d: f32) -> Vec<f32> {
        let cos: f32 = 1.0 - d;
        vec![cos, (1.0 - cos * cos).sqrt(), 0.0]
    }

    async fn service(extractor: ScriptedExtractor, timeout: Duration) -> AttendanceService {
        let store = Store::open_in_memory().await.unwrap();
        let engine = spawn_engine(extractor, 4).unwrap();
        AttendanceService::new(store, engine, CosineMatcher::default(), timeout)
    }

    fn scripted() -> ScriptedExtractor {
        ScriptedExtractor::default()
            .with_face("alice.jpg", alice())
            .with_face("alice-again.jpg", at_distance(0.05))
            .with_face("bob.jpg", bob())
            .with_face("stranger.jpg", vec![0.0, 0.0, 1.0])
    }

    async fn default_service() -> AttendanceService {
        service(scripted(), Duration::from_secs(5)).await
    }

    fn person(name: &str, email: &str) -> NewIdentity {
        NewIdentity::new(name, email, "", "")
    }

    #[tokio::test]
    async fn test_enroll_then_recognize_same_identity() {
        let svc = default_service().await;
        let enrolled = svc
            .enroll(person("Alice", "alice@x.com"), b"alice.jpg".to_vec())
            .await
            .unwrap();
        assert_eq!(enrolled.role, "employee");
        assert_eq!(enrolled.department, "General");

        let r = svc
            .recognize(EventKind::Entry, b"alice.jpg".to_vec())
            .await
            .unwrap();
        assert_eq!(r.identity.id, enrolled.id);
        assert!(r.distance.abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_recognize_marks_one_entry_for_alice() {
        let svc = default_service().await;
        let alice = svc
            .enroll(person("Alice", "alice@x.com"), b"alice.jpg".to_vec())
            .await
            .unwrap();
        svc.enroll(person("Bob", "bob@x.com"), b"bob.jpg".to_vec())
            .await
            .unwrap();

        let r = svc
            .recognize(EventKind::Entry, b"alice-again.jpg".to_vec())
            .await
            .unwrap();
        assert_eq!(r.identity.id, alice.id);
        assert_eq!(r.event.identity_id, alice.id);
        assert_eq!(r.event.kind, EventKind::Entry);

        let log = svc.list_attendance(0, 100).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].event, r.event);
        assert_eq!(log[0].display_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_duplicate_checked_before_extraction() {
        let svc = default_service().await;
        svc.enroll(person("Alice", "alice@x.com"), b"alice.jpg".to_vec())
            .await
            .unwrap();
        // A photo that would fail extraction still reports the duplicate.
        let err = svc
            .enroll(person("Alice 2", "alice@x.com"), b"broken".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DuplicateIdentity(e) if e == "alice@x.com"));
    }

    #[tokio::test]
    async fn test_enroll_without_face_creates_nothing() {
        let svc = default_service().await;
        let err = svc
            .enroll(person("Alice", "alice@x.com"), b"noface".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoFaceDetected));
        assert!(svc.list_identities(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enroll_rejects_bad_metadata() {
        let svc = default_service().await;
        for (name, email) in [("", "a@x.com"), ("Alice", "not-an-email"), ("Alice", "a@b@c")] {
            let err = svc
                .enroll(person(name, email), b"alice.jpg".to_vec())
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::InvalidArgument(_)), "{name:?} {email:?}");
        }
    }

    #[tokio::test]
    async fn test_unknown_face_is_no_match() {
        let svc = default_service().await;
        svc.enroll(person("Alice", "alice@x.com"), b"alice.jpg".to_vec())
            .await
            .unwrap();
        let err = svc
            .recognize(EventKind::Entry, b"stranger.jpg".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoMatch));
        assert!(svc.list_attendance(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_gallery_is_no_match() {
        let svc = default_service().await;
        let err = svc
            .recognize(EventKind::Exit, b"alice.jpg".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoMatch));
    }

    #[tokio::test]
    async fn test_extraction_failures_never_become_no_match() {
        let svc = default_service().await;
        svc.enroll(person("Alice", "alice@x.com"), b"alice.jpg".to_vec())
            .await
            .unwrap();
        assert!(matches!(
            svc.recognize(EventKind::Entry, b"noface".to_vec()).await,
            Err(ServiceError::NoFaceDetected)
        ));
        assert!(matches!(
            svc.recognize(EventKind::Entry, b"broken".to_vec()).await,
            Err(ServiceError::Extraction(_))
        ));
        assert!(matches!(
            svc.recognize(EventKind::Entry, Vec::new()).await,
            Err(ServiceError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_extraction_timeout() {
        let svc = service(scripted(), Duration::from_millis(50)).await;
        let err = svc
            .enroll(person("Alice", "alice@x.com"), b"slow:alice.jpg".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Timeout(_)));
        assert!(!err.is_expected());
        assert!(svc.list_identities(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_identity_and_events() {
        let svc = default_service().await;
        let alice = svc
            .enroll(person("Alice", "alice@x.com"), b"alice.jpg".to_vec())
            .await
            .unwrap();
        svc.recognize(EventKind::Entry, b"alice.jpg".to_vec())
            .await
            .unwrap();
        svc.recognize(EventKind::Exit, b"alice.jpg".to_vec())
            .await
            .unwrap();

        assert_eq!(svc.delete_identity(&alice.id).await.unwrap(), 2);
        assert!(svc.list_attendance(0, 100).await.unwrap().is_empty());
        assert!(matches!(
            svc.recognize(EventKind::Entry, b"alice.jpg".to_vec()).await,
            Err(ServiceError::NoMatch)
        ));
        assert!(matches!(
            svc.delete_identity(&alice.id).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_identity() {
        let svc = default_service().await;
        let alice = svc
            .enroll(person("Alice", "alice@x.com"), b"alice.jpg".to_vec())
            .await
            .unwrap();

        let unchanged = svc
            .update_identity(&alice.id, IdentityPatch::default())
            .await
            .unwrap();
        assert_eq!(unchanged.display_name, "Alice");

        let patched = svc
            .update_identity(
                &alice.id,
                IdentityPatch {
                    department: Some("Research".into()),
                    ..IdentityPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(patched.department, "Research");
        assert_eq!(patched.display_name, "Alice");
        assert_eq!(patched.embedding, alice.embedding);

        assert!(matches!(
            svc.update_identity("missing", IdentityPatch::default()).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stats_and_model_check() {
        let svc = default_service().await;
        svc.enroll(person("Alice", "alice@x.com"), b"alice.jpg".to_vec())
            .await
            .unwrap();
        svc.recognize(EventKind::Entry, b"alice.jpg".to_vec())
            .await
            .unwrap();

        let stats = svc.stats().await.unwrap();
        assert_eq!(stats.total_identities, 1);
        assert_eq!(stats.events_today, 1);
        assert_eq!(svc.check_gallery_model().await.unwrap(), 0);
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            ServiceError::from(EngineError::Extract(ExtractError::NoFaceDetected)),
            ServiceError::NoFaceDetected
        ));
        assert!(matches!(
            ServiceError::from(EngineError::Extract(ExtractError::EmptyImage)),
            ServiceError::Extraction(_)
        ));
        assert!(matches!(
            ServiceError::from(EngineError::ChannelClosed),
            ServiceError::EngineUnavailable
        ));
        assert!(matches!(
            ServiceError::from(StoreError::NotFound("x".into())),
            ServiceError::NotFound(_)
        ));
        assert!(ServiceError::NoMatch.is_expected());
        assert!(!ServiceError::EngineUnavailable.is_expected());
    }

    fn busy() -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    #[tokio::test]
    async fn test_retry_once_recovers_from_busy() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let out = retry_once(|| async move {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Err(busy()),
                _ => Ok(7),
            }
        })
        .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_once_gives_up_after_second_busy() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let out: Result<(), _> = retry_once(|| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(busy())
        })
        .await;
        assert!(matches!(out, Err(ServiceError::Storage(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_once_skips_permanent_errors() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let out: Result<(), _> = retry_once(|| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::InvalidDbValue("bad row".into()))
        })
        .await;
        assert!(matches!(out, Err(ServiceError::Storage(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let out: Result<(), _> = retry_once(|| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::NotFound("gone".into()))
        })
        .await;
        assert!(matches!(out, Err(ServiceError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_email_shape() {
        assert!(looks_like_email("alice@example.com"));
        assert!(!looks_like_email("alice"));
        assert!(!looks_like_email("@example.com"));
        assert!(!looks_like_email("alice@"));
        assert!(!looks_like_email("al ice@example.com"));
    }
}
