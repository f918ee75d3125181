use crate::service::{AttendanceService, ServiceError};
use presence_core::{EventKind, IdentityPatch, NewIdentity};
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.presence.Attendance1";
pub const OBJECT_PATH: &str = "/org/presence/Attendance1";

/// Errors returned over the bus, named `org.presence.Attendance1.Error.<Variant>`.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.presence.Attendance1.Error")]
pub enum DbusError {
    #[zbus(error)]
    ZBus(zbus::Error),
    DuplicateIdentity(String),
    NoFaceDetected(String),
    NoMatch(String),
    NotFound(String),
    InvalidArgument(String),
    Extraction(String),
    Timeout(String),
    EngineUnavailable(String),
    Storage(String),
}

impl From<ServiceError> for DbusError {
    fn from(e: ServiceError) -> Self {
        if e.is_expected() {
            tracing::info!(error = %e, "request rejected");
        } else {
            tracing::error!(error = %e, "request failed");
        }
        let msg = e.to_string();
        match e {
            ServiceError::DuplicateIdentity(_) => DbusError::DuplicateIdentity(msg),
            ServiceError::NoFaceDetected => DbusError::NoFaceDetected(msg),
            ServiceError::NoMatch => DbusError::NoMatch(msg),
            ServiceError::NotFound(_) => DbusError::NotFound(msg),
            ServiceError::InvalidArgument(_) => DbusError::InvalidArgument(msg),
            ServiceError::Extraction(_) => DbusError::Extraction(msg),
            ServiceError::Timeout(_) => DbusError::Timeout(msg),
            ServiceError::EngineUnavailable => DbusError::EngineUnavailable(msg),
            ServiceError::Storage(_) => DbusError::Storage(msg),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DbusError> {
    serde_json::to_string(value).map_err(|e| DbusError::Storage(format!("serialize: {e}")))
}

/// Empty strings on the wire mean "leave unchanged".
fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.presence.Attendance1
/// Object path: /org/presence/Attendance1
///
/// Every method answers with a JSON document; identity JSON never carries
/// the embedding.
pub struct PresenceInterface {
    service: Arc<AttendanceService>,
}

impl PresenceInterface {
    pub fn new(service: Arc<AttendanceService>) -> Self {
        Self { service }
    }
}

#[interface(name = "org.presence.Attendance1")]
impl PresenceInterface {
    /// Enroll a new identity from a photo.
    async fn enroll(
        &self,
        name: &str,
        email: &str,
        role: &str,
        department: &str,
        image: Vec<u8>,
    ) -> Result<String, DbusError> {
        tracing::info!(email, bytes = image.len(), "enroll requested");
        let identity = self
            .service
            .enroll(NewIdentity::new(name, email, role, department), image)
            .await?;
        to_json(&identity.summary())
    }

    /// Identify the person in the photo and mark attendance.
    ///
    /// `kind` is `IN` or `OUT`.
    async fn recognize(&self, kind: &str, image: Vec<u8>) -> Result<String, DbusError> {
        tracing::info!(kind, bytes = image.len(), "recognize requested");
        let kind: EventKind = kind
            .parse()
            .map_err(|e| DbusError::from(ServiceError::InvalidArgument(format!("{e}"))))?;
        let r = self.service.recognize(kind, image).await?;
        to_json(&serde_json::json!({
            "message": format!("Successfully marked {} for {}", r.event.kind, r.identity.display_name),
            "identity": r.identity.summary(),
            "event": r.event,
            "distance": r.distance,
        }))
    }

    /// Attendance events, newest first.
    async fn list_attendance(&self, offset: u32, limit: u32) -> Result<String, DbusError> {
        to_json(&self.service.list_attendance(offset, limit).await?)
    }

    /// Remove an identity and its attendance history.
    async fn delete_identity(&self, id: &str) -> Result<String, DbusError> {
        tracing::info!(id, "delete requested");
        let events_removed = self.service.delete_identity(id).await?;
        to_json(&serde_json::json!({ "id": id, "events_removed": events_removed }))
    }

    async fn list_identities(&self, offset: u32, limit: u32) -> Result<String, DbusError> {
        let identities = self.service.list_identities(offset, limit).await?;
        let summaries: Vec<_> = identities.iter().map(|i| i.summary()).collect();
        to_json(&summaries)
    }

    /// Change an identity's name, role or department.
    async fn update_identity(
        &self,
        id: &str,
        name: &str,
        role: &str,
        department: &str,
    ) -> Result<String, DbusError> {
        tracing::info!(id, "update requested");
        let patch = IdentityPatch {
            display_name: non_empty(name),
            role: non_empty(role),
            department: non_empty(department),
        };
        to_json(&self.service.update_identity(id, patch).await?.summary())
    }

    async fn stats(&self) -> Result<String, DbusError> {
        to_json(&self.service.stats().await?)
    }

    /// Return daemon status information.
    async fn status(&self) -> Result<String, DbusError> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model_version": self.service.model_version(),
            "models_loaded": true,
        })
        .to_string())
    }
}
