//! External state verification used by recovery.
//!
//! Before a stuck saga is resumed, recovery asks the owning service what
//! actually happened to the resource the saga last touched.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

/// A downstream resource a saga holds an id for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    Payment(String),
    Reservation(String),
    Shipment(String),
}

impl Resource {
    pub fn id(&self) -> &str {
        match self {
            Resource::Payment(id) | Resource::Reservation(id) | Resource::Shipment(id) => id,
        }
    }

    fn path(&self) -> String {
        match self {
            Resource::Payment(id) => format!("/api/payments/{id}"),
            Resource::Reservation(id) => format!("/api/inventory/reservations/{id}"),
            Resource::Shipment(id) => format!("/api/shipments/{id}"),
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Payment(id) => write!(f, "payment {id}"),
            Resource::Reservation(id) => write!(f, "reservation {id}"),
            Resource::Shipment(id) => write!(f, "shipment {id}"),
        }
    }
}

/// What the owning service reports for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStatus {
    Confirmed,
    Pending,
    Failed,
    /// The service could not be reached or answered something unrecognised.
    Unknown,
}

impl VerificationStatus {
    /// Maps a service's status string.
    pub fn from_remote(status: &str) -> Self {
        match status.to_ascii_uppercase().as_str() {
            "COMPLETED" | "RESERVED" | "SCHEDULED" | "CONFIRMED" => VerificationStatus::Confirmed,
            "PROCESSING" | "PENDING" => VerificationStatus::Pending,
            "FAILED" | "DECLINED" | "CANCELLED" => VerificationStatus::Failed,
            _ => VerificationStatus::Unknown,
        }
    }

    /// Returns true if recovery must compensate instead of resuming.
    pub fn requires_compensation(&self) -> bool {
        matches!(
            self,
            VerificationStatus::Failed | VerificationStatus::Unknown
        )
    }
}

/// Queries downstream services for the true state of a resource.
#[async_trait]
pub trait StateVerifier: Send + Sync {
    async fn verify(&self, resource: &Resource) -> VerificationStatus;
}

/// Verifier that trusts every resource. Used when no services are configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeConfirmed;

#[async_trait]
impl StateVerifier for AssumeConfirmed {
    async fn verify(&self, _resource: &Resource) -> VerificationStatus {
        VerificationStatus::Confirmed
    }
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

/// Base URLs of the services that own each resource kind.
#[derive(Debug, Clone)]
pub struct ServiceEndpoints {
    pub payment: String,
    pub inventory: String,
    pub shipping: String,
}

/// Verifier that calls each service's HTTP status endpoint.
#[derive(Debug, Clone)]
pub struct HttpStateVerifier {
    client: reqwest::Client,
    endpoints: ServiceEndpoints,
}

impl HttpStateVerifier {
    pub fn new(endpoints: ServiceEndpoints, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoints })
    }

    fn url(&self, resource: &Resource) -> String {
        let base = match resource {
            Resource::Payment(_) => &self.endpoints.payment,
            Resource::Reservation(_) => &self.endpoints.inventory,
            Resource::Shipment(_) => &self.endpoints.shipping,
        };
        format!("{}{}", base.trim_end_matches('/'), resource.path())
    }
}

#[async_trait]
impl StateVerifier for HttpStateVerifier {
    #[tracing::instrument(skip(self), fields(resource = %resource))]
    async fn verify(&self, resource: &Resource) -> VerificationStatus {
        let response = match self.client.get(self.url(resource)).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "state verification request failed");
                return VerificationStatus::Unknown;
            }
        };
        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "state verification returned error");
            return VerificationStatus::Unknown;
        }
        match response.json::<StatusBody>().await {
            Ok(body) => VerificationStatus::from_remote(&body.status),
            Err(e) => {
                tracing::warn!(error = %e, "state verification body unreadable");
                VerificationStatus::Unknown
            }
        }
    }
}
