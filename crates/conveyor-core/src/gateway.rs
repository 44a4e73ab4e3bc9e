//! Contract toward the external file/conversion gateway.
//!
//! The core treats the gateway as opaque: step bodies fetch inbound
//! record batches, send outbound ones and acknowledge transfers through
//! this trait. Only the seam and an in-memory fake live here; the real
//! SFTP-backed implementation is an external collaborator.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::CoreError;

/// Descriptor of a transferable file held by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Gateway-assigned transfer reference.
    pub reference: String,
    pub name: String,
    pub record_count: u64,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait FileGateway: Send + Sync {
    /// Whether a file of this type is ready on the remote system.
    async fn is_available(&self, system: &str, file_type: &str) -> Result<bool, CoreError>;

    async fn metadata(&self, system: &str, file_type: &str)
        -> Result<Option<FileMetadata>, CoreError>;

    /// Fetch the records of the pending file as serialized lines.
    /// `record_type` names the layout the caller will decode them
    /// with (a [`conveyor_job::RecordSchema`] name, by convention).
    async fn fetch(
        &self,
        system: &str,
        file_type: &str,
        record_type: &str,
    ) -> Result<Vec<String>, CoreError>;

    /// Send records out; returns the gateway transfer reference.
    async fn send(
        &self,
        system: &str,
        file_type: &str,
        records: &[String],
    ) -> Result<String, CoreError>;

    async fn acknowledge(&self, reference: &str) -> Result<(), CoreError>;

    async fn report_error(&self, reference: &str, message: &str) -> Result<(), CoreError>;
}

#[derive(Default)]
struct MemoryGatewayState {
    inbound: HashMap<(String, String), Vec<String>>,
    outbound: HashMap<String, Vec<String>>,
    acknowledged: Vec<String>,
    errors: Vec<(String, String)>,
    next_reference: u64,
}

/// In-memory gateway fake for tests and local development.
#[derive(Default)]
pub struct MemoryFileGateway {
    state: RwLock<MemoryGatewayState>,
}

impl MemoryFileGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an inbound file for a `(system, type)` pair.
    pub async fn stage(&self, system: &str, file_type: &str, records: Vec<String>) {
        self.state
            .write()
            .await
            .inbound
            .insert((system.to_string(), file_type.to_string()), records);
    }

    pub async fn sent(&self, reference: &str) -> Option<Vec<String>> {
        self.state.read().await.outbound.get(reference).cloned()
    }

    pub async fn acknowledged(&self) -> Vec<String> {
        self.state.read().await.acknowledged.clone()
    }

    pub async fn reported_errors(&self) -> Vec<(String, String)> {
        self.state.read().await.errors.clone()
    }
}

#[async_trait]
impl FileGateway for MemoryFileGateway {
    async fn is_available(&self, system: &str, file_type: &str) -> Result<bool, CoreError> {
        let state = self.state.read().await;
        Ok(state
            .inbound
            .contains_key(&(system.to_string(), file_type.to_string())))
    }

    async fn metadata(
        &self,
        system: &str,
        file_type: &str,
    ) -> Result<Option<FileMetadata>, CoreError> {
        let state = self.state.read().await;
        Ok(state
            .inbound
            .get(&(system.to_string(), file_type.to_string()))
            .map(|records| FileMetadata {
                reference: format!("{system}/{file_type}"),
                name: format!("{file_type}.dat"),
                record_count: records.len() as u64,
                size_bytes: records.iter().map(|r| r.len() as u64 + 1).sum(),
                created_at: Utc::now(),
            }))
    }

    async fn fetch(
        &self,
        system: &str,
        file_type: &str,
        _record_type: &str,
    ) -> Result<Vec<String>, CoreError> {
        let state = self.state.read().await;
        state
            .inbound
            .get(&(system.to_string(), file_type.to_string()))
            .cloned()
            .ok_or_else(|| {
                CoreError::Storage(format!("no pending file for {system}/{file_type}"))
            })
    }

    async fn send(
        &self,
        system: &str,
        file_type: &str,
        records: &[String],
    ) -> Result<String, CoreError> {
        let mut state = self.state.write().await;
        state.next_reference += 1;
        let reference = format!("{system}-{file_type}-{}", state.next_reference);
        state.outbound.insert(reference.clone(), records.to_vec());
        Ok(reference)
    }

    async fn acknowledge(&self, reference: &str) -> Result<(), CoreError> {
        self.state
            .write()
            .await
            .acknowledged
            .push(reference.to_string());
        Ok(())
    }

    async fn report_error(&self, reference: &str, message: &str) -> Result<(), CoreError> {
        self.state
            .write()
            .await
            .errors
            .push((reference.to_string(), message.to_string()));
        Ok(())
    }
}
