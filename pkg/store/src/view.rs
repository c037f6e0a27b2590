use schema::{Session, SessionStatus};
use serde::Serialize;

/// Per-component progress without chunk payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentStatusView {
    pub name: String,
    pub address: String,
    pub total_chunks: u32,
    pub received_chunks: u32,
    pub total_size: u64,
    pub received_size: u64,
    pub progress: f64,
    pub is_complete: bool,
    pub received_indices: Vec<u32>,
    pub missing_indices: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatusView {
    pub session_id: String,
    pub status: SessionStatus,
    pub version: String,
    pub slot: String,
    pub created_at: u64,
    /// In manifest order.
    pub components: Vec<ComponentStatusView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub version: String,
    pub created_at: u64,
    pub component_count: usize,
    pub stored_bytes: u64,
}

impl From<&Session> for SessionStatusView {
    fn from(session: &Session) -> Self {
        let components = session
            .manifest
            .components
            .iter()
            .filter_map(|descriptor| {
                let progress = session.components.get(&descriptor.name)?;
                Some(ComponentStatusView {
                    name: descriptor.name.clone(),
                    address: descriptor.address.clone(),
                    total_chunks: progress.total_chunks,
                    received_chunks: progress.received_chunks,
                    total_size: progress.total_size,
                    received_size: progress.received_size,
                    progress: progress.progress_percent(),
                    is_complete: progress.is_complete(),
                    received_indices: progress.received_indices(),
                    missing_indices: progress.missing_indices(),
                })
            })
            .collect();

        Self {
            session_id: session.session_id.clone(),
            status: session.status,
            version: session.manifest.version.clone(),
            slot: session.manifest.slot.clone(),
            created_at: session.created_at,
            components,
        }
    }
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            status: session.status,
            version: session.manifest.version.clone(),
            created_at: session.created_at,
            component_count: session.components.len(),
            stored_bytes: session.stored_bytes(),
        }
    }
}
