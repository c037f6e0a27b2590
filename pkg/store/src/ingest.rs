use schema::{
    ChunkDescriptor, ChunkMetadata, ChunkRecord, ComponentProgress, SessionStatus,
    checksum_matches, is_valid_target_address, sha256_hex,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{CompletenessPolicy, SessionStore, StoreError};

/// Outcome of one accepted chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkReceipt {
    pub session_id: String,
    pub component_name: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// `received_chunks / total_chunks * 100`, unrounded.
    pub component_progress: f64,
    pub received_size: u64,
    pub total_size: u64,
    pub is_component_complete: bool,
    /// The index had been stored before and was replaced.
    pub overwritten: bool,
}

/// Advisory finding from the post-completion layout check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletenessIssue {
    #[error("chunk {chunk_index} offset mismatch: expected {expected}, got {actual}")]
    OffsetMismatch {
        chunk_index: u32,
        expected: u64,
        actual: u64,
    },
    #[error("component size mismatch: expected {expected}, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// Walks stored chunks in index order checking that offsets are contiguous
/// and that the received size equals the manifest size.
pub fn verify_completeness(component: &ComponentProgress) -> Vec<CompletenessIssue> {
    let mut issues = Vec::new();
    let mut expected_offset = 0u64;
    for (&chunk_index, chunk) in &component.chunks {
        if chunk.chunk_offset != expected_offset {
            issues.push(CompletenessIssue::OffsetMismatch {
                chunk_index,
                expected: expected_offset,
                actual: chunk.chunk_offset,
            });
        }
        expected_offset = expected_offset.saturating_add(chunk.chunk_size);
    }
    if component.received_size != component.total_size {
        issues.push(CompletenessIssue::SizeMismatch {
            expected: component.total_size,
            actual: component.received_size,
        });
    }
    issues
}

impl SessionStore {
    /// Validates and stores one chunk, then persists before returning.
    ///
    /// Checks run in a fixed order and the first failure wins: required
    /// fields, payload size, session existence, session status, component
    /// membership, index range, checksum, target address. Validation and
    /// apply happen under the session lock, so concurrent uploads to the same component
    /// never lose an increment.
    pub fn upload_chunk(
        &self,
        metadata: ChunkMetadata,
        payload: &[u8],
    ) -> Result<ChunkReceipt, StoreError> {
        self.ensure_initialized();
        let chunk = metadata.validate()?;

        let actual = payload.len() as u64;
        if actual != chunk.chunk_size {
            return Err(StoreError::SizeMismatch {
                expected: chunk.chunk_size,
                actual,
            });
        }

        let computed = sha256_hex(payload);

        let not_found = || {
            warn!(
                session_id = %chunk.session_id,
                "chunk for unknown session; the server may have restarted or the session expired"
            );
            StoreError::SessionNotFound(chunk.session_id.clone())
        };
        let entry = self.entry(&chunk.session_id).ok_or_else(not_found)?;

        let (receipt, issues) = {
            let mut session = entry.lock();
            if entry.is_retired() {
                return Err(not_found());
            }
            if session.status != SessionStatus::Active {
                return Err(StoreError::SessionNotActive {
                    session_id: chunk.session_id.clone(),
                    status: session.status,
                });
            }
            let component = session
                .components
                .get_mut(&chunk.component_name)
                .ok_or_else(|| StoreError::ComponentNotFound {
                    session_id: chunk.session_id.clone(),
                    component_name: chunk.component_name.clone(),
                })?;
            chunk.check_index_range()?;
            if !checksum_matches(&chunk.checksum, &computed) {
                return Err(StoreError::ChecksumMismatch {
                    declared: chunk.checksum.clone(),
                    computed,
                });
            }
            if !is_valid_target_address(&chunk.target_address) {
                return Err(StoreError::InvalidAddress(chunk.target_address.clone()));
            }

            let overwritten = apply_chunk(component, &chunk, payload.to_vec(), computed)?;
            let is_component_complete = component.received_chunks == component.total_chunks;
            let issues = if is_component_complete {
                verify_completeness(component)
            } else {
                Vec::new()
            };
            let receipt = ChunkReceipt {
                session_id: chunk.session_id.clone(),
                component_name: chunk.component_name.clone(),
                chunk_index: chunk.chunk_index,
                total_chunks: component.total_chunks,
                component_progress: component.progress_percent(),
                received_size: component.received_size,
                total_size: component.total_size,
                is_component_complete,
                overwritten,
            };
            (receipt, issues)
        };

        self.mark_dirty();
        self.persist_after_mutation("upload_chunk")?;

        debug!(
            session_id = %receipt.session_id,
            component = %receipt.component_name,
            chunk_index = receipt.chunk_index,
            total_chunks = receipt.total_chunks,
            progress = receipt.component_progress,
            "chunk received"
        );

        if receipt.is_component_complete {
            info!(
                session_id = %receipt.session_id,
                component = %receipt.component_name,
                received_size = receipt.received_size,
                "component upload complete"
            );
            for issue in &issues {
                warn!(
                    session_id = %receipt.session_id,
                    component = %receipt.component_name,
                    %issue,
                    "component completeness check failed"
                );
            }
            if !issues.is_empty() && self.config().completeness == CompletenessPolicy::Strict {
                return Err(StoreError::IncompleteComponent {
                    component_name: receipt.component_name,
                    issues,
                });
            }
        }

        Ok(receipt)
    }
}

/// Returns whether an existing record at the same index was replaced.
fn apply_chunk(
    component: &mut ComponentProgress,
    chunk: &ChunkDescriptor,
    data: Vec<u8>,
    checksum: String,
) -> Result<bool, StoreError> {
    if component.total_chunks == 0 {
        component.total_chunks = chunk.total_chunks;
    } else if component.total_chunks != chunk.total_chunks {
        return Err(StoreError::TotalChunksMismatch {
            component_name: chunk.component_name.clone(),
            expected: component.total_chunks,
            actual: chunk.total_chunks,
        });
    }

    let record = ChunkRecord {
        data,
        checksum,
        target_address: chunk.target_address.clone(),
        chunk_size: chunk.chunk_size,
        chunk_offset: chunk.chunk_offset,
    };
    let overwritten = component.chunks.insert(chunk.chunk_index, record).is_some();
    if overwritten {
        warn!(
            session_id = %chunk.session_id,
            component = %chunk.component_name,
            chunk_index = chunk.chunk_index,
            "chunk already received, overwriting"
        );
    } else {
        component.received_chunks += 1;
    }
    component.recompute_received_size();
    Ok(overwritten)
}
