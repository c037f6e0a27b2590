use std::{
    collections::{BTreeMap, HashSet},
    fmt,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Core domain enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    /// Completed and aborted sessions are never retained by the store.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareManifest {
    pub version: String,
    #[serde(default)]
    pub slot: String,
    #[serde(default, alias = "buildDate")]
    pub build_date: String,
    pub components: Vec<ComponentDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub name: String,
    #[serde(default)]
    pub file: String,
    /// Target flash address, e.g. `0x08020000`.
    pub address: String,
    /// Expected total bytes for the component.
    pub size: u64,
    /// Whole-component digest. Carried for the device; chunks are verified
    /// individually and the assembled image is never checked against it.
    #[serde(default)]
    pub sha256: String,
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub status: SessionStatus,
    pub manifest: FirmwareManifest,
    /// Epoch millis.
    pub created_at: u64,
    pub components: BTreeMap<String, ComponentProgress>,
}

impl Session {
    /// Seeds one zero-progress entry per manifest component.
    pub fn new(session_id: impl Into<String>, manifest: FirmwareManifest, created_at: u64) -> Self {
        let components = manifest
            .components
            .iter()
            .map(|component| {
                (
                    component.name.clone(),
                    ComponentProgress::seeded(component.size),
                )
            })
            .collect();
        Self {
            session_id: session_id.into(),
            status: SessionStatus::Active,
            manifest,
            created_at,
            components,
        }
    }

    pub fn stored_bytes(&self) -> u64 {
        self.components
            .values()
            .flat_map(|component| component.chunks.values())
            .map(|chunk| chunk.data.len() as u64)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentProgress {
    /// Zero until the first chunk arrives, then fixed.
    pub total_chunks: u32,
    pub received_chunks: u32,
    pub total_size: u64,
    pub received_size: u64,
    pub chunks: BTreeMap<u32, ChunkRecord>,
}

impl ComponentProgress {
    pub fn seeded(total_size: u64) -> Self {
        Self {
            total_chunks: 0,
            received_chunks: 0,
            total_size,
            received_size: 0,
            chunks: BTreeMap::new(),
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        f64::from(self.received_chunks) / f64::from(self.total_chunks) * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.total_chunks > 0 && self.received_chunks == self.total_chunks
    }

    /// Sum of `chunk_size` over every stored chunk.
    pub fn recompute_received_size(&mut self) {
        self.received_size = self.chunks.values().map(|chunk| chunk.chunk_size).sum();
    }

    pub fn received_indices(&self) -> Vec<u32> {
        self.chunks.keys().copied().collect()
    }

    /// Indices not yet stored. Empty while `total_chunks` is still unknown.
    pub fn missing_indices(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|index| !self.chunks.contains_key(index))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    #[serde(with = "base64_payload")]
    pub data: Vec<u8>,
    /// Digest recomputed at ingestion time.
    pub checksum: String,
    pub target_address: String,
    pub chunk_size: u64,
    pub chunk_offset: u64,
}

// ---------------------------------------------------------------------------
// Chunk upload metadata
// ---------------------------------------------------------------------------

/// Metadata as it arrives from a caller; every field may be absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub session_id: Option<String>,
    pub component_name: Option<String>,
    pub chunk_index: Option<u32>,
    pub total_chunks: Option<u32>,
    pub target_address: Option<String>,
    pub chunk_size: Option<u64>,
    pub chunk_offset: Option<u64>,
    pub checksum: Option<String>,
}

/// Metadata with every required field present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub session_id: String,
    pub component_name: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub target_address: String,
    pub chunk_size: u64,
    pub chunk_offset: u64,
    pub checksum: String,
}

impl ChunkDescriptor {
    /// `total_chunks` must be positive and `chunk_index` below it. Checked
    /// after the session lookup so a chunk for an unknown session still
    /// reports the missing session.
    pub fn check_index_range(&self) -> Result<(), ValidationError> {
        if self.total_chunks == 0 {
            return Err(ValidationError::InvalidRange("total_chunks"));
        }
        if self.chunk_index >= self.total_chunks {
            return Err(ValidationError::InvalidRange("chunk_index"));
        }
        Ok(())
    }
}

impl ChunkMetadata {
    pub fn validate(self) -> Result<ChunkDescriptor, ValidationError> {
        let session_id = non_empty(self.session_id, "session_id")?;
        let component_name = self
            .component_name
            .ok_or(ValidationError::MissingField("component_name"))?;
        let chunk_index = self
            .chunk_index
            .ok_or(ValidationError::MissingField("chunk_index"))?;
        let total_chunks = self
            .total_chunks
            .ok_or(ValidationError::MissingField("total_chunks"))?;
        let target_address = non_empty(self.target_address, "target_address")?;
        let chunk_size = self
            .chunk_size
            .ok_or(ValidationError::MissingField("chunk_size"))?;
        let chunk_offset = self
            .chunk_offset
            .ok_or(ValidationError::MissingField("chunk_offset"))?;
        let checksum = non_empty(self.checksum, "checksum")?;

        Ok(ChunkDescriptor {
            session_id,
            component_name,
            chunk_index,
            total_chunks,
            target_address,
            chunk_size,
            chunk_offset,
            checksum,
        })
    }
}

fn non_empty(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ValidationError::MissingField(field)),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("value out of range: {0}")]
    InvalidRange(&'static str),
    #[error("duplicate component in manifest: {0}")]
    DuplicateComponent(String),
    #[error("invalid encoding: {0}")]
    InvalidEncoding(&'static str),
}

pub fn validate_session_id(session_id: &str) -> Result<(), ValidationError> {
    if session_id.trim().is_empty() {
        return Err(ValidationError::MissingField("session_id"));
    }
    Ok(())
}

pub fn validate_manifest(manifest: &FirmwareManifest) -> Result<(), ValidationError> {
    if manifest.version.trim().is_empty() {
        return Err(ValidationError::MissingField("version"));
    }
    let mut seen = HashSet::new();
    for component in &manifest.components {
        if component.name.trim().is_empty() {
            return Err(ValidationError::MissingField("components[].name"));
        }
        if !seen.insert(component.name.as_str()) {
            return Err(ValidationError::DuplicateComponent(component.name.clone()));
        }
    }
    Ok(())
}

/// Accepts `0x` followed by one or more hex digits.
pub fn is_valid_target_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit()))
}

// ---------------------------------------------------------------------------
// Integrity
// ---------------------------------------------------------------------------

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Exact comparison against the lowercase digest; no case folding or trimming.
pub fn checksum_matches(declared: &str, computed: &str) -> bool {
    declared == computed
}

pub mod base64_payload {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn encode(data: &[u8]) -> String {
        BASE64_STANDARD.encode(data)
    }

    pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64_STANDARD.decode(text)
    }

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        decode(&text).map_err(D::Error::custom)
    }
}

/// Helper to create a manifest from `(name, size)` pairs with sequential
/// flash addresses.
pub fn manifest_builder(version: &str, components: &[(&str, u64)]) -> FirmwareManifest {
    let mut address = 0x0800_0000_u64;
    let components = components
        .iter()
        .map(|(name, size)| {
            let descriptor = ComponentDescriptor {
                name: (*name).to_string(),
                file: format!("{name}.bin"),
                address: format!("0x{address:08X}"),
                size: *size,
                sha256: String::new(),
            };
            address += size;
            descriptor
        })
        .collect();
    FirmwareManifest {
        version: version.to_string(),
        slot: "A".to_string(),
        build_date: "2024-01-01".to_string(),
        components,
    }
}
