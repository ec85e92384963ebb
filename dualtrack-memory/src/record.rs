//! Memory record types and builders
//!
//! Core types for representing a unit of agent memory and its relations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::decay;
use crate::error::{MemoryError, Result};
use crate::temporal::TemporalMetadata;

/// Unique identifier for memory records
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    /// Create a new random MemoryId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Smallest possible id, used as the start of a key scan
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MemoryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Types of memories that can be stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Something that happened
    Episodic,
    /// How to do something
    Procedural,
    /// A fact about the world
    Semantic,
    /// Scratch context for the current task
    Working,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 4] = [
        MemoryKind::Episodic,
        MemoryKind::Procedural,
        MemoryKind::Semantic,
        MemoryKind::Working,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Episodic => "episodic",
            MemoryKind::Procedural => "procedural",
            MemoryKind::Semantic => "semantic",
            MemoryKind::Working => "working",
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryKind {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "episodic" => Ok(MemoryKind::Episodic),
            "procedural" => Ok(MemoryKind::Procedural),
            "semantic" => Ok(MemoryKind::Semantic),
            "working" => Ok(MemoryKind::Working),
            other => Err(MemoryError::validation(format!("unknown memory kind: {other}"))),
        }
    }
}

/// Where the authoritative copy of a record lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Only in the short-term store; not yet durable
    Stm,
    /// Only in the long-term store
    Ltm,
    /// Durable in LTM with a hot copy in STM
    Both,
}

impl Tier {
    /// Whether the long-term store holds the authoritative copy
    pub fn is_durable(&self) -> bool {
        !matches!(self, Tier::Stm)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Stm => write!(f, "stm"),
            Tier::Ltm => write!(f, "ltm"),
            Tier::Both => write!(f, "both"),
        }
    }
}

/// Health of a record with respect to cross-backend consistency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    #[default]
    Active,
    /// Repair gave up; the STM copy is the only complete one
    Degraded,
}

/// Whether the forgetting sweep may delete a record from LTM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    #[default]
    Permanent,
    Transient,
}

/// Named relation between two memories
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationType(pub String);

impl RelationType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn similar_to() -> Self {
        Self::new("similar_to")
    }

    pub fn leads_to() -> Self {
        Self::new("leads_to")
    }

    pub fn part_of() -> Self {
        Self::new("part_of")
    }

    pub fn causes() -> Self {
        Self::new("causes")
    }

    pub fn temporal() -> Self {
        Self::new("temporal")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Directed, weighted edge from the owning record to `target`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub target: MemoryId,
    pub relation_type: RelationType,
    /// Strength of the association (0.0 to 1.0)
    pub weight: f32,
}

impl Relation {
    pub fn new(target: MemoryId, relation_type: RelationType, weight: f32) -> Self {
        Self {
            target,
            relation_type,
            weight,
        }
    }

    pub fn key(&self) -> RelationKey {
        RelationKey {
            target: self.target,
            relation_type: self.relation_type.clone(),
        }
    }
}

/// Identifies one out-edge of a record: at most one edge per target and type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationKey {
    pub target: MemoryId,
    pub relation_type: RelationType,
}

impl RelationKey {
    pub fn new(target: MemoryId, relation_type: RelationType) -> Self {
        Self {
            target,
            relation_type,
        }
    }
}

/// A single unit of agent memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier
    pub id: MemoryId,
    /// Text payload
    pub content: String,
    /// Embedding computed upstream
    pub embedding: Vec<f32>,
    pub kind: MemoryKind,
    /// Importance (1.0 to 10.0)
    pub importance: f32,
    /// Strength as of `temporal.strength_updated_at` (0.0 to 1.0)
    pub strength: f32,
    pub temporal: TemporalMetadata,
    pub tier: Tier,
    #[serde(default)]
    pub relations: Vec<Relation>,
    /// Opaque caller-supplied metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub status: MemoryStatus,
    #[serde(default)]
    pub retention: Retention,
}

impl MemoryRecord {
    /// Create a new builder for MemoryRecord
    pub fn builder() -> MemoryRecordBuilder {
        MemoryRecordBuilder::new()
    }

    /// Importance mapped from [1, 10] onto [0, 1]
    pub fn normalized_importance(&self) -> f32 {
        ((self.importance - 1.0) / 9.0).clamp(0.0, 1.0)
    }

    /// Strength decayed from its anchor to `now`; never mutates the record
    pub fn strength_at(&self, now: DateTime<Utc>, config: &MemoryConfig) -> f32 {
        decay::strength_at(self, now, &config.decay)
    }

    /// Check the record against configured limits
    pub fn validate(&self, config: &MemoryConfig) -> Result<()> {
        validate_content(&self.content, config)?;
        validate_embedding(&self.embedding, config)?;
        validate_importance(self.importance)?;
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(MemoryError::validation(format!(
                "strength {} outside [0, 1]",
                self.strength
            )));
        }
        validate_relations(self.id, &self.relations)
    }

    /// Append relations, replacing existing edges with the same target and type
    pub fn merge_relations(&mut self, relations: &[Relation]) {
        for rel in relations {
            match self
                .relations
                .iter_mut()
                .find(|r| r.target == rel.target && r.relation_type == rel.relation_type)
            {
                Some(existing) => existing.weight = rel.weight,
                None => self.relations.push(rel.clone()),
            }
        }
    }

    /// Drop the out-edges named by `keys`; returns how many were removed
    pub fn remove_relations(&mut self, keys: &[RelationKey]) -> usize {
        let before = self.relations.len();
        self.relations.retain(|r| !keys.contains(&r.key()));
        before - self.relations.len()
    }
}

pub(crate) fn validate_content(content: &str, config: &MemoryConfig) -> Result<()> {
    let chars = content.chars().count();
    if chars == 0 || content.trim().is_empty() {
        return Err(MemoryError::validation("content must not be empty"));
    }
    if chars > config.max_content_chars {
        return Err(MemoryError::validation(format!(
            "content length {} exceeds {} characters",
            chars, config.max_content_chars
        )));
    }
    Ok(())
}

pub(crate) fn validate_embedding(embedding: &[f32], config: &MemoryConfig) -> Result<()> {
    if embedding.len() != config.dimension {
        return Err(MemoryError::validation(format!(
            "embedding dimension {} does not match configured {}",
            embedding.len(),
            config.dimension
        )));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(MemoryError::validation("embedding contains non-finite values"));
    }
    Ok(())
}

pub(crate) fn validate_importance(importance: f32) -> Result<()> {
    if !importance.is_finite() || !(1.0..=10.0).contains(&importance) {
        return Err(MemoryError::validation(format!(
            "importance {importance} outside [1, 10]"
        )));
    }
    Ok(())
}

pub(crate) fn validate_relations(owner: MemoryId, relations: &[Relation]) -> Result<()> {
    for rel in relations {
        if rel.target == owner {
            return Err(MemoryError::validation(format!(
                "memory {owner} cannot relate to itself"
            )));
        }
        if !rel.weight.is_finite() || !(0.0..=1.0).contains(&rel.weight) {
            return Err(MemoryError::validation(format!(
                "relation weight {} outside [0, 1]",
                rel.weight
            )));
        }
        if rel.relation_type.0.trim().is_empty() {
            return Err(MemoryError::validation("relation type must not be empty"));
        }
    }
    Ok(())
}

/// Partial update applied by `update_memory`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryPatch {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub importance: Option<f32>,
    /// Entries merged into the existing metadata
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
    /// Replace metadata instead of merging
    #[serde(default)]
    pub replace_metadata: bool,
    #[serde(default)]
    pub add_relations: Vec<Relation>,
    /// Applied before `add_relations`
    #[serde(default)]
    pub remove_relations: Vec<RelationKey>,
    #[serde(default)]
    pub retention: Option<Retention>,
}

impl MemoryPatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.embedding.is_none()
            && self.importance.is_none()
            && self.metadata.is_none()
            && self.add_relations.is_empty()
            && self.remove_relations.is_empty()
            && self.retention.is_none()
    }

    /// Whether the patch changes anything the vector index stores
    pub fn touches_embedding(&self) -> bool {
        self.embedding.is_some()
    }

    /// Validate the patch on its own, before it is applied
    pub fn validate(&self, owner: MemoryId, config: &MemoryConfig) -> Result<()> {
        if let Some(content) = &self.content {
            validate_content(content, config)?;
        }
        if let Some(embedding) = &self.embedding {
            validate_embedding(embedding, config)?;
        }
        if let Some(importance) = self.importance {
            validate_importance(importance)?;
        }
        validate_relations(owner, &self.add_relations)
    }

    /// Apply to `record` in place
    pub fn apply(self, record: &mut MemoryRecord, now: DateTime<Utc>) {
        if let Some(content) = self.content {
            record.content = content;
        }
        if let Some(embedding) = self.embedding {
            record.embedding = embedding;
        }
        if let Some(importance) = self.importance {
            record.importance = importance;
        }
        if let Some(metadata) = self.metadata {
            if self.replace_metadata {
                record.metadata = metadata;
            } else {
                record.metadata.extend(metadata);
            }
        }
        if !self.remove_relations.is_empty() {
            record.remove_relations(&self.remove_relations);
        }
        if !self.add_relations.is_empty() {
            record.merge_relations(&self.add_relations);
        }
        if let Some(retention) = self.retention {
            record.retention = retention;
        }
        record.temporal.touch_updated(now);
    }
}

/// Builder for MemoryRecord with fluent API
#[derive(Debug, Default)]
pub struct MemoryRecordBuilder {
    id: Option<MemoryId>,
    content: Option<String>,
    embedding: Option<Vec<f32>>,
    kind: Option<MemoryKind>,
    importance: f32,
    created_at: Option<DateTime<Utc>>,
    relations: Vec<Relation>,
    metadata: BTreeMap<String, serde_json::Value>,
    retention: Retention,
}

impl MemoryRecordBuilder {
    pub fn new() -> Self {
        Self {
            importance: 5.0,
            ..Default::default()
        }
    }

    /// Set the memory ID (auto-generated if not set)
    pub fn id(mut self, id: MemoryId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn kind(mut self, kind: MemoryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn episodic(self) -> Self {
        self.kind(MemoryKind::Episodic)
    }

    pub fn procedural(self) -> Self {
        self.kind(MemoryKind::Procedural)
    }

    pub fn semantic(self) -> Self {
        self.kind(MemoryKind::Semantic)
    }

    pub fn working(self) -> Self {
        self.kind(MemoryKind::Working)
    }

    /// Set importance (validated later against [1, 10])
    pub fn importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    /// Backdate creation; defaults to now
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn relation(
        mut self,
        target: MemoryId,
        relation_type: RelationType,
        weight: f32,
    ) -> Self {
        self.relations.push(Relation::new(target, relation_type, weight));
        self
    }

    pub fn relations(mut self, relations: Vec<Relation>) -> Self {
        self.relations.extend(relations);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn metadata_map(mut self, metadata: BTreeMap<String, serde_json::Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// Allow the forgetting sweep to delete this record from LTM
    pub fn transient(self) -> Self {
        self.retention(Retention::Transient)
    }

    /// Build the MemoryRecord
    pub fn build(self) -> std::result::Result<MemoryRecord, MemoryRecordBuilderError> {
        let kind = self.kind.ok_or(MemoryRecordBuilderError::MissingKind)?;
        let content = self.content.ok_or(MemoryRecordBuilderError::MissingContent)?;
        let embedding = self
            .embedding
            .ok_or(MemoryRecordBuilderError::MissingEmbedding)?;
        let temporal = self
            .created_at
            .map(TemporalMetadata::new_at)
            .unwrap_or_else(TemporalMetadata::new_current);

        Ok(MemoryRecord {
            id: self.id.unwrap_or_default(),
            content,
            embedding,
            kind,
            importance: self.importance,
            strength: decay::initial_strength(self.importance),
            temporal,
            tier: Tier::Stm,
            relations: self.relations,
            metadata: self.metadata,
            status: MemoryStatus::Active,
            retention: self.retention,
        })
    }
}

/// Errors that can occur when building a MemoryRecord
#[derive(Debug, thiserror::Error)]
pub enum MemoryRecordBuilderError {
    #[error("Missing required field: kind")]
    MissingKind,
    #[error("Missing required field: content")]
    MissingContent,
    #[error("Missing required field: embedding")]
    MissingEmbedding,
}
