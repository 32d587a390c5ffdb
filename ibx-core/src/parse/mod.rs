pub mod sqlite;

use crate::error::Result;
use crate::index::artifact::ArtifactKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Normalized record produced by an artifact parser.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique within (backup, artifact).
    pub key: String,
    /// Conversation or chat the record belongs to, when it has one.
    pub group_key: Option<String>,
    /// Manifest file ids of attachments referenced by the record.
    pub attachments: Vec<String>,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

pub type RecordStream = Box<dyn Iterator<Item = Result<Record>> + Send>;

/// Turns one decrypted source database into records. Each call reads from the start.
pub trait ArtifactParser: Send + Sync {
    fn kind(&self) -> ArtifactKind;
    fn parse(&self, source: &Path) -> Result<RecordStream>;
}

/// Fixed dispatch from artifact kind to parser.
#[derive(Clone)]
pub struct ParserTable {
    parsers: HashMap<ArtifactKind, Arc<dyn ArtifactParser>>,
}

impl ParserTable {
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        ArtifactKind::ALL
            .into_iter()
            .fold(Self::empty(), |t, kind| {
                t.with(Arc::new(sqlite::SqliteTableParser::for_kind(kind)))
            })
    }

    /// Registers `parser` for its kind, replacing any previous one.
    pub fn with(mut self, parser: Arc<dyn ArtifactParser>) -> Self {
        self.parsers.insert(parser.kind(), parser);
        self
    }

    pub fn get(&self, kind: ArtifactKind) -> Option<Arc<dyn ArtifactParser>> {
        self.parsers.get(&kind).cloned()
    }
}

impl Default for ParserTable {
    fn default() -> Self {
        Self::builtin()
    }
}
