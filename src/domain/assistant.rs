use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Metadata;

/// A named binding of a registered graph plus default configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assistant {
    pub assistant_id: Uuid,
    pub graph_id: String,
    #[serde(default)]
    pub config: Metadata,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Assistant {
    /// System assistants get a stable id derived from their graph id, so
    /// clients can address them across restarts.
    pub fn system(graph_id: impl Into<String>) -> Self {
        let graph_id = graph_id.into();
        Self {
            assistant_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, graph_id.as_bytes()),
            graph_id,
            config: Metadata::new(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_assistant_id_is_stable() {
        let a = Assistant::system("echo");
        let b = Assistant::system("echo");
        assert_eq!(a.assistant_id, b.assistant_id);
        assert_ne!(a.assistant_id, Assistant::system("other").assistant_id);
    }
}
