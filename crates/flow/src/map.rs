use chrono::Utc;
use outreach_core::{OutreachError, OutreachResult};
use tracing::info;
use uuid::Uuid;

use crate::defaults::default_graph;
use crate::types::{ConversationMap, FlowGraph, MapStatus};

impl ConversationMap {
    /// Creates an unpublished map whose draft is the default template.
    pub fn new(brand_id: &str, campaign_id: &str, experiment_id: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            brand_id: brand_id.to_string(),
            campaign_id: campaign_id.to_string(),
            experiment_id: experiment_id.to_string(),
            name: name.to_string(),
            status: MapStatus::Draft,
            draft_graph: default_graph(),
            published_graph: None,
            published_revision: 0,
            published_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replaces the draft. The published graph is never touched.
    pub fn update_draft(&mut self, graph: FlowGraph) -> OutreachResult<()> {
        self.ensure_editable()?;
        self.draft_graph = graph;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Retires the map; later draft edits and publishes are refused.
    pub fn archive(&mut self) {
        self.status = MapStatus::Archived;
        self.updated_at = Utc::now();
    }

    pub fn is_published(&self) -> bool {
        self.published_revision > 0 && self.published_graph.is_some()
    }

    fn ensure_editable(&self) -> OutreachResult<()> {
        if self.status == MapStatus::Archived {
            return Err(OutreachError::MapArchived { map_id: self.id });
        }
        Ok(())
    }
}

/// Promotes the draft to the published graph and bumps the revision by one.
pub fn publish_map(map: &ConversationMap) -> OutreachResult<ConversationMap> {
    map.ensure_editable()?;

    let now = Utc::now();
    let mut published = map.clone();
    published.published_graph = Some(map.draft_graph.clone());
    published.published_revision = map.published_revision + 1;
    published.published_at = Some(now);
    published.status = MapStatus::Published;
    published.updated_at = now;

    info!(
        map_id = %published.id,
        experiment_id = %published.experiment_id,
        revision = published.published_revision,
        "Conversation map published"
    );

    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::normalize_graph;
    use serde_json::json;

    fn edited_graph() -> FlowGraph {
        normalize_graph(&json!({
            "maxDepth": 2,
            "startNodeId": "a",
            "nodes": [{ "id": "a", "kind": "message", "body": "Edited" }],
            "edges": []
        }))
    }

    #[test]
    fn test_new_map_starts_with_default_draft() {
        let map = ConversationMap::new("b", "c", "e", "Variant A");
        assert_eq!(map.draft_graph, default_graph());
        assert_eq!(map.published_revision, 0);
        assert!(!map.is_published());
        assert_eq!(map.status, MapStatus::Draft);
    }

    #[test]
    fn test_publish_twice_bumps_revision_by_two() {
        let mut map = ConversationMap::new("b", "c", "e", "Variant A");
        map.update_draft(edited_graph()).unwrap();
        let draft = map.draft_graph.clone();
        let start = map.published_revision;

        let once = publish_map(&map).unwrap();
        let twice = publish_map(&once).unwrap();

        assert_eq!(twice.published_revision, start + 2);
        assert_eq!(twice.draft_graph, draft);
        assert_eq!(once.draft_graph, draft);
        assert_eq!(twice.published_graph.as_ref(), Some(&draft));
        assert_eq!(twice.status, MapStatus::Published);
        assert!(twice.published_at.is_some());
    }

    #[test]
    fn test_draft_edit_leaves_published_graph() {
        let map = ConversationMap::new("b", "c", "e", "Variant A");
        let mut published = publish_map(&map).unwrap();
        published.update_draft(edited_graph()).unwrap();

        assert_eq!(published.published_graph, Some(default_graph()));
        assert_eq!(published.draft_graph, edited_graph());
        assert_eq!(published.published_revision, 1);
    }

    #[test]
    fn test_archived_map_is_read_only() {
        let mut map = ConversationMap::new("b", "c", "e", "Variant A");
        map.archive();
        assert!(map.update_draft(edited_graph()).is_err());
        let err = publish_map(&map).unwrap_err();
        assert_eq!(err.kind(), outreach_core::ErrorKind::MapArchived);
    }
}
