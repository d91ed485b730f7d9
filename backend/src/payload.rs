use chaintrack::{EventId, MetricEvent, MetricKind};
use serde::{Deserialize, Serialize};

use crate::error::SubmitFailure;

pub const PAYLOAD_SCHEMA: &str = "chaintrack.metric/v1";

/// 归档到内容寻址存储的 JSON 载荷。
///
/// 只包含事件的不可变字段，字段顺序固定，因此同一事件每次序列化得到相同字节、相同内容标识。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivePayload {
    pub schema: String,
    pub event_id: EventId,
    pub metric: MetricKind,
    pub value: u64,
    pub created_at_ms: i64,
    pub page_views: u64,
    pub interactions: u64,
}

impl ArchivePayload {
    pub fn from_event(event: &MetricEvent) -> Self {
        let (page_views, interactions) = match event.kind {
            MetricKind::PageView => (event.value, 0),
            MetricKind::Interaction => (0, event.value),
        };
        Self {
            schema: PAYLOAD_SCHEMA.to_string(),
            event_id: event.id,
            metric: event.kind,
            value: event.value,
            created_at_ms: event.created_at.timestamp_millis(),
            page_views,
            interactions,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SubmitFailure> {
        serde_json::to_vec(self)
            .map_err(|error| SubmitFailure::Rejected(format!("payload encoding failed: {error}")))
    }
}
