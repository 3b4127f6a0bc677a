//! Tagged wire message enum. Replaces the "decode twice, re-read by type"
//! envelope pattern with a single `serde(tag = "type")` parse.

use crate::model::{ErrorCode, IndexFileEntry, Task};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Enroll {
        token: String,
        agent_name: String,
        agent_version: String,
    },
    EnrollAck {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        node_id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Hello {
        node_id: i64,
        token: String,
        agent_name: String,
        agent_version: String,
    },
    HelloAck {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        server: Option<String>,
    },
    Task {
        task: Task,
    },
    SyncStart {
        task_id: String,
    },
    IndexBegin {
        task_id: String,
        project_name: String,
        block_hash: String,
    },
    IndexFile {
        task_id: String,
        file: IndexFileEntry,
    },
    IndexEnd {
        task_id: String,
    },
    BlockRequest {
        task_id: String,
        path: String,
        index: u64,
    },
    BlockBatchRequest {
        task_id: String,
        path: String,
        indices: Vec<u64>,
    },
    BlockResponseBin {
        task_id: String,
        path: String,
        index: u64,
        hash: String,
        size: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TaskReport {
        task_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        logs: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        files: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        blocks: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
}

impl Message {
    /// The task this message belongs to, if any — used to drop stray frames
    /// for tasks that are no longer current (§4.3).
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Message::Enroll { .. }
            | Message::EnrollAck { .. }
            | Message::Hello { .. }
            | Message::HelloAck { .. } => None,
            Message::Task { task } => Some(&task.id),
            Message::SyncStart { task_id }
            | Message::IndexBegin { task_id, .. }
            | Message::IndexFile { task_id, .. }
            | Message::IndexEnd { task_id }
            | Message::BlockRequest { task_id, .. }
            | Message::BlockBatchRequest { task_id, .. }
            | Message::BlockResponseBin { task_id, .. }
            | Message::TaskReport { task_id, .. } => Some(task_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Enroll { .. } => "enroll",
            Message::EnrollAck { .. } => "enroll_ack",
            Message::Hello { .. } => "hello",
            Message::HelloAck { .. } => "hello_ack",
            Message::Task { .. } => "task",
            Message::SyncStart { .. } => "sync_start",
            Message::IndexBegin { .. } => "index_begin",
            Message::IndexFile { .. } => "index_file",
            Message::IndexEnd { .. } => "index_end",
            Message::BlockRequest { .. } => "block_request",
            Message::BlockBatchRequest { .. } => "block_batch_request",
            Message::BlockResponseBin { .. } => "block_response_bin",
            Message::TaskReport { .. } => "task_report",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_on_type_field() {
        let msg = Message::SyncStart {
            task_id: "t1".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "sync_start");
        assert_eq!(json["task_id"], "t1");
    }

    #[test]
    fn task_id_extraction_skips_handshake_messages() {
        let hello = Message::Hello {
            node_id: 1,
            token: "tok".into(),
            agent_name: "a".into(),
            agent_version: "1.0".into(),
        };
        assert_eq!(hello.task_id(), None);

        let req = Message::BlockRequest {
            task_id: "t9".into(),
            path: "a.txt".into(),
            index: 0,
        };
        assert_eq!(req.task_id(), Some("t9"));
    }
}
