//! Mapping between engine/session types and protocol messages.

use cosheet_config::Role;
use cosheet_engine::{CellKind, CellUpdate, ChangeSet, Value};
use cosheet_protocol::{
    self as protocol, CellPayload, CellValue, ChangeSetMessage, DocumentStateMessage,
    ErrorMessage, EventsDroppedMessage, PresenceEntry, PresenceUpdateMessage, ServerMessage,
};

use super::coordinator::{CoordinatorError, JoinOutcome};
use super::events::OutboundEvent;
use super::sessions::Presence;

pub fn cell_value(value: &Value) -> CellValue {
    match value {
        Value::Empty => CellValue::Empty,
        Value::Number(n) => CellValue::Number(*n),
        Value::Text(s) => CellValue::Text(s.clone()),
        Value::Boolean(b) => CellValue::Boolean(*b),
        Value::Date(_) => CellValue::Date(value.display()),
        Value::Error(e) => CellValue::Error(e.code().to_string()),
    }
}

pub fn cell_kind(kind: CellKind) -> protocol::CellKind {
    match kind {
        CellKind::Empty => protocol::CellKind::Empty,
        CellKind::String => protocol::CellKind::String,
        CellKind::Number => protocol::CellKind::Number,
        CellKind::Boolean => protocol::CellKind::Boolean,
        CellKind::Date => protocol::CellKind::Date,
        CellKind::Formula => protocol::CellKind::Formula,
    }
}

pub fn role(role: Role) -> protocol::Role {
    match role {
        Role::Editor => protocol::Role::Editor,
        Role::Viewer => protocol::Role::Viewer,
    }
}

pub fn cell_payload(update: &CellUpdate) -> CellPayload {
    CellPayload {
        row: update.coord.row,
        col: update.coord.col,
        raw_input: update.raw_input.clone(),
        kind: cell_kind(update.kind),
        value: cell_value(&update.value),
        display: update.value.display(),
        version: update.version,
    }
}

fn presence_entries(presence: &[Presence]) -> Vec<PresenceEntry> {
    presence
        .iter()
        .map(|p| PresenceEntry {
            session_id: p.session_id.clone(),
            user_id: p.user_id.clone(),
        })
        .collect()
}

pub fn document_state(id: String, outcome: &JoinOutcome) -> DocumentStateMessage {
    let snapshot = &outcome.snapshot;
    DocumentStateMessage {
        id,
        document_id: snapshot.document_id.clone(),
        version: snapshot.version,
        rows: snapshot.extent.rows,
        cols: snapshot.extent.cols,
        cells: snapshot.cells.iter().map(cell_payload).collect(),
        presence: presence_entries(&outcome.presence),
    }
}

pub fn change_set(change: &ChangeSet) -> ServerMessage {
    ServerMessage::ChangeSet(ChangeSetMessage {
        document_id: change.document_id.clone(),
        version: change.version,
        rows: change.extent.rows,
        cols: change.extent.cols,
        cells: change.cells.iter().map(cell_payload).collect(),
    })
}

pub fn error(id: Option<String>, document_id: Option<&str>, error: &CoordinatorError) -> ServerMessage {
    ServerMessage::Error(ErrorMessage {
        id,
        document_id: document_id.map(str::to_string),
        code: error.code().to_string(),
        message: error.to_string(),
    })
}

pub fn events_dropped(count: u64) -> ServerMessage {
    ServerMessage::EventsDropped(EventsDroppedMessage {
        dropped_count: count,
    })
}

pub fn outbound(event: &OutboundEvent) -> ServerMessage {
    match event {
        OutboundEvent::ChangeSet(change) => change_set(change),
        OutboundEvent::Presence {
            document_id,
            version,
            presence,
        } => ServerMessage::PresenceUpdate(PresenceUpdateMessage {
            document_id: document_id.clone(),
            version: *version,
            presence: presence_entries(presence),
        }),
        OutboundEvent::Rejected { document_id, error: e } => error(None, Some(document_id), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use cosheet_engine::{Coord, ErrorKind, Extent};
    use std::sync::Arc;

    #[test]
    fn test_value_mapping() {
        assert_eq!(cell_value(&Value::Error(ErrorKind::DivZero)), CellValue::Error("div0".into()));
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(cell_value(&Value::Date(date)), CellValue::Date("2024-03-01".into()));
        assert_eq!(cell_value(&Value::Empty), CellValue::Empty);
    }

    #[test]
    fn test_change_set_payload() {
        let change = ChangeSet {
            document_id: "doc".into(),
            version: 3,
            extent: Extent::new(50, 20),
            cells: vec![CellUpdate {
                coord: Coord::new(0, 1),
                raw_input: "=A1/3".into(),
                kind: CellKind::Formula,
                value: Value::Number(1.0 / 3.0),
                version: 3,
            }],
        };
        let msg = outbound(&OutboundEvent::ChangeSet(Arc::new(change)));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "change_set");
        assert_eq!(json["cells"][0]["display"], "0.3333333333");
        assert_eq!(json["cells"][0]["kind"], "formula");
        assert_eq!(json["rows"], 50);
    }

    #[test]
    fn test_rejection_carries_document() {
        let msg = outbound(&OutboundEvent::Rejected {
            document_id: "doc".into(),
            error: CoordinatorError::ReadOnly,
        });
        assert_eq!(msg.document_id(), Some("doc"));
        match msg {
            ServerMessage::Error(e) => assert_eq!(e.code, "read_only"),
            other => panic!("expected error, got {:?}", other),
        }
    }
}
