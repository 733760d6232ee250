//! Wire-level constants and the JSON bodies of the HTTP surface.
//!
//! | Endpoint             | Request                      | Response                                  |
//! |----------------------|------------------------------|-------------------------------------------|
//! | `GET /identity`      | (none)                       | `{app, status, device, id}`               |
//! | `POST /pair/request` | `{"requesterId": id}`        | `{"status":"accepted","peerId": id}` / rejected |
//! | `POST /pair/confirm` | `{"peerId": id}`             | `{"status":"confirmed"}`                  |

use serde::{Deserialize, Serialize};

/// Default application marker (identity probe `app` field, broadcast prefix).
pub const APP_MARKER: &str = "SWAPLINK";

/// UDP frame packet header size in bytes.
pub const HEADER_SIZE: usize = 12;

pub const IDENTITY_PATH: &str = "/identity";
pub const PAIR_REQUEST_PATH: &str = "/pair/request";
pub const PAIR_CONFIRM_PATH: &str = "/pair/confirm";
pub const STATUS_PATH: &str = "/status";

pub const STATUS_READY: &str = "ready";

/// Rejection reasons carried in [`PairResponse::reason`].
pub mod reasons {
    pub const ALREADY_PAIRED: &str = "already_paired";
    pub const TIE_BREAK: &str = "tie_break";
    pub const SHUTTING_DOWN: &str = "shutting_down";
}

// MARK: - IdentityInfo

/// Identity probe response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityInfo {
    pub app: String,
    pub status: String,
    pub device: String,
    pub id: String,
}

impl IdentityInfo {
    pub fn ready(marker: &str, device: &str, id: &str) -> Self {
        Self {
            app: marker.to_owned(),
            status: STATUS_READY.to_owned(),
            device: device.to_owned(),
            id: id.to_owned(),
        }
    }

    /// Whether this response comes from a ready node of our deployment.
    pub fn is_ready_for(&self, marker: &str) -> bool {
        self.app == marker && self.status == STATUS_READY && !self.id.is_empty()
    }
}

// MARK: - Pairing bodies

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRequest {
    #[serde(rename = "requesterId")]
    pub requester_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmRequest {
    #[serde(rename = "peerId")]
    pub peer_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairStatus {
    Accepted,
    Rejected,
    Confirmed,
}

/// Response to both `/pair/request` and `/pair/confirm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairResponse {
    pub status: PairStatus,
    #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PairResponse {
    pub fn accepted(peer_id: &str) -> Self {
        Self {
            status: PairStatus::Accepted,
            peer_id: Some(peer_id.to_owned()),
            reason: None,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self {
            status: PairStatus::Rejected,
            peer_id: None,
            reason: Some(reason.to_owned()),
        }
    }

    pub fn confirmed() -> Self {
        Self {
            status: PairStatus::Confirmed,
            peer_id: None,
            reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_request_uses_camel_case_key() {
        let json = serde_json::to_string(&PairRequest { requester_id: "id-a".into() }).unwrap();
        assert_eq!(json, r#"{"requesterId":"id-a"}"#);
    }

    #[test]
    fn responses_match_wire_shapes() {
        assert_eq!(
            serde_json::to_string(&PairResponse::accepted("id-b")).unwrap(),
            r#"{"status":"accepted","peerId":"id-b"}"#
        );
        assert_eq!(
            serde_json::to_string(&PairResponse::rejected(reasons::ALREADY_PAIRED)).unwrap(),
            r#"{"status":"rejected","reason":"already_paired"}"#
        );
        assert_eq!(
            serde_json::to_string(&PairResponse::confirmed()).unwrap(),
            r#"{"status":"confirmed"}"#
        );
    }

    #[test]
    fn identity_probe_checks_marker_and_status() {
        let info: IdentityInfo = serde_json::from_str(
            r#"{"app":"SWAPLINK","status":"ready","device":"kiosk-3","id":"id-c"}"#,
        )
        .unwrap();
        assert!(info.is_ready_for(APP_MARKER));
        assert!(!info.is_ready_for("OTHER"));

        let busy = IdentityInfo { status: "starting".into(), ..info };
        assert!(!busy.is_ready_for(APP_MARKER));
    }
}
