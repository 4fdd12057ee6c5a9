//! Request/response DTOs for the driver's external client surface (§6).
//!
//! These are the types an out-of-process façade (e.g. the excluded
//! websocket layer) would serialize over its own transport; this crate only
//! defines and handles them in-process, keeping the wire DTOs separate from
//! whatever transport ends up carrying them.

use serde::{Deserialize, Serialize};

pub type RequestId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub total: u32,
    pub current: u32,
    pub msg: String,
    pub msg_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DriverRequest {
    GetCredential {
        reqid: RequestId,
        service: String,
        login: Option<String>,
        fallback_service: Option<String>,
    },
    SetCredential {
        reqid: RequestId,
        service: String,
        login: String,
        password: String,
        description: Option<String>,
        set_description: bool,
    },
    GetDataNode {
        reqid: RequestId,
        service: String,
        fallback_service: Option<String>,
    },
    SetDataNode {
        reqid: RequestId,
        service: String,
        data: Vec<u8>,
    },
    DeleteCredentials {
        reqid: RequestId,
        services: Vec<String>,
    },
    DeleteData {
        reqid: RequestId,
        services: Vec<String>,
    },
    StartMmm {
        reqid: RequestId,
        want_data: bool,
    },
    ExitMmm {
        reqid: RequestId,
        commit: bool,
    },
    Export {
        reqid: RequestId,
        encryption_name: String,
    },
    Import {
        reqid: RequestId,
        file_bytes: Vec<u8>,
        no_delete: bool,
    },
    IntegrityCheck {
        reqid: RequestId,
    },
    Lock {
        reqid: RequestId,
    },
    ResetCard {
        reqid: RequestId,
    },
    GetRandom {
        reqid: RequestId,
        count: usize,
    },
    Cancel {
        reqid: RequestId,
    },
}

impl DriverRequest {
    pub fn reqid(&self) -> &str {
        match self {
            DriverRequest::GetCredential { reqid, .. }
            | DriverRequest::SetCredential { reqid, .. }
            | DriverRequest::GetDataNode { reqid, .. }
            | DriverRequest::SetDataNode { reqid, .. }
            | DriverRequest::DeleteCredentials { reqid, .. }
            | DriverRequest::DeleteData { reqid, .. }
            | DriverRequest::StartMmm { reqid, .. }
            | DriverRequest::ExitMmm { reqid, .. }
            | DriverRequest::Export { reqid, .. }
            | DriverRequest::Import { reqid, .. }
            | DriverRequest::IntegrityCheck { reqid }
            | DriverRequest::Lock { reqid }
            | DriverRequest::ResetCard { reqid }
            | DriverRequest::GetRandom { reqid, .. }
            | DriverRequest::Cancel { reqid } => reqid,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ErrorKind {
    TransportLost,
    Timeout,
    DeviceRejected { command: u8 },
    ProtocolViolation { detail: String },
    InvariantViolation { detail: String },
    Cancelled,
    ImportMalformed { detail: String },
    CryptoFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DriverResponse {
    Credential {
        service: String,
        login: String,
        password: String,
        description: String,
    },
    DataNode {
        service: String,
        data: Vec<u8>,
    },
    FileBytes {
        data: Vec<u8>,
    },
    IntegrityReport {
        free_blocks: u32,
        total_blocks: u32,
    },
    RandomBytes {
        data: Vec<u8>,
    },
    Ack,
    Error {
        reqid: RequestId,
        kind: ErrorKind,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_reqid_is_extracted_uniformly() {
        let req = DriverRequest::Lock {
            reqid: "abc".into(),
        };
        assert_eq!(req.reqid(), "abc");
    }

    #[test]
    fn response_round_trips_through_json() {
        let resp = DriverResponse::IntegrityReport {
            free_blocks: 3,
            total_blocks: 10,
        };
        let encoded = serde_json::to_string(&resp).unwrap();
        let decoded: DriverResponse = serde_json::from_str(&encoded).unwrap();
        assert!(matches!(decoded, DriverResponse::IntegrityReport { free_blocks: 3, total_blocks: 10 }));
    }
}
