//! Status & error-code catalog.
//!
//! Every externally visible failure maps to one cataloged error with a stable
//! numeric code, and every code maps to exactly one HTTP status. The payload
//! envelope and the code to status table are part of the public API surface and
//! must stay stable across releases.

use std::collections::HashMap;

use http::StatusCode;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// The header key carried in the status payload envelope.
pub const HEADER_KEY: &str = "status";

lazy_static! {
    /// The process-wide status catalog.
    pub static ref CATALOG: Catalog = Catalog::new();
}

/// The name & numeric code of one cataloged status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusBase {
    pub name: &'static str,
    pub code: i32,
}

/// The full set of cataloged statuses.
#[derive(Clone, Copy, Debug)]
pub struct StatusCodes {
    pub ok: StatusBase,
    pub err_del_app_ps: StatusBase,
    pub err_del_app_ts: StatusBase,
    pub err_get_app_ps: StatusBase,
    pub err_get_app_ts: StatusBase,
    pub err_save_app_ps: StatusBase,
    pub err_save_app_ts: StatusBase,
    pub err_set_settings_ps: StatusBase,
    pub err_del_app_settings_ps: StatusBase,
    pub err_app_not_deployed: StatusBase,
    pub err_app_not_found_ts: StatusBase,
    pub err_marshal_resp: StatusBase,
    pub err_read_req: StatusBase,
    pub err_unmarshal_pld: StatusBase,
    pub err_src_mb_same: StatusBase,
    pub err_invalid_ext: StatusBase,
    pub err_get_vb_seqs: StatusBase,
    pub err_app_deployed: StatusBase,
    pub err_app_not_init: StatusBase,
    pub err_app_not_undeployed: StatusBase,
    pub err_statuses_not_found: StatusBase,
    pub err_connect_ns_server: StatusBase,
    pub err_bucket_type_check: StatusBase,
    pub err_memcached_bucket: StatusBase,
    pub err_handler_compile: StatusBase,
    pub err_rbac_creds: StatusBase,
    pub err_app_name_mismatch: StatusBase,
    pub err_src_bucket_missing: StatusBase,
    pub err_meta_bucket_missing: StatusBase,
    pub err_no_eventing_nodes: StatusBase,
    pub err_save_config: StatusBase,
    pub err_get_config: StatusBase,
    pub err_get_reb_status: StatusBase,
    pub err_reb_ongoing: StatusBase,
    pub err_active_eventing_nodes: StatusBase,
    pub err_invalid_config: StatusBase,
    pub err_app_code_size: StatusBase,
    pub err_get_creds: StatusBase,
}

/// The status payload envelope served to clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusPayload {
    pub header_key: String,
    pub version: i32,
    pub revision: i32,
    pub errors: Vec<ErrorPayload>,
}

/// One cataloged error as carried in the payload envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub name: String,
    pub code: i32,
    pub description: String,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub runtime_info: String,
}

/// Runtime info returned on successful mutating requests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub code: i32,
    pub info: String,
}

/// The status catalog: codes, error payloads & HTTP dispositions.
pub struct Catalog {
    pub codes: StatusCodes,
    errors: HashMap<i32, ErrorPayload>,
    payload: StatusPayload,
}

impl Catalog {
    fn new() -> Self {
        let codes = StatusCodes {
            ok: StatusBase { name: "OK", code: 0 },
            err_del_app_ps: StatusBase { name: "ERR_DEL_APP_PS", code: 1 },
            err_del_app_ts: StatusBase { name: "ERR_DEL_APP_TS", code: 2 },
            err_get_app_ps: StatusBase { name: "ERR_GET_APP_PS", code: 3 },
            err_get_app_ts: StatusBase { name: "ERR_GET_APP_TS", code: 4 },
            err_save_app_ps: StatusBase { name: "ERR_SAVE_APP_PS", code: 5 },
            err_save_app_ts: StatusBase { name: "ERR_SAVE_APP_TS", code: 6 },
            err_set_settings_ps: StatusBase { name: "ERR_SET_SETTINGS_PS", code: 7 },
            err_del_app_settings_ps: StatusBase { name: "ERR_DEL_APP_SETTINGS_PS", code: 11 },
            err_app_not_deployed: StatusBase { name: "ERR_APP_NOT_DEPLOYED", code: 12 },
            err_app_not_found_ts: StatusBase { name: "ERR_APP_NOT_FOUND_TS", code: 13 },
            err_marshal_resp: StatusBase { name: "ERR_MARSHAL_RESP", code: 14 },
            err_read_req: StatusBase { name: "ERR_READ_REQ", code: 15 },
            err_unmarshal_pld: StatusBase { name: "ERR_UNMARSHAL_PLD", code: 16 },
            err_src_mb_same: StatusBase { name: "ERR_SRC_MB_SAME", code: 17 },
            err_invalid_ext: StatusBase { name: "ERR_INVALID_EXT", code: 18 },
            err_get_vb_seqs: StatusBase { name: "ERR_GET_VB_SEQS", code: 19 },
            err_app_deployed: StatusBase { name: "ERR_APP_ALREADY_DEPLOYED", code: 20 },
            err_app_not_init: StatusBase { name: "ERR_APP_NOT_BOOTSTRAPPED", code: 21 },
            err_app_not_undeployed: StatusBase { name: "ERR_APP_NOT_UNDEPLOYED", code: 22 },
            err_statuses_not_found: StatusBase { name: "ERR_PROCESSING_OR_DEPLOYMENT_STATUS_NOT_FOUND", code: 23 },
            err_connect_ns_server: StatusBase { name: "ERR_CONNECT_TO_NS_SERVER", code: 24 },
            err_bucket_type_check: StatusBase { name: "ERR_BUCKET_TYPE_CHECK", code: 25 },
            err_memcached_bucket: StatusBase { name: "ERR_SOURCE_BUCKET_MEMCACHED", code: 26 },
            err_handler_compile: StatusBase { name: "ERR_HANDLER_COMPILATION", code: 27 },
            err_rbac_creds: StatusBase { name: "ERR_RBAC_CREDS", code: 28 },
            err_app_name_mismatch: StatusBase { name: "ERR_APPNAME_MISMATCH", code: 29 },
            err_src_bucket_missing: StatusBase { name: "ERR_SRC_BUCKET_MISSING", code: 30 },
            err_meta_bucket_missing: StatusBase { name: "ERR_METADATA_BUCKET_MISSING", code: 31 },
            err_no_eventing_nodes: StatusBase { name: "ERR_NO_EVENTING_NODES_FOUND", code: 32 },
            err_save_config: StatusBase { name: "ERR_SAVE_CONFIG", code: 33 },
            err_get_config: StatusBase { name: "ERR_GET_CONFIG", code: 34 },
            err_get_reb_status: StatusBase { name: "ERR_GET_REBALANCE_STATUS", code: 35 },
            err_reb_ongoing: StatusBase { name: "ERR_REBALANCE_ONGOING", code: 36 },
            err_active_eventing_nodes: StatusBase { name: "ERR_FETCHING_ACTIVE_EVENTING_NODES", code: 37 },
            err_invalid_config: StatusBase { name: "ERR_INVALID_CONFIG", code: 38 },
            err_app_code_size: StatusBase { name: "ERR_APPCODE_SIZE", code: 39 },
            err_get_creds: StatusBase { name: "ERR_GET_CREDS", code: 40 },
        };

        let describe = |base: &StatusBase, description: &str, attributes: &[&str]| ErrorPayload {
            name: base.name.into(),
            code: base.code,
            description: description.into(),
            attributes: attributes.iter().map(|attr| attr.to_string()).collect(),
            runtime_info: String::new(),
        };
        let errors = vec![
            describe(&codes.err_del_app_ps, "Unable to delete application from primary store", &[]),
            describe(&codes.err_del_app_ts, "Unable to delete application from temporary store", &[]),
            describe(&codes.err_get_app_ps, "Unable to get application from primary store", &["retry"]),
            describe(&codes.err_get_app_ts, "Unable to get application from temporary store", &["retry"]),
            describe(&codes.err_save_app_ps, "Unable to save application to primary store", &[]),
            describe(&codes.err_save_app_ts, "Unable to save application to temporary store", &["retry"]),
            describe(&codes.err_set_settings_ps, "Unable to set application settings in primary store", &[]),
            describe(&codes.err_del_app_settings_ps, "Unable to delete app settings", &[]),
            describe(&codes.err_app_not_deployed, "Application not deployed", &[]),
            describe(&codes.err_app_not_found_ts, "Application not found in temporary store", &[]),
            describe(&codes.err_marshal_resp, "Unable to marshal response", &[]),
            describe(&codes.err_read_req, "Unable to read the request body", &[]),
            describe(&codes.err_unmarshal_pld, "Unable to unmarshal payload", &[]),
            describe(&codes.err_src_mb_same, "Source bucket same as metadata bucket", &[]),
            describe(&codes.err_invalid_ext, "Invalid file extension", &[]),
            describe(&codes.err_get_vb_seqs, "Failed to fetch vb sequence processed so far", &[]),
            describe(&codes.err_app_deployed, "App is already deployed", &[]),
            describe(&codes.err_app_not_init, "App hasn't bootstrapped", &[]),
            describe(&codes.err_app_not_undeployed, "App hasn't been undeployed", &[]),
            describe(&codes.err_statuses_not_found, "Processing or deployment status or both missing from supplied settings", &[]),
            describe(&codes.err_connect_ns_server, "Failed to connect to cluster manager", &[]),
            describe(&codes.err_bucket_type_check, "Failed to check type of source bucket", &[]),
            describe(&codes.err_memcached_bucket, "Source bucket can't be of type memcached", &[]),
            describe(&codes.err_handler_compile, "Handler compilation failed", &[]),
            describe(&codes.err_rbac_creds, "RBAC username/password missing", &[]),
            describe(&codes.err_app_name_mismatch, "Function names must be same", &[]),
            describe(&codes.err_src_bucket_missing, "Source bucket missing", &[]),
            describe(&codes.err_meta_bucket_missing, "Metadata bucket missing", &[]),
            describe(&codes.err_no_eventing_nodes, "No eventing reported from cluster manager", &[]),
            describe(&codes.err_save_config, "Failed to save config to metadata store", &[]),
            describe(&codes.err_get_config, "Failed to get config from metadata store", &[]),
            describe(&codes.err_get_reb_status, "Failed to get rebalance status from eventing nodes", &[]),
            describe(
                &codes.err_reb_ongoing,
                "Rebalance ongoing on some/all Eventing nodes, creating new apps or changing settings for existing apps isn't allowed",
                &[],
            ),
            describe(&codes.err_active_eventing_nodes, "Failed to fetch active Eventing nodes", &[]),
            describe(&codes.err_invalid_config, "Invalid configuration", &[]),
            describe(&codes.err_app_code_size, "Handler Code size is more than 128k", &[]),
            describe(&codes.err_get_creds, "Failed to get credentials from cluster auth", &[]),
        ];

        let payload = StatusPayload {
            header_key: HEADER_KEY.into(),
            version: 1,
            revision: 1,
            errors: errors.clone(),
        };
        let errors = errors.into_iter().map(|err| (err.code, err)).collect();
        Self { codes, errors, payload }
    }

    /// The HTTP status corresponding to the given cataloged code.
    pub fn disposition(&self, code: i32) -> StatusCode {
        let codes = &self.codes;
        match code {
            _ if code == codes.ok.code => StatusCode::OK,
            _ if code == codes.err_del_app_ps.code => StatusCode::INTERNAL_SERVER_ERROR,
            _ if code == codes.err_del_app_ts.code => StatusCode::INTERNAL_SERVER_ERROR,
            _ if code == codes.err_save_app_ps.code => StatusCode::INTERNAL_SERVER_ERROR,
            _ if code == codes.err_save_app_ts.code => StatusCode::INTERNAL_SERVER_ERROR,
            _ if code == codes.err_set_settings_ps.code => StatusCode::INTERNAL_SERVER_ERROR,
            _ if code == codes.err_del_app_settings_ps.code => StatusCode::INTERNAL_SERVER_ERROR,
            _ if code == codes.err_app_not_deployed.code => StatusCode::NOT_ACCEPTABLE,
            _ if code == codes.err_app_not_found_ts.code => StatusCode::NOT_FOUND,
            _ if code == codes.err_marshal_resp.code => StatusCode::INTERNAL_SERVER_ERROR,
            _ if code == codes.err_read_req.code => StatusCode::BAD_REQUEST,
            _ if code == codes.err_unmarshal_pld.code => StatusCode::BAD_REQUEST,
            _ if code == codes.err_src_mb_same.code => StatusCode::UNPROCESSABLE_ENTITY,
            _ if code == codes.err_invalid_ext.code => StatusCode::BAD_REQUEST,
            _ if code == codes.err_get_vb_seqs.code => StatusCode::INTERNAL_SERVER_ERROR,
            _ if code == codes.err_app_deployed.code => StatusCode::UNPROCESSABLE_ENTITY,
            _ if code == codes.err_app_not_init.code => StatusCode::LOCKED,
            _ if code == codes.err_app_not_undeployed.code => StatusCode::UNPROCESSABLE_ENTITY,
            _ if code == codes.err_statuses_not_found.code => StatusCode::BAD_REQUEST,
            _ if code == codes.err_connect_ns_server.code => StatusCode::INTERNAL_SERVER_ERROR,
            _ if code == codes.err_bucket_type_check.code => StatusCode::UNPROCESSABLE_ENTITY,
            _ if code == codes.err_memcached_bucket.code => StatusCode::UNPROCESSABLE_ENTITY,
            _ if code == codes.err_handler_compile.code => StatusCode::UNPROCESSABLE_ENTITY,
            _ if code == codes.err_app_name_mismatch.code => StatusCode::UNPROCESSABLE_ENTITY,
            _ if code == codes.err_src_bucket_missing.code => StatusCode::GONE,
            _ if code == codes.err_meta_bucket_missing.code => StatusCode::GONE,
            _ if code == codes.err_no_eventing_nodes.code => StatusCode::BAD_REQUEST,
            _ if code == codes.err_save_config.code => StatusCode::INTERNAL_SERVER_ERROR,
            _ if code == codes.err_get_config.code => StatusCode::INTERNAL_SERVER_ERROR,
            _ if code == codes.err_get_reb_status.code => StatusCode::INTERNAL_SERVER_ERROR,
            _ if code == codes.err_reb_ongoing.code => StatusCode::NOT_ACCEPTABLE,
            _ if code == codes.err_invalid_config.code => StatusCode::BAD_REQUEST,
            _ if code == codes.err_app_code_size.code => StatusCode::BAD_REQUEST,
            _ => {
                tracing::warn!(code, "unknown status code");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The cataloged error payload for the given code, if any.
    pub fn error_payload(&self, code: i32) -> Option<&ErrorPayload> {
        self.errors.get(&code)
    }

    /// The full status payload envelope.
    pub fn status_payload(&self) -> &StatusPayload {
        &self.payload
    }
}
