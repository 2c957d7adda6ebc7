use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Response header carrying the identifier of a freshly created worker.
pub const WORKER_ID_HEADER: &str = "x-worker-id";

/// Realm announced in `WWW-Authenticate` challenges.
pub const BASIC_REALM: &str = "worker_threads_nodes";

/// The only bundle-upload compression value a node accepts today. Other
/// values are advertised for future codecs and refused rather than guessed.
pub const COMPRESSION_NONE: &str = "none";

/// Body of `GET /`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    pub name: String,
    pub node_version: String,
}

/// Body of `GET /health`: running-worker count plus per-core utilization in
/// `[0, 1]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub workers_running: usize,
    pub cpu_usage: Vec<f32>,
}

/// Body of `POST /bundles/create`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBundleRequest {
    pub hash: String,
}

/// Body of `GET /bundles/{hash}`. `created` is unix milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleDescription {
    pub hash: String,
    pub size: u64,
    pub created: u64,
}

/// Body of `POST /worker`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkerRequest {
    pub bundle_hash: String,
    #[serde(default)]
    pub extra_data: SpawnOptions,
    #[serde(default)]
    pub exit_on_request_end: bool,
}

/// Spawn-options blob forwarded opaquely to the child host.
///
/// Recognized keys mirror the child host's spawn surface; anything else is
/// preserved verbatim in `extra` so newer hosts keep working against older
/// clients.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argv: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_argv: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_list: Option<serde_json::Value>,
    #[serde(default)]
    pub stdin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Resource limits forwarded to the child host.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_old_generation_size_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_young_generation_size_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_range_size_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_size_mb: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_options_use_camel_case_and_keep_unknown_keys() {
        let raw = serde_json::json!({
            "argv": ["--flag"],
            "execArgv": ["--max-old-space-size=128"],
            "workerData": {"job": 7},
            "stdin": true,
            "resourceLimits": {"maxOldGenerationSizeMb": 256.0},
            "someFutureKey": "kept",
        });

        let options: SpawnOptions = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(options.exec_argv.as_deref(), Some(&["--max-old-space-size=128".to_string()][..]));
        assert!(options.stdin);
        assert_eq!(
            options
                .resource_limits
                .as_ref()
                .and_then(|limits| limits.max_old_generation_size_mb),
            Some(256.0)
        );
        assert_eq!(
            options.extra.get("someFutureKey"),
            Some(&serde_json::Value::String("kept".to_string()))
        );

        let back = serde_json::to_value(&options).unwrap();
        assert_eq!(back["execArgv"], raw["execArgv"]);
        assert_eq!(back["someFutureKey"], raw["someFutureKey"]);
    }

    #[test]
    fn create_worker_request_wire_shape() {
        let request = CreateWorkerRequest {
            bundle_hash: "abc".to_string(),
            extra_data: SpawnOptions::default(),
            exit_on_request_end: true,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["bundleHash"], "abc");
        assert_eq!(value["exitOnRequestEnd"], true);
        assert!(value["extraData"].is_object());
    }

    #[test]
    fn health_report_wire_shape() {
        let report: HealthReport =
            serde_json::from_str(r#"{"workersRunning":2,"cpuUsage":[0.25,0.75]}"#).unwrap();
        assert_eq!(report.workers_running, 2);
        assert_eq!(report.cpu_usage, vec![0.25, 0.75]);
    }
}
