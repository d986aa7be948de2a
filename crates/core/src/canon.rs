//! Canonical textual form and metadata hygiene shared by the edit and apply
//! paths.

use serde_json::Value as Json;

/// Metadata fields the server owns and an editor must never round-trip.
/// `resourceVersion` stays: it is the version token the next apply needs.
const SERVER_MANAGED_META: [&str; 5] =
    ["managedFields", "creationTimestamp", "generation", "uid", "ownerReferences"];

/// Strip server-managed, edit-irrelevant metadata plus the server-populated
/// `status` block in place.
pub fn strip_server_managed(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            for key in SERVER_MANAGED_META {
                obj.remove(key);
            }
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
}

/// Serialize to the canonical textual form used for diffing and no-op
/// detection. `serde_json::Value` keeps object keys sorted, so byte equality
/// of the output means structural equality of the documents.
pub fn canonical_yaml(v: &Json) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(v)
}

/// Version token recorded in an object payload, if any.
pub fn version_token(v: &Json) -> Option<&str> {
    v.get("metadata")?.get("resourceVersion")?.as_str()
}

/// Set the version token on an object payload, creating metadata if absent.
pub fn set_version_token(v: &mut Json, token: &str) {
    if let Some(obj) = v.as_object_mut() {
        let meta = obj
            .entry("metadata")
            .or_insert_with(|| Json::Object(serde_json::Map::new()));
        if let Some(m) = meta.as_object_mut() {
            m.insert("resourceVersion".into(), Json::String(token.to_string()));
        }
    }
}
