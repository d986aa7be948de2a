//! mirra edit sessions.
//!
//! One live session per (namespace, kind, name) triple. Entering edit mode
//! fetches the freshest copy straight from the cluster (never the watch
//! cache), strips server-managed metadata, and keeps that snapshot for
//! diffing and the optimistic-concurrency token. Re-entering edit mode for
//! the same triple hands back the same session instead of forking a second
//! editable copy of one object.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value as Json;
use tracing::{debug, info};

use mirra_cluster::{ClusterApi, ClusterError};
use mirra_core::canon::{canonical_yaml, strip_server_managed};
use mirra_core::Classification;

/// Identity of one edited object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Triple {
    pub namespace: Option<String>,
    pub kind: String,
    pub name: String,
}

impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

struct SessionState {
    original_snapshot: Json,
    origin: Option<Classification>,
    is_new: bool,
    view_open: bool,
    edit_open: bool,
    /// Unsaved editor content exists; keeps a fully closed session alive.
    pending: bool,
}

/// One edit session. Cloneable through [`EditHandle`]; the id is stable for
/// the session's whole lifetime, so handle equality means session identity.
pub struct EditSession {
    id: uuid::Uuid,
    triple: Triple,
    state: Mutex<SessionState>,
}

pub type EditHandle = Arc<EditSession>;

impl EditSession {
    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn triple(&self) -> &Triple {
        &self.triple
    }

    pub fn is_new(&self) -> bool {
        self.state.lock().unwrap().is_new
    }

    pub fn origin(&self) -> Option<Classification> {
        self.state.lock().unwrap().origin
    }

    pub fn original_snapshot(&self) -> Json {
        self.state.lock().unwrap().original_snapshot.clone()
    }

    /// Canonical-form comparison against the stored snapshot. A payload that
    /// fails to serialize is conservatively treated as changed.
    pub fn has_pending_changes(&self, proposed: &Json) -> bool {
        let state = self.state.lock().unwrap();
        match (canonical_yaml(&state.original_snapshot), canonical_yaml(proposed)) {
            (Ok(a), Ok(b)) => a != b,
            _ => true,
        }
    }

    /// The only snapshot mutations: a successful apply or an explicit
    /// refresh. Applied objects come back with server fields; strip them the
    /// same way the edit entry path does.
    pub(crate) fn complete_apply(&self, mut applied: Json) {
        strip_server_managed(&mut applied);
        let mut state = self.state.lock().unwrap();
        state.original_snapshot = applied;
        state.is_new = false;
        state.pending = false;
    }

    fn mark_pending(&self, pending: bool) {
        self.state.lock().unwrap().pending = pending;
    }
}

/// Skeleton snapshot for an object that does not exist yet.
fn skeleton(kind: &str, name: &str, namespace: Option<&str>) -> Json {
    let mut meta = serde_json::Map::new();
    meta.insert("name".into(), Json::String(name.to_string()));
    if let Some(ns) = namespace {
        meta.insert("namespace".into(), Json::String(ns.to_string()));
    }
    serde_json::json!({ "kind": kind, "metadata": Json::Object(meta) })
}

/// Registry of live sessions plus per-triple origin classifications that
/// outlive their sessions.
pub struct SessionRegistry {
    cluster: Arc<dyn ClusterApi>,
    sessions: Mutex<HashMap<Triple, EditHandle>>,
    origins: Mutex<HashMap<Triple, Classification>>,
}

impl SessionRegistry {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            cluster,
            sessions: Mutex::new(HashMap::new()),
            origins: Mutex::new(HashMap::new()),
        }
    }

    /// Enter edit mode for a triple. An existing session is reused and its
    /// snapshot refreshed; otherwise a fresh fetch seeds a new session. A
    /// missing object yields an `is_new` session with a skeleton snapshot.
    pub async fn begin_edit(
        &self,
        namespace: Option<&str>,
        kind: &str,
        name: &str,
        origin: Option<Classification>,
    ) -> Result<EditHandle, ClusterError> {
        let triple = Triple {
            namespace: namespace.map(|s| s.to_string()),
            kind: kind.to_string(),
            name: name.to_string(),
        };

        // Fetch before taking any lock; commands run one at a time, but the
        // fetch must not serialize unrelated registry access.
        let fetched = match self.cluster.get_object(kind, name, namespace).await {
            Ok(mut raw) => {
                strip_server_managed(&mut raw);
                Some(raw)
            }
            Err(ClusterError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        if let Some(o) = origin {
            self.origins.lock().unwrap().insert(triple.clone(), o);
        }
        let remembered = origin.or_else(|| self.origins.lock().unwrap().get(&triple).copied());

        let mut sessions = self.sessions.lock().unwrap();
        if let Some(handle) = sessions.get(&triple) {
            let mut state = handle.state.lock().unwrap();
            state.edit_open = true;
            if let Some(raw) = fetched {
                state.original_snapshot = raw;
                state.is_new = false;
            }
            if remembered.is_some() {
                state.origin = remembered;
            }
            debug!(session = %handle.id, triple = %triple, "edit session reused");
            return Ok(handle.clone());
        }

        let is_new = fetched.is_none();
        let snapshot = fetched.unwrap_or_else(|| skeleton(kind, name, namespace));
        let handle: EditHandle = Arc::new(EditSession {
            id: uuid::Uuid::new_v4(),
            triple: triple.clone(),
            state: Mutex::new(SessionState {
                original_snapshot: snapshot,
                origin: remembered,
                is_new,
                view_open: false,
                edit_open: true,
                pending: false,
            }),
        });
        info!(session = %handle.id, triple = %triple, is_new, "edit session opened");
        sessions.insert(triple, handle.clone());
        Ok(handle)
    }

    /// Explicit refresh from the view side: re-fetch and replace the
    /// snapshot.
    pub async fn refresh(&self, handle: &EditHandle) -> Result<(), ClusterError> {
        let triple = handle.triple();
        let mut raw = self
            .cluster
            .get_object(&triple.kind, &triple.name, triple.namespace.as_deref())
            .await?;
        strip_server_managed(&mut raw);
        let mut state = handle.state.lock().unwrap();
        state.original_snapshot = raw;
        state.is_new = false;
        Ok(())
    }

    pub fn open_view(&self, handle: &EditHandle) {
        handle.state.lock().unwrap().view_open = true;
    }

    pub fn close_view(&self, handle: &EditHandle) {
        {
            let mut state = handle.state.lock().unwrap();
            state.view_open = false;
        }
        self.discard_if_done(handle);
    }

    /// Close the editable representation. `unsaved` keeps the session alive
    /// so a reopen can resume the buffered content.
    pub fn close_edit(&self, handle: &EditHandle, unsaved: bool) {
        {
            let mut state = handle.state.lock().unwrap();
            state.edit_open = false;
            state.pending = unsaved;
        }
        self.discard_if_done(handle);
    }

    fn discard_if_done(&self, handle: &EditHandle) {
        let done = {
            let state = handle.state.lock().unwrap();
            !state.view_open && !state.edit_open && !state.pending
        };
        if done {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(live) = sessions.get(handle.triple()) {
                if live.id == handle.id {
                    sessions.remove(handle.triple());
                    debug!(session = %handle.id, triple = %handle.triple(), "edit session discarded");
                }
            }
        }
    }

    /// Notify the registry that applied content landed for a session.
    pub fn complete_apply(&self, handle: &EditHandle, applied: Json) {
        handle.complete_apply(applied);
    }

    pub fn mark_pending(&self, handle: &EditHandle, pending: bool) {
        handle.mark_pending(pending);
    }

    /// Previously stored origin for a triple, surviving session teardown.
    pub fn stored_origin(&self, triple: &Triple) -> Option<Classification> {
        self.origins.lock().unwrap().get(triple).copied()
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}
