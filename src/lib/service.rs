use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{Result, VaultError},
    model::{AggregateMetadata, IMMUTABLE_FIELDS, PatchEvent, Project, reserved_field},
    patch::{self, PatchError, PatchErrorKind, PatchOp, PatchOperation},
    store::{DocumentStore, UpdateOutcome},
};

/// Outcome of a patch or undo. A conflict carries the version the caller
/// must re-read before retrying.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOutcome {
    Applied { project: Project, event: PatchEvent },
    Conflict { expected: u32, actual: u32 },
}

/// Load, interpret, commit. Sits between callers holding patch documents and
/// the [`DocumentStore`].
#[derive(Clone)]
pub struct ProjectService {
    store: Arc<DocumentStore>,
}

impl ProjectService {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub async fn create_project(
        &self,
        owner_id: &str,
        name: &str,
        description: Option<String>,
        fields: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Project> {
        ensure_domain_fields(&fields)?;
        let mut project = Project::new(Uuid::new_v4().to_string(), owner_id, name);
        project.description = description;
        project.fields = fields;

        self.store
            .generate_key(&project.id, owner_id, cancel)
            .await?;
        self.store.save_snapshot(&project.id, &project, cancel).await?;
        info!(aggregate_id = %project.id, owner_id, "project created");
        Ok(project)
    }

    pub async fn get(&self, aggregate_id: &str, cancel: &CancellationToken) -> Result<Project> {
        self.store
            .load_snapshot(aggregate_id, cancel)
            .await?
            .ok_or_else(|| VaultError::AggregateNotFound(aggregate_id.to_string()))
    }

    pub async fn list(
        &self,
        owner_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<AggregateMetadata>> {
        self.store.list_projects(owner_id, cancel).await
    }

    pub async fn delete(&self, aggregate_id: &str, cancel: &CancellationToken) -> Result<bool> {
        self.store.delete_project(aggregate_id, cancel).await
    }

    pub async fn history(
        &self,
        aggregate_id: &str,
        since_version: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<PatchEvent>> {
        self.store.load_events(aggregate_id, since_version, cancel).await
    }

    /// Applies `operations` to the project at `expected_version` and commits
    /// the result as the next version together with its change-set event.
    pub async fn apply_patch(
        &self,
        aggregate_id: &str,
        user_id: &str,
        expected_version: u32,
        operations: &[PatchOperation],
        description: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<PatchOutcome> {
        ensure_mutable_paths(operations)?;
        let current = self.get(aggregate_id, cancel).await?;
        if current.version != expected_version {
            return Ok(PatchOutcome::Conflict {
                expected: expected_version,
                actual: current.version,
            });
        }
        self.commit(current, user_id, operations, description, None, cancel)
            .await
    }

    /// Commits the inverse of a recorded change set as a new version.
    pub async fn undo(
        &self,
        aggregate_id: &str,
        user_id: &str,
        change_set_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<PatchOutcome> {
        let events = self.store.load_events(aggregate_id, 0, cancel).await?;
        let original = events
            .into_iter()
            .find(|event| event.change_set_id == change_set_id)
            .ok_or_else(|| {
                VaultError::InvalidEvent(format!(
                    "change set {change_set_id} not found for {aggregate_id}"
                ))
            })?;

        let inverse = patch::invert(&original.operations);
        let current = self.get(aggregate_id, cancel).await?;
        self.commit(
            current,
            user_id,
            &inverse,
            Some(format!("undo {change_set_id}")),
            Some(change_set_id),
            cancel,
        )
        .await
    }

    async fn commit(
        &self,
        current: Project,
        user_id: &str,
        operations: &[PatchOperation],
        description: Option<String>,
        reverts: Option<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<PatchOutcome> {
        let base_version = current.version;
        let (mut updated, applied) = patch::apply_to(&current, operations)?;
        ensure_domain_fields(&updated.fields)?;

        let mut event = PatchEvent::new(&current.id, user_id, base_version, applied);
        event.description = description;
        event.reverts = reverts;

        let outcome = self
            .store
            .try_commit_patch(&current.id, base_version, &mut updated, &event, cancel)
            .await?;
        match outcome {
            UpdateOutcome::Updated { version } => {
                debug!(aggregate_id = %current.id, version, change_set_id = %event.change_set_id, "patch committed");
                Ok(PatchOutcome::Applied {
                    project: updated,
                    event,
                })
            }
            UpdateOutcome::Conflict { expected, actual } => {
                Ok(PatchOutcome::Conflict { expected, actual })
            }
        }
    }
}

/// Domain fields share the snapshot object with the typed keys, so a
/// colliding name would serialize a duplicate key that never loads again.
fn ensure_domain_fields(fields: &Map<String, Value>) -> Result<()> {
    match fields.keys().find_map(|key| reserved_field(key).map(|_| key)) {
        Some(key) => Err(VaultError::ReservedField(key.clone())),
        None => Ok(()),
    }
}

/// Rejects operations that would write to an identity field. `test` may
/// still read them.
fn ensure_mutable_paths(operations: &[PatchOperation]) -> Result<()> {
    for (index, operation) in operations.iter().enumerate() {
        if operation.op == PatchOp::Test {
            continue;
        }
        let mut touched = vec![operation.path.as_str()];
        if operation.op == PatchOp::Move {
            touched.extend(operation.from.as_deref());
        }
        for pointer in touched {
            let tokens = patch::parse_pointer(pointer)
                .map_err(|kind| PatchError::new(index, pointer, kind))?;
            let field = match tokens.first() {
                None => "document root".to_string(),
                Some(first) => match IMMUTABLE_FIELDS
                    .iter()
                    .find(|field| field.eq_ignore_ascii_case(first))
                {
                    Some(field) => (*field).to_string(),
                    None => continue,
                },
            };
            return Err(PatchError::new(index, pointer, PatchErrorKind::ImmutableField(field)).into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        encryption::{EnvelopeEncryptor, KeyEncryptionKey},
        keys::InMemoryKeyVault,
    };

    fn service(root: &std::path::Path) -> ProjectService {
        let kek = KeyEncryptionKey::new_from_base64("kek-1", &KeyEncryptionKey::generate_base64())
            .unwrap();
        let encryptor = EnvelopeEncryptor::new(kek, Arc::new(InMemoryKeyVault::new()), 8);
        ProjectService::new(Arc::new(DocumentStore::new(root, Arc::new(encryptor))))
    }

    async fn seeded(service: &ProjectService, cancel: &CancellationToken) -> Project {
        let mut fields = Map::new();
        fields.insert("income".into(), json!({ "salary": 50000 }));
        service
            .create_project("owner-1", "Household", None, fields, cancel)
            .await
            .unwrap()
    }

    fn applied(outcome: PatchOutcome) -> (Project, PatchEvent) {
        match outcome {
            PatchOutcome::Applied { project, event } => (project, event),
            other => panic!("expected applied outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn patch_commits_next_version_with_event() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let cancel = CancellationToken::new();
        let project = seeded(&service, &cancel).await;

        let ops = [PatchOperation::replace("/income/salary", json!(65000))];
        let (updated, event) = applied(
            service
                .apply_patch(&project.id, "user-1", 1, &ops, Some("raise".into()), &cancel)
                .await
                .unwrap(),
        );
        assert_eq!(updated.version, 2);
        assert_eq!(updated.fields["income"]["salary"], 65000);
        assert_eq!(event.operations[0].old_value, Some(json!(50000)));
        assert_eq!(event.description.as_deref(), Some("raise"));

        let stored = service.get(&project.id, &cancel).await.unwrap();
        assert_eq!(stored, updated);
        let history = service.history(&project.id, 0, &cancel).await.unwrap();
        assert_eq!(history, vec![event]);
    }

    #[tokio::test]
    async fn stale_version_reports_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let cancel = CancellationToken::new();
        let project = seeded(&service, &cancel).await;

        let ops = [PatchOperation::replace("/name", json!("X"))];
        service
            .apply_patch(&project.id, "user-1", 1, &ops, None, &cancel)
            .await
            .unwrap();
        let outcome = service
            .apply_patch(&project.id, "user-2", 1, &ops, None, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, PatchOutcome::Conflict { expected: 1, actual: 2 });
    }

    #[tokio::test]
    async fn identity_fields_cannot_be_patched() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let cancel = CancellationToken::new();
        let project = seeded(&service, &cancel).await;

        for ops in [
            vec![PatchOperation::replace("/ownerId", json!("intruder"))],
            vec![PatchOperation::remove("/ID")],
            vec![PatchOperation::move_from("/version", "/old")],
            vec![PatchOperation::replace("", json!({}))],
        ] {
            let err = service
                .apply_patch(&project.id, "user-1", 1, &ops, None, &cancel)
                .await
                .unwrap_err();
            assert!(
                matches!(&err, VaultError::Patch(PatchError { kind: PatchErrorKind::ImmutableField(_), .. })),
                "unexpected {err:?}"
            );
        }

        let ok = [PatchOperation::test("/ownerId", json!("owner-1"))];
        service
            .apply_patch(&project.id, "user-1", 1, &ok, None, &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_patch_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let cancel = CancellationToken::new();
        let project = seeded(&service, &cancel).await;

        let ops = [
            PatchOperation::replace("/name", json!("changed")),
            PatchOperation::remove("/income/bonus"),
        ];
        let err = service
            .apply_patch(&project.id, "user-1", 1, &ops, None, &cancel)
            .await
            .unwrap_err();
        match err {
            VaultError::Patch(err) => {
                assert_eq!(err.index, 1);
                assert_eq!(err.path, "/income/bonus");
            }
            other => panic!("unexpected {other:?}"),
        }
        let stored = service.get(&project.id, &cancel).await.unwrap();
        assert_eq!(stored.name, "Household");
        assert_eq!(stored.version, 1);
        assert!(service.history(&project.id, 0, &cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undo_restores_previous_content_as_new_version() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let cancel = CancellationToken::new();
        let project = seeded(&service, &cancel).await;

        let ops = [
            PatchOperation::replace("/name", json!("Renamed")),
            PatchOperation::add("/dependents", json!(["kid"])),
            PatchOperation::remove("/income"),
        ];
        let (_, event) = applied(
            service
                .apply_patch(&project.id, "user-1", 1, &ops, None, &cancel)
                .await
                .unwrap(),
        );

        let (restored, undo_event) = applied(
            service
                .undo(&project.id, "user-1", event.change_set_id, &cancel)
                .await
                .unwrap(),
        );
        assert_eq!(restored.version, 3);
        assert_eq!(restored.name, "Household");
        assert_eq!(restored.fields, project.fields);
        assert_eq!(undo_event.reverts, Some(event.change_set_id));

        let err = service
            .undo(&project.id, "user-1", Uuid::new_v4(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidEvent(_)));
    }

    #[tokio::test]
    async fn undo_reverts_array_edits() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let cancel = CancellationToken::new();
        let mut fields = Map::new();
        fields.insert("dependents".into(), json!(["ann", "bob"]));
        fields.insert("notes".into(), json!([]));
        let project = service
            .create_project("owner-1", "Household", None, fields, &cancel)
            .await
            .unwrap();

        let ops = [
            PatchOperation::add("/dependents/-", json!("cy")),
            PatchOperation::add("/dependents/0", json!("zed")),
            PatchOperation::move_from("/dependents/1", "/dependents/-"),
            PatchOperation::copy_from("/name", "/notes/-"),
        ];
        let (patched, event) = applied(
            service
                .apply_patch(&project.id, "user-1", 1, &ops, None, &cancel)
                .await
                .unwrap(),
        );
        assert_eq!(patched.fields["dependents"], json!(["zed", "bob", "cy", "ann"]));
        assert_eq!(patched.fields["notes"], json!(["Household"]));

        let (restored, _) = applied(
            service
                .undo(&project.id, "user-1", event.change_set_id, &cancel)
                .await
                .unwrap(),
        );
        assert_eq!(restored.version, 3);
        assert_eq!(restored.fields, project.fields);
    }

    #[tokio::test]
    async fn reserved_field_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let cancel = CancellationToken::new();

        for key in ["version", "OwnerId", "updatedat"] {
            let mut fields = Map::new();
            fields.insert(key.into(), json!(7));
            let err = service
                .create_project("owner-1", "Household", None, fields, &cancel)
                .await
                .unwrap_err();
            assert!(
                matches!(&err, VaultError::ReservedField(field) if field == key),
                "unexpected {err:?}"
            );
        }
        assert!(service.list("owner-1", &cancel).await.unwrap().is_empty());
        assert!(!dir.path().join("projects").exists());

        let project = seeded(&service, &cancel).await;
        let err = service
            .apply_patch(
                &project.id,
                "user-1",
                1,
                &[PatchOperation::add("/Description", json!("shadow"))],
                None,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::ReservedField(_)));
        assert_eq!(service.get(&project.id, &cancel).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn missing_projects_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let cancel = CancellationToken::new();

        let err = service
            .apply_patch("ghost", "user-1", 1, &[], None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::AggregateNotFound(_)));
    }
}
