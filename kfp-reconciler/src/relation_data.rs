//! Validation of structured relation payloads

use tracing::{error, warn};

use crate::error::{ReconcileError, Result};
use crate::interfaces::{FlatRecord, Interface, Interfaces, NegotiationError};

/// Map a negotiation failure onto the status it should surface as
///
/// A remote side that has not advertised versions yet is expected to catch
/// up; anything else needs an operator.
pub fn classify_negotiation(err: NegotiationError) -> ReconcileError {
    match err {
        NegotiationError::NoVersionsListed { .. } => ReconcileError::waiting(err.to_string()),
        NegotiationError::NoCompatibleVersions { .. } | NegotiationError::RelationData { .. } => {
            ReconcileError::blocked(err.to_string())
        }
        NegotiationError::Model(e) => ReconcileError::Fatal(e),
    }
}

/// First remote record on `relation_name`, or `default` when nothing is related
pub fn validate_interface(
    interfaces: &Interfaces,
    relation_name: &str,
    default: Option<FlatRecord>,
) -> Result<FlatRecord> {
    let interface = match interfaces.get(relation_name) {
        Some(Some(interface)) => interface,
        _ => {
            return default.ok_or_else(|| {
                ReconcileError::blocked(format!("Please add required relation {}", relation_name))
            });
        }
    };

    let structured = match interface {
        Interface::Structured(structured) => structured,
        Interface::Unversioned(_) => {
            return Err(ReconcileError::blocked(format!(
                "Unexpected error with {} relation data - data not as expected",
                relation_name
            )));
        }
    };

    let records = structured.get_data().map_err(|e| {
        error!(relation = %relation_name, version = %structured.version(), "{}", e);
        ReconcileError::blocked(format!(
            "Found incomplete/incorrect relation data for {}. See logs",
            relation_name
        ))
    })?;

    let Some(first) = records.into_iter().next() else {
        return Err(ReconcileError::waiting(format!(
            "Waiting for {} relation data",
            relation_name
        )));
    };

    if first.data.is_empty() {
        warn!(relation = %relation_name, app = %first.app, "empty relation data");
        return Err(ReconcileError::waiting(format!(
            "Found empty relation data for {}",
            relation_name
        )));
    }

    Ok(first.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{get_interfaces, KFP_VIZ, OBJECT_STORAGE};
    use crate::testing::{sdi_relation, FakeModel};
    use kfp_models::{Relation, Status};

    async fn interfaces_with(relations: Vec<Relation>) -> Interfaces {
        let model = FakeModel::leader();
        for relation in relations {
            model.add_relation(relation);
        }
        get_interfaces(&model, &[OBJECT_STORAGE, KFP_VIZ]).await.unwrap()
    }

    #[tokio::test]
    async fn test_absent_relation_is_blocked_without_default() {
        let interfaces = interfaces_with(vec![]).await;
        let err = validate_interface(&interfaces, "object-storage", None).unwrap_err();
        assert_eq!(
            err.status(),
            Some(&Status::blocked("Please add required relation object-storage"))
        );
    }

    #[tokio::test]
    async fn test_absent_relation_returns_default() {
        let interfaces = interfaces_with(vec![]).await;
        let default = FlatRecord::from([("service-name".to_string(), "none".to_string())]);
        let record = validate_interface(&interfaces, "kfp-viz", Some(default.clone())).unwrap();
        assert_eq!(record, default);
    }

    #[tokio::test]
    async fn test_relation_without_data_is_waiting() {
        let interfaces = interfaces_with(vec![sdi_relation("kfp-viz", 2, "viz", None)]).await;
        let err = validate_interface(&interfaces, "kfp-viz", None).unwrap_err();
        assert!(matches!(err.status(), Some(Status::Waiting(_))));
    }

    #[tokio::test]
    async fn test_empty_record_is_waiting() {
        let interfaces = interfaces_with(vec![sdi_relation("kfp-viz", 2, "viz", Some("{}"))]).await;
        let err = validate_interface(&interfaces, "kfp-viz", None).unwrap_err();
        assert_eq!(
            err.status(),
            Some(&Status::waiting("Found empty relation data for kfp-viz"))
        );
    }

    #[tokio::test]
    async fn test_schema_failure_is_blocked() {
        let interfaces =
            interfaces_with(vec![sdi_relation("kfp-viz", 2, "viz", Some("service-name: viz\n"))]).await;
        let err = validate_interface(&interfaces, "kfp-viz", None).unwrap_err();
        assert!(matches!(err.status(), Some(Status::Blocked(m)) if m.contains("incomplete/incorrect")));
    }

    #[tokio::test]
    async fn test_unversioned_interface_is_blocked() {
        let mut interfaces = Interfaces::new();
        interfaces.insert("kfp-viz".to_string(), Some(Interface::Unversioned(vec![])));
        let err = validate_interface(&interfaces, "kfp-viz", None).unwrap_err();
        assert!(matches!(err.status(), Some(Status::Blocked(m)) if m.contains("not as expected")));
    }

    #[test]
    fn test_negotiation_errors_classify_by_kind() {
        let waiting = classify_negotiation(NegotiationError::NoVersionsListed {
            relation: "kfp-viz".to_string(),
        });
        assert!(matches!(waiting.status(), Some(Status::Waiting(_))));

        let blocked = classify_negotiation(NegotiationError::RelationData {
            relation: "kfp-viz".to_string(),
            reason: "bad yaml".to_string(),
        });
        assert!(matches!(blocked.status(), Some(Status::Blocked(_))));

        let fatal = classify_negotiation(NegotiationError::Model(anyhow::anyhow!("hook tool failed")));
        assert!(fatal.status().is_none());
    }
}
