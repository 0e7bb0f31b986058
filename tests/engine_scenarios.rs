//! End-to-end behaviour of the engine's operation surface.

use lineage::config::AppConfig;
use lineage::engine::Engine;
use lineage::error::{ErrorCode, OperationResult};
use lineage::model::comparison::DifferenceType;
use lineage::model::version::{AiParameters, NewVersion, VersionId, VersionPatch, VersionStatus};
use lineage::query::history::StatisticsScope;
use lineage::store::snapshot::{ExportOptions, ImportOptions};

fn engine() -> Engine {
    Engine::new(&AppConfig::default())
}

fn created(result: OperationResult) -> VersionId {
    assert!(result.success, "{}", result.message);
    result.version_id.unwrap()
}

fn params(seed: u64, steps: u32) -> AiParameters {
    AiParameters {
        model: Some("sdxl-1.0".into()),
        provider: Some("stability".into()),
        seed: Some(seed),
        guidance: Some(7.5),
        steps: Some(steps),
        enhance: Some(true),
        style: Some("photographic".into()),
    }
}

/// Two lineages, a side branch and a few levels of depth.
fn populated() -> (Engine, VersionId, VersionId) {
    let mut engine = engine();
    let cat = created(engine.create_version(
        NewVersion::root("a cat")
            .with_title("Cat")
            .with_parameters(params(1, 30))
            .with_dimensions(1024, 1024)
            .with_file_size(1_000)
            .with_generation_time(2_000),
    ));
    let detailed = created(engine.create_version(
        NewVersion::child_of(&cat, "a cat, detailed").with_parameters(params(1, 40)),
    ));
    created(engine.create_version(NewVersion::child_of(&detailed, "a cat, detailed, 4k")));
    assert!(engine.create_branch("sketch", &cat).success);
    let sketch = created(engine.create_version(NewVersion::child_of(&cat, "a cat, pencil sketch")));
    created(engine.create_version(NewVersion::child_of(&sketch, "a cat, charcoal sketch")));

    let dog = created(engine.create_version(NewVersion::root("a dog")));
    created(engine.create_version(NewVersion::child_of(&dog, "a dog, running")));
    (engine, cat, dog)
}

#[test]
fn test_ancestor_chains_end_at_recorded_root() {
    let (engine, _, _) = populated();
    for version in engine.versions().iter() {
        let path = engine.lineage(&version.id).unwrap();
        let top = engine.version(&path[0]).unwrap();
        assert!(top.parent_version_id.is_none());
        assert_eq!(top.id, version.root_version_id);
        assert_eq!(path.last(), Some(&version.id));
    }
}

#[test]
fn test_parent_child_links_are_symmetric() {
    let (engine, _, _) = populated();
    for version in engine.versions().iter() {
        if let Some(parent_id) = &version.parent_version_id {
            let parent = engine.version(parent_id).unwrap();
            assert!(parent.child_version_ids.contains(&version.id));
        }
        for child_id in &version.child_version_ids {
            let child = engine.version(child_id).unwrap();
            assert_eq!(child.parent_version_id.as_ref(), Some(&version.id));
        }
    }
    assert!(engine.check_integrity().is_empty());
}

#[test]
fn test_version_numbers_count_siblings() {
    let mut engine = engine();
    let root = created(engine.create_version(NewVersion::root("r")));
    let a = created(engine.create_version(NewVersion::child_of(&root, "a")));
    let b = created(engine.create_version(NewVersion::child_of(&root, "b")));
    let a1 = created(engine.create_version(NewVersion::child_of(&a, "a1")));

    assert_eq!(engine.version(&a).unwrap().version_number, 1);
    assert_eq!(engine.version(&b).unwrap().version_number, 2);
    assert_eq!(engine.version(&a1).unwrap().version_number, 1);
}

#[test]
fn test_delete_guard() {
    let (mut engine, _, dog) = populated();
    let running = engine.version(&dog).unwrap().child_version_ids[0].clone();

    let result = engine.delete_version(&dog);
    assert!(!result.success);
    assert_eq!(result.error_code(), Some(ErrorCode::ConflictError));
    assert!(engine.version(&dog).is_some());

    assert!(engine.delete_version(&running).success);
    assert!(engine.version(&running).is_none());
    assert!(engine.version(&dog).unwrap().child_version_ids.is_empty());

    assert!(engine.delete_version(&dog).success);
    assert_eq!(
        engine.delete_version(&dog).error_code(),
        Some(ErrorCode::NotFoundError)
    );
    assert!(engine.check_integrity().is_empty());
}

#[test]
fn test_similarity_reflexive_and_symmetric() {
    let (engine, _, _) = populated();
    let ids: Vec<VersionId> = engine.versions().iter().map(|v| v.id.clone()).collect();
    for a in &ids {
        let same = engine.calculate_similarity(a, a).unwrap();
        assert!((same - 1.0).abs() < 1e-9, "{a}: {same}");
        for b in &ids {
            let ab = engine.calculate_similarity(a, b).unwrap();
            let ba = engine.calculate_similarity(b, a).unwrap();
            assert!((ab - ba).abs() < 1e-9);
            assert!((0.0..=1.0).contains(&ab));
        }
    }
}

#[test]
fn test_non_finite_guidance_never_enters_the_store() {
    let mut engine = engine();
    let result = engine.create_version(NewVersion::root("a fox").with_parameters(AiParameters {
        guidance: Some(f64::NAN),
        ..params(3, 20)
    }));
    assert_eq!(result.error_code(), Some(ErrorCode::ValidationError));
    assert!(engine.versions().is_empty());

    let fox = created(engine.create_version(NewVersion::root("a fox").with_parameters(params(3, 20))));
    let same = engine.calculate_similarity(&fox, &fox).unwrap();
    assert!((same - 1.0).abs() < 1e-9);
}

#[test]
fn test_differences_empty_iff_fields_equal() {
    let mut engine = engine();
    let data = NewVersion::root("a red fox")
        .with_title("Fox")
        .with_parameters(params(7, 25))
        .with_dimensions(512, 768);
    let a = created(engine.create_version(data.clone()));
    let b = created(engine.create_version(data));
    assert!(engine.compare_versions(&a, &b).unwrap().differences.is_empty());

    engine.update_version(
        &b,
        VersionPatch {
            title: Some("Fox, again".into()),
            ..Default::default()
        },
    );
    let differences = engine.compare_versions(&a, &b).unwrap().differences;
    assert_eq!(differences.len(), 1);
    assert_eq!(differences[0].field, "title");
    assert_eq!(differences[0].diff_type, DifferenceType::Metadata);
}

#[test]
fn test_tree_covers_every_lineage_member() {
    let (engine, cat, dog) = populated();
    for root in [&cat, &dog] {
        let tree = engine.build_version_tree(root, None).unwrap();
        let members = engine
            .versions()
            .iter()
            .filter(|v| v.root_version_id == *root)
            .count();
        assert_eq!(tree.total_versions, members);
        assert_eq!(tree.node_count, members);
    }

    let tree = engine.build_version_tree(&cat, None).unwrap();
    assert_eq!(tree.max_depth, 2);
    // sketch is checked out, so its head carries the active marker.
    assert!(tree.render().contains("<*sketch>"));
}

#[test]
fn test_branch_names_unique_ignoring_case() {
    let (mut engine, cat, _) = populated();
    let result = engine.create_branch("Main", &cat);
    assert_eq!(result.error_code(), Some(ErrorCode::ConflictError));
    let result = engine.create_branch("  ", &cat);
    assert_eq!(result.error_code(), Some(ErrorCode::ValidationError));
    let result = engine.create_branch("other", "v-missing");
    assert_eq!(result.error_code(), Some(ErrorCode::ConflictError));

    assert!(engine.create_branch("Ärger", &cat).success);
    let result = engine.create_branch("ärger", &cat);
    assert_eq!(result.error_code(), Some(ErrorCode::ConflictError));
    assert!(engine.check_integrity().is_empty());

    // Whatever the engine accepts, its own import accepts too.
    let bytes = engine.export_versions(&ExportOptions::default()).unwrap();
    let mut restored = Engine::new(&AppConfig::default());
    let result = restored.import_versions(&bytes, ImportOptions::default());
    assert!(result.success, "{}", result.message);
}

#[test]
fn test_scenario_cat_and_detailed_cat() {
    let mut engine = engine();
    let v1 = created(engine.create_version(NewVersion::root("a cat")));
    let v2 = created(engine.create_version(NewVersion::child_of(&v1, "a cat, detailed")));

    let comparison = engine.compare_versions(&v1, &v2).unwrap();
    assert!(comparison.similarity > 0.0 && comparison.similarity < 1.0);
    let prompts: Vec<_> = comparison
        .differences
        .iter()
        .filter(|d| d.field == "prompt")
        .collect();
    assert_eq!(prompts.len(), 1);
    assert_eq!(comparison.differences.len(), 1);
    assert_eq!(prompts[0].old_value, "a cat");
    assert_eq!(prompts[0].new_value, "a cat, detailed");
}

#[test]
fn test_scenario_delete_active_feature_branch() {
    let mut engine = engine();
    let v1 = created(engine.create_version(NewVersion::root("a cat")));
    let main_id = engine.active_branch().unwrap().id.clone();

    let feature = engine.create_branch("feature", &v1).branch_id.unwrap();
    let result = engine.delete_branch(&feature);
    assert_eq!(result.error_code(), Some(ErrorCode::ConflictError));
    assert!(engine.branch(&feature).is_some());

    assert!(engine.switch_branch(&main_id).success);
    let result = engine.delete_branch(&feature);
    assert!(result.success, "{}", result.message);
    assert!(engine.branch(&feature).is_none());

    // main is protected even when inactive.
    let other = engine.create_branch("other", &v1).branch_id.unwrap();
    assert_eq!(engine.active_branch().unwrap().id, other);
    assert_eq!(
        engine.delete_branch(&main_id).error_code(),
        Some(ErrorCode::ConflictError)
    );
}

#[test]
fn test_scenario_empty_statistics() {
    let engine = engine();
    let stats = engine.get_statistics(&StatisticsScope::All).unwrap();
    assert_eq!(stats.total_versions, 0);
    assert_eq!(stats.average_generation_time, 0.0);
    assert_eq!(stats.average_file_size, 0.0);
    assert!(stats.model_usage.is_empty());
    assert!(stats.most_viewed.is_empty());
    assert_eq!(stats.creation_frequency.daily, vec![0; 30]);
    assert_eq!(stats.creation_frequency.weekly, vec![0; 12]);
    assert_eq!(stats.creation_frequency.monthly, vec![0; 12]);
    assert!(stats.by_status.values().all(|c| *c == 0));
}

#[test]
fn test_scenario_merge_is_unsupported() {
    let (mut engine, _, _) = populated();
    let ids: Vec<String> = engine.branches().iter().map(|b| b.id.clone()).collect();
    let result = engine.merge_branch(&ids[0], &ids[1]);
    assert!(!result.success);
    assert_eq!(result.error_code(), Some(ErrorCode::UnsupportedOperationError));

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["error"]["code"], "UnsupportedOperationError");

    let result = engine.merge_branch("b-x", "b-y");
    assert_eq!(result.error_code(), Some(ErrorCode::UnsupportedOperationError));
}

#[test]
fn test_conflicts_between_branch_heads() {
    let mut engine = engine();
    let root = created(engine.create_version(
        NewVersion::root("a cat").with_parameters(params(1, 30)),
    ));
    let main_id = engine.active_branch().unwrap().id.clone();
    created(engine.create_version(
        NewVersion::child_of(&root, "a cat at night").with_parameters(params(2, 30)),
    ));
    let side = engine.create_branch("side", &root).branch_id.unwrap();
    created(engine.create_version(NewVersion::child_of(&root, "a cat").with_parameters(AiParameters {
        model: Some("flux".into()),
        ..params(3, 30)
    })));

    let conflicts = engine.detect_conflicts(&main_id, &side).unwrap();
    let fields: Vec<&str> = conflicts.iter().map(|d| d.field.as_str()).collect();
    // Seeds differ too, but only prompt/model/provider/dimensions conflict.
    assert_eq!(fields, vec!["prompt", "model"]);
}

#[test]
fn test_duplicate_is_a_fresh_sibling() {
    let (mut engine, cat, _) = populated();
    let detailed = engine.version(&cat).unwrap().child_version_ids[0].clone();
    engine.record_usage(&detailed, lineage::model::version::UsageKind::Like);

    let copy = created(engine.duplicate_version(&detailed));
    let copy = engine.version(&copy).unwrap();
    assert_eq!(copy.parent_version_id.as_ref(), Some(&cat));
    assert_eq!(copy.metadata.usage.like_count, 0);
    assert!(copy.metadata.title.ends_with("(copy)"));
    assert!(engine.check_integrity().is_empty());
}

#[test]
fn test_history_and_scoped_statistics() {
    let (mut engine, cat, dog) = populated();
    engine.update_version(
        &dog,
        VersionPatch {
            status: Some(VersionStatus::Archived),
            ..Default::default()
        },
    );

    let history = engine.get_version_history(&cat).unwrap();
    assert_eq!(history.versions.len(), 5);
    assert_eq!(history.statistics.total_versions, 5);
    assert_eq!(history.branches.len(), 2);
    let active_head = engine.active_branch().unwrap().head_version_id.clone();
    assert_eq!(history.current_version_id, Some(active_head));

    let stats = engine
        .get_statistics(&StatisticsScope::Lineage(dog.clone()))
        .unwrap();
    assert_eq!(stats.total_versions, 2);
    assert_eq!(stats.by_status[&VersionStatus::Archived], 1);

    let child = engine.version(&dog).unwrap().child_version_ids[0].clone();
    let err = engine
        .get_statistics(&StatisticsScope::Lineage(child))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
}
