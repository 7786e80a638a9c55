use pointcloud_store::{
    BoundingBox, Decoder, FilterMode, PointBatch, PointCloudResult, PointCloudStore,
    StoreSettings, Transform, Vec3, ViewArena,
};

const COLORS: [&str; 3] = ["red", "green", "blue"];

fn line_store(settings: StoreSettings, count: usize) -> PointCloudResult<PointCloudStore> {
    let store = PointCloudStore::open_in_memory_with(settings)?;
    let mut batch = PointBatch::new("line");
    for i in 0..count {
        batch.push_point(
            Transform::from_translation(Vec3::new(i as f64, 0.0, 0.0)),
            [("color", COLORS[i % 3])],
        );
    }
    store.bulk_insert(&batch)?;
    Ok(store)
}

#[test]
fn metadata_filter_is_materialized_once() -> PointCloudResult<()> {
    let store = line_store(StoreSettings::default(), 100)?;
    let values = store.query_value("SELECT COUNT(*) FROM AttributeValues", &Decoder::Int)?;
    assert_eq!(values.and_then(|value| value.as_int()), Some(3));

    let mut views = ViewArena::new();
    let view = views.create_view();
    views.filter_on_metadata(view, "color", "red", FilterMode::Or)?;

    assert_eq!(views.count(&store, view)?, 34);
    let created = store.diagnostics().tables_created();
    let hits = store.diagnostics().cache_hits();

    assert_eq!(views.count(&store, view)?, 34);
    assert_eq!(store.diagnostics().tables_created(), created);
    assert_eq!(store.diagnostics().cache_hits(), hits + 1);

    let counts = views.attribute_value_counts(&store, view, "color")?;
    assert_eq!(counts.len(), 1);
    assert_eq!(counts.get("red"), Some(&34));
    Ok(())
}

#[test]
fn filters_compose_conjunctively() -> PointCloudResult<()> {
    let store = line_store(StoreSettings::default(), 100)?;
    let mut views = ViewArena::new();
    let view = views.create_view();
    views.filter_on_metadata(view, "color", "green", FilterMode::Or)?;
    views.filter_on_range(view, 1, 10)?;
    // ids 2, 5 and 8 are green
    assert_eq!(views.indexes(&store, view)?, vec![2, 5, 8]);

    let child = views.make_child_view(view)?;
    views.filter_on_point_expression(child, "Minx > 2", FilterMode::Or)?;
    assert_eq!(views.indexes(&store, child)?, vec![5, 8]);

    let whole = views.create_view();
    let counts = views.attribute_value_counts(&store, whole, "color")?;
    assert_eq!(counts.values().sum::<i64>(), 100);
    assert_eq!(counts.get("green"), Some(&33));
    Ok(())
}

#[test]
fn parent_changes_invalidate_child_hashes() -> PointCloudResult<()> {
    let store = line_store(StoreSettings::default(), 30)?;
    let mut views = ViewArena::new();
    let parent = views.create_view();
    views.filter_on_metadata(parent, "color", "red", FilterMode::Or)?;
    let child = views.make_child_view(parent)?;
    views.filter_on_range(child, 1, 10)?;

    let before = views.content_hash(&store, child)?;
    assert_eq!(views.content_hash(&store, child)?, before);

    views.filter_on_range(parent, 1, 5)?;
    let after = views.content_hash(&store, child)?;
    assert_ne!(before, after);
    assert_eq!(views.indexes(&store, child)?, vec![1, 4]);

    views.clear_filters(parent)?;
    views.clear_filters(child)?;
    assert_eq!(views.content_hash(&store, child)?, store.hash()?);
    Ok(())
}

#[test]
fn small_cache_keeps_results_correct() -> PointCloudResult<()> {
    let tight = StoreSettings {
        cache_capacity: 2,
        ..StoreSettings::default()
    };
    let small = line_store(tight, 100)?;
    let roomy = line_store(StoreSettings::default(), 100)?;

    let mut views = ViewArena::new();
    let view = views.create_view();
    views.filter_on_metadata(view, "color", "red", FilterMode::Or)?;
    views.filter_on_range(view, 1, 60)?;
    views.filter_on_bounding_box(
        view,
        &BoundingBox::new(Vec3::new(0.0, -1.0, -1.0), Vec3::new(30.0, 1.0, 1.0)),
        false,
    )?;
    views.filter_on_point_expression(view, "Minx >= 3", FilterMode::Or)?;

    assert_eq!(views.count(&small, view)?, 10);
    assert_eq!(views.count(&roomy, view)?, 10);
    assert!(small.diagnostics().tables_evicted() > 0);
    assert_eq!(
        views.attribute_values(&small, view, "color")?,
        views.attribute_values(&roomy, view, "color")?
    );
    assert_eq!(views.indexes(&small, view)?, views.indexes(&roomy, view)?);
    Ok(())
}

#[test]
fn reads_leave_the_cache_within_capacity() -> PointCloudResult<()> {
    let store = line_store(
        StoreSettings {
            cache_capacity: 1,
            ..StoreSettings::default()
        },
        30,
    )?;
    let mut views = ViewArena::new();
    let view = views.create_view();
    views.filter_on_metadata(view, "color", "red", FilterMode::Or)?;
    views.filter_on_range(view, 1, 20)?;
    views.filter_on_point_expression(view, "Minx >= 3", FilterMode::Or)?;

    let temp_tables = |store: &PointCloudStore| -> PointCloudResult<Option<i64>> {
        Ok(store
            .query_value(
                "SELECT COUNT(*) FROM sqlite_temp_master WHERE type = 'table' AND name LIKE 'Temp_%'",
                &Decoder::Int,
            )?
            .and_then(|value| value.as_int()))
    };

    assert_eq!(views.count(&store, view)?, 6);
    assert_eq!(store.cache().len(), 1);
    assert_eq!(temp_tables(&store)?, Some(1));

    views.attribute_value_counts(&store, view, "color")?;
    assert_eq!(store.cache().len(), 1);
    assert_eq!(temp_tables(&store)?, Some(1));

    assert!(views.materialize(&store, view)?.is_some());
    assert_eq!(store.cache().len(), 1);
    assert_eq!(temp_tables(&store)?, Some(1));
    Ok(())
}

#[test]
fn inserts_drop_cached_results() -> PointCloudResult<()> {
    let store = line_store(StoreSettings::default(), 9)?;
    let mut views = ViewArena::new();
    let view = views.create_view();
    views.filter_on_metadata(view, "color", "blue", FilterMode::Or)?;
    assert_eq!(views.count(&store, view)?, 3);

    let mut more = PointBatch::new("more");
    more.push_point(Transform::IDENTITY, [("color", "blue")]);
    store.bulk_insert(&more)?;
    assert!(store.cache().is_empty());
    assert_eq!(views.count(&store, view)?, 4);
    Ok(())
}
