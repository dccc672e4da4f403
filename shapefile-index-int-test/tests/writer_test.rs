//! Copy-on-write sessions and the identifiers they hand out.

use shapefile_index::{
    Envelope, FileType, Query, Shape, ShapefileConfig, ShapefileError, ShapefileResult,
    ShapefileStore, Value, WriteMode,
};
use shapefile_index_int_test::test_util::{
    age_file, cleanup, create_test_context, create_test_context_with, insert_points, is_sorted,
    random_points, run_test, sorted_ids,
};
use std::collections::HashSet;
use std::fs;

#[ctor::ctor]
fn init() {
    colog::init();
}

#[test]
fn test_identifiers_are_unique_across_sessions() {
    run_test(
        || create_test_context(),
        |ctx| {
            let store = ctx.store();
            for seed in 0..4 {
                insert_points(&store, &random_points(seed, 25, 100.0))?;
            }
            let ids = sorted_ids(store.reader(&Query::all())?)?;
            assert_eq!(ids.len(), 100);
            let unique: HashSet<&String> = ids.iter().collect();
            assert_eq!(unique.len(), 100);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_removed_identifiers_are_never_reused() {
    run_test(
        || create_test_context(),
        |ctx| {
            let store = ctx.store();
            insert_points(&store, &random_points(1, 5, 100.0))?;

            // drop the last two
            let mut writer = store.writer(WriteMode::Update)?;
            while writer.has_next()? {
                let id = writer.next()?.id().to_string();
                if id == "poi.4" || id == "poi.5" {
                    writer.remove()?;
                }
            }
            writer.close()?;
            assert_eq!(store.count(&Query::all())?, 3);

            insert_points(&store, &[(1.0, 1.0), (2.0, 2.0)])?;
            let ids = sorted_ids(store.reader(&Query::all())?)?;
            assert_eq!(ids, vec!["poi.1", "poi.2", "poi.3", "poi.6", "poi.7"]);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

fn remove_ids(store: &ShapefileStore, doomed: &[&str]) -> ShapefileResult<()> {
    let mut writer = store.writer(WriteMode::Update)?;
    while writer.has_next()? {
        let id = writer.next()?.id().to_string();
        if doomed.contains(&id.as_str()) {
            writer.remove()?;
        }
    }
    writer.close()
}

#[test]
fn test_stale_identity_index_keeps_counter() {
    run_test(
        || create_test_context(),
        |ctx| {
            let store = ctx.store();
            insert_points(&store, &[(1.0, 1.0), (2.0, 2.0), (3.0, 3.0)])?;
            remove_ids(&store, &["poi.3"])?;
            age_file(&store.files().path(FileType::Fix), 3600)?;
            assert!(!store.index_manager().index_usable(FileType::Fix));

            insert_points(&store, &[(4.0, 4.0)])?;
            let ids = sorted_ids(store.reader(&Query::all())?)?;
            assert_eq!(ids, vec!["poi.1", "poi.2", "poi.4"]);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_missing_identity_index_keeps_counter() {
    run_test(
        || create_test_context_with(ShapefileConfig::builder().create_index(false).build()),
        |ctx| {
            let store = ctx.store();
            insert_points(&store, &[(1.0, 1.0), (2.0, 2.0), (3.0, 3.0)])?;
            remove_ids(&store, &["poi.3"])?;
            assert!(store.files().delete(FileType::Fix)?);

            insert_points(&store, &[(4.0, 4.0), (5.0, 5.0)])?;
            let features: Vec<_> = store
                .reader(&Query::all())?
                .collect::<Result<_, _>>()?;
            let numbers: Vec<u64> = features.iter().filter_map(|f| f.id().number()).collect();
            assert_eq!(numbers.len(), 4);
            // poi.3 was handed out once and stays retired
            assert_eq!(numbers, vec![1, 2, 4, 5]);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_identifiers_survive_rewrites_in_file_order() {
    run_test(
        || create_test_context(),
        |ctx| {
            let store = ctx.store();
            insert_points(&store, &random_points(2, 10, 100.0))?;

            let mut writer = store.writer(WriteMode::Update)?;
            while writer.has_next()? {
                let feature = writer.next()?;
                let rank = feature.attribute("rank").and_then(Value::as_i64).unwrap_or(0);
                if rank % 2 == 0 {
                    writer.remove()?;
                } else {
                    feature.set_attribute("rank", rank * 10);
                    writer.write()?;
                }
            }
            writer.close()?;

            let features: Vec<_> = store
                .reader(&Query::all())?
                .collect::<Result<_, _>>()?;
            let numbers: Vec<u64> = features.iter().filter_map(|f| f.id().number()).collect();
            assert_eq!(numbers, vec![2, 4, 6, 8, 10]);
            assert!(is_sorted(numbers.iter(), true));
            assert_eq!(features[0].attribute("rank"), Some(&Value::Integer(10)));

            let reader = store.reader(&Query::ids(["poi.8"]))?;
            assert!(reader.is_indexed());
            let found: Vec<_> = reader.collect::<Result<_, _>>()?;
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].attribute("rank"), Some(&Value::Integer(70)));
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_writer_deletes_spatial_index_and_cache() {
    run_test(
        || {
            create_test_context_with(
                ShapefileConfig::builder()
                    .max_qix_cache_size(64 * 1024 * 1024)
                    .build(),
            )
        },
        |ctx| {
            let store = ctx.store();
            insert_points(&store, &random_points(3, 200, 100.0))?;

            let far = Envelope::new(500.0, 500.0, 510.0, 510.0);
            assert_eq!(store.count(&Query::bbox(far))?, 0);
            assert!(store.files().exists(FileType::Qix));
            assert!(store.index_manager().has_cached_tree());

            insert_points(&store, &[(505.0, 505.0)])?;
            assert!(!store.files().exists(FileType::Qix));
            assert!(!store.index_manager().has_cached_tree());

            let found = sorted_ids(store.reader(&Query::bbox(far))?)?;
            assert_eq!(found, vec!["poi.201"]);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_aborted_writer_leaves_set_untouched() {
    run_test(
        || create_test_context(),
        |ctx| {
            let store = ctx.store();
            insert_points(&store, &random_points(4, 20, 100.0))?;
            let shp_before = fs::read(store.files().path(FileType::Shp))?;
            let dbf_before = fs::read(store.files().path(FileType::Dbf))?;
            let fix_before = fs::read(store.files().path(FileType::Fix))?;

            {
                let mut writer = store.writer(WriteMode::Mixed)?;
                while writer.has_next()? {
                    writer.next()?;
                    writer.remove()?;
                }
                let feature = writer.next()?;
                feature.set_geometry(Shape::point(1.0, 2.0));
                writer.write()?;
            }

            assert_eq!(fs::read(store.files().path(FileType::Shp))?, shp_before);
            assert_eq!(fs::read(store.files().path(FileType::Dbf))?, dbf_before);
            assert_eq!(fs::read(store.files().path(FileType::Fix))?, fix_before);
            assert_eq!(store.count(&Query::all())?, 20);

            let leftovers = fs::read_dir(ctx.dir())?
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
                .count();
            assert_eq!(leftovers, 0);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_closed_writer_rejects_calls() {
    run_test(
        || create_test_context(),
        |ctx| {
            let store = ctx.store();
            let mut writer = store.writer(WriteMode::Append)?;
            assert!(!writer.has_next()?);
            writer.close()?;
            assert!(writer.is_closed());
            assert!(matches!(writer.next(), Err(ShapefileError::Closed(_))));
            assert!(matches!(writer.write(), Err(ShapefileError::Closed(_))));
            // closing twice is harmless
            writer.close()?;
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_update_mode_cannot_add() {
    run_test(
        || create_test_context(),
        |ctx| {
            let store = ctx.store();
            insert_points(&store, &[(1.0, 1.0)])?;
            let mut writer = store.writer(WriteMode::Update)?;
            writer.next()?;
            assert!(matches!(writer.next(), Err(ShapefileError::NoSuchElement)));
            writer.close()?;
            assert_eq!(store.count(&Query::all())?, 1);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}

#[test]
fn test_identity_index_from_attribute_column() {
    run_test(
        || create_test_context(),
        |ctx| {
            insert_points(&ctx.store(), &random_points(5, 6, 100.0))?;
            let store = ctx.reopen(ShapefileConfig::builder().fid_column("name").build())?;
            store.files().delete(FileType::Fix)?;

            let reader = store.reader(&Query::ids(["p3", "p0", "missing"]))?;
            assert!(reader.is_indexed());
            assert_eq!(sorted_ids(reader)?, vec!["p0", "p3"]);
            Ok(())
        },
        |ctx| cleanup(ctx),
    )
}
